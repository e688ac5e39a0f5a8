//! Service-to-service authentication.
//!
//! Callers present either the static shared key in `X-Service-Key` (compared
//! in constant time) or a short-lived HS256 token carrying
//! `{service, iat, exp, scopes}`.

use crate::config::SecurityConfig;
use crate::error::AuthError;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq as _;

/// Claims carried by a service token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceClaims {
    pub service: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ServiceClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// Verifier/issuer for both auth mechanisms.
#[derive(Clone)]
pub struct ServiceAuth {
    encoding: EncodingKey,
    decoding: DecodingKey,
    api_key: String,
    token_ttl_secs: u64,
}

impl ServiceAuth {
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.secret_key.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret_key.as_bytes()),
            api_key: config.service_api_key.clone(),
            token_ttl_secs: config.token_ttl_secs,
        }
    }

    /// Issue a short-lived token naming the calling service.
    pub fn issue_token(
        &self,
        service: &str,
        scopes: &[&str],
    ) -> std::result::Result<String, AuthError> {
        let now = chrono::Utc::now().timestamp();
        let claims = ServiceClaims {
            service: service.to_string(),
            iat: now,
            exp: now + self.token_ttl_secs as i64,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }

    /// Verify an HS256 token; expiry is enforced by the validator.
    pub fn verify_token(&self, token: &str) -> std::result::Result<ServiceClaims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let validation = Validation::new(Algorithm::HS256);
        match jsonwebtoken::decode::<ServiceClaims>(token, &self.decoding, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(AuthError::TokenExpired),
                _ => Err(AuthError::InvalidToken(e.to_string())),
            },
        }
    }

    /// Verify the static shared key without leaking length or prefix timing.
    pub fn verify_service_key(&self, presented: &str) -> std::result::Result<(), AuthError> {
        if presented.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let expected = self.api_key.as_bytes();
        let presented = presented.as_bytes();
        // ct_eq requires equal lengths; fold the length check into the result
        // by comparing against self when lengths differ.
        let matches = if expected.len() == presented.len() {
            expected.ct_eq(presented).into()
        } else {
            let _: bool = expected.ct_eq(expected).into();
            false
        };
        if matches {
            Ok(())
        } else {
            Err(AuthError::InvalidServiceKey)
        }
    }

    /// Accept either mechanism: a bearer token or the shared key.
    pub fn verify_either(
        &self,
        service_key: Option<&str>,
        bearer: Option<&str>,
    ) -> std::result::Result<Option<ServiceClaims>, AuthError> {
        if let Some(key) = service_key {
            self.verify_service_key(key)?;
            return Ok(None);
        }
        if let Some(token) = bearer {
            return self.verify_token(token).map(Some);
        }
        Err(AuthError::MissingCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;

    fn auth() -> ServiceAuth {
        ServiceAuth::new(&SecurityConfig {
            secret_key: "test-secret".into(),
            service_api_key: "svc-key-123".into(),
            token_ttl_secs: 60,
        })
    }

    #[test]
    fn token_round_trip() {
        let auth = auth();
        let token = auth.issue_token("router", &["reputation:write"]).unwrap();
        let claims = auth.verify_token(&token).unwrap();
        assert_eq!(claims.service, "router");
        assert!(claims.has_scope("reputation:write"));
        assert!(!claims.has_scope("reputation:admin"));
    }

    #[test]
    fn expired_token_rejected() {
        let auth = auth();
        let now = chrono::Utc::now().timestamp();
        let claims = ServiceClaims {
            service: "router".into(),
            iat: now - 600,
            exp: now - 300,
            scopes: vec![],
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(matches!(
            auth.verify_token(&token),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn tampered_token_rejected() {
        let auth = auth();
        let token = auth.issue_token("router", &[]).unwrap();
        let tampered = format!("{}x", &token[..token.len() - 1]);
        assert!(matches!(
            auth.verify_token(&tampered),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn service_key_compare() {
        let auth = auth();
        assert!(auth.verify_service_key("svc-key-123").is_ok());
        assert!(auth.verify_service_key("svc-key-124").is_err());
        assert!(auth.verify_service_key("short").is_err());
        assert!(matches!(
            auth.verify_service_key(""),
            Err(AuthError::MissingCredentials)
        ));
    }

    #[test]
    fn either_mechanism() {
        let auth = auth();
        assert!(auth.verify_either(Some("svc-key-123"), None).is_ok());
        let token = auth.issue_token("pusher", &[]).unwrap();
        let claims = auth.verify_either(None, Some(&token)).unwrap();
        assert_eq!(claims.unwrap().service, "pusher");
        assert!(auth.verify_either(None, None).is_err());
    }
}
