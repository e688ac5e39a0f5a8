//! AAA audit logging.
//!
//! Every externally-caused action emits exactly one structured record on the
//! `audit` tracing target so operators can filter authentication,
//! authorization, and activity trails out of the normal log flow.

use serde::{Deserialize, Serialize};

/// Audit record category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditType {
    Auth,
    Authz,
    Audit,
    System,
    Error,
}

impl AuditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditType::Auth => "AUTH",
            AuditType::Authz => "AUTHZ",
            AuditType::Audit => "AUDIT",
            AuditType::System => "SYSTEM",
            AuditType::Error => "ERROR",
        }
    }
}

/// Outcome of the audited action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditResult {
    Success,
    Failure,
    Denied,
    Timeout,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditResult::Success => "SUCCESS",
            AuditResult::Failure => "FAILURE",
            AuditResult::Denied => "DENIED",
            AuditResult::Timeout => "TIMEOUT",
        }
    }
}

/// One audit record. Build with [`AuditRecord::new`], finish with
/// [`AuditRecord::emit`].
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub event_type: AuditType,
    pub actor: String,
    pub subject: String,
    pub action: String,
    pub result: AuditResult,
    pub correlation_id: String,
}

impl AuditRecord {
    pub fn new(event_type: AuditType, action: impl Into<String>) -> Self {
        Self {
            event_type,
            actor: String::new(),
            subject: String::new(),
            action: action.into(),
            result: AuditResult::Success,
            correlation_id: String::new(),
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = result;
        self
    }

    pub fn correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Write the record to the `audit` target.
    pub fn emit(self) {
        tracing::info!(
            target: "audit",
            event_type = self.event_type.as_str(),
            actor = %self.actor,
            subject = %self.subject,
            action = %self.action,
            result = self.result.as_str(),
            correlation_id = %self.correlation_id,
        );
    }
}

/// AUTH FAILURE shorthand used by webhook verification and service auth.
pub fn auth_failure(actor: &str, action: &str, correlation_id: &str) {
    AuditRecord::new(AuditType::Auth, action)
        .actor(actor)
        .result(AuditResult::Failure)
        .correlation(correlation_id)
        .emit();
}

/// SYSTEM shorthand for lifecycle transitions (startup, shutdown, workers).
pub fn system(action: &str) {
    AuditRecord::new(AuditType::System, action).emit();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_uppercase() {
        assert_eq!(AuditType::Authz.as_str(), "AUTHZ");
        assert_eq!(AuditResult::Denied.as_str(), "DENIED");
        let json = serde_json::to_string(&AuditType::System).unwrap();
        assert_eq!(json, "\"SYSTEM\"");
    }
}
