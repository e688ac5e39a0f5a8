//! Transport dispatch: deliver a command invocation to its module with a
//! deadline, retrying idempotent calls with jittered back-off.

use crate::auth::ServiceAuth;
use crate::error::{Result, RouterError};
use crate::router::commands::{CommandRecord, Transport};
use crate::telemetry::Metrics;
use crate::{EventEnvelope, ExecutionId, ModuleResponse, SessionId};

use rand::Rng as _;
use std::time::Duration;

/// Body POSTed to every module regardless of transport.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchPayload<'a> {
    pub envelope: &'a EventEnvelope,
    pub session_id: &'a SessionId,
    pub execution_id: ExecutionId,
    pub command: &'a str,
    pub args: &'a [String],
    pub community_id: i64,
}

/// What came back from the module.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// The module answered synchronously.
    Completed(ModuleResponse),
    /// The module accepted the work and will answer via `events:responses`.
    Accepted,
}

pub struct Dispatcher {
    http: reqwest::Client,
    auth: ServiceAuth,
    max_retries: u32,
}

impl Dispatcher {
    pub fn new(auth: ServiceAuth, max_retries: u32) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client with static config");
        Self {
            http,
            auth,
            max_retries,
        }
    }

    /// Deliver one invocation. The deadline is the command's `timeout_ms`;
    /// timeouts and transport failures retry only when the command is
    /// idempotent, with jittered back-off, up to `max_retries`.
    pub async fn dispatch(
        &self,
        command: &CommandRecord,
        payload: &DispatchPayload<'_>,
    ) -> Result<DispatchOutcome> {
        let deadline = Duration::from_millis(command.timeout_ms.max(1));
        let attempts = if command.is_idempotent() {
            self.max_retries + 1
        } else {
            1
        };

        let mut last_error: Option<RouterError> = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let base = 100u64 * (1u64 << attempt.min(6));
                let jitter = rand::rng().random_range(0..base);
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }

            let timer = Metrics::global()
                .dispatch_duration_seconds
                .with_label_values(&[command.transport.as_str()])
                .start_timer();
            Metrics::global().in_flight_dispatches.inc();
            let result = self.send_once(command, payload, deadline).await;
            Metrics::global().in_flight_dispatches.dec();
            timer.observe_duration();

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(error) => {
                    tracing::warn!(
                        command = %command.command,
                        target = %command.location_url,
                        attempt,
                        %error,
                        "dispatch attempt failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RouterError::DispatchFailed {
                target: command.location_url.clone(),
                reason: "no attempts made".into(),
            })
            .into())
    }

    async fn send_once(
        &self,
        command: &CommandRecord,
        payload: &DispatchPayload<'_>,
        deadline: Duration,
    ) -> std::result::Result<DispatchOutcome, RouterError> {
        let token = self
            .auth
            .issue_token("router", &["module:invoke"])
            .map_err(|e| RouterError::DispatchFailed {
                target: command.location_url.clone(),
                reason: format!("token issue: {e}"),
            })?;

        let request = match command.transport {
            Transport::Container | Transport::Rest | Transport::Grpc => self
                .http
                .request(
                    command.method.parse().unwrap_or(reqwest::Method::POST),
                    &command.location_url,
                )
                .bearer_auth(&token)
                .json(payload),
            // Provider invokes: the envelope is the invocation payload.
            Transport::Lambda => self
                .http
                .post(&command.location_url)
                .bearer_auth(&token)
                .header("X-Amz-Invocation-Type", "RequestResponse")
                .json(payload),
            Transport::GcpFunction => self
                .http
                .post(&command.location_url)
                .bearer_auth(&token)
                .json(payload),
            Transport::Openwhisk => self
                .http
                .post(&command.location_url)
                .bearer_auth(&token)
                .query(&[("blocking", "true"), ("result", "true")])
                .json(payload),
        };

        let response = tokio::time::timeout(deadline, request.send())
            .await
            .map_err(|_| RouterError::DispatchTimeout {
                target: command.location_url.clone(),
                timeout_ms: deadline.as_millis() as u64,
            })?
            .map_err(|e| RouterError::DispatchFailed {
                target: command.location_url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(DispatchOutcome::Accepted);
        }
        if !status.is_success() {
            return Err(RouterError::DispatchFailed {
                target: command.location_url.clone(),
                reason: format!("status {status}"),
            });
        }

        let body: serde_json::Value = tokio::time::timeout(deadline, response.json())
            .await
            .map_err(|_| RouterError::DispatchTimeout {
                target: command.location_url.clone(),
                timeout_ms: deadline.as_millis() as u64,
            })?
            .map_err(|e| RouterError::DispatchFailed {
                target: command.location_url.clone(),
                reason: format!("bad response body: {e}"),
            })?;

        Ok(DispatchOutcome::Completed(module_response_from(
            body,
            payload.session_id.clone(),
            payload.execution_id,
        )))
    }
}

/// Interpret a module's synchronous JSON reply. Modules answering in the
/// full callback shape pass through; bare `{success, action}` replies from
/// older modules are upgraded.
fn module_response_from(
    body: serde_json::Value,
    session_id: SessionId,
    execution_id: ExecutionId,
) -> ModuleResponse {
    if let Ok(mut response) = serde_json::from_value::<ModuleResponse>(body.clone()) {
        response.session_id = session_id;
        response.execution_id = execution_id;
        return response;
    }

    let success = body
        .get("success")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let response_action = body
        .get("response_action")
        .or_else(|| body.get("action").and_then(|a| a.get("type")))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(crate::ResponseAction::None);
    let response_data = body
        .get("response_data")
        .or_else(|| body.get("action"))
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    let error = body
        .get("error")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    ModuleResponse {
        session_id,
        execution_id,
        success,
        response_action,
        response_data,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_callback_shape_passes_through() {
        let execution_id = uuid::Uuid::new_v4();
        let body = serde_json::json!({
            "session_id": "ignored",
            "execution_id": uuid::Uuid::new_v4(),
            "success": true,
            "response_action": "chat",
            "response_data": {"message": "usage: !help"},
        });
        let response = module_response_from(body, "sess-1".into(), execution_id);
        assert!(response.success);
        assert_eq!(response.session_id, "sess-1");
        assert_eq!(response.execution_id, execution_id);
        assert_eq!(response.response_action, crate::ResponseAction::Chat);
    }

    #[test]
    fn bare_replies_are_upgraded() {
        let execution_id = uuid::Uuid::new_v4();
        let body = serde_json::json!({
            "success": true,
            "action": {"type": "chat", "content": "hello"},
        });
        let response = module_response_from(body, "sess-2".into(), execution_id);
        assert!(response.success);
        assert_eq!(response.response_action, crate::ResponseAction::Chat);
        assert_eq!(response.response_data["content"], "hello");
    }

    #[test]
    fn failure_replies_keep_their_error() {
        let body = serde_json::json!({"success": false, "error": "module exploded"});
        let response = module_response_from(body, "sess-3".into(), uuid::Uuid::new_v4());
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("module exploded"));
        assert_eq!(response.response_action, crate::ResponseAction::None);
    }
}
