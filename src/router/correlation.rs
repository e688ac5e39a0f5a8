//! Execution state machine and response correlation.
//!
//! ```text
//! received -> rate-checked -> authorized -> dispatched -> awaiting_response
//!     |            |              |             |               |
//!     v            v              v             v               v
//! rejected    rate_limited   unauthorized    timed_out      completed / failed
//! ```
//!
//! Responses correlate on `(session_id, execution_id)` regardless of arrival
//! order; each terminal state emits one audit record and one metric.

use crate::telemetry::Metrics;
use crate::{EntityId, ExecutionId, ModuleResponse, Platform, SessionId, audit};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Received,
    RateChecked,
    Authorized,
    Dispatched,
    AwaitingResponse,
    // Terminal states.
    Rejected,
    RateLimited,
    Unauthorized,
    TimedOut,
    Completed,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Rejected
                | ExecutionState::RateLimited
                | ExecutionState::Unauthorized
                | ExecutionState::TimedOut
                | ExecutionState::Completed
                | ExecutionState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Received => "received",
            ExecutionState::RateChecked => "rate_checked",
            ExecutionState::Authorized => "authorized",
            ExecutionState::Dispatched => "dispatched",
            ExecutionState::AwaitingResponse => "awaiting_response",
            ExecutionState::Rejected => "rejected",
            ExecutionState::RateLimited => "rate_limited",
            ExecutionState::Unauthorized => "unauthorized",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
        }
    }
}

/// One in-flight command execution.
#[derive(Debug, Clone)]
pub struct PendingExecution {
    pub session_id: SessionId,
    pub execution_id: ExecutionId,
    pub command: String,
    pub entity_id: EntityId,
    pub platform: Platform,
    pub user_id: String,
    pub community_id: i64,
    pub state: ExecutionState,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Map of executions awaiting an asynchronous module response.
#[derive(Default)]
pub struct CorrelationMap {
    inner: DashMap<(SessionId, ExecutionId), PendingExecution>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an execution that will complete via `events:responses`.
    pub fn track(&self, execution: PendingExecution) {
        self.inner.insert(
            (execution.session_id.clone(), execution.execution_id),
            execution,
        );
    }

    /// Resolve a module response to its execution, removing it from the map.
    pub fn resolve(&self, response: &ModuleResponse) -> Option<PendingExecution> {
        self.inner
            .remove(&(response.session_id.clone(), response.execution_id))
            .map(|(_, execution)| execution)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.len()
    }

    /// Remove executions older than `max_age` and report them timed out.
    pub fn expire_stale(&self, max_age: chrono::Duration) -> Vec<PendingExecution> {
        let cutoff = chrono::Utc::now() - max_age;
        let stale: Vec<(SessionId, ExecutionId)> = self
            .inner
            .iter()
            .filter(|entry| entry.value().started_at < cutoff)
            .map(|entry| entry.key().clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|key| self.inner.remove(&key))
            .map(|(_, mut execution)| {
                execution.state = ExecutionState::TimedOut;
                finish(&execution, ExecutionState::TimedOut);
                execution
            })
            .collect()
    }
}

/// Record a terminal transition: one audit record, one metric.
pub fn finish(execution: &PendingExecution, state: ExecutionState) {
    debug_assert!(state.is_terminal());
    Metrics::global()
        .router_executions_total
        .with_label_values(&[state.as_str()])
        .inc();

    let result = match state {
        ExecutionState::Completed => audit::AuditResult::Success,
        ExecutionState::TimedOut => audit::AuditResult::Timeout,
        ExecutionState::Unauthorized | ExecutionState::RateLimited => audit::AuditResult::Denied,
        _ => audit::AuditResult::Failure,
    };
    audit::AuditRecord::new(audit::AuditType::Audit, format!("command_{}", state.as_str()))
        .actor(&execution.user_id)
        .subject(&execution.command)
        .result(result)
        .correlation(format!(
            "{}:{}",
            execution.session_id, execution.execution_id
        ))
        .emit();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution(session: &str) -> PendingExecution {
        PendingExecution {
            session_id: session.to_string(),
            execution_id: uuid::Uuid::new_v4(),
            command: "help".into(),
            entity_id: EntityId::new(Platform::Twitch, "foo", "1"),
            platform: Platform::Twitch,
            user_id: "u1".into(),
            community_id: 1,
            state: ExecutionState::AwaitingResponse,
            started_at: chrono::Utc::now(),
        }
    }

    fn response(execution: &PendingExecution) -> ModuleResponse {
        ModuleResponse {
            session_id: execution.session_id.clone(),
            execution_id: execution.execution_id,
            success: true,
            response_action: crate::ResponseAction::Chat,
            response_data: serde_json::json!({"message": "usage: !help"}),
            error: None,
        }
    }

    #[test]
    fn responses_resolve_out_of_order() {
        let map = CorrelationMap::new();
        let first = execution("sess-a");
        let second = execution("sess-b");
        map.track(first.clone());
        map.track(second.clone());
        assert_eq!(map.in_flight(), 2);

        let resolved = map.resolve(&response(&second)).unwrap();
        assert_eq!(resolved.execution_id, second.execution_id);
        let resolved = map.resolve(&response(&first)).unwrap();
        assert_eq!(resolved.execution_id, first.execution_id);
        assert_eq!(map.in_flight(), 0);
    }

    #[test]
    fn unknown_response_does_not_resolve() {
        let map = CorrelationMap::new();
        let tracked = execution("sess-a");
        map.track(tracked.clone());

        let mut unknown = response(&tracked);
        unknown.execution_id = uuid::Uuid::new_v4();
        assert!(map.resolve(&unknown).is_none());
        assert_eq!(map.in_flight(), 1);
    }

    #[test]
    fn stale_executions_expire_as_timeouts() {
        let map = CorrelationMap::new();
        let mut old = execution("sess-old");
        old.started_at = chrono::Utc::now() - chrono::Duration::minutes(10);
        map.track(old);
        map.track(execution("sess-new"));

        let expired = map.expire_stale(chrono::Duration::minutes(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].state, ExecutionState::TimedOut);
        assert_eq!(map.in_flight(), 1);
    }

    #[test]
    fn terminal_states() {
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::RateLimited.is_terminal());
        assert!(!ExecutionState::Dispatched.is_terminal());
        assert!(!ExecutionState::AwaitingResponse.is_terminal());
    }
}
