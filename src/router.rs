//! Router core: command parsing, sessions, rate limiting, routing lookups,
//! dispatch, and response correlation.

pub mod commands;
pub mod correlation;
pub mod dispatch;
pub mod processor;
pub mod reserved;
pub mod routing;
pub mod sessions;

pub use commands::{CommandRecord, CommandStore, ParsedCommand, Transport, TriggerType};
pub use correlation::{CorrelationMap, ExecutionState, PendingExecution};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use processor::{EventProcessor, ProcessSummary};
pub use routing::{Gateway, RoutingTable};
pub use sessions::SessionManager;
