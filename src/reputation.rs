//! Reputation engine: FICO-style per-community scores with strict bounds,
//! tier derivation, and policy enforcement.

pub mod engine;
pub mod service;
pub mod store;
pub mod tiers;
pub mod weights;

pub use engine::{ModerationAction, ModerationRequest, ModerationSink, RecordOutcome, ReputationEngine};
pub use tiers::Tier;
pub use weights::WeightResolver;
