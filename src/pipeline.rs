//! Redis-stream event pipeline: durable, at-least-once, ordered-per-entity
//! transport between receivers, the router, the reputation engine, and the
//! action pushers.

pub mod consumer;
pub mod redis;
pub mod streams;

pub use consumer::{StreamConsumer, StreamHandler};
pub use redis::{RedisStreams, StreamStats};
pub use streams::{DeadLetter, StreamEntry, dlq_stream};
