//! Navigation: manifest aggregation and the per-service circuit breaker

pub mod aggregator;
pub mod breaker;

pub use aggregator::{nav_status, NavAggregator, BREAKER_OPEN_ERROR, INVALID_MANIFEST_ERROR};
pub use breaker::CircuitBreaker;
