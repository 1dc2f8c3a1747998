//! Cross-cutting pipeline stages

pub mod circuit_breaker;
pub mod idempotency;
pub mod logging;
pub mod retry;
pub mod signing;
pub mod validation;
