//! Resilience primitives guarding external calls: a three-state circuit
//! breaker and exponential retry backoff with jitter.

pub mod backoff;
pub mod breaker;
pub mod clock;

pub use backoff::RetryPolicy;
pub use breaker::{
    BreakerConfig, BreakerError, BreakerSnapshot, BreakerState, CircuitBreaker, Transition,
};
pub use clock::{Clock, SystemClock};
