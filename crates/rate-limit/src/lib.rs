//! Sliding-window rate limiting for auth-sensitive endpoints
//!
//! Each request is counted against a bucket keyed by endpoint class and
//! client IP. A bucket admits at most `limit` requests in any trailing
//! `window`; excess requests are rejected with the time until the oldest hit
//! leaves the window, and are not themselves counted.
//!
//! Storage (`CounterStore`) and time (`Clock`) are injected so the limiter can
//! move to a shared backend and be tested with a manual clock.

pub mod clock;
pub mod error;
pub mod limiter;
pub mod policy;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use limiter::{RateLimiter, client_ip};
pub use policy::{Decision, EndpointClass, Policy};
pub use store::{CounterStore, InMemoryCounterStore};
