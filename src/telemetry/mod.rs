//! Telemetry and observability for the admission layer.
//!
//! Every rejection and every lockout transition is described by an [`AdmissionEvent`].
//! Events flow through `TelemetrySink` implementations which can log, aggregate, or forward
//! them to external systems.
//!
//! # Event Types
//!
//! - **Rate limiting**: `RateLimitExceeded`
//! - **Brute-force protection**: `BruteForceAttempt`, `BruteForceLocked`
//! - **Authentication**: `AuthenticationFailure`, `TokenValidationFailure`
//!
//! # Telemetry Sinks
//!
//! The `TelemetrySink` trait defines how events are consumed. It's implemented
//! as a `tower::Service<AdmissionEvent>` for composability.

pub mod events;
pub mod sinks;

#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use events::{AdmissionEvent, AuthFailureReason, TokenFailureReason};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
