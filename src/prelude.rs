//! Convenient re-exports for wiring the admission layer into a service.
pub use crate::{
    admission::{AdmissionGate, AdmissionLayer, AdmissionRequest, AuthAttempt, AuthOutcome},
    clock::{Clock, ManualClock},
    config::{AdmissionConfig, BruteForceConfig, CredentialConfig, RateLimitConfig},
    credentials::{CredentialIssuer, TokenPair, UserResolver},
    error::{AdmissionError, Rejection},
    identity::{ClientIdentity, EndpointClass, UserId},
    sweeper::spawn_sweeper,
    telemetry::{LogSink, MemorySink, NullSink, TelemetrySink},
};
