#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # trackgate
//!
//! Request admission and account protection for location-tracking services.
//!
//! ## Features
//!
//! - **Per-endpoint-class rate limiting** with continuously refilling token buckets
//! - **Brute-force lockout** for authentication endpoints, expiring lazily on read
//! - **Short-lived credentials**: signed access tokens and single-use refresh tokens
//! - **Tower middleware** composing all of the above in a fixed order
//! - **Structured telemetry** through pluggable event sinks
//! - **Sharded state**: unrelated clients never contend on a shared lock
//!
//! ## Quick Start
//!
//! ```rust
//! use trackgate::{AdmissionConfig, AdmissionGate, ClientIdentity, EndpointClass};
//!
//! #[tokio::main]
//! async fn main() {
//!     let secret = b"replace-with-a-real-32-byte-key!";
//!     let gate = AdmissionGate::new(AdmissionConfig::default(), secret).expect("valid config");
//!     let client = ClientIdentity::from_addr("203.0.113.7".parse().unwrap());
//!
//!     let verdict = gate.check(&client, EndpointClass::Auth).await;
//!     assert!(verdict.allowed);
//!
//!     // After the handler rejected a password:
//!     let _ = gate.report_auth_outcome(&client, false).await;
//! }
//! ```

pub mod admission;
pub mod brute_force;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod prelude;
pub mod rate_limit;
pub mod sweeper;
pub mod telemetry;

// Re-exports
pub use admission::{
    AdmissionCheck, AdmissionGate, AdmissionLayer, AdmissionRequest, AdmissionService,
    AuthAttempt, AuthOutcome, GateError,
};
pub use brute_force::{BruteForceTracker, FailureOutcome, LockoutState, LockoutStatus};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use config::{
    AdmissionConfig, BruteForceConfig, ConfigError, CredentialConfig, RateLimitConfig,
    RateLimitTable,
};
pub use credentials::{
    AcceptAllResolver, Claims, CredentialError, CredentialIssuer, ResolveError, TokenKind,
    TokenPair, UserResolver,
};
pub use error::{AdmissionError, Rejection};
pub use identity::{ClientIdentity, EndpointClass, UserId};
pub use rate_limit::{Decision, RateLimitRegistry, TokenBucketState};
pub use sweeper::{spawn_sweeper, SweepReport, SweeperHandle};
pub use telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, TelemetrySink};
