//! Admission middleware: rate limiting, lockout enforcement, and credential operations
//! composed into one gate.
//!
//! [`AdmissionGate`] owns the registry, the lockout tracker, and the credential issuer and is
//! the single handle the HTTP layer talks to. Per request the order is fixed:
//!
//! 1. rate-limit check for `(client, class)`, rejecting with a retry hint when denied;
//! 2. for [`EndpointClass::Auth`], refuse locked-out clients before any credential is examined;
//! 3. run the handler;
//! 4. for concluded authentication attempts, report the outcome to the lockout tracker.
//!
//! [`AdmissionLayer`] wraps any `tower::Service` with exactly this sequence.
//!
//! ```rust
//! use std::convert::Infallible;
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//! use tower::{service_fn, Layer, ServiceExt};
//! use trackgate::admission::{
//!     AdmissionGate, AdmissionLayer, AdmissionRequest, AuthAttempt, AuthOutcome,
//! };
//! use trackgate::config::AdmissionConfig;
//! use trackgate::{ClientIdentity, EndpointClass};
//!
//! struct Req(IpAddr);
//! impl AdmissionRequest for Req {
//!     fn client_identity(&self) -> Option<ClientIdentity> {
//!         Some(ClientIdentity::from_addr(self.0))
//!     }
//!     fn endpoint_class(&self) -> EndpointClass {
//!         EndpointClass::Tracking
//!     }
//! }
//!
//! struct Resp;
//! impl AuthAttempt for Resp {
//!     fn auth_outcome(&self) -> Option<AuthOutcome> {
//!         None
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let secret = b"0123456789abcdef0123456789abcdef";
//! let gate = Arc::new(AdmissionGate::new(AdmissionConfig::default(), secret).unwrap());
//! let svc = AdmissionLayer::new(gate)
//!     .layer(service_fn(|_req: Req| async { Ok::<_, Infallible>(Resp) }));
//! let ok = svc.oneshot(Req(IpAddr::V4(Ipv4Addr::LOCALHOST))).await;
//! assert!(ok.is_ok());
//! # }
//! ```

use crate::brute_force::{BruteForceTracker, FailureOutcome};
use crate::clock::Clock;
use crate::config::{AdmissionConfig, ConfigError};
use crate::credentials::{CredentialError, CredentialIssuer, TokenPair, UserResolver};
use crate::error::AdmissionError;
use crate::identity::{ClientIdentity, EndpointClass, UserId};
use crate::rate_limit::{Decision, RateLimitRegistry};
use crate::sweeper::SweepReport;
use crate::telemetry::{
    emit_best_effort, AdmissionEvent, AuthFailureReason, NullSink, TelemetrySink,
    TokenFailureReason,
};
use futures::future::BoxFuture;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;
use tracing::{debug, error, warn};

/// Error type of gate operations that never wrap a downstream service.
pub type GateError = AdmissionError<Infallible>;

/// Outcome of a per-class admission check, shaped for the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionCheck {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Advisory `Retry-After` for rejected requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Request admission and account protection for one process.
pub struct AdmissionGate<S = NullSink> {
    registry: RateLimitRegistry,
    tracker: BruteForceTracker,
    issuer: CredentialIssuer,
    sink: S,
    fail_open: bool,
    idle_ttl: Duration,
    sweep_interval: Duration,
}

impl AdmissionGate<NullSink> {
    /// Build a gate from validated configuration and the token signing secret.
    pub fn new(config: AdmissionConfig, secret: &[u8]) -> Result<Self, ConfigError> {
        config.validate()?;
        let AdmissionConfig {
            rate_limits,
            brute_force,
            credentials,
            idle_ttl,
            sweep_interval,
            fail_open,
        } = config;

        Ok(Self {
            registry: RateLimitRegistry::new(rate_limits),
            tracker: BruteForceTracker::new(brute_force),
            issuer: CredentialIssuer::new(credentials, secret),
            sink: NullSink,
            fail_open,
            idle_ttl,
            sweep_interval,
        })
    }
}

impl<S> AdmissionGate<S> {
    /// Route admission events to `sink`.
    pub fn with_sink<T>(self, sink: T) -> AdmissionGate<T> {
        AdmissionGate {
            registry: self.registry,
            tracker: self.tracker,
            issuer: self.issuer,
            sink,
            fail_open: self.fail_open,
            idle_ttl: self.idle_ttl,
            sweep_interval: self.sweep_interval,
        }
    }

    /// Drive every component from one clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        self.registry = self.registry.with_shared_clock(clock.clone());
        self.tracker = self.tracker.with_shared_clock(clock.clone());
        self.issuer = self.issuer.with_shared_clock(clock);
        self
    }

    /// Replace the collaborator that maps token subjects to users.
    pub fn with_resolver<R: UserResolver + 'static>(mut self, resolver: R) -> Self {
        self.issuer = self.issuer.with_resolver(resolver);
        self
    }

    /// Per-client token buckets.
    pub fn registry(&self) -> &RateLimitRegistry {
        &self.registry
    }

    /// Failed-login counters and lockouts.
    pub fn tracker(&self) -> &BruteForceTracker {
        &self.tracker
    }

    /// Token issuance and validation.
    pub fn issuer(&self) -> &CredentialIssuer {
        &self.issuer
    }

    /// Where admission events are sent.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Whether requests are admitted when admission itself cannot be decided.
    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    /// Period of the background sweeper.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    /// Evict idle buckets and lockout records and prune spent refresh ids.
    pub fn sweep(&self) -> SweepReport {
        SweepReport {
            buckets: self.registry.evict_idle(self.idle_ttl),
            lockouts: self.tracker.evict_idle(self.idle_ttl),
            spent_refresh_ids: self.issuer.prune_ledger(),
        }
    }

    /// Decide a request whose client could not be identified.
    pub(crate) fn admit_unidentified(&self, class: EndpointClass) -> Result<(), GateError> {
        if self.fail_open {
            error!(
                target: "trackgate::admission",
                class = %class,
                "client identity unavailable; admitting without limits (fail-open)"
            );
            Ok(())
        } else {
            error!(
                target: "trackgate::admission",
                class = %class,
                "client identity unavailable; rejecting (fail-closed)"
            );
            Err(AdmissionError::Internal { detail: "client identity unavailable".into() })
        }
    }
}

impl<S> AdmissionGate<S>
where
    S: TelemetrySink + Sync,
    S::Future: Send + 'static,
{
    async fn emit(&self, event: AdmissionEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }

    /// Rate-limit check and, for authentication endpoints, lockout check.
    pub async fn admit(
        &self,
        client: &ClientIdentity,
        class: EndpointClass,
    ) -> Result<Decision, GateError> {
        let decision = self.registry.check(client, class);
        if let Decision::Denied { retry_after, limit } = decision {
            self.emit(AdmissionEvent::RateLimitExceeded { client: client.clone(), class, limit })
                .await;
            return Err(AdmissionError::RateLimitExceeded { class, retry_after, limit });
        }

        if class.is_auth() {
            if let Some(retry_after) = self.tracker.locked_for(client) {
                warn!(
                    target: "trackgate::admission",
                    client = %client,
                    "authentication attempt refused: client is locked out"
                );
                self.emit(AdmissionEvent::AuthenticationFailure {
                    client: client.clone(),
                    reason: AuthFailureReason::AccountLocked,
                })
                .await;
                return Err(AdmissionError::AccountLocked { retry_after });
            }
        }

        Ok(decision)
    }

    /// [`AdmissionGate::admit`] flattened to `{allowed, retry_after_secs}`.
    pub async fn check(&self, client: &ClientIdentity, class: EndpointClass) -> AdmissionCheck {
        match self.admit(client, class).await {
            Ok(_) => AdmissionCheck { allowed: true, retry_after_secs: None },
            Err(err) => AdmissionCheck {
                allowed: false,
                retry_after_secs: err.rejection().and_then(|r| r.retry_after_secs),
            },
        }
    }

    /// Hook called after each concluded authentication attempt.
    ///
    /// A success clears the client's failure history. A failure is counted towards lockout
    /// and returned as [`AdmissionError::InvalidCredentials`] for the caller to render.
    pub async fn report_auth_outcome(
        &self,
        client: &ClientIdentity,
        success: bool,
    ) -> Result<(), GateError> {
        if success {
            self.tracker.record_success(client);
            return Ok(());
        }

        match self.tracker.record_failure(client) {
            FailureOutcome::Counted { failed_attempts, threshold } => {
                self.emit(AdmissionEvent::BruteForceAttempt {
                    client: client.clone(),
                    attempt_count: failed_attempts,
                    threshold,
                })
                .await;
            }
            FailureOutcome::Locked { failed_attempts, until_millis } => {
                self.emit(AdmissionEvent::BruteForceAttempt {
                    client: client.clone(),
                    attempt_count: failed_attempts,
                    threshold: self.tracker.config().failure_threshold(),
                })
                .await;
                self.emit(AdmissionEvent::BruteForceLocked {
                    client: client.clone(),
                    locked_until_millis: until_millis,
                })
                .await;
            }
            FailureOutcome::AlreadyLocked { .. } => {}
        }

        self.emit(AdmissionEvent::AuthenticationFailure {
            client: client.clone(),
            reason: AuthFailureReason::InvalidCredentials,
        })
        .await;
        Err(AdmissionError::InvalidCredentials)
    }

    /// Issue a fresh access/refresh pair after a successful login.
    pub async fn issue_tokens(&self, user: &UserId) -> Result<TokenPair, GateError> {
        self.issuer.issue(user).map_err(AdmissionError::from)
    }

    /// Validate a bearer access token.
    pub async fn validate_token(&self, token: &str) -> Result<UserId, GateError> {
        match self.issuer.validate(token) {
            Ok(user) => Ok(user),
            Err(err) => Err(self.token_failure(err).await),
        }
    }

    /// Exchange a refresh token for a new pair.
    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<TokenPair, GateError> {
        match self.issuer.refresh(refresh_token) {
            Ok(pair) => Ok(pair),
            Err(err) => Err(self.token_failure(err).await),
        }
    }

    /// Validate the value of an `Authorization` header (`Bearer <token>`).
    pub async fn authenticate_bearer(&self, header: &str) -> Result<UserId, GateError> {
        match bearer_token(header) {
            Some(token) => self.validate_token(token).await,
            None => {
                warn!(target: "trackgate::admission", "malformed authorization header");
                self.emit(AdmissionEvent::TokenValidationFailure {
                    reason: TokenFailureReason::MalformedHeader,
                })
                .await;
                Err(AdmissionError::TokenInvalid)
            }
        }
    }

    async fn token_failure(&self, err: CredentialError) -> GateError {
        match TokenFailureReason::from_credential_error(&err) {
            Some(TokenFailureReason::Expired) => {
                debug!(target: "trackgate::admission", "expired token presented");
                self.emit(AdmissionEvent::TokenValidationFailure {
                    reason: TokenFailureReason::Expired,
                })
                .await;
            }
            Some(reason) => {
                warn!(target: "trackgate::admission", reason = %reason, "token rejected");
                self.emit(AdmissionEvent::TokenValidationFailure { reason }).await;
            }
            None => {
                error!(target: "trackgate::admission", error = %err, "credential operation failed");
            }
        }
        AdmissionError::from(err)
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for AdmissionGate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("registry", &self.registry)
            .field("tracker", &self.tracker)
            .field("issuer", &self.issuer)
            .field("sink", &self.sink)
            .field("fail_open", &self.fail_open)
            .finish_non_exhaustive()
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Requests the admission layer can classify.
pub trait AdmissionRequest {
    /// Who is asking. `None` when the transport could not supply an address.
    fn client_identity(&self) -> Option<ClientIdentity>;
    /// Which limiter applies.
    fn endpoint_class(&self) -> EndpointClass;
}

/// Result of an authentication attempt as seen by the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials were accepted.
    Success,
    /// Credentials were rejected.
    Failure,
}

/// Responses that may carry the outcome of an authentication attempt.
pub trait AuthAttempt {
    /// `None` when the request was not a concluded login (e.g. a validation error).
    fn auth_outcome(&self) -> Option<AuthOutcome>;
}

/// A layer that runs every request through an [`AdmissionGate`].
#[derive(Debug)]
pub struct AdmissionLayer<S = NullSink> {
    gate: Arc<AdmissionGate<S>>,
}

impl<S> AdmissionLayer<S> {
    /// Create a new admission layer sharing `gate`.
    pub fn new(gate: Arc<AdmissionGate<S>>) -> Self {
        Self { gate }
    }
}

impl<S> Clone for AdmissionLayer<S> {
    fn clone(&self) -> Self {
        Self { gate: self.gate.clone() }
    }
}

impl<Inner, S> Layer<Inner> for AdmissionLayer<S> {
    type Service = AdmissionService<Inner, S>;

    fn layer(&self, service: Inner) -> Self::Service {
        AdmissionService { inner: service, gate: self.gate.clone() }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Debug)]
pub struct AdmissionService<Inner, S = NullSink> {
    inner: Inner,
    gate: Arc<AdmissionGate<S>>,
}

impl<Inner: Clone, S> Clone for AdmissionService<Inner, S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), gate: self.gate.clone() }
    }
}

impl<Inner, S, Req> Service<Req> for AdmissionService<Inner, S>
where
    Inner: Service<Req> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Response: AuthAttempt + Send + 'static,
    Inner::Error: Send + 'static,
    S: TelemetrySink + Sync,
    S::Future: Send + 'static,
    Req: AdmissionRequest + Send + 'static,
{
    type Response = Inner::Response;
    type Error = AdmissionError<Inner::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Keep the instance that was driven to readiness.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let gate = self.gate.clone();

        Box::pin(async move {
            let class = req.endpoint_class();
            let Some(client) = req.client_identity() else {
                gate.admit_unidentified(class).map_err(widen)?;
                return inner.call(req).await.map_err(AdmissionError::Inner);
            };

            gate.admit(&client, class).await.map_err(widen)?;

            let response = inner.call(req).await.map_err(AdmissionError::Inner)?;

            if class.is_auth() {
                if let Some(outcome) = response.auth_outcome() {
                    // A failure is already visible in the handler's response; the report only
                    // feeds the lockout tracker.
                    let success = outcome == AuthOutcome::Success;
                    let _ = gate.report_auth_outcome(&client, success).await;
                }
            }
            Ok(response)
        })
    }
}

fn widen<E>(err: GateError) -> AdmissionError<E> {
    err.map_inner(|never| match never {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BruteForceConfig, RateLimitConfig};
    use crate::telemetry::MemorySink;

    const SECRET: &[u8] = b"admission-tests-secret-0123456789";

    fn gate(clock: &ManualClock) -> AdmissionGate<MemorySink> {
        let config = AdmissionConfig::default()
            .with_rate_limit(EndpointClass::Auth, RateLimitConfig::new(60, 20))
            .with_brute_force(BruteForceConfig::new(3, Duration::from_secs(600)).unwrap());
        AdmissionGate::new(config, SECRET)
            .unwrap()
            .with_clock(clock.clone())
            .with_sink(MemorySink::new())
    }

    fn client() -> ClientIdentity {
        ClientIdentity::from_addr("198.51.100.4".parse().unwrap())
    }

    #[test]
    fn bearer_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer   abc  "), Some("abc"));
        assert_eq!(bearer_token("BEARER abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("abc"), None);
    }

    #[tokio::test]
    async fn lockout_rejects_before_handler_and_emits_events() {
        let clock = ManualClock::new();
        let gate = gate(&clock);
        let c = client();

        for _ in 0..3 {
            assert!(gate.admit(&c, EndpointClass::Auth).await.is_ok());
            assert_eq!(
                gate.report_auth_outcome(&c, false).await,
                Err(AdmissionError::InvalidCredentials)
            );
        }

        let err = gate.admit(&c, EndpointClass::Auth).await.unwrap_err();
        assert_eq!(err, AdmissionError::AccountLocked { retry_after: Duration::from_secs(600) });
        // Other classes are unaffected by a lockout.
        assert!(gate.admit(&c, EndpointClass::Tracking).await.is_ok());

        let locked = gate
            .sink()
            .events()
            .into_iter()
            .filter(|e| matches!(e, AdmissionEvent::BruteForceLocked { .. }))
            .count();
        assert_eq!(locked, 1);
    }

    #[tokio::test]
    async fn check_reports_retry_hint() {
        let clock = ManualClock::new();
        let gate = gate(&clock);
        let c = client();
        for _ in 0..120 {
            gate.check(&c, EndpointClass::Tracking).await;
        }
        let verdict = gate.check(&c, EndpointClass::Tracking).await;
        assert_eq!(verdict, AdmissionCheck { allowed: false, retry_after_secs: Some(1) });
        assert!(matches!(
            gate.sink().events().last(),
            Some(AdmissionEvent::RateLimitExceeded { limit: 600, .. })
        ));
    }

    #[tokio::test]
    async fn token_failures_are_reported() {
        let clock = ManualClock::new();
        let gate = gate(&clock);
        assert_eq!(gate.validate_token("garbage").await, Err(AdmissionError::TokenInvalid));
        assert_eq!(gate.authenticate_bearer("Token x").await, Err(AdmissionError::TokenInvalid));

        let pair = gate.issue_tokens(&UserId::new("u-3")).await.unwrap();
        let header = format!("Bearer {}", pair.access_token);
        assert_eq!(gate.authenticate_bearer(&header).await, Ok(UserId::new("u-3")));

        clock.advance(Duration::from_secs(24 * 60 * 60));
        assert_eq!(gate.authenticate_bearer(&header).await, Err(AdmissionError::TokenExpired));

        let reasons: Vec<_> = gate
            .sink()
            .events()
            .into_iter()
            .filter_map(|e| match e {
                AdmissionEvent::TokenValidationFailure { reason } => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(
            reasons,
            vec![
                TokenFailureReason::Malformed,
                TokenFailureReason::MalformedHeader,
                TokenFailureReason::Expired
            ]
        );
    }

    #[tokio::test]
    async fn unidentified_requests_follow_fail_policy() {
        let closed = AdmissionGate::new(AdmissionConfig::default(), SECRET).unwrap();
        assert!(matches!(
            closed.admit_unidentified(EndpointClass::Public),
            Err(AdmissionError::Internal { .. })
        ));

        let config = AdmissionConfig { fail_open: true, ..AdmissionConfig::default() };
        let open = AdmissionGate::new(config, SECRET).unwrap();
        assert!(open.admit_unidentified(EndpointClass::Public).is_ok());
    }
}
