use crate::credentials::CredentialError;
use crate::identity::{ClientIdentity, EndpointClass};
use std::fmt;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Events emitted by the admission layer.
///
/// Every security-relevant decision produces one of these. They can be logged, counted, or
/// forwarded to an external collector; emission never affects the decision itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// A request was throttled.
    RateLimitExceeded {
        /// Throttled client
        client: ClientIdentity,
        /// Endpoint class of the request
        class: EndpointClass,
        /// Configured requests per minute for the class
        limit: u32,
    },
    /// A failed login was counted towards the lockout threshold.
    BruteForceAttempt {
        /// Client that failed to authenticate
        client: ClientIdentity,
        /// Consecutive failures including this one
        attempt_count: u32,
        /// Failures that trigger a lockout
        threshold: u32,
    },
    /// A client crossed the threshold and is now locked out.
    BruteForceLocked {
        /// Locked client
        client: ClientIdentity,
        /// Clock reading at which the lockout ends
        locked_until_millis: u64,
    },
    /// An authentication attempt was refused.
    AuthenticationFailure {
        /// Client whose attempt was refused
        client: ClientIdentity,
        /// Why it was refused
        reason: AuthFailureReason,
    },
    /// A bearer token did not validate.
    TokenValidationFailure {
        /// Why validation failed
        reason: TokenFailureReason,
    },
}

/// Why an authentication attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureReason {
    /// Business logic rejected the supplied credentials.
    InvalidCredentials,
    /// The client is locked out; the attempt never reached the business logic.
    AccountLocked,
}

impl AuthFailureReason {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthFailureReason::InvalidCredentials => "invalid_credentials",
            AuthFailureReason::AccountLocked => "account_locked",
        }
    }
}

/// Why a bearer token was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFailureReason {
    /// Past its expiry.
    Expired,
    /// Not decodable, or missing required claims.
    Malformed,
    /// Signature did not verify.
    InvalidSignature,
    /// Refresh token presented a second time.
    Reused,
    /// Access token used as refresh token or vice versa.
    WrongKind,
    /// Subject no longer resolves to a user.
    UnknownSubject,
    /// `Authorization` header missing or not a bearer credential.
    MalformedHeader,
}

impl TokenFailureReason {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            TokenFailureReason::Expired => "expired",
            TokenFailureReason::Malformed => "malformed",
            TokenFailureReason::InvalidSignature => "invalid_signature",
            TokenFailureReason::Reused => "reused",
            TokenFailureReason::WrongKind => "wrong_kind",
            TokenFailureReason::UnknownSubject => "unknown_subject",
            TokenFailureReason::MalformedHeader => "malformed_header",
        }
    }

    /// Classify a credential error. `None` for failures that are not the token's fault.
    pub fn from_credential_error(err: &CredentialError) -> Option<Self> {
        match err {
            CredentialError::Expired => Some(Self::Expired),
            CredentialError::Malformed => Some(Self::Malformed),
            CredentialError::InvalidSignature => Some(Self::InvalidSignature),
            CredentialError::RefreshReused => Some(Self::Reused),
            CredentialError::WrongKind { .. } => Some(Self::WrongKind),
            CredentialError::UnknownSubject => Some(Self::UnknownSubject),
            CredentialError::Signing(_) => None,
        }
    }
}

impl fmt::Display for AuthFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for TokenFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::RateLimitExceeded { client, class, limit } => {
                write!(f, "RateLimitExceeded({}, {}, limit={}/min)", client, class, limit)
            }
            AdmissionEvent::BruteForceAttempt { client, attempt_count, threshold } => {
                write!(f, "BruteForceAttempt({}, {}/{})", client, attempt_count, threshold)
            }
            AdmissionEvent::BruteForceLocked { client, locked_until_millis } => {
                write!(f, "BruteForceLocked({}, until={}ms)", client, locked_until_millis)
            }
            AdmissionEvent::AuthenticationFailure { client, reason } => {
                write!(f, "AuthenticationFailure({}, {})", client, reason)
            }
            AdmissionEvent::TokenValidationFailure { reason } => {
                write!(f, "TokenValidationFailure({})", reason)
            }
        }
    }
}

/// Convert an AdmissionEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &AdmissionEvent) -> serde_json::Value {
    match event {
        AdmissionEvent::RateLimitExceeded { client, class, limit } => json!({
            "kind": "rate_limit_exceeded",
            "client": client.to_string(),
            "class": class.as_str(),
            "limit": *limit,
        }),
        AdmissionEvent::BruteForceAttempt { client, attempt_count, threshold } => json!({
            "kind": "brute_force_attempt",
            "client": client.to_string(),
            "attempt_count": *attempt_count,
            "threshold": *threshold,
        }),
        AdmissionEvent::BruteForceLocked { client, locked_until_millis } => json!({
            "kind": "brute_force_locked",
            "client": client.to_string(),
            "locked_until_ms": *locked_until_millis,
        }),
        AdmissionEvent::AuthenticationFailure { client, reason } => json!({
            "kind": "authentication_failure",
            "client": client.to_string(),
            "reason": reason.as_str(),
        }),
        AdmissionEvent::TokenValidationFailure { reason } => json!({
            "kind": "token_validation_failure",
            "reason": reason.as_str(),
        }),
    }
}
