//! Error types for the admission layer
use crate::credentials::CredentialError;
use crate::identity::EndpointClass;
use crate::rate_limit::ceil_secs;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

const SECS_PER_MINUTE: u64 = 60;

/// Unified error type for admission decisions, generic over the wrapped service's error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError<E> {
    /// The client's bucket for this endpoint class is empty.
    RateLimitExceeded {
        /// Class whose bucket ran dry.
        class: EndpointClass,
        /// Time until the bucket holds a whole token again.
        retry_after: Duration,
        /// Configured requests per minute for the class.
        limit: u32,
    },
    /// The client is locked out of authentication.
    AccountLocked { retry_after: Duration },
    /// Login rejected by the business logic; counts towards lockout.
    InvalidCredentials,
    /// The bearer token has expired; the client should refresh or log in again.
    TokenExpired,
    /// The bearer token is malformed, forged, reused, or of the wrong kind.
    TokenInvalid,
    /// Admission could not be decided. Detail is for logs only.
    Internal { detail: String },
    /// The underlying service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimitExceeded { class, retry_after, limit } => write!(
                f,
                "rate limit exceeded for {} ({} per minute, retry after {:?})",
                class, limit, retry_after
            ),
            Self::AccountLocked { retry_after } => {
                write!(f, "account locked (retry after {:?})", retry_after)
            }
            Self::InvalidCredentials => write!(f, "invalid credentials"),
            Self::TokenExpired => write!(f, "token expired"),
            Self::TokenInvalid => write!(f, "token invalid"),
            Self::Internal { detail } => write!(f, "internal admission error: {}", detail),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<CredentialError> for AdmissionError<E> {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Expired => Self::TokenExpired,
            CredentialError::Signing(detail) => Self::Internal { detail },
            CredentialError::Malformed
            | CredentialError::InvalidSignature
            | CredentialError::RefreshReused
            | CredentialError::WrongKind { .. }
            | CredentialError::UnknownSubject => Self::TokenInvalid,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if this error came from rate limiting
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. })
    }
    /// Check if this error is a lockout
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::AccountLocked { .. })
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Re-type an admission error that carries no inner error.
    pub fn map_inner<F, T>(self, f: F) -> AdmissionError<T>
    where
        F: FnOnce(E) -> T,
    {
        match self {
            Self::RateLimitExceeded { class, retry_after, limit } => {
                AdmissionError::RateLimitExceeded { class, retry_after, limit }
            }
            Self::AccountLocked { retry_after } => AdmissionError::AccountLocked { retry_after },
            Self::InvalidCredentials => AdmissionError::InvalidCredentials,
            Self::TokenExpired => AdmissionError::TokenExpired,
            Self::TokenInvalid => AdmissionError::TokenInvalid,
            Self::Internal { detail } => AdmissionError::Internal { detail },
            Self::Inner(e) => AdmissionError::Inner(f(e)),
        }
    }
    /// Client-facing translation, or `None` for errors of the wrapped service.
    pub fn rejection(&self) -> Option<Rejection> {
        let rejection = match self {
            Self::RateLimitExceeded { retry_after, .. } => Rejection {
                status: 429,
                code: "rate_limited",
                message: "too many requests",
                retry_after_secs: Some(ceil_secs(*retry_after)),
            },
            Self::AccountLocked { retry_after } => Rejection {
                status: 423,
                code: "account_locked",
                message: "too many failed login attempts; try again later",
                retry_after_secs: Some(ceil_minutes(*retry_after)),
            },
            Self::InvalidCredentials => {
                Rejection::unauthorized("invalid_credentials", "invalid credentials")
            }
            Self::TokenExpired => Rejection::unauthorized("token_expired", "token expired"),
            Self::TokenInvalid => Rejection::unauthorized("token_invalid", "token invalid"),
            Self::Internal { .. } => Rejection {
                status: 500,
                code: "internal_error",
                message: "internal error",
                retry_after_secs: None,
            },
            Self::Inner(_) => return None,
        };
        Some(rejection)
    }
}

/// HTTP-style rendering of an [`AdmissionError`]. Never carries internal detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// HTTP status code.
    pub status: u16,
    /// Stable machine-readable code.
    pub code: &'static str,
    /// Human-readable message.
    pub message: &'static str,
    /// Advisory `Retry-After`, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl Rejection {
    fn unauthorized(code: &'static str, message: &'static str) -> Self {
        Self { status: 401, code, message, retry_after_secs: None }
    }
}

/// Lockout hints are coarse so they reveal nothing beyond the window length.
fn ceil_minutes(d: Duration) -> u64 {
    let minutes = ceil_secs(d).div_ceil(SECS_PER_MINUTE);
    minutes.max(1) * SECS_PER_MINUTE
}
