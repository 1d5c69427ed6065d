//! Credential issuer: short-lived access tokens and single-use refresh tokens.
//!
//! Tokens are HS256-signed JWTs carrying the user id, expiry, issuer, a unique `jti`, and the
//! token kind. Validation is stateless except for refresh: a refresh token's `jti` is recorded
//! in a spent ledger when it is exchanged, and a second exchange is refused. Ledger entries
//! are kept until the token would have expired anyway (see [`CredentialIssuer::prune_ledger`]).
//!
//! Expiry is checked against the injected [`Clock`], not the library's wall clock, so tests
//! can move time with [`crate::clock::ManualClock`].

use crate::clock::{duration_millis, Clock, SystemClock};
use crate::config::CredentialConfig;
use crate::identity::UserId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

const MILLIS_PER_SEC: u64 = 1_000;

/// Why a token was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    /// The token's expiry has passed.
    #[error("token expired")]
    Expired,
    /// Not a well-formed token, or required claims are missing.
    #[error("malformed token")]
    Malformed,
    /// The signature does not verify under the issuer's key.
    #[error("invalid token signature")]
    InvalidSignature,
    /// The refresh token was already exchanged once.
    #[error("refresh token already used")]
    RefreshReused,
    /// An access token was presented where a refresh token was expected, or vice versa.
    #[error("wrong token kind: expected {expected}")]
    WrongKind {
        /// Kind the operation requires.
        expected: TokenKind,
    },
    /// The subject no longer resolves to a user.
    #[error("token subject does not resolve to a user")]
    UnknownSubject,
    /// Encoding a new token failed.
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Failure of the user-resolution collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// No user matches the subject.
    #[error("user not found: {0}")]
    NotFound(String),
}

/// Maps a token subject back to a user id.
pub trait UserResolver: Send + Sync + fmt::Debug {
    /// Resolve `subject`, failing with [`ResolveError::NotFound`] for unknown users.
    fn resolve_user_id(&self, subject: &str) -> Result<UserId, ResolveError>;
}

/// Resolver that treats every subject as an existing user id.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllResolver;

impl UserResolver for AcceptAllResolver {
    fn resolve_user_id(&self, subject: &str) -> Result<UserId, ResolveError> {
        Ok(UserId::new(subject))
    }
}

/// Kind of bearer token, carried in the `typ` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Authorizes API requests.
    Access,
    /// Exchangeable once for a new pair.
    Refresh,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Access => f.write_str("access"),
            TokenKind::Refresh => f.write_str("refresh"),
        }
    }
}

/// Signed claims. `exp` and `iat` are seconds since the clock's epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Expiry.
    pub exp: u64,
    /// Issued at.
    pub iat: u64,
    /// Unique token id.
    pub jti: String,
    /// Issuer.
    pub iss: String,
    /// Token kind.
    pub typ: TokenKind,
}

/// A freshly issued access/refresh pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenPair {
    /// Bearer token for API requests.
    pub access_token: String,
    /// Token to exchange for the next pair.
    pub refresh_token: String,
    /// Access token expiry, seconds since the clock's epoch.
    pub access_expires_at: u64,
    /// Refresh token expiry, seconds since the clock's epoch.
    pub refresh_expires_at: u64,
}

/// Issues, validates, and refreshes credentials.
pub struct CredentialIssuer {
    config: CredentialConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    resolver: Arc<dyn UserResolver>,
    clock: Arc<dyn Clock>,
    spent_refresh: DashMap<String, u64>,
}

impl fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("clock", &self.clock)
            .field("spent_refresh", &self.spent_refresh.len())
            .finish_non_exhaustive()
    }
}

impl CredentialIssuer {
    /// Create an issuer signing with `secret`, using the system clock.
    pub fn new(config: CredentialConfig, secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock in `decode_claims`.
        validation.validate_exp = false;
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);
        validation.set_issuer(&[config.issuer()]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            config,
            resolver: Arc::new(AcceptAllResolver),
            clock: Arc::new(SystemClock::default()),
            spent_refresh: DashMap::new(),
        }
    }

    /// Create an issuer with an ephemeral random 32-byte key. Tokens do not survive a restart.
    pub fn with_random_secret(config: CredentialConfig) -> Self {
        let secret: [u8; 32] = rand::random();
        Self::new(config, &secret)
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Share an existing clock handle.
    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the user-resolution collaborator.
    pub fn with_resolver<R: UserResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Credential lifetimes.
    pub fn config(&self) -> &CredentialConfig {
        &self.config
    }

    /// Issue a new access/refresh pair for `user`.
    pub fn issue(&self, user: &UserId) -> Result<TokenPair, CredentialError> {
        let now = self.clock.now_millis();
        let (access_token, access_expires_at) =
            self.sign(user, TokenKind::Access, now, self.config.access_token_ttl())?;
        let (refresh_token, refresh_expires_at) =
            self.sign(user, TokenKind::Refresh, now, self.config.refresh_token_ttl())?;
        debug!(target: "trackgate::credentials", user = %user, "issued token pair");
        Ok(TokenPair { access_token, refresh_token, access_expires_at, refresh_expires_at })
    }

    /// Validate an access token and return its user.
    pub fn validate(&self, token: &str) -> Result<UserId, CredentialError> {
        let now = self.clock.now_millis();
        let claims = self.decode_claims(token, TokenKind::Access, now)?;
        self.resolve(&claims)
    }

    /// Exchange a refresh token for a brand-new pair. The presented token cannot be used again.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair, CredentialError> {
        let now = self.clock.now_millis();
        let claims = self.decode_claims(refresh_token, TokenKind::Refresh, now)?;
        let user = self.resolve(&claims)?;

        match self.spent_refresh.entry(claims.jti.clone()) {
            Entry::Occupied(_) => {
                warn!(
                    target: "trackgate::credentials",
                    user = %user,
                    jti = %claims.jti,
                    "refresh token presented a second time"
                );
                return Err(CredentialError::RefreshReused);
            }
            Entry::Vacant(slot) => {
                slot.insert(claims.exp);
            }
        }

        self.issue(&user)
    }

    /// Drop spent refresh ids whose tokens have expired. Returns how many were removed.
    pub fn prune_ledger(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.spent_refresh.len();
        self.spent_refresh.retain(|_, exp| !is_expired(*exp, now));
        before.saturating_sub(self.spent_refresh.len())
    }

    /// Number of spent refresh ids still tracked.
    pub fn ledger_len(&self) -> usize {
        self.spent_refresh.len()
    }

    fn sign(
        &self,
        user: &UserId,
        typ: TokenKind,
        now_millis: u64,
        ttl: std::time::Duration,
    ) -> Result<(String, u64), CredentialError> {
        let exp = now_millis.saturating_add(duration_millis(ttl)).div_ceil(MILLIS_PER_SEC);
        let claims = Claims {
            sub: user.as_str().to_string(),
            exp,
            iat: now_millis / MILLIS_PER_SEC,
            jti: uuid::Uuid::new_v4().to_string(),
            iss: self.config.issuer().to_string(),
            typ,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(
            |e| {
                error!(target: "trackgate::credentials", error = %e, "failed to sign token");
                CredentialError::Signing(e.to_string())
            },
        )?;
        Ok((token, exp))
    }

    fn decode_claims(
        &self,
        token: &str,
        expected: TokenKind,
        now_millis: u64,
    ) -> Result<Claims, CredentialError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => CredentialError::InvalidSignature,
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                _ => CredentialError::Malformed,
            })?;

        if claims.typ != expected {
            return Err(CredentialError::WrongKind { expected });
        }
        if is_expired(claims.exp, now_millis) {
            return Err(CredentialError::Expired);
        }
        Ok(claims)
    }

    fn resolve(&self, claims: &Claims) -> Result<UserId, CredentialError> {
        self.resolver.resolve_user_id(&claims.sub).map_err(|e| {
            debug!(target: "trackgate::credentials", error = %e, "token subject did not resolve");
            CredentialError::UnknownSubject
        })
    }
}

/// Expired once `now >= exp`.
fn is_expired(exp_secs: u64, now_millis: u64) -> bool {
    now_millis >= exp_secs.saturating_mul(MILLIS_PER_SEC)
}
