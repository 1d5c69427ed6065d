//! Keys used by the admission layer: who is asking, and which class of route they hit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Static tag assigned to every route. Selects the limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Login, token refresh, registration.
    Auth,
    /// GPS point ingestion.
    Tracking,
    /// Tracking-session CRUD.
    Session,
    /// Publicly shared tracks.
    Public,
    /// API documentation.
    Docs,
}

impl EndpointClass {
    /// Every class, in table order.
    pub const ALL: [EndpointClass; 5] = [
        EndpointClass::Auth,
        EndpointClass::Tracking,
        EndpointClass::Session,
        EndpointClass::Public,
        EndpointClass::Docs,
    ];

    /// Position in per-class lookup tables.
    pub const fn index(self) -> usize {
        match self {
            EndpointClass::Auth => 0,
            EndpointClass::Tracking => 1,
            EndpointClass::Session => 2,
            EndpointClass::Public => 3,
            EndpointClass::Docs => 4,
        }
    }

    /// Stable lowercase name for logs and metrics.
    pub const fn as_str(self) -> &'static str {
        match self {
            EndpointClass::Auth => "auth",
            EndpointClass::Tracking => "tracking",
            EndpointClass::Session => "session",
            EndpointClass::Public => "public",
            EndpointClass::Docs => "docs",
        }
    }

    /// Whether brute-force lockout applies to this class.
    pub const fn is_auth(self) -> bool {
        matches!(self, EndpointClass::Auth)
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an account in the record store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Stable key for rate limiting and lockout, derived from the originating address and,
/// once known, the authenticated user.
///
/// Immutable per request. Two identities are equal only if both parts match, so an
/// authenticated user connecting from two addresses gets two independent buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    addr: IpAddr,
    user: Option<UserId>,
}

impl ClientIdentity {
    /// Identity for an anonymous request.
    pub fn from_addr(addr: IpAddr) -> Self {
        Self { addr, user: None }
    }

    /// Refine the identity once the user id is known.
    pub fn with_user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    /// Originating address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Authenticated user, if any.
    pub fn user(&self) -> Option<&UserId> {
        self.user.as_ref()
    }
}

impl From<IpAddr> for ClientIdentity {
    fn from(addr: IpAddr) -> Self {
        Self::from_addr(addr)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}#{}", self.addr, user),
            None => write!(f, "{}", self.addr),
        }
    }
}
