//! User identity resolution for order materialization.
//!
//! Identity is looked up through an ordered fallback chain. The session's own
//! identity is always consulted first, then each registered source in order.

use std::fmt::{self, Debug, Display, Formatter};

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::session::CheckoutSession;

/// Numeric user identity, bound into signature claims as a `uint256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub U256);

impl Identity {
    /// Identity from a plain integer id.
    #[must_use]
    pub fn from_u64(id: u64) -> Self {
        Self(U256::from(id))
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an identity came from, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentitySourceKind {
    /// Explicitly set on the checkout session.
    Session,
    /// A cached user object.
    CachedUser,
    /// The embedding platform's context.
    PlatformContext,
    /// A process-wide fallback.
    ProcessGlobal,
    /// A locally persisted value.
    LocalStorage,
}

/// A source the chain can ask for an identity.
pub trait IdentitySource: Send + Sync {
    /// Which link of the chain this source represents.
    fn kind(&self) -> IdentitySourceKind;

    /// The identity this source currently knows, if any.
    fn identity(&self) -> Option<Identity>;
}

/// A source with a fixed answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticIdentity {
    kind: IdentitySourceKind,
    identity: Option<Identity>,
}

impl StaticIdentity {
    /// Creates a source that always returns `identity`.
    #[must_use]
    pub const fn new(kind: IdentitySourceKind, identity: Option<Identity>) -> Self {
        Self { kind, identity }
    }
}

impl IdentitySource for StaticIdentity {
    fn kind(&self) -> IdentitySourceKind {
        self.kind
    }

    fn identity(&self) -> Option<Identity> {
        self.identity
    }
}

/// Outcome of walking the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityResolution {
    /// A source produced an identity.
    Resolved {
        /// The identity.
        identity: Identity,
        /// The source that produced it.
        source: IdentitySourceKind,
    },
    /// Nobody was ever identified; the order is anonymous.
    Anonymous,
    /// The session had an identity earlier but none is available now.
    /// The order still proceeds anonymously.
    Lost,
}

impl IdentityResolution {
    /// The identity to attach to the order, if any.
    #[must_use]
    pub const fn identity(&self) -> Option<Identity> {
        match self {
            Self::Resolved { identity, .. } => Some(*identity),
            Self::Anonymous | Self::Lost => None,
        }
    }
}

/// Ordered identity fallback chain.
#[derive(Default)]
pub struct IdentityChain {
    sources: Vec<Box<dyn IdentitySource>>,
}

impl Debug for IdentityChain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let kinds: Vec<_> = self.sources.iter().map(|s| s.kind()).collect();
        f.debug_struct("IdentityChain")
            .field("sources", &kinds)
            .finish()
    }
}

impl IdentityChain {
    /// Creates a chain that only consults the session.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fallback source. Sources are consulted in insertion order.
    #[must_use]
    pub fn with_source(mut self, source: impl IdentitySource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// First identity found, without touching the session.
    #[must_use]
    pub fn peek(&self, session: &CheckoutSession) -> Option<(Identity, IdentitySourceKind)> {
        session
            .identity
            .map(|identity| (identity, IdentitySourceKind::Session))
            .or_else(|| {
                self.sources
                    .iter()
                    .find_map(|s| s.identity().map(|identity| (identity, s.kind())))
            })
    }

    /// Walks the chain and records on the session that an identity was seen.
    pub fn resolve(&self, session: &mut CheckoutSession) -> IdentityResolution {
        match self.peek(session) {
            Some((identity, source)) => {
                session.identity_seen = true;
                IdentityResolution::Resolved { identity, source }
            }
            None if session.identity_seen => IdentityResolution::Lost,
            None => IdentityResolution::Anonymous,
        }
    }
}
