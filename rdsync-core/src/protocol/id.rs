//! Entity Identity
//!
//! Every synchronized entity is addressed by an [`RdId`]. Ids of statically
//! known entities are derived from their position in the model tree by a pure
//! hash combine, so both endpoints compute the same id for the same position
//! without exchanging anything. Entities created at runtime get ids from a
//! per-endpoint counter whose parity depends on the endpoint's [`IdKind`].
//!
//! # Id Spaces
//!
//! ```text
//!   0                    null (not identified)
//!   1 .. 1_000_000       static ids, assigned by schema
//!   1_000_000 ..         dynamic ids: client even, server odd
//!   high bit set         stable ids from Identities::mix
//! ```

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

/// Identifier of a position in the synchronized entity tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RdId(i64);

impl RdId {
    /// The unbound sentinel.
    pub const NULL: RdId = RdId(0);

    /// Upper bound (exclusive) of the static id space.
    pub const MAX_STATIC_ID: i64 = 1_000_000;

    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Id of a schema-declared top-level entity.
    ///
    /// Returns `None` when `id` lies outside `1..MAX_STATIC_ID`.
    pub fn from_static(id: i64) -> Option<Self> {
        (id > 0 && id < Self::MAX_STATIC_ID).then_some(Self(id))
    }

    pub const fn value(self) -> i64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Combine this id with a name.
    ///
    /// Polynomial 31-hash over the UTF-16 code units of `tail`, seeded by this
    /// id, with wrapping arithmetic. Mixing is associative over concatenation:
    /// `id.mix("ab").mix("c") == id.mix("abc")`.
    pub fn mix(self, tail: &str) -> RdId {
        let hash = tail
            .encode_utf16()
            .fold(self.0, |acc, unit| acc.wrapping_mul(31).wrapping_add(unit as i64));
        RdId(hash)
    }

    pub fn mix_int(self, tail: i32) -> RdId {
        self.mix_long(tail as i64)
    }

    pub fn mix_long(self, tail: i64) -> RdId {
        RdId(self.0.wrapping_mul(31).wrapping_add(tail.wrapping_add(1)))
    }
}

impl fmt::Display for RdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<RdId> for i64 {
    fn from(id: RdId) -> Self {
        id.0
    }
}

/// Which side of a connection allocates ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IdKind {
    #[default]
    Client,
    Server,
}

/// Id allocator of one endpoint.
#[derive(Debug)]
pub struct Identities {
    kind: IdKind,
    counter: AtomicI64,
}

impl Identities {
    /// Bit marking ids produced by [`mix`](Self::mix).
    const STABLE_MASK: i64 = i64::MIN;

    pub fn new(kind: IdKind) -> Self {
        let base = match kind {
            IdKind::Client => RdId::MAX_STATIC_ID,
            IdKind::Server => RdId::MAX_STATIC_ID + 1,
        };
        Self { kind, counter: AtomicI64::new(base) }
    }

    pub fn kind(&self) -> IdKind {
        self.kind
    }

    /// Allocate a fresh dynamic id.
    ///
    /// Client ids are even and server ids are odd, so the two sides never
    /// allocate the same id.
    pub fn next(&self) -> RdId {
        RdId(self.counter.fetch_add(2, Ordering::Relaxed))
    }

    /// Stable id for a named child of `parent`, identical on both sides.
    pub fn mix(&self, parent: RdId, tail: &str) -> RdId {
        RdId(parent.mix(tail).0 | Self::STABLE_MASK)
    }

    pub fn mix_int(&self, parent: RdId, tail: i32) -> RdId {
        RdId(parent.mix_int(tail).0 | Self::STABLE_MASK)
    }

    pub fn mix_long(&self, parent: RdId, tail: i64) -> RdId {
        RdId(parent.mix_long(tail).0 | Self::STABLE_MASK)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
