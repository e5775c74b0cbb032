//! The abstract-value lattice: a small type-tag bitset plus an optional
//! identity token, and the handful of lattice operations the interpreter and
//! peephole visitors build on.

use bitflags::bitflags;

bitflags! {
    /// A 7-bit set of runtime value kinds. `ANY` is all bits set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct T: u8 {
        const UNDEFINED = 0b0000001;
        const NULL      = 0b0000010;
        const FAILED    = 0b0000100;
        const OFFSET    = 0b0001000;
        const ARRAY     = 0b0010000;
        const STRING    = 0b0100000;
        const ANY = Self::UNDEFINED.bits()
            | Self::NULL.bits()
            | Self::FAILED.bits()
            | Self::OFFSET.bits()
            | Self::ARRAY.bits()
            | Self::STRING.bits();
    }
}

/// An object-identity token minted from a per-rule monotonic counter.
///
/// Two identities compare equal iff they came from the same mint call (see
/// [`IdentitySource`]); this is what lets the interpreter recognize "the
/// same `OFFSET` value flowing through the code" without any notion of
/// pointer equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(u32);

/// Mints fresh, never-repeating [`Identity`] tokens for one rule's
/// optimization pass.
#[derive(Debug, Default, Clone)]
pub struct IdentitySource(u32);

impl IdentitySource {
    pub fn new() -> Self {
        Self(0)
    }

    /// Returns a token distinct from every token this source has returned
    /// before.
    pub fn mint(&mut self) -> Identity {
        let id = Identity(self.0);
        self.0 += 1;
        id
    }
}

/// A value in the abstract domain: a type tag, and optionally an identity
/// that survives only as long as the concrete value provably hasn't changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AbstractValue {
    pub tag: T,
    pub identity: Option<Identity>,
}

impl AbstractValue {
    pub fn new(tag: T) -> Self {
        Self { tag, identity: None }
    }

    pub fn with_identity(tag: T, identity: Identity) -> Self {
        Self { tag, identity: Some(identity) }
    }

    pub fn any() -> Self {
        Self::new(T::ANY)
    }

    /// `mustBe(v, mask)`: `v` is known to never be anything outside `mask`.
    pub fn must_be(self, mask: T) -> bool {
        !self.tag.is_empty() && (self.tag & !mask).is_empty()
    }

    /// `couldBe(v, mask)`: `v` might be something in `mask`.
    pub fn could_be(self, mask: T) -> bool {
        !(self.tag & mask).is_empty()
    }

    /// Arrays and the `FAILED` sentinel always test truthy in the host VM.
    pub fn must_be_true(self) -> bool {
        self.must_be(T::ARRAY | T::FAILED)
    }

    pub fn must_be_false(self) -> bool {
        self.must_be(T::NULL | T::UNDEFINED)
    }

    /// Lattice join. Identity survives only when both sides agree on it and
    /// the joined tag is a single kind (a power-of-two bitset), matching
    /// spec.md's `union` definition exactly: merging two different kinds (or
    /// two different identities of the same kind) always drops identity.
    pub fn union(self, other: AbstractValue) -> AbstractValue {
        let tag = self.tag | other.tag;
        let identity = match (self.identity, other.identity) {
            (Some(a), Some(b)) if a == b && is_power_of_two(tag.bits()) => Some(a),
            _ => None,
        };
        AbstractValue { tag, identity }
    }
}

fn is_power_of_two(bits: u8) -> bool {
    bits != 0 && (bits & (bits - 1)) == 0
}
