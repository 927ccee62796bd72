//! Memory access masks and their combination rule.
//!
//! The driver can only install a single access mask per physical page,
//! while callers subscribe at page or byte granularity. §4.5 describes
//! the aggregate mask the registry must maintain; this module is that
//! mask's representation and the `combine` operation itself.
//!
//! A plain bitflags set cannot express `X_on_Write`'s mutual exclusion
//! with every other right (combining it with anything but itself or
//! `None` must be rejected, not silently unioned), so the mask is a
//! tagged sum type per the design notes in §9 rather than a bitfield.

use std::fmt;

bitflags::bitflags! {
    /// The `{Read, Write, Execute}` rights that can be combined freely.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    pub struct AccessRights: u8 {
        /// Trap on read.
        const R = 1 << 0;
        /// Trap on write.
        const W = 1 << 1;
        /// Trap on execute.
        const X = 1 << 2;
    }
}

/// A memory access mask, as requested by a subscription or installed on
/// a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum MemoryAccess {
    /// No access triggers an event.
    None,
    /// One or more of `{R, W, X}`.
    Combination(AccessRights),
    /// Trap on execute-after-write; mutually exclusive with every other
    /// right.
    XOnWrite,
    /// The result of combining two masks that cannot coexist on the same
    /// page.
    Invalid,
}

impl MemoryAccess {
    /// Trap on read.
    pub const R: Self = Self::Combination(AccessRights::R);
    /// Trap on write.
    pub const W: Self = Self::Combination(AccessRights::W);
    /// Trap on execute.
    pub const X: Self = Self::Combination(AccessRights::X);
    /// Trap on read or write.
    pub const RW: Self = Self::Combination(AccessRights::R.union(AccessRights::W));
    /// Trap on read or execute.
    pub const RX: Self = Self::Combination(AccessRights::R.union(AccessRights::X));
    /// Trap on write or execute.
    pub const WX: Self = Self::Combination(AccessRights::W.union(AccessRights::X));
    /// Trap on read, write, or execute.
    pub const RWX: Self =
        Self::Combination(AccessRights::R.union(AccessRights::W).union(AccessRights::X));

    /// Combines two access masks per the aggregate rule of §4.5.
    ///
    /// `combine` is commutative and associative (P5): equal operands
    /// return that operand unchanged, `None` is the identity element,
    /// `XOnWrite` combined with anything but itself or `None` is
    /// `Invalid`, and otherwise the two right-sets are unioned.
    pub fn combine(base: Self, add: Self) -> Self {
        if add == base {
            return base;
        }
        if add == Self::None {
            return base;
        }
        if base == Self::None {
            return add;
        }
        if add == Self::XOnWrite || base == Self::XOnWrite {
            return Self::Invalid;
        }
        match (base, add) {
            (Self::Combination(a), Self::Combination(b)) => Self::Combination(a | b),
            _ => Self::Invalid,
        }
    }

    /// Folds `combine` over an iterator of masks, starting from `None`.
    pub fn combine_all(masks: impl IntoIterator<Item = Self>) -> Self {
        masks.into_iter().fold(Self::None, Self::combine)
    }

    /// Returns whether this mask is [`MemoryAccess::Invalid`].
    pub fn is_invalid(self) -> bool {
        matches!(self, Self::Invalid)
    }
}

impl fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "N"),
            Self::Combination(rights) => {
                if rights.contains(AccessRights::R) {
                    write!(f, "R")?;
                }
                if rights.contains(AccessRights::W) {
                    write!(f, "W")?;
                }
                if rights.contains(AccessRights::X) {
                    write!(f, "X")?;
                }
                Ok(())
            }
            Self::XOnWrite => write!(f, "X_ON_WRITE"),
            Self::Invalid => write!(f, "INVALID"),
        }
    }
}
