//! Owned integer identifiers used as registry keys.
//!
//! §9 of the design notes prefers keying registries by an owned integer
//! identifier over keying by pointers into the caller's subscription
//! payload: it decouples registry lifetime from the subscription's
//! address and avoids aliasing hazards. These newtypes are that
//! identifier space.

use crate::macros::impl_ops;

impl_ops!(RegisterId, u32, "privileged-register identifier");
impl_ops!(InterruptVector, u8, "software interrupt vector");
impl_ops!(VcpuId, u16, "virtual CPU index");
impl_ops!(Pa, u64, "guest physical address");
impl_ops!(Gfn, u64, "guest physical frame number");

impl Pa {
    /// Bit width of a page offset (4 KiB pages).
    pub const PAGE_SHIFT: u32 = 12;

    /// Returns the frame number this address falls in (`address >> 12`).
    pub fn gfn(self) -> Gfn {
        Gfn(self.0 >> Self::PAGE_SHIFT)
    }
}

impl From<Gfn> for Pa {
    fn from(value: Gfn) -> Self {
        Self(value.0 << Self::PAGE_SHIFT)
    }
}

/// A bitmap of vCPU indices, as carried by the single-step payload.
///
/// Bit `n` set means vCPU `n` is selected. 64 vCPUs ought to be enough
/// for any guest this core will ever introspect; drivers targeting wider
/// topologies are expected to split registration across sessions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct VcpuBitmap(pub u64);

impl VcpuBitmap {
    /// An empty bitmap.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// A bitmap selecting a single vCPU.
    pub fn single(vcpu: VcpuId) -> Self {
        Self(1u64 << vcpu.0)
    }

    /// Returns whether `vcpu` is set in this bitmap.
    pub fn contains(self, vcpu: VcpuId) -> bool {
        self.0 & (1u64 << vcpu.0) != 0
    }

    /// Sets `vcpu` in this bitmap.
    pub fn insert(&mut self, vcpu: VcpuId) {
        self.0 |= 1u64 << vcpu.0;
    }

    /// Clears `vcpu` from this bitmap.
    pub fn remove(&mut self, vcpu: VcpuId) {
        self.0 &= !(1u64 << vcpu.0);
    }

    /// Iterates over the set vCPU indices, in ascending order.
    pub fn iter(self) -> impl Iterator<Item = VcpuId> {
        (0..64).filter(move |bit| self.0 & (1u64 << bit) != 0).map(|bit| VcpuId(bit as u16))
    }

    /// Returns whether no vCPU is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}
