//! Event subscriptions and their type-specific payloads (§3).
//!
//! A [`Subscription`] is caller-owned: callers build one behind an [`Rc`]
//! and hand clones to [`crate::session::VmiEventSession`]; the registry
//! never copies it, matching §3's "the library never copies a
//! Subscription" rule with Rust's reference-counted pointer rather than
//! the raw C pointer the original keys hash maps on.

use std::cell::Cell;
use std::rc::Rc;

use crate::access::{AccessRights, MemoryAccess};
use crate::driver::VmiDriver;
use crate::ids::{InterruptVector, Pa, RegisterId, VcpuBitmap, VcpuId};
use crate::session::VmiEventSession;

/// Granularity at which a memory-event subscription observes a physical
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// The subscription covers the whole page.
    Page,
    /// The subscription covers a single physical address.
    Byte,
}

/// Register-event payload (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterPayload {
    /// The register to watch.
    pub register: RegisterId,
    /// The desired access mask, one of `{N, R, W, RW}`.
    pub access: AccessRights,
    /// Whether the subscription is currently enabled.
    pub enabled: bool,
}

/// Interrupt-event payload (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptPayload {
    /// The interrupt vector to watch.
    pub vector: InterruptVector,
    /// Whether the subscription is currently enabled.
    pub enabled: bool,
}

/// Single-step payload (§3).
///
/// `vcpus` is a [`Cell`] because [`crate::registry::singlestep::SingleStepRegistry::stop_single_step`]
/// mutates it in place to drop a single vCPU out of a subscription that
/// otherwise still covers others — the one payload field the design
/// genuinely requires to be mutable after registration.
#[derive(Debug)]
pub struct SingleStepPayload {
    /// The set of vCPUs this subscription steps.
    pub vcpus: Cell<VcpuBitmap>,
}

/// Memory-event payload (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryPayload {
    /// The physical address this subscription concerns.
    pub address: Pa,
    /// Whether this subscription observes the whole page or just
    /// `address`.
    pub granularity: Granularity,
    /// The requested access mask.
    pub access: MemoryAccess,
}

/// The type-specific payload carried by a [`Subscription`] (§3).
#[derive(Debug)]
pub enum EventPayload {
    /// A register-event payload.
    Register(RegisterPayload),
    /// An interrupt-event payload.
    Interrupt(InterruptPayload),
    /// A single-step payload.
    SingleStep(SingleStepPayload),
    /// A memory-event payload.
    Memory(MemoryPayload),
}

/// A caller-owned event subscription (§3).
///
/// Construct with [`Subscription::new`] and keep the returned [`Rc`]
/// alive until the subscription has been cleared; the registry holds
/// clones of the same `Rc`, never the payload itself.
pub struct Subscription<D>
where
    D: VmiDriver,
{
    /// The vCPU this subscription is associated with. Informational for
    /// register and interrupt events; authoritative for memory and
    /// single-step events sourced from a single vCPU context (the
    /// step coordinator reads it to target `step_mem_event`).
    pub vcpu_id: VcpuId,

    /// The subscription's payload.
    pub payload: EventPayload,

    /// The user callback invoked on delivery. Takes the owning session
    /// back as its first argument so a memory-event callback can
    /// register, clear, or `step_mem_event` reentrantly (§4.6, §5).
    #[allow(clippy::type_complexity)]
    callback: std::cell::RefCell<Box<dyn FnMut(&mut VmiEventSession<D>, &D::EventInfo)>>,
}

impl<D> Subscription<D>
where
    D: VmiDriver,
{
    /// Creates a new subscription.
    pub fn new(
        vcpu_id: VcpuId,
        payload: EventPayload,
        callback: impl FnMut(&mut VmiEventSession<D>, &D::EventInfo) + 'static,
    ) -> Rc<Self> {
        Rc::new(Self {
            vcpu_id,
            payload,
            callback: std::cell::RefCell::new(Box::new(callback)),
        })
    }

    /// Invokes the user callback with the owning `session` and the given
    /// event info.
    ///
    /// # Panics
    ///
    /// Panics if called re-entrantly on the same subscription (a
    /// callback triggering its own delivery again is not a pattern this
    /// core supports; registering or clearing *other* subscriptions, or
    /// calling [`VmiEventSession::step_mem_event`], from within a
    /// callback is fine and does not touch this `RefCell`).
    pub fn invoke(&self, session: &mut VmiEventSession<D>, info: &D::EventInfo) {
        (self.callback.borrow_mut())(session, info)
    }

    /// Returns the register id, for register-event subscriptions.
    pub fn register(&self) -> Option<RegisterId> {
        match &self.payload {
            EventPayload::Register(p) => Some(p.register),
            _ => None,
        }
    }

    /// Returns the interrupt vector, for interrupt-event subscriptions.
    pub fn interrupt(&self) -> Option<InterruptVector> {
        match &self.payload {
            EventPayload::Interrupt(p) => Some(p.vector),
            _ => None,
        }
    }

    /// Returns the vCPU bitmap, for single-step subscriptions.
    pub fn vcpus(&self) -> Option<VcpuBitmap> {
        match &self.payload {
            EventPayload::SingleStep(p) => Some(p.vcpus.get()),
            _ => None,
        }
    }

    /// Returns `(address, granularity, access)`, for memory-event
    /// subscriptions.
    pub fn memory(&self) -> Option<&MemoryPayload> {
        match &self.payload {
            EventPayload::Memory(p) => Some(p),
            _ => None,
        }
    }
}

impl<D> std::fmt::Debug for Subscription<D>
where
    D: VmiDriver,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("vcpu_id", &self.vcpu_id)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}
