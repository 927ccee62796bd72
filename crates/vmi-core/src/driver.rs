//! The hypervisor driver contract (§6.2).
//!
//! The driver is the pluggable collaborator that actually talks to Xen,
//! KVM, or a memory-dump file. This core never implements a driver; it
//! only requires the operations below, mirroring the
//! base-trait-plus-associated-types shape the teacher crate's own
//! `VmiDriver` hierarchy uses.

use crate::access::MemoryAccess;
use crate::ids::{InterruptVector, Pa, RegisterId, VcpuBitmap, VcpuId};

/// A request to install a register-event access mask, as issued to
/// [`VmiDriver::set_reg_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegAccessRequest {
    /// The register this request concerns.
    pub register: RegisterId,
    /// The access mask to install (`N` when disarming).
    pub access: crate::access::AccessRights,
}

/// A request to toggle an interrupt-event subscription, as issued to
/// [`VmiDriver::set_intr_access`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrAccessRequest {
    /// The interrupt vector this request concerns.
    pub vector: InterruptVector,
    /// Whether the interrupt should be trapped.
    pub enabled: bool,
}

/// A raw notification handed back to the core from inside
/// [`VmiDriver::events_listen`].
///
/// The driver does not know about registries or callbacks; it only knows
/// how to recognize which kind of event fired and on what key. The core
/// looks the key up in the relevant registry and invokes the matching
/// subscription's callback (or, for single-step notifications belonging
/// to the step coordinator, runs its internal re-registration handler).
#[derive(Debug)]
pub enum EventNotification<Info> {
    /// A register-event notification.
    Register(RegisterId, Info),
    /// An interrupt-event notification.
    Interrupt(InterruptVector, Info),
    /// A memory-event notification, keyed by the faulting physical
    /// address (not just the page).
    Memory(Pa, Info),
    /// A single-step notification on the given vCPU.
    SingleStep(VcpuId, Info),
}

/// The hypervisor driver contract required by the event registry (§6.2).
///
/// Implementations talk to a concrete hypervisor (Xen, KVM) or a static
/// memory image; address translation, symbol resolution, and guest OS
/// semantics are all out of scope here (§1) and live on other traits a
/// full VMI stack composes alongside this one.
pub trait VmiDriver {
    /// The driver's own error type, surfaced to callers wrapped in
    /// [`crate::error::VmiError::DriverRejected`].
    type Error: std::error::Error + Send + Sync + 'static;

    /// Opaque per-notification context the driver hands to callbacks
    /// (e.g. the vCPU register state at the time of the trap). The core
    /// never inspects this; it is forwarded to user callbacks verbatim.
    type EventInfo;

    /// Installs (or clears, with `access = N`) a register-event trap.
    fn set_reg_access(&mut self, request: RegAccessRequest) -> Result<(), Self::Error>;

    /// Installs (or clears, with `enabled = false`) an interrupt-event
    /// trap.
    fn set_intr_access(&mut self, request: IntrAccessRequest) -> Result<(), Self::Error>;

    /// Installs `combined_mask` on the page containing `address`.
    fn set_mem_access(&mut self, address: Pa, combined_mask: MemoryAccess) -> Result<(), Self::Error>;

    /// Starts single-stepping the vCPUs selected in `vcpus`.
    fn start_single_step(&mut self, vcpus: VcpuBitmap) -> Result<(), Self::Error>;

    /// Stops single-stepping a single vCPU.
    fn stop_single_step(&mut self, vcpu: VcpuId) -> Result<(), Self::Error>;

    /// Stops single-stepping on every vCPU at once.
    fn shutdown_single_step(&mut self) -> Result<(), Self::Error>;

    /// Polls the hypervisor for pending notifications, from the
    /// caller's thread, for up to `timeout_ms`.
    ///
    /// The core dispatches the returned notifications synchronously
    /// after this call returns (§6.2); the driver itself never invokes a
    /// user callback directly, since it has no visibility into the
    /// registries that own them.
    fn events_listen(&mut self, timeout_ms: u32) -> Result<Vec<EventNotification<Self::EventInfo>>, Self::Error>;
}
