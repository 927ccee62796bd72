use crate::access::MemoryAccess;
use crate::ids::{InterruptVector, Pa, RegisterId, VcpuId};

/// An error that can occur during event registration, clearing, or
/// dispatch (§7).
#[derive(thiserror::Error, Debug)]
pub enum VmiError {
    /// An event operation was attempted before [`init`] set the
    /// events-enabled flag.
    ///
    /// [`init`]: crate::session::VmiEventSession::init
    #[error("events are not enabled for this session")]
    NotEnabled,

    /// A subscription, callback, or argument was invalid for the
    /// requested operation.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    /// A registration targeted a key that is already occupied.
    #[error("an event is already registered for {0}")]
    AlreadyExists(EventKey),

    /// A clear (or lookup) targeted a key with no registered event.
    #[error("no event is registered for {0}")]
    NotFound(EventKey),

    /// The driver rejected a requested hardware state change; the
    /// registry was left unmodified (or, for the memory byte-clear path,
    /// the detached entry was reinserted).
    #[error("driver rejected request for {0}")]
    DriverRejected(EventKey, #[source] Box<dyn std::error::Error + Send + Sync>),

    /// Combining two memory access masks yielded
    /// [`MemoryAccess::Invalid`] (an `X_on_Write` conflict).
    #[error("access mask combination is invalid: {0} + {1} = Invalid")]
    MaskInvalid(MemoryAccess, MemoryAccess),
}

/// Identifies the registry key an error pertains to, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKey {
    /// A register-event key.
    Register(RegisterId),
    /// An interrupt-event key.
    Interrupt(InterruptVector),
    /// A single-step key.
    Vcpu(VcpuId),
    /// A page-granular memory-event key.
    Page(Pa),
    /// A byte-granular memory-event key.
    Byte(Pa),
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(id) => write!(f, "register {id}"),
            Self::Interrupt(vector) => write!(f, "interrupt vector {vector}"),
            Self::Vcpu(vcpu) => write!(f, "vcpu {vcpu}"),
            Self::Page(pa) => write!(f, "page containing {pa}"),
            Self::Byte(pa) => write!(f, "byte {pa}"),
        }
    }
}

impl VmiError {
    /// Wraps a driver error with the key the failed operation targeted.
    pub fn driver_rejected(
        key: EventKey,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DriverRejected(key, Box::new(source))
    }
}
