//! # vmi
//!
//! The event subscription and dispatch core of a Virtual Machine
//! Introspection (VMI) stack: four event registries (register,
//! interrupt, single-step, memory) coupled to a pluggable hypervisor
//! [`VmiDriver`], with the memory-event registry reconciling
//! page-granular driver hardware control against byte-granular caller
//! subscriptions via an aggregate access-mask combination rule, and a
//! Step Coordinator that re-arms memory events after a deferred number
//! of single-step notifications.
//!
//! Address translation, symbol resolution, and guest OS semantics are
//! out of scope for this crate; they belong on other crates a full VMI
//! stack composes alongside this one.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use vmi::{
//!     EventPayload, Granularity, MemoryAccess, MemoryPayload,
//!     Subscription, VcpuId, VmiEventSession, VmiEventsConfig,
//! };
//! # use vmi::{EventNotification, IntrAccessRequest, RegAccessRequest, VcpuBitmap, VmiDriver};
//! #
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("driver error")]
//! # struct MyDriverError;
//! #
//! # struct MyDriver;
//! # impl VmiDriver for MyDriver {
//! #     type Error = MyDriverError;
//! #     type EventInfo = ();
//! #     fn set_reg_access(&mut self, _: RegAccessRequest) -> Result<(), Self::Error> { Ok(()) }
//! #     fn set_intr_access(&mut self, _: IntrAccessRequest) -> Result<(), Self::Error> { Ok(()) }
//! #     fn set_mem_access(&mut self, _: vmi::Pa, _: MemoryAccess) -> Result<(), Self::Error> { Ok(()) }
//! #     fn start_single_step(&mut self, _: VcpuBitmap) -> Result<(), Self::Error> { Ok(()) }
//! #     fn stop_single_step(&mut self, _: VcpuId) -> Result<(), Self::Error> { Ok(()) }
//! #     fn shutdown_single_step(&mut self) -> Result<(), Self::Error> { Ok(()) }
//! #     fn events_listen(&mut self, _: u32) -> Result<Vec<EventNotification<Self::EventInfo>>, Self::Error> { Ok(vec![]) }
//! # }
//!
//! let mut session = VmiEventSession::new(MyDriver, VmiEventsConfig::enabled());
//! session.init();
//!
//! let address = vmi::Pa::new(0x1000_000);
//! let sub = Subscription::new(
//!     VcpuId::new(0),
//!     EventPayload::Memory(MemoryPayload {
//!         address,
//!         granularity: Granularity::Page,
//!         access: MemoryAccess::R,
//!     }),
//!     |_session, _info| println!("memory event fired"),
//! );
//! session.register_event(sub)?;
//! # Ok::<_, vmi::VmiError>(())
//! ```

pub use vmi_core::*;
