//! Event subscription and dispatch core for Virtual Machine Introspection
//! (VMI).
//!
//! This crate owns the four event registries (register, interrupt,
//! single-step, memory), the memory-event access-mask algebra, and the
//! Step Coordinator that re-arms memory events after a deferred number
//! of single-step notifications. It depends on a pluggable
//! [`VmiDriver`] for everything that actually talks to a hypervisor;
//! address translation, symbol resolution, and guest OS semantics live
//! on other crates a full VMI stack composes alongside this one.

mod access;
mod config;
mod driver;
mod error;
mod event;
mod ids;
mod macros;
mod registry;
mod session;
mod step;

#[cfg(test)]
mod testing;

pub use self::{
    access::{AccessRights, MemoryAccess},
    config::VmiEventsConfig,
    driver::{EventNotification, IntrAccessRequest, RegAccessRequest, VmiDriver},
    error::{EventKey, VmiError},
    event::{
        EventPayload, Granularity, InterruptPayload, MemoryPayload, RegisterPayload,
        SingleStepPayload, Subscription,
    },
    ids::{Gfn, InterruptVector, Pa, RegisterId, VcpuBitmap, VcpuId},
    session::VmiEventSession,
};
