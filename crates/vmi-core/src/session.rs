//! Session Lifecycle and Dispatch Surface (§4.1, §4.7).
//!
//! [`VmiEventSession`] is the long-lived Introspection Session of §2: it
//! owns the four event registries, the Step Coordinator, and the one
//! bound [`VmiDriver`], and is the sole entry point callers use to
//! register, clear, and dispatch events.

use std::rc::Rc;

use tracing::{debug, info};

use crate::config::VmiEventsConfig;
use crate::driver::{EventNotification, VmiDriver};
use crate::error::{EventKey, VmiError};
use crate::event::{EventPayload, Granularity, Subscription};
use crate::ids::InterruptVector;
use crate::ids::{Pa, RegisterId, VcpuId};
use crate::registry::interrupt::InterruptEventRegistry;
use crate::registry::memory::MemoryEventRegistry;
use crate::registry::reg::RegisterEventRegistry;
use crate::registry::singlestep::SingleStepRegistry;
use crate::step::StepCoordinator;

/// The long-lived Introspection Session (§2).
pub struct VmiEventSession<D>
where
    D: VmiDriver,
{
    driver: D,
    config: VmiEventsConfig,
    enabled: bool,
    shutting_down: bool,
    registers: RegisterEventRegistry<D>,
    interrupts: InterruptEventRegistry<D>,
    singlestep: SingleStepRegistry<D>,
    memory: MemoryEventRegistry<D>,
    step: StepCoordinator<D>,
}

impl<D> VmiEventSession<D>
where
    D: VmiDriver,
{
    /// Creates a new session bound to `driver`. The session is not
    /// usable for event operations until [`VmiEventSession::init`] is
    /// called.
    pub fn new(driver: D, config: VmiEventsConfig) -> Self {
        Self {
            driver,
            config,
            enabled: false,
            shutting_down: false,
            registers: RegisterEventRegistry::default(),
            interrupts: InterruptEventRegistry::default(),
            singlestep: SingleStepRegistry::default(),
            memory: MemoryEventRegistry::default(),
            step: StepCoordinator::default(),
        }
    }

    /// Initializes the session (§4.1).
    ///
    /// If the *events-enabled* flag in the session's
    /// [`VmiEventsConfig`] is unset, every subsequent event operation
    /// fails with [`VmiError::NotEnabled`].
    pub fn init(&mut self) {
        self.enabled = self.config.events_enabled;
        self.shutting_down = false;
        info!(enabled = self.enabled, "event session initialized");
    }

    /// Tears the session down (§4.1).
    ///
    /// Sets `shutting_down`, disarms every registered subscription via
    /// the driver without mutating the registries mid-walk, then frees
    /// the (now-empty) registries.
    pub fn teardown(&mut self) -> Result<(), VmiError> {
        self.shutting_down = true;

        let regs: Vec<_> = self.registers.iter().cloned().collect();
        for sub in regs {
            self.registers.clear_reg(&mut self.driver, &sub, true)?;
        }

        let intrs: Vec<_> = self.interrupts.iter().cloned().collect();
        for sub in intrs {
            self.interrupts.clear_interrupt(&mut self.driver, &sub, true)?;
        }

        let steps: Vec<_> = self.singlestep.iter_unique().cloned().collect();
        for sub in steps {
            self.singlestep.clear_singlestep(&mut self.driver, &sub, true)?;
        }

        let mems: Vec<_> = self.memory.iter().cloned().collect();
        for sub in mems {
            self.memory.clear_mem(&mut self.driver, &sub, true)?;
        }

        self.registers = RegisterEventRegistry::default();
        self.interrupts = InterruptEventRegistry::default();
        self.singlestep = SingleStepRegistry::default();
        self.memory = MemoryEventRegistry::default();
        self.enabled = false;

        debug!("event session torn down");
        Ok(())
    }

    fn ensure_enabled(&self) -> Result<(), VmiError> {
        if self.enabled { Ok(()) } else { Err(VmiError::NotEnabled) }
    }

    /// Registers `sub`, dispatching on its payload's type tag (§4.7).
    pub fn register_event(&mut self, sub: Rc<Subscription<D>>) -> Result<(), VmiError> {
        self.ensure_enabled()?;
        match &sub.payload {
            EventPayload::Register(_) => self.registers.register_reg(&mut self.driver, sub),
            EventPayload::Interrupt(_) => self.interrupts.register_interrupt(&mut self.driver, sub),
            EventPayload::SingleStep(_) => self.singlestep.register_singlestep(&mut self.driver, sub),
            EventPayload::Memory(_) => self.memory.register_mem(&mut self.driver, sub),
        }
    }

    /// Clears `sub`, dispatching on its payload's type tag (§4.7).
    pub fn clear_event(&mut self, sub: &Rc<Subscription<D>>) -> Result<(), VmiError> {
        self.ensure_enabled()?;
        match &sub.payload {
            EventPayload::Register(_) => self.registers.clear_reg(&mut self.driver, sub, self.shutting_down),
            EventPayload::Interrupt(_) => self.interrupts.clear_interrupt(&mut self.driver, sub, self.shutting_down),
            EventPayload::SingleStep(_) => self.singlestep.clear_singlestep(&mut self.driver, sub, self.shutting_down),
            EventPayload::Memory(_) => self.memory.clear_mem(&mut self.driver, sub, self.shutting_down),
        }
    }

    /// Requests an N-step deferred re-registration of `m`, callable only
    /// from inside a memory-event callback (§4.6).
    pub fn step_mem_event(&mut self, m: Rc<Subscription<D>>, steps: u32) -> Result<(), VmiError> {
        self.ensure_enabled()?;
        self.step.step_mem_event(&mut self.driver, &mut self.singlestep, m, steps)
    }

    /// Directly clears one vCPU out of `sub`'s single-step subscription
    /// (§4.4, §6.1).
    pub fn stop_single_step_vcpu(&mut self, sub: &Rc<Subscription<D>>, vcpu: VcpuId) -> Result<(), VmiError> {
        self.ensure_enabled()?;
        match self.singlestep.get(vcpu) {
            Some(registered) if Rc::ptr_eq(registered, sub) => {}
            _ => return Err(VmiError::NotFound(EventKey::Vcpu(vcpu))),
        }
        self.singlestep.stop_single_step_vcpu(&mut self.driver, vcpu)
    }

    /// Shuts down single-stepping on every vCPU at once (§4.4, §6.1).
    pub fn shutdown_single_step(&mut self) -> Result<(), VmiError> {
        self.ensure_enabled()?;
        self.singlestep.shutdown_single_step(&mut self.driver)
    }

    /// Pumps the driver's event loop once, dispatching every resulting
    /// notification to its matching subscription (§4.7, §6.2).
    pub fn events_listen(&mut self, timeout_ms: u32) -> Result<(), VmiError> {
        self.ensure_enabled()?;
        let notifications = self
            .driver
            .events_listen(timeout_ms)
            .map_err(|e| VmiError::driver_rejected(EventKey::Vcpu(VcpuId::new(0)), e))?;

        for notification in notifications {
            self.dispatch_notification(notification)?;
        }
        Ok(())
    }

    fn dispatch_notification(&mut self, notification: EventNotification<D::EventInfo>) -> Result<(), VmiError> {
        match notification {
            EventNotification::Register(id, info) => {
                let sub = self.registers.get(id).cloned();
                if let Some(sub) = sub {
                    sub.invoke(self, &info);
                }
            }
            EventNotification::Interrupt(vector, info) => {
                let sub = self.interrupts.get(vector).cloned();
                if let Some(sub) = sub {
                    sub.invoke(self, &info);
                }
            }
            EventNotification::Memory(address, info) => {
                // The driver only installs a page-granular mask, so it
                // delivers page-granular wake-ups; demultiplex by the
                // exact faulting address, falling back to the
                // page-level subscription (§4.5 rationale).
                let sub = self
                    .memory
                    .get_mem_event(address, Granularity::Byte)
                    .or_else(|| self.memory.get_mem_event(address, Granularity::Page))
                    .cloned();
                if let Some(sub) = sub {
                    sub.invoke(self, &info);
                }
            }
            EventNotification::SingleStep(vcpu, info) => {
                if let Some(sub) = self.singlestep.get(vcpu).cloned() {
                    if self.step.owns(&sub) {
                        self.step.rereg(&mut self.driver, &mut self.singlestep, &mut self.memory, vcpu)?;
                    } else {
                        sub.invoke(self, &info);
                    }
                }
            }
        }
        Ok(())
    }

    /// Looks up the subscription registered for `register`, if any
    /// (§4.7).
    pub fn get_reg_event(&self, register: RegisterId) -> Option<&Rc<Subscription<D>>> {
        self.registers.get(register)
    }

    /// Looks up the subscription registered for `vector`, if any
    /// (§4.7).
    pub fn get_interrupt_event(&self, vector: InterruptVector) -> Option<&Rc<Subscription<D>>> {
        self.interrupts.get(vector)
    }

    /// Looks up the page- or byte-level memory subscription at
    /// `address`, depending on `granularity` (§4.7).
    pub fn get_mem_event(&self, address: Pa, granularity: Granularity) -> Option<&Rc<Subscription<D>>> {
        self.memory.get_mem_event(address, granularity)
    }

    /// Looks up the single-step subscription registered for `vcpu`, if
    /// any (§4.7).
    pub fn get_singlestep_event(&self, vcpu: VcpuId) -> Option<&Rc<Subscription<D>>> {
        self.singlestep.get(vcpu)
    }
}

#[cfg(test)]
mod session_tests;
