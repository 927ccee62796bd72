//! A mock [`VmiDriver`] shared by this crate's unit tests.
//!
//! Records every call it receives so tests can assert both the
//! registry's public state and the exact sequence of driver calls (§8
//! P2), and can be told to reject the next call of a given kind to
//! exercise the atomicity-under-failure paths (§8 P4).

use std::cell::{Cell, RefCell};

use thiserror::Error;

use crate::access::MemoryAccess;
use crate::driver::{EventNotification, IntrAccessRequest, RegAccessRequest, VmiDriver};
use crate::ids::{Pa, VcpuBitmap, VcpuId};

/// The error [`MockDriver`] returns when told to reject a call.
#[derive(Debug, Error)]
#[error("mock driver rejected the call")]
pub struct MockDriverError;

/// A [`VmiDriver`] that records calls instead of touching real hardware.
#[derive(Default)]
pub struct MockDriver {
    pub reg_access_calls: RefCell<Vec<RegAccessRequest>>,
    pub intr_access_calls: RefCell<Vec<IntrAccessRequest>>,
    pub mem_access_calls: RefCell<Vec<(Pa, MemoryAccess)>>,
    pub start_single_step_calls: RefCell<Vec<VcpuBitmap>>,
    pub stop_single_step_calls: RefCell<Vec<VcpuId>>,
    pub shutdown_single_step_calls: RefCell<u32>,

    pub fail_next_reg_access: Cell<bool>,
    pub fail_next_intr_access: Cell<bool>,
    pub fail_next_mem_access: Cell<bool>,
    pub fail_next_start_single_step: Cell<bool>,

    pending_notifications: RefCell<Vec<EventNotification<()>>>,
}

impl MockDriver {
    /// Enqueues a notification to be delivered on the next
    /// [`VmiDriver::events_listen`] call.
    pub fn queue_notification(&self, notification: EventNotification<()>) {
        self.pending_notifications.borrow_mut().push(notification);
    }

    fn take_fail(flag: &Cell<bool>) -> bool {
        let fail = flag.get();
        flag.set(false);
        fail
    }
}

impl VmiDriver for MockDriver {
    type Error = MockDriverError;
    type EventInfo = ();

    fn set_reg_access(&mut self, request: RegAccessRequest) -> Result<(), Self::Error> {
        if Self::take_fail(&self.fail_next_reg_access) {
            return Err(MockDriverError);
        }
        self.reg_access_calls.borrow_mut().push(request);
        Ok(())
    }

    fn set_intr_access(&mut self, request: IntrAccessRequest) -> Result<(), Self::Error> {
        if Self::take_fail(&self.fail_next_intr_access) {
            return Err(MockDriverError);
        }
        self.intr_access_calls.borrow_mut().push(request);
        Ok(())
    }

    fn set_mem_access(&mut self, address: Pa, combined_mask: MemoryAccess) -> Result<(), Self::Error> {
        if Self::take_fail(&self.fail_next_mem_access) {
            return Err(MockDriverError);
        }
        self.mem_access_calls.borrow_mut().push((address, combined_mask));
        Ok(())
    }

    fn start_single_step(&mut self, vcpus: VcpuBitmap) -> Result<(), Self::Error> {
        if Self::take_fail(&self.fail_next_start_single_step) {
            return Err(MockDriverError);
        }
        self.start_single_step_calls.borrow_mut().push(vcpus);
        Ok(())
    }

    fn stop_single_step(&mut self, vcpu: VcpuId) -> Result<(), Self::Error> {
        self.stop_single_step_calls.borrow_mut().push(vcpu);
        Ok(())
    }

    fn shutdown_single_step(&mut self) -> Result<(), Self::Error> {
        *self.shutdown_single_step_calls.borrow_mut() += 1;
        Ok(())
    }

    fn events_listen(&mut self, _timeout_ms: u32) -> Result<Vec<EventNotification<Self::EventInfo>>, Self::Error> {
        Ok(self.pending_notifications.borrow_mut().drain(..).collect())
    }
}
