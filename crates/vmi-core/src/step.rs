//! Step Coordinator (§4.6).
//!
//! Memory-event callbacks often need to disarm the page, let the guest
//! retire the faulting instruction, then re-arm. This is the mechanical
//! expression of that pattern: a queue of memory subscriptions awaiting
//! re-registration after N single-step notifications on their vCPU.

use std::cell::Cell;
use std::rc::Rc;

use tracing::debug;

use crate::driver::VmiDriver;
use crate::error::VmiError;
use crate::event::{EventPayload, Subscription};
use crate::ids::{VcpuBitmap, VcpuId};
use crate::registry::memory::MemoryEventRegistry;
use crate::registry::singlestep::SingleStepRegistry;

/// A memory subscription awaiting re-arm, library-owned (§3 "Step
/// Wrapper").
struct StepWrapper<D>
where
    D: VmiDriver,
{
    event: Rc<Subscription<D>>,
    remaining: u32,
}

/// Coordinates single-step-based re-arming of memory events (§4.6).
pub struct StepCoordinator<D>
where
    D: VmiDriver,
{
    queue: Vec<StepWrapper<D>>,
    /// The coordinator's own internal single-step subscription, created
    /// lazily on the first [`StepCoordinator::step_mem_event`] call and
    /// torn down once the queue drains.
    ss_sub: Option<Rc<Subscription<D>>>,
}

impl<D> Default for StepCoordinator<D>
where
    D: VmiDriver,
{
    fn default() -> Self {
        Self { queue: Vec::new(), ss_sub: None }
    }
}

impl<D> StepCoordinator<D>
where
    D: VmiDriver,
{
    /// Returns whether `sub` is the coordinator's own internal
    /// single-step subscription, i.e. whether a firing notification on
    /// it should be routed to [`StepCoordinator::rereg`] instead of a
    /// user callback.
    pub fn owns(&self, sub: &Rc<Subscription<D>>) -> bool {
        self.ss_sub.as_ref().is_some_and(|owned| Rc::ptr_eq(owned, sub))
    }

    /// Entry point, callable only from inside a memory-event callback
    /// (§4.6).
    pub fn step_mem_event(
        &mut self,
        driver: &mut D,
        singlestep: &mut SingleStepRegistry<D>,
        m: Rc<Subscription<D>>,
        steps: u32,
    ) -> Result<(), VmiError> {
        let vcpu_id = m.vcpu_id;
        if m.memory().is_none() {
            return Err(VmiError::BadArgument("step_mem_event requires a memory event"));
        }
        if steps == 0 {
            return Err(VmiError::BadArgument("step_mem_event requires steps >= 1"));
        }
        if singlestep.get(vcpu_id).is_some() {
            return Err(VmiError::BadArgument("a single-step event already exists for this vcpu"));
        }

        let ss_sub = match &self.ss_sub {
            Some(existing) => {
                if let EventPayload::SingleStep(payload) = &existing.payload {
                    let mut bitmap = payload.vcpus.get();
                    bitmap.insert(vcpu_id);
                    payload.vcpus.set(bitmap);
                }
                existing.clone()
            }
            None => {
                let sub = Subscription::new(
                    vcpu_id,
                    EventPayload::SingleStep(crate::event::SingleStepPayload {
                        vcpus: Cell::new(VcpuBitmap::single(vcpu_id)),
                    }),
                    |_session: &mut crate::session::VmiEventSession<D>, _info: &D::EventInfo| {},
                );
                self.ss_sub = Some(sub.clone());
                sub
            }
        };

        singlestep.register_singlestep(driver, ss_sub)?;
        debug!(?vcpu_id, steps, "step_mem_event queued");
        self.queue.push(StepWrapper { event: m, remaining: steps });
        Ok(())
    }

    /// Re-registration handler, invoked whenever a single-step
    /// notification fires on `vcpu` (§4.6).
    ///
    /// Walks every queued wrapper, decrementing those belonging to
    /// `vcpu`; wrappers that reach zero are re-registered and dropped
    /// from the queue. If the queue drains completely, the internal
    /// single-step subscription is cleared and freed.
    pub fn rereg(
        &mut self,
        driver: &mut D,
        singlestep: &mut SingleStepRegistry<D>,
        memory: &mut MemoryEventRegistry<D>,
        vcpu: VcpuId,
    ) -> Result<(), VmiError> {
        let mut ready = Vec::new();
        self.queue.retain_mut(|wrapper| {
            if wrapper.event.vcpu_id == vcpu {
                wrapper.remaining = wrapper.remaining.saturating_sub(1);
            }
            if wrapper.remaining == 0 {
                ready.push(wrapper.event.clone());
                false
            } else {
                true
            }
        });

        for event in ready {
            debug!(vcpu_id = ?event.vcpu_id, "re-registering memory event after single-step sequence");
            memory.register_mem(driver, event)?;
        }

        if self.queue.is_empty() {
            if let Some(ss_sub) = self.ss_sub.take() {
                singlestep.clear_singlestep(driver, &ss_sub, false)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::MemoryAccess;
    use crate::event::{Granularity, MemoryPayload};
    use crate::ids::Pa;
    use crate::testing::MockDriver;

    fn mem_sub(address: Pa, vcpu: VcpuId) -> Rc<Subscription<MockDriver>> {
        Subscription::new(
            vcpu,
            EventPayload::Memory(MemoryPayload { address, granularity: Granularity::Page, access: MemoryAccess::W }),
            |_, _| {},
        )
    }

    #[test]
    fn scenario_6_step_then_reregisters_after_n_notifications() -> Result<(), VmiError> {
        let mut driver = MockDriver::default();
        let mut singlestep = SingleStepRegistry::default();
        let mut memory = MemoryEventRegistry::default();
        let mut coordinator = StepCoordinator::default();

        let vcpu = VcpuId::new(0);
        let m = mem_sub(Pa::new(0x1000_000), vcpu);
        memory.register_mem(&mut driver, m.clone())?;
        memory.clear_mem(&mut driver, &m, false)?;

        coordinator.step_mem_event(&mut driver, &mut singlestep, m.clone(), 3)?;
        assert_eq!(driver.start_single_step_calls.borrow().len(), 1);
        assert!(singlestep.get(vcpu).is_some());

        coordinator.rereg(&mut driver, &mut singlestep, &mut memory, vcpu)?;
        coordinator.rereg(&mut driver, &mut singlestep, &mut memory, vcpu)?;
        assert!(singlestep.get(vcpu).is_some(), "still waiting after 2/3 notifications");

        coordinator.rereg(&mut driver, &mut singlestep, &mut memory, vcpu)?;
        assert!(singlestep.get(vcpu).is_none(), "step subscription cleared once queue drains");
        assert_eq!(*driver.shutdown_single_step_calls.borrow(), 1);
        assert!(memory.get_mem_event(Pa::new(0x1000_000), Granularity::Page).is_some(), "m re-registered");
        Ok(())
    }

    #[test]
    fn step_mem_event_rejects_non_memory_subscription() {
        let mut driver = MockDriver::default();
        let mut singlestep = SingleStepRegistry::default();
        let mut coordinator = StepCoordinator::default();
        let non_mem = Subscription::<MockDriver>::new(
            VcpuId::new(0),
            EventPayload::Interrupt(crate::event::InterruptPayload {
                vector: crate::ids::InterruptVector::new(3),
                enabled: true,
            }),
            |_, _| {},
        );
        let err = coordinator.step_mem_event(&mut driver, &mut singlestep, non_mem, 1);
        assert!(matches!(err, Err(VmiError::BadArgument(_))));
    }
}
