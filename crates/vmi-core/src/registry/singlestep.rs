//! Single-step registry (§4.4).

use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::driver::VmiDriver;
use crate::error::{EventKey, VmiError};
use crate::event::{EventPayload, Subscription};
use crate::ids::{VcpuBitmap, VcpuId};

/// Maps a vCPU index to its single-step subscription (§4.4).
///
/// One subscription may cover several vCPUs at once (its payload is a
/// bitmap), in which case it is present under several keys
/// simultaneously — all pointing at clones of the same `Rc`.
pub struct SingleStepRegistry<D>
where
    D: VmiDriver,
{
    entries: HashMap<VcpuId, Rc<Subscription<D>>>,
}

impl<D> Default for SingleStepRegistry<D>
where
    D: VmiDriver,
{
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<D> SingleStepRegistry<D>
where
    D: VmiDriver,
{
    /// Registers a single-step subscription across every vCPU set in its
    /// payload.
    ///
    /// A vCPU already registered logs *AlreadyExists* and is skipped;
    /// this does not abort registration for the subscription's other
    /// vCPUs (§4.4).
    pub fn register_singlestep(
        &mut self,
        driver: &mut D,
        sub: Rc<Subscription<D>>,
    ) -> Result<(), VmiError> {
        let bitmap = match &sub.payload {
            EventPayload::SingleStep(payload) => payload.vcpus.get(),
            _ => return Err(VmiError::BadArgument("subscription is not a single-step event")),
        };

        for vcpu in bitmap.iter() {
            if self.entries.contains_key(&vcpu) {
                warn!(?vcpu, "single-step already registered for this vcpu, skipping");
                continue;
            }

            driver
                .start_single_step(VcpuBitmap::single(vcpu))
                .map_err(|e| VmiError::driver_rejected(EventKey::Vcpu(vcpu), e))?;

            debug!(?vcpu, "single-step registered");
            self.entries.insert(vcpu, sub.clone());
        }
        Ok(())
    }

    /// Clears a single-step subscription across every vCPU set in its
    /// payload, then runs the shutdown path (§4.4.1) if the registry
    /// ends up empty.
    pub fn clear_singlestep(
        &mut self,
        driver: &mut D,
        sub: &Subscription<D>,
        shutting_down: bool,
    ) -> Result<(), VmiError> {
        let bitmap = sub.vcpus().ok_or(VmiError::BadArgument("subscription is not a single-step event"))?;

        for vcpu in bitmap.iter() {
            driver
                .stop_single_step(vcpu)
                .map_err(|e| VmiError::driver_rejected(EventKey::Vcpu(vcpu), e))?;

            debug!(?vcpu, shutting_down, "single-step cleared");
            if !shutting_down {
                self.entries.remove(&vcpu);
            }
        }

        if !shutting_down && self.entries.is_empty() {
            self.shutdown_single_step(driver)?;
        }
        Ok(())
    }

    /// Directly clears one vCPU out of whatever subscription currently
    /// covers it (§4.4).
    pub fn stop_single_step_vcpu(&mut self, driver: &mut D, vcpu: VcpuId) -> Result<(), VmiError> {
        let sub = self.entries.get(&vcpu).ok_or(VmiError::NotFound(EventKey::Vcpu(vcpu)))?.clone();

        if let Some(payload_bitmap) = sub.vcpus() {
            let mut bitmap = payload_bitmap;
            bitmap.remove(vcpu);
            if let EventPayload::SingleStep(payload) = &sub.payload {
                payload.vcpus.set(bitmap);
            }
        }

        self.entries.remove(&vcpu);
        driver.stop_single_step(vcpu).map_err(|e| VmiError::driver_rejected(EventKey::Vcpu(vcpu), e))?;
        debug!(?vcpu, "single-step stopped for vcpu");
        Ok(())
    }

    /// Instructs the driver to shut down all stepping, then destroys and
    /// recreates the registry so the session remains reusable.
    pub fn shutdown_single_step(&mut self, driver: &mut D) -> Result<(), VmiError> {
        driver
            .shutdown_single_step()
            .map_err(|e| VmiError::driver_rejected(EventKey::Vcpu(VcpuId::new(0)), e))?;
        debug!("single-step registry shut down");
        self.entries = HashMap::new();
        Ok(())
    }

    /// Looks up the subscription registered for `vcpu`, if any.
    pub fn get(&self, vcpu: VcpuId) -> Option<&Rc<Subscription<D>>> {
        self.entries.get(&vcpu)
    }

    /// Returns whether the registry holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over every registered subscription, deduplicated by
    /// identity (a multi-vcpu subscription appears once).
    pub fn iter_unique(&self) -> impl Iterator<Item = &Rc<Subscription<D>>> {
        let mut seen = std::collections::HashSet::new();
        self.entries.values().filter(move |sub| seen.insert(Rc::as_ptr(sub)))
    }
}
