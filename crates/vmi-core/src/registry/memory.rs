//! Memory-event registry (§4.5) — the central design of this core.
//!
//! The driver installs a single access mask per physical page; callers
//! subscribe at page or byte granularity. This registry maintains, per
//! page, the *aggregate* mask (§4.5's `combine`) that reconciles every
//! subscription touching that page, and keeps the driver's installed
//! mask in lock-step with it.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::access::MemoryAccess;
use crate::driver::VmiDriver;
use crate::error::{EventKey, VmiError};
use crate::event::{EventPayload, Granularity, Subscription};
use crate::ids::{Gfn, Pa};

/// A library-owned per-page aggregate (§3 "Memory Page Entry").
pub struct PageEntry<D>
where
    D: VmiDriver,
{
    /// The aggregate mask currently installed in the driver for this
    /// page (invariant 1 & 2 of §3).
    pub access_flag: MemoryAccess,
    /// At most one page-granular subscription.
    pub page_event: Option<Rc<Subscription<D>>>,
    /// Byte-granular subscriptions, keyed by physical address.
    pub byte_events: Option<HashMap<Pa, Rc<Subscription<D>>>>,
}

impl<D> PageEntry<D>
where
    D: VmiDriver,
{
    fn is_empty(&self) -> bool {
        self.page_event.is_none() && self.byte_events.as_ref().is_none_or(|m| m.is_empty())
    }

    fn byte_masks(&self) -> impl Iterator<Item = MemoryAccess> + '_ {
        self.byte_events.iter().flat_map(|m| m.values()).filter_map(|sub| sub.memory()).map(|p| p.access)
    }
}

/// Maps a physical page (frame number) to its [`PageEntry`] (§4.5).
pub struct MemoryEventRegistry<D>
where
    D: VmiDriver,
{
    entries: HashMap<Gfn, PageEntry<D>>,
}

impl<D> Default for MemoryEventRegistry<D>
where
    D: VmiDriver,
{
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<D> MemoryEventRegistry<D>
where
    D: VmiDriver,
{
    /// Registers a memory-event subscription, dispatching on whether a
    /// [`PageEntry`] already exists for the page and on granularity
    /// (Cases A/B/C of §4.5).
    pub fn register_mem(
        &mut self,
        driver: &mut D,
        sub: Rc<Subscription<D>>,
    ) -> Result<(), VmiError> {
        let payload = *sub.memory().ok_or(VmiError::BadArgument("subscription is not a memory event"))?;
        let gfn = payload.address.gfn();

        match self.entries.get(&gfn) {
            // Case A: no Page Entry exists.
            None => {
                driver
                    .set_mem_access(payload.address, payload.access)
                    .map_err(|e| VmiError::driver_rejected(EventKey::Page(payload.address), e))?;

                let mut entry = PageEntry { access_flag: payload.access, page_event: None, byte_events: None };
                match payload.granularity {
                    Granularity::Page => entry.page_event = Some(sub),
                    Granularity::Byte => {
                        entry.byte_events = Some(HashMap::from([(payload.address, sub)]));
                    }
                }
                debug!(?gfn, access = ?payload.access, "memory event registered (new page)");
                self.entries.insert(gfn, entry);
                Ok(())
            }

            // Case B: Page Entry exists; granularity Page.
            Some(entry) if payload.granularity == Granularity::Page => {
                if entry.page_event.is_some() {
                    return Err(VmiError::AlreadyExists(EventKey::Page(payload.address)));
                }
                let new = MemoryAccess::combine(entry.access_flag, payload.access);
                if new.is_invalid() {
                    return Err(VmiError::MaskInvalid(entry.access_flag, payload.access));
                }
                driver
                    .set_mem_access(payload.address, new)
                    .map_err(|e| VmiError::driver_rejected(EventKey::Page(payload.address), e))?;

                debug!(?gfn, access = ?new, "memory event registered (page, existing entry)");
                let entry = self.entries.get_mut(&gfn).expect("checked above");
                entry.access_flag = new;
                entry.page_event = Some(sub);
                Ok(())
            }

            // Case C: Page Entry exists; granularity Byte.
            Some(entry) => {
                if entry.byte_events.as_ref().is_some_and(|m| m.contains_key(&payload.address)) {
                    return Err(VmiError::AlreadyExists(EventKey::Byte(payload.address)));
                }
                let new = MemoryAccess::combine(entry.access_flag, payload.access);
                if new.is_invalid() {
                    return Err(VmiError::MaskInvalid(entry.access_flag, payload.access));
                }
                driver
                    .set_mem_access(payload.address, new)
                    .map_err(|e| VmiError::driver_rejected(EventKey::Byte(payload.address), e))?;

                debug!(?gfn, addr = ?payload.address, access = ?new, "memory event registered (byte)");
                let entry = self.entries.get_mut(&gfn).expect("checked above");
                entry.access_flag = new;
                entry.byte_events.get_or_insert_with(HashMap::new).insert(payload.address, sub);
                Ok(())
            }
        }
    }

    /// Clears a memory-event subscription (§4.5's clear algorithm).
    pub fn clear_mem(
        &mut self,
        driver: &mut D,
        sub: &Subscription<D>,
        shutting_down: bool,
    ) -> Result<(), VmiError> {
        let payload = *sub.memory().ok_or(VmiError::BadArgument("subscription is not a memory event"))?;
        let gfn = payload.address.gfn();

        if shutting_down {
            driver
                .set_mem_access(payload.address, MemoryAccess::None)
                .map_err(|e| VmiError::driver_rejected(EventKey::Page(payload.address), e))?;
            return Ok(());
        }

        let Some(entry) = self.entries.get_mut(&gfn) else {
            warn!(?gfn, "clear targeting a physical address with no Page Entry");
            return Err(VmiError::NotFound(EventKey::Page(payload.address)));
        };

        match payload.granularity {
            Granularity::Page => {
                if entry.page_event.is_none() {
                    warn!(?gfn, "clear targeting a page event with no page_event set");
                    return Err(VmiError::NotFound(EventKey::Page(payload.address)));
                }

                // Recompute from the surviving byte_events alone (§9 open
                // question, resolved against `clear_mem_event` in
                // original_source/libvmi/events.c).
                let new = MemoryAccess::combine_all(entry.byte_masks().collect::<Vec<_>>());
                driver
                    .set_mem_access(payload.address, new)
                    .map_err(|e| VmiError::driver_rejected(EventKey::Page(payload.address), e))?;

                let entry = self.entries.get_mut(&gfn).expect("checked above");
                entry.access_flag = new;
                entry.page_event = None;
                debug!(?gfn, access = ?new, "memory page event cleared");
                if entry.is_empty() {
                    self.entries.remove(&gfn);
                }
                Ok(())
            }

            Granularity::Byte => {
                let Some(stolen) = entry.byte_events.as_mut().and_then(|m| m.remove(&payload.address)) else {
                    warn!(addr = ?payload.address, "clear targeting a byte event with no matching entry");
                    return Err(VmiError::NotFound(EventKey::Byte(payload.address)));
                };

                // Recompute from page_event (if any) combined with every
                // remaining byte entry.
                let page_mask = entry.page_event.as_ref().and_then(|s| s.memory()).map(|p| p.access);
                let new = MemoryAccess::combine_all(page_mask.into_iter().chain(entry.byte_masks()));

                match driver.set_mem_access(payload.address, new) {
                    Ok(()) => {
                        let entry = self.entries.get_mut(&gfn).expect("checked above");
                        entry.access_flag = new;
                        if entry.byte_events.as_ref().is_some_and(|m| m.is_empty()) {
                            entry.byte_events = None;
                        }
                        debug!(?gfn, addr = ?payload.address, access = ?new, "memory byte event cleared");
                        if entry.is_empty() {
                            self.entries.remove(&gfn);
                        }
                        Ok(())
                    }
                    Err(e) => {
                        // Reinsert the stolen entry: the hardware state
                        // didn't change, so neither should the registry.
                        entry.byte_events.get_or_insert_with(HashMap::new).insert(payload.address, stolen);
                        Err(VmiError::driver_rejected(EventKey::Byte(payload.address), e))
                    }
                }
            }
        }
    }

    /// Returns the page-level subscription for `granularity = Page`, or
    /// the byte-level subscription at `address` for `granularity = Byte`
    /// (§4.7).
    pub fn get_mem_event(&self, address: Pa, granularity: Granularity) -> Option<&Rc<Subscription<D>>> {
        let entry = self.entries.get(&address.gfn())?;
        match granularity {
            Granularity::Page => entry.page_event.as_ref(),
            Granularity::Byte => entry.byte_events.as_ref()?.get(&address),
        }
    }

    /// Looks up the page entry for the page containing `address`.
    pub fn page_entry(&self, address: Pa) -> Option<&PageEntry<D>> {
        self.entries.get(&address.gfn())
    }

    /// Iterates over every registered subscription (page-level and
    /// byte-level), for teardown.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<Subscription<D>>> {
        self.entries.values().flat_map(|entry| {
            entry.page_event.iter().chain(entry.byte_events.iter().flat_map(|m| m.values()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MemoryPayload;
    use crate::ids::VcpuId;
    use crate::testing::MockDriver;

    fn sub(address: Pa, granularity: Granularity, access: MemoryAccess) -> Rc<Subscription<MockDriver>> {
        Subscription::new(
            VcpuId::new(0),
            EventPayload::Memory(MemoryPayload { address, granularity, access }),
            |_, _| {},
        )
    }

    #[test]
    fn scenario_1_register_page_read() -> Result<(), VmiError> {
        let mut driver = MockDriver::default();
        let mut registry = MemoryEventRegistry::default();
        let address = Pa::new(0x1000_000);

        registry.register_mem(&mut driver, sub(address, Granularity::Page, MemoryAccess::R))?;

        assert_eq!(driver.mem_access_calls.borrow().last(), Some(&(address, MemoryAccess::R)));
        assert!(registry.get_mem_event(address, Granularity::Page).is_some());
        Ok(())
    }

    #[test]
    fn scenario_2_register_byte_write_combines() -> Result<(), VmiError> {
        let mut driver = MockDriver::default();
        let mut registry = MemoryEventRegistry::default();
        let page_addr = Pa::new(0x1000_000);
        let byte_addr = Pa::new(0x1000_abc);

        registry.register_mem(&mut driver, sub(page_addr, Granularity::Page, MemoryAccess::R))?;
        registry.register_mem(&mut driver, sub(byte_addr, Granularity::Byte, MemoryAccess::W))?;

        assert_eq!(driver.mem_access_calls.borrow().last(), Some(&(byte_addr, MemoryAccess::RW)));
        assert_eq!(registry.page_entry(page_addr).unwrap().access_flag, MemoryAccess::RW);
        assert!(registry.get_mem_event(byte_addr, Granularity::Byte).is_some());
        Ok(())
    }

    #[test]
    fn scenario_3_and_4_clear_page_then_byte() -> Result<(), VmiError> {
        let mut driver = MockDriver::default();
        let mut registry = MemoryEventRegistry::default();
        let page_addr = Pa::new(0x1000_000);
        let byte_addr = Pa::new(0x1000_abc);

        let page_sub = sub(page_addr, Granularity::Page, MemoryAccess::R);
        let byte_sub = sub(byte_addr, Granularity::Byte, MemoryAccess::W);
        registry.register_mem(&mut driver, page_sub.clone())?;
        registry.register_mem(&mut driver, byte_sub.clone())?;

        registry.clear_mem(&mut driver, &page_sub, false)?;
        assert_eq!(driver.mem_access_calls.borrow().last(), Some(&(page_addr, MemoryAccess::W)));
        assert!(registry.page_entry(page_addr).is_some());
        assert!(registry.get_mem_event(page_addr, Granularity::Page).is_none());

        registry.clear_mem(&mut driver, &byte_sub, false)?;
        assert_eq!(driver.mem_access_calls.borrow().last(), Some(&(byte_addr, MemoryAccess::None)));
        assert!(registry.page_entry(page_addr).is_none());
        Ok(())
    }

    #[test]
    fn scenario_5_x_on_write_conflict_is_mask_invalid() -> Result<(), VmiError> {
        let mut driver = MockDriver::default();
        let mut registry = MemoryEventRegistry::default();
        let page_addr = Pa::new(0x1000_000);
        let byte_addr = Pa::new(0x1000_abc);

        registry.register_mem(&mut driver, sub(page_addr, Granularity::Page, MemoryAccess::XOnWrite))?;
        let calls_before = driver.mem_access_calls.borrow().len();

        let err = registry.register_mem(&mut driver, sub(byte_addr, Granularity::Byte, MemoryAccess::R));
        assert!(matches!(err, Err(VmiError::MaskInvalid(_, _))));
        assert_eq!(driver.mem_access_calls.borrow().len(), calls_before, "driver must be untouched");
        assert!(registry.get_mem_event(byte_addr, Granularity::Byte).is_none());
        Ok(())
    }

    #[test]
    fn byte_clear_reinserts_stolen_entry_on_driver_failure() -> Result<(), VmiError> {
        let mut driver = MockDriver::default();
        let mut registry = MemoryEventRegistry::default();
        let byte_addr = Pa::new(0x2000_abc);
        let byte_sub = sub(byte_addr, Granularity::Byte, MemoryAccess::W);
        registry.register_mem(&mut driver, byte_sub.clone())?;

        driver.fail_next_mem_access.set(true);
        let err = registry.clear_mem(&mut driver, &byte_sub, false);
        assert!(matches!(err, Err(VmiError::DriverRejected(EventKey::Byte(_), _))));

        // P4: the registry must reflect its pre-operation state.
        assert!(registry.get_mem_event(byte_addr, Granularity::Byte).is_some());
        assert_eq!(registry.page_entry(byte_addr).unwrap().access_flag, MemoryAccess::W);
        Ok(())
    }

    #[test]
    fn page_entry_exists_iff_page_event_or_byte_events_nonempty() -> Result<(), VmiError> {
        let mut driver = MockDriver::default();
        let mut registry = MemoryEventRegistry::default();
        let page_addr = Pa::new(0x3000_000);

        let page_sub = sub(page_addr, Granularity::Page, MemoryAccess::R);
        registry.register_mem(&mut driver, page_sub.clone())?;
        registry.clear_mem(&mut driver, &page_sub, false)?;
        assert!(registry.page_entry(page_addr).is_none());
        Ok(())
    }
}
