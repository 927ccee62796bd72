//! Interrupt-event registry (§4.3).

use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::driver::{IntrAccessRequest, VmiDriver};
use crate::error::{EventKey, VmiError};
use crate::event::{EventPayload, Subscription};
use crate::ids::InterruptVector;

/// Maps an interrupt vector to its subscription (§4.3, symmetric to
/// §4.2).
pub struct InterruptEventRegistry<D>
where
    D: VmiDriver,
{
    entries: HashMap<InterruptVector, Rc<Subscription<D>>>,
}

impl<D> Default for InterruptEventRegistry<D>
where
    D: VmiDriver,
{
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<D> InterruptEventRegistry<D>
where
    D: VmiDriver,
{
    /// Registers an interrupt-event subscription.
    pub fn register_interrupt(
        &mut self,
        driver: &mut D,
        sub: Rc<Subscription<D>>,
    ) -> Result<(), VmiError> {
        let payload = match &sub.payload {
            EventPayload::Interrupt(payload) => *payload,
            _ => return Err(VmiError::BadArgument("subscription is not an interrupt event")),
        };

        if self.entries.contains_key(&payload.vector) {
            return Err(VmiError::AlreadyExists(EventKey::Interrupt(payload.vector)));
        }

        driver
            .set_intr_access(IntrAccessRequest { vector: payload.vector, enabled: payload.enabled })
            .map_err(|e| VmiError::driver_rejected(EventKey::Interrupt(payload.vector), e))?;

        debug!(vector = ?payload.vector, "interrupt event registered");
        self.entries.insert(payload.vector, sub);
        Ok(())
    }

    /// Clears an interrupt-event subscription.
    ///
    /// The driver call always installs `enabled = false`; the caller's
    /// own subscription payload is never mutated to get there (§0.5).
    pub fn clear_interrupt(
        &mut self,
        driver: &mut D,
        sub: &Subscription<D>,
        shutting_down: bool,
    ) -> Result<(), VmiError> {
        let vector = sub.interrupt().ok_or(VmiError::BadArgument("subscription is not an interrupt event"))?;

        if !self.entries.contains_key(&vector) {
            return Err(VmiError::NotFound(EventKey::Interrupt(vector)));
        }

        driver
            .set_intr_access(IntrAccessRequest { vector, enabled: false })
            .map_err(|e| VmiError::driver_rejected(EventKey::Interrupt(vector), e))?;

        debug!(?vector, shutting_down, "interrupt event cleared");
        if !shutting_down {
            self.entries.remove(&vector);
        }
        Ok(())
    }

    /// Looks up the subscription registered for `vector`, if any.
    pub fn get(&self, vector: InterruptVector) -> Option<&Rc<Subscription<D>>> {
        self.entries.get(&vector)
    }

    /// Iterates over every registered subscription.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<Subscription<D>>> {
        self.entries.values()
    }
}
