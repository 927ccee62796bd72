//! Register-event registry (§4.2).

use std::collections::HashMap;
use std::rc::Rc;

use tracing::debug;

use crate::access::AccessRights;
use crate::driver::{RegAccessRequest, VmiDriver};
use crate::error::{EventKey, VmiError};
use crate::event::{EventPayload, Subscription};
use crate::ids::RegisterId;

/// Maps a register identifier to its subscription (§4.2).
pub struct RegisterEventRegistry<D>
where
    D: VmiDriver,
{
    entries: HashMap<RegisterId, Rc<Subscription<D>>>,
}

impl<D> Default for RegisterEventRegistry<D>
where
    D: VmiDriver,
{
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<D> RegisterEventRegistry<D>
where
    D: VmiDriver,
{
    /// Registers a register-event subscription.
    pub fn register_reg(
        &mut self,
        driver: &mut D,
        sub: Rc<Subscription<D>>,
    ) -> Result<(), VmiError> {
        let payload = match &sub.payload {
            EventPayload::Register(payload) => *payload,
            _ => return Err(VmiError::BadArgument("subscription is not a register event")),
        };

        if self.entries.contains_key(&payload.register) {
            return Err(VmiError::AlreadyExists(EventKey::Register(payload.register)));
        }

        driver
            .set_reg_access(RegAccessRequest { register: payload.register, access: payload.access })
            .map_err(|e| VmiError::driver_rejected(EventKey::Register(payload.register), e))?;

        debug!(register = ?payload.register, access = ?payload.access, "register event registered");
        self.entries.insert(payload.register, sub);
        Ok(())
    }

    /// Clears a register-event subscription.
    ///
    /// The driver call always installs access `N`; the caller's own
    /// subscription payload is never mutated to get there (§0.5).
    pub fn clear_reg(
        &mut self,
        driver: &mut D,
        sub: &Subscription<D>,
        shutting_down: bool,
    ) -> Result<(), VmiError> {
        let register = sub.register().ok_or(VmiError::BadArgument("subscription is not a register event"))?;

        if !self.entries.contains_key(&register) {
            return Err(VmiError::NotFound(EventKey::Register(register)));
        }

        driver
            .set_reg_access(RegAccessRequest { register, access: AccessRights::empty() })
            .map_err(|e| VmiError::driver_rejected(EventKey::Register(register), e))?;

        debug!(?register, shutting_down, "register event cleared");
        if !shutting_down {
            self.entries.remove(&register);
        }
        Ok(())
    }

    /// Looks up the subscription registered for `register`, if any.
    pub fn get(&self, register: RegisterId) -> Option<&Rc<Subscription<D>>> {
        self.entries.get(&register)
    }

    /// Iterates over every registered subscription.
    pub fn iter(&self) -> impl Iterator<Item = &Rc<Subscription<D>>> {
        self.entries.values()
    }
}
