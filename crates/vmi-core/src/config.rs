//! Session configuration (§6.3).

/// Configuration for an event session, passed to
/// [`crate::session::VmiEventSession::new`].
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct VmiEventsConfig {
    /// Gates registry allocation at [`init`]; when unset, every event
    /// operation fails with [`crate::error::VmiError::NotEnabled`].
    ///
    /// [`init`]: crate::session::VmiEventSession::init
    pub events_enabled: bool,
}

impl VmiEventsConfig {
    /// A configuration with events enabled.
    pub fn enabled() -> Self {
        Self { events_enabled: true }
    }
}
