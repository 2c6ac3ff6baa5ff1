//! Client model: the fixed refnum table entries and the behavior
//! contract the engine drives them through.

use std::sync::Arc;

use crate::error::EngineError;
use crate::event::{CallbackMask, Notification};

/// Size of the client table; refnums are indices into it.
pub const CLIENT_MAX: usize = 64;
/// Longest accepted client name, in bytes.
pub const CLIENT_NAME_MAX: usize = 64;
/// Revision of the client/server contract. Checked at open.
pub const PROTOCOL_VERSION: u32 = 8;

/// What kind of table entry a refnum holds. Drivers occupy the leading
/// slots; internal clients run in-process; external clients live in
/// another process and are reached through their [`ClientInterface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// A device driver. Not triggered by the graph walk it initiates.
    Driver,
    /// Runs inside the server process; triggered inline.
    Internal,
    /// Lives outside the server; triggered through its interface and
    /// awaited on its timing record.
    External,
}

/// Result of kicking a client's cycle slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The client's work for this cycle completed inline.
    Finished,
    /// The client was woken and will mark itself finished; the engine
    /// waits on its timing record.
    Pending,
    /// No live client behind this refnum (mid-close); skip the slot.
    Absent,
}

/// Behavior supplied per client: how to notify it and how to run its
/// cycle slot.
///
/// Internal clients implement [`process`](Self::process) and are run
/// inline by the realtime walk. External transports override
/// [`trigger`](Self::trigger) to wake their process and return
/// [`TriggerOutcome::Pending`]; the engine then waits for
/// [`Engine::cycle_finished`](crate::engine::Engine::cycle_finished).
pub trait ClientInterface: Send + Sync {
    /// Delivers a notification. Synchronous kinds should only return
    /// once the client handled it; an error fails the triggering
    /// operation for sync kinds and is logged otherwise.
    fn notify(&self, notification: &Notification) -> Result<(), EngineError>;

    /// One cycle of work. Only called when
    /// [`trigger`](Self::trigger)'s default wiring is in use.
    fn process(&self, frames: u32) {
        let _ = frames;
    }

    /// Kicks the client's cycle slot from the realtime walk.
    fn trigger(&self, frames: u32) -> TriggerOutcome {
        self.process(frames);
        TriggerOutcome::Finished
    }
}

/// Control data for one live client.
#[derive(Debug, Clone)]
pub struct ClientControl {
    /// Unique name across live clients.
    pub name: String,
    /// Owning process id, zero for in-process clients.
    pub pid: u32,
    /// Subscribed callback kinds.
    pub callbacks: CallbackMask,
    /// Set between activate and deactivate.
    pub active: bool,
}

impl ClientControl {
    pub fn new(name: impl Into<String>, pid: u32) -> Self {
        Self {
            name: name.into(),
            pid,
            callbacks: CallbackMask::none(),
            active: false,
        }
    }
}

/// One occupied slot of the client table.
pub(crate) struct ClientSlot {
    pub kind: ClientKind,
    pub control: ClientControl,
    pub iface: Arc<dyn ClientInterface>,
}

impl std::fmt::Debug for ClientSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSlot")
            .field("kind", &self.kind)
            .field("name", &self.control.name)
            .field("active", &self.control.active)
            .finish()
    }
}

/// Appends `-01`..`-99` to `base` until the name is free according to
/// `taken`. Errors when the base cannot take a suffix within the name
/// cap or all 99 are taken.
pub(crate) fn generate_unique_name(
    base: &str,
    taken: impl Fn(&str) -> bool,
) -> Result<String, EngineError> {
    if base.len() > CLIENT_NAME_MAX - 4 {
        return Err(EngineError::NameTooLong {
            name: base.to_string(),
        });
    }
    for suffix in 1..=99u32 {
        let candidate = format!("{base}-{suffix:02}");
        if !taken(&candidate) {
            return Ok(candidate);
        }
    }
    tracing::warn!(base, "99 suffixed instances already exist");
    Err(EngineError::NameTooLong {
        name: base.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_name_starts_at_01() {
        let name = generate_unique_name("alsa", |_| false).unwrap();
        assert_eq!(name, "alsa-01");
    }

    #[test]
    fn test_unique_name_skips_taken_suffixes() {
        let name =
            generate_unique_name("alsa", |n| n == "alsa-01" || n == "alsa-02").unwrap();
        assert_eq!(name, "alsa-03");
    }

    #[test]
    fn test_unique_name_gives_up_after_99() {
        let err = generate_unique_name("alsa", |_| true).unwrap_err();
        assert!(matches!(err, EngineError::NameTooLong { .. }));
    }

    #[test]
    fn test_unique_name_rejects_names_near_the_cap() {
        let long = "x".repeat(CLIENT_NAME_MAX - 3);
        let err = generate_unique_name(&long, |_| false).unwrap_err();
        assert!(matches!(err, EngineError::NameTooLong { .. }));

        let fits = "x".repeat(CLIENT_NAME_MAX - 4);
        assert!(generate_unique_name(&fits, |_| false).is_ok());
    }
}
