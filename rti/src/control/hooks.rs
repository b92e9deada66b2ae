//! Application hooks invoked by runtime-control transitions

use crate::proto::{LoadScenario, RuntimeState, TimeSync};

/// Result of handling a scenario load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Loaded; the state becomes READY, or PLAYBACK when loading during playback
    Accept,
    /// Refused; the state becomes UNKNOWN
    Reject,
    /// Loaded, with the application choosing the resulting state
    State(RuntimeState),
}

/// Callbacks for runtime-control transitions
///
/// Every method defaults to a no-op (loads are accepted). Hooks run on the
/// context that applied the transition, which is the transport I/O context
/// for messages received from the bus.
pub trait RuntimeControlHooks: Send + Sync {
    fn on_reset(&self) {}

    /// `playback` is true when the load started from the PLAYBACK state
    fn on_load_scenario(&self, _scenario: &LoadScenario, _playback: bool) -> LoadOutcome {
        LoadOutcome::Accept
    }

    fn on_start(&self) {}

    fn on_play(&self) {}

    /// Fires for every pause, including from terminal states
    fn on_pause(&self) {}

    fn on_end(&self) {}

    fn on_stop(&self) {}

    /// Cleanup before `on_end` and `on_stop`
    fn on_end_stop(&self) {}

    /// Cleanup before `on_reset`, `on_end` and `on_stop`
    fn on_reset_end_stop(&self) {}

    fn on_time_scale(&self, _time_scale: f64) {}

    fn on_time_sync(&self, _time_sync: &TimeSync) {}

    fn on_seek(&self, _time: f64) {}
}

/// Hooks that accept everything and do nothing else
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl RuntimeControlHooks for NoHooks {}
