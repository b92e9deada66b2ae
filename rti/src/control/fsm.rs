//! Lifecycle state machine driven by the control channel

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::hooks::{LoadOutcome, RuntimeControlHooks};
use crate::client::RtiClient;
use crate::constants::{capability, channel};
use crate::error::{RtiError, RtiResult};
use crate::proto::{
    CurrentLog, Empty, LoadScenario, RuntimeControl, RuntimeState, Seek, SetTimeScale, runtime_control,
};

/// Interval between directory checks while waiting for peer states
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Default)]
struct ControlData {
    scenario: Option<LoadScenario>,
    time_scale: Option<f64>,
    current_log: Option<CurrentLog>,
}

/// State shared between the controller and its channel handlers
struct ControlShared {
    hooks: Arc<dyn RuntimeControlHooks>,
    data: Mutex<ControlData>,
    subscribed: AtomicBool,
    publish_scenario: AtomicBool,
}

impl ControlShared {
    /// Apply one control message to the client's lifecycle state
    fn receive(&self, client: &RtiClient, message: &RuntimeControl) {
        use runtime_control::Which;

        let Some(which) = &message.which else {
            return;
        };
        let hooks = &self.hooks;
        let state = client.state();
        debug!(%state, ?which, "ControlShared::receive: called");

        match which {
            Which::Reset(_) => {
                hooks.on_reset_end_stop();
                hooks.on_reset();
                client.set_state(RuntimeState::Initial);
            }
            Which::LoadScenario(load) => {
                self.data.lock().scenario = None;
                let playback = state == RuntimeState::Playback;
                client.set_state(RuntimeState::Loading);
                match hooks.on_load_scenario(load, playback) {
                    LoadOutcome::Reject => {
                        warn!(scenario = %load.name, "Scenario load rejected");
                        client.set_state(RuntimeState::Unknown);
                    }
                    LoadOutcome::State(target) => {
                        self.data.lock().scenario = Some(load.clone());
                        client.set_state(target);
                    }
                    LoadOutcome::Accept => {
                        self.data.lock().scenario = Some(load.clone());
                        client.set_state(if playback {
                            RuntimeState::Playback
                        } else {
                            RuntimeState::Ready
                        });
                    }
                }
            }
            Which::RequestCurrentScenario(_) => {
                if !self.publish_scenario.load(Ordering::SeqCst) {
                    return;
                }
                let scenario = self.data.lock().scenario.clone();
                if let Some(scenario) = scenario {
                    let answer = RuntimeControl::of(Which::CurrentScenario(scenario));
                    if let Err(e) = client.publish(channel::CONTROL, &answer) {
                        warn!(error = %e, "Failed to publish current scenario");
                    }
                }
            }
            Which::Start(_) => {
                hooks.on_start();
                client.set_state(RuntimeState::Running);
            }
            Which::Play(_) => {
                hooks.on_play();
                client.set_state(RuntimeState::Playback);
            }
            Which::Pause(_) => {
                hooks.on_pause();
                if matches!(state, RuntimeState::Playback | RuntimeState::PlaybackPaused) {
                    client.set_state(RuntimeState::PlaybackPaused);
                } else if !state.is_terminal() {
                    client.set_state(RuntimeState::Paused);
                }
            }
            Which::End(_) => {
                hooks.on_reset_end_stop();
                hooks.on_end_stop();
                hooks.on_end();
                client.set_state(if state == RuntimeState::Playback {
                    RuntimeState::PlaybackEnd
                } else {
                    RuntimeState::End
                });
            }
            Which::Stop(_) => {
                hooks.on_reset_end_stop();
                hooks.on_end_stop();
                hooks.on_stop();
                client.set_state(if state.is_playback_family() {
                    RuntimeState::PlaybackStopped
                } else {
                    RuntimeState::Stopped
                });
            }
            Which::SetTimeScale(scale) => {
                self.data.lock().time_scale = Some(scale.time_scale);
                hooks.on_time_scale(scale.time_scale);
            }
            Which::TimeSync(sync) => {
                self.data.lock().time_scale = Some(sync.time_scale);
                hooks.on_time_sync(sync);
            }
            Which::Seek(seek) => hooks.on_seek(seek.time),
            Which::CurrentLog(log) => self.data.lock().current_log = Some(log.clone()),
            Which::CurrentScenario(scenario) => self.data.lock().scenario = Some(scenario.clone()),
            Which::RequestCurrentLog(_) => {}
            Which::Error(error) => {
                debug!(client_id = %error.client_id, message = %error.message, "Peer reported runtime error");
            }
        }
    }
}

/// Runtime-control state machine bound to one client
///
/// While the client is connected and the machine is subscribed, actions are
/// only published and take effect when the broker delivers them back.
/// Otherwise they are applied to the local state before returning.
pub struct RuntimeControlFsm {
    client: RtiClient,
    shared: Arc<ControlShared>,
}

impl RuntimeControlFsm {
    /// Attach to `client` and subscribe the shared and private control channels
    pub fn new(client: &RtiClient, hooks: Arc<dyn RuntimeControlHooks>) -> Self {
        let fsm = Self::detached(client, hooks);
        fsm.subscribe();
        fsm
    }

    /// Attach without subscribing; every action applies locally
    pub fn detached(client: &RtiClient, hooks: Arc<dyn RuntimeControlHooks>) -> Self {
        debug!(client_id = %client.client_id(), "RuntimeControlFsm::new: called");
        for tag in [capability::RUNTIME_CONTROL, capability::SCENARIO, capability::TIME_SCALE] {
            client.add_capability(tag);
        }
        client.set_state(RuntimeState::Initial);
        Self {
            client: client.clone(),
            shared: Arc::new(ControlShared {
                hooks,
                data: Mutex::new(ControlData::default()),
                subscribed: AtomicBool::new(false),
                publish_scenario: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe the control channels; repeated calls are no-ops
    pub fn subscribe(&self) {
        if self.shared.subscribed.swap(true, Ordering::SeqCst) {
            return;
        }
        let private = format!("{}{}", self.client.own_channel_prefix(), channel::CONTROL);
        for name in [channel::CONTROL.to_string(), private] {
            let shared = self.shared.clone();
            let weak = Arc::downgrade(&self.client.inner);
            self.client.subscribe(&name, move |_, message: RuntimeControl| {
                if let Some(inner) = weak.upgrade() {
                    shared.receive(&RtiClient { inner }, &message);
                }
                Ok(())
            });
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.subscribed.load(Ordering::SeqCst)
    }

    pub fn client(&self) -> &RtiClient {
        &self.client
    }

    pub fn state(&self) -> RuntimeState {
        self.client.state()
    }

    /// Answer scenario requests with the loaded scenario
    pub fn set_publish_scenario(&self, enabled: bool) {
        self.shared.publish_scenario.store(enabled, Ordering::SeqCst);
    }

    pub fn scenario(&self) -> Option<LoadScenario> {
        self.shared.data.lock().scenario.clone()
    }

    /// Last time scale seen in a set-time-scale or time-sync message
    pub fn time_scale(&self) -> Option<f64> {
        self.shared.data.lock().time_scale
    }

    pub fn current_log(&self) -> Option<CurrentLog> {
        self.shared.data.lock().current_log.clone()
    }

    // === Actions ===

    pub fn reset(&self) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::Reset(Empty {}))
    }

    pub fn load_scenario(&self, name: &str, parameters: HashMap<String, String>) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::LoadScenario(LoadScenario {
            name: name.to_string(),
            parameter_values: parameters,
        }))
    }

    pub fn start(&self) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::Start(Empty {}))
    }

    pub fn play(&self) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::Play(Empty {}))
    }

    pub fn pause(&self) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::Pause(Empty {}))
    }

    pub fn end(&self) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::End(Empty {}))
    }

    pub fn stop(&self) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::Stop(Empty {}))
    }

    pub fn set_time_scale(&self, time_scale: f64) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::SetTimeScale(SetTimeScale { time_scale }))
    }

    pub fn seek(&self, time: f64) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::Seek(Seek { time }))
    }

    pub fn request_current_log(&self) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::RequestCurrentLog(Empty {}))
    }

    pub fn request_current_scenario(&self) -> RtiResult<()> {
        self.dispatch(runtime_control::Which::RequestCurrentScenario(Empty {}))
    }

    /// Publish an action and apply it locally unless the bus will deliver it back
    fn dispatch(&self, which: runtime_control::Which) -> RtiResult<()> {
        let message = RuntimeControl::of(which);
        let published = self.client.publish(channel::CONTROL, &message);
        if self.client.is_connected() && self.is_subscribed() {
            return published;
        }
        if let Err(e) = published {
            debug!(error = %e, "RuntimeControlFsm::dispatch: publish skipped, applying locally");
        }
        self.shared.receive(&self.client, &message);
        Ok(())
    }

    // === Waiting on peers ===

    /// Wait until every known client of `application` is in one of `states`
    ///
    /// At least one such client must be known.
    pub async fn wait_for_application_state(
        &self,
        application: &str,
        states: &[RuntimeState],
        timeout: Duration,
    ) -> RtiResult<()> {
        self.require_subscribed("application state")?;
        debug!(%application, ?states, ?timeout, "RuntimeControlFsm::wait_for_application_state: called");
        if self.client.clients_by_application(application).is_empty() {
            self.request_clients();
        }
        let reached = poll_until(timeout, || {
            let clients = self.client.clients_by_application(application);
            !clients.is_empty() && clients.iter().all(|c| states.contains(&c.state()))
        })
        .await;
        if !reached {
            return Err(RtiError::Timeout(format!("waiting for {} state {:?}", application, states)));
        }
        info!(%application, "Application reached requested state");
        Ok(())
    }

    /// Wait until the client `client_id` is in one of `states`
    pub async fn wait_for_client_state(
        &self,
        client_id: &str,
        states: &[RuntimeState],
        timeout: Duration,
    ) -> RtiResult<()> {
        self.require_subscribed("client state")?;
        debug!(%client_id, ?states, ?timeout, "RuntimeControlFsm::wait_for_client_state: called");
        if !self.client.known_clients().contains_key(client_id) {
            self.request_clients();
        }
        let reached = poll_until(timeout, || {
            self.client
                .known_clients()
                .get(client_id)
                .is_some_and(|c| states.contains(&c.state()))
        })
        .await;
        if reached {
            Ok(())
        } else {
            Err(RtiError::Timeout(format!("waiting for client {} state {:?}", client_id, states)))
        }
    }

    fn require_subscribed(&self, what: &str) -> RtiResult<()> {
        if self.is_subscribed() {
            Ok(())
        } else {
            Err(RtiError::Precondition(format!(
                "cannot wait for {} without subscribing to control",
                what
            )))
        }
    }

    fn request_clients(&self) {
        if let Err(e) = self.client.request_clients() {
            debug!(error = %e, "RuntimeControlFsm: client enumeration request failed");
        }
    }
}

/// Check `done` every poll interval until it holds or `timeout` passes
async fn poll_until<F: Fn() -> bool>(timeout: Duration, done: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(STATE_POLL_INTERVAL).await;
    }
}
