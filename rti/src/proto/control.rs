//! Runtime-control transitions and lifecycle states (`rti/control`)

use std::collections::HashMap;

/// Lifecycle state of a client
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RuntimeState {
    Unknown = 0,
    Initial = 1,
    Loading = 2,
    Ready = 3,
    Running = 4,
    Paused = 5,
    Playback = 6,
    PlaybackPaused = 7,
    End = 8,
    PlaybackEnd = 9,
    Stopped = 10,
    PlaybackStopped = 11,
}

impl RuntimeState {
    pub fn as_str_name(&self) -> &'static str {
        match self {
            RuntimeState::Unknown => "UNKNOWN",
            RuntimeState::Initial => "INITIAL",
            RuntimeState::Loading => "LOADING",
            RuntimeState::Ready => "READY",
            RuntimeState::Running => "RUNNING",
            RuntimeState::Paused => "PAUSED",
            RuntimeState::Playback => "PLAYBACK",
            RuntimeState::PlaybackPaused => "PLAYBACK_PAUSED",
            RuntimeState::End => "END",
            RuntimeState::PlaybackEnd => "PLAYBACK_END",
            RuntimeState::Stopped => "STOPPED",
            RuntimeState::PlaybackStopped => "PLAYBACK_STOPPED",
        }
    }

    /// END, PLAYBACK_END, STOPPED or PLAYBACK_STOPPED
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeState::End | RuntimeState::PlaybackEnd | RuntimeState::Stopped | RuntimeState::PlaybackStopped
        )
    }

    /// PLAYBACK and every state derived from it
    pub fn is_playback_family(&self) -> bool {
        matches!(
            self,
            RuntimeState::Playback
                | RuntimeState::PlaybackPaused
                | RuntimeState::PlaybackEnd
                | RuntimeState::PlaybackStopped
        )
    }
}

impl std::fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str_name())
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LoadScenario {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(map = "string, string", tag = "2")]
    pub parameter_values: HashMap<String, String>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SetTimeScale {
    #[prost(double, tag = "1")]
    pub time_scale: f64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct TimeSync {
    #[prost(double, tag = "1")]
    pub time: f64,
    #[prost(double, tag = "2")]
    pub time_scale: f64,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Seek {
    #[prost(double, tag = "1")]
    pub time: f64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CurrentLog {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuntimeError {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(enumeration = "RuntimeState", optional, tag = "3")]
    pub state: Option<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RuntimeControl {
    #[prost(
        oneof = "runtime_control::Which",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15"
    )]
    pub which: Option<runtime_control::Which>,
}

pub mod runtime_control {
    use super::super::Empty;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Which {
        #[prost(message, tag = "1")]
        Reset(Empty),
        #[prost(message, tag = "2")]
        LoadScenario(super::LoadScenario),
        #[prost(message, tag = "3")]
        Start(Empty),
        #[prost(message, tag = "4")]
        Play(Empty),
        #[prost(message, tag = "5")]
        Pause(Empty),
        #[prost(message, tag = "6")]
        End(Empty),
        #[prost(message, tag = "7")]
        Stop(Empty),
        #[prost(message, tag = "8")]
        SetTimeScale(super::SetTimeScale),
        #[prost(message, tag = "9")]
        TimeSync(super::TimeSync),
        #[prost(message, tag = "10")]
        Seek(super::Seek),
        #[prost(message, tag = "11")]
        RequestCurrentScenario(Empty),
        #[prost(message, tag = "12")]
        CurrentScenario(super::LoadScenario),
        #[prost(message, tag = "13")]
        RequestCurrentLog(Empty),
        #[prost(message, tag = "14")]
        CurrentLog(super::CurrentLog),
        #[prost(message, tag = "15")]
        Error(super::RuntimeError),
    }
}

impl RuntimeControl {
    pub fn of(which: runtime_control::Which) -> Self {
        Self { which: Some(which) }
    }
}
