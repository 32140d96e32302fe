//! Client callback surface of a media player

use parking_lot::Mutex;

/// How much of the media is available for playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReadyState {
    HaveNothing,
    HaveMetadata,
    HaveCurrentData,
    HaveEnoughData,
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ReadyState::HaveNothing => "HaveNothing",
            ReadyState::HaveMetadata => "HaveMetadata",
            ReadyState::HaveCurrentData => "HaveCurrentData",
            ReadyState::HaveEnoughData => "HaveEnoughData",
        };
        write!(f, "{}", name)
    }
}

/// Resource loading status, independent of [`ReadyState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkState {
    Empty,
    Loading,
    Loaded,
    NetworkError,
}

impl std::fmt::Display for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NetworkState::Empty => "Empty",
            NetworkState::Loading => "Loading",
            NetworkState::Loaded => "Loaded",
            NetworkState::NetworkError => "NetworkError",
        };
        write!(f, "{}", name)
    }
}

/// Receives player notifications. Every call reports an actual change.
pub trait MediaPlayerClient: Send + Sync {
    fn ready_state_changed(&self, state: ReadyState);
    fn network_state_changed(&self, state: NetworkState);
    fn duration_changed(&self);
    fn current_time_changed(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    ReadyState(ReadyState),
    NetworkState(NetworkState),
    DurationChanged,
    CurrentTimeChanged,
}

impl std::fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientEvent::ReadyState(s) => write!(f, "readyState -> {}", s),
            ClientEvent::NetworkState(s) => write!(f, "networkState -> {}", s),
            ClientEvent::DurationChanged => write!(f, "durationChanged"),
            ClientEvent::CurrentTimeChanged => write!(f, "currentTimeChanged"),
        }
    }
}

/// Client that keeps every notification it receives
#[derive(Default)]
pub struct RecordingClient {
    events: Mutex<Vec<ClientEvent>>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().clone()
    }

    pub fn take(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn count(&self, event: ClientEvent) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }

    pub fn last_ready_state(&self) -> Option<ReadyState> {
        self.events.lock().iter().rev().find_map(|e| match e {
            ClientEvent::ReadyState(s) => Some(*s),
            _ => None,
        })
    }

    pub fn last_network_state(&self) -> Option<NetworkState> {
        self.events.lock().iter().rev().find_map(|e| match e {
            ClientEvent::NetworkState(s) => Some(*s),
            _ => None,
        })
    }
}

impl MediaPlayerClient for RecordingClient {
    fn ready_state_changed(&self, state: ReadyState) {
        self.events.lock().push(ClientEvent::ReadyState(state));
    }

    fn network_state_changed(&self, state: NetworkState) {
        self.events.lock().push(ClientEvent::NetworkState(state));
    }

    fn duration_changed(&self) {
        self.events.lock().push(ClientEvent::DurationChanged);
    }

    fn current_time_changed(&self) {
        self.events.lock().push(ClientEvent::CurrentTimeChanged);
    }
}
