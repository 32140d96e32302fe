//! Playback state reconciliation
//!
//! `StateReconciler` turns graph state results and bus notifications into the
//! client-visible ready/network state, the seeking flag and the live flag.
//! It never touches the graph itself: every handler returns the
//! [`Reaction`]s the backend has to apply.

use log::debug;
use std::sync::Arc;

use super::client::{MediaPlayerClient, NetworkState, ReadyState};
use crate::graph::{NodeState, StateChangeResult, StateSnapshot};

impl ReadyState {
    /// Check if this state transition is valid outside of a reset
    pub fn can_transition_to(&self, target: &ReadyState) -> bool {
        // readiness only grows until the player is reset
        target >= self
    }
}

impl NetworkState {
    /// Check if this state transition is valid outside of a reset
    pub fn can_transition_to(&self, target: &NetworkState) -> bool {
        use NetworkState::*;

        match (self, target) {
            (a, b) if a == b => true,

            (Empty, _) => true,
            (Loading, Loaded | NetworkError) => true,
            (Loaded, NetworkError) => true,

            // NetworkError only leaves through a reset
            _ => false,
        }
    }
}

/// Graph operation requested by the reconciler
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reaction {
    SetState(NodeState),
    /// Issue a seek to this position in seconds
    Seek(f64),
    /// Turn download-ahead buffering on or off
    SetDownload(bool),
}

/// Per-player state
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub paused: bool,
    pub is_live: bool,
    pub seeking: bool,
    /// Latest seek requested while another one was in flight
    pub pending_seek: Option<f64>,
    pub buffering_finished: bool,
    /// Duration last reported to the client, in seconds
    pub last_duration: Option<f64>,
    pub ready_state: ReadyState,
    pub network_state: NetworkState,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            paused: true,
            is_live: false,
            seeking: false,
            pending_seek: None,
            buffering_finished: false,
            last_duration: None,
            ready_state: ReadyState::HaveNothing,
            network_state: NetworkState::Empty,
        }
    }
}

/// What to do with a seek request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekDecision {
    /// Another seek is in flight; this one was queued
    Deferred,
    /// Send it to the graph now
    Issue(f64),
}

pub struct StateReconciler {
    state: PlayerState,
    client: Arc<dyn MediaPlayerClient>,
}

impl StateReconciler {
    pub fn new(client: Arc<dyn MediaPlayerClient>) -> Self {
        Self {
            state: PlayerState::default(),
            client,
        }
    }

    pub fn state(&self) -> &PlayerState {
        &self.state
    }

    pub fn client(&self) -> &Arc<dyn MediaPlayerClient> {
        &self.client
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.state.paused = paused;
    }

    pub fn set_live(&mut self, live: bool) {
        self.state.is_live = live;
    }

    /// Apply a ready state, notifying only on change.
    ///
    /// Backward moves are refused unless `reset` is set.
    pub fn set_ready_state(&mut self, target: ReadyState, reset: bool) -> bool {
        let current = self.state.ready_state;
        if current == target {
            return false;
        }
        if !reset && !current.can_transition_to(&target) {
            debug!("StateReconciler: ignoring ready state {} -> {}", current, target);
            return false;
        }
        self.state.ready_state = target;
        self.client.ready_state_changed(target);
        true
    }

    /// Apply a network state, notifying only on change.
    pub fn set_network_state(&mut self, target: NetworkState, reset: bool) -> bool {
        let current = self.state.network_state;
        if current == target {
            return false;
        }
        if !reset && !current.can_transition_to(&target) {
            debug!(
                "StateReconciler: ignoring network state {} -> {}",
                current, target
            );
            return false;
        }
        self.state.network_state = target;
        self.client.network_state_changed(target);
        true
    }

    /// Start over for a new resource.
    pub fn reset_for_load(&mut self) {
        self.state.seeking = false;
        self.state.pending_seek = None;
        self.state.buffering_finished = false;
        self.state.last_duration = None;
        self.state.is_live = false;
        self.set_ready_state(ReadyState::HaveNothing, true);
        self.set_network_state(NetworkState::Loading, true);
    }

    /// Surface a durable failure. The ready state is left where it is.
    pub fn fail(&mut self) {
        self.state.seeking = false;
        self.state.pending_seek = None;
        self.set_network_state(NetworkState::NetworkError, false);
    }

    /// Reconcile the result of a bounded state query.
    pub fn on_state(&mut self, snapshot: StateSnapshot) -> Vec<Reaction> {
        let mut reactions = Vec::new();

        match snapshot.result {
            StateChangeResult::Success => {
                self.state.is_live = false;
                match snapshot.current {
                    // dropping to READY after an error must not hide it
                    NodeState::Ready
                        if self.state.network_state == NetworkState::NetworkError => {}
                    NodeState::Ready => {
                        self.set_ready_state(ReadyState::HaveMetadata, true);
                        self.set_network_state(NetworkState::Empty, true);
                    }
                    NodeState::Paused | NodeState::Playing => {
                        if self.state.seeking {
                            self.state.seeking = false;
                            self.client.current_time_changed();
                        }

                        if self.state.buffering_finished {
                            self.set_ready_state(ReadyState::HaveEnoughData, false);
                            self.set_network_state(NetworkState::Loaded, false);
                        } else {
                            self.set_ready_state(ReadyState::HaveCurrentData, false);
                            self.set_network_state(NetworkState::Loading, false);
                        }

                        if let Some(time) = self.state.pending_seek.take() {
                            reactions.push(Reaction::Seek(time));
                        }
                    }
                    NodeState::Null => {}
                }
            }
            StateChangeResult::NoPreroll => {
                self.state.is_live = true;
                reactions.push(Reaction::SetDownload(false));

                if snapshot.current == NodeState::Paused {
                    self.set_ready_state(ReadyState::HaveEnoughData, false);
                    self.set_network_state(NetworkState::Loading, false);
                }
            }
            StateChangeResult::Async => {
                debug!(
                    "StateReconciler: state change to {:?} still pending",
                    snapshot.pending
                );
            }
            StateChangeResult::Failure => {
                debug!("StateReconciler: state change failed");
            }
        }

        reactions
    }

    /// `duration` is the graph's answer to a duration query, in seconds.
    pub fn on_buffering(&mut self, percent: u8, duration: Option<f64>) -> Vec<Reaction> {
        if self.state.is_live {
            return Vec::new();
        }
        if percent < 100 {
            return vec![Reaction::SetState(NodeState::Paused)];
        }

        // the duration is known once buffering completes
        self.set_duration(duration);
        self.state.buffering_finished = true;
        if self.state.paused {
            Vec::new()
        } else {
            vec![Reaction::SetState(NodeState::Playing)]
        }
    }

    pub fn on_end_of_stream(&mut self) -> Vec<Reaction> {
        vec![Reaction::SetState(NodeState::Ready)]
    }

    pub fn on_error(&mut self) -> Vec<Reaction> {
        self.fail();
        vec![Reaction::SetState(NodeState::Ready)]
    }

    pub fn on_clock_lost(&mut self) -> Vec<Reaction> {
        if self.state.paused {
            return Vec::new();
        }
        vec![
            Reaction::SetState(NodeState::Paused),
            Reaction::SetState(NodeState::Playing),
        ]
    }

    pub fn on_duration_changed(&mut self, duration: Option<f64>) -> bool {
        self.set_duration(duration)
    }

    /// Record the duration, notifying only when it differs from the last one.
    fn set_duration(&mut self, duration: Option<f64>) -> bool {
        if duration.is_none() || self.state.last_duration == duration {
            return false;
        }
        debug!(
            "StateReconciler: duration {:?} -> {:?}",
            self.state.last_duration, duration
        );
        self.state.last_duration = duration;
        self.client.duration_changed();
        true
    }

    pub fn request_seek(&mut self, time: f64) -> SeekDecision {
        if self.state.seeking {
            self.state.pending_seek = Some(time);
            return SeekDecision::Deferred;
        }
        SeekDecision::Issue(time)
    }

    /// The graph accepted a seek.
    pub fn seek_started(&mut self) {
        self.state.seeking = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::client::{ClientEvent, RecordingClient};

    fn reconciler() -> (StateReconciler, Arc<RecordingClient>) {
        let client = Arc::new(RecordingClient::new());
        (StateReconciler::new(client.clone()), client)
    }

    fn success(current: NodeState) -> StateSnapshot {
        StateSnapshot {
            result: StateChangeResult::Success,
            current,
            pending: None,
        }
    }

    #[test]
    fn test_valid_transitions() {
        use NetworkState::*;

        assert!(ReadyState::HaveNothing.can_transition_to(&ReadyState::HaveMetadata));
        assert!(ReadyState::HaveMetadata.can_transition_to(&ReadyState::HaveEnoughData));
        assert!(Empty.can_transition_to(&Loading));
        assert!(Loading.can_transition_to(&Loaded));
        assert!(Loading.can_transition_to(&NetworkError));

        // Self-transitions
        assert!(Loaded.can_transition_to(&Loaded));
    }

    #[test]
    fn test_invalid_transitions() {
        use NetworkState::*;

        assert!(!ReadyState::HaveEnoughData.can_transition_to(&ReadyState::HaveCurrentData));
        assert!(!Loaded.can_transition_to(&Loading));
        assert!(!NetworkError.can_transition_to(&Loading));
        assert!(!Loading.can_transition_to(&Empty));
    }

    #[test]
    fn test_notify_on_change_only() {
        let (mut r, client) = reconciler();
        r.on_state(success(NodeState::Paused));
        r.on_state(success(NodeState::Paused));

        assert_eq!(client.count(ClientEvent::ReadyState(ReadyState::HaveCurrentData)), 1);
        assert_eq!(client.count(ClientEvent::NetworkState(NetworkState::Loading)), 1);
        assert_eq!(client.events().len(), 2);
    }

    #[test]
    fn test_ready_resets_after_playback() {
        let (mut r, client) = reconciler();
        r.on_buffering(100, Some(60.0));
        r.on_state(success(NodeState::Playing));
        assert_eq!(r.state().ready_state, ReadyState::HaveEnoughData);

        r.on_state(success(NodeState::Ready));
        assert_eq!(client.last_ready_state(), Some(ReadyState::HaveMetadata));
        assert_eq!(client.last_network_state(), Some(NetworkState::Empty));
    }

    #[test]
    fn test_no_backward_move_without_reset() {
        let (mut r, client) = reconciler();
        r.on_buffering(100, None);
        r.on_state(success(NodeState::Paused));
        client.take();

        // a live preroll result cannot lower Loaded back to Loading
        let reactions = r.on_state(StateSnapshot {
            result: StateChangeResult::NoPreroll,
            current: NodeState::Paused,
            pending: None,
        });
        assert_eq!(reactions, vec![Reaction::SetDownload(false)]);
        assert!(r.state().is_live);
        assert!(client.events().is_empty());
        assert_eq!(r.state().network_state, NetworkState::Loaded);
    }

    #[test]
    fn test_buffering_pauses_until_complete() {
        let (mut r, client) = reconciler();
        r.set_paused(false);

        assert_eq!(r.on_buffering(10, None), vec![Reaction::SetState(NodeState::Paused)]);
        assert_eq!(r.on_buffering(55, None), vec![Reaction::SetState(NodeState::Paused)]);
        assert_eq!(client.count(ClientEvent::DurationChanged), 0);

        assert_eq!(
            r.on_buffering(100, Some(90.0)),
            vec![Reaction::SetState(NodeState::Playing)]
        );
        assert_eq!(client.count(ClientEvent::DurationChanged), 1);
        assert!(r.state().buffering_finished);
    }

    #[test]
    fn test_duration_notifies_on_change_only() {
        let (mut r, client) = reconciler();
        r.on_buffering(100, Some(90.0));
        r.on_buffering(100, Some(90.0));
        assert!(!r.on_duration_changed(Some(90.0)));
        assert_eq!(client.count(ClientEvent::DurationChanged), 1);

        // an unknown duration is not a change
        assert!(!r.on_duration_changed(None));
        assert!(r.on_duration_changed(Some(120.0)));
        assert_eq!(client.count(ClientEvent::DurationChanged), 2);

        // a new resource reports its duration again
        r.reset_for_load();
        assert!(r.on_duration_changed(Some(120.0)));
        assert_eq!(client.count(ClientEvent::DurationChanged), 3);
    }

    #[test]
    fn test_live_ignores_buffering() {
        let (mut r, _client) = reconciler();
        r.set_live(true);
        assert!(r.on_buffering(10, None).is_empty());
        assert!(!r.state().buffering_finished);
    }

    #[test]
    fn test_seek_coalescing() {
        let (mut r, client) = reconciler();
        assert_eq!(r.request_seek(5.0), SeekDecision::Issue(5.0));
        r.seek_started();

        assert_eq!(r.request_seek(6.0), SeekDecision::Deferred);
        assert_eq!(r.request_seek(8.0), SeekDecision::Deferred);
        assert_eq!(r.state().pending_seek, Some(8.0));

        let reactions = r.on_state(success(NodeState::Paused));
        assert_eq!(reactions, vec![Reaction::Seek(8.0)]);
        assert!(!r.state().seeking);
        assert_eq!(client.count(ClientEvent::CurrentTimeChanged), 1);
    }

    #[test]
    fn test_error_keeps_ready_state() {
        let (mut r, client) = reconciler();
        r.reset_for_load();
        r.on_state(success(NodeState::Paused));

        let reactions = r.on_error();
        assert_eq!(reactions, vec![Reaction::SetState(NodeState::Ready)]);
        assert_eq!(client.last_network_state(), Some(NetworkState::NetworkError));
        assert_eq!(r.state().ready_state, ReadyState::HaveCurrentData);

        // the READY transition that follows leaves both states alone
        r.on_state(success(NodeState::Ready));
        assert_eq!(r.state().network_state, NetworkState::NetworkError);
        assert_eq!(r.state().ready_state, ReadyState::HaveCurrentData);
    }

    #[test]
    fn test_clock_lost_cycles_when_playing() {
        let (mut r, _client) = reconciler();
        assert!(r.on_clock_lost().is_empty());
        r.set_paused(false);
        assert_eq!(
            r.on_clock_lost(),
            vec![
                Reaction::SetState(NodeState::Paused),
                Reaction::SetState(NodeState::Playing)
            ]
        );
    }
}
