//! Playback backend
//!
//! `PlaybackBackend` drives one sink variant (URI playback through a
//! `playbin`, or a capture stream fed by the shared pipeline) and keeps the
//! client informed through the [`StateReconciler`].
//!
//! Bus messages are delivered on the graph's streaming thread. The backend
//! only queues them there; [`PlaybackBackend::dispatch_bus_messages`] handles
//! them on the control thread.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::client::{MediaPlayerClient, NetworkState, ReadyState};
use super::state::{Reaction, SeekDecision, StateReconciler};
use super::stream::StreamSink;
use super::uri::UriSink;
use crate::capture::MediaStream;
use crate::config::PlayerConfig;
use crate::error::PlayerError;
use crate::graph::{
    BusMessage, MediaGraph, MessageKind, NodeId, NodeState, PropertyValue, SeekFlags,
    SeekRequest, WatchId,
};
use crate::hub::SharedPipeline;

/// Which sink variant a backend builds
#[derive(Clone)]
pub enum BackendKind {
    Uri,
    Stream(Arc<SharedPipeline>),
}

/// What a backend can be asked to play
#[derive(Debug, Clone)]
pub enum MediaResource {
    Uri(String),
    Stream(MediaStream),
}

enum Variant {
    Uri(UriSink),
    Stream(StreamSink),
}

impl Variant {
    fn node(&self) -> NodeId {
        match self {
            Variant::Uri(sink) => sink.node(),
            Variant::Stream(sink) => sink.node(),
        }
    }
}

/// Seconds plus microseconds rounded to 10 ms
pub fn quantize_seek(time: f64) -> Duration {
    let time = if time.is_finite() { time.max(0.0) } else { 0.0 };
    let seconds = time.trunc();
    let micros = ((time - seconds) * 1_000_000.0 / 10_000.0).round() * 10_000.0;
    Duration::from_secs(seconds as u64) + Duration::from_micros(micros as u64)
}

pub struct PlaybackBackend {
    graph: Arc<dyn MediaGraph>,
    kind: BackendKind,
    config: PlayerConfig,
    variant: Option<Variant>,
    reconciler: StateReconciler,
    stream: Option<MediaStream>,
    /// Stream variant: not attached to any source
    stopped: bool,
    bus_tx: mpsc::UnboundedSender<BusMessage>,
    bus_rx: mpsc::UnboundedReceiver<BusMessage>,
    watch: Option<(NodeId, WatchId)>,
    rate: f64,
    volume: f64,
    muted: bool,
}

impl PlaybackBackend {
    pub fn new(
        graph: Arc<dyn MediaGraph>,
        kind: BackendKind,
        config: PlayerConfig,
        client: Arc<dyn MediaPlayerClient>,
    ) -> Self {
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let volume = config.initial_volume;
        Self {
            graph,
            kind,
            config,
            variant: None,
            reconciler: StateReconciler::new(client),
            stream: None,
            stopped: true,
            bus_tx,
            bus_rx,
            watch: None,
            rate: 1.0,
            volume,
            muted: false,
        }
    }

    /// Backend for a capture stream, attached through `hub`.
    pub fn for_stream(
        hub: Arc<SharedPipeline>,
        config: PlayerConfig,
        client: Arc<dyn MediaPlayerClient>,
    ) -> Self {
        let graph = Arc::clone(hub.graph());
        Self::new(graph, BackendKind::Stream(hub), config, client)
    }

    /// Node the backend controls, once its sink exists
    pub fn node(&self) -> Option<NodeId> {
        self.variant.as_ref().map(Variant::node)
    }

    pub fn create_sink(&mut self) -> Result<(), PlayerError> {
        if self.variant.is_some() {
            return Ok(());
        }
        let variant = match &self.kind {
            BackendKind::Uri => Variant::Uri(UriSink::build(self.graph.as_ref())?),
            BackendKind::Stream(hub) => Variant::Stream(StreamSink::build(Arc::clone(hub))?),
        };

        if let Variant::Uri(sink) = &variant {
            let tx = self.bus_tx.clone();
            let node = sink.node();
            // a closed receiver means the backend is going away
            self.watch = self
                .graph
                .watch_bus(
                    node,
                    Box::new(move |message| {
                        let _ = tx.send(message.clone());
                    }),
                )
                .map(|watch| (node, watch));
        }

        debug!("PlaybackBackend: sink {} created", variant.node());
        self.variant = Some(variant);
        self.apply_volume();
        Ok(())
    }

    pub fn destroy_sink(&mut self) {
        if let Some((node, watch)) = self.watch.take() {
            self.graph.unwatch_bus(node, watch);
        }
        match self.variant.take() {
            Some(Variant::Uri(sink)) => sink.destroy(self.graph.as_ref()),
            Some(Variant::Stream(sink)) => sink.destroy(),
            None => return,
        }
        self.stopped = true;
        while self.bus_rx.try_recv().is_ok() {}
        debug!("PlaybackBackend: sink destroyed");
    }

    pub fn load(&mut self, resource: MediaResource) -> Result<(), PlayerError> {
        if let Err(e) = self.create_sink() {
            // could be a decode error as well, a network error is enough
            warn!("PlaybackBackend: cannot create sink: {}", e);
            self.reconciler.fail();
            return Err(e);
        }

        match resource {
            MediaResource::Uri(uri) => {
                let Some(Variant::Uri(sink)) = self.variant.as_ref() else {
                    return Err(PlayerError::UnsupportedResource("uri"));
                };
                info!("PlaybackBackend: loading '{}'", uri);
                self.reconciler.reset_for_load();
                sink.load(self.graph.as_ref(), &uri);
                self.apply_download(true);
                Ok(())
            }
            MediaResource::Stream(stream) => {
                if !matches!(self.variant, Some(Variant::Stream(_))) {
                    return Err(PlayerError::UnsupportedResource("stream"));
                }
                info!(
                    "PlaybackBackend: loading stream '{}' ({} source(s))",
                    stream.id,
                    stream.sources.len()
                );
                self.stream = Some(stream);
                self.reconciler.reset_for_load();
                self.stop();
                self.internal_load()
            }
        }
    }

    /// Attach to the stream's sources unless already attached.
    fn internal_load(&mut self) -> Result<(), PlayerError> {
        if !self.stopped {
            return Ok(());
        }
        let Some(stream) = self.stream.as_ref() else {
            self.reconciler.fail();
            return Err(PlayerError::NoStream);
        };
        let Some(Variant::Stream(sink)) = self.variant.as_mut() else {
            return Err(PlayerError::NoSink);
        };

        if sink.attach_stream(stream) == 0 {
            warn!("PlaybackBackend: no source of '{}' could be attached", stream.id);
            let id = stream.id.clone();
            self.reconciler.fail();
            return Err(PlayerError::Attach(id));
        }
        self.stopped = false;

        // capture is live: it never prerolls and has nothing to download
        self.reconciler.set_live(true);
        self.reconciler
            .set_ready_state(ReadyState::HaveEnoughData, false);
        self.reconciler
            .set_network_state(NetworkState::Loading, false);
        Ok(())
    }

    /// Detach the stream variant from every source.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Some(Variant::Stream(sink)) = self.variant.as_mut() {
            let detached = sink.detach_all();
            debug!("PlaybackBackend: stopped, {} source(s) detached", detached);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn play(&mut self) -> Result<(), PlayerError> {
        match self.variant.as_ref() {
            Some(Variant::Uri(sink)) => {
                self.graph.set_state(sink.node(), NodeState::Playing);
                self.reconciler.set_paused(false);
                Ok(())
            }
            Some(Variant::Stream(_)) => {
                if self.stream.is_none() {
                    self.reconciler
                        .set_ready_state(ReadyState::HaveNothing, true);
                    return Err(PlayerError::NoStream);
                }
                self.reconciler.set_paused(false);
                self.internal_load()
            }
            None => Err(PlayerError::NoSink),
        }
    }

    pub fn pause(&mut self) -> Result<(), PlayerError> {
        match self.variant.as_ref() {
            Some(Variant::Uri(sink)) => {
                self.graph.set_state(sink.node(), NodeState::Paused);
                self.reconciler.set_paused(true);
                Ok(())
            }
            Some(Variant::Stream(_)) => {
                self.reconciler.set_paused(true);
                self.stop();
                Ok(())
            }
            None => Err(PlayerError::NoSink),
        }
    }

    pub fn seek(&mut self, time: f64) {
        let Some(Variant::Uri(sink)) = self.variant.as_ref() else {
            debug!("PlaybackBackend: seek ignored, nothing seekable loaded");
            return;
        };
        let node = sink.node();
        match self.reconciler.request_seek(time) {
            SeekDecision::Deferred => {
                debug!("PlaybackBackend: seek to {} queued", time);
            }
            SeekDecision::Issue(time) => self.issue_seek(node, time),
        }
    }

    fn issue_seek(&mut self, node: NodeId, time: f64) {
        let current = self.graph.state(node, Duration::ZERO).current;
        if !current.is_streaming() {
            debug!("PlaybackBackend: seek ignored in {}", current);
            return;
        }
        let request = SeekRequest {
            rate: self.rate,
            position: quantize_seek(time),
            flags: SeekFlags::FLUSH_ACCURATE,
        };
        if self.graph.seek(node, request) {
            self.reconciler.seek_started();
        } else {
            debug!("PlaybackBackend: seek to {:?} rejected", request.position);
        }
    }

    /// Duration in seconds, 0 when unknown
    pub fn duration(&self) -> f64 {
        self.known_duration().unwrap_or(0.0)
    }

    fn known_duration(&self) -> Option<f64> {
        match self.variant.as_ref() {
            Some(Variant::Uri(sink)) => self
                .graph
                .query_duration(sink.node())
                .map(|d| d.as_secs_f64()),
            _ => None,
        }
    }

    /// Position in seconds, 0 when unknown
    pub fn current_time(&self) -> f64 {
        match self.variant.as_ref() {
            Some(Variant::Uri(sink)) => self
                .graph
                .query_position(sink.node())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn max_time_seekable(&self) -> f64 {
        if self.is_live_stream() {
            return f64::INFINITY;
        }
        self.duration()
    }

    pub fn seeking(&self) -> bool {
        self.reconciler.state().seeking
    }

    pub fn set_playback_rate(&mut self, rate: f64) {
        self.rate = rate;
    }

    pub fn set_volume(&mut self, volume: f64) {
        self.volume = volume;
        self.apply_volume();
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        self.apply_volume();
    }

    fn apply_volume(&self) {
        match self.variant.as_ref() {
            Some(Variant::Uri(sink)) => {
                self.graph
                    .set_property(sink.node(), "volume", PropertyValue::Float(self.volume));
                self.graph
                    .set_property(sink.node(), "mute", PropertyValue::Bool(self.muted));
            }
            Some(Variant::Stream(sink)) => {
                sink.set_volume(self.volume);
                sink.set_muted(self.muted);
            }
            None => {}
        }
    }

    pub fn is_live_stream(&self) -> bool {
        self.reconciler.state().is_live
    }

    pub fn is_paused(&self) -> bool {
        self.reconciler.state().paused
    }

    pub fn ready_state(&self) -> ReadyState {
        self.reconciler.state().ready_state
    }

    pub fn network_state(&self) -> NetworkState {
        self.reconciler.state().network_state
    }

    /// Handle every bus message queued so far.
    pub fn dispatch_bus_messages(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.bus_rx.try_recv() {
            self.handle_bus_message(&message);
            handled += 1;
        }
        handled
    }

    pub fn handle_bus_message(&mut self, message: &BusMessage) -> bool {
        let Some(node) = self.node() else {
            return false;
        };
        let reactions = match &message.kind {
            MessageKind::Error { code, text } => {
                warn!(
                    "PlaybackBackend: error from {}: {} (code {})",
                    message.source, text, code
                );
                self.reconciler.on_error()
            }
            MessageKind::EndOfStream => self.reconciler.on_end_of_stream(),
            MessageKind::Buffering(percent) => {
                let duration = self.known_duration();
                self.reconciler.on_buffering(*percent, duration)
            }
            MessageKind::ClockLost => self.reconciler.on_clock_lost(),
            MessageKind::DurationChanged => {
                let duration = self.known_duration();
                self.reconciler.on_duration_changed(duration);
                Vec::new()
            }
            // internal elements forward their changes to the top node
            MessageKind::StateChanged { .. } | MessageKind::AsyncDone => {
                if message.source == node {
                    self.update_states();
                }
                Vec::new()
            }
        };
        self.apply(node, reactions);
        true
    }

    /// Reconcile the client-visible state with the node's state.
    pub fn update_states(&mut self) {
        let Some(node) = self.node() else {
            return;
        };
        let snapshot = self.graph.state(node, self.config.state_query_timeout);
        let reactions = self.reconciler.on_state(snapshot);
        self.apply(node, reactions);
    }

    fn apply(&mut self, node: NodeId, reactions: Vec<Reaction>) {
        for reaction in reactions {
            match reaction {
                Reaction::SetState(state) => {
                    self.graph.set_state(node, state);
                }
                Reaction::Seek(time) => self.seek(time),
                Reaction::SetDownload(enabled) => self.apply_download(enabled),
            }
        }
    }

    fn apply_download(&self, enabled: bool) {
        if let Some(Variant::Uri(sink)) = self.variant.as_ref() {
            let enabled =
                enabled && !self.is_live_stream() && self.config.enable_download_buffering;
            sink.set_download(self.graph.as_ref(), enabled);
        }
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    /// React to a change of the stream's sources: an ended stream stops the
    /// player, a disabled source is detached.
    pub fn source_state_changed(&mut self) {
        let ended = self.stream.as_ref().is_none_or(|s| s.ended);
        if ended {
            self.stop();
        }
        let (Some(stream), Some(Variant::Stream(sink))) =
            (self.stream.as_ref(), self.variant.as_mut())
        else {
            return;
        };
        for id in sink.attached_sources() {
            if stream.source(&id).is_none_or(|s| !s.enabled) {
                info!("PlaybackBackend: source '{}' disabled, detaching", id);
                sink.detach(&id);
            }
        }
    }

    pub fn set_source_enabled(&mut self, source_id: &str, enabled: bool) -> bool {
        let changed = self
            .stream
            .as_mut()
            .is_some_and(|s| s.set_enabled(source_id, enabled));
        if changed {
            self.source_state_changed();
        }
        changed
    }

    pub fn stream_ended(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            stream.end();
        }
        self.source_state_changed();
    }
}

impl Drop for PlaybackBackend {
    fn drop(&mut self) {
        self.destroy_sink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureCenter;
    use crate::config::HubConfig;
    use crate::graph::{MemoryGraph, StateChangeResult};
    use crate::player::client::{ClientEvent, RecordingClient};
    use crate::player::uri::DOWNLOAD_FLAG;

    const MIC: &str = "autoaudiosrc;default";

    fn uri_backend() -> (Arc<MemoryGraph>, PlaybackBackend, Arc<RecordingClient>) {
        let graph = Arc::new(MemoryGraph::new());
        let client = Arc::new(RecordingClient::new());
        let backend = PlaybackBackend::new(
            graph.clone(),
            BackendKind::Uri,
            PlayerConfig::default(),
            client.clone(),
        );
        (graph, backend, client)
    }

    fn pump(graph: &MemoryGraph, backend: &mut PlaybackBackend) {
        for _ in 0..3 {
            graph.wait_idle();
            backend.dispatch_bus_messages();
        }
    }

    fn loaded() -> (Arc<MemoryGraph>, PlaybackBackend, Arc<RecordingClient>, NodeId) {
        let (graph, mut backend, client) = uri_backend();
        backend
            .load(MediaResource::Uri("file:///media/song.ogg".to_string()))
            .unwrap();
        pump(&graph, &mut backend);
        let node = backend.node().unwrap();
        (graph, backend, client, node)
    }

    #[test]
    fn test_quantize_seek() {
        assert_eq!(quantize_seek(5.0), Duration::from_secs(5));
        assert_eq!(quantize_seek(1.234), Duration::from_millis(1230));
        assert_eq!(quantize_seek(2.996), Duration::from_secs(3));
        assert_eq!(quantize_seek(-4.0), Duration::ZERO);
    }

    #[test]
    fn test_load_reaches_current_data() {
        let (graph, backend, client, node) = loaded();
        assert_eq!(backend.ready_state(), ReadyState::HaveCurrentData);
        assert_eq!(backend.network_state(), NetworkState::Loading);
        assert_eq!(client.count(ClientEvent::NetworkState(NetworkState::Loading)), 1);
        let flags = graph.property(node, "flags").and_then(|v| v.as_flags()).unwrap();
        assert_ne!(flags & DOWNLOAD_FLAG, 0);
        assert!(!backend.is_live_stream());
    }

    #[test]
    fn test_buffering_scenario() {
        let (graph, mut backend, client, node) = loaded();
        graph.set_duration(node, Duration::from_secs(90));
        backend.play().unwrap();
        pump(&graph, &mut backend);

        graph.post_message(node, MessageKind::Buffering(10));
        pump(&graph, &mut backend);
        assert_eq!(graph.current_state(node), Some(NodeState::Paused));

        graph.post_message(node, MessageKind::Buffering(55));
        pump(&graph, &mut backend);
        assert_eq!(graph.current_state(node), Some(NodeState::Paused));
        assert_eq!(client.count(ClientEvent::DurationChanged), 0);

        graph.post_message(node, MessageKind::Buffering(100));
        pump(&graph, &mut backend);
        assert_eq!(graph.current_state(node), Some(NodeState::Playing));
        assert_eq!(client.count(ClientEvent::DurationChanged), 1);
        assert_eq!(backend.ready_state(), ReadyState::HaveEnoughData);
        assert_eq!(backend.network_state(), NetworkState::Loaded);
    }

    #[test]
    fn test_unchanged_duration_notifies_once() {
        let (graph, mut backend, client, node) = loaded();
        graph.set_duration(node, Duration::from_secs(90));
        backend.play().unwrap();
        pump(&graph, &mut backend);

        graph.post_message(node, MessageKind::Buffering(100));
        graph.post_message(node, MessageKind::Buffering(100));
        graph.post_message(node, MessageKind::DurationChanged);
        pump(&graph, &mut backend);
        assert_eq!(client.count(ClientEvent::DurationChanged), 1);

        graph.set_duration(node, Duration::from_secs(95));
        graph.post_message(node, MessageKind::DurationChanged);
        pump(&graph, &mut backend);
        assert_eq!(client.count(ClientEvent::DurationChanged), 2);
    }

    #[test]
    fn test_async_preroll_reported_when_done() {
        let (graph, mut backend, client) = uri_backend();
        backend.create_sink().unwrap();
        let node = backend.node().unwrap();
        graph.script_state_result(node, StateChangeResult::Async);

        backend
            .load(MediaResource::Uri("http://example.com/slow.ogg".to_string()))
            .unwrap();
        pump(&graph, &mut backend);
        // still prerolling: nothing past the reset has been reported
        assert_eq!(backend.ready_state(), ReadyState::HaveNothing);
        assert_eq!(backend.network_state(), NetworkState::Loading);
        assert_eq!(client.count(ClientEvent::ReadyState(ReadyState::HaveCurrentData)), 0);

        graph.complete_pending(node);
        pump(&graph, &mut backend);
        assert_eq!(backend.ready_state(), ReadyState::HaveCurrentData);
        assert_eq!(backend.network_state(), NetworkState::Loading);
        assert_eq!(client.count(ClientEvent::ReadyState(ReadyState::HaveCurrentData)), 1);
    }

    #[test]
    fn test_seek_coalescing() {
        let (graph, mut backend, client, node) = loaded();

        backend.seek(5.0);
        assert!(backend.seeking());
        backend.seek(6.0);
        backend.seek(8.0);
        assert_eq!(graph.seeks(node).len(), 1);

        pump(&graph, &mut backend);
        let positions: Vec<Duration> = graph.seeks(node).iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![Duration::from_secs(5), Duration::from_secs(8)]);
        assert!(graph.seeks(node).iter().all(|s| s.flags == SeekFlags::FLUSH_ACCURATE));
        assert!(!backend.seeking());
        assert_eq!(client.count(ClientEvent::CurrentTimeChanged), 2);
        assert_eq!(backend.current_time(), 8.0);
    }

    #[test]
    fn test_seek_ignored_when_not_prerolled() {
        let (graph, mut backend, _client) = uri_backend();
        backend.create_sink().unwrap();
        let node = backend.node().unwrap();
        backend.seek(3.0);
        assert!(graph.seeks(node).is_empty());
        assert!(!backend.seeking());
    }

    #[test]
    fn test_rejected_seek_leaves_state() {
        let (graph, mut backend, _client, node) = loaded();
        graph.reject_seeks(node, true);
        backend.seek(2.0);
        assert!(!backend.seeking());
    }

    #[test]
    fn test_seek_uses_playback_rate() {
        let (graph, mut backend, _client, node) = loaded();
        backend.set_playback_rate(1.5);
        backend.seek(1.0);
        assert_eq!(graph.seeks(node)[0].rate, 1.5);
    }

    #[test]
    fn test_repeated_state_notifies_once() {
        let (graph, mut backend, client, node) = loaded();
        client.take();
        graph.post_message(
            node,
            MessageKind::StateChanged {
                old: NodeState::Paused,
                new: NodeState::Paused,
                pending: None,
            },
        );
        graph.post_message(node, MessageKind::AsyncDone);
        pump(&graph, &mut backend);
        assert!(client.events().is_empty());
    }

    #[test]
    fn test_no_preroll_marks_live() {
        let (graph, mut backend, client) = uri_backend();
        backend.create_sink().unwrap();
        let node = backend.node().unwrap();
        graph.script_state_result(node, StateChangeResult::NoPreroll);

        backend
            .load(MediaResource::Uri("http://radio.example/live".to_string()))
            .unwrap();
        pump(&graph, &mut backend);

        assert!(backend.is_live_stream());
        assert_eq!(backend.max_time_seekable(), f64::INFINITY);
        let flags = graph.property(node, "flags").and_then(|v| v.as_flags()).unwrap();
        assert_eq!(flags & DOWNLOAD_FLAG, 0);
        assert_eq!(client.last_ready_state(), Some(ReadyState::HaveEnoughData));
        assert_eq!(client.last_network_state(), Some(NetworkState::Loading));

        // live streams ignore buffering
        graph.post_message(node, MessageKind::Buffering(20));
        pump(&graph, &mut backend);
        assert_eq!(graph.current_state(node), Some(NodeState::Paused));
    }

    #[test]
    fn test_error_reports_network_error() {
        let (graph, mut backend, client, node) = loaded();
        graph.post_message(
            node,
            MessageKind::Error {
                code: 3,
                text: "could not read".to_string(),
            },
        );
        pump(&graph, &mut backend);

        assert_eq!(graph.current_state(node), Some(NodeState::Ready));
        assert_eq!(backend.network_state(), NetworkState::NetworkError);
        assert_eq!(backend.ready_state(), ReadyState::HaveCurrentData);
        assert_eq!(client.last_network_state(), Some(NetworkState::NetworkError));
    }

    #[test]
    fn test_end_of_stream_drops_to_ready() {
        let (graph, mut backend, _client, node) = loaded();
        graph.post_message(node, MessageKind::EndOfStream);
        pump(&graph, &mut backend);
        assert_eq!(graph.current_state(node), Some(NodeState::Ready));
        assert_eq!(backend.ready_state(), ReadyState::HaveMetadata);
        assert_eq!(backend.network_state(), NetworkState::Empty);
    }

    #[test]
    fn test_duration_and_volume() {
        let (graph, mut backend, client, node) = loaded();
        graph.set_duration(node, Duration::from_millis(90_500));
        assert_eq!(backend.duration(), 90.5);
        assert_eq!(backend.max_time_seekable(), 90.5);

        graph.post_message(node, MessageKind::DurationChanged);
        pump(&graph, &mut backend);
        assert_eq!(client.count(ClientEvent::DurationChanged), 1);

        backend.set_volume(0.25);
        backend.set_muted(true);
        assert_eq!(graph.property(node, "volume"), Some(PropertyValue::Float(0.25)));
        assert_eq!(graph.property(node, "mute"), Some(PropertyValue::Bool(true)));
    }

    #[test]
    fn test_sink_failure_is_network_error() {
        let (graph, mut backend, client) = uri_backend();
        graph.mark_unavailable("scaletempo");
        let result = backend.load(MediaResource::Uri("file:///a.ogg".to_string()));
        assert!(result.is_err());
        assert_eq!(backend.network_state(), NetworkState::NetworkError);
        assert_eq!(backend.ready_state(), ReadyState::HaveNothing);
        assert_eq!(client.events(), vec![ClientEvent::NetworkState(NetworkState::NetworkError)]);
        assert!(matches!(backend.play(), Err(PlayerError::NoSink)));
    }

    #[test]
    fn test_drop_releases_sink() {
        let (graph, backend, _client, node) = loaded();
        drop(backend);
        assert!(!graph.exists(node));
    }

    struct StreamFixture {
        graph: Arc<MemoryGraph>,
        hub: Arc<SharedPipeline>,
        center: Arc<CaptureCenter>,
        client: Arc<RecordingClient>,
        backend: PlaybackBackend,
    }

    fn stream_fixture() -> StreamFixture {
        let graph = Arc::new(MemoryGraph::new());
        let dyn_graph: Arc<dyn MediaGraph> = graph.clone();
        let hub = SharedPipeline::new(dyn_graph, HubConfig::default()).unwrap();
        let center = Arc::new(CaptureCenter::discover(graph.as_ref()));
        center.register_all(&hub);
        let client = Arc::new(RecordingClient::new());
        let backend =
            PlaybackBackend::for_stream(hub.clone(), PlayerConfig::default(), client.clone());
        StreamFixture {
            graph,
            hub,
            center,
            client,
            backend,
        }
    }

    fn settle(f: &StreamFixture) {
        for _ in 0..3 {
            f.graph.wait_idle();
            f.hub.dispatch_pending();
        }
    }

    #[test]
    fn test_stream_load_pause_play() {
        let mut f = stream_fixture();
        let stream = f.center.create_media_stream(true, false);
        f.backend.load(MediaResource::Stream(stream)).unwrap();

        assert_eq!(f.hub.attachment_count(MIC), 1);
        assert!(f.backend.is_live_stream());
        assert_eq!(f.backend.ready_state(), ReadyState::HaveEnoughData);
        assert_eq!(f.backend.network_state(), NetworkState::Loading);
        assert_eq!(f.backend.duration(), 0.0);
        assert_eq!(f.backend.max_time_seekable(), f64::INFINITY);

        f.backend.pause().unwrap();
        assert!(f.backend.is_stopped());
        settle(&f);
        assert!(!f.hub.has_source(MIC));

        f.backend.play().unwrap();
        assert!(!f.backend.is_paused());
        assert_eq!(f.hub.attachment_count(MIC), 1);
        assert_eq!(f.client.count(ClientEvent::ReadyState(ReadyState::HaveEnoughData)), 1);
    }

    #[test]
    fn test_stream_drop_waits_for_drain() {
        let mut f = stream_fixture();
        let stream = f.center.create_media_stream(true, false);
        f.backend.load(MediaResource::Stream(stream)).unwrap();
        let bin = f.backend.node().unwrap();

        f.backend.destroy_sink();
        assert!(f.backend.node().is_none());
        assert_eq!(f.graph.parent(bin), Some(f.hub.pipeline()));

        settle(&f);
        assert!(!f.graph.exists(bin));
        assert!(!f.hub.has_source(MIC));
    }

    #[test]
    fn test_stream_seek_is_noop() {
        let mut f = stream_fixture();
        let stream = f.center.create_media_stream(true, false);
        f.backend.load(MediaResource::Stream(stream)).unwrap();
        f.backend.seek(4.0);
        assert!(!f.backend.seeking());
    }

    #[test]
    fn test_disabled_source_is_detached() {
        let mut f = stream_fixture();
        let stream = f.center.create_media_stream(true, false);
        f.backend.load(MediaResource::Stream(stream)).unwrap();

        assert!(f.backend.set_source_enabled(MIC, false));
        assert_eq!(f.hub.attachment_count(MIC), 0);
        settle(&f);
        assert!(!f.hub.has_source(MIC));
        assert!(!f.backend.set_source_enabled("unknown;x", false));
    }

    #[test]
    fn test_ended_stream_stops() {
        let mut f = stream_fixture();
        let stream = f.center.create_media_stream(true, false);
        f.backend.load(MediaResource::Stream(stream)).unwrap();

        f.backend.stream_ended();
        assert!(f.backend.is_stopped());
        assert_eq!(f.hub.attachment_count(MIC), 0);
        assert!(f.backend.stream().unwrap().ended);
    }

    #[test]
    fn test_stream_without_sources_fails() {
        let mut f = stream_fixture();
        let stream = MediaStream::new("empty", Vec::new());
        let result = f.backend.load(MediaResource::Stream(stream));
        assert!(matches!(result, Err(PlayerError::Attach(id)) if id == "empty"));
        assert_eq!(f.backend.network_state(), NetworkState::NetworkError);
    }

    #[test]
    fn test_resource_mismatch() {
        let mut f = stream_fixture();
        let result = f.backend.load(MediaResource::Uri("file:///a.ogg".to_string()));
        assert_eq!(result, Err(PlayerError::UnsupportedResource("uri")));
    }

    #[test]
    fn test_play_without_stream() {
        let mut f = stream_fixture();
        f.backend.create_sink().unwrap();
        assert_eq!(f.backend.play(), Err(PlayerError::NoStream));
    }
}
