//! Capture source center
//!
//! Discovers the capture devices available to the graph, hands out
//! [`MediaStream`]s built from them, and acts as the [`SourceFactory`] that
//! builds the capture branch when the shared pipeline first needs a source.
//!
//! Source ids have the form `"<factory>;<device>"`, e.g.
//! `"autoaudiosrc;default"`.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::GraphError;
use crate::graph::{MediaGraph, NodeId, NodeState, PortId, PropertyValue, StateChangeResult};
use crate::hub::{SharedPipeline, SourceFactory};

const AUDIO_CAPS: &str = "audio/x-raw,channels=1";
const VIDEO_CAPS: &str = "video/x-raw,width=320,height=240";
const DEFAULT_DEVICE: &str = "default";
const DEFAULT_AUDIO_NAME: &str = "Default Audio Source";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureKind {
    Audio,
    Video,
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureKind::Audio => write!(f, "audio"),
            CaptureKind::Video => write!(f, "video"),
        }
    }
}

/// Descriptor of one capture device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSource {
    pub id: String,
    pub name: String,
    pub kind: CaptureKind,
    /// Node kind instantiated for this device
    pub factory_kind: String,
    pub device: String,
    pub enabled: bool,
    pub ended: bool,
}

impl CaptureSource {
    pub fn new(factory_kind: &str, device: &str, name: &str, kind: CaptureKind) -> Self {
        Self {
            id: format!("{};{}", factory_kind, device),
            name: name.to_string(),
            kind,
            factory_kind: factory_kind.to_string(),
            device: device.to_string(),
            enabled: true,
            ended: false,
        }
    }
}

/// Split a source id into its factory and device parts.
pub fn split_source_id(id: &str) -> (&str, &str) {
    match id.split_once(';') {
        Some((factory, device)) => (factory, device),
        None => (id, ""),
    }
}

/// Capture sources bundled for one consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    pub id: String,
    pub sources: Vec<CaptureSource>,
    pub ended: bool,
}

impl MediaStream {
    pub fn new(id: &str, sources: Vec<CaptureSource>) -> Self {
        Self {
            id: id.to_string(),
            sources,
            ended: false,
        }
    }

    pub fn audio_sources(&self) -> impl Iterator<Item = &CaptureSource> {
        self.sources.iter().filter(|s| s.kind == CaptureKind::Audio)
    }

    pub fn source(&self, id: &str) -> Option<&CaptureSource> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Returns false when the stream has no such source.
    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.sources.iter_mut().find(|s| s.id == id) {
            Some(source) => {
                source.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn end(&mut self) {
        self.ended = true;
        for source in &mut self.sources {
            source.ended = true;
        }
    }
}

#[derive(Default)]
pub struct CaptureCenter {
    sources: Mutex<BTreeMap<String, CaptureSource>>,
    streams_created: AtomicU64,
}

impl CaptureCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe the graph for capture devices.
    pub fn discover(graph: &dyn MediaGraph) -> Self {
        info!("CaptureCenter: discovering capture devices");
        let center = Self::new();
        if let Some(source) = probe(graph, "autoaudiosrc", CaptureKind::Audio) {
            center.add_source(source);
        }
        // video capture is described but not probed
        center
    }

    /// Record a source; returns its id. A source already known under the same
    /// id is kept.
    pub fn add_source(&self, source: CaptureSource) -> String {
        let (factory, device) = split_source_id(&source.id);
        let key = format!("{};{}", factory, device);
        debug!(
            "CaptureCenter: source '{}' device='{}' factory='{}'",
            source.name, device, factory
        );
        self.sources.lock().entry(key.clone()).or_insert(source);
        key
    }

    pub fn sources(&self) -> Vec<CaptureSource> {
        self.sources.lock().values().cloned().collect()
    }

    pub fn first_source(&self, kind: CaptureKind) -> Option<CaptureSource> {
        self.sources
            .lock()
            .values()
            .find(|s| s.kind == kind)
            .cloned()
    }

    /// Build a stream from the first available source of each requested
    /// kind. Video is not supported and is ignored.
    pub fn create_media_stream(&self, audio: bool, video: bool) -> MediaStream {
        let mut sources = Vec::new();
        if audio {
            match self.first_source(CaptureKind::Audio) {
                Some(source) => sources.push(source),
                None => warn!("CaptureCenter: no audio source available"),
            }
        }
        if video {
            debug!("CaptureCenter: video streams are not supported");
        }
        let n = self.streams_created.fetch_add(1, Ordering::Relaxed);
        MediaStream::new(&format!("stream{}", n), sources)
    }

    /// Register this center as the factory of every known source.
    pub fn register_all(self: &Arc<Self>, hub: &SharedPipeline) -> usize {
        let ids: Vec<String> = self.sources.lock().keys().cloned().collect();
        for id in &ids {
            info!("CaptureCenter: registering source factory for '{}'", id);
            let factory: Arc<dyn SourceFactory> = self.clone();
            hub.register_factory(factory, id);
        }
        ids.len()
    }

    fn build_source(
        &self,
        graph: &dyn MediaGraph,
        source: &CaptureSource,
    ) -> Result<(NodeId, PortId), GraphError> {
        let device = graph.make_node(&source.factory_kind, Some("device_source"))?;
        graph.set_property(device, "device", PropertyValue::Text(source.device.clone()));

        let built = match source.kind {
            CaptureKind::Audio => build_bin(graph, device, &["audioconvert"], AUDIO_CAPS, 0),
            CaptureKind::Video => {
                build_bin(graph, device, &["videoscale", "videoconvert"], VIDEO_CAPS, 1)
            }
        };
        if built.is_err() && graph.parent(device).is_none() {
            graph.dispose_node(device);
        }
        built
    }
}

impl SourceFactory for CaptureCenter {
    fn create(&self, graph: &dyn MediaGraph, source_id: &str) -> Option<(NodeId, Option<PortId>)> {
        info!("CaptureCenter: creating source '{}'", source_id);
        let source = self.sources.lock().get(source_id).cloned()?;
        match self.build_source(graph, &source) {
            Ok((bin, port)) => Some((bin, Some(port))),
            Err(e) => {
                warn!("CaptureCenter: cannot build source '{}': {}", source_id, e);
                None
            }
        }
    }
}

fn probe(graph: &dyn MediaGraph, kind: &str, capture: CaptureKind) -> Option<CaptureSource> {
    let node = graph.make_node(kind, None).ok()?;
    let ready = graph.set_state(node, NodeState::Ready) == StateChangeResult::Success;
    let name = graph
        .property(node, "device-name")
        .and_then(|v| match v {
            PropertyValue::Text(name) => Some(name),
            _ => None,
        })
        .unwrap_or_else(|| DEFAULT_AUDIO_NAME.to_string());
    graph.set_state(node, NodeState::Null);
    graph.dispose_node(node);

    if !ready {
        warn!("CaptureCenter: {} did not reach READY", kind);
        return None;
    }
    debug!("CaptureCenter: found '{}' via {}", name, kind);
    Some(CaptureSource::new(kind, DEFAULT_DEVICE, &name, capture))
}

/// Wrap `device` in a bin: device -> chain[..caps_at] -> caps -> rest, with
/// the last node's output ghosted as "src".
fn build_bin(
    graph: &dyn MediaGraph,
    device: NodeId,
    chain: &[&str],
    caps: &str,
    caps_at: usize,
) -> Result<(NodeId, PortId), GraphError> {
    let bin = graph.make_node("bin", None)?;
    let mut nodes = vec![device];

    let result = (|| {
        graph.add_to_bin(bin, device)?;
        for (i, kind) in chain.iter().enumerate() {
            if i == caps_at {
                let filter = graph.make_node("capsfilter", None)?;
                graph.set_property(filter, "caps", PropertyValue::Text(caps.to_string()));
                nodes.push(filter);
                graph.add_to_bin(bin, filter)?;
            }
            let node = graph.make_node(kind, None)?;
            nodes.push(node);
            graph.add_to_bin(bin, node)?;
        }
        for pair in nodes.windows(2) {
            let src = graph
                .static_port(pair[0], "src")
                .ok_or(GraphError::NoSuchPort {
                    node: pair[0],
                    name: "src".to_string(),
                })?;
            let sink = graph
                .static_port(pair[1], "sink")
                .ok_or(GraphError::NoSuchPort {
                    node: pair[1],
                    name: "sink".to_string(),
                })?;
            graph.link(src, sink)?;
        }
        let last = nodes[nodes.len() - 1];
        let out = graph
            .static_port(last, "src")
            .ok_or(GraphError::NoSuchPort {
                node: last,
                name: "src".to_string(),
            })?;
        graph.add_ghost_port(bin, "src", out)
    })();

    match result {
        Ok(ghost) => Ok((bin, ghost)),
        Err(e) => {
            // disposing the bin takes its children with it
            graph.dispose_node(bin);
            for node in nodes {
                graph.dispose_node(node);
            }
            Err(e)
        }
    }
}
