//! Capture stream sink
//!
//! A bin (audiomixer -> volume -> autoaudiosink) that the shared pipeline
//! feeds. Every attached source gets its own ghost sink port backed by a
//! mixer request port; idle ports are reused by later attachments.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::capture::{CaptureKind, MediaStream};
use crate::error::GraphError;
use crate::graph::{MediaGraph, NodeId, PortId, PropertyValue};
use crate::hub::SharedPipeline;

pub struct StreamSink {
    hub: Arc<SharedPipeline>,
    bin: NodeId,
    mixer: NodeId,
    volume: NodeId,
    /// Every ghost sink port created so far
    ports: Vec<PortId>,
    /// Source id -> ghost port it is attached through
    attached: HashMap<String, PortId>,
}

impl StreamSink {
    pub fn build(hub: Arc<SharedPipeline>) -> Result<Self, GraphError> {
        let graph = hub.graph().as_ref();
        let bin = graph.make_node("bin", Some("stream-sink"))?;

        let built = (|| {
            let mixer = graph.make_node("audiomixer", None)?;
            graph.add_to_bin(bin, mixer)?;
            let volume = graph.make_node("volume", Some("volume"))?;
            graph.add_to_bin(bin, volume)?;
            let output = graph.make_node("autoaudiosink", None)?;
            graph.add_to_bin(bin, output)?;

            link_static(graph, mixer, volume)?;
            link_static(graph, volume, output)?;
            Ok((mixer, volume))
        })();

        match built {
            Ok((mixer, volume)) => Ok(Self {
                hub,
                bin,
                mixer,
                volume,
                ports: Vec::new(),
                attached: HashMap::new(),
            }),
            Err(e) => {
                graph.dispose_node(bin);
                Err(e)
            }
        }
    }

    pub fn node(&self) -> NodeId {
        self.bin
    }

    pub fn is_attached(&self, source_id: &str) -> bool {
        self.attached.contains_key(source_id)
    }

    pub fn attached_sources(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.attached.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// A free ghost port, created on demand. A port still linked to a
    /// draining branch is not free.
    fn free_port(&mut self) -> Result<PortId, GraphError> {
        let graph = self.hub.graph().as_ref();
        let in_use: Vec<PortId> = self.attached.values().copied().collect();
        if let Some(port) = self
            .ports
            .iter()
            .copied()
            .find(|p| !in_use.contains(p) && graph.peer(*p).is_none())
        {
            return Ok(port);
        }

        let mixer_port = graph
            .request_port(self.mixer, "sink_%u")
            .ok_or_else(|| GraphError::NoSuchPort {
                node: self.mixer,
                name: "sink_%u".to_string(),
            })?;
        let name = format!("sink_{}", self.ports.len());
        match graph.add_ghost_port(self.bin, &name, mixer_port) {
            Ok(ghost) => {
                self.ports.push(ghost);
                Ok(ghost)
            }
            Err(e) => {
                graph.release_port(self.mixer, mixer_port);
                Err(e)
            }
        }
    }

    pub fn attach(&mut self, source_id: &str) -> bool {
        if self.is_attached(source_id) {
            return true;
        }
        let port = match self.free_port() {
            Ok(port) => port,
            Err(e) => {
                warn!("StreamSink: no input for '{}': {}", source_id, e);
                return false;
            }
        };
        if !self.hub.connect(source_id, self.bin, Some(port)) {
            return false;
        }
        info!("StreamSink: '{}' attached on {}", source_id, port);
        self.attached.insert(source_id.to_string(), port);
        true
    }

    /// Attach every enabled, running audio source of `stream`. Returns how
    /// many are attached afterwards.
    pub fn attach_stream(&mut self, stream: &MediaStream) -> usize {
        for source in stream.audio_sources() {
            if source.enabled && !source.ended {
                self.attach(&source.id);
            }
        }
        stream
            .sources
            .iter()
            .filter(|s| s.kind == CaptureKind::Audio && self.is_attached(&s.id))
            .count()
    }

    pub fn detach(&mut self, source_id: &str) -> bool {
        let Some(port) = self.attached.remove(source_id) else {
            return false;
        };
        debug!("StreamSink: detaching '{}' from {}", source_id, port);
        self.hub.disconnect(source_id, self.bin, Some(port))
    }

    pub fn detach_all(&mut self) -> usize {
        self.attached_sources()
            .iter()
            .filter(|id| self.detach(id))
            .count()
    }

    pub fn set_volume(&self, volume: f64) {
        self.hub
            .graph()
            .set_property(self.volume, "volume", PropertyValue::Float(volume));
    }

    pub fn set_muted(&self, muted: bool) {
        self.hub
            .graph()
            .set_property(self.volume, "mute", PropertyValue::Bool(muted));
    }

    /// Detach everything and hand the bin to the hub, which disposes it once
    /// no branch drains into it.
    pub fn destroy(mut self) {
        let detached = self.detach_all();
        debug!("StreamSink: releasing {} ({} detached)", self.bin, detached);
        self.hub.release_sink(self.bin);
    }
}

fn link_static(graph: &dyn MediaGraph, from: NodeId, to: NodeId) -> Result<(), GraphError> {
    let src = graph
        .static_port(from, "src")
        .ok_or(GraphError::NoSuchPort {
            node: from,
            name: "src".to_string(),
        })?;
    let sink = graph
        .static_port(to, "sink")
        .ok_or(GraphError::NoSuchPort {
            node: to,
            name: "sink".to_string(),
        })?;
    graph.link(src, sink)
}
