//! URI playback sink: a `playbin` with a tempo-preserving audio output

use log::{debug, warn};

use crate::error::GraphError;
use crate::graph::{MediaGraph, NodeId, NodeState, PropertyValue, StateChangeResult};

/// Play flag asking the decoder to download the resource ahead of playback
pub const DOWNLOAD_FLAG: u32 = 1 << 7;

const AUDIO_CHAIN: [&str; 4] = ["scaletempo", "audioconvert", "audioresample", "autoaudiosink"];

#[derive(Debug)]
pub struct UriSink {
    playbin: NodeId,
    audio_sink: NodeId,
}

impl UriSink {
    /// Build the playbin and its audio-sink bin. Nothing is left behind on
    /// failure.
    pub fn build(graph: &dyn MediaGraph) -> Result<Self, GraphError> {
        let playbin = graph.make_node("playbin", Some("play"))?;
        let audio_sink = match build_audio_sink(graph) {
            Ok(bin) => bin,
            Err(e) => {
                graph.dispose_node(playbin);
                return Err(e);
            }
        };

        graph.set_property(playbin, "audio-sink", PropertyValue::Node(audio_sink));
        if let Err(e) = graph.add_to_bin(playbin, audio_sink) {
            graph.dispose_node(audio_sink);
            graph.dispose_node(playbin);
            return Err(e);
        }

        debug!("UriSink: built {} with audio sink {}", playbin, audio_sink);
        Ok(Self {
            playbin,
            audio_sink,
        })
    }

    pub fn node(&self) -> NodeId {
        self.playbin
    }

    pub fn audio_sink(&self) -> NodeId {
        self.audio_sink
    }

    /// Point the playbin at `uri` and preroll it.
    pub fn load(&self, graph: &dyn MediaGraph, uri: &str) -> StateChangeResult {
        graph.set_property(self.playbin, "uri", PropertyValue::Text(uri.to_string()));
        graph.set_state(self.playbin, NodeState::Paused)
    }

    pub fn set_download(&self, graph: &dyn MediaGraph, enabled: bool) {
        let flags = graph
            .property(self.playbin, "flags")
            .and_then(|v| v.as_flags())
            .unwrap_or(0);
        let flags = if enabled {
            flags | DOWNLOAD_FLAG
        } else {
            flags & !DOWNLOAD_FLAG
        };
        graph.set_property(self.playbin, "flags", PropertyValue::Flags(flags));
    }

    pub fn destroy(self, graph: &dyn MediaGraph) {
        if graph.set_state(self.playbin, NodeState::Null) == StateChangeResult::Failure {
            warn!("UriSink: {} refused to stop", self.playbin);
        }
        graph.dispose_node(self.playbin);
    }
}

fn build_audio_sink(graph: &dyn MediaGraph) -> Result<NodeId, GraphError> {
    let bin = graph.make_node("bin", Some("audio-sink"))?;

    let linked = (|| {
        let mut chain = Vec::with_capacity(AUDIO_CHAIN.len());
        for kind in AUDIO_CHAIN {
            let node = graph.make_node(kind, None)?;
            if let Err(e) = graph.add_to_bin(bin, node) {
                graph.dispose_node(node);
                return Err(e);
            }
            chain.push(node);
        }
        for pair in chain.windows(2) {
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
        let head = chain[0];
        let input = graph
            .static_port(head, "sink")
            .ok_or(GraphError::NoSuchPort {
                node: head,
                name: "sink".to_string(),
            })?;
        graph.add_ghost_port(bin, "sink", input)
    })();

    match linked {
        Ok(_) => Ok(bin),
        Err(e) => {
            warn!("UriSink: audio sink construction failed: {}", e);
            graph.dispose_node(bin);
            Err(e)
        }
    }
}
