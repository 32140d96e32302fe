//! Source registry
//!
//! Maps stable source ids to the source node currently running in the shared
//! pipeline, or to a factory able to build one on first use.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::GraphError;
use crate::graph::{MediaGraph, NodeId, NodeState, PortId, port_or_static};
use crate::utils::bimap::{BiMap, Either};

/// Lazy construction of a source node
pub trait SourceFactory: Send + Sync {
    /// Build an unparented node for `source_id`. The port is the node's output;
    /// when `None` the node's static "src" port is used.
    fn create(&self, graph: &dyn MediaGraph, source_id: &str) -> Option<(NodeId, Option<PortId>)>;
}

impl<F> SourceFactory for F
where
    F: Fn(&dyn MediaGraph, &str) -> Option<(NodeId, Option<PortId>)> + Send + Sync,
{
    fn create(&self, graph: &dyn MediaGraph, source_id: &str) -> Option<(NodeId, Option<PortId>)> {
        self(graph, source_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePolicy {
    /// Tear the source down once its last attachment is gone
    pub remove_when_unused: bool,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            remove_when_unused: true,
        }
    }
}

/// A source currently present in the shared pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRecord {
    pub source_id: String,
    pub node: NodeId,
    pub port: PortId,
    pub fanout: NodeId,
    pub policy: SourcePolicy,
    /// Teardowns started but not finished for this source
    pub draining: usize,
}

/// Result of [`SourceRegistry::resolve_or_create`], committed or discarded by
/// the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSource {
    pub source_id: String,
    pub node: NodeId,
    pub port: PortId,
    pub fanout: NodeId,
    pub policy: SourcePolicy,
    /// Built by this call rather than reused
    pub created: bool,
}

#[derive(Default)]
pub struct SourceRegistry {
    factories: HashMap<String, (Arc<dyn SourceFactory>, SourcePolicy)>,
    records: HashMap<String, SourceRecord>,
    reverse: BiMap<(NodeId, PortId), String>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory(
        &mut self,
        factory: Arc<dyn SourceFactory>,
        source_id: &str,
        policy: SourcePolicy,
    ) {
        if self
            .factories
            .insert(source_id.to_string(), (factory, policy))
            .is_some()
        {
            debug!("SourceRegistry: replaced factory for '{}'", source_id);
        }
    }

    pub fn deregister_factory(&mut self, source_id: &str) -> bool {
        self.factories.remove(source_id).is_some()
    }

    pub fn has_factory(&self, source_id: &str) -> bool {
        self.factories.contains_key(source_id)
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceRecord> {
        self.records.get(source_id)
    }

    pub fn get_mut(&mut self, source_id: &str) -> Option<&mut SourceRecord> {
        self.records.get_mut(source_id)
    }

    /// Source id owning the output port `(node, port)`
    pub fn source_for(&self, node: NodeId, port: PortId) -> Option<&str> {
        self.reverse.get_by_left(&(node, port)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Return the live source for `source_id`, or build it with its factory
    /// and wire a fan-out node behind it inside `bin`.
    ///
    /// A newly built source is not recorded until [`SourceRegistry::commit`];
    /// on error nothing is left in the graph.
    pub fn resolve_or_create(
        &self,
        graph: &dyn MediaGraph,
        bin: NodeId,
        fanout_kind: &str,
        source_id: &str,
    ) -> Result<PendingSource, GraphError> {
        if let Some(record) = self.records.get(source_id) {
            return Ok(PendingSource {
                source_id: record.source_id.clone(),
                node: record.node,
                port: record.port,
                fanout: record.fanout,
                policy: record.policy,
                created: false,
            });
        }

        let (factory, policy) = self
            .factories
            .get(source_id)
            .ok_or_else(|| GraphError::Resolution(source_id.to_string()))?;

        let (node, port) = factory
            .create(graph, source_id)
            .ok_or_else(|| GraphError::Resolution(source_id.to_string()))?;

        let Some(port) = port_or_static(graph, node, port, "src") else {
            graph.dispose_node(node);
            return Err(GraphError::NoSuchPort {
                node,
                name: "src".to_string(),
            });
        };

        match Self::wire_fanout(graph, bin, fanout_kind, node, port) {
            Ok(fanout) => {
                info!(
                    "SourceRegistry: created source '{}' ({} -> {})",
                    source_id, node, fanout
                );
                Ok(PendingSource {
                    source_id: source_id.to_string(),
                    node,
                    port,
                    fanout,
                    policy: *policy,
                    created: true,
                })
            }
            Err(e) => {
                unparent(graph, bin, node);
                graph.dispose_node(node);
                Err(e)
            }
        }
    }

    fn wire_fanout(
        graph: &dyn MediaGraph,
        bin: NodeId,
        fanout_kind: &str,
        node: NodeId,
        port: PortId,
    ) -> Result<NodeId, GraphError> {
        graph.add_to_bin(bin, node)?;
        let fanout = graph.make_node(fanout_kind, None)?;

        let linked = graph.add_to_bin(bin, fanout).and_then(|_| {
            let sink = graph
                .static_port(fanout, "sink")
                .ok_or_else(|| GraphError::NoSuchPort {
                    node: fanout,
                    name: "sink".to_string(),
                })?;
            graph.link(port, sink)
        });

        if let Err(e) = linked {
            unparent(graph, bin, fanout);
            graph.dispose_node(fanout);
            return Err(e);
        }
        Ok(fanout)
    }

    /// Record a source built by `resolve_or_create`.
    pub fn commit(&mut self, pending: &PendingSource) {
        if !pending.created {
            return;
        }
        self.reverse
            .insert((pending.node, pending.port), pending.source_id.clone());
        self.records.insert(
            pending.source_id.clone(),
            SourceRecord {
                source_id: pending.source_id.clone(),
                node: pending.node,
                port: pending.port,
                fanout: pending.fanout,
                policy: pending.policy,
                draining: 0,
            },
        );
    }

    /// Undo a `resolve_or_create` whose attachment could not be completed.
    pub fn discard(&self, graph: &dyn MediaGraph, bin: NodeId, pending: PendingSource) {
        if !pending.created {
            return;
        }
        warn!(
            "SourceRegistry: discarding half-built source '{}'",
            pending.source_id
        );
        remove_source_nodes(graph, bin, pending.node, pending.fanout);
    }

    /// Forget a source. The caller has already removed its nodes.
    pub fn remove(&mut self, source_id: &str) -> Option<SourceRecord> {
        let record = self.records.remove(source_id)?;
        self.reverse
            .remove(Either::Left(&(record.node, record.port)));
        Some(record)
    }
}

/// Stop, unparent and destroy a source and its fan-out.
pub(crate) fn remove_source_nodes(
    graph: &dyn MediaGraph,
    bin: NodeId,
    node: NodeId,
    fanout: NodeId,
) {
    for n in [fanout, node] {
        graph.set_state(n, NodeState::Null);
        unparent(graph, bin, n);
        graph.dispose_node(n);
    }
}

fn unparent(graph: &dyn MediaGraph, bin: NodeId, node: NodeId) {
    if graph.parent(node) == Some(bin)
        && let Err(e) = graph.remove_from_bin(bin, node)
    {
        warn!("SourceRegistry: removing {} from {} failed: {}", node, bin, e);
    }
}
