//! Node/port primitive consumed by the hub and the players
//!
//! A media graph is made of nodes with typed ports. Nodes are grouped in bins
//! (a pipeline is the top-level bin), move through the `NodeState` lifecycle,
//! and report asynchronous events on the bin's message bus.
//!
//! The trait is the seam between this crate and the multimedia library that
//! actually moves data. `memory::MemoryGraph` implements it in-process and is
//! what the tests and the demo binary run against.

pub mod memory;

pub use memory::MemoryGraph;

use std::time::Duration;

use crate::error::GraphError;

macro_rules! graph_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

graph_id!(NodeId, "node#");
graph_id!(PortId, "port#");
graph_id!(GateId, "gate#");
graph_id!(WatchId, "watch#");

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl NodeState {
    /// Whether data can cross the node's ports in this state
    pub fn is_streaming(&self) -> bool {
        matches!(self, NodeState::Paused | NodeState::Playing)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Null => "NULL",
            NodeState::Ready => "READY",
            NodeState::Paused => "PAUSED",
            NodeState::Playing => "PLAYING",
        };
        write!(f, "{}", name)
    }
}

/// Result of a state change request or query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeResult {
    Success,
    /// The change is still in progress
    Async,
    /// The node cannot preroll: it only produces data while playing (live)
    NoPreroll,
    Failure,
}

/// Result of a bounded state query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub result: StateChangeResult,
    pub current: NodeState,
    pub pending: Option<NodeState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Src,
    Sink,
}

/// Events travelling with the data on a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    EndOfStream,
    FlushStart,
    FlushStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    /// Blocks data units flowing downstream; fires once the port is blocked
    BlockDownstream,
    /// Observes downstream events before they leave the port
    EventDownstream,
}

/// What a gate callback observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateInfo {
    Blocked,
    Event(StreamEvent),
}

/// What a gate callback wants done with the observed item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    /// Keep the gate installed; events go through, a blocking gate stays blocked
    Pass,
    /// Swallow the item and keep the gate installed
    Drop,
    /// Uninstall the gate and let the item through
    Remove,
}

/// Gate callbacks run on the streaming thread.
pub type GateCallback = Box<dyn FnMut(GateInfo) -> GateAction + Send>;

/// Bus watchers run on the streaming thread.
pub type BusCallback = Box<dyn Fn(&BusMessage) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Error { code: i32, text: String },
    EndOfStream,
    Buffering(u8),
    ClockLost,
    DurationChanged,
    StateChanged {
        old: NodeState,
        new: NodeState,
        pending: Option<NodeState>,
    },
    AsyncDone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Node that posted the message
    pub source: NodeId,
    pub kind: MessageKind,
}

impl BusMessage {
    pub fn new(source: NodeId, kind: MessageKind) -> Self {
        Self { source, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekFlags {
    pub flush: bool,
    pub accurate: bool,
}

impl SeekFlags {
    pub const FLUSH_ACCURATE: SeekFlags = SeekFlags {
        flush: true,
        accurate: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekRequest {
    pub rate: f64,
    pub position: Duration,
    pub flags: SeekFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Flags(u32),
    Text(String),
    Node(NodeId),
}

impl PropertyValue {
    pub fn as_flags(&self) -> Option<u32> {
        match self {
            PropertyValue::Flags(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

/// Node/port primitive
///
/// Implementations must be usable from the control thread and from the
/// streaming thread at the same time. Gate callbacks may call back into the
/// graph, so implementations must not hold internal locks while running them.
pub trait MediaGraph: Send + Sync {
    /// Construct a node from a factory kind ("tee", "queue", "playbin", ...).
    fn make_node(&self, kind: &str, name: Option<&str>) -> Result<NodeId, GraphError>;

    /// Destroy a node that has no parent any more.
    fn dispose_node(&self, node: NodeId);

    fn node_kind(&self, node: NodeId) -> Option<String>;

    fn add_to_bin(&self, bin: NodeId, node: NodeId) -> Result<(), GraphError>;

    /// Detach a node from its bin. Its ports are unlinked and their gates dropped.
    fn remove_from_bin(&self, bin: NodeId, node: NodeId) -> Result<(), GraphError>;

    fn parent(&self, node: NodeId) -> Option<NodeId>;

    fn static_port(&self, node: NodeId, name: &str) -> Option<PortId>;

    /// Request a dynamic port from a template such as "src_%u".
    fn request_port(&self, node: NodeId, template: &str) -> Option<PortId>;

    fn release_port(&self, node: NodeId, port: PortId);

    /// Expose `target` (a port of a child) on the bin under `name`.
    fn add_ghost_port(&self, bin: NodeId, name: &str, target: PortId)
    -> Result<PortId, GraphError>;

    fn port_owner(&self, port: PortId) -> Option<NodeId>;

    fn port_direction(&self, port: PortId) -> Option<PortDirection>;

    fn peer(&self, port: PortId) -> Option<PortId>;

    fn link(&self, src: PortId, sink: PortId) -> Result<(), GraphError>;

    fn unlink(&self, src: PortId, sink: PortId);

    fn sink_ports(&self, node: NodeId) -> Vec<PortId>;

    fn src_ports(&self, node: NodeId) -> Vec<PortId>;

    fn set_port_active(&self, port: PortId, active: bool);

    fn set_state(&self, node: NodeId, state: NodeState) -> StateChangeResult;

    /// Query the state, waiting at most `timeout` for a pending change.
    fn state(&self, node: NodeId, timeout: std::time::Duration) -> StateSnapshot;

    fn sync_state_with_parent(&self, node: NodeId) -> Result<(), GraphError>;

    /// Push an end-of-stream event into `port` (a sink port).
    fn send_eos(&self, port: PortId) -> bool;

    fn add_gate(&self, port: PortId, kind: GateKind, callback: GateCallback) -> Option<GateId>;

    fn remove_gate(&self, port: PortId, gate: GateId);

    fn seek(&self, node: NodeId, request: SeekRequest) -> bool;

    fn query_position(&self, node: NodeId) -> Option<Duration>;

    fn query_duration(&self, node: NodeId) -> Option<Duration>;

    fn set_property(&self, node: NodeId, name: &str, value: PropertyValue) -> bool;

    fn property(&self, node: NodeId, name: &str) -> Option<PropertyValue>;

    /// Subscribe to the message bus of a bin.
    fn watch_bus(&self, bin: NodeId, callback: BusCallback) -> Option<WatchId>;

    fn unwatch_bus(&self, bin: NodeId, watch: WatchId);
}

/// Resolve `port` or fall back to the node's static port named `fallback`.
pub fn port_or_static(
    graph: &dyn MediaGraph,
    node: NodeId,
    port: Option<PortId>,
    fallback: &str,
) -> Option<PortId> {
    port.or_else(|| graph.static_port(node, fallback))
}
