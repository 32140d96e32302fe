//! In-process media graph
//!
//! `MemoryGraph` keeps the node/port topology in memory and simulates the
//! parts of a streaming engine the hub depends on: a dedicated streaming
//! thread, blocking gates that fire once data crosses a port, end-of-stream
//! propagation through filter nodes, bin state propagation and a message bus
//! per top-level bin.
//!
//! No media data is produced. A port "carries data" when its node is PLAYING,
//! it is active and linked, and the source at the head of its branch has not
//! been stalled with [`MemoryGraph::set_stalled`].

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use super::{
    BusCallback, BusMessage, GateAction, GateCallback, GateId, GateInfo, GateKind, MediaGraph,
    MessageKind, NodeId, NodeState, PortDirection, PortId, PropertyValue, SeekRequest,
    StateChangeResult, StateSnapshot, StreamEvent, WatchId,
};
use crate::error::GraphError;

/// Longest upstream walk before a branch is considered cyclic
const MAX_WALK: usize = 64;

type Job = Box<dyn FnOnce() + Send>;
type SharedBusCallback = Arc<dyn Fn(&BusMessage) + Send + Sync>;

enum Work {
    Run(Job),
    Stop,
}

/// Port layout derived from a node kind
struct Shape {
    is_bin: bool,
    live: bool,
    sinks: &'static [&'static str],
    srcs: &'static [&'static str],
    sink_template: Option<&'static str>,
    src_template: Option<&'static str>,
}

impl Shape {
    fn of(kind: &str) -> Shape {
        let base = Shape {
            is_bin: false,
            live: false,
            sinks: &[],
            srcs: &[],
            sink_template: None,
            src_template: None,
        };
        match kind {
            "pipeline" | "bin" | "playbin" => Shape {
                is_bin: true,
                ..base
            },
            "tee" => Shape {
                sinks: &["sink"],
                src_template: Some("src_%u"),
                ..base
            },
            "audiomixer" | "adder" | "compositor" => Shape {
                srcs: &["src"],
                sink_template: Some("sink_%u"),
                ..base
            },
            k if k.ends_with("sink") => Shape {
                sinks: &["sink"],
                ..base
            },
            k if k.ends_with("src") => Shape {
                srcs: &["src"],
                live: !k.contains("test"),
                ..base
            },
            _ => Shape {
                sinks: &["sink"],
                srcs: &["src"],
                ..base
            },
        }
    }
}

struct NodeEntry {
    kind: String,
    name: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    is_bin: bool,
    live: bool,
    state: NodeState,
    pending: Option<NodeState>,
    last_result: StateChangeResult,
    ports: Vec<PortId>,
    sink_template: Option<&'static str>,
    src_template: Option<&'static str>,
    next_request: u32,
    properties: HashMap<String, PropertyValue>,
}

struct PortEntry {
    node: NodeId,
    name: String,
    direction: PortDirection,
    peer: Option<PortId>,
    active: bool,
    dynamic: bool,
    ghost_target: Option<PortId>,
}

struct GateEntry {
    port: PortId,
    kind: GateKind,
    callback: Option<GateCallback>,
    fired: bool,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    nodes: HashMap<NodeId, NodeEntry>,
    ports: HashMap<PortId, PortEntry>,
    gates: HashMap<GateId, GateEntry>,
    watches: HashMap<NodeId, Vec<(WatchId, SharedBusCallback)>>,
    unavailable: HashSet<String>,
    scripted: HashMap<NodeId, VecDeque<StateChangeResult>>,
    rejected_seeks: HashSet<NodeId>,
    seeks: Vec<(NodeId, SeekRequest)>,
    stalled: HashSet<NodeId>,
    durations: HashMap<NodeId, Duration>,
    positions: HashMap<NodeId, Duration>,
    eos_received: HashSet<NodeId>,
}

impl Inner {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn root_of(&self, node: NodeId) -> NodeId {
        let mut current = node;
        for _ in 0..MAX_WALK {
            match self.nodes.get(&current).and_then(|n| n.parent) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    fn new_port(
        &mut self,
        node: NodeId,
        name: String,
        direction: PortDirection,
        dynamic: bool,
    ) -> PortId {
        let id = PortId(self.next());
        self.ports.insert(
            id,
            PortEntry {
                node,
                name,
                direction,
                peer: None,
                active: true,
                dynamic,
                ghost_target: None,
            },
        );
        if let Some(entry) = self.nodes.get_mut(&node) {
            entry.ports.push(id);
        }
        id
    }

    fn unlink_port(&mut self, port: PortId) {
        let peer = self.ports.get_mut(&port).and_then(|p| p.peer.take());
        if let Some(peer) = peer
            && let Some(p) = self.ports.get_mut(&peer)
        {
            p.peer = None;
        }
    }

    fn drop_gates_on(&mut self, port: PortId) {
        self.gates.retain(|_, g| g.port != port);
    }

    fn ports_of(&self, node: NodeId, direction: PortDirection) -> Vec<PortId> {
        self.nodes
            .get(&node)
            .map(|n| {
                n.ports
                    .iter()
                    .copied()
                    .filter(|p| {
                        self.ports
                            .get(p)
                            .is_some_and(|entry| entry.direction == direction)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Head of the branch feeding `node`
    fn upstream_source(&self, node: NodeId) -> NodeId {
        let mut current = node;
        for _ in 0..MAX_WALK {
            let upstream = self
                .ports_of(current, PortDirection::Sink)
                .into_iter()
                .filter_map(|p| self.ports.get(&p).and_then(|e| e.peer))
                .filter_map(|peer| self.ports.get(&peer).map(|e| e.node))
                .next();
            match upstream {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    fn is_flowing(&self, port: PortId) -> bool {
        let Some(entry) = self.ports.get(&port) else {
            return false;
        };
        if !entry.active || entry.peer.is_none() {
            return false;
        }
        let playing = self
            .nodes
            .get(&entry.node)
            .is_some_and(|n| n.state == NodeState::Playing);
        playing && !self.stalled.contains(&self.upstream_source(entry.node))
    }

    fn has_live_descendant(&self, node: NodeId) -> bool {
        let Some(entry) = self.nodes.get(&node) else {
            return false;
        };
        entry.live || entry.children.iter().any(|c| self.has_live_descendant(*c))
    }

    fn watchers_for(&self, node: NodeId) -> Vec<SharedBusCallback> {
        self.watches
            .get(&self.root_of(node))
            .map(|w| w.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled whenever a pending state change resolves
    settled: Condvar,
    jobs: Sender<Work>,
}

impl Shared {
    fn spawn(&self, job: Job) {
        if self.jobs.send(Work::Run(job)).is_err() {
            warn!("MemoryGraph: streaming thread is gone, dropping job");
        }
    }

    /// Queue a bus message for delivery on the streaming thread
    fn post(self: &Arc<Self>, inner: &Inner, message: BusMessage) {
        let watchers = inner.watchers_for(message.source);
        if watchers.is_empty() {
            return;
        }
        self.spawn(Box::new(move || {
            for watcher in &watchers {
                watcher(&message);
            }
        }));
    }

    /// Schedule every armed block gate whose port carries data
    fn kick_gates(self: &Arc<Self>, inner: &mut Inner) {
        let ready: Vec<GateId> = inner
            .gates
            .iter()
            .filter(|(_, g)| g.kind == GateKind::BlockDownstream && !g.fired)
            .filter(|(_, g)| inner.is_flowing(g.port))
            .map(|(id, _)| *id)
            .collect();
        for id in ready {
            if let Some(gate) = inner.gates.get_mut(&id) {
                gate.fired = true;
            }
            let shared = Arc::clone(self);
            self.spawn(Box::new(move || shared.fire_block(id)));
        }
    }

    fn fire_block(self: &Arc<Self>, id: GateId) {
        let callback = {
            let mut inner = self.inner.lock();
            inner.gates.get_mut(&id).and_then(|g| g.callback.take())
        };
        let Some(mut callback) = callback else {
            return;
        };
        let action = callback(GateInfo::Blocked);
        self.restore_gate(id, callback, action);
    }

    fn restore_gate(&self, id: GateId, callback: GateCallback, action: GateAction) {
        let mut inner = self.inner.lock();
        match action {
            GateAction::Remove => {
                inner.gates.remove(&id);
            }
            GateAction::Pass | GateAction::Drop => {
                if let Some(gate) = inner.gates.get_mut(&id) {
                    gate.callback = Some(callback);
                }
            }
        }
    }

    /// Run the event gates of `port`; returns whether the event goes on
    fn run_event_gates(&self, port: PortId, event: StreamEvent) -> bool {
        let ids: Vec<GateId> = {
            let inner = self.inner.lock();
            let mut ids: Vec<GateId> = inner
                .gates
                .iter()
                .filter(|(_, g)| g.port == port && g.kind == GateKind::EventDownstream)
                .map(|(id, _)| *id)
                .collect();
            ids.sort();
            ids
        };
        for id in ids {
            let callback = self
                .inner
                .lock()
                .gates
                .get_mut(&id)
                .and_then(|g| g.callback.take());
            let Some(mut callback) = callback else {
                continue;
            };
            let action = callback(GateInfo::Event(event));
            self.restore_gate(id, callback, action);
            if action == GateAction::Drop {
                return false;
            }
        }
        true
    }

    fn propagate_eos(self: &Arc<Self>, entry: PortId) {
        let mut pending = vec![entry];
        let mut steps = 0;
        while let Some(port) = pending.pop() {
            steps += 1;
            if steps > MAX_WALK * 4 {
                warn!("MemoryGraph: end-of-stream propagation did not terminate");
                return;
            }
            let (node, target) = {
                let inner = self.inner.lock();
                match inner.ports.get(&port) {
                    Some(p) => (p.node, p.ghost_target),
                    None => continue,
                }
            };
            if let Some(target) = target {
                pending.push(target);
                continue;
            }
            let outputs = {
                let mut inner = self.inner.lock();
                let outputs = inner.ports_of(node, PortDirection::Src);
                if outputs.is_empty() {
                    debug!("MemoryGraph: {} received end-of-stream", node);
                    inner.eos_received.insert(node);
                }
                outputs
            };
            for out in outputs {
                if !self.run_event_gates(out, StreamEvent::EndOfStream) {
                    continue;
                }
                let peer = self.inner.lock().ports.get(&out).and_then(|p| p.peer);
                if let Some(peer) = peer {
                    pending.push(peer);
                }
            }
        }
    }
}

/// In-process [`MediaGraph`] with its own streaming thread
pub struct MemoryGraph {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        let (tx, rx) = channel::<Work>();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            settled: Condvar::new(),
            jobs: tx,
        });

        let worker = std::thread::Builder::new()
            .name("memory-graph-streaming".to_string())
            .spawn(move || {
                while let Ok(work) = rx.recv() {
                    match work {
                        Work::Run(job) => job(),
                        Work::Stop => break,
                    }
                }
            });

        let (worker, worker_id) = match worker {
            Ok(handle) => {
                let id = handle.thread().id();
                (Some(handle), Some(id))
            }
            Err(e) => {
                warn!("MemoryGraph: failed to spawn streaming thread: {}", e);
                (None, None)
            }
        };

        Self {
            shared,
            worker,
            worker_id,
        }
    }

    /// Block until every job queued on the streaming thread so far has run.
    ///
    /// Must not be called from a gate or bus callback.
    pub fn wait_idle(&self) {
        if self.on_streaming_thread() {
            return;
        }
        let (tx, rx) = channel::<()>();
        self.shared.spawn(Box::new(move || {
            let _ = tx.send(());
        }));
        let _ = rx.recv_timeout(Duration::from_secs(5));
    }

    fn on_streaming_thread(&self) -> bool {
        self.worker_id == Some(std::thread::current().id())
    }

    /// Make construction of `kind` fail, as if its plugin were missing.
    pub fn mark_unavailable(&self, kind: &str) {
        self.shared.inner.lock().unavailable.insert(kind.to_string());
    }

    /// Queue the result the next `set_state` on `node` reports.
    ///
    /// `Async` leaves the change pending until [`MemoryGraph::complete_pending`],
    /// `Failure` leaves the state untouched.
    pub fn script_state_result(&self, node: NodeId, result: StateChangeResult) {
        self.shared
            .inner
            .lock()
            .scripted
            .entry(node)
            .or_default()
            .push_back(result);
    }

    /// Finish a pending (async) state change and announce it on the bus.
    pub fn complete_pending(&self, node: NodeId) {
        let mut inner = self.shared.inner.lock();
        let Some(entry) = inner.nodes.get_mut(&node) else {
            return;
        };
        let Some(target) = entry.pending.take() else {
            return;
        };
        let old = entry.state;
        entry.state = target;
        entry.last_result = StateChangeResult::Success;
        self.shared.post(
            &inner,
            BusMessage::new(
                node,
                MessageKind::StateChanged {
                    old,
                    new: target,
                    pending: None,
                },
            ),
        );
        self.shared
            .post(&inner, BusMessage::new(node, MessageKind::AsyncDone));
        self.shared.kick_gates(&mut inner);
        self.shared.settled.notify_all();
    }

    /// Post a message on the bus `node` belongs to.
    pub fn post_message(&self, node: NodeId, kind: MessageKind) {
        let inner = self.shared.inner.lock();
        self.shared.post(&inner, BusMessage::new(node, kind));
    }

    /// Stop (or resume) data production at a source node.
    pub fn set_stalled(&self, node: NodeId, stalled: bool) {
        let mut inner = self.shared.inner.lock();
        if stalled {
            inner.stalled.insert(node);
        } else {
            inner.stalled.remove(&node);
            self.shared.kick_gates(&mut inner);
        }
    }

    pub fn reject_seeks(&self, node: NodeId, reject: bool) {
        let mut inner = self.shared.inner.lock();
        if reject {
            inner.rejected_seeks.insert(node);
        } else {
            inner.rejected_seeks.remove(&node);
        }
    }

    pub fn set_duration(&self, node: NodeId, duration: Duration) {
        self.shared.inner.lock().durations.insert(node, duration);
    }

    /// Seeks accepted for `node`, oldest first
    pub fn seeks(&self, node: NodeId) -> Vec<SeekRequest> {
        self.shared
            .inner
            .lock()
            .seeks
            .iter()
            .filter(|(n, _)| *n == node)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn received_eos(&self, node: NodeId) -> bool {
        self.shared.inner.lock().eos_received.contains(&node)
    }

    pub fn exists(&self, node: NodeId) -> bool {
        self.shared.inner.lock().nodes.contains_key(&node)
    }

    pub fn contains(&self, bin: NodeId, node: NodeId) -> bool {
        self.shared
            .inner
            .lock()
            .nodes
            .get(&node)
            .is_some_and(|n| n.parent == Some(bin))
    }

    /// Children of `bin` created from `kind`
    pub fn children_of_kind(&self, bin: NodeId, kind: &str) -> Vec<NodeId> {
        let inner = self.shared.inner.lock();
        let mut found: Vec<NodeId> = inner
            .nodes
            .get(&bin)
            .map(|b| {
                b.children
                    .iter()
                    .copied()
                    .filter(|c| inner.nodes.get(c).is_some_and(|n| n.kind == kind))
                    .collect()
            })
            .unwrap_or_default();
        found.sort();
        found
    }

    pub fn current_state(&self, node: NodeId) -> Option<NodeState> {
        self.shared.inner.lock().nodes.get(&node).map(|n| n.state)
    }

    pub fn node_name(&self, node: NodeId) -> Option<String> {
        self.shared.inner.lock().nodes.get(&node).map(|n| n.name.clone())
    }

    pub fn is_port_active(&self, port: PortId) -> bool {
        self.shared
            .inner
            .lock()
            .ports
            .get(&port)
            .is_some_and(|p| p.active)
    }

    pub fn gate_count(&self, port: PortId) -> usize {
        self.shared
            .inner
            .lock()
            .gates
            .values()
            .filter(|g| g.port == port)
            .count()
    }

    fn apply_state(
        &self,
        inner: &mut Inner,
        node: NodeId,
        target: NodeState,
    ) -> StateChangeResult {
        let scripted = inner.scripted.get_mut(&node).and_then(|q| q.pop_front());
        let live = inner.has_live_descendant(node);
        let Some(entry) = inner.nodes.get_mut(&node) else {
            return StateChangeResult::Failure;
        };

        let result = scripted.unwrap_or(if live && target == NodeState::Paused {
            StateChangeResult::NoPreroll
        } else {
            StateChangeResult::Success
        });
        entry.last_result = result;

        let old = entry.state;
        match result {
            StateChangeResult::Failure => return result,
            StateChangeResult::Async => {
                entry.pending = Some(target);
                return result;
            }
            StateChangeResult::Success | StateChangeResult::NoPreroll => {
                entry.state = target;
                entry.pending = None;
            }
        }

        let children = entry.children.clone();
        for child in children {
            self.apply_state(inner, child, target);
        }

        if old != target {
            self.shared.post(
                inner,
                BusMessage::new(
                    node,
                    MessageKind::StateChanged {
                        old,
                        new: target,
                        pending: None,
                    },
                ),
            );
        }
        result
    }

    fn destroy(inner: &mut Inner, node: NodeId) {
        let Some(entry) = inner.nodes.remove(&node) else {
            return;
        };
        for port in &entry.ports {
            inner.unlink_port(*port);
            inner.drop_gates_on(*port);
            inner.ports.remove(port);
        }
        for child in entry.children {
            Self::destroy(inner, child);
        }
        inner.watches.remove(&node);
        inner.scripted.remove(&node);
        inner.stalled.remove(&node);
    }
}

impl Default for MemoryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryGraph {
    fn drop(&mut self) {
        let _ = self.shared.jobs.send(Work::Stop);
        if let Some(handle) = self.worker.take()
            && !self.on_streaming_thread()
        {
            let _ = handle.join();
        }
    }
}

impl MediaGraph for MemoryGraph {
    fn make_node(&self, kind: &str, name: Option<&str>) -> Result<NodeId, GraphError> {
        let mut inner = self.shared.inner.lock();
        if inner.unavailable.contains(kind) {
            return Err(GraphError::MissingFactory(kind.to_string()));
        }

        let shape = Shape::of(kind);
        let id = NodeId(inner.next());
        let name = name
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}{}", kind, id.0));
        inner.nodes.insert(
            id,
            NodeEntry {
                kind: kind.to_string(),
                name,
                parent: None,
                children: Vec::new(),
                is_bin: shape.is_bin,
                live: shape.live,
                state: NodeState::Null,
                pending: None,
                last_result: StateChangeResult::Success,
                ports: Vec::new(),
                sink_template: shape.sink_template,
                src_template: shape.src_template,
                next_request: 0,
                properties: HashMap::new(),
            },
        );
        for sink in shape.sinks {
            inner.new_port(id, sink.to_string(), PortDirection::Sink, false);
        }
        for src in shape.srcs {
            inner.new_port(id, src.to_string(), PortDirection::Src, false);
        }
        Ok(id)
    }

    fn dispose_node(&self, node: NodeId) {
        let mut inner = self.shared.inner.lock();
        if let Some(parent) = inner.nodes.get(&node).and_then(|n| n.parent)
            && let Some(p) = inner.nodes.get_mut(&parent)
        {
            p.children.retain(|c| *c != node);
        }
        Self::destroy(&mut inner, node);
    }

    fn node_kind(&self, node: NodeId) -> Option<String> {
        self.shared.inner.lock().nodes.get(&node).map(|n| n.kind.clone())
    }

    fn add_to_bin(&self, bin: NodeId, node: NodeId) -> Result<(), GraphError> {
        let mut inner = self.shared.inner.lock();
        match inner.nodes.get(&bin) {
            Some(b) if b.is_bin => {}
            Some(_) => return Err(GraphError::NotABin(bin)),
            None => return Err(GraphError::UnknownNode(bin)),
        }
        let entry = inner
            .nodes
            .get_mut(&node)
            .ok_or(GraphError::UnknownNode(node))?;
        if let Some(parent) = entry.parent {
            return Err(GraphError::ForeignParent { node, parent });
        }
        entry.parent = Some(bin);
        if let Some(b) = inner.nodes.get_mut(&bin) {
            b.children.push(node);
        }
        Ok(())
    }

    fn remove_from_bin(&self, bin: NodeId, node: NodeId) -> Result<(), GraphError> {
        let mut inner = self.shared.inner.lock();
        let entry = inner
            .nodes
            .get_mut(&node)
            .ok_or(GraphError::UnknownNode(node))?;
        match entry.parent {
            Some(parent) if parent == bin => entry.parent = None,
            Some(parent) => return Err(GraphError::ForeignParent { node, parent }),
            None => return Ok(()),
        }
        let ports = entry.ports.clone();
        for port in ports {
            inner.unlink_port(port);
            inner.drop_gates_on(port);
        }
        if let Some(b) = inner.nodes.get_mut(&bin) {
            b.children.retain(|c| *c != node);
        }
        Ok(())
    }

    fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.shared.inner.lock().nodes.get(&node).and_then(|n| n.parent)
    }

    fn static_port(&self, node: NodeId, name: &str) -> Option<PortId> {
        let inner = self.shared.inner.lock();
        let entry = inner.nodes.get(&node)?;
        entry.ports.iter().copied().find(|p| {
            inner
                .ports
                .get(p)
                .is_some_and(|port| !port.dynamic && port.name == name)
        })
    }

    fn request_port(&self, node: NodeId, template: &str) -> Option<PortId> {
        let mut inner = self.shared.inner.lock();
        let entry = inner.nodes.get_mut(&node)?;
        let direction = if entry.src_template == Some(template) {
            PortDirection::Src
        } else if entry.sink_template == Some(template) {
            PortDirection::Sink
        } else {
            return None;
        };
        let name = template.replace("%u", &entry.next_request.to_string());
        entry.next_request += 1;
        Some(inner.new_port(node, name, direction, true))
    }

    fn release_port(&self, node: NodeId, port: PortId) {
        let mut inner = self.shared.inner.lock();
        if inner.ports.get(&port).is_none_or(|p| p.node != node || !p.dynamic) {
            return;
        }
        inner.unlink_port(port);
        inner.drop_gates_on(port);
        inner.ports.remove(&port);
        if let Some(entry) = inner.nodes.get_mut(&node) {
            entry.ports.retain(|p| *p != port);
        }
    }

    fn add_ghost_port(
        &self,
        bin: NodeId,
        name: &str,
        target: PortId,
    ) -> Result<PortId, GraphError> {
        let mut inner = self.shared.inner.lock();
        if !inner.nodes.get(&bin).is_some_and(|b| b.is_bin) {
            return Err(GraphError::NotABin(bin));
        }
        let direction = inner
            .ports
            .get(&target)
            .map(|p| p.direction)
            .ok_or(GraphError::UnknownPort(target))?;
        let ghost = inner.new_port(bin, name.to_string(), direction, false);
        if let Some(port) = inner.ports.get_mut(&ghost) {
            port.ghost_target = Some(target);
        }
        Ok(ghost)
    }

    fn port_owner(&self, port: PortId) -> Option<NodeId> {
        self.shared.inner.lock().ports.get(&port).map(|p| p.node)
    }

    fn port_direction(&self, port: PortId) -> Option<PortDirection> {
        self.shared.inner.lock().ports.get(&port).map(|p| p.direction)
    }

    fn peer(&self, port: PortId) -> Option<PortId> {
        self.shared.inner.lock().ports.get(&port).and_then(|p| p.peer)
    }

    fn link(&self, src: PortId, sink: PortId) -> Result<(), GraphError> {
        let mut inner = self.shared.inner.lock();
        let ok = matches!(
            (inner.ports.get(&src), inner.ports.get(&sink)),
            (Some(s), Some(k))
                if s.direction == PortDirection::Src
                    && k.direction == PortDirection::Sink
                    && s.peer.is_none()
                    && k.peer.is_none()
        );
        if !ok {
            return Err(GraphError::Link { src, sink });
        }
        if let Some(s) = inner.ports.get_mut(&src) {
            s.peer = Some(sink);
        }
        if let Some(k) = inner.ports.get_mut(&sink) {
            k.peer = Some(src);
        }
        self.shared.kick_gates(&mut inner);
        Ok(())
    }

    fn unlink(&self, src: PortId, sink: PortId) {
        let mut inner = self.shared.inner.lock();
        if inner.ports.get(&src).and_then(|p| p.peer) == Some(sink) {
            inner.unlink_port(src);
        }
    }

    fn sink_ports(&self, node: NodeId) -> Vec<PortId> {
        self.shared.inner.lock().ports_of(node, PortDirection::Sink)
    }

    fn src_ports(&self, node: NodeId) -> Vec<PortId> {
        self.shared.inner.lock().ports_of(node, PortDirection::Src)
    }

    fn set_port_active(&self, port: PortId, active: bool) {
        let mut inner = self.shared.inner.lock();
        if let Some(p) = inner.ports.get_mut(&port) {
            p.active = active;
        }
        if active {
            self.shared.kick_gates(&mut inner);
        }
    }

    fn set_state(&self, node: NodeId, state: NodeState) -> StateChangeResult {
        let mut inner = self.shared.inner.lock();
        let result = self.apply_state(&mut inner, node, state);
        self.shared.kick_gates(&mut inner);
        self.shared.settled.notify_all();
        result
    }

    /// Waits up to `timeout` for a pending change to resolve. A change still
    /// pending afterwards is reported as `Async`.
    fn state(&self, node: NodeId, timeout: Duration) -> StateSnapshot {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        while inner.nodes.get(&node).is_some_and(|n| n.pending.is_some()) {
            if self
                .shared
                .settled
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                break;
            }
        }
        match inner.nodes.get(&node) {
            Some(entry) => StateSnapshot {
                result: entry.last_result,
                current: entry.state,
                pending: entry.pending,
            },
            None => StateSnapshot {
                result: StateChangeResult::Failure,
                current: NodeState::Null,
                pending: None,
            },
        }
    }

    fn sync_state_with_parent(&self, node: NodeId) -> Result<(), GraphError> {
        let mut inner = self.shared.inner.lock();
        let parent = inner
            .nodes
            .get(&node)
            .ok_or(GraphError::UnknownNode(node))?
            .parent
            .ok_or(GraphError::UnknownNode(node))?;
        let target = inner
            .nodes
            .get(&parent)
            .map(|p| p.state)
            .ok_or(GraphError::UnknownNode(parent))?;
        let result = self.apply_state(&mut inner, node, target);
        self.shared.kick_gates(&mut inner);
        match result {
            StateChangeResult::Failure => Err(GraphError::StateChange(node)),
            _ => Ok(()),
        }
    }

    fn send_eos(&self, port: PortId) -> bool {
        if !self.shared.inner.lock().ports.contains_key(&port) {
            return false;
        }
        let shared = Arc::clone(&self.shared);
        self.shared
            .spawn(Box::new(move || shared.propagate_eos(port)));
        true
    }

    fn add_gate(&self, port: PortId, kind: GateKind, callback: GateCallback) -> Option<GateId> {
        let mut inner = self.shared.inner.lock();
        if !inner.ports.contains_key(&port) {
            return None;
        }
        let id = GateId(inner.next());
        inner.gates.insert(
            id,
            GateEntry {
                port,
                kind,
                callback: Some(callback),
                fired: false,
            },
        );
        self.shared.kick_gates(&mut inner);
        Some(id)
    }

    fn remove_gate(&self, port: PortId, gate: GateId) {
        let mut inner = self.shared.inner.lock();
        if inner.gates.get(&gate).is_some_and(|g| g.port == port) {
            inner.gates.remove(&gate);
        }
    }

    fn seek(&self, node: NodeId, request: SeekRequest) -> bool {
        let mut inner = self.shared.inner.lock();
        let streaming = inner.nodes.get(&node).is_some_and(|n| n.state.is_streaming());
        if !streaming || inner.rejected_seeks.contains(&node) {
            return false;
        }
        inner.seeks.push((node, request));
        inner.positions.insert(node, request.position);
        if request.flags.flush {
            // a flushing seek prerolls again and completes asynchronously
            self.shared
                .post(&inner, BusMessage::new(node, MessageKind::AsyncDone));
        }
        true
    }

    fn query_position(&self, node: NodeId) -> Option<Duration> {
        let inner = self.shared.inner.lock();
        if !inner.nodes.contains_key(&node) {
            return None;
        }
        Some(inner.positions.get(&node).copied().unwrap_or_default())
    }

    fn query_duration(&self, node: NodeId) -> Option<Duration> {
        self.shared.inner.lock().durations.get(&node).copied()
    }

    fn set_property(&self, node: NodeId, name: &str, value: PropertyValue) -> bool {
        let mut inner = self.shared.inner.lock();
        match inner.nodes.get_mut(&node) {
            Some(entry) => {
                entry.properties.insert(name.to_string(), value);
                true
            }
            None => false,
        }
    }

    fn property(&self, node: NodeId, name: &str) -> Option<PropertyValue> {
        self.shared
            .inner
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.properties.get(name).cloned())
    }

    fn watch_bus(&self, bin: NodeId, callback: BusCallback) -> Option<WatchId> {
        let mut inner = self.shared.inner.lock();
        if !inner.nodes.get(&bin).is_some_and(|b| b.is_bin) {
            return None;
        }
        let id = WatchId(inner.next());
        inner
            .watches
            .entry(bin)
            .or_default()
            .push((id, Arc::from(callback)));
        Some(id)
    }

    fn unwatch_bus(&self, bin: NodeId, watch: WatchId) {
        let mut inner = self.shared.inner.lock();
        if let Some(watchers) = inner.watches.get_mut(&bin) {
            watchers.retain(|(id, _)| *id != watch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn flowing_branch(graph: &MemoryGraph) -> (NodeId, NodeId, PortId) {
        let pipeline = graph.make_node("pipeline", None).unwrap();
        let src = graph.make_node("audiotestsrc", None).unwrap();
        let tee = graph.make_node("tee", None).unwrap();
        graph.add_to_bin(pipeline, src).unwrap();
        graph.add_to_bin(pipeline, tee).unwrap();
        graph
            .link(
                graph.static_port(src, "src").unwrap(),
                graph.static_port(tee, "sink").unwrap(),
            )
            .unwrap();
        let tee_src = graph.request_port(tee, "src_%u").unwrap();
        let sink = graph.make_node("fakesink", None).unwrap();
        graph.add_to_bin(pipeline, sink).unwrap();
        graph
            .link(tee_src, graph.static_port(sink, "sink").unwrap())
            .unwrap();
        (pipeline, src, tee_src)
    }

    #[test]
    fn test_request_ports_are_numbered() {
        let graph = MemoryGraph::new();
        let tee = graph.make_node("tee", None).unwrap();
        let a = graph.request_port(tee, "src_%u").unwrap();
        let b = graph.request_port(tee, "src_%u").unwrap();
        assert_ne!(a, b);
        assert!(graph.request_port(tee, "sink_%u").is_none());
        assert_eq!(graph.src_ports(tee).len(), 2);

        graph.release_port(tee, a);
        assert_eq!(graph.src_ports(tee), vec![b]);
    }

    #[test]
    fn test_bin_state_propagates() {
        let graph = MemoryGraph::new();
        let pipeline = graph.make_node("pipeline", None).unwrap();
        let queue = graph.make_node("queue", None).unwrap();
        graph.add_to_bin(pipeline, queue).unwrap();

        assert_eq!(
            graph.set_state(pipeline, NodeState::Playing),
            StateChangeResult::Success
        );
        assert_eq!(graph.current_state(queue), Some(NodeState::Playing));
    }

    #[test]
    fn test_live_source_reports_no_preroll() {
        let graph = MemoryGraph::new();
        let bin = graph.make_node("bin", None).unwrap();
        let mic = graph.make_node("autoaudiosrc", None).unwrap();
        graph.add_to_bin(bin, mic).unwrap();
        assert_eq!(
            graph.set_state(bin, NodeState::Paused),
            StateChangeResult::NoPreroll
        );
    }

    #[test]
    fn test_foreign_parent_rejected() {
        let graph = MemoryGraph::new();
        let a = graph.make_node("pipeline", None).unwrap();
        let b = graph.make_node("pipeline", None).unwrap();
        let q = graph.make_node("queue", None).unwrap();
        graph.add_to_bin(a, q).unwrap();
        assert!(matches!(
            graph.add_to_bin(b, q),
            Err(GraphError::ForeignParent { .. })
        ));
    }

    #[test]
    fn test_block_gate_fires_only_while_flowing() {
        let graph = MemoryGraph::new();
        let (pipeline, src, tee_src) = flowing_branch(&graph);
        graph.set_stalled(src, true);
        graph.set_state(pipeline, NodeState::Playing);

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        graph.add_gate(
            tee_src,
            GateKind::BlockDownstream,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                GateAction::Remove
            }),
        );
        graph.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        graph.set_stalled(src, false);
        graph.wait_idle();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(graph.gate_count(tee_src), 0);
    }

    #[test]
    fn test_event_gate_can_drop_eos() {
        let graph = MemoryGraph::new();
        let pipeline = graph.make_node("pipeline", None).unwrap();
        let queue = graph.make_node("queue", None).unwrap();
        let sink = graph.make_node("fakesink", None).unwrap();
        graph.add_to_bin(pipeline, queue).unwrap();
        graph.add_to_bin(pipeline, sink).unwrap();
        let queue_src = graph.static_port(queue, "src").unwrap();
        graph
            .link(queue_src, graph.static_port(sink, "sink").unwrap())
            .unwrap();

        graph.send_eos(graph.static_port(queue, "sink").unwrap());
        graph.wait_idle();
        assert!(graph.received_eos(sink));

        let sink2 = graph.make_node("fakesink", None).unwrap();
        let queue2 = graph.make_node("queue", None).unwrap();
        let queue2_src = graph.static_port(queue2, "src").unwrap();
        graph
            .link(queue2_src, graph.static_port(sink2, "sink").unwrap())
            .unwrap();
        graph.add_gate(
            queue2_src,
            GateKind::EventDownstream,
            Box::new(|info| match info {
                GateInfo::Event(StreamEvent::EndOfStream) => GateAction::Drop,
                _ => GateAction::Pass,
            }),
        );
        graph.send_eos(graph.static_port(queue2, "sink").unwrap());
        graph.wait_idle();
        assert!(!graph.received_eos(sink2));
    }

    #[test]
    fn test_bus_messages_reach_root_watchers_in_order() {
        let graph = MemoryGraph::new();
        let pipeline = graph.make_node("pipeline", None).unwrap();
        let queue = graph.make_node("queue", None).unwrap();
        graph.add_to_bin(pipeline, queue).unwrap();

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        graph.watch_bus(
            pipeline,
            Box::new(move |msg| log.lock().push(msg.kind.clone())),
        );

        graph.post_message(queue, MessageKind::Buffering(10));
        graph.post_message(queue, MessageKind::Buffering(55));
        graph.wait_idle();
        assert_eq!(
            *seen.lock(),
            vec![MessageKind::Buffering(10), MessageKind::Buffering(55)]
        );
    }

    #[test]
    fn test_remove_from_bin_unlinks() {
        let graph = MemoryGraph::new();
        let (pipeline, _src, tee_src) = flowing_branch(&graph);
        let sink_port = graph.peer(tee_src).unwrap();
        let sink = graph.port_owner(sink_port).unwrap();

        graph.remove_from_bin(pipeline, sink).unwrap();
        assert!(graph.peer(tee_src).is_none());
        assert!(graph.parent(sink).is_none());
        assert!(graph.exists(sink));

        graph.dispose_node(sink);
        assert!(!graph.exists(sink));
    }

    #[test]
    fn test_seek_requires_streaming_state() {
        let graph = MemoryGraph::new();
        let play = graph.make_node("playbin", None).unwrap();
        let request = SeekRequest {
            rate: 1.0,
            position: Duration::from_secs(3),
            flags: crate::graph::SeekFlags::FLUSH_ACCURATE,
        };
        assert!(!graph.seek(play, request));
        graph.set_state(play, NodeState::Paused);
        assert!(graph.seek(play, request));
        assert_eq!(graph.query_position(play), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_state_query_waits_for_pending_change() {
        let graph = Arc::new(MemoryGraph::new());
        let play = graph.make_node("playbin", None).unwrap();
        graph.script_state_result(play, StateChangeResult::Async);
        assert_eq!(graph.set_state(play, NodeState::Paused), StateChangeResult::Async);

        // a short wait reports the change as still pending
        let snapshot = graph.state(play, Duration::from_millis(10));
        assert_eq!(snapshot.result, StateChangeResult::Async);
        assert_eq!(snapshot.current, NodeState::Null);
        assert_eq!(snapshot.pending, Some(NodeState::Paused));

        let completer = {
            let graph = Arc::clone(&graph);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                graph.complete_pending(play);
            })
        };
        let snapshot = graph.state(play, Duration::from_secs(5));
        completer.join().unwrap();
        assert_eq!(snapshot.result, StateChangeResult::Success);
        assert_eq!(snapshot.current, NodeState::Paused);
        assert_eq!(snapshot.pending, None);
    }
}
