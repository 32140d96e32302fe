//! Shared pipeline
//!
//! `SharedPipeline` owns one pipeline bin that stays PLAYING for its whole
//! life. Consumers attach their sink to a named source with
//! [`SharedPipeline::connect`]; the source and its fan-out are built on first
//! use and shared by every later attachment. [`SharedPipeline::disconnect`]
//! returns immediately and removes the branch once its data has drained (see
//! [`super::teardown`]).
//!
//! `connect`, `disconnect` and task dispatch are meant for the control
//! thread. Registry and graph membership are only mutated there.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::health::{HealthMonitor, HubHealth};
use super::idle::IdleQueue;
use super::registry::{SourceFactory, SourcePolicy, SourceRegistry, remove_source_nodes};
use super::teardown::{self, IdleTask, TeardownJob};
use crate::config::HubConfig;
use crate::error::GraphError;
use crate::graph::{
    BusMessage, GateKind, MediaGraph, MessageKind, NodeId, NodeState, PortId, StateChangeResult,
    WatchId, port_or_static,
};

/// An active fan-out branch feeding one sink port
#[derive(Debug, Clone, PartialEq, Eq)]
struct Attachment {
    queue: NodeId,
    fanout_port: PortId,
    sink: NodeId,
}

#[derive(Default)]
struct HubState {
    registry: SourceRegistry,
    attachments: HashMap<(String, PortId), Attachment>,
    pending_teardowns: usize,
    /// Sinks their owner gave up while a branch still drained into them
    released_sinks: HashSet<NodeId>,
}

pub struct SharedPipeline {
    graph: Arc<dyn MediaGraph>,
    config: HubConfig,
    pipeline: NodeId,
    state: Mutex<HubState>,
    idle: IdleQueue<IdleTask>,
    health: Arc<HubHealth>,
    cancel: CancellationToken,
    bus_watch: Mutex<Option<WatchId>>,
}

/// Nodes and ports added by a connect that has not completed yet
struct BranchBuild {
    fanout: NodeId,
    fanout_port: Option<PortId>,
    queue: Option<NodeId>,
    sink: NodeId,
    sink_added: bool,
}

impl SharedPipeline {
    /// Create the pipeline bin, watch its bus and set it PLAYING.
    pub fn new(graph: Arc<dyn MediaGraph>, config: HubConfig) -> Result<Arc<Self>, GraphError> {
        let pipeline = graph.make_node("pipeline", Some(&config.pipeline_name))?;

        let hub = Arc::new(Self {
            graph: Arc::clone(&graph),
            config,
            pipeline,
            state: Mutex::new(HubState::default()),
            idle: IdleQueue::new(),
            health: Arc::new(HubHealth::new()),
            cancel: CancellationToken::new(),
            bus_watch: Mutex::new(None),
        });

        let weak = Arc::downgrade(&hub);
        let watch = graph.watch_bus(
            pipeline,
            Box::new(move |message| {
                if let Some(hub) = weak.upgrade() {
                    hub.handle_bus_message(message);
                }
            }),
        );
        *hub.bus_watch.lock() = watch;

        if graph.set_state(pipeline, NodeState::Playing) == StateChangeResult::Failure {
            error!("SharedPipeline: failed to start {}", pipeline);
            hub.release_pipeline();
            return Err(GraphError::StateChange(pipeline));
        }

        info!(
            "SharedPipeline: '{}' running as {}",
            hub.config.pipeline_name, pipeline
        );
        Ok(hub)
    }

    pub fn graph(&self) -> &Arc<dyn MediaGraph> {
        &self.graph
    }

    pub fn pipeline(&self) -> NodeId {
        self.pipeline
    }

    pub fn health(&self) -> Arc<HubHealth> {
        Arc::clone(&self.health)
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a factory whose sources are removed once unused.
    pub fn register_factory(&self, factory: Arc<dyn SourceFactory>, source_id: &str) {
        self.register_factory_with_policy(factory, source_id, SourcePolicy::default());
    }

    pub fn register_factory_with_policy(
        &self,
        factory: Arc<dyn SourceFactory>,
        source_id: &str,
        policy: SourcePolicy,
    ) {
        self.state
            .lock()
            .registry
            .register_factory(factory, source_id, policy);
    }

    pub fn deregister_factory(&self, source_id: &str) -> bool {
        self.state.lock().registry.deregister_factory(source_id)
    }

    pub fn has_source(&self, source_id: &str) -> bool {
        self.state.lock().registry.get(source_id).is_some()
    }

    pub fn source_node(&self, source_id: &str) -> Option<NodeId> {
        self.state.lock().registry.get(source_id).map(|r| r.node)
    }

    pub fn attachment_count(&self, source_id: &str) -> usize {
        self.state
            .lock()
            .attachments
            .keys()
            .filter(|(id, _)| id == source_id)
            .count()
    }

    pub fn pending_teardowns(&self) -> usize {
        self.state.lock().pending_teardowns
    }

    /// Attach `sink` to the source `source_id`.
    ///
    /// `sink_port` defaults to the sink's static "sink" port. On failure the
    /// graph is left exactly as it was.
    ///
    /// A port still linked to a branch that is draining counts as attached:
    /// the connect fails with `AlreadyAttached` until that teardown has run.
    /// Sinks that need to re-attach at once offer another port.
    pub fn connect(&self, source_id: &str, sink: NodeId, sink_port: Option<PortId>) -> bool {
        match self.try_connect(source_id, sink, sink_port) {
            Ok(created) => {
                self.health.record_attach(created);
                true
            }
            Err(e) => {
                warn!(
                    "SharedPipeline: connect '{}' -> {} failed: {}",
                    source_id, sink, e
                );
                self.health.record_connect_failure();
                false
            }
        }
    }

    fn try_connect(
        &self,
        source_id: &str,
        sink: NodeId,
        sink_port: Option<PortId>,
    ) -> Result<bool, GraphError> {
        if source_id.is_empty() {
            return Err(GraphError::EmptySourceId);
        }
        let graph = self.graph.as_ref();
        if graph.node_kind(sink).is_none() {
            return Err(GraphError::UnknownNode(sink));
        }
        let sink_port =
            port_or_static(graph, sink, sink_port, "sink").ok_or_else(|| GraphError::NoSuchPort {
                node: sink,
                name: "sink".to_string(),
            })?;

        let sink_added = match graph.parent(sink) {
            Some(parent) if parent == self.pipeline => false,
            Some(parent) => return Err(GraphError::ForeignParent { node: sink, parent }),
            None => true,
        };

        let mut state = self.state.lock();
        let key = (source_id.to_string(), sink_port);
        if state.attachments.contains_key(&key) || graph.peer(sink_port).is_some() {
            return Err(GraphError::AlreadyAttached(sink_port));
        }

        let pending = state.registry.resolve_or_create(
            graph,
            self.pipeline,
            &self.config.fanout_node_kind,
            source_id,
        )?;

        let mut build = BranchBuild {
            fanout: pending.fanout,
            fanout_port: None,
            queue: None,
            sink,
            sink_added: false,
        };

        let linked = self.build_branch(&mut build, sink_port, sink_added).and_then(|_| {
            if pending.created {
                // downstream first so the branch is ready before data flows
                graph.sync_state_with_parent(pending.fanout)?;
                graph.sync_state_with_parent(pending.node)?;
            }
            Ok(())
        });

        if let Err(e) = linked {
            self.rollback(build);
            state
                .registry
                .discard(graph, self.pipeline, pending);
            return Err(e);
        }

        let (Some(queue), Some(fanout_port)) = (build.queue, build.fanout_port) else {
            return Err(GraphError::Resolution(source_id.to_string()));
        };

        state.registry.commit(&pending);
        state.attachments.insert(
            key,
            Attachment {
                queue,
                fanout_port,
                sink,
            },
        );

        info!(
            "SharedPipeline: attached {} to '{}' via {} ({} attachment(s))",
            sink,
            source_id,
            queue,
            state
                .attachments
                .keys()
                .filter(|(id, _)| id == source_id)
                .count()
        );
        Ok(pending.created)
    }

    fn build_branch(
        &self,
        build: &mut BranchBuild,
        sink_port: PortId,
        add_sink: bool,
    ) -> Result<(), GraphError> {
        let graph = self.graph.as_ref();

        let fanout_port = graph
            .request_port(build.fanout, "src_%u")
            .ok_or_else(|| GraphError::NoSuchPort {
                node: build.fanout,
                name: "src_%u".to_string(),
            })?;
        build.fanout_port = Some(fanout_port);

        let queue = graph.make_node(&self.config.buffer_node_kind, None)?;
        build.queue = Some(queue);
        graph.add_to_bin(self.pipeline, queue)?;

        let queue_sink = graph
            .static_port(queue, "sink")
            .ok_or_else(|| GraphError::NoSuchPort {
                node: queue,
                name: "sink".to_string(),
            })?;
        let queue_src = graph
            .static_port(queue, "src")
            .ok_or_else(|| GraphError::NoSuchPort {
                node: queue,
                name: "src".to_string(),
            })?;
        graph.link(fanout_port, queue_sink)?;

        if add_sink {
            graph.add_to_bin(self.pipeline, build.sink)?;
            build.sink_added = true;
        }
        graph.link(queue_src, sink_port)?;

        if build.sink_added {
            graph.sync_state_with_parent(build.sink)?;
        }
        graph.sync_state_with_parent(queue)?;
        Ok(())
    }

    fn rollback(&self, build: BranchBuild) {
        let graph = self.graph.as_ref();
        if let Some(queue) = build.queue {
            graph.set_state(queue, NodeState::Null);
            if graph.parent(queue) == Some(self.pipeline)
                && let Err(e) = graph.remove_from_bin(self.pipeline, queue)
            {
                warn!("SharedPipeline: rollback of {} failed: {}", queue, e);
            }
            graph.dispose_node(queue);
        }
        if let Some(port) = build.fanout_port {
            graph.release_port(build.fanout, port);
        }
        if build.sink_added {
            graph.set_state(build.sink, NodeState::Null);
            if let Err(e) = graph.remove_from_bin(self.pipeline, build.sink) {
                warn!("SharedPipeline: rollback of {} failed: {}", build.sink, e);
            }
        }
    }

    /// Detach `sink` from `source_id`.
    ///
    /// Returns once the teardown is armed; the branch is removed later on the
    /// control thread. Returns false when there is nothing to detach.
    pub fn disconnect(&self, source_id: &str, sink: NodeId, sink_port: Option<PortId>) -> bool {
        if source_id.is_empty() {
            return false;
        }
        let graph = self.graph.as_ref();
        let Some(sink_port) = port_or_static(graph, sink, sink_port, "sink") else {
            return false;
        };

        let mut state = self.state.lock();
        let Some(fanout) = state.registry.get(source_id).map(|r| r.fanout) else {
            debug!("SharedPipeline: disconnect of unknown source '{}'", source_id);
            return false;
        };
        let Some(attachment) = state.attachments.remove(&(source_id.to_string(), sink_port)) else {
            debug!(
                "SharedPipeline: {} is not attached to '{}'",
                sink, source_id
            );
            return false;
        };

        let (queue, fanout_port) = self
            .walk_branch(&state.registry, source_id, fanout, sink_port)
            .unwrap_or_else(|| {
                warn!(
                    "SharedPipeline: branch of {} no longer matches the graph, using recorded nodes",
                    sink
                );
                (attachment.queue, attachment.fanout_port)
            });

        if let Some(record) = state.registry.get_mut(source_id) {
            record.draining += 1;
        }
        state.pending_teardowns += 1;
        drop(state);

        let slot = teardown::new_slot(TeardownJob {
            source_id: source_id.to_string(),
            fanout,
            fanout_port,
            queue,
            sink: attachment.sink,
            sink_port,
        });

        let gate = graph.add_gate(
            fanout_port,
            GateKind::BlockDownstream,
            teardown::block_gate(
                Arc::downgrade(&self.graph),
                self.idle.handle(),
                Arc::clone(&slot),
            ),
        );
        if gate.is_none() {
            self.idle.schedule(IdleTask::RemoveBranch(Arc::clone(&slot)));
        }
        self.idle
            .schedule_after(self.config.drain_timeout, IdleTask::ForceTeardown(slot));

        self.health.record_detach();
        debug!(
            "SharedPipeline: teardown of {} from '{}' armed on {}",
            sink, source_id, fanout_port
        );
        true
    }

    /// Follow sink port -> buffer node -> fan-out port -> source.
    fn walk_branch(
        &self,
        registry: &SourceRegistry,
        source_id: &str,
        fanout: NodeId,
        sink_port: PortId,
    ) -> Option<(NodeId, PortId)> {
        let graph = self.graph.as_ref();
        let queue = graph.port_owner(graph.peer(sink_port)?)?;
        let fanout_port = graph.peer(graph.static_port(queue, "sink")?)?;
        if graph.port_owner(fanout_port)? != fanout {
            return None;
        }
        let source_port = graph.peer(graph.static_port(fanout, "sink")?)?;
        let source_node = graph.port_owner(source_port)?;
        (registry.source_for(source_node, source_port)? == source_id).then_some((queue, fanout_port))
    }

    /// Run every ready control-thread task without blocking.
    pub fn dispatch_pending(&self) -> usize {
        self.idle.dispatch_pending(|task| self.run_task(task))
    }

    fn run_task(&self, task: IdleTask) {
        let (slot, forced) = match task {
            IdleTask::RemoveBranch(slot) => (slot, false),
            IdleTask::ForceTeardown(slot) => (slot, true),
        };
        let Some(job) = slot.lock().take() else {
            return;
        };
        if forced {
            warn!(
                "SharedPipeline: drain of {} ('{}') timed out, forcing removal",
                job.queue, job.source_id
            );
        }
        self.remove_branch(job, forced);
    }

    /// Phase 3: remove the buffer node, release the fan-out port, then the
    /// sink and the source if nothing uses them any more.
    fn remove_branch(&self, job: TeardownJob, forced: bool) {
        let graph = self.graph.as_ref();

        graph.set_port_active(job.fanout_port, false);
        if let Some(queue_src) = graph.static_port(job.queue, "src") {
            graph.set_port_active(queue_src, false);
        }
        graph.set_state(job.queue, NodeState::Null);
        if let Err(e) = graph.remove_from_bin(self.pipeline, job.queue) {
            warn!("SharedPipeline: removing {} failed: {}", job.queue, e);
        }
        graph.dispose_node(job.queue);
        graph.release_port(job.fanout, job.fanout_port);

        // the sink belongs to its backend unless the backend released it
        let sink_in_use = graph
            .sink_ports(job.sink)
            .iter()
            .any(|p| graph.peer(*p).is_some());
        let mut sink_left = false;
        if !sink_in_use && graph.parent(job.sink) == Some(self.pipeline) {
            graph.set_state(job.sink, NodeState::Null);
            match graph.remove_from_bin(self.pipeline, job.sink) {
                Ok(()) => {
                    sink_left = true;
                    debug!("SharedPipeline: sink {} left the pipeline", job.sink);
                }
                Err(e) => warn!("SharedPipeline: removing sink {} failed: {}", job.sink, e),
            }
        }

        let mut state = self.state.lock();
        if sink_left && state.released_sinks.remove(&job.sink) {
            graph.dispose_node(job.sink);
            debug!("SharedPipeline: released sink {} disposed", job.sink);
        }
        state.pending_teardowns = state.pending_teardowns.saturating_sub(1);
        let still_attached = state
            .attachments
            .keys()
            .any(|(id, _)| *id == job.source_id);

        let remove = match state.registry.get_mut(&job.source_id) {
            Some(record) => {
                record.draining = record.draining.saturating_sub(1);
                !still_attached && record.draining == 0 && record.policy.remove_when_unused
            }
            None => false,
        };
        if remove && let Some(record) = state.registry.remove(&job.source_id) {
            remove_source_nodes(graph, self.pipeline, record.node, record.fanout);
            self.health.record_source_removed();
            info!("SharedPipeline: removed unused source '{}'", job.source_id);
        }
        drop(state);

        self.health.record_branch_removed(forced);
        debug!(
            "SharedPipeline: branch {} of '{}' removed",
            job.queue, job.source_id
        );
    }

    /// Take ownership of a sink its backend no longer wants.
    ///
    /// A sink still inside the pipeline is disposed by the teardown that
    /// takes it out. Any other sink is disposed now.
    pub fn release_sink(&self, sink: NodeId) {
        let graph = self.graph.as_ref();
        {
            let mut state = self.state.lock();
            if graph.parent(sink) == Some(self.pipeline) && !self.cancel.is_cancelled() {
                debug!("SharedPipeline: sink {} released, waiting for its branches", sink);
                state.released_sinks.insert(sink);
                return;
            }
        }
        self.dispose_sink(sink);
    }

    fn dispose_sink(&self, sink: NodeId) {
        let graph = self.graph.as_ref();
        graph.set_state(sink, NodeState::Null);
        if let Some(parent) = graph.parent(sink)
            && let Err(e) = graph.remove_from_bin(parent, sink)
        {
            warn!("SharedPipeline: cannot unparent sink {}: {}", sink, e);
        }
        graph.dispose_node(sink);
    }

    /// Log errors posted on the shared pipeline bus. Teardown is left to
    /// the players.
    pub fn handle_bus_message(&self, message: &BusMessage) -> bool {
        if let MessageKind::Error { code, text } = &message.kind {
            error!(
                "SharedPipeline: error from {}: {} (code {})",
                message.source, text, code
            );
            self.health.record_bus_error();
        }
        true
    }

    /// Drive the control-thread queue until [`SharedPipeline::shutdown`].
    pub async fn run(self: Arc<Self>) {
        let mut health_tick = tokio::time::interval(self.config.health_interval);
        let mut monitor = HealthMonitor::new();
        loop {
            self.dispatch_pending();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.idle.wait() => {}
                _ = health_tick.tick() => {
                    info!("SharedPipeline: {}", self.health.summary());
                    for alert in monitor.check(&self.health) {
                        warn!("SharedPipeline: {}", alert);
                    }
                }
            }
        }
        info!("SharedPipeline: control loop stopped");
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the control loop, drop queued teardowns and stop the pipeline.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let dropped = self.idle.close();
        if dropped > 0 {
            debug!("SharedPipeline: dropped {} queued task(s)", dropped);
        }
        self.release_pipeline();
        let released: Vec<NodeId> = self.state.lock().released_sinks.drain().collect();
        for sink in released {
            self.dispose_sink(sink);
        }
        info!("SharedPipeline: shut down");
    }

    fn release_pipeline(&self) {
        if let Some(watch) = self.bus_watch.lock().take() {
            self.graph.unwatch_bus(self.pipeline, watch);
        }
        self.graph.set_state(self.pipeline, NodeState::Null);
    }
}

impl Drop for SharedPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryGraph;
    use std::time::Duration;

    struct Fixture {
        graph: Arc<MemoryGraph>,
        hub: Arc<SharedPipeline>,
    }

    fn fixture(config: HubConfig) -> Fixture {
        let graph = Arc::new(MemoryGraph::new());
        let dyn_graph: Arc<dyn MediaGraph> = graph.clone();
        let hub = SharedPipeline::new(dyn_graph, config).unwrap();
        hub.register_factory(
            Arc::new(|graph: &dyn MediaGraph, _id: &str| {
                graph.make_node("audiotestsrc", None).ok().map(|n| (n, None))
            }),
            "mic1",
        );
        Fixture { graph, hub }
    }

    fn sink(graph: &MemoryGraph) -> NodeId {
        graph.make_node("fakesink", None).unwrap()
    }

    /// Let the streaming thread run the gates, then run control-thread tasks.
    fn settle(f: &Fixture) {
        for _ in 0..3 {
            f.graph.wait_idle();
            f.hub.dispatch_pending();
        }
    }

    #[test]
    fn test_two_sinks_share_one_source() {
        let f = fixture(HubConfig::default());
        let a = sink(&f.graph);
        let b = sink(&f.graph);
        let pipeline = f.hub.pipeline();

        assert!(f.hub.connect("mic1", a, None));
        assert!(f.hub.connect("mic1", b, None));
        assert_eq!(f.graph.children_of_kind(pipeline, "audiotestsrc").len(), 1);
        assert_eq!(f.graph.children_of_kind(pipeline, "tee").len(), 1);
        assert_eq!(f.graph.children_of_kind(pipeline, "queue").len(), 2);
        assert_eq!(f.hub.attachment_count("mic1"), 2);
        assert_eq!(f.graph.current_state(a), Some(NodeState::Playing));

        assert!(f.hub.disconnect("mic1", a, None));
        settle(&f);
        assert!(!f.graph.contains(pipeline, a));
        assert!(f.hub.has_source("mic1"));
        assert_eq!(f.graph.children_of_kind(pipeline, "queue").len(), 1);
        // the sink is owned by the caller
        assert!(f.graph.exists(a));

        assert!(f.hub.disconnect("mic1", b, None));
        settle(&f);
        assert!(!f.hub.has_source("mic1"));
        assert!(f.graph.children_of_kind(pipeline, "audiotestsrc").is_empty());
        assert!(f.graph.children_of_kind(pipeline, "tee").is_empty());
        assert_eq!(f.hub.pending_teardowns(), 0);
        assert_eq!(f.hub.health().summary().branches_drained, 2);
    }

    #[test]
    fn test_disconnect_twice_is_noop() {
        let f = fixture(HubConfig::default());
        let a = sink(&f.graph);
        let b = sink(&f.graph);
        assert!(f.hub.connect("mic1", a, None));
        assert!(f.hub.connect("mic1", b, None));

        assert!(f.hub.disconnect("mic1", a, None));
        assert!(!f.hub.disconnect("mic1", a, None));
        settle(&f);
        assert!(!f.hub.disconnect("mic1", a, None));
        assert_eq!(f.hub.attachment_count("mic1"), 1);
        assert!(f.hub.has_source("mic1"));
    }

    #[test]
    fn test_disconnect_unknown_source() {
        let f = fixture(HubConfig::default());
        let a = sink(&f.graph);
        assert!(!f.hub.disconnect("mic1", a, None));
        assert!(!f.hub.disconnect("", a, None));
    }

    #[test]
    fn test_failed_connect_leaves_no_orphans() {
        let f = fixture(HubConfig::default());
        f.graph.mark_unavailable("queue");
        let pipeline = f.hub.pipeline();
        let a = sink(&f.graph);

        assert!(!f.hub.connect("mic1", a, None));
        assert!(!f.hub.has_source("mic1"));
        assert!(f.graph.children_of_kind(pipeline, "audiotestsrc").is_empty());
        assert!(f.graph.children_of_kind(pipeline, "tee").is_empty());
        assert!(!f.graph.contains(pipeline, a));
        assert_eq!(f.hub.health().summary().connect_failures, 1);
    }

    #[test]
    fn test_connect_preconditions() {
        let f = fixture(HubConfig::default());
        let a = sink(&f.graph);
        assert!(!f.hub.connect("", a, None));
        assert!(!f.hub.connect("cam9", a, None));
        assert!(!f.hub.connect("mic1", NodeId(9999), None));

        // sink owned by another pipeline
        let other = f.graph.make_node("pipeline", None).unwrap();
        let foreign = sink(&f.graph);
        f.graph.add_to_bin(other, foreign).unwrap();
        assert!(!f.hub.connect("mic1", foreign, None));

        assert!(f.hub.connect("mic1", a, None));
        assert!(!f.hub.connect("mic1", a, None));
        assert_eq!(f.hub.attachment_count("mic1"), 1);
    }

    #[test]
    fn test_unrelated_detach_keeps_source() {
        let f = fixture(HubConfig::default());
        let a = sink(&f.graph);
        let b = sink(&f.graph);
        assert!(f.hub.connect("mic1", a, None));
        let node = f.hub.source_node("mic1").unwrap();

        // b was never attached
        assert!(!f.hub.disconnect("mic1", b, None));
        settle(&f);
        assert_eq!(f.hub.source_node("mic1"), Some(node));
        assert!(f.graph.exists(node));
    }

    #[test]
    fn test_stalled_source_is_forced_down() {
        let f = fixture(HubConfig {
            drain_timeout: Duration::from_millis(100),
            ..HubConfig::default()
        });
        let a = sink(&f.graph);
        assert!(f.hub.connect("mic1", a, None));
        let node = f.hub.source_node("mic1").unwrap();
        f.graph.set_stalled(node, true);

        assert!(f.hub.disconnect("mic1", a, None));
        settle(&f);
        assert!(f.hub.has_source("mic1"));
        assert_eq!(f.hub.pending_teardowns(), 1);

        std::thread::sleep(Duration::from_millis(150));
        settle(&f);
        assert!(!f.hub.has_source("mic1"));
        assert!(!f.graph.exists(node));
        assert_eq!(f.hub.health().forced_teardowns(), 1);
    }

    #[test]
    fn test_timeout_after_drain_is_harmless() {
        let f = fixture(HubConfig {
            drain_timeout: Duration::from_millis(10),
            ..HubConfig::default()
        });
        let a = sink(&f.graph);
        assert!(f.hub.connect("mic1", a, None));
        assert!(f.hub.disconnect("mic1", a, None));
        settle(&f);
        assert!(!f.hub.has_source("mic1"));

        std::thread::sleep(Duration::from_millis(30));
        settle(&f);
        assert_eq!(f.hub.health().summary().branches_drained, 1);
        assert_eq!(f.hub.health().forced_teardowns(), 0);
    }

    #[test]
    fn test_reconnect_during_teardown_keeps_source() {
        let f = fixture(HubConfig::default());
        let a = sink(&f.graph);
        let b = sink(&f.graph);
        assert!(f.hub.connect("mic1", a, None));
        let node = f.hub.source_node("mic1").unwrap();
        f.graph.set_stalled(node, true);

        assert!(f.hub.disconnect("mic1", a, None));
        assert!(f.hub.connect("mic1", b, None));
        f.graph.set_stalled(node, false);
        settle(&f);

        assert_eq!(f.hub.source_node("mic1"), Some(node));
        assert_eq!(f.hub.attachment_count("mic1"), 1);
    }

    #[test]
    fn test_same_port_waits_for_teardown() {
        let f = fixture(HubConfig::default());
        let a = sink(&f.graph);
        assert!(f.hub.connect("mic1", a, None));
        assert!(f.hub.disconnect("mic1", a, None));

        // the old branch still holds the port
        assert!(!f.hub.connect("mic1", a, None));
        assert_eq!(f.hub.health().summary().connect_failures, 1);

        settle(&f);
        assert!(f.hub.connect("mic1", a, None));
        assert_eq!(f.graph.parent(a), Some(f.hub.pipeline()));
    }

    #[test]
    fn test_released_sink_outlives_draining_branch() {
        let f = fixture(HubConfig::default());
        let a = sink(&f.graph);
        assert!(f.hub.connect("mic1", a, None));
        let node = f.hub.source_node("mic1").unwrap();
        f.graph.set_stalled(node, true);

        assert!(f.hub.disconnect("mic1", a, None));
        f.hub.release_sink(a);
        settle(&f);
        assert!(f.graph.exists(a));
        assert_eq!(f.graph.parent(a), Some(f.hub.pipeline()));

        f.graph.set_stalled(node, false);
        settle(&f);
        assert!(!f.graph.exists(a));
        assert!(!f.hub.has_source("mic1"));
    }

    #[test]
    fn test_release_of_detached_sink_disposes_now() {
        let f = fixture(HubConfig::default());
        let a = sink(&f.graph);
        f.hub.release_sink(a);
        assert!(!f.graph.exists(a));
    }

    #[test]
    fn test_shutdown_disposes_released_sinks() {
        let f = fixture(HubConfig::default());
        let a = sink(&f.graph);
        assert!(f.hub.connect("mic1", a, None));
        assert!(f.hub.disconnect("mic1", a, None));
        f.hub.release_sink(a);
        assert!(f.graph.exists(a));

        f.hub.shutdown();
        assert!(!f.graph.exists(a));
    }

    #[test]
    fn test_keep_policy_leaves_source_running() {
        let f = fixture(HubConfig::default());
        f.hub.register_factory_with_policy(
            Arc::new(|graph: &dyn MediaGraph, _id: &str| {
                graph.make_node("audiotestsrc", None).ok().map(|n| (n, None))
            }),
            "line-in",
            SourcePolicy {
                remove_when_unused: false,
            },
        );
        let a = sink(&f.graph);
        assert!(f.hub.connect("line-in", a, None));
        assert!(f.hub.disconnect("line-in", a, None));
        settle(&f);
        assert!(f.hub.has_source("line-in"));
        assert_eq!(f.hub.attachment_count("line-in"), 0);
    }

    #[test]
    fn test_bus_errors_are_counted() {
        let f = fixture(HubConfig::default());
        f.graph.post_message(
            f.hub.pipeline(),
            MessageKind::Error {
                code: 3,
                text: "device lost".to_string(),
            },
        );
        f.graph.wait_idle();
        assert_eq!(f.hub.health().bus_errors(), 1);
    }

    #[tokio::test]
    async fn test_control_loop_runs_teardown() {
        let f = fixture(HubConfig::default());
        let runner = tokio::spawn(Arc::clone(&f.hub).run());

        let a = sink(&f.graph);
        assert!(f.hub.connect("mic1", a, None));
        assert!(f.hub.disconnect("mic1", a, None));
        for _ in 0..50 {
            if !f.hub.has_source("mic1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.hub.has_source("mic1"));

        f.hub.shutdown();
        runner.await.unwrap();
        assert_eq!(
            f.graph.current_state(f.hub.pipeline()),
            Some(NodeState::Null)
        );
    }
}
