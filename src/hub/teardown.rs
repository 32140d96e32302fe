//! Drain-safe branch teardown
//!
//! A disconnect turns into a [`TeardownJob`] stored in a one-shot
//! [`JobSlot`]. Two gates run on the streaming thread:
//!
//! 1. the block gate on the fan-out output port stops new data from entering
//!    the branch, then pushes end-of-stream into the buffer node and arms
//! 2. the drain gate on the buffer output port, which swallows that
//!    end-of-stream and schedules removal on the control thread.
//!
//! A fallback timeout schedules the same removal if the gates never fire.
//! Whichever task runs first takes the job out of the slot; the other finds
//! it empty.

use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

use super::idle::IdleHandle;
use crate::graph::{
    GateAction, GateCallback, GateInfo, GateKind, MediaGraph, NodeId, PortId, StreamEvent,
};

/// Everything phase 3 needs to remove one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownJob {
    pub source_id: String,
    pub fanout: NodeId,
    /// Dynamic fan-out port feeding the branch
    pub fanout_port: PortId,
    pub queue: NodeId,
    pub sink: NodeId,
    pub sink_port: PortId,
}

pub type JobSlot = Arc<Mutex<Option<TeardownJob>>>;

pub fn new_slot(job: TeardownJob) -> JobSlot {
    Arc::new(Mutex::new(Some(job)))
}

/// Work executed on the control thread
pub enum IdleTask {
    /// Drain finished normally
    RemoveBranch(JobSlot),
    /// The drain did not finish within the configured timeout
    ForceTeardown(JobSlot),
}

/// Phase 1: fires once the fan-out port is blocked.
pub fn block_gate(
    graph: Weak<dyn MediaGraph>,
    idle: IdleHandle<IdleTask>,
    slot: JobSlot,
) -> GateCallback {
    let mut drained = false;
    Box::new(move |info| {
        if info != GateInfo::Blocked || drained {
            return GateAction::Pass;
        }
        let Some(graph) = graph.upgrade() else {
            return GateAction::Remove;
        };
        let Some(job) = slot.lock().clone() else {
            // forced teardown already ran
            return GateAction::Remove;
        };
        drained = true;

        debug!(
            "Teardown[{}]: {} blocked, draining {}",
            job.source_id, job.fanout_port, job.queue
        );

        let queue_src = graph.static_port(job.queue, "src");
        let queue_sink = graph.static_port(job.queue, "sink");
        let (Some(queue_src), Some(queue_sink)) = (queue_src, queue_sink) else {
            warn!(
                "Teardown[{}]: buffer node {} lost its ports, removing directly",
                job.source_id, job.queue
            );
            idle.schedule(IdleTask::RemoveBranch(Arc::clone(&slot)));
            return GateAction::Pass;
        };

        let armed = graph.add_gate(
            queue_src,
            GateKind::EventDownstream,
            drain_gate(idle.clone(), Arc::clone(&slot)),
        );
        if armed.is_none() || !graph.send_eos(queue_sink) {
            idle.schedule(IdleTask::RemoveBranch(Arc::clone(&slot)));
        }
        GateAction::Pass
    })
}

/// Phase 2: swallows the end-of-stream leaving the buffer node.
pub fn drain_gate(idle: IdleHandle<IdleTask>, slot: JobSlot) -> GateCallback {
    Box::new(move |info| match info {
        GateInfo::Event(StreamEvent::EndOfStream) => {
            idle.schedule(IdleTask::RemoveBranch(Arc::clone(&slot)));
            GateAction::Drop
        }
        _ => GateAction::Pass,
    })
}
