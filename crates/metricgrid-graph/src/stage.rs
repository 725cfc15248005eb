//! Stages: one worker role, one intake queue, one worker per consumer thread.
//!
//! `tell` is the only way records move between stages. A routed stage asks
//! its selector for the owner of the record first; records owned by another
//! peer are forwarded once through the remote client manager, everything
//! else goes into the local queue.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use metricgrid_cluster::{Peer, RemoteClientManager};
use metricgrid_core::{MergeError, Record, RoleId};
use metricgrid_queue::{Backpressure, Consumer, IntakeQueue, QueueResult, QueueStats};

use crate::error::{GraphError, GraphResult};
use crate::role::WorkerRole;

/// Longest a record forwarded by a peer waits for a slot in a full stage
/// queue configured with [`Backpressure::Blocking`].
pub const FORWARDED_WAIT: Duration = Duration::from_millis(500);

pub struct Stage {
    role: Arc<WorkerRole>,
    queue: IntakeQueue<Record>,
    remote: Arc<RemoteClientManager>,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage").field("role", &self.role).finish_non_exhaustive()
    }
}

impl Stage {
    pub(crate) fn new(
        role: Arc<WorkerRole>,
        queue: IntakeQueue<Record>,
        remote: Arc<RemoteClientManager>,
    ) -> Self {
        Self {
            role,
            queue,
            remote,
        }
    }

    pub fn role(&self) -> &Arc<WorkerRole> {
        &self.role
    }

    pub fn id(&self) -> RoleId {
        self.role.id()
    }

    pub(crate) fn queue(&self) -> &IntakeQueue<Record> {
        &self.queue
    }

    /// Owner of `record` when it is a remote peer. `None` means the record
    /// is processed here, either because the stage is unrouted or because
    /// the selector picked the local node.
    pub fn owner(&self, record: &Record) -> GraphResult<Option<Peer>> {
        let Some(selector) = self.role.selector() else {
            return Ok(None);
        };
        let peers = self.remote.peers();
        let peer = selector.select(&peers, record)?;
        Ok((!peer.is_self).then(|| peer.clone()))
    }

    /// Route `record` to its owner and hand it to that owner's copy of this
    /// stage.
    pub fn tell(&self, record: Record) -> GraphResult<()> {
        let expected = self.role.schema().id();
        if record.schema_id() != expected {
            return Err(MergeError::SchemaMismatch {
                expected,
                found: record.schema_id(),
            }
            .into());
        }
        match self.owner(&record)? {
            None => self.tell_local(record),
            Some(peer) => self.push_remote(&peer, &record),
        }
    }

    /// Enqueue into the local queue, skipping routing. Records are
    /// partitioned by key, so one key is always handled by one thread.
    pub fn tell_local(&self, record: Record) -> GraphResult<()> {
        let key = record.key().to_string();
        if self.queue.enqueue(&key, record) {
            Ok(())
        } else {
            Err(GraphError::Rejected { role: self.role.id() })
        }
    }

    /// Enqueue a record a peer already routed here. Never blocks longer
    /// than [`FORWARDED_WAIT`], so a full queue cannot stall the inbound
    /// stream it arrived on.
    pub fn tell_forwarded(&self, record: Record) -> GraphResult<()> {
        let backpressure = match self.queue.backpressure() {
            Backpressure::Blocking => Backpressure::BoundedWait(FORWARDED_WAIT),
            Backpressure::BoundedWait(wait) => Backpressure::BoundedWait(wait.min(FORWARDED_WAIT)),
            Backpressure::DropIfFull => Backpressure::DropIfFull,
        };
        let key = record.key().to_string();
        if self.queue.enqueue_with(&key, record, backpressure) {
            Ok(())
        } else {
            Err(GraphError::Rejected { role: self.role.id() })
        }
    }

    /// Forward to this stage on `peer`.
    pub fn push_remote(&self, peer: &Peer, record: &Record) -> GraphResult<()> {
        trace!(role = %self.role.id(), %peer, key = record.key(), "forwarding record");
        self.remote.push(peer, self.role.id(), record)?;
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    /// Stop accepting records and drain the queue.
    pub fn shutdown(&self) -> QueueResult<()> {
        self.queue.shutdown()
    }
}

/// The downstream stages a worker is allowed to tell.
#[derive(Clone, Default)]
pub struct Outputs {
    stages: Arc<[Arc<Stage>]>,
}

impl Outputs {
    pub(crate) fn new(stages: Vec<Arc<Stage>>) -> Self {
        Self {
            stages: Arc::from(stages),
        }
    }

    /// Tell a declared downstream stage.
    pub fn tell(&self, role: RoleId, record: Record) -> GraphResult<()> {
        match self.stages.iter().find(|s| s.id() == role) {
            Some(stage) => stage.tell(record),
            None => Err(GraphError::UnknownRole(role)),
        }
    }

    pub fn roles(&self) -> impl Iterator<Item = RoleId> + '_ {
        self.stages.iter().map(|s| s.id())
    }
}

/// Record handler of a stage. Each consumer thread owns one instance.
pub trait Worker: Send + 'static {
    fn on_record(&mut self, record: Record, out: &Outputs) -> GraphResult<()>;

    /// Called after each batch taken from the queue.
    fn on_batch_end(&mut self, _out: &Outputs) {}
}

impl<F> Worker for F
where
    F: FnMut(Record, &Outputs) -> GraphResult<()> + Send + 'static,
{
    fn on_record(&mut self, record: Record, out: &Outputs) -> GraphResult<()> {
        self(record, out)
    }
}

/// Adapts a [`Worker`] to the queue's consumer interface.
pub(crate) struct StageConsumer<W> {
    worker: W,
    outputs: Outputs,
}

impl<W: Worker> StageConsumer<W> {
    pub(crate) fn new(worker: W, outputs: Outputs) -> Self {
        Self { worker, outputs }
    }
}

impl<W: Worker> Consumer<Record> for StageConsumer<W> {
    fn consume(&mut self, record: Record) -> anyhow::Result<()> {
        self.worker.on_record(record, &self.outputs)?;
        Ok(())
    }

    fn end_of_batch(&mut self) {
        self.worker.on_batch_end(&self.outputs);
    }
}
