mod apply;
mod availability;
mod conflict;
mod error;
mod ledger;
mod lifecycle;
mod locks;
mod mutations;
mod queries;
mod timeline;

pub use availability::{busy_within, merge_overlapping, FreeSlots};
pub use error::EngineError;
pub use lifecycle::Guards;
pub use timeline::Timeline;

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

use apply::apply_event;
use locks::{LockSet, UndoLog};

pub type SharedResource = Arc<RwLock<ResourceState>>;
pub type SharedPart = Arc<RwLock<PartState>>;
pub type SharedWorkOrder = Arc<RwLock<WorkOrder>>;

// ── Group-commit WAL channel ─────────────────────────────

type Ack = oneshot::Sender<io::Result<()>>;

enum WalCommand {
    Append { event: Event, response: Ack },
    Compact { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until a command arrives.
/// 2. Buffer the append and drain every append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
/// 4. A non-append command found while draining runs after the flush.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                run_command(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            run_command(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Ack)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, Ack)]) -> io::Result<()> {
    // Every sender hears the same answer, so a failed batch must leave none
    // of its records behind to be replayed.
    wal.append_batch(batch.iter().map(|(event, _)| event))
}

fn run_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// Run one engine operation and record its outcome and latency.
async fn observed<T>(
    op: &'static str,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, EngineError> {
    let started = Instant::now();
    let result = fut.await;
    observability::record_operation(op, started, &result);
    if let Err(e) = &result {
        debug!(op, error = %e, "operation rejected");
    }
    result
}

/// The workshop scheduling core: resource timelines, parts ledger and work
/// orders, persisted through the journal.
pub struct Engine {
    resources: DashMap<Ulid, SharedResource>,
    parts: DashMap<Ulid, SharedPart>,
    jobs: DashMap<Ulid, SharedWorkOrder>,
    /// Reverse lookup: reservation id → part id.
    reservation_parts: DashMap<Ulid, Ulid>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Shared by every mutation, exclusive for compaction.
    gate: RwLock<()>,
}

impl Engine {
    /// Open the journal at `wal_path`, rebuilding state from it.
    pub async fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, replay) = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            parts: DashMap::new(),
            jobs: DashMap::new(),
            reservation_parts: DashMap::new(),
            wal_tx,
            notify,
            gate: RwLock::new(()),
        };

        let replayed = replay.events.len();
        for event in replay.events {
            engine.replay_event(event).await.map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("journal replay failed: {e}"))
            })?;
        }
        debug!(path = %wal_path.display(), replayed, "journal replayed");
        Ok(engine)
    }

    async fn replay_event(&self, event: Event) -> Result<(), EngineError> {
        match event {
            Event::ResourceRegistered {
                id,
                kind,
                name,
                capabilities,
            } => {
                self.resources.insert(
                    id,
                    Arc::new(RwLock::new(ResourceState::new(id, kind, name, capabilities))),
                );
            }
            Event::PartRegistered {
                id,
                name,
                unit,
                on_hand,
                minimum_threshold,
            } => {
                let part = PartState::new(id, name, unit, on_hand, minimum_threshold);
                self.parts.insert(id, Arc::new(RwLock::new(part)));
            }
            Event::WorkOrderCreated {
                id,
                vehicle_id,
                customer_id,
                description,
                required_capabilities,
                required_parts,
                at,
            } => {
                let order = WorkOrder {
                    id,
                    vehicle_id,
                    customer_id,
                    description,
                    required_capabilities,
                    required_parts,
                    state: JobState::Draft,
                    appointment: None,
                    reservations: Default::default(),
                    created_at: at,
                    updated_at: at,
                };
                self.jobs.insert(id, Arc::new(RwLock::new(order)));
            }
            Event::ResourceSnapshot(rs) => {
                self.resources.insert(rs.id, Arc::new(RwLock::new(rs)));
            }
            Event::PartSnapshot(part) => {
                for rid in part.reservations.keys() {
                    self.reservation_parts.insert(*rid, part.id);
                }
                self.parts.insert(part.id, Arc::new(RwLock::new(part)));
            }
            Event::WorkOrderSnapshot(order) => {
                self.jobs.insert(order.id, Arc::new(RwLock::new(order)));
            }
            other => {
                let mut locks = self.lock_event(&other).await?;
                let mut undo = UndoLog::new();
                apply_event(&mut locks, &other, &mut undo)?;
                self.index_reservations(&locks);
            }
        }
        Ok(())
    }

    /// Acquire the locks a lifecycle or ledger event needs.
    async fn lock_event(&self, event: &Event) -> Result<LockSet, EngineError> {
        match event {
            Event::JobScheduled {
                job_id,
                appointment,
                grants,
                ..
            } => {
                let parts: Vec<Ulid> = grants.iter().map(|g| g.part_id).collect();
                self.lock_set(Some(*job_id), &appointment.resources, &parts).await
            }
            Event::StockAdjusted { part_id, .. }
            | Event::ReservationCommitted { part_id, .. }
            | Event::ReservationReleased { part_id, .. } => {
                self.lock_set(None, &[], &[*part_id]).await
            }
            other => self.lock_set(other.job_id(), &[], &[]).await,
        }
    }

    /// Write-lock a work order, then resources, then parts, each sorted.
    ///
    /// A locked work order pulls in the resources of its active appointment
    /// and every part it requires or holds a reservation on.
    async fn lock_set(
        &self,
        job_id: Option<Ulid>,
        resources: &[Ulid],
        parts: &[Ulid],
    ) -> Result<LockSet, EngineError> {
        let mut locks = LockSet::default();
        let mut resource_ids: BTreeSet<Ulid> = resources.iter().copied().collect();
        let mut part_ids: BTreeSet<Ulid> = parts.iter().copied().collect();

        if let Some(job_id) = job_id {
            let job = self.get_work_order(&job_id).ok_or(EngineError::NotFound(job_id))?;
            let guard = job.write_owned().await;
            if let Some(a) = guard.active_appointment() {
                resource_ids.extend(a.resources.iter().copied());
            }
            part_ids.extend(guard.required_parts.keys().copied());
            part_ids.extend(guard.reservations.keys().copied());
            locks.job = Some(guard);
        }
        for id in resource_ids {
            let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
            locks.resources.insert(id, rs.write_owned().await);
        }
        for id in part_ids {
            let part = self.get_part(&id).ok_or(EngineError::NotFound(id))?;
            locks.parts.insert(id, part.write_owned().await);
        }
        Ok(locks)
    }

    /// Apply to memory, then journal. Either failure rolls memory back, so
    /// callers see the whole operation or none of it.
    async fn apply_and_persist(&self, locks: &mut LockSet, event: Event) -> Result<(), EngineError> {
        let mut undo = UndoLog::new();
        if let Err(e) = apply_event(locks, &event, &mut undo) {
            undo.rollback(locks);
            return Err(e);
        }
        if let Err(e) = self.wal_append(&event).await {
            undo.rollback(locks);
            return Err(e);
        }
        self.index_reservations(locks);
        if let Some(job) = locks.job.as_deref() {
            metrics::counter!(observability::JOB_TRANSITIONS_TOTAL, "to" => job.state.to_string())
                .increment(1);
        }
        self.notify.send(&locks.subjects(), &event);
        Ok(())
    }

    fn index_reservations(&self, locks: &LockSet) {
        if let Some(job) = locks.job.as_deref() {
            for (part_id, rid) in &job.reservations {
                self.reservation_parts.insert(*rid, *part_id);
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResource> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_part(&self, id: &Ulid) -> Option<SharedPart> {
        self.parts.get(id).map(|e| e.value().clone())
    }

    pub fn get_work_order(&self, id: &Ulid) -> Option<SharedWorkOrder> {
        self.jobs.get(id).map(|e| e.value().clone())
    }

    pub fn entity_counts(&self) -> EntityCounts {
        EntityCounts {
            resources: self.resources.len(),
            parts: self.parts.len(),
            work_orders: self.jobs.len(),
        }
    }
}
