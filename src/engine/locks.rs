//! Write guards for one mutation, plus the undo log that reverses it.
//!
//! A mutation applies its steps to the guarded state while recording each
//! step's inverse. If a later step or the journal append fails, the log is
//! replayed backwards over the same guards, so no partial change is ever
//! visible to another operation.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::OwnedRwLockWriteGuard;
use tracing::warn;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Guards held for the duration of one mutation. Acquired in the order
/// work order, resources (sorted), parts (sorted).
#[derive(Default)]
pub(crate) struct LockSet {
    pub job: Option<OwnedRwLockWriteGuard<WorkOrder>>,
    pub resources: BTreeMap<Ulid, OwnedRwLockWriteGuard<ResourceState>>,
    pub parts: BTreeMap<Ulid, OwnedRwLockWriteGuard<PartState>>,
}

impl LockSet {
    pub fn job(&self) -> Result<&WorkOrder, EngineError> {
        self.job.as_deref().ok_or(EngineError::InvalidRequest("work order not locked"))
    }

    pub fn job_mut(&mut self) -> Result<&mut WorkOrder, EngineError> {
        self.job
            .as_deref_mut()
            .ok_or(EngineError::InvalidRequest("work order not locked"))
    }

    pub fn resource_mut(&mut self, id: &Ulid) -> Result<&mut ResourceState, EngineError> {
        self.resources
            .get_mut(id)
            .map(|g| &mut **g)
            .ok_or(EngineError::NotFound(*id))
    }

    pub fn part_mut(&mut self, id: &Ulid) -> Result<&mut PartState, EngineError> {
        self.parts
            .get_mut(id)
            .map(|g| &mut **g)
            .ok_or(EngineError::NotFound(*id))
    }

    /// Every entity id this set guards, for change notification.
    pub fn subjects(&self) -> Vec<Ulid> {
        self.job
            .as_deref()
            .map(|j| j.id)
            .into_iter()
            .chain(self.resources.keys().copied())
            .chain(self.parts.keys().copied())
            .collect()
    }
}

#[derive(Debug)]
enum UndoEntry {
    /// A booking was inserted; undo removes it.
    Booked { resource_id: Ulid, span: Span },
    /// A booking was removed; undo puts it back.
    Unbooked { resource_id: Ulid, booking: Booking },
    Part(Box<PartState>),
    Job(Box<WorkOrder>),
}

/// LIFO log of inverse steps for the mutation in flight.
#[derive(Debug, Default)]
pub(crate) struct UndoLog {
    entries: Vec<UndoEntry>,
    saved_parts: BTreeSet<Ulid>,
    saved_job: bool,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push_booked(&mut self, resource_id: Ulid, span: Span) {
        self.entries.push(UndoEntry::Booked { resource_id, span });
    }

    pub fn push_unbooked(&mut self, resource_id: Ulid, booking: Booking) {
        self.entries.push(UndoEntry::Unbooked {
            resource_id,
            booking,
        });
    }

    /// Snapshot a part before its first change in this mutation.
    pub fn save_part(&mut self, part: &PartState) {
        if self.saved_parts.insert(part.id) {
            self.entries.push(UndoEntry::Part(Box::new(part.clone())));
        }
    }

    /// Snapshot the work order before its first change in this mutation.
    pub fn save_job(&mut self, job: &WorkOrder) {
        if !self.saved_job {
            self.saved_job = true;
            self.entries.push(UndoEntry::Job(Box::new(job.clone())));
        }
    }

    /// Reverse every recorded step, newest first, and empty the log.
    pub fn rollback(&mut self, locks: &mut LockSet) {
        while let Some(entry) = self.entries.pop() {
            match entry {
                UndoEntry::Booked { resource_id, span } => {
                    if let Some(rs) = locks.resources.get_mut(&resource_id) {
                        rs.timeline.release(&span);
                    }
                }
                UndoEntry::Unbooked {
                    resource_id,
                    booking,
                } => {
                    if let Some(rs) = locks.resources.get_mut(&resource_id)
                        && let Err(blocker) = rs.timeline.commit(booking)
                    {
                        warn!(%resource_id, ?blocker, "rollback could not restore booking");
                    }
                }
                UndoEntry::Part(saved) => {
                    if let Some(part) = locks.parts.get_mut(&saved.id) {
                        **part = *saved;
                    }
                }
                UndoEntry::Job(saved) => {
                    if let Some(job) = locks.job.as_deref_mut() {
                        *job = *saved;
                    }
                }
            }
        }
        self.saved_parts.clear();
        self.saved_job = false;
    }
}
