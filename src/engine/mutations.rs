use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{dedup_in_order, now_ms, validate_span};
use super::{observed, Engine, EngineError, WalCommand};

fn validate_tags(tags: &BTreeSet<String>) -> Result<(), EngineError> {
    if tags.len() > MAX_CAPABILITIES {
        return Err(EngineError::LimitExceeded("too many capability tags"));
    }
    if tags.iter().any(|t| t.is_empty()) {
        return Err(EngineError::InvalidRequest("capability tag must not be empty"));
    }
    if tags.iter().any(|t| t.len() > MAX_NAME_LEN) {
        return Err(EngineError::LimitExceeded("capability tag too long"));
    }
    Ok(())
}

/// Sum duplicate part lines; every line must ask for something.
fn merge_part_lines(lines: &[(Ulid, Qty)]) -> Result<BTreeMap<Ulid, Qty>, EngineError> {
    let mut merged: BTreeMap<Ulid, Qty> = BTreeMap::new();
    for &(part_id, qty) in lines {
        if qty == 0 {
            return Err(EngineError::InvalidRequest("part quantity must be positive"));
        }
        let total = merged.entry(part_id).or_insert(0);
        *total = total
            .checked_add(qty)
            .ok_or(EngineError::LimitExceeded("part quantity too large"))?;
    }
    if merged.len() > MAX_PARTS_PER_JOB {
        return Err(EngineError::LimitExceeded("too many part lines"));
    }
    Ok(merged)
}

impl Engine {
    pub async fn create_resource(
        &self,
        id: Ulid,
        kind: ResourceKind,
        name: Option<String>,
        capabilities: BTreeSet<String>,
    ) -> Result<(), EngineError> {
        observed("create_resource", async {
            if self.resources.len() >= MAX_RESOURCES {
                return Err(EngineError::LimitExceeded("too many resources"));
            }
            if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
                return Err(EngineError::LimitExceeded("resource name too long"));
            }
            validate_tags(&capabilities)?;

            let _gate = self.gate.read().await;
            let event = Event::ResourceRegistered {
                id,
                kind,
                name: name.clone(),
                capabilities: capabilities.clone(),
            };
            match self.resources.entry(id) {
                Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
                Entry::Vacant(slot) => {
                    let rs = ResourceState::new(id, kind, name, capabilities);
                    slot.insert(Arc::new(RwLock::new(rs)));
                }
            }
            if let Err(e) = self.wal_append(&event).await {
                self.resources.remove(&id);
                return Err(e);
            }
            self.notify.send(&[id], &event);
            debug!(%id, %kind, "resource registered");
            Ok(())
        })
        .await
    }

    pub async fn create_part(&self, id: Ulid, spec: PartSpec) -> Result<(), EngineError> {
        observed("create_part", async {
            if self.parts.len() >= MAX_PARTS {
                return Err(EngineError::LimitExceeded("too many parts"));
            }
            if spec.name.is_empty() {
                return Err(EngineError::InvalidRequest("part name must not be empty"));
            }
            if spec.name.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("part name too long"));
            }
            let minimum_threshold = spec.minimum_threshold.unwrap_or(DEFAULT_MINIMUM_THRESHOLD);

            let _gate = self.gate.read().await;
            let event = Event::PartRegistered {
                id,
                name: spec.name.clone(),
                unit: spec.unit,
                on_hand: spec.on_hand,
                minimum_threshold,
            };
            match self.parts.entry(id) {
                Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
                Entry::Vacant(slot) => {
                    let part = PartState::new(id, spec.name, spec.unit, spec.on_hand, minimum_threshold);
                    slot.insert(Arc::new(RwLock::new(part)));
                }
            }
            if let Err(e) = self.wal_append(&event).await {
                self.parts.remove(&id);
                return Err(e);
            }
            self.notify.send(&[id], &event);
            debug!(%id, on_hand = spec.on_hand, "part registered");
            Ok(())
        })
        .await
    }

    /// Open a Draft work order. Duplicate part lines are summed.
    pub async fn create_work_order(&self, spec: WorkOrderSpec) -> Result<WorkOrder, EngineError> {
        observed("create_work_order", async {
            let id = spec.id;
            if self.jobs.len() >= MAX_WORK_ORDERS {
                return Err(EngineError::LimitExceeded("too many work orders"));
            }
            if spec.description.as_ref().is_some_and(|d| d.len() > MAX_REMARKS_LEN) {
                return Err(EngineError::LimitExceeded("description too long"));
            }
            validate_tags(&spec.required_capabilities)?;
            let required_parts = merge_part_lines(&spec.required_parts)?;
            if let Some(missing) = required_parts.keys().find(|p| !self.parts.contains_key(p)) {
                return Err(EngineError::NotFound(*missing));
            }

            let _gate = self.gate.read().await;
            let at = now_ms();
            let order = WorkOrder {
                id,
                vehicle_id: spec.vehicle_id,
                customer_id: spec.customer_id,
                description: spec.description,
                required_capabilities: spec.required_capabilities,
                required_parts,
                state: JobState::Draft,
                appointment: None,
                reservations: BTreeMap::new(),
                created_at: at,
                updated_at: at,
            };
            let event = Event::WorkOrderCreated {
                id,
                vehicle_id: order.vehicle_id,
                customer_id: order.customer_id,
                description: order.description.clone(),
                required_capabilities: order.required_capabilities.clone(),
                required_parts: order.required_parts.clone(),
                at,
            };
            match self.jobs.entry(id) {
                Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(RwLock::new(order.clone())));
                }
            }
            if let Err(e) = self.wal_append(&event).await {
                self.jobs.remove(&id);
                return Err(e);
            }
            self.notify.send(&[id], &event);
            debug!(%id, parts = order.required_parts.len(), "work order created");
            Ok(order)
        })
        .await
    }

    /// Book `span` on every listed resource and hold the job's parts, as one
    /// unit. Rescheduling a Scheduled job frees its old interval first.
    pub async fn schedule_job(
        &self,
        job_id: Ulid,
        span: Span,
        resources: &[Ulid],
    ) -> Result<Appointment, EngineError> {
        observed("schedule_job", async {
            validate_span(&span)?;
            let resources = dedup_in_order(resources);
            if resources.is_empty() {
                return Err(EngineError::InvalidRequest("appointment needs at least one resource"));
            }
            if resources.len() > MAX_RESOURCES_PER_APPOINTMENT {
                return Err(EngineError::LimitExceeded("too many resources on appointment"));
            }

            let _gate = self.gate.read().await;
            let mut locks = self.lock_set(Some(job_id), &resources, &[]).await?;
            let grants = locks
                .job()?
                .required_parts
                .iter()
                .map(|(part_id, qty)| ReservationGrant {
                    part_id: *part_id,
                    quantity: *qty,
                    new_reservation_id: Ulid::new(),
                })
                .collect();
            let event = Event::JobScheduled {
                job_id,
                appointment: Appointment {
                    id: Ulid::new(),
                    job_id,
                    span,
                    resources,
                    status: AppointmentStatus::Tentative,
                },
                grants,
                at: now_ms(),
            };
            self.apply_and_persist(&mut locks, event).await?;
            let appointment = locks
                .job()?
                .active_appointment()
                .cloned()
                .ok_or(EngineError::InvalidRequest("scheduled job has no appointment"))?;
            debug!(%job_id, appointment = %appointment.id, "job scheduled");
            Ok(appointment)
        })
        .await
    }

    /// Commit the job's held parts and start work.
    pub async fn start_job(&self, job_id: Ulid) -> Result<(), EngineError> {
        observed("start_job", self.transition(job_id, Event::JobStarted { job_id, at: now_ms() }))
            .await
    }

    pub async fn complete_job(&self, job_id: Ulid) -> Result<(), EngineError> {
        self.complete_job_at(job_id, now_ms()).await
    }

    /// Complete as of `at`: committed parts are issued and any booked time
    /// after `at` goes back to the resources.
    pub async fn complete_job_at(&self, job_id: Ulid, at: Ms) -> Result<(), EngineError> {
        observed("complete_job", async {
            if !(MIN_VALID_TIMESTAMP_MS..MAX_VALID_TIMESTAMP_MS).contains(&at) {
                return Err(EngineError::LimitExceeded("timestamp out of range"));
            }
            self.transition(job_id, Event::JobCompleted { job_id, at }).await
        })
        .await
    }

    pub async fn invoice_job(&self, job_id: Ulid) -> Result<(), EngineError> {
        observed("invoice_job", self.transition(job_id, Event::JobInvoiced { job_id, at: now_ms() }))
            .await
    }

    /// Release the job's interval and parts. Cancelling twice is a no-op.
    pub async fn cancel_job(&self, job_id: Ulid) -> Result<(), EngineError> {
        observed("cancel_job", async {
            let _gate = self.gate.read().await;
            let mut locks = self.lock_set(Some(job_id), &[], &[]).await?;
            if locks.job()?.state == JobState::Cancelled {
                return Ok(());
            }
            let event = Event::JobCancelled { job_id, at: now_ms() };
            self.apply_and_persist(&mut locks, event).await?;
            debug!(%job_id, "job cancelled");
            Ok(())
        })
        .await
    }

    async fn transition(&self, job_id: Ulid, event: Event) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        let mut locks = self.lock_set(Some(job_id), &[], &[]).await?;
        self.apply_and_persist(&mut locks, event).await?;
        debug!(%job_id, state = %locks.job()?.state, "job advanced");
        Ok(())
    }

    /// Receive (`delta > 0`) or write off (`delta < 0`) stock.
    pub async fn adjust_on_hand(
        &self,
        part_id: Ulid,
        delta: i64,
        remarks: Option<String>,
    ) -> Result<InventoryLevel, EngineError> {
        observed("adjust_on_hand", async {
            if remarks.as_ref().is_some_and(|r| r.len() > MAX_REMARKS_LEN) {
                return Err(EngineError::LimitExceeded("remarks too long"));
            }
            let _gate = self.gate.read().await;
            let mut locks = self.lock_set(None, &[], &[part_id]).await?;
            if delta != 0 {
                let event = Event::StockAdjusted {
                    part_id,
                    delta,
                    remarks,
                    at: now_ms(),
                };
                self.apply_and_persist(&mut locks, event).await?;
                debug!(%part_id, delta, "stock adjusted");
            }
            Ok(InventoryLevel::of(locks.part_mut(&part_id)?))
        })
        .await
    }

    /// Held → Committed for a single reservation.
    pub async fn commit_reservation(&self, reservation_id: Ulid) -> Result<(), EngineError> {
        observed("commit_reservation", async {
            let part_id = self.reservation_part(&reservation_id)?;
            let _gate = self.gate.read().await;
            let mut locks = self.lock_set(None, &[], &[part_id]).await?;
            let event = Event::ReservationCommitted {
                part_id,
                reservation_id,
            };
            self.apply_and_persist(&mut locks, event).await
        })
        .await
    }

    /// Return a reservation's stock. Releasing a Released reservation is a no-op.
    pub async fn release_reservation(&self, reservation_id: Ulid) -> Result<(), EngineError> {
        observed("release_reservation", async {
            let part_id = self.reservation_part(&reservation_id)?;
            let _gate = self.gate.read().await;
            let mut locks = self.lock_set(None, &[], &[part_id]).await?;
            let already_released = locks
                .part_mut(&part_id)?
                .reservations
                .get(&reservation_id)
                .is_some_and(|r| r.state == ReservationState::Released);
            if already_released {
                return Ok(());
            }
            let event = Event::ReservationReleased {
                part_id,
                reservation_id,
            };
            self.apply_and_persist(&mut locks, event).await
        })
        .await
    }

    fn reservation_part(&self, reservation_id: &Ulid) -> Result<Ulid, EngineError> {
        self.reservation_parts
            .get(reservation_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*reservation_id))
    }

    /// Rewrite the journal as one snapshot event per entity.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        // Exclusive: no mutation can be between its apply and its append.
        let _gate = self.gate.write().await;
        self.prune_history(now_ms().saturating_sub(HISTORY_RETENTION_MS)).await;

        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let parts: Vec<_> = self.parts.iter().map(|e| e.value().clone()).collect();
        let jobs: Vec<_> = self.jobs.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::with_capacity(resources.len() + parts.len() + jobs.len());
        for rs in resources {
            events.push(Event::ResourceSnapshot(rs.read().await.clone()));
        }
        for part in parts {
            events.push(Event::PartSnapshot(part.read().await.clone()));
        }
        for job in jobs {
            events.push(Event::WorkOrderSnapshot(job.read().await.clone()));
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => observability::status_label(&result))
            .increment(1);
        if result.is_ok() {
            debug!(events = count, "journal compacted");
        }
        result
    }

    /// Drop bookings that ended by `horizon`, and finished reservations no
    /// live work order points at. Only called under the exclusive gate, right
    /// before the snapshot that makes the result durable.
    async fn prune_history(&self, horizon: Ms) {
        let jobs: Vec<_> = self.jobs.iter().map(|e| e.value().clone()).collect();
        let mut live: HashSet<Ulid> = HashSet::new();
        for job in jobs {
            let order = job.read().await;
            let archived = matches!(order.state, JobState::Invoiced | JobState::Cancelled)
                && order.appointment.as_ref().is_none_or(|a| a.span.end <= horizon);
            if !archived {
                live.extend(order.reservations.values().copied());
            }
        }

        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut bookings = 0;
        for rs in resources {
            bookings += rs.write().await.timeline.prune_ended_before(horizon);
        }

        let parts: Vec<_> = self.parts.iter().map(|e| e.value().clone()).collect();
        let mut reservations = 0;
        for part in parts {
            let dropped = part.write().await.prune_reservations(|r| live.contains(&r.id));
            for rid in &dropped {
                self.reservation_parts.remove(rid);
            }
            reservations += dropped.len();
        }
        if bookings + reservations > 0 {
            debug!(bookings, reservations, horizon, "pruned history");
        }
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
