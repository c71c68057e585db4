use std::collections::BTreeSet;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{busy_within, FreeSlots};
use super::{observed, Engine, EngineError};

impl InventoryLevel {
    pub fn of(part: &PartState) -> Self {
        Self {
            part_id: part.id,
            name: part.name.clone(),
            unit: part.unit,
            on_hand: part.on_hand,
            reserved: part.reserved,
            committed: part.committed(),
            available: part.available(),
            minimum_threshold: part.minimum_threshold,
            low_stock: part.is_low_stock(),
        }
    }
}

fn validate_window(window: &Span) -> Result<(), EngineError> {
    if window.is_empty() {
        return Err(EngineError::InvalidRequest("window start must precede its end"));
    }
    // Bound both ends before taking the width, which would overflow otherwise.
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

impl Engine {
    /// Maximal intervals inside `window` where every listed resource is free,
    /// optionally only those at least `min_duration` long.
    ///
    /// Reads a consistent snapshot of the timelines; the iterator itself
    /// holds no locks.
    pub async fn availability(
        &self,
        resource_ids: &[Ulid],
        window: Span,
        min_duration: Option<Ms>,
    ) -> Result<FreeSlots, EngineError> {
        observed("availability", async {
            validate_window(&window)?;
            if resource_ids.is_empty() {
                return Err(EngineError::InvalidRequest("availability needs at least one resource"));
            }
            if resource_ids.len() > MAX_RESOURCES_PER_APPOINTMENT {
                return Err(EngineError::LimitExceeded("too many resources in availability query"));
            }
            if min_duration.is_some_and(|d| d < 0) {
                return Err(EngineError::InvalidRequest("minimum duration must not be negative"));
            }
            let ids: BTreeSet<Ulid> = resource_ids.iter().copied().collect();
            let mut guards = Vec::with_capacity(ids.len());
            for id in ids {
                let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
                guards.push(rs.read_owned().await);
            }
            let busy = busy_within(guards.iter().map(|g| &**g), &window);
            Ok(FreeSlots::new(window, busy, min_duration))
        })
        .await
    }

    /// State, active appointment and reservations of a work order.
    pub async fn job_status(&self, job_id: Ulid) -> Result<JobStatus, EngineError> {
        let job = self.get_work_order(&job_id).ok_or(EngineError::NotFound(job_id))?;
        let guard = job.read().await;
        let mut reservations = Vec::with_capacity(guard.reservations.len());
        for (part_id, rid) in &guard.reservations {
            let part = self.get_part(part_id).ok_or(EngineError::NotFound(*part_id))?;
            if let Some(r) = part.read().await.reservations.get(rid) {
                reservations.push(r.clone());
            }
        }
        Ok(JobStatus {
            id: guard.id,
            state: guard.state,
            appointment: guard.active_appointment().cloned(),
            reservations,
        })
    }

    pub async fn work_order(&self, job_id: Ulid) -> Result<WorkOrder, EngineError> {
        let job = self.get_work_order(&job_id).ok_or(EngineError::NotFound(job_id))?;
        let order = job.read().await.clone();
        Ok(order)
    }

    pub async fn inventory_level(&self, part_id: Ulid) -> Result<InventoryLevel, EngineError> {
        let part = self.get_part(&part_id).ok_or(EngineError::NotFound(part_id))?;
        let level = InventoryLevel::of(&*part.read().await);
        Ok(level)
    }

    /// Parts whose available stock is below their minimum threshold, by id.
    pub async fn low_stock_parts(&self) -> Vec<InventoryLevel> {
        let parts: Vec<_> = self.parts.iter().map(|e| e.value().clone()).collect();
        let mut low = Vec::new();
        for part in parts {
            let guard = part.read().await;
            if guard.is_low_stock() {
                low.push(InventoryLevel::of(&guard));
            }
        }
        low.sort_by_key(|l| l.part_id);
        low
    }

    /// Recorded stock movements of a part, oldest first.
    pub async fn stock_movements(&self, part_id: Ulid) -> Result<Vec<StockMovement>, EngineError> {
        let part = self.get_part(&part_id).ok_or(EngineError::NotFound(part_id))?;
        let movements = part.read().await.movements.iter().cloned().collect();
        Ok(movements)
    }

    /// Committed bookings of a resource overlapping `window`, in start order.
    pub async fn resource_calendar(&self, resource_id: Ulid, window: Span) -> Result<Vec<Booking>, EngineError> {
        validate_window(&window)?;
        let rs = self.get_resource(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard.timeline.overlapping(&window).cloned().collect())
    }

    pub async fn list_resources(&self) -> Vec<ResourceInfo> {
        let resources: Vec<_> = self.resources.iter().map(|e| e.value().clone()).collect();
        let mut infos = Vec::with_capacity(resources.len());
        for rs in resources {
            let guard = rs.read().await;
            infos.push(ResourceInfo {
                id: guard.id,
                kind: guard.kind,
                name: guard.name.clone(),
                capabilities: guard.capabilities.clone(),
                bookings: guard.timeline.len(),
            });
        }
        infos.sort_by_key(|i| i.id);
        infos
    }
}
