//! Applies one lifecycle or ledger event to locked state.
//!
//! Live commands and journal replay share these functions, so a replayed
//! journal reaches exactly the state the live commands produced.

use std::collections::BTreeMap;

use ulid::Ulid;

use crate::model::*;

use super::conflict::{check_capabilities, check_crew, try_book};
use super::lifecycle::{advance, ensure_edge, Guards};
use super::locks::{LockSet, UndoLog};
use super::EngineError;

pub(crate) fn apply_event(
    locks: &mut LockSet,
    event: &Event,
    undo: &mut UndoLog,
) -> Result<(), EngineError> {
    match event {
        Event::JobScheduled {
            job_id,
            appointment,
            grants,
            at,
        } => schedule(locks, *job_id, appointment, grants, *at, undo),
        Event::JobStarted { job_id, at } => start(locks, *job_id, *at, undo),
        Event::JobCompleted { job_id, at } => complete(locks, *job_id, *at, undo),
        Event::JobInvoiced { job_id, at } => invoice(locks, *job_id, *at, undo),
        Event::JobCancelled { job_id, at } => cancel(locks, *job_id, *at, undo),
        Event::StockAdjusted {
            part_id,
            delta,
            remarks,
            at,
        } => {
            let part = locks.part_mut(part_id)?;
            undo.save_part(part);
            part.adjust_on_hand(*delta, remarks.clone(), *at)
        }
        Event::ReservationCommitted {
            part_id,
            reservation_id,
        } => {
            let part = locks.part_mut(part_id)?;
            undo.save_part(part);
            part.commit(*reservation_id)
        }
        Event::ReservationReleased {
            part_id,
            reservation_id,
        } => {
            let part = locks.part_mut(part_id)?;
            undo.save_part(part);
            part.release(*reservation_id).map(|_| ())
        }
        Event::ResourceRegistered { .. }
        | Event::PartRegistered { .. }
        | Event::WorkOrderCreated { .. }
        | Event::ResourceSnapshot(_)
        | Event::PartSnapshot(_)
        | Event::WorkOrderSnapshot(_) => Err(EngineError::InvalidRequest(
            "registration events are not applied under locks",
        )),
    }
}

/// Locked work order, checked to be the one the event names.
fn locked_job<'a>(locks: &'a mut LockSet, job_id: Ulid) -> Result<&'a mut WorkOrder, EngineError> {
    let job = locks.job_mut()?;
    if job.id != job_id {
        return Err(EngineError::NotFound(job_id));
    }
    Ok(job)
}

/// Take `appointment`'s interval off every assigned resource.
fn release_interval(locks: &mut LockSet, appointment: &Appointment, undo: &mut UndoLog) -> Result<(), EngineError> {
    for id in &appointment.resources {
        let rs = locks.resource_mut(id)?;
        if let Some(booking) = rs.release(&appointment.span) {
            undo.push_unbooked(*id, booking);
        }
    }
    Ok(())
}

fn schedule(
    locks: &mut LockSet,
    job_id: Ulid,
    appointment: &Appointment,
    grants: &[ReservationGrant],
    at: Ms,
    undo: &mut UndoLog,
) -> Result<(), EngineError> {
    let job = locked_job(locks, job_id)?;
    ensure_edge(job.state, JobState::Scheduled)?;
    undo.save_job(job);
    let required = job.required_capabilities.clone();
    let previous = job.active_appointment().cloned();

    // A reschedule frees the old interval first so the new one may overlap it.
    if let Some(previous) = &previous {
        release_interval(locks, previous, undo)?;
    }

    {
        let assigned = appointment
            .resources
            .iter()
            .map(|id| locks.resources.get(id).map(|g| &**g).ok_or(EngineError::NotFound(*id)))
            .collect::<Result<Vec<&ResourceState>, _>>()?;
        check_crew(assigned.iter().copied())?;
        check_capabilities(&required, assigned.iter().copied())?;
        try_book(assigned.iter().copied(), &appointment.span)?;
    }

    for id in &appointment.resources {
        locks.resource_mut(id)?.commit(Booking {
            appointment_id: appointment.id,
            job_id,
            span: appointment.span,
        })?;
        undo.push_booked(*id, appointment.span);
    }

    let mut reserved = BTreeMap::new();
    for grant in grants {
        let part = locks.part_mut(&grant.part_id)?;
        undo.save_part(part);
        let rid = part.reserve(job_id, grant.quantity, grant.new_reservation_id)?;
        reserved.insert(grant.part_id, rid);
    }

    let job = locked_job(locks, job_id)?;
    job.reservations.extend(reserved);
    job.appointment = Some(Appointment {
        status: AppointmentStatus::Committed,
        ..appointment.clone()
    });
    advance(
        job,
        JobState::Scheduled,
        Guards {
            appointment_committed: true,
            reservations_committed: false,
        },
    )?;
    job.updated_at = at;
    Ok(())
}

fn start(locks: &mut LockSet, job_id: Ulid, at: Ms, undo: &mut UndoLog) -> Result<(), EngineError> {
    let job = locked_job(locks, job_id)?;
    ensure_edge(job.state, JobState::InProgress)?;
    undo.save_job(job);
    let appointment_committed = job.active_appointment().is_some();
    let lines: Vec<(Ulid, Option<Ulid>)> = job
        .required_parts
        .keys()
        .map(|part_id| (*part_id, job.reservations.get(part_id).copied()))
        .collect();

    let mut reservations_committed = true;
    for (part_id, rid) in lines {
        let Some(rid) = rid else {
            reservations_committed = false;
            continue;
        };
        let part = locks.part_mut(&part_id)?;
        let state = part.reservations.get(&rid).map(|r| r.state);
        match state {
            Some(ReservationState::Held) => {
                undo.save_part(part);
                part.commit(rid)?;
            }
            Some(ReservationState::Committed) => {}
            Some(ReservationState::Released | ReservationState::Consumed) | None => {
                reservations_committed = false;
            }
        }
    }

    let job = locked_job(locks, job_id)?;
    advance(
        job,
        JobState::InProgress,
        Guards {
            appointment_committed,
            reservations_committed,
        },
    )?;
    job.updated_at = at;
    Ok(())
}

fn complete(locks: &mut LockSet, job_id: Ulid, at: Ms, undo: &mut UndoLog) -> Result<(), EngineError> {
    let job = locked_job(locks, job_id)?;
    ensure_edge(job.state, JobState::Completed)?;
    undo.save_job(job);
    let held: Vec<(Ulid, Ulid)> = job.reservations.iter().map(|(p, r)| (*p, *r)).collect();
    let appointment = job.active_appointment().cloned();

    for (part_id, rid) in held {
        let part = locks.part_mut(&part_id)?;
        let committed = part
            .reservations
            .get(&rid)
            .is_some_and(|r| r.state == ReservationState::Committed);
        if committed {
            undo.save_part(part);
            part.consume(rid, at)?;
        }
    }

    // Give back the part of the interval that lies after completion.
    let mut trimmed = None;
    if let Some(appointment) = appointment.filter(|a| a.span.end > at) {
        release_interval(locks, &appointment, undo)?;
        let mut finished = appointment.clone();
        if at > appointment.span.start {
            finished.span = Span::new(appointment.span.start, at);
            for id in &appointment.resources {
                locks.resource_mut(id)?.commit(Booking {
                    appointment_id: appointment.id,
                    job_id,
                    span: finished.span,
                })?;
                undo.push_booked(*id, finished.span);
            }
        } else {
            finished.status = AppointmentStatus::Released;
        }
        trimmed = Some(finished);
    }

    let job = locked_job(locks, job_id)?;
    if trimmed.is_some() {
        job.appointment = trimmed;
    }
    advance(job, JobState::Completed, Guards::default())?;
    job.updated_at = at;
    Ok(())
}

fn invoice(locks: &mut LockSet, job_id: Ulid, at: Ms, undo: &mut UndoLog) -> Result<(), EngineError> {
    let job = locked_job(locks, job_id)?;
    ensure_edge(job.state, JobState::Invoiced)?;
    undo.save_job(job);
    advance(job, JobState::Invoiced, Guards::default())?;
    job.updated_at = at;
    Ok(())
}

fn cancel(locks: &mut LockSet, job_id: Ulid, at: Ms, undo: &mut UndoLog) -> Result<(), EngineError> {
    let job = locked_job(locks, job_id)?;
    ensure_edge(job.state, JobState::Cancelled)?;
    undo.save_job(job);
    let appointment = job.active_appointment().cloned();
    let held: Vec<(Ulid, Ulid)> = job.reservations.iter().map(|(p, r)| (*p, *r)).collect();

    if let Some(appointment) = &appointment {
        release_interval(locks, appointment, undo)?;
    }
    for (part_id, rid) in held {
        let part = locks.part_mut(&part_id)?;
        let active = part.reservations.get(&rid).is_some_and(|r| r.state.is_active());
        if active {
            undo.save_part(part);
            part.release(rid)?;
        }
    }

    let job = locked_job(locks, job_id)?;
    if let Some(a) = job.appointment.as_mut() {
        a.status = AppointmentStatus::Released;
    }
    advance(job, JobState::Cancelled, Guards::default())?;
    job.updated_at = at;
    Ok(())
}
