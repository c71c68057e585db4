use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use ulid::Ulid;

use torque::engine::{Engine, EngineError};
use torque::model::*;
use torque::notify::NotifyHub;

// ── Test infrastructure ──────────────────────────────────────

const HOUR: Ms = 3_600_000;
const DAY: Ms = 1_900_000_000_000;

fn journal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("torque_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("torque.journal")
}

async fn open(path: &PathBuf) -> Engine {
    Engine::open(path.clone(), Arc::new(NotifyHub::new())).await.unwrap()
}

fn tags(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn slot(from_h: i64, to_h: i64) -> Span {
    Span::new(DAY + from_h * HOUR, DAY + to_h * HOUR)
}

async fn recv_event(rx: &mut broadcast::Receiver<Event>) -> Option<Event> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.ok()?.ok()
}

struct Garage {
    tech: Ulid,
    bay: Ulid,
    oil: Ulid,
    filter: Ulid,
}

async fn stock_garage(engine: &Engine) -> Garage {
    let g = Garage {
        tech: Ulid::new(),
        bay: Ulid::new(),
        oil: Ulid::new(),
        filter: Ulid::new(),
    };
    engine
        .create_resource(g.tech, ResourceKind::Technician, Some("Ana".into()), tags(&["service"]))
        .await
        .unwrap();
    engine
        .create_resource(g.bay, ResourceKind::Bay, Some("Bay 2".into()), tags(&["lift"]))
        .await
        .unwrap();
    engine
        .create_part(
            g.oil,
            PartSpec {
                name: "5W-30 oil".into(),
                unit: Unit::Litre,
                on_hand: 10,
                minimum_threshold: Some(4),
            },
        )
        .await
        .unwrap();
    engine
        .create_part(
            g.filter,
            PartSpec {
                name: "Oil filter".into(),
                unit: Unit::Piece,
                on_hand: 2,
                minimum_threshold: Some(1),
            },
        )
        .await
        .unwrap();
    g
}

async fn oil_change(engine: &Engine, g: &Garage) -> Ulid {
    let order = engine
        .create_work_order(WorkOrderSpec {
            id: Ulid::new(),
            vehicle_id: Ulid::new(),
            customer_id: Ulid::new(),
            description: Some("Oil and filter".into()),
            required_capabilities: tags(&["service", "lift"]),
            required_parts: vec![(g.oil, 5), (g.filter, 1)],
        })
        .await
        .unwrap();
    order.id
}

// ── Flows ────────────────────────────────────────────────────

#[tokio::test]
async fn service_visit_end_to_end() {
    let path = journal_path();
    let engine = open(&path).await;
    let g = stock_garage(&engine).await;
    let job = oil_change(&engine, &g).await;
    let mut rx = engine.notify.subscribe(job);

    let appt = engine.schedule_job(job, slot(9, 11), &[g.tech, g.bay]).await.unwrap();
    assert_eq!(appt.resources, vec![g.tech, g.bay]);
    assert!(matches!(recv_event(&mut rx).await, Some(Event::JobScheduled { .. })));

    let oil = engine.inventory_level(g.oil).await.unwrap();
    assert_eq!((oil.on_hand, oil.reserved, oil.available), (10, 5, 5));

    engine.start_job(job).await.unwrap();
    let status = engine.job_status(job).await.unwrap();
    assert_eq!(status.state, JobState::InProgress);
    assert!(
        status
            .reservations
            .iter()
            .all(|r| r.state == ReservationState::Committed)
    );

    engine.complete_job_at(job, DAY + 10 * HOUR).await.unwrap();
    let status = engine.job_status(job).await.unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(status.appointment.unwrap().span, slot(9, 10));

    let oil = engine.inventory_level(g.oil).await.unwrap();
    assert_eq!((oil.on_hand, oil.reserved), (5, 0));
    let filter = engine.inventory_level(g.filter).await.unwrap();
    assert_eq!(filter.on_hand, 1);
    assert!(!filter.low_stock);
    engine.adjust_on_hand(g.filter, -1, Some("dropped".into())).await.unwrap();
    let low: Vec<Ulid> = engine.low_stock_parts().await.iter().map(|l| l.part_id).collect();
    assert_eq!(low, vec![g.filter]);

    // The freed tail is bookable again.
    let slots: Vec<Span> = engine
        .availability(&[g.tech, g.bay], slot(8, 12), None)
        .await
        .unwrap()
        .collect();
    assert_eq!(slots, vec![slot(8, 9), slot(10, 12)]);

    engine.invoice_job(job).await.unwrap();
    assert_eq!(
        engine.cancel_job(job).await,
        Err(EngineError::IllegalTransition {
            from: JobState::Invoiced,
            to: JobState::Cancelled,
        })
    );
}

#[tokio::test]
async fn competing_jobs_fight_for_the_last_filter() {
    let engine = open(&journal_path()).await;
    let g = stock_garage(&engine).await;
    engine.adjust_on_hand(g.filter, -1, Some("damaged".into())).await.unwrap();

    let first = oil_change(&engine, &g).await;
    let second = oil_change(&engine, &g).await;
    engine.schedule_job(first, slot(9, 10), &[g.tech, g.bay]).await.unwrap();

    // Other time, same shelf: stock is the limit, not the calendar.
    let err = engine
        .schedule_job(second, slot(13, 14), &[g.tech, g.bay])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InsufficientStock { part_id, .. } if part_id == g.filter));
    assert!(err.is_retryable());
    assert_eq!(engine.job_status(second).await.unwrap().state, JobState::Draft);
    assert!(engine.resource_calendar(g.tech, slot(12, 15)).await.unwrap().is_empty());

    engine.cancel_job(first).await.unwrap();
    engine.schedule_job(second, slot(13, 14), &[g.tech, g.bay]).await.unwrap();
    assert_eq!(engine.inventory_level(g.filter).await.unwrap().available, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_bookings_never_overlap() {
    let engine = Arc::new(open(&journal_path()).await);
    let g = stock_garage(&engine).await;
    engine.adjust_on_hand(g.filter, 100, None).await.unwrap();
    engine.adjust_on_hand(g.oil, 1000, None).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let job = oil_change(&engine, &g).await;
        // Pairs of tasks race for each hour.
        let hour = (i / 2) as i64;
        let crew = [g.tech, g.bay];
        handles.push(tokio::spawn(async move {
            engine
                .schedule_job(job, slot(hour, hour + 1), &crew)
                .await
                .is_ok()
        }));
    }
    let mut won = 0;
    for h in handles {
        if h.await.unwrap() {
            won += 1;
        }
    }
    assert_eq!(won, 8);

    let calendar = engine.resource_calendar(g.tech, slot(0, 24)).await.unwrap();
    assert_eq!(calendar.len(), 8);
    for pair in calendar.windows(2) {
        assert!(pair[0].span.end <= pair[1].span.start);
    }
}

#[tokio::test]
async fn state_survives_restart_and_compaction() {
    let path = journal_path();
    let (g, done, pending) = {
        let engine = open(&path).await;
        let g = stock_garage(&engine).await;
        let done = oil_change(&engine, &g).await;
        engine.schedule_job(done, slot(9, 10), &[g.tech, g.bay]).await.unwrap();
        engine.start_job(done).await.unwrap();
        engine.complete_job_at(done, DAY + 10 * HOUR).await.unwrap();

        engine.adjust_on_hand(g.filter, 1, Some("delivery".into())).await.unwrap();
        let pending = oil_change(&engine, &g).await;
        engine.schedule_job(pending, slot(14, 16), &[g.tech, g.bay]).await.unwrap();
        engine.compact_wal().await.unwrap();
        engine.cancel_job(pending).await.unwrap();
        (g, done, pending)
    };

    let engine = open(&path).await;
    let counts = engine.entity_counts();
    assert_eq!((counts.resources, counts.parts, counts.work_orders), (2, 2, 2));
    assert_eq!(engine.job_status(done).await.unwrap().state, JobState::Completed);
    assert_eq!(engine.job_status(pending).await.unwrap().state, JobState::Cancelled);

    let filter = engine.inventory_level(g.filter).await.unwrap();
    assert_eq!((filter.on_hand, filter.reserved), (2, 0));
    let movements = engine.stock_movements(g.filter).await.unwrap();
    assert_eq!(movements.len(), 2);
    assert!(engine.resource_calendar(g.tech, slot(12, 18)).await.unwrap().is_empty());
}
