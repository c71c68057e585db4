use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::Timeline;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Stock quantity in the part's unit of measure.
pub type Qty = u32;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection with `other`, or `None` if they don't overlap.
    pub fn clamp_to(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Span { start, end })
    }
}

// ── Resources ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Technician,
    Bay,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Technician => f.write_str("technician"),
            ResourceKind::Bay => f.write_str("bay"),
        }
    }
}

/// One committed occupancy of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub appointment_id: Ulid,
    pub job_id: Ulid,
    pub span: Span,
}

/// A technician or bay whose time is bookable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
    /// Skills for technicians, size class / equipment for bays.
    pub capabilities: BTreeSet<String>,
    pub timeline: Timeline,
}

impl ResourceState {
    pub fn new(
        id: Ulid,
        kind: ResourceKind,
        name: Option<String>,
        capabilities: BTreeSet<String>,
    ) -> Self {
        Self {
            id,
            kind,
            name,
            capabilities,
            timeline: Timeline::new(),
        }
    }
}

// ── Parts inventory ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    Piece,
    Litre,
    Kilogram,
    Metre,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    Held,
    Committed,
    Released,
    /// Issued to the job at completion; stock has left the shelf.
    Consumed,
}

impl ReservationState {
    /// Held and Committed reservations count against available stock.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationState::Held | ReservationState::Committed)
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationState::Held => "held",
            ReservationState::Committed => "committed",
            ReservationState::Released => "released",
            ReservationState::Consumed => "consumed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub job_id: Ulid,
    pub part_id: Ulid,
    pub quantity: Qty,
    pub state: ReservationState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementKind {
    Received,
    WrittenOff,
    Issued,
}

/// A physical stock movement, kept for the part's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub at: Ms,
    pub kind: MovementKind,
    pub quantity: Qty,
    pub job_id: Option<Ulid>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartState {
    pub id: Ulid,
    pub name: String,
    pub unit: Unit,
    pub on_hand: Qty,
    /// Sum of Held + Committed reservations. Never exceeds `on_hand`.
    pub reserved: Qty,
    pub minimum_threshold: Qty,
    /// Every reservation ever made against this part, by reservation id.
    pub reservations: HashMap<Ulid, Reservation>,
    /// job id → its active (Held/Committed) reservation on this part.
    pub active: HashMap<Ulid, Ulid>,
    pub movements: VecDeque<StockMovement>,
}

impl PartState {
    pub fn new(id: Ulid, name: String, unit: Unit, on_hand: Qty, minimum_threshold: Qty) -> Self {
        Self {
            id,
            name,
            unit,
            on_hand,
            reserved: 0,
            minimum_threshold,
            reservations: HashMap::new(),
            active: HashMap::new(),
            movements: VecDeque::new(),
        }
    }
}

// ── Work orders ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Draft,
    Scheduled,
    InProgress,
    Completed,
    Invoiced,
    Cancelled,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Draft => "draft",
            JobState::Scheduled => "scheduled",
            JobState::InProgress => "in_progress",
            JobState::Completed => "completed",
            JobState::Invoiced => "invoiced",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppointmentStatus {
    /// Proposed, not yet accepted by the conflict check.
    Tentative,
    Committed,
    /// Interval given back to the resources (cancellation or early finish).
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub job_id: Ulid,
    pub span: Span,
    /// Assigned technicians and bays, in request order.
    pub resources: Vec<Ulid>,
    pub status: AppointmentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub customer_id: Ulid,
    pub description: Option<String>,
    pub required_capabilities: BTreeSet<String>,
    /// part id → quantity needed.
    pub required_parts: BTreeMap<Ulid, Qty>,
    pub state: JobState,
    pub appointment: Option<Appointment>,
    /// part id → latest reservation id for that part.
    pub reservations: BTreeMap<Ulid, Ulid>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl WorkOrder {
    /// The appointment currently occupying resource time, if any.
    pub fn active_appointment(&self) -> Option<&Appointment> {
        self.appointment
            .as_ref()
            .filter(|a| a.status == AppointmentStatus::Committed)
    }
}

// ── Command inputs ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSpec {
    pub name: String,
    pub unit: Unit,
    pub on_hand: Qty,
    /// Defaults to `limits::DEFAULT_MINIMUM_THRESHOLD`.
    pub minimum_threshold: Option<Qty>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkOrderSpec {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub customer_id: Ulid,
    pub description: Option<String>,
    pub required_capabilities: BTreeSet<String>,
    pub required_parts: Vec<(Ulid, Qty)>,
}

/// Reservation to place for one required part when a job is scheduled.
/// `new_reservation_id` is only used if the job holds no active
/// reservation on the part yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationGrant {
    pub part_id: Ulid,
    pub quantity: Qty,
    pub new_reservation_id: Ulid,
}

/// One event per successful command. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceRegistered {
        id: Ulid,
        kind: ResourceKind,
        name: Option<String>,
        capabilities: BTreeSet<String>,
    },
    PartRegistered {
        id: Ulid,
        name: String,
        unit: Unit,
        on_hand: Qty,
        minimum_threshold: Qty,
    },
    WorkOrderCreated {
        id: Ulid,
        vehicle_id: Ulid,
        customer_id: Ulid,
        description: Option<String>,
        required_capabilities: BTreeSet<String>,
        required_parts: BTreeMap<Ulid, Qty>,
        at: Ms,
    },
    JobScheduled {
        job_id: Ulid,
        appointment: Appointment,
        grants: Vec<ReservationGrant>,
        at: Ms,
    },
    JobStarted {
        job_id: Ulid,
        at: Ms,
    },
    JobCompleted {
        job_id: Ulid,
        at: Ms,
    },
    JobInvoiced {
        job_id: Ulid,
        at: Ms,
    },
    JobCancelled {
        job_id: Ulid,
        at: Ms,
    },
    StockAdjusted {
        part_id: Ulid,
        delta: i64,
        remarks: Option<String>,
        at: Ms,
    },
    ReservationCommitted {
        part_id: Ulid,
        reservation_id: Ulid,
    },
    ReservationReleased {
        part_id: Ulid,
        reservation_id: Ulid,
    },
    // Compaction snapshots: full entity state, replayed as-is.
    ResourceSnapshot(ResourceState),
    PartSnapshot(PartState),
    WorkOrderSnapshot(WorkOrder),
}

impl Event {
    /// The work order a lifecycle event acts on.
    pub fn job_id(&self) -> Option<Ulid> {
        match self {
            Event::JobScheduled { job_id, .. }
            | Event::JobStarted { job_id, .. }
            | Event::JobCompleted { job_id, .. }
            | Event::JobInvoiced { job_id, .. }
            | Event::JobCancelled { job_id, .. } => Some(*job_id),
            Event::WorkOrderCreated { id, .. } => Some(*id),
            Event::WorkOrderSnapshot(order) => Some(order.id),
            _ => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub id: Ulid,
    pub kind: ResourceKind,
    pub name: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub bookings: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryLevel {
    pub part_id: Ulid,
    pub name: String,
    pub unit: Unit,
    pub on_hand: Qty,
    pub reserved: Qty,
    pub committed: Qty,
    pub available: Qty,
    pub minimum_threshold: Qty,
    pub low_stock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityCounts {
    pub resources: usize,
    pub parts: usize,
    pub work_orders: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub id: Ulid,
    pub state: JobState,
    pub appointment: Option<Appointment>,
    pub reservations: Vec<Reservation>,
}
