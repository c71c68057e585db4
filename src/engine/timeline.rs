use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::*;

use super::EngineError;

/// Committed bookings of one resource, keyed by `span.start`.
///
/// Bookings never overlap, so starts are unique and ends ascend with starts.
/// That makes the only candidate at or before a query's start its
/// predecessor, and every later candidate a contiguous run: overlap tests
/// are `O(log n + k)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeline {
    bookings: BTreeMap<Ms, Booking>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    /// All bookings in start order.
    pub fn iter(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.values()
    }

    /// Bookings whose span overlaps `query`, in start order.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let first = self
            .bookings
            .range(..=query.start)
            .next_back()
            .filter(|(_, b)| b.span.end > query.start)
            .map_or(query.start, |(start, _)| *start);
        // An empty or inverted query yields nothing rather than panicking in `range`.
        let end = if query.is_empty() { first } else { query.end };
        self.bookings.range(first..end).map(|(_, b)| b)
    }

    /// True iff nothing stored overlaps `span`. Touching endpoints are free.
    pub fn is_free(&self, span: &Span) -> bool {
        self.overlapping(span).next().is_none()
    }

    /// Insert a booking, re-checking for overlap at call time.
    /// Returns the span of the first booking in the way.
    pub fn commit(&mut self, booking: Booking) -> Result<(), Span> {
        if let Some(existing) = self.overlapping(&booking.span).next() {
            return Err(existing.span);
        }
        self.bookings.insert(booking.span.start, booking);
        Ok(())
    }

    /// Remove the booking stored with exactly `span`. Absent is not an error.
    pub fn release(&mut self, span: &Span) -> Option<Booking> {
        match self.bookings.get(&span.start) {
            Some(b) if b.span == *span => self.bookings.remove(&span.start),
            _ => None,
        }
    }

    /// Bookings still running at `at` or starting after it.
    pub fn ending_after(&self, at: Ms) -> impl Iterator<Item = &Booking> {
        let first = self
            .bookings
            .range(..=at)
            .next_back()
            .filter(|(_, b)| b.span.end > at)
            .map_or(at, |(start, _)| *start);
        self.bookings.range(first..).map(|(_, b)| b)
    }

    /// Drop bookings that ended at or before `horizon`. Returns how many went.
    pub fn prune_ended_before(&mut self, horizon: Ms) -> usize {
        let before = self.bookings.len();
        self.bookings.retain(|_, b| b.span.end > horizon);
        before - self.bookings.len()
    }
}

impl ResourceState {
    /// True iff nothing booked on this resource overlaps `span`.
    pub fn query(&self, span: &Span) -> bool {
        self.timeline.is_free(span)
    }

    /// Re-checks freedom; a lost race surfaces as `Conflict` naming this resource.
    pub fn commit(&mut self, booking: Booking) -> Result<(), EngineError> {
        // Only bookings that have not ended by this one's start count, so
        // history never locks a resource out.
        let pending = self.timeline.ending_after(booking.span.start).count();
        if pending >= crate::limits::MAX_BOOKINGS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many bookings on resource"));
        }
        self.timeline
            .commit(booking)
            .map_err(|_| EngineError::Conflict(self.id))
    }

    /// Releasing an absent interval is a no-op.
    pub fn release(&mut self, span: &Span) -> Option<Booking> {
        self.timeline.release(span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn booking(start: Ms, end: Ms) -> Booking {
        Booking {
            appointment_id: Ulid::new(),
            job_id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    fn timeline(spans: &[(Ms, Ms)]) -> Timeline {
        let mut t = Timeline::new();
        for &(s, e) in spans {
            t.commit(booking(s, e)).unwrap();
        }
        t
    }

    #[test]
    fn commit_keeps_start_order() {
        let t = timeline(&[(300, 400), (100, 200), (200, 300)]);
        let starts: Vec<Ms> = t.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn touching_endpoints_do_not_overlap() {
        let t = timeline(&[(100, 200)]);
        assert!(t.is_free(&Span::new(200, 300)));
        assert!(t.is_free(&Span::new(0, 100)));
        assert!(!t.is_free(&Span::new(199, 201)));
    }

    #[test]
    fn commit_rejects_overlap_and_reports_blocker() {
        let mut t = timeline(&[(100, 200)]);
        let err = t.commit(booking(150, 250)).unwrap_err();
        assert_eq!(err, Span::new(100, 200));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn commit_rejects_same_start() {
        let mut t = timeline(&[(100, 200)]);
        assert!(t.commit(booking(100, 150)).is_err());
    }

    #[test]
    fn overlapping_finds_predecessor_spanning_query() {
        let t = timeline(&[(0, 1000), (1000, 1100)]);
        let hits: Vec<Span> = t.overlapping(&Span::new(500, 600)).map(|b| b.span).collect();
        assert_eq!(hits, vec![Span::new(0, 1000)]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let t = timeline(&[(100, 200), (450, 600), (1000, 1100)]);
        let hits: Vec<Span> = t.overlapping(&Span::new(500, 800)).map(|b| b.span).collect();
        assert_eq!(hits, vec![Span::new(450, 600)]);
    }

    #[test]
    fn overlapping_returns_contiguous_run() {
        let t = timeline(&[(0, 50), (100, 150), (200, 250), (300, 350), (400, 450)]);
        let hits: Vec<Span> = t.overlapping(&Span::new(120, 320)).map(|b| b.span).collect();
        assert_eq!(
            hits,
            vec![Span::new(100, 150), Span::new(200, 250), Span::new(300, 350)]
        );
    }

    #[test]
    fn overlapping_empty_query_is_empty() {
        let t = timeline(&[(100, 200)]);
        let q = Span { start: 150, end: 150 };
        assert_eq!(t.overlapping(&q).count(), 0);
    }

    #[test]
    fn release_exact_only_and_idempotent() {
        let mut t = timeline(&[(100, 200)]);
        assert!(t.release(&Span::new(100, 150)).is_none());
        assert_eq!(t.len(), 1);
        assert!(t.release(&Span::new(100, 200)).is_some());
        assert!(t.release(&Span::new(100, 200)).is_none());
        assert!(t.is_empty());
    }

    #[test]
    fn resource_commit_conflict_names_resource() {
        let id = Ulid::new();
        let mut rs = ResourceState::new(id, ResourceKind::Bay, None, Default::default());
        rs.commit(booking(0, 100)).unwrap();
        assert!(!rs.query(&Span::new(50, 60)));
        assert_eq!(rs.commit(booking(50, 60)), Err(EngineError::Conflict(id)));
    }

    #[test]
    fn ending_after_includes_running_booking() {
        let t = timeline(&[(0, 100), (100, 200), (300, 400)]);
        let starts: Vec<Ms> = t.ending_after(150).map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 300]);
        assert_eq!(t.ending_after(200).count(), 1);
        assert_eq!(t.ending_after(400).count(), 0);
    }

    #[test]
    fn prune_keeps_bookings_ending_after_horizon() {
        let mut t = timeline(&[(0, 100), (100, 200), (150_000, 150_100)]);
        assert_eq!(t.prune_ended_before(200), 2);
        let starts: Vec<Ms> = t.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![150_000]);
    }

    #[test]
    fn booking_cap_ignores_finished_history() {
        use crate::limits::MAX_BOOKINGS_PER_RESOURCE;

        let id = Ulid::new();
        let mut rs = ResourceState::new(id, ResourceKind::Technician, None, Default::default());
        let n = MAX_BOOKINGS_PER_RESOURCE as Ms;
        for i in 0..n {
            rs.commit(booking(i * 10, i * 10 + 10)).unwrap();
        }
        // A full calendar of past work still leaves later time bookable.
        rs.commit(booking(n * 10, n * 10 + 10)).unwrap();
        // Squeezing in before all of it counts every booking as pending.
        assert!(matches!(
            rs.commit(booking(-10, 0)),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
