use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Busy time of several resources inside `window`, clamped, sorted and merged.
pub fn busy_within<'a>(resources: impl IntoIterator<Item = &'a ResourceState>, window: &Span) -> Vec<Span> {
    let mut busy: Vec<Span> = resources
        .into_iter()
        .flat_map(|rs| rs.timeline.overlapping(window))
        .filter_map(|b| b.span.clamp_to(window))
        .collect();
    busy.sort_by_key(|s| s.start);
    merge_overlapping(&busy)
}

/// Lazily yields the gaps between merged busy spans inside a window.
///
/// Built from a snapshot, so it holds no locks while the caller iterates.
#[derive(Debug, Clone)]
pub struct FreeSlots {
    window: Span,
    busy: std::vec::IntoIter<Span>,
    cursor: Ms,
    min_duration: Ms,
}

impl FreeSlots {
    /// `busy` must be sorted, disjoint and inside `window` (see [`busy_within`]).
    pub fn new(window: Span, busy: Vec<Span>, min_duration: Option<Ms>) -> Self {
        Self {
            window,
            busy: busy.into_iter(),
            cursor: window.start,
            min_duration: min_duration.unwrap_or(0),
        }
    }

    fn accept(&self, gap: Span) -> Option<Span> {
        (!gap.is_empty() && gap.duration_ms() >= self.min_duration).then_some(gap)
    }
}

impl Iterator for FreeSlots {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        while self.cursor < self.window.end {
            let gap = match self.busy.next() {
                Some(b) => {
                    let gap = Span { start: self.cursor, end: b.start };
                    self.cursor = self.cursor.max(b.end);
                    gap
                }
                None => {
                    let gap = Span { start: self.cursor, end: self.window.end };
                    self.cursor = self.window.end;
                    gap
                }
            };
            if let Some(free) = self.accept(gap) {
                return Some(free);
            }
        }
        None
    }
}
