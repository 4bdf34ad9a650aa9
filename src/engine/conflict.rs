use crate::model::*;

/// Does `[candidate_start, candidate_end)` intersect the occupied interval
/// once that interval is widened by `buffer` on both ends?
///
/// Half-open: a candidate ending exactly where the widened occupied interval
/// starts does not conflict.
pub fn overlaps(
    candidate_start: Ms,
    candidate_end: Ms,
    occupied_start: Ms,
    occupied_end: Ms,
    buffer: Ms,
) -> bool {
    candidate_start < occupied_end + buffer && occupied_start - buffer < candidate_end
}

/// Everything that occupies a staff member's time, as disjoint spans sorted by start.
///
/// Appointments and external busy times are folded into the same list; the
/// overlap test does not care where an interval came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OccupiedTimeline {
    spans: Vec<Span>,
}

impl OccupiedTimeline {
    pub fn new(appointments: &[Appointment], busy_times: &[BusyTime]) -> Self {
        let mut spans: Vec<Span> = appointments
            .iter()
            .filter(|a| a.occupies_time() && a.start < a.end)
            .map(|a| Span::new(a.start, a.end))
            .chain(
                busy_times
                    .iter()
                    .filter(|b| b.start < b.end)
                    .map(|b| Span::new(b.start, b.end)),
            )
            .collect();
        spans.sort_by_key(|s| s.start);
        Self {
            spans: merge_overlapping(&spans),
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// True when any occupied span, widened by `buffer`, intersects `candidate`.
    pub fn conflicts(&self, candidate: &Span, buffer: Ms) -> bool {
        // Spans at index >= right_bound start too late to reach the candidate
        // even after widening.
        let right_bound = self
            .spans
            .partition_point(|s| s.start - buffer < candidate.end);
        // Merged spans are disjoint, so ends ascend with starts.
        let first =
            self.spans[..right_bound].partition_point(|s| s.end + buffer <= candidate.start);
        self.spans[first..right_bound]
            .iter()
            .any(|s| overlaps(candidate.start, candidate.end, s.start, s.end, buffer))
    }
}

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
