use crate::model::*;

// ── Free-window arithmetic ────────────────────────────────────────

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

/// `base` minus `to_remove`. Both must be sorted by start.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Free sub-windows of `query` given the booked windows of one computer.
pub fn free_windows(query: &Span, booked: &[Span]) -> Vec<Span> {
    if booked.is_empty() {
        return vec![*query];
    }
    let mut sorted = booked.to_vec();
    sorted.sort_by_key(|s| s.start);
    subtract_intervals(&[*query], &merge_overlapping(&sorted))
}

/// Earliest start inside each free span that still fits `duration`.
pub fn fitting_starts(free: &[Span], duration: Ms) -> Vec<Ms> {
    free.iter()
        .filter(|s| s.duration_ms() >= duration)
        .map(|s| s.start)
        .collect()
}
