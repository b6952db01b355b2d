use crate::model::*;

// ── Slot search ───────────────────────────────────────────────────

/// Bookable start times inside `working`.
///
/// `booked` are the raw spans of active appointments near the window. Each is
/// widened by `buffer` on both sides, which is the same as padding both the
/// candidate and the existing appointment after their ends. Candidates step by
/// `slot_len` from `working.start`, must fit `duration` before `working.end`,
/// and must not start before `not_before`.
pub fn free_slots(
    working: Span,
    booked: &[Span],
    buffer: Ms,
    slot_len: Ms,
    duration: Ms,
    not_before: Ms,
) -> Vec<Ms> {
    if slot_len <= 0 || duration <= 0 {
        return Vec::new();
    }

    let mut blocked: Vec<Span> = booked
        .iter()
        .map(|s| Span::new(s.start - buffer, s.end + buffer))
        .collect();
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);
    let free = subtract_intervals(&[working], &blocked);

    let mut slots = Vec::new();
    let mut fi = 0;
    let mut t = working.start;
    while t + duration <= working.end {
        if t >= not_before {
            let candidate = Span::new(t, t + duration);
            while fi < free.len() && free[fi].end < candidate.end {
                fi += 1;
            }
            if fi < free.len() && free[fi].contains_span(&candidate) {
                slots.push(t);
            }
        }
        t += slot_len;
    }
    slots
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        for r in to_remove[ri..].iter().take_while(|r| r.start < b.end) {
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
