use chrono::{Datelike, NaiveDate};

use crate::model::*;

// ── Open-slot algorithm ──────────────────────────────────────────

/// Free time of a trainer on one date: that weekday's windows projected onto
/// the date and merged, minus every commitment touching the date.
pub fn open_slots(ts: &TrainerState, date: NaiveDate) -> Vec<Span> {
    let mut free: Vec<Span> = ts.windows_on(date.weekday()).map(|w| w.on(date)).collect();
    if free.is_empty() {
        return free;
    }
    free.sort_by_key(|s| s.start);
    free = merge_overlapping(&free);

    let day = Span::new(free[0].start, free[free.len() - 1].end);
    let mut busy: Vec<Span> = ts.overlapping(&day).map(|c| c.span).collect();
    if !busy.is_empty() {
        busy.sort_by_key(|s| s.start);
        free = subtract_intervals(&free, &merge_overlapping(&busy));
    }
    free
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

/// Remove `to_remove` (sorted, disjoint) from `base` (sorted, disjoint).
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
