use crate::model::*;

// ── Gap-Finding Algorithm ─────────────────────────────────────────

/// Walk the day's booked intervals (sorted by start) and return the start of
/// the first gap inside `window` that fits `duration_ms`. The cursor begins
/// at the window's open; each booked interval that overlaps the candidate
/// pushes the cursor to its end. Back-to-back placement is allowed because
/// intervals are half-open.
pub fn find_first_gap(window: Span, booked: &[Span], duration_ms: Ms) -> Option<Ms> {
    if duration_ms <= 0 {
        return None;
    }

    let busy = {
        let mut sorted = booked.to_vec();
        sorted.sort_by_key(|s| s.start);
        merge_overlapping(&sorted)
    };

    let mut cursor = window.start;
    for b in &busy {
        if b.end <= cursor {
            continue;
        }
        if b.start >= cursor + duration_ms {
            break;
        }
        cursor = b.end;
    }

    if cursor + duration_ms <= window.end {
        Some(cursor)
    } else {
        None
    }
}

/// All free sub-intervals of `window` after removing the booked intervals.
/// Used by availability queries; the allocator only needs the first fit.
pub fn free_intervals(window: Span, booked: &[Span]) -> Vec<Span> {
    let busy = {
        let mut sorted = booked.to_vec();
        sorted.sort_by_key(|s| s.start);
        merge_overlapping(&sorted)
    };
    subtract_intervals(&[window], &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

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

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    fn window_8_to_18() -> Span {
        Span::new(8 * H, 18 * H)
    }

    // ── find_first_gap ────────────────────────────────────

    #[test]
    fn empty_day_starts_at_open() {
        let start = find_first_gap(window_8_to_18(), &[], 30 * M);
        assert_eq!(start, Some(8 * H));
    }

    #[test]
    fn short_service_fits_before_first_booking() {
        // booked 09:00-09:45 and 10:00-10:30; a 30-minute service fits at open
        let booked = vec![
            Span::new(9 * H, 9 * H + 45 * M),
            Span::new(10 * H, 10 * H + 30 * M),
        ];
        let start = find_first_gap(window_8_to_18(), &booked, 30 * M);
        assert_eq!(start, Some(8 * H));
    }

    #[test]
    fn long_service_skips_past_both_bookings() {
        // same day, 90 minutes does not fit at 08:00 or 09:45, lands at 10:30
        let booked = vec![
            Span::new(9 * H, 9 * H + 45 * M),
            Span::new(10 * H, 10 * H + 30 * M),
        ];
        let start = find_first_gap(window_8_to_18(), &booked, 90 * M);
        assert_eq!(start, Some(10 * H + 30 * M));
    }

    #[test]
    fn back_to_back_placement() {
        let booked = vec![Span::new(8 * H, 9 * H)];
        let start = find_first_gap(window_8_to_18(), &booked, 60 * M);
        assert_eq!(start, Some(9 * H));
    }

    #[test]
    fn exact_fit_at_end_of_day() {
        let booked = vec![Span::new(8 * H, 17 * H)];
        let start = find_first_gap(window_8_to_18(), &booked, 60 * M);
        assert_eq!(start, Some(17 * H));
    }

    #[test]
    fn fully_booked_day_has_no_gap() {
        let booked = vec![Span::new(8 * H, 18 * H)];
        assert_eq!(find_first_gap(window_8_to_18(), &booked, 15 * M), None);
    }

    #[test]
    fn duration_longer_than_window() {
        assert_eq!(find_first_gap(window_8_to_18(), &[], 11 * H), None);
    }

    #[test]
    fn unsorted_and_overlapping_bookings_are_normalized() {
        let booked = vec![
            Span::new(10 * H, 11 * H),
            Span::new(8 * H, 9 * H),
            Span::new(8 * H + 30 * M, 10 * H),
        ];
        let start = find_first_gap(window_8_to_18(), &booked, 30 * M);
        assert_eq!(start, Some(11 * H));
    }

    #[test]
    fn zero_duration_never_fits() {
        assert_eq!(find_first_gap(window_8_to_18(), &[], 0), None);
    }

    // ── free_intervals ────────────────────────────────────

    #[test]
    fn free_intervals_punches_holes() {
        let booked = vec![
            Span::new(9 * H, 10 * H),
            Span::new(12 * H, 13 * H),
        ];
        let free = free_intervals(window_8_to_18(), &booked);
        assert_eq!(
            free,
            vec![
                Span::new(8 * H, 9 * H),
                Span::new(10 * H, 12 * H),
                Span::new(13 * H, 18 * H),
            ]
        );
    }

    #[test]
    fn free_intervals_empty_day() {
        let free = free_intervals(window_8_to_18(), &[]);
        assert_eq!(free, vec![window_8_to_18()]);
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, base);
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        let result = subtract_intervals(&base, &remove);
        assert_eq!(result, vec![Span::new(100, 150), Span::new(200, 300)]);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        let result = subtract_intervals(&base, &remove);
        assert!(result.is_empty());
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![
            Span::new(100, 300),
            Span::new(200, 400),
            Span::new(500, 600),
        ];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 400), Span::new(500, 600)]);
    }

    #[test]
    fn merge_overlapping_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300)];
        let merged = merge_overlapping(&spans);
        assert_eq!(merged, vec![Span::new(100, 300)]);
    }
}
