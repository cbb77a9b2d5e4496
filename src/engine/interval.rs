use crate::model::*;

// ── Interval algebra over minute spans ────────────────────────────

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

/// Sort and merge an arbitrary list of spans.
pub fn normalize(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by_key(|s| (s.start, s.end));
    merge_overlapping(&spans)
}

/// Remove every `busy` span from `free`, splitting or truncating free runs.
/// Both inputs must be sorted by start; the result is ordered and disjoint.
pub fn subtract_intervals(free: &[Span], busy: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &f in free {
        let mut cursor = f.start;

        while ri < busy.len() && busy[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < busy.len() && busy[j].start < f.end {
            let b = &busy[j];
            if b.start > cursor {
                result.push(Span::new(cursor, b.start));
            }
            cursor = cursor.max(b.end);
            j += 1;
        }

        if cursor < f.end {
            result.push(Span::new(cursor, f.end));
        }
    }

    result
}

/// Sub-intervals covered by every list in `sets`.
///
/// Sweep line over all boundary points: a run is kept while the number of
/// lists covering it equals the number of lists. Each list is normalized
/// first so one lab can never be counted twice.
pub fn intersect_all(sets: &[Vec<Span>]) -> Vec<Span> {
    if sets.is_empty() {
        return Vec::new();
    }
    let required = sets.len() as i32;

    let mut events: Vec<(Minute, i32)> = Vec::new();
    for set in sets {
        for s in normalize(set.clone()) {
            events.push((s.start, 1));
            events.push((s.end, -1));
        }
    }
    // Ends sort before starts at the same instant (half-open).
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result = Vec::new();
    let mut count = 0;
    let mut run_start: Option<Minute> = None;

    for (time, delta) in events {
        let prev = count;
        count += delta;
        if prev < required && count >= required {
            run_start = Some(time);
        } else if prev >= required
            && count < required
            && let Some(start) = run_start.take()
            && time > start
        {
            result.push(Span::new(start, time));
        }
    }

    merge_overlapping(&result)
}

/// True if `span` lies inside one element of the ordered, disjoint `free` list.
pub fn contained_in(free: &[Span], span: &Span) -> bool {
    let idx = free.partition_point(|f| f.end <= span.start);
    free.get(idx).is_some_and(|f| f.contains_span(span))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtract_no_overlap() {
        let free = vec![Span::new(100, 200), Span::new(300, 400)];
        let busy = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&free, &busy), free);
    }

    #[test]
    fn subtract_full_overlap() {
        let free = vec![Span::new(100, 200)];
        let busy = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&free, &busy).is_empty());
    }

    #[test]
    fn subtract_truncates_both_ends() {
        assert_eq!(
            subtract_intervals(&[Span::new(100, 200)], &[Span::new(50, 150)]),
            vec![Span::new(150, 200)]
        );
        assert_eq!(
            subtract_intervals(&[Span::new(100, 200)], &[Span::new(150, 250)]),
            vec![Span::new(100, 150)]
        );
    }

    #[test]
    fn subtract_splits_runs() {
        let free = vec![Span::new(0, 1440)];
        let busy = vec![Span::new(540, 600), Span::new(600, 660), Span::new(900, 1020)];
        assert_eq!(
            subtract_intervals(&free, &normalize(busy)),
            vec![Span::new(0, 540), Span::new(660, 900), Span::new(1020, 1440)]
        );
    }

    #[test]
    fn subtract_busy_spanning_several_free_runs() {
        let free = vec![Span::new(0, 100), Span::new(200, 300), Span::new(400, 500)];
        let busy = vec![Span::new(50, 450)];
        assert_eq!(
            subtract_intervals(&free, &busy),
            vec![Span::new(0, 50), Span::new(450, 500)]
        );
    }

    #[test]
    fn normalize_merges_overlapping_and_adjacent() {
        let spans = vec![Span::new(500, 600), Span::new(100, 300), Span::new(200, 400), Span::new(400, 450)];
        assert_eq!(normalize(spans), vec![Span::new(100, 450), Span::new(500, 600)]);
    }

    #[test]
    fn intersect_two_labs() {
        let a = vec![Span::new(480, 600), Span::new(660, 1080)];
        let b = vec![Span::new(540, 720), Span::new(900, 960)];
        assert_eq!(
            intersect_all(&[a, b]),
            vec![Span::new(540, 600), Span::new(660, 720), Span::new(900, 960)]
        );
    }

    #[test]
    fn intersect_touching_runs_do_not_join() {
        let a = vec![Span::new(0, 600)];
        let b = vec![Span::new(600, 1440)];
        assert!(intersect_all(&[a, b]).is_empty());
    }

    #[test]
    fn intersect_with_an_empty_lab_is_empty() {
        let a = vec![Span::new(0, 1440)];
        assert!(intersect_all(&[a, Vec::new()]).is_empty());
    }

    #[test]
    fn intersect_single_set_is_identity() {
        let a = vec![Span::new(0, 60), Span::new(120, 180)];
        assert_eq!(intersect_all(std::slice::from_ref(&a)), a);
        assert!(intersect_all(&[]).is_empty());
    }

    #[test]
    fn intersect_ignores_duplicates_within_one_lab() {
        // An unnormalized list must not satisfy the count on its own.
        let a = vec![Span::new(0, 100), Span::new(50, 150)];
        let b = vec![Span::new(400, 500)];
        assert!(intersect_all(&[a, b]).is_empty());
    }

    #[test]
    fn containment() {
        let free = vec![Span::new(0, 540), Span::new(660, 1440)];
        assert!(contained_in(&free, &Span::new(0, 540)));
        assert!(contained_in(&free, &Span::new(700, 760)));
        assert!(!contained_in(&free, &Span::new(500, 700)));
        assert!(!contained_in(&free, &Span::new(540, 660)));
        assert!(!contained_in(&[], &Span::new(0, 10)));
    }
}
