use crate::model::*;

// ── Interval algebra ─────────────────────────────────────────────
//
// Every function here works on half-open spans. A *normalised* set is
// sorted by start with a strictly positive gap between neighbours, which is
// exactly what `union` returns.

/// Minimal covering set of `spans`: overlapping and adjacent spans are merged,
/// result sorted by start. Input order does not matter.
pub fn union(spans: &[Span]) -> Vec<Span> {
    let mut sorted = spans.to_vec();
    sorted.sort_by_key(|s| s.start);
    merge_overlapping(&sorted)
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

/// Two-pointer intersection of two normalised sets.
///
/// Emits `max(start) .. min(end)` for the current pair when non-empty, then
/// advances whichever side ends first.
pub fn intersect(a: &[Span], b: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if let Some(common) = a[i].intersect(&b[j]) {
            result.push(common);
        }
        if a[i].end <= b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    result
}

/// Spans covered by every one of `sets`. Each set is normalised first, so
/// callers may pass raw availability lists. No sets, or any empty set, yields
/// an empty result.
pub fn intersection<S: AsRef<[Span]>>(sets: &[S]) -> Vec<Span> {
    let mut normalised = sets.iter().map(|s| union(s.as_ref()));
    let Some(mut acc) = normalised.next() else {
        return Vec::new();
    };
    for set in normalised {
        if acc.is_empty() {
            break;
        }
        acc = intersect(&acc, &set);
    }
    acc
}

/// Parts of `base` not covered by `to_remove`. Both inputs sorted by start.
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

/// Clamp every span to `window`, dropping the ones outside it.
pub fn clip(spans: &[Span], window: &Span) -> Vec<Span> {
    spans.iter().filter_map(|s| s.intersect(window)).collect()
}

/// Measure of the union of `spans`.
pub fn covered_duration(spans: &[Span]) -> Ms {
    union(spans).iter().map(Span::duration_ms).sum()
}

/// True if a single merged interval of `spans` contains `span` entirely.
pub fn covers(spans: &[Span], span: &Span) -> bool {
    union(spans).iter().any(|s| s.contains_span(span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ── union ───────────────────────────────────────────

    #[test]
    fn union_merges_overlapping_and_adjacent() {
        let spans = vec![
            Span::new(500, 600),
            Span::new(100, 300),
            Span::new(300, 350),
            Span::new(200, 250),
        ];
        assert_eq!(union(&spans), vec![Span::new(100, 350), Span::new(500, 600)]);
    }

    #[test]
    fn union_empty() {
        assert!(union(&[]).is_empty());
    }

    #[test]
    fn union_keeps_gaps() {
        let spans = vec![Span::new(0, 10), Span::new(11, 20)];
        assert_eq!(union(&spans), spans);
    }

    #[test]
    fn merge_overlapping_nested() {
        let spans = vec![Span::new(0, 1000), Span::new(100, 200), Span::new(300, 400)];
        assert_eq!(merge_overlapping(&spans), vec![Span::new(0, 1000)]);
    }

    // ── intersect ──────────────────────────────────────

    #[test]
    fn intersect_basic() {
        let a = vec![Span::new(0, 100), Span::new(200, 300)];
        let b = vec![Span::new(50, 250)];
        assert_eq!(intersect(&a, &b), vec![Span::new(50, 100), Span::new(200, 250)]);
    }

    #[test]
    fn intersect_adjacent_is_empty() {
        let a = vec![Span::new(0, 100)];
        let b = vec![Span::new(100, 200)];
        assert!(intersect(&a, &b).is_empty());
    }

    #[test]
    fn intersect_one_long_span_against_many() {
        let a = vec![Span::new(0, 1000)];
        let b = vec![Span::new(10, 20), Span::new(30, 40), Span::new(990, 1100)];
        assert_eq!(
            intersect(&a, &b),
            vec![Span::new(10, 20), Span::new(30, 40), Span::new(990, 1000)]
        );
    }

    #[test]
    fn intersection_of_three_sets() {
        let room = vec![Span::new(9, 17)];
        let alice = vec![Span::new(10, 12), Span::new(14, 18)];
        let bob = vec![Span::new(11, 15)];
        assert_eq!(
            intersection(&[room, alice, bob]),
            vec![Span::new(11, 12), Span::new(14, 15)]
        );
    }

    #[test]
    fn intersection_normalises_raw_input() {
        let a = vec![Span::new(5, 10), Span::new(0, 6)];
        let b = vec![Span::new(2, 8)];
        assert_eq!(intersection(&[a, b]), vec![Span::new(2, 8)]);
    }

    #[test]
    fn intersection_edge_cases() {
        let none: [Vec<Span>; 0] = [];
        assert!(intersection(&none).is_empty());
        assert!(intersection(&[vec![Span::new(0, 10)], vec![]]).is_empty());
        assert_eq!(intersection(&[vec![Span::new(0, 10)]]), vec![Span::new(0, 10)]);
    }

    // ── subtract_intervals ─────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(200, 300)];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![Span::new(100, 200)];
        let remove = vec![Span::new(50, 250)];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![Span::new(0, 1000)];
        let remove = vec![Span::new(100, 200), Span::new(400, 500), Span::new(800, 900)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                Span::new(0, 100),
                Span::new(200, 400),
                Span::new(500, 800),
                Span::new(900, 1000),
            ]
        );
    }

    #[test]
    fn subtract_empty_inputs() {
        assert!(subtract_intervals(&[], &[Span::new(0, 10)]).is_empty());
        assert_eq!(subtract_intervals(&[Span::new(0, 10)], &[]), vec![Span::new(0, 10)]);
    }

    // ── helpers ────────────────────────────────────────

    #[test]
    fn clip_to_window() {
        let spans = vec![Span::new(0, 100), Span::new(150, 250), Span::new(400, 500)];
        assert_eq!(
            clip(&spans, &Span::new(50, 200)),
            vec![Span::new(50, 100), Span::new(150, 200)]
        );
    }

    #[test]
    fn covered_duration_counts_overlap_once() {
        let spans = vec![Span::new(0, 100), Span::new(50, 150), Span::new(300, 310)];
        assert_eq!(covered_duration(&spans), 160);
    }

    #[test]
    fn covers_needs_single_merged_interval() {
        let spans = vec![Span::new(0, 100), Span::new(100, 200), Span::new(250, 300)];
        assert!(covers(&spans, &Span::new(50, 150)));
        assert!(!covers(&spans, &Span::new(150, 260)));
        assert!(!covers(&[], &Span::new(0, 1)));
    }

    // ── properties ─────────────────────────────────────

    const DOMAIN: Ms = 2_000;

    fn span_strategy() -> impl Strategy<Value = Span> {
        (0..DOMAIN - 200, 1..200i64).prop_map(|(start, len)| Span::new(start, start + len))
    }

    fn set_strategy() -> impl Strategy<Value = Vec<Span>> {
        prop::collection::vec(span_strategy(), 0..16)
    }

    /// Point-wise membership, brute force.
    fn points(spans: &[Span]) -> Vec<bool> {
        let mut covered = vec![false; DOMAIN as usize];
        for s in spans {
            for t in s.start..s.end {
                covered[t as usize] = true;
            }
        }
        covered
    }

    proptest! {
        #[test]
        fn prop_union_is_disjoint_and_non_adjacent(set in set_strategy()) {
            let merged = union(&set);
            for pair in merged.windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }
        }

        #[test]
        fn prop_union_preserves_measure(set in set_strategy()) {
            let merged = union(&set);
            let measure = points(&set).iter().filter(|c| **c).count() as Ms;
            let total: Ms = merged.iter().map(Span::duration_ms).sum();
            prop_assert_eq!(total, measure);
            prop_assert_eq!(points(&merged), points(&set));
        }

        #[test]
        fn prop_intersect_commutative(a in set_strategy(), b in set_strategy()) {
            let (a, b) = (union(&a), union(&b));
            prop_assert_eq!(intersect(&a, &b), intersect(&b, &a));
        }

        #[test]
        fn prop_intersect_associative(a in set_strategy(), b in set_strategy(), c in set_strategy()) {
            let (a, b, c) = (union(&a), union(&b), union(&c));
            let left = intersect(&intersect(&a, &b), &c);
            let right = intersect(&a, &intersect(&b, &c));
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_intersect_self_is_identity(a in set_strategy()) {
            let a = union(&a);
            prop_assert_eq!(intersect(&a, &a), a);
        }

        #[test]
        fn prop_intersection_matches_pointwise_and(a in set_strategy(), b in set_strategy()) {
            let result = intersection(&[a.clone(), b.clone()]);
            let expected: Vec<bool> = points(&a)
                .into_iter()
                .zip(points(&b))
                .map(|(x, y)| x && y)
                .collect();
            prop_assert_eq!(points(&result), expected);
            for pair in result.windows(2) {
                prop_assert!(pair[0].end < pair[1].start);
            }
        }

        #[test]
        fn prop_subtract_matches_pointwise_difference(a in set_strategy(), b in set_strategy()) {
            let result = subtract_intervals(&union(&a), &union(&b));
            let expected: Vec<bool> = points(&a)
                .into_iter()
                .zip(points(&b))
                .map(|(x, y)| x && !y)
                .collect();
            prop_assert_eq!(points(&result), expected);
        }
    }
}
