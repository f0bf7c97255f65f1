use std::collections::{BTreeMap, BTreeSet};

use crate::warning::WarningRecord;

use super::ClassNameRewriter;

/// Candidates further away than this, after shift correction, never match.
const MAX_LINE_DISTANCE: u64 = 25;
const LINE_WEIGHT: u64 = 4;
const TEXT_WEIGHT: u64 = 10;

/// Lookup tables the fuzzy strategy needs before comparing anything.
///
/// For every class, warnings that occur exactly once per run under the same
/// pattern and member vote for the line delta between the runs; the most
/// common delta is the class's shift.
#[derive(Clone, Debug, Default)]
pub(crate) struct FuzzyContext {
    shifts: BTreeMap<String, i64>,
}

type AnchorKey = (String, String, Option<String>, Option<String>);

impl FuzzyContext {
    pub(crate) fn prepare(
        old: &[WarningRecord],
        new: &[WarningRecord],
        rewriter: &ClassNameRewriter,
    ) -> Self {
        let old_lines = anchor_lines(old.iter().filter(|record| record.is_active()), rewriter);
        let new_lines = anchor_lines(new.iter(), rewriter);

        let mut histograms: BTreeMap<String, BTreeMap<i64, usize>> = BTreeMap::new();
        for (key, old_entry) in &old_lines {
            let Some(new_entry) = new_lines.get(key) else {
                continue;
            };
            let (Some(old_line), Some(new_line)) = (old_entry.unique(), new_entry.unique()) else {
                continue;
            };
            let delta = i64::from(new_line) - i64::from(old_line);
            *histograms
                .entry(key.0.clone())
                .or_default()
                .entry(delta)
                .or_default() += 1;
        }

        let shifts = histograms
            .into_iter()
            .filter_map(|(class_name, histogram)| {
                modal_delta(&histogram).map(|delta| (class_name, delta))
            })
            .collect();
        Self { shifts }
    }

    pub(crate) fn shift_for(&self, class_name: &str) -> i64 {
        self.shifts.get(class_name).copied().unwrap_or(0)
    }

    /// Weighted distance between an old and a new warning, or `None` when the
    /// lines are too far apart to be the same defect.
    pub(crate) fn distance(
        &self,
        old: &WarningRecord,
        new: &WarningRecord,
        rewriter: &ClassNameRewriter,
    ) -> Option<u64> {
        let class_name = rewriter.rewrite(old.class_name());
        let line_distance = match (old.location.source_line, new.location.source_line) {
            (Some(old_line), Some(new_line)) => {
                let expected = i64::from(old_line) + self.shift_for(&class_name);
                (i64::from(new_line) - expected).unsigned_abs()
            }
            (None, None) => 0,
            _ => MAX_LINE_DISTANCE,
        };
        if line_distance > MAX_LINE_DISTANCE {
            return None;
        }
        let overlap = word_overlap_percent(&old.annotation_text, &new.annotation_text);
        Some(line_distance * LINE_WEIGHT + (100 - overlap) * TEXT_WEIGHT / 100)
    }

    /// Picks the nearest candidate; the earliest one wins ties.
    pub(crate) fn nearest(
        &self,
        candidates: impl Iterator<Item = usize>,
        old: &[WarningRecord],
        new: &WarningRecord,
        rewriter: &ClassNameRewriter,
    ) -> Option<usize> {
        let mut best: Option<(u64, usize)> = None;
        for index in candidates {
            let Some(distance) = self.distance(&old[index], new, rewriter) else {
                continue;
            };
            if best.is_none_or(|(best_distance, _)| distance < best_distance) {
                best = Some((distance, index));
            }
        }
        best.map(|(_, index)| index)
    }
}

#[derive(Default)]
struct AnchorLines {
    count: usize,
    line: Option<u32>,
}

impl AnchorLines {
    fn unique(&self) -> Option<u32> {
        if self.count == 1 { self.line } else { None }
    }
}

fn anchor_lines<'a>(
    records: impl Iterator<Item = &'a WarningRecord>,
    rewriter: &ClassNameRewriter,
) -> BTreeMap<AnchorKey, AnchorLines> {
    let mut anchors: BTreeMap<AnchorKey, AnchorLines> = BTreeMap::new();
    for record in records {
        let key = (
            rewriter.rewrite(record.class_name()).into_owned(),
            record.pattern_type.clone(),
            record.location.method_signature.clone(),
            record.location.field_name.clone(),
        );
        let entry = anchors.entry(key).or_default();
        entry.count += 1;
        entry.line = record.location.source_line;
    }
    anchors
}

fn modal_delta(histogram: &BTreeMap<i64, usize>) -> Option<i64> {
    histogram
        .iter()
        .max_by(|(left_delta, left_count), (right_delta, right_count)| {
            left_count
                .cmp(right_count)
                .then_with(|| right_delta.unsigned_abs().cmp(&left_delta.unsigned_abs()))
                .then_with(|| right_delta.cmp(left_delta))
        })
        .map(|(delta, _)| *delta)
}

/// Share of words the two texts have in common, in percent. Texts without
/// words carry no signal and count as full overlap.
fn word_overlap_percent(left: &str, right: &str) -> u64 {
    let left_words: BTreeSet<&str> = left.split_whitespace().collect();
    let right_words: BTreeSet<&str> = right.split_whitespace().collect();
    if left_words.is_empty() || right_words.is_empty() {
        return 100;
    }
    let common = left_words.intersection(&right_words).count() as u64;
    let largest = left_words.len().max(right_words.len()) as u64;
    common * 100 / largest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warning::method_warning;

    #[test]
    fn class_shift_is_most_common_delta() {
        let old = vec![
            method_warning("NP_NULL", "Foo", "a()V", 10),
            method_warning("NP_NULL", "Foo", "b()V", 20),
            method_warning("NP_NULL", "Foo", "c()V", 30),
        ];
        let new = vec![
            method_warning("NP_NULL", "Foo", "a()V", 15),
            method_warning("NP_NULL", "Foo", "b()V", 25),
            method_warning("NP_NULL", "Foo", "c()V", 29),
        ];

        let context = FuzzyContext::prepare(&old, &new, &ClassNameRewriter::identity());

        assert_eq!(context.shift_for("Foo"), 5);
        assert_eq!(context.shift_for("Bar"), 0);
    }

    #[test]
    fn nearest_prefers_shift_corrected_line() {
        let old = vec![
            method_warning("NP_NULL", "Foo", "a()V", 10),
            method_warning("NP_NULL", "Foo", "a()V", 40),
            method_warning("NP_NULL", "Foo", "b()V", 100),
        ];
        let new = vec![
            method_warning("NP_NULL", "Foo", "b()V", 130),
            method_warning("NP_NULL", "Foo", "a()V", 69),
        ];
        let rewriter = ClassNameRewriter::identity();
        let context = FuzzyContext::prepare(&old, &new, &rewriter);

        let nearest = context.nearest([0, 1].into_iter(), &old, &new[1], &rewriter);

        assert_eq!(context.shift_for("Foo"), 30);
        assert_eq!(nearest, Some(1));
    }

    #[test]
    fn distant_lines_do_not_match() {
        let old = method_warning("NP_NULL", "Foo", "a()V", 10);
        let new = method_warning("NP_NULL", "Foo", "a()V", 400);
        let context = FuzzyContext::default();

        assert_eq!(
            context.distance(&old, &new, &ClassNameRewriter::identity()),
            None
        );
    }

    #[test]
    fn annotation_overlap_breaks_line_ties() {
        let mut first = method_warning("NP_NULL", "Foo", "a()V", 10);
        first.annotation_text = "unrelated note".to_string();
        let mut second = method_warning("NP_NULL", "Foo", "a()V", 12);
        second.annotation_text = "cache miss path".to_string();
        let mut new = method_warning("NP_NULL", "Foo", "a()V", 11);
        new.annotation_text = "cache miss path".to_string();
        let context = FuzzyContext::default();
        let old = vec![first, second];

        let nearest = context.nearest(
            [0, 1].into_iter(),
            &old,
            &new,
            &ClassNameRewriter::identity(),
        );

        assert_eq!(nearest, Some(1));
    }

    #[test]
    fn word_overlap_counts_shared_words() {
        assert_eq!(word_overlap_percent("a b c d", "a b x y"), 50);
        assert_eq!(word_overlap_percent("", "a"), 100);
    }
}
