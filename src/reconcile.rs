//! Merging a fresh analysis run into a warning history.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, info};

use crate::collection::WarningCollection;
use crate::matcher::{ClassNameRewriter, Matcher, MatcherConfig, match_cascade};
use crate::version::VersionSequencer;
use crate::warning::{ACTIVE, WarningRecord};

/// Failures of a single merge. The previous collection stays valid.
#[derive(Debug, Error, Eq, PartialEq)]
pub(crate) enum ReconcileError {
    #[error("input validation failed: {reason}")]
    InputValidation { reason: String },
    #[error("merge invariant violated: {detail}")]
    MergeInvariantViolation { detail: String },
}

/// Counts of how records were classified by one merge.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct MergeStats {
    pub(crate) added: usize,
    pub(crate) added_in_new_code: usize,
    pub(crate) fixed: usize,
    pub(crate) removed_with_code: usize,
    pub(crate) retained: usize,
    pub(crate) resurrected: usize,
    pub(crate) carried_dead: usize,
}

/// Merged collection plus the classification counts behind it.
#[derive(Clone, Debug)]
pub(crate) struct MergeOutcome {
    pub(crate) collection: WarningCollection,
    pub(crate) stats: MergeStats,
}

/// Merges fresh runs into a history using a matcher cascade.
#[derive(Clone, Debug, Default)]
pub(crate) struct Reconciler {
    config: MatcherConfig,
}

/// Lifecycle bucket a record was emitted from; used for invariant checks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Bucket {
    CarriedDead,
    Fixed,
    Matched,
    Introduced,
}

impl Reconciler {
    pub(crate) fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Merges `new` (a fresh run) into `old` (the history at sequence `N`),
    /// producing the history at sequence `N + 1`.
    pub(crate) fn merge(
        &self,
        old: &WarningCollection,
        new: &WarningCollection,
    ) -> Result<MergeOutcome, ReconcileError> {
        old.validate()?;
        new.validate_fresh_run()?;

        let sequencer = VersionSequencer::following(old);
        let previous = sequencer.previous_sequence();
        let current = sequencer.next_sequence();

        let state = match_cascade(
            &self.config,
            &old.records,
            &new.records,
            &old.project.classes,
            &new.project.classes,
            current,
        );

        debug!(passes = ?state.pass_counts(), "match cascade finished");

        let mut stats = MergeStats::default();
        let mut emitted: Vec<(Bucket, WarningRecord)> =
            Vec::with_capacity(old.records.len() + new.records.len());

        for (index, record) in old.records.iter().enumerate() {
            if state.is_old_matched(index) {
                continue;
            }
            if record.is_dead() {
                stats.carried_dead += 1;
                emitted.push((Bucket::CarriedDead, record.clone()));
                continue;
            }
            let mut fixed = record.clone();
            fixed.last_version = previous;
            fixed.removed_by_change_of_persisting_class = new.covers_code_of(record);
            if fixed.removed_by_change_of_persisting_class {
                stats.fixed += 1;
            } else {
                stats.removed_with_code += 1;
            }
            debug!(warning = %fixed.describe(), "warning fixed");
            emitted.push((Bucket::Fixed, fixed));
        }

        for (index, record) in new.records.iter().enumerate() {
            let mut merged = record.clone();
            match state.old_for(index) {
                Some(old_index) => {
                    let origin = &old.records[old_index];
                    let resurrected = state.is_resurrected(old_index);
                    merged.first_version = origin.first_version;
                    merged.last_version = ACTIVE;
                    merged.introduced_by_change_of_existing_class =
                        origin.introduced_by_change_of_existing_class;
                    merged.removed_by_change_of_persisting_class =
                        !resurrected && origin.removed_by_change_of_persisting_class;
                    merged.annotation_text =
                        merge_annotation(&origin.annotation_text, &record.annotation_text);
                    if resurrected {
                        stats.resurrected += 1;
                    }
                    stats.retained += 1;
                    emitted.push((Bucket::Matched, merged));
                }
                None => {
                    merged.first_version = current;
                    merged.last_version = ACTIVE;
                    merged.removed_by_change_of_persisting_class = false;
                    merged.introduced_by_change_of_existing_class =
                        old.contains_class(record.class_name());
                    if merged.introduced_by_change_of_existing_class {
                        stats.added += 1;
                    } else {
                        stats.added_in_new_code += 1;
                    }
                    debug!(warning = %merged.describe(), "warning introduced");
                    emitted.push((Bucket::Introduced, merged));
                }
            }
        }

        let mut records = Vec::with_capacity(emitted.len());
        for (bucket, record) in emitted {
            check_emitted(bucket, &record, current)?;
            records.push(record);
        }

        let mut collection = new.with_records(records);
        collection.sequence_number = current;
        collection.app_versions = sequencer.extend_history(&old.app_versions);
        info!(
            release = %collection.release_name,
            sequence = current,
            retained = stats.retained,
            added = stats.added + stats.added_in_new_code,
            fixed = stats.fixed + stats.removed_with_code,
            resurrected = stats.resurrected,
            carried_dead = stats.carried_dead,
            "merged analysis run"
        );
        Ok(MergeOutcome { collection, stats })
    }
}

fn check_emitted(bucket: Bucket, record: &WarningRecord, current: i64) -> Result<(), ReconcileError> {
    if record.has_inverted_range() {
        return Err(ReconcileError::MergeInvariantViolation {
            detail: format!(
                "illegal version range {}..{} for {}",
                record.first_version,
                record.last_version,
                record.describe()
            ),
        });
    }
    let consistent = match bucket {
        Bucket::CarriedDead | Bucket::Fixed => record.is_dead(),
        Bucket::Matched => record.is_active() && record.first_version <= current,
        Bucket::Introduced => record.is_active() && record.first_version == current,
    };
    if consistent {
        Ok(())
    } else {
        Err(ReconcileError::MergeInvariantViolation {
            detail: format!(
                "{bucket:?} warning has inconsistent versions {}..{}: {}",
                record.first_version,
                record.last_version,
                record.describe()
            ),
        })
    }
}

/// Combines annotation texts of two matched warnings.
///
/// Words of `new` that `old` does not already contain are appended on a new
/// line; if `new` adds nothing, `old` is returned as is. Words are
/// whitespace-separated and compared case-sensitively.
pub(crate) fn merge_annotation(old: &str, new: &str) -> String {
    let known: BTreeSet<&str> = old.split_whitespace().collect();
    let mut seen = BTreeSet::new();
    let contributed: Vec<&str> = new
        .split_whitespace()
        .filter(|word| !known.contains(word) && seen.insert(*word))
        .collect();
    if contributed.is_empty() {
        return old.to_string();
    }
    let addition = contributed.join(" ");
    if old.trim().is_empty() {
        addition
    } else {
        format!("{old}\n{addition}")
    }
}

/// Filters applied to every run before it is merged.
#[derive(Clone, Debug, Default)]
pub(crate) struct RunPreparation {
    /// Drop warnings whose rank is above this bound.
    pub(crate) max_rank: Option<u32>,
    /// Keep only the first warning per sloppy identity.
    pub(crate) sloppy_unique: bool,
}

impl RunPreparation {
    pub(crate) fn apply(&self, collection: &mut WarningCollection) {
        if let Some(max_rank) = self.max_rank {
            let before = collection.records.len();
            collection
                .records
                .retain(|record| record.rank.is_none_or(|rank| rank <= max_rank));
            let trimmed = before - collection.records.len();
            if trimmed > 0 {
                debug!(trimmed, max_rank, "trimmed warnings above maximum rank");
            }
        }
        if self.sloppy_unique {
            let rewriter = ClassNameRewriter::identity();
            let mut seen = BTreeSet::new();
            collection
                .records
                .retain(|record| seen.insert(Matcher::Sloppy.key(record, &rewriter, false)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::ResurrectionPolicy;
    use crate::warning::method_warning;

    fn run(release: &str, classes: &[&str], records: Vec<WarningRecord>) -> WarningCollection {
        let mut collection = WarningCollection {
            release_name: release.to_string(),
            timestamp: 1_000,
            ..WarningCollection::default()
        };
        collection.project.classes = classes.iter().map(|name| name.to_string()).collect();
        collection.project.code_size = 100;
        collection.records = records;
        collection.sort_records();
        collection
    }

    fn version_insensitive_only() -> Reconciler {
        Reconciler::new(MatcherConfig {
            precise_match: true,
            ..MatcherConfig::default()
        })
    }

    #[test]
    fn fixed_warning_in_persisting_class() {
        let old = run("v0", &["Foo"], vec![method_warning("NP", "Foo", "run()V", 10)]);
        let new = run("v1", &["Foo"], Vec::new());

        let merged = Reconciler::default().merge(&old, &new).expect("merge");

        let record = &merged.collection.records[0];
        assert_eq!(record.first_version, 0);
        assert_eq!(record.last_version, 0);
        assert!(record.removed_by_change_of_persisting_class);
        assert_eq!(merged.stats.fixed, 1);
    }

    #[test]
    fn fixed_warning_in_removed_class() {
        let old = run("v0", &["Foo"], vec![method_warning("NP", "Foo", "run()V", 10)]);
        let new = run("v1", &["Other"], Vec::new());

        let merged = Reconciler::default().merge(&old, &new).expect("merge");

        let record = &merged.collection.records[0];
        assert_eq!(record.last_version, 0);
        assert!(!record.removed_by_change_of_persisting_class);
        assert_eq!(merged.stats.removed_with_code, 1);
    }

    #[test]
    fn warning_in_new_class_is_new_code() {
        let old = run("v0", &[], Vec::new());
        let new = run("v1", &["Bar"], vec![method_warning("NP", "Bar", "run()V", 5)]);

        let merged = Reconciler::default().merge(&old, &new).expect("merge");

        let record = &merged.collection.records[0];
        assert_eq!(record.first_version, 1);
        assert_eq!(record.last_version, ACTIVE);
        assert!(!record.introduced_by_change_of_existing_class);
        assert_eq!(merged.stats.added_in_new_code, 1);
    }

    #[test]
    fn warning_in_existing_class_is_introduced_by_change() {
        let old = run("v0", &["Bar"], Vec::new());
        let new = run("v1", &["Bar"], vec![method_warning("NP", "Bar", "run()V", 5)]);

        let merged = Reconciler::default().merge(&old, &new).expect("merge");

        assert!(merged.collection.records[0].introduced_by_change_of_existing_class);
    }

    #[test]
    fn line_shift_is_matched_by_version_insensitive_pass() {
        let mut origin = method_warning("NP", "Baz", "run()V", 10);
        origin.first_version = 0;
        let mut old = run("v0", &["Baz"], vec![origin]);
        old.sequence_number = 3;
        let new = run("v1", &["Baz"], vec![method_warning("NP", "Baz", "run()V", 11)]);

        let merged = version_insensitive_only().merge(&old, &new).expect("merge");

        assert_eq!(merged.collection.records.len(), 1);
        let record = &merged.collection.records[0];
        assert_eq!(record.first_version, 0);
        assert_eq!(record.last_version, ACTIVE);
        assert_eq!(record.location.source_line, Some(11));
        assert_eq!(merged.stats.retained, 1);
    }

    #[test]
    fn sequence_and_history_advance_by_one() {
        let mut old = run("v3", &["Foo"], Vec::new());
        old.sequence_number = 3;
        old.app_versions = vec![crate::version::AppVersion {
            sequence_number: 2,
            release_name: "v2".to_string(),
            ..Default::default()
        }];
        let new = run("v4", &["Foo"], Vec::new());

        let merged = Reconciler::default().merge(&old, &new).expect("merge");

        assert_eq!(merged.collection.sequence_number, 4);
        assert_eq!(merged.collection.app_versions.len(), 2);
        assert_eq!(merged.collection.app_versions[1].sequence_number, 3);
        assert_eq!(merged.collection.app_versions[1].release_name, "v3");
        assert_eq!(merged.collection.release_name, "v4");
    }

    #[test]
    fn remerging_identical_run_changes_only_sequence_and_history() {
        let first = run(
            "v0",
            &["Foo", "Bar"],
            vec![
                method_warning("NP_NULL", "Foo", "run()V", 10),
                method_warning("DM_GC", "Bar", "gc()V", 3),
            ],
        );
        let mut old = Reconciler::default()
            .merge(&run("base", &[], Vec::new()), &first)
            .expect("first merge")
            .collection;
        old.records[0].annotation_text = "triaged".to_string();
        let mut same = old.clone();
        same.app_versions.clear();
        same.sequence_number = 0;
        for record in &mut same.records {
            record.first_version = 0;
            record.annotation_text.clear();
        }

        let merged = Reconciler::default().merge(&old, &same).expect("re-merge");

        let mut expected = old.clone();
        expected.sequence_number = old.sequence_number + 1;
        expected
            .app_versions
            .push(old.current_app_version());
        assert_eq!(merged.collection, expected);
        assert_eq!(merged.stats.retained, 2);
        assert_eq!(merged.stats.added + merged.stats.added_in_new_code, 0);
    }

    #[test]
    fn dead_history_is_copied_unchanged() {
        let mut dead = method_warning("NP", "Foo", "old()V", 1);
        dead.first_version = 1;
        dead.last_version = 2;
        dead.annotation_text = "gone".to_string();
        let mut old = run("v3", &["Foo"], vec![dead.clone()]);
        old.sequence_number = 3;
        let new = run("v4", &["Foo"], vec![method_warning("NP", "Foo", "old()V", 1)]);

        let merged = Reconciler::default().merge(&old, &new).expect("merge");

        assert!(merged.collection.records.contains(&dead));
        assert_eq!(merged.stats.carried_dead, 1);
        assert_eq!(merged.stats.added, 1);
    }

    #[test]
    fn resurrected_warning_keeps_first_version() {
        let mut dead = method_warning("NP", "Foo", "run()V", 1);
        dead.first_version = 1;
        dead.last_version = 2;
        dead.removed_by_change_of_persisting_class = true;
        let mut old = run("v3", &["Foo"], vec![dead]);
        old.sequence_number = 3;
        let new = run("v4", &["Foo"], vec![method_warning("NP", "Foo", "run()V", 1)]);
        let reconciler = Reconciler::new(MatcherConfig {
            resurrection: ResurrectionPolicy::Within { max_gap: 90 },
            ..MatcherConfig::default()
        });

        let merged = reconciler.merge(&old, &new).expect("merge");

        assert_eq!(merged.collection.records.len(), 1);
        let record = &merged.collection.records[0];
        assert_eq!(record.first_version, 1);
        assert!(record.is_active());
        assert!(!record.removed_by_change_of_persisting_class);
        assert_eq!(merged.stats.resurrected, 1);
    }

    #[test]
    fn every_merged_record_satisfies_version_invariant() {
        let mut fixed = method_warning("NP", "Foo", "a()V", 1);
        fixed.first_version = 1;
        fixed.last_version = 1;
        let mut live = method_warning("NP", "Foo", "b()V", 2);
        live.first_version = 2;
        let mut old = run("v2", &["Foo", "Gone"], vec![fixed, live, method_warning("SE", "Gone", "c()V", 3)]);
        old.sequence_number = 2;
        let new = run("v3", &["Foo", "New"], vec![method_warning("UR", "New", "d()V", 4)]);

        let merged = Reconciler::default().merge(&old, &new).expect("merge");

        for record in &merged.collection.records {
            assert!(record.is_active() || record.first_version <= record.last_version);
        }
        assert_eq!(merged.collection.records.len(), 4);
    }

    #[test]
    fn inverted_range_in_old_collection_fails_before_merging() {
        let mut broken = method_warning("NP", "Foo", "run()V", 1);
        broken.first_version = 5;
        broken.last_version = 2;
        let old = run("v5", &["Foo"], vec![broken]);
        let new = run("v6", &["Foo"], Vec::new());

        let err = Reconciler::default().merge(&old, &new).expect_err("invalid input");

        assert!(matches!(err, ReconcileError::InputValidation { .. }));
    }

    #[test]
    fn version_beyond_old_sequence_fails_as_input_validation() {
        let mut unborn = method_warning("NP_NULL", "Foo", "run()V", 10);
        unborn.first_version = 5;
        let mut old = run("v2", &["Foo"], vec![unborn]);
        old.sequence_number = 2;
        let new = run("v3", &["Foo"], Vec::new());

        let err = Reconciler::default().merge(&old, &new).expect_err("invalid history");

        assert!(matches!(err, ReconcileError::InputValidation { .. }));
    }

    #[test]
    fn related_pattern_nearby_is_matched_only_by_fuzzy_pass() {
        let old = run(
            "v0",
            &["Foo"],
            vec![method_warning("NP_NULL_ON_SOME_PATH", "Foo", "run()V", 10)],
        );
        let new = run(
            "v1",
            &["Foo"],
            vec![method_warning("NP_ALWAYS_NULL", "Foo", "run()V", 12)],
        );

        let merged = Reconciler::default().merge(&old, &new).expect("merge");

        assert_eq!(merged.collection.records.len(), 1);
        let record = &merged.collection.records[0];
        assert_eq!(record.pattern_type, "NP_ALWAYS_NULL");
        assert_eq!(record.first_version, 0);
        assert_eq!(record.last_version, ACTIVE);
        assert_eq!(merged.stats.retained, 1);

        let precise = version_insensitive_only().merge(&old, &new).expect("merge");

        let lifecycles: Vec<(&str, i64, i64)> = precise
            .collection
            .records
            .iter()
            .map(|record| {
                (
                    record.pattern_type.as_str(),
                    record.first_version,
                    record.last_version,
                )
            })
            .collect();
        assert_eq!(
            lifecycles,
            vec![("NP_ALWAYS_NULL", 1, ACTIVE), ("NP_NULL_ON_SOME_PATH", 0, 0)]
        );
        assert_eq!(precise.stats.retained, 0);
        assert_eq!(precise.stats.fixed, 1);
        assert_eq!(precise.stats.added, 1);
    }

    #[test]
    fn fixed_warning_in_new_run_is_rejected() {
        let old = run("v0", &["Foo"], Vec::new());
        let mut dead = method_warning("NP", "Foo", "run()V", 1);
        dead.last_version = 0;
        let new = run("v1", &["Foo"], vec![dead]);

        let err = Reconciler::default().merge(&old, &new).expect_err("invalid run");

        assert!(matches!(err, ReconcileError::InputValidation { .. }));
    }

    #[test]
    fn invariant_check_flags_fixed_bucket_that_is_still_active() {
        let record = method_warning("NP", "Foo", "run()V", 1);

        let err = check_emitted(Bucket::Fixed, &record, 1).expect_err("inconsistent bucket");

        assert!(matches!(err, ReconcileError::MergeInvariantViolation { .. }));
    }

    #[test]
    fn annotations_merge_without_duplication() {
        assert_eq!(merge_annotation("fix later", "fix later"), "fix later");
        assert_eq!(merge_annotation("fix later", ""), "fix later");
        assert_eq!(merge_annotation("", "owner: bob"), "owner: bob");
        assert_eq!(
            merge_annotation("fix later", "fix now now"),
            "fix later\nnow"
        );
        assert_eq!(merge_annotation("Fix", "fix"), "Fix\nfix");
    }

    #[test]
    fn annotation_is_carried_from_matched_warning() {
        let mut origin = method_warning("NP", "Foo", "run()V", 10);
        origin.annotation_text = "known issue".to_string();
        let old = run("v0", &["Foo"], vec![origin]);
        let mut fresh = method_warning("NP", "Foo", "run()V", 10);
        fresh.annotation_text = "known regression".to_string();
        let new = run("v1", &["Foo"], vec![fresh]);

        let merged = Reconciler::default().merge(&old, &new).expect("merge");

        assert_eq!(
            merged.collection.records[0].annotation_text,
            "known issue\nregression"
        );
    }

    #[test]
    fn preparation_trims_rank_and_sloppy_duplicates() {
        let mut scary = method_warning("NP_A", "Foo", "a()V", 1);
        scary.rank = Some(3);
        let mut mild = method_warning("NP_B", "Foo", "b()V", 2);
        mild.rank = Some(18);
        let unranked = method_warning("SE_C", "Foo", "c()V", 3);
        let duplicate = method_warning("NP_D", "Foo", "d()V", 4);
        let mut collection = WarningCollection::default();
        collection.records = vec![scary.clone(), mild, unranked.clone(), duplicate];

        RunPreparation {
            max_rank: Some(10),
            sloppy_unique: true,
        }
        .apply(&mut collection);

        assert_eq!(collection.records, vec![scary, unranked]);
    }
}
