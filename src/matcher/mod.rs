//! Warning identity matching across analysis runs.
//!
//! Every strategy projects a record onto a totally ordered [`MatchKey`]; two
//! records from different runs denote the same defect under a strategy when
//! their keys are equal. A merge applies the strategies as a cascade where
//! each pass only sees the residue left unmatched by the passes before it.

mod fuzzy;
mod moved;

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use crate::warning::WarningRecord;

pub(crate) use fuzzy::FuzzyContext;
pub(crate) use moved::infer_moved_classes;

/// Default number of versions a fixed warning may stay dead and still be
/// matched again.
pub(crate) const DEFAULT_MAX_RESURRECTION: i64 = 90;

/// Identity strategy used to decide whether two warnings are the same.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) enum Matcher {
    /// Pattern type, full location and priority must be equal.
    Exact,
    /// Ignores source lines; class names go through the rename map.
    VersionInsensitive,
    /// Pattern family and class only.
    Sloppy,
    /// Pattern family and member, choosing the nearest candidate by line
    /// shift and annotation overlap.
    Fuzzy,
}

impl Matcher {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Matcher::Exact => "exact",
            Matcher::VersionInsensitive => "version-insensitive",
            Matcher::Sloppy => "sloppy",
            Matcher::Fuzzy => "fuzzy",
        }
    }

    /// Projects a record onto the key compared by this strategy.
    pub(crate) fn key(
        self,
        record: &WarningRecord,
        rewriter: &ClassNameRewriter,
        compare_priorities: bool,
    ) -> MatchKey {
        let location = &record.location;
        let priority = compare_priorities.then_some(record.priority);
        match self {
            Matcher::Exact => MatchKey {
                code: record.bug_code().to_string(),
                pattern_type: Some(record.pattern_type.clone()),
                class_name: location.class_name.clone(),
                method_signature: location.method_signature.clone(),
                field_name: location.field_name.clone(),
                source_line: location.source_line,
                priority: Some(record.priority),
            },
            Matcher::VersionInsensitive => MatchKey {
                code: record.bug_code().to_string(),
                pattern_type: Some(record.pattern_type.clone()),
                class_name: rewriter.rewrite(&location.class_name).into_owned(),
                method_signature: location.method_signature.clone(),
                field_name: location.field_name.clone(),
                source_line: None,
                priority,
            },
            Matcher::Sloppy => MatchKey {
                code: record.bug_code().to_string(),
                pattern_type: None,
                class_name: rewriter.rewrite(&location.class_name).into_owned(),
                method_signature: None,
                field_name: None,
                source_line: None,
                priority: None,
            },
            Matcher::Fuzzy => MatchKey {
                code: record.bug_code().to_string(),
                pattern_type: None,
                class_name: rewriter.rewrite(&location.class_name).into_owned(),
                method_signature: location.method_signature.clone(),
                field_name: location.field_name.clone(),
                source_line: None,
                priority,
            },
        }
    }
}

/// Ordered projection of a warning; fields a strategy ignores stay `None`.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) struct MatchKey {
    code: String,
    pattern_type: Option<String>,
    class_name: String,
    method_signature: Option<String>,
    field_name: Option<String>,
    source_line: Option<u32>,
    priority: Option<i32>,
}

/// Maps class names of the older run onto their names in the newer run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct ClassNameRewriter {
    renames: BTreeMap<String, String>,
}

impl ClassNameRewriter {
    pub(crate) fn new(renames: BTreeMap<String, String>) -> Self {
        Self { renames }
    }

    pub(crate) fn identity() -> Self {
        Self::default()
    }

    pub(crate) fn is_identity(&self) -> bool {
        self.renames.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.renames.len()
    }

    pub(crate) fn rewrite<'a>(&self, class_name: &'a str) -> Cow<'a, str> {
        match self.renames.get(class_name) {
            Some(renamed) => Cow::Owned(renamed.clone()),
            None => Cow::Borrowed(class_name),
        }
    }

    /// Adds renames that are not already present.
    pub(crate) fn extend(&mut self, renames: BTreeMap<String, String>) {
        for (from, to) in renames {
            self.renames.entry(from).or_insert(to);
        }
    }
}

/// Whether warnings that were already fixed may be matched again.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ResurrectionPolicy {
    Never,
    /// Fixed warnings may come back unless they were removed from a
    /// persisting class more than `max_gap` versions ago.
    Within { max_gap: i64 },
}

/// Cascade configuration derived from command-line switches.
#[derive(Clone, Debug)]
pub(crate) struct MatcherConfig {
    /// Skip fuzzy matching.
    pub(crate) precise_match: bool,
    /// Only match warnings whose priorities are equal.
    pub(crate) precise_priority: bool,
    pub(crate) sloppy_match: bool,
    /// Infer classes that moved between packages.
    pub(crate) package_moves: bool,
    /// Renames supplied by the caller.
    pub(crate) class_renames: BTreeMap<String, String>,
    pub(crate) resurrection: ResurrectionPolicy,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            precise_match: false,
            precise_priority: false,
            sloppy_match: false,
            package_moves: true,
            class_renames: BTreeMap::new(),
            resurrection: ResurrectionPolicy::Never,
        }
    }
}

/// Which old records a pass may consider.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OldEligibility {
    Live,
    /// Live records and records removed while their class persisted.
    LiveOrRemovedFromPersistingClass,
    Any,
}

impl OldEligibility {
    fn admits(self, record: &WarningRecord) -> bool {
        match self {
            OldEligibility::Live => record.is_active(),
            OldEligibility::LiveOrRemovedFromPersistingClass => {
                record.is_active() || record.removed_by_change_of_persisting_class
            }
            OldEligibility::Any => true,
        }
    }
}

/// One step of the cascade.
#[derive(Clone, Debug)]
pub(crate) struct MatchPass {
    pub(crate) matcher: Matcher,
    pub(crate) rewriter: ClassNameRewriter,
    pub(crate) eligibility: OldEligibility,
    pub(crate) compare_priorities: bool,
}

impl MatchPass {
    fn live(matcher: Matcher, rewriter: &ClassNameRewriter, compare_priorities: bool) -> Self {
        Self {
            matcher,
            rewriter: rewriter.clone(),
            eligibility: OldEligibility::Live,
            compare_priorities,
        }
    }
}

/// Builds the fixed-order cascade: exact, version-insensitive (plain, then
/// through renames), sloppy, fuzzy.
pub(crate) fn build_cascade(
    config: &MatcherConfig,
    old: &[WarningRecord],
    new: &[WarningRecord],
    old_classes: &BTreeSet<String>,
    new_classes: &BTreeSet<String>,
) -> Vec<MatchPass> {
    let identity = ClassNameRewriter::identity();
    let mut renames = ClassNameRewriter::new(config.class_renames.clone());
    if config.package_moves {
        renames.extend(infer_moved_classes(old, new, old_classes, new_classes));
    }
    let priorities = config.precise_priority;

    let mut passes = vec![
        MatchPass::live(Matcher::Exact, &identity, true),
        MatchPass::live(Matcher::VersionInsensitive, &identity, priorities),
    ];
    if let ResurrectionPolicy::Within { .. } = config.resurrection {
        for eligibility in [
            OldEligibility::LiveOrRemovedFromPersistingClass,
            OldEligibility::Any,
        ] {
            passes.push(MatchPass {
                matcher: Matcher::VersionInsensitive,
                rewriter: identity.clone(),
                eligibility,
                compare_priorities: priorities,
            });
        }
    }
    if !renames.is_identity() {
        debug!(renames = renames.len(), "matching through class renames");
        passes.push(MatchPass::live(
            Matcher::VersionInsensitive,
            &renames,
            priorities,
        ));
    }
    if config.sloppy_match {
        passes.push(MatchPass::live(Matcher::Sloppy, &renames, false));
    }
    if !config.precise_match {
        passes.push(MatchPass::live(Matcher::Fuzzy, &renames, priorities));
    }
    passes
}

/// Partial bijection from new records to old records built by the cascade.
#[derive(Clone, Debug)]
pub(crate) struct MatchState {
    new_to_old: Vec<Option<usize>>,
    old_matched: Vec<bool>,
    resurrected: BTreeSet<usize>,
    pass_counts: Vec<(Matcher, usize)>,
}

impl MatchState {
    pub(crate) fn new(old_len: usize, new_len: usize) -> Self {
        Self {
            new_to_old: vec![None; new_len],
            old_matched: vec![false; old_len],
            resurrected: BTreeSet::new(),
            pass_counts: Vec::new(),
        }
    }

    pub(crate) fn old_for(&self, new_index: usize) -> Option<usize> {
        self.new_to_old.get(new_index).copied().flatten()
    }

    pub(crate) fn is_old_matched(&self, old_index: usize) -> bool {
        self.old_matched.get(old_index).copied().unwrap_or(false)
    }

    pub(crate) fn is_resurrected(&self, old_index: usize) -> bool {
        self.resurrected.contains(&old_index)
    }

    pub(crate) fn pass_counts(&self) -> &[(Matcher, usize)] {
        &self.pass_counts
    }

    fn record(&mut self, new_index: usize, old_index: usize, resurrected: bool) {
        self.new_to_old[new_index] = Some(old_index);
        self.old_matched[old_index] = true;
        if resurrected {
            self.resurrected.insert(old_index);
        }
    }

    /// Runs one pass over the records left unmatched by earlier passes.
    ///
    /// Candidates sharing a key are kept in insertion order and the first
    /// acceptable one wins; fuzzy passes pick the nearest candidate instead,
    /// again preferring the earliest on ties.
    pub(crate) fn run_pass(
        &mut self,
        pass: &MatchPass,
        old: &[WarningRecord],
        new: &[WarningRecord],
        fuzzy: Option<&FuzzyContext>,
        new_sequence: i64,
        resurrection: ResurrectionPolicy,
    ) -> usize {
        let mut queues: BTreeMap<MatchKey, VecDeque<usize>> = BTreeMap::new();
        for (index, record) in old.iter().enumerate() {
            if self.old_matched[index] || !pass.eligibility.admits(record) {
                continue;
            }
            queues
                .entry(pass.matcher.key(record, &pass.rewriter, pass.compare_priorities))
                .or_default()
                .push_back(index);
        }

        let mut matched = 0;
        for (new_index, record) in new.iter().enumerate() {
            if self.new_to_old[new_index].is_some() {
                continue;
            }
            let key = pass
                .matcher
                .key(record, &pass.rewriter, pass.compare_priorities);
            let Some(queue) = queues.get_mut(&key) else {
                continue;
            };
            let acceptable = |old_index: usize| {
                can_resurrect(&old[old_index], new_sequence, resurrection)
            };
            let position = match (pass.matcher, fuzzy) {
                (Matcher::Fuzzy, Some(context)) => context.nearest(
                    queue.iter().copied().filter(|&index| acceptable(index)),
                    old,
                    record,
                    &pass.rewriter,
                ),
                _ => queue.iter().copied().find(|&index| acceptable(index)),
            }
            .and_then(|old_index| queue.iter().position(|&index| index == old_index));
            let Some(position) = position else {
                continue;
            };
            let Some(old_index) = queue.remove(position) else {
                continue;
            };
            if queue.is_empty() {
                queues.remove(&key);
            }
            let resurrected = old[old_index].is_dead();
            self.record(new_index, old_index, resurrected);
            matched += 1;
        }
        self.pass_counts.push((pass.matcher, matched));
        matched
    }
}

fn can_resurrect(
    candidate: &WarningRecord,
    new_sequence: i64,
    resurrection: ResurrectionPolicy,
) -> bool {
    if candidate.is_active() {
        return true;
    }
    match resurrection {
        ResurrectionPolicy::Never => false,
        ResurrectionPolicy::Within { max_gap } => {
            !(candidate.removed_by_change_of_persisting_class
                && new_sequence - candidate.last_version > max_gap)
        }
    }
}

/// Runs the configured cascade between an old and a new record set.
pub(crate) fn match_cascade(
    config: &MatcherConfig,
    old: &[WarningRecord],
    new: &[WarningRecord],
    old_classes: &BTreeSet<String>,
    new_classes: &BTreeSet<String>,
    new_sequence: i64,
) -> MatchState {
    let passes = build_cascade(config, old, new, old_classes, new_classes);
    let mut state = MatchState::new(old.len(), new.len());
    for pass in &passes {
        let fuzzy = (pass.matcher == Matcher::Fuzzy)
            .then(|| FuzzyContext::prepare(old, new, &pass.rewriter));
        let matched = state.run_pass(
            pass,
            old,
            new,
            fuzzy.as_ref(),
            new_sequence,
            config.resurrection,
        );
        debug!(
            matcher = pass.matcher.label(),
            matched, "matcher pass finished"
        );
    }
    state
}

/// Matches two record sets with a single strategy, considering every old
/// record regardless of its lifecycle state.
pub(crate) fn match_single(
    matcher: Matcher,
    old: &[WarningRecord],
    new: &[WarningRecord],
) -> MatchState {
    let rewriter = ClassNameRewriter::identity();
    let pass = MatchPass {
        matcher,
        rewriter: rewriter.clone(),
        eligibility: OldEligibility::Any,
        compare_priorities: false,
    };
    let fuzzy = (matcher == Matcher::Fuzzy).then(|| FuzzyContext::prepare(old, new, &rewriter));
    let mut state = MatchState::new(old.len(), new.len());
    state.run_pass(
        &pass,
        old,
        new,
        fuzzy.as_ref(),
        0,
        ResurrectionPolicy::Within { max_gap: i64::MAX },
    );
    state
}
