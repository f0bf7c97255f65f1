//! Set operations between the warnings of two runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use tracing::{debug, info, warn};

use crate::collection::{WarningCollection, load_collection, store_collection};
use crate::matcher::{Matcher, match_single};

/// Collections kept in memory while walking a bulk pairs file.
pub(crate) const BULK_CACHE_CAPACITY: u64 = 5;

/// Loaded collections by path; consecutive pairs usually share a file.
pub(crate) type CollectionCache = Cache<PathBuf, Arc<WarningCollection>>;

pub(crate) fn collection_cache() -> CollectionCache {
    Cache::builder()
        .max_capacity(BULK_CACHE_CAPACITY)
        .eviction_policy(EvictionPolicy::lru())
        .build()
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum SetOperation {
    /// Warnings of the newer run without a counterpart in the older run.
    Added,
    /// Warnings of the older run without a counterpart in the newer run.
    Removed,
    /// Warnings of the newer run that also occur in the older run.
    Retained,
}

impl SetOperation {
    pub(crate) fn label(self) -> &'static str {
        match self {
            SetOperation::Added => "added",
            SetOperation::Removed => "removed",
            SetOperation::Retained => "retained",
        }
    }
}

/// Identity strategies offered for set operations.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum DiffMatcher {
    #[default]
    VersionInsensitive,
    Fuzzy,
    Sloppy,
}

impl From<DiffMatcher> for Matcher {
    fn from(matcher: DiffMatcher) -> Self {
        match matcher {
            DiffMatcher::VersionInsensitive => Matcher::VersionInsensitive,
            DiffMatcher::Fuzzy => Matcher::Fuzzy,
            DiffMatcher::Sloppy => Matcher::Sloppy,
        }
    }
}

/// Applies `operation` to two collections. The result carries the metadata of
/// the collection its records were taken from.
pub(crate) fn apply_set_operation(
    operation: SetOperation,
    matcher: Matcher,
    old: &WarningCollection,
    new: &WarningCollection,
) -> WarningCollection {
    let state = match_single(matcher, &old.records, &new.records);
    match operation {
        SetOperation::Added | SetOperation::Retained => {
            let want_matched = operation == SetOperation::Retained;
            let records = new
                .records
                .iter()
                .enumerate()
                .filter(|(index, _)| state.old_for(*index).is_some() == want_matched)
                .map(|(_, record)| record.clone())
                .collect();
            new.with_records(records)
        }
        SetOperation::Removed => {
            let records = old
                .records
                .iter()
                .enumerate()
                .filter(|(index, _)| !state.is_old_matched(*index))
                .map(|(_, record)| record.clone())
                .collect();
            old.with_records(records)
        }
    }
}

/// Reads `old,new` pairs, one per line. Blank lines, `#` comments and lines
/// without a comma are ignored; relative paths resolve against the pairs
/// file's directory.
pub(crate) fn read_pairs(path: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(""));
    let resolve = |entry: &str| {
        let entry = PathBuf::from(entry.trim());
        if entry.is_absolute() {
            entry
        } else {
            base_dir.join(entry)
        }
    };
    let pairs = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(',');
            let old = fields.next()?;
            let new = fields.next()?;
            Some((resolve(old), resolve(new)))
        })
        .collect();
    Ok(pairs)
}

/// `<output_dir>/<new file stem>-<operation>.json`.
pub(crate) fn bulk_output_path(output_dir: &Path, new: &Path, operation: SetOperation) -> PathBuf {
    let stem = new
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_dir.join(format!("{stem}-{}.json", operation.label()))
}

/// Where bulk results go.
#[derive(Copy, Clone, Debug)]
pub(crate) enum BulkOutput<'a> {
    /// One result collection per pair inside this directory.
    Files(&'a Path),
    /// Only the number of selected warnings per pair.
    Counts,
}

#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct BulkSummary {
    pub(crate) written: Vec<PathBuf>,
    /// Newer collection of each pair with its result size, in counting mode.
    pub(crate) counts: Vec<(PathBuf, usize)>,
    /// Pairs skipped because a collection could not be loaded.
    pub(crate) skipped: usize,
}

/// Runs `operation` over every pair, writing one result file or one count per
/// pair.
pub(crate) fn run_bulk(
    pairs: &[(PathBuf, PathBuf)],
    operation: SetOperation,
    matcher: Matcher,
    output: BulkOutput<'_>,
    cache: &CollectionCache,
) -> Result<BulkSummary> {
    let mut summary = BulkSummary::default();
    for (old_path, new_path) in pairs {
        let loaded = fetch(cache, old_path).and_then(|old| Ok((old, fetch(cache, new_path)?)));
        let (old, new) = match loaded {
            Ok(collections) => collections,
            Err(err) => {
                warn!("skipping pair {}: {err:#}", new_path.display());
                summary.skipped += 1;
                continue;
            }
        };
        let result = apply_set_operation(operation, matcher, &old, &new);
        match output {
            BulkOutput::Counts => {
                summary
                    .counts
                    .push((new_path.clone(), result.records.len()));
            }
            BulkOutput::Files(output_dir) => {
                let output = bulk_output_path(output_dir, new_path, operation);
                store_collection(Some(&output), &result)?;
                info!(
                    output = %output.display(),
                    records = result.records.len(),
                    "wrote set operation result"
                );
                summary.written.push(output);
            }
        }
        debug!(cached = cache.entry_count(), "bulk collection cache");
    }
    if summary.skipped > 0 {
        warn!(
            skipped = summary.skipped,
            "pairs skipped because of unreadable collections"
        );
    }
    Ok(summary)
}

fn fetch(cache: &CollectionCache, path: &Path) -> Result<Arc<WarningCollection>> {
    cache
        .try_get_with(path.to_path_buf(), || load_collection(path).map(Arc::new))
        .map_err(|err| anyhow!("{err:#}"))
}
