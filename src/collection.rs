use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::reconcile::ReconcileError;
use crate::version::AppVersion;
use crate::warning::{WarningRecord, structural_order};

/// Classes and code size observed by one analysis run.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct ProjectStats {
    #[serde(default)]
    pub(crate) classes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub(crate) source_files: BTreeSet<String>,
    #[serde(default)]
    pub(crate) code_size: u64,
}

/// Warnings of one run together with the version history they were merged
/// through.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct WarningCollection {
    #[serde(default)]
    pub(crate) release_name: String,
    #[serde(default)]
    pub(crate) timestamp: i64,
    #[serde(default)]
    pub(crate) analysis_timestamp: i64,
    #[serde(default)]
    pub(crate) sequence_number: i64,
    #[serde(default)]
    pub(crate) project: ProjectStats,
    #[serde(default)]
    pub(crate) app_versions: Vec<AppVersion>,
    #[serde(default)]
    pub(crate) records: Vec<WarningRecord>,
}

impl WarningCollection {
    /// The collection's own run as a history entry.
    pub(crate) fn current_app_version(&self) -> AppVersion {
        AppVersion {
            sequence_number: self.sequence_number,
            release_name: self.release_name.clone(),
            timestamp: self.timestamp,
            class_count: self.project.classes.len(),
            code_size: self.project.code_size,
        }
    }

    /// Copy of the run metadata with a different record set.
    pub(crate) fn with_records(&self, records: Vec<WarningRecord>) -> Self {
        let mut collection = Self {
            release_name: self.release_name.clone(),
            timestamp: self.timestamp,
            analysis_timestamp: self.analysis_timestamp,
            sequence_number: self.sequence_number,
            project: self.project.clone(),
            app_versions: self.app_versions.clone(),
            records,
        };
        collection.sort_records();
        collection
    }

    pub(crate) fn sort_records(&mut self) {
        self.records.sort_by(structural_order);
    }

    pub(crate) fn contains_class(&self, class_name: &str) -> bool {
        self.project.classes.contains(class_name)
    }

    /// Returns true when the record's class, or the source file it lives in,
    /// was analyzed by this run.
    pub(crate) fn covers_code_of(&self, record: &WarningRecord) -> bool {
        if self.contains_class(record.class_name()) {
            return true;
        }
        record
            .location
            .source_file
            .as_ref()
            .is_some_and(|file| self.project.source_files.contains(file))
    }

    /// Rejects records that are malformed, carry an inverted version range or
    /// refer to a version after the collection's own sequence.
    pub(crate) fn validate(&self) -> Result<(), ReconcileError> {
        for record in &self.records {
            if let Some(reason) = record.validation_problem() {
                return Err(ReconcileError::InputValidation { reason });
            }
            let latest = record.first_version.max(record.last_version);
            if latest > self.sequence_number {
                return Err(ReconcileError::InputValidation {
                    reason: format!(
                        "{} refers to version {latest} after the collection's sequence {}",
                        record.describe(),
                        self.sequence_number
                    ),
                });
            }
        }
        Ok(())
    }

    /// Like [`Self::validate`], additionally requiring every record to be
    /// active, as a fresh analysis run has no history.
    pub(crate) fn validate_fresh_run(&self) -> Result<(), ReconcileError> {
        self.validate()?;
        if let Some(dead) = self.records.iter().find(|record| record.is_dead()) {
            return Err(ReconcileError::InputValidation {
                reason: format!(
                    "cannot merge a run that contains fixed warnings: {}",
                    dead.describe()
                ),
            });
        }
        Ok(())
    }
}

/// Loads a collection from a JSON file.
pub(crate) fn load_collection(path: &Path) -> Result<WarningCollection> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let deserializer = &mut serde_json::Deserializer::from_str(&content);
    let collection: WarningCollection = serde_path_to_error::deserialize(deserializer)
        .with_context(|| format!("failed to parse collection {}", path.display()))?;
    Ok(collection)
}

/// Returns true for files that exist but hold no data; such runs are skipped.
pub(crate) fn is_empty_input(path: &Path) -> bool {
    fs::metadata(path).is_ok_and(|metadata| metadata.len() == 0)
}

/// Writes a collection as JSON to `path`, or to stdout for `None` and `-`.
pub(crate) fn store_collection(path: Option<&Path>, collection: &WarningCollection) -> Result<()> {
    let mut writer = output_writer(path)?;
    serde_json::to_writer_pretty(&mut writer, collection)
        .context("failed to serialize collection")?;
    writer
        .write_all(b"\n")
        .context("failed to write collection")?;
    writer.flush().context("failed to flush collection")?;
    Ok(())
}

pub(crate) fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create output directory {}", parent.display())
                })?;
            }
            let file =
                File::create(path).with_context(|| format!("failed to open {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(io::stdout())),
    }
}
