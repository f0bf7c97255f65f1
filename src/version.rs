use serde::{Deserialize, Serialize};

use crate::collection::WarningCollection;

/// Metadata of one analysis run recorded in a collection's history.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct AppVersion {
    pub(crate) sequence_number: i64,
    #[serde(default)]
    pub(crate) release_name: String,
    #[serde(default)]
    pub(crate) timestamp: i64,
    #[serde(default)]
    pub(crate) class_count: usize,
    #[serde(default)]
    pub(crate) code_size: u64,
}

/// Sequence bookkeeping for a single merge step.
///
/// The previous collection is frozen into an [`AppVersion`] at its own
/// sequence number and the merged result is assigned the next one.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct VersionSequencer {
    previous: AppVersion,
}

impl VersionSequencer {
    pub(crate) fn following(collection: &WarningCollection) -> Self {
        Self {
            previous: collection.current_app_version(),
        }
    }

    /// Sequence number of the run being merged from.
    pub(crate) fn previous_sequence(&self) -> i64 {
        self.previous.sequence_number
    }

    /// Sequence number assigned to the merged collection.
    pub(crate) fn next_sequence(&self) -> i64 {
        self.previous.sequence_number + 1
    }

    /// History carried into the merged collection: every recorded version of
    /// the previous collection followed by the previous run itself.
    pub(crate) fn extend_history(&self, history: &[AppVersion]) -> Vec<AppVersion> {
        let mut versions = Vec::with_capacity(history.len() + 1);
        versions.extend(history.iter().cloned());
        versions.push(self.previous.clone());
        versions
    }
}
