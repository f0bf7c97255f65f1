use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Sentinel stored in `last_version` while a warning is still reported.
pub(crate) const ACTIVE: i64 = -1;

/// Code location a warning is anchored to.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub(crate) struct Location {
    pub(crate) class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) method_signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) field_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) source_line: Option<u32>,
}

/// One reported warning plus the lifecycle fields tracked across runs.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub(crate) struct WarningRecord {
    pub(crate) pattern_type: String,
    pub(crate) priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) rank: Option<u32>,
    pub(crate) location: Location,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub(crate) annotation_text: String,
    #[serde(default)]
    pub(crate) first_version: i64,
    #[serde(default = "active_sentinel")]
    pub(crate) last_version: i64,
    #[serde(default)]
    pub(crate) introduced_by_change_of_existing_class: bool,
    #[serde(default)]
    pub(crate) removed_by_change_of_persisting_class: bool,
}

fn active_sentinel() -> i64 {
    ACTIVE
}

impl WarningRecord {
    pub(crate) fn is_active(&self) -> bool {
        self.last_version == ACTIVE
    }

    pub(crate) fn is_dead(&self) -> bool {
        !self.is_active()
    }

    pub(crate) fn class_name(&self) -> &str {
        &self.location.class_name
    }

    /// Pattern family shared by related pattern types, e.g. `NP` for
    /// `NP_NULL_ON_SOME_PATH`. Empty when the type has no `_`.
    pub(crate) fn bug_code(&self) -> &str {
        bug_code(&self.pattern_type)
    }

    /// Returns true when the version range of a dead record is inverted.
    pub(crate) fn has_inverted_range(&self) -> bool {
        self.is_dead() && self.first_version > self.last_version
    }

    /// Reports the first structural problem of this record, if any.
    pub(crate) fn validation_problem(&self) -> Option<String> {
        if self.pattern_type.trim().is_empty() {
            return Some("warning without pattern type".to_string());
        }
        if self.location.class_name.trim().is_empty() {
            return Some(format!("{} warning without class name", self.pattern_type));
        }
        if self.last_version < ACTIVE {
            return Some(format!(
                "{} in {} has invalid last version {}",
                self.pattern_type, self.location.class_name, self.last_version
            ));
        }
        if self.has_inverted_range() {
            return Some(format!(
                "{} in {} has illegal version range {}..{}",
                self.pattern_type,
                self.location.class_name,
                self.first_version,
                self.last_version
            ));
        }
        None
    }

    /// Human-readable one-line description used in logs and SARIF messages.
    pub(crate) fn describe(&self) -> String {
        let mut text = format!("{} in {}", self.pattern_type, self.location.class_name);
        if let Some(method) = &self.location.method_signature {
            text.push('.');
            text.push_str(method);
        } else if let Some(field) = &self.location.field_name {
            text.push('.');
            text.push_str(field);
        }
        if let Some(line) = self.location.source_line {
            text.push_str(&format!(" (line {line})"));
        }
        text
    }
}

pub(crate) fn bug_code(pattern_type: &str) -> &str {
    pattern_type
        .split_once('_')
        .map(|(code, _)| code)
        .unwrap_or("")
}

/// Default structural ordering of records inside a collection.
pub(crate) fn structural_order(left: &WarningRecord, right: &WarningRecord) -> Ordering {
    left.location
        .class_name
        .cmp(&right.location.class_name)
        .then_with(|| left.pattern_type.cmp(&right.pattern_type))
        .then_with(|| left.location.method_signature.cmp(&right.location.method_signature))
        .then_with(|| left.location.field_name.cmp(&right.location.field_name))
        .then_with(|| left.location.source_line.cmp(&right.location.source_line))
        .then_with(|| left.priority.cmp(&right.priority))
}

#[cfg(test)]
pub(crate) fn method_warning(
    pattern_type: &str,
    class_name: &str,
    method: &str,
    line: u32,
) -> WarningRecord {
    WarningRecord {
        pattern_type: pattern_type.to_string(),
        priority: 2,
        rank: None,
        location: Location {
            class_name: class_name.to_string(),
            method_signature: Some(method.to_string()),
            source_line: Some(line),
            ..Location::default()
        },
        annotation_text: String::new(),
        first_version: 0,
        last_version: ACTIVE,
        introduced_by_change_of_existing_class: false,
        removed_by_change_of_persisting_class: false,
    }
}
