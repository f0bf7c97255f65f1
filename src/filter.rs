//! Lifecycle and attribute filters over a warning collection.

use anyhow::{Result, anyhow, bail};
use chrono::NaiveDate;
use clap::Args;
use regex::Regex;

use crate::collection::WarningCollection;
use crate::version::AppVersion;
use crate::warning::WarningRecord;

/// Selection criteria as given on the command line.
///
/// Versions may be given as a release name of the collection, a sequence
/// number or a `yyyy-mm-dd` date.
#[derive(Args, Debug, Clone, Default)]
pub(crate) struct FilterCriteria {
    #[arg(long, value_name = "VERSION", help = "Keep warnings first seen in VERSION.")]
    pub(crate) first: Option<String>,
    #[arg(long, value_name = "VERSION", help = "Keep warnings last seen in VERSION.")]
    pub(crate) last: Option<String>,
    #[arg(long, value_name = "VERSION", help = "Keep warnings first seen after VERSION.")]
    pub(crate) after: Option<String>,
    #[arg(long, value_name = "VERSION", help = "Keep warnings first seen before VERSION.")]
    pub(crate) before: Option<String>,
    #[arg(long, value_name = "VERSION", help = "Keep warnings reported in VERSION.")]
    pub(crate) present: Option<String>,
    #[arg(long, value_name = "VERSION", help = "Keep warnings not reported in VERSION.")]
    pub(crate) absent: Option<String>,
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Keep warnings still reported by the latest run."
    )]
    pub(crate) active: Option<bool>,
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Keep warnings introduced by a change of an existing class."
    )]
    pub(crate) introduced_by_change: Option<bool>,
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Keep warnings removed by a change of a persisting class."
    )]
    pub(crate) removed_by_change: Option<bool>,
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Keep warnings introduced by adding a class."
    )]
    pub(crate) new_code: Option<bool>,
    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Keep warnings removed together with their class."
    )]
    pub(crate) removed_code: Option<bool>,
    #[arg(
        long,
        value_name = "LEVEL",
        value_parser = parse_priority,
        help = "Keep warnings of this priority or higher (H, M, L, E or 1-4)."
    )]
    pub(crate) priority: Option<i32>,
    #[arg(
        long = "class",
        value_name = "REGEX",
        value_parser = Regex::new,
        help = "Keep warnings whose class name matches REGEX."
    )]
    pub(crate) class_pattern: Option<Regex>,
    #[arg(
        long,
        value_name = "REGEX",
        value_parser = Regex::new,
        help = "Keep warnings whose pattern type matches REGEX."
    )]
    pub(crate) bug_pattern: Option<Regex>,
    #[arg(long, value_name = "TEXT", help = "Keep warnings whose annotation contains TEXT.")]
    pub(crate) annotation: Option<String>,
    #[arg(long, help = "Invert the whole selection.")]
    pub(crate) not: bool,
}

/// Parses `H`, `M`, `L`, `E` or `1`-`4` into a priority level.
pub(crate) fn parse_priority(text: &str) -> Result<i32, String> {
    match text.trim().to_ascii_uppercase().as_str() {
        "H" | "1" => Ok(1),
        "M" | "2" => Ok(2),
        "L" | "3" => Ok(3),
        "E" | "4" => Ok(4),
        other => Err(format!("bad priority: {other}")),
    }
}

/// Direction a date is rounded to when it falls between two versions.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Rounding {
    Later,
    Earlier,
}

/// Criteria with every version resolved to a sequence number.
#[derive(Debug, Clone)]
pub(crate) struct WarningFilter {
    criteria: FilterCriteria,
    first: Option<i64>,
    last: Option<i64>,
    after: Option<i64>,
    before: Option<i64>,
    present: Option<i64>,
    absent: Option<i64>,
}

impl FilterCriteria {
    /// Resolves version names and dates against the history of `collection`.
    pub(crate) fn resolve(&self, collection: &WarningCollection) -> Result<WarningFilter> {
        let mut versions: Vec<AppVersion> = collection.app_versions.clone();
        versions.push(collection.current_app_version());
        let resolve = |text: &Option<String>, rounding| {
            text.as_deref()
                .map(|text| resolve_version(&versions, text, rounding))
                .transpose()
        };
        Ok(WarningFilter {
            first: resolve(&self.first, Rounding::Later)?,
            last: resolve(&self.last, Rounding::Later)?,
            after: resolve(&self.after, Rounding::Earlier)?,
            before: resolve(&self.before, Rounding::Later)?,
            present: resolve(&self.present, Rounding::Later)?,
            absent: resolve(&self.absent, Rounding::Later)?,
            criteria: self.clone(),
        })
    }
}

fn resolve_version(versions: &[AppVersion], text: &str, rounding: Rounding) -> Result<i64> {
    if let Some(version) = versions.iter().find(|version| version.release_name == text) {
        return Ok(version.sequence_number);
    }
    if let Ok(sequence) = text.parse::<i64>() {
        return Ok(sequence);
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| anyhow!("unknown version '{text}': not a release name, sequence number or yyyy-mm-dd date"))?;
    let Some(midnight) = date.and_hms_opt(0, 0, 0) else {
        bail!("unknown version '{text}': not a release name, sequence number or yyyy-mm-dd date");
    };
    let when = midnight.and_utc().timestamp_millis();
    let mut by_time: Vec<&AppVersion> = versions.iter().collect();
    by_time.sort_by_key(|version| (version.timestamp, version.sequence_number));
    let sequence = match rounding {
        Rounding::Later => by_time
            .iter()
            .find(|version| version.timestamp >= when)
            .map_or(i64::MAX, |version| version.sequence_number),
        Rounding::Earlier => by_time
            .iter()
            .rev()
            .find(|version| version.timestamp < when)
            .map_or(i64::MIN, |version| version.sequence_number),
    };
    Ok(sequence)
}

impl WarningFilter {
    pub(crate) fn accept(&self, record: &WarningRecord) -> bool {
        self.evaluate(record) != self.criteria.not
    }

    fn evaluate(&self, record: &WarningRecord) -> bool {
        let criteria = &self.criteria;
        if let Some(text) = &criteria.annotation {
            if !record.annotation_text.contains(text.as_str()) {
                return false;
            }
        }
        if criteria.priority.is_some_and(|level| record.priority > level) {
            return false;
        }
        if self.first.is_some_and(|first| record.first_version != first)
            || self.after.is_some_and(|after| record.first_version <= after)
            || self.before.is_some_and(|before| record.first_version >= before)
            || self.last.is_some_and(|last| record.last_version != last)
            || self.present.is_some_and(|version| !live_at(record, version))
            || self.absent.is_some_and(|version| live_at(record, version))
        {
            return false;
        }
        let new_code = !record.introduced_by_change_of_existing_class && record.first_version != 0;
        let removed_code = !record.removed_by_change_of_persisting_class && record.is_dead();
        let flags = [
            (criteria.active, record.is_active()),
            (
                criteria.introduced_by_change,
                record.introduced_by_change_of_existing_class,
            ),
            (
                criteria.removed_by_change,
                record.removed_by_change_of_persisting_class,
            ),
            (criteria.new_code, new_code),
            (criteria.removed_code, removed_code),
        ];
        if flags
            .iter()
            .any(|(wanted, actual)| wanted.is_some_and(|wanted| wanted != *actual))
        {
            return false;
        }
        if let Some(pattern) = &criteria.bug_pattern {
            if !pattern.is_match(&record.pattern_type) {
                return false;
            }
        }
        if let Some(pattern) = &criteria.class_pattern {
            if !pattern.is_match(record.class_name()) {
                return false;
            }
        }
        true
    }
}

fn live_at(record: &WarningRecord, sequence: i64) -> bool {
    sequence >= record.first_version && (record.is_active() || record.last_version >= sequence)
}

#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct FilterStats {
    pub(crate) passed: usize,
    pub(crate) dropped: usize,
}

/// Copy of `collection` holding only the records `filter` accepts.
pub(crate) fn filter_collection(
    filter: &WarningFilter,
    collection: &WarningCollection,
) -> (WarningCollection, FilterStats) {
    let records: Vec<WarningRecord> = collection
        .records
        .iter()
        .filter(|record| filter.accept(record))
        .cloned()
        .collect();
    let stats = FilterStats {
        passed: records.len(),
        dropped: collection.records.len() - records.len(),
    };
    (collection.with_records(records), stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warning::{ACTIVE, method_warning};

    const DAY_MILLIS: i64 = 86_400_000;

    fn record(pattern: &str, class: &str, first: i64, last: i64) -> WarningRecord {
        let mut record = method_warning(pattern, class, "run()V", 1);
        record.first_version = first;
        record.last_version = last;
        record
    }

    /// History of three versions released on consecutive days from
    /// 2024-01-01.
    fn history() -> WarningCollection {
        let january_first = NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .expect("valid date")
            .and_utc()
            .timestamp_millis();
        let version = |sequence: i64, name: &str| AppVersion {
            sequence_number: sequence,
            release_name: name.to_string(),
            timestamp: january_first + sequence * DAY_MILLIS,
            ..AppVersion::default()
        };
        let mut fixed_in_change = record("NP_NULL", "com.example.Foo", 0, 1);
        fixed_in_change.removed_by_change_of_persisting_class = true;
        let mut introduced = record("DM_GC", "com.example.Foo", 1, ACTIVE);
        introduced.introduced_by_change_of_existing_class = true;
        introduced.annotation_text = "owner: storage".to_string();
        let mut new_code = record("SE_BAD_FIELD", "com.example.Bar", 2, ACTIVE);
        new_code.priority = 3;
        let removed_code = record("UR_UNREAD", "com.example.Gone", 0, 0);
        let collection = WarningCollection {
            release_name: "1.2".to_string(),
            sequence_number: 2,
            timestamp: january_first + 2 * DAY_MILLIS,
            app_versions: vec![version(0, "1.0"), version(1, "1.1")],
            ..WarningCollection::default()
        };
        collection.with_records(vec![fixed_in_change, introduced, new_code, removed_code])
    }

    fn selected(criteria: FilterCriteria) -> Vec<String> {
        let collection = history();
        let filter = criteria.resolve(&collection).expect("resolve filter");
        let (filtered, stats) = filter_collection(&filter, &collection);
        assert_eq!(stats.passed + stats.dropped, collection.records.len());
        filtered
            .records
            .into_iter()
            .map(|record| record.pattern_type)
            .collect()
    }

    #[test]
    fn no_criteria_keeps_everything() {
        assert_eq!(selected(FilterCriteria::default()).len(), 4);
    }

    #[test]
    fn version_bounds_accept_release_names_and_sequences() {
        let first_in_release = FilterCriteria {
            first: Some("1.1".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(first_in_release), vec!["DM_GC"]);

        let after_first = FilterCriteria {
            after: Some("0".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(after_first), vec!["SE_BAD_FIELD", "DM_GC"]);

        let last_seen = FilterCriteria {
            last: Some("1.0".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(last_seen), vec!["UR_UNREAD"]);
    }

    #[test]
    fn present_and_absent_follow_the_lifecycle_range() {
        let present = FilterCriteria {
            present: Some("1".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(present), vec!["DM_GC", "NP_NULL"]);

        let absent = FilterCriteria {
            absent: Some("1.2".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(absent), vec!["NP_NULL", "UR_UNREAD"]);
    }

    #[test]
    fn dates_round_to_the_surrounding_versions() {
        let before_second_day = FilterCriteria {
            before: Some("2024-01-02".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(before_second_day), vec!["NP_NULL", "UR_UNREAD"]);

        let after_second_day = FilterCriteria {
            after: Some("2024-01-02".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(
            selected(after_second_day),
            vec!["SE_BAD_FIELD", "DM_GC"]
        );
    }

    #[test]
    fn change_flags_select_lifecycle_causes() {
        let active_new_code = FilterCriteria {
            active: Some(true),
            new_code: Some(true),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(active_new_code), vec!["SE_BAD_FIELD"]);

        let removed_code = FilterCriteria {
            removed_code: Some(true),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(removed_code), vec!["UR_UNREAD"]);

        let removed_by_change = FilterCriteria {
            removed_by_change: Some(true),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(removed_by_change), vec!["NP_NULL"]);

        let not_introduced = FilterCriteria {
            introduced_by_change: Some(false),
            active: Some(true),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(not_introduced), vec!["SE_BAD_FIELD"]);
    }

    #[test]
    fn patterns_priority_and_annotation_narrow_the_selection() {
        let by_class = FilterCriteria {
            class_pattern: Some(Regex::new("Foo$").expect("regex")),
            bug_pattern: Some(Regex::new("^DM_").expect("regex")),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(by_class), vec!["DM_GC"]);

        let high_or_medium = FilterCriteria {
            priority: Some(2),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(high_or_medium).len(), 3);

        let annotated = FilterCriteria {
            annotation: Some("storage".to_string()),
            ..FilterCriteria::default()
        };
        assert_eq!(selected(annotated), vec!["DM_GC"]);
    }

    #[test]
    fn not_inverts_the_selection() {
        let inactive = FilterCriteria {
            active: Some(true),
            not: true,
            ..FilterCriteria::default()
        };
        assert_eq!(selected(inactive), vec!["NP_NULL", "UR_UNREAD"]);
    }

    #[test]
    fn unknown_version_is_an_error() {
        let criteria = FilterCriteria {
            present: Some("next-release".to_string()),
            ..FilterCriteria::default()
        };

        let err = criteria.resolve(&history()).expect_err("unknown version");

        assert!(err.to_string().contains("next-release"));
    }

    #[test]
    fn priority_accepts_letters_and_digits() {
        assert_eq!(parse_priority("h"), Ok(1));
        assert_eq!(parse_priority("E"), Ok(4));
        assert_eq!(parse_priority("3"), Ok(3));
        assert!(parse_priority("urgent").is_err());
    }
}
