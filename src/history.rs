//! Per-version lifecycle statistics replayed from a reconciled collection.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::{Context, Result};
use chrono::DateTime;
use clap::ValueEnum;
use rayon::prelude::*;
use serde::Serialize;

use crate::collection::WarningCollection;
use crate::version::AppVersion;
use crate::warning::{ACTIVE, WarningRecord};

const WIDTH: usize = 12;
const SUMMARY_VERSIONS: usize = 10;

/// How a warning changed between version `i - 1` and version `i`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Lifecycle {
    Dead,
    /// Appeared in a class that already existed.
    Added,
    /// Appeared together with its class.
    NewCode,
    /// Disappeared while its class persisted.
    Removed,
    /// Disappeared together with its class.
    RemovedCode,
    Retained,
}

/// Classifies `record` at version `sequence`; `None` when the warning was not
/// born yet.
pub(crate) fn classify(record: &WarningRecord, sequence: i64) -> Option<Lifecycle> {
    if record.first_version > sequence {
        return None;
    }
    let alive_until = |version: i64| record.last_version == ACTIVE || record.last_version >= version;
    let active_previous = record.first_version < sequence && alive_until(sequence - 1);
    let active_current = alive_until(sequence);
    let lifecycle = match (active_previous, active_current) {
        (false, false) => Lifecycle::Dead,
        (false, true) if record.introduced_by_change_of_existing_class => Lifecycle::Added,
        (false, true) => Lifecycle::NewCode,
        (true, false) if record.removed_by_change_of_persisting_class => Lifecycle::Removed,
        (true, false) => Lifecycle::RemovedCode,
        (true, true) => Lifecycle::Retained,
    };
    Some(lifecycle)
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub(crate) struct VersionCounts {
    pub(crate) added: usize,
    pub(crate) new_code: usize,
    pub(crate) removed: usize,
    pub(crate) removed_code: usize,
    pub(crate) retained: usize,
    pub(crate) dead: usize,
    pub(crate) active_now: usize,
}

impl VersionCounts {
    fn count(&mut self, lifecycle: Lifecycle) {
        match lifecycle {
            Lifecycle::Dead => self.dead += 1,
            Lifecycle::Added => self.added += 1,
            Lifecycle::NewCode => self.new_code += 1,
            Lifecycle::Removed => self.removed += 1,
            Lifecycle::RemovedCode => self.removed_code += 1,
            Lifecycle::Retained => self.retained += 1,
        }
        if matches!(
            lifecycle,
            Lifecycle::Added | Lifecycle::NewCode | Lifecycle::Retained
        ) {
            self.active_now += 1;
        }
    }

    fn as_columns(&self) -> [usize; 7] {
        [
            self.added,
            self.new_code,
            self.removed,
            self.removed_code,
            self.retained,
            self.dead,
            self.active_now,
        ]
    }
}

/// One version's counts plus whatever metadata the collection recorded for it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct VersionRow {
    pub(crate) sequence_number: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) version: Option<AppVersion>,
    pub(crate) counts: VersionCounts,
}

pub(crate) struct HistoryMiner<'a> {
    collection: &'a WarningCollection,
    versions: BTreeMap<i64, AppVersion>,
}

impl<'a> HistoryMiner<'a> {
    pub(crate) fn new(collection: &'a WarningCollection) -> Self {
        let mut versions: BTreeMap<i64, AppVersion> = collection
            .app_versions
            .iter()
            .map(|version| (version.sequence_number, version.clone()))
            .collect();
        versions.insert(
            collection.sequence_number,
            collection.current_app_version(),
        );
        Self {
            collection,
            versions,
        }
    }

    /// Rows for every version from 0 up to the collection's own sequence.
    pub(crate) fn rows(&self) -> Vec<VersionRow> {
        (0..=self.collection.sequence_number.max(0))
            .into_par_iter()
            .map(|sequence| self.row(sequence))
            .collect()
    }

    fn row(&self, sequence: i64) -> VersionRow {
        let mut counts = VersionCounts::default();
        for lifecycle in self
            .collection
            .records
            .iter()
            .filter_map(|record| classify(record, sequence))
        {
            counts.count(lifecycle);
        }
        VersionRow {
            sequence_number: sequence,
            version: self.versions.get(&sequence).cloned(),
            counts,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub(crate) enum HistoryFormat {
    /// Tab-separated columns with a header line.
    #[default]
    Tabs,
    /// Space-padded columns for fixed-width fonts.
    Aligned,
    /// One line with `+added-removed` for the last ten versions.
    Summary,
    Json,
}

pub(crate) fn render_history(
    rows: &[VersionRow],
    format: HistoryFormat,
    format_dates: bool,
    out: &mut dyn Write,
) -> Result<()> {
    match format {
        HistoryFormat::Tabs => render_tabs(rows, format_dates, out),
        HistoryFormat::Aligned => render_aligned(rows, format_dates, out),
        HistoryFormat::Summary => {
            writeln!(out, "{}", summary_line(rows)).context("failed to write history summary")
        }
        HistoryFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, rows)
                .context("failed to serialize history")?;
            writeln!(out).context("failed to write history")
        }
    }
}

fn render_tabs(rows: &[VersionRow], format_dates: bool, out: &mut dyn Write) -> Result<()> {
    writeln!(
        out,
        "seq\tversion\ttime\tclasses\tNCSS\tadded\tnewCode\tfixed\tremoved\tretained\tdead\tactive"
    )
    .context("failed to write history header")?;
    for row in rows {
        let mut line = format!(
            "{}\t{}\t{}\t{}\t{}",
            row.sequence_number,
            release_name(row),
            time_column(row, format_dates, true),
            row.version.as_ref().map_or(0, |version| version.class_count),
            row.version.as_ref().map_or(0, |version| version.code_size),
        );
        for count in row.counts.as_columns() {
            line.push('\t');
            line.push_str(&count.to_string());
        }
        writeln!(out, "{line}").context("failed to write history row")?;
    }
    Ok(())
}

fn render_aligned(rows: &[VersionRow], format_dates: bool, out: &mut dyn Write) -> Result<()> {
    let time_width = if format_dates { WIDTH } else { 10 };
    let mut header = format!("{:>3} {:<19} {:<time_width$}{:>8}", "seq", "version", "time", "classes");
    for label in ["NCSS", "added", "newCode", "fixed", "removed", "retained", "dead", "active"] {
        header.push_str(&format!("{label:>width$}", width = WIDTH + 1));
    }
    writeln!(out, "{header}").context("failed to write history header")?;

    for row in rows {
        let mut line = format!(
            "{:>3} {:<19} {:<time_width$} {:>7} {:>WIDTH$}",
            row.sequence_number,
            release_name(row),
            time_column(row, format_dates, false),
            row.version.as_ref().map_or(0, |version| version.class_count),
            row.version.as_ref().map_or(0, |version| version.code_size),
        );
        for count in row.counts.as_columns() {
            line.push_str(&format!(" {count:>WIDTH$}"));
        }
        writeln!(out, "{line}").context("failed to write history row")?;
    }
    Ok(())
}

fn summary_line(rows: &[VersionRow]) -> String {
    let mut line = String::new();
    for row in &rows[rows.len().saturating_sub(SUMMARY_VERSIONS)..] {
        let counts = &row.counts;
        let added = counts.added + counts.new_code;
        let removed = counts.removed + counts.removed_code;
        line.push(' ');
        if added > 0 {
            line.push_str(&format!("+{added}"));
        }
        if removed > 0 {
            line.push_str(&format!("-{removed}"));
        }
        if added == 0 && removed == 0 {
            line.push('0');
        }
        let padding = WIDTH - line.len() % WIDTH;
        line.push_str(&" ".repeat(padding));
    }
    line.trim_end().to_string()
}

fn release_name(row: &VersionRow) -> &str {
    row.version
        .as_ref()
        .map_or("", |version| version.release_name.as_str())
}

fn time_column(row: &VersionRow, format_dates: bool, quote_dates: bool) -> String {
    let Some(version) = &row.version else {
        return if format_dates {
            String::new()
        } else {
            "0".to_string()
        };
    };
    if !format_dates {
        return (version.timestamp / 1000).to_string();
    }
    let date = DateTime::from_timestamp_millis(version.timestamp)
        .map(|time| time.format("%Y.%m.%d").to_string())
        .unwrap_or_default();
    if quote_dates {
        format!("\"{date}\"")
    } else {
        date
    }
}
