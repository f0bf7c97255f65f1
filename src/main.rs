mod collection;
mod diff;
mod filter;
mod history;
mod matcher;
mod reconcile;
mod sarif;
mod telemetry;
mod version;
mod warning;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use opentelemetry::KeyValue;
use tracing::{debug, error, info};

use crate::collection::{
    WarningCollection, is_empty_input, load_collection, output_writer, store_collection,
};
use crate::diff::{BulkOutput, DiffMatcher, SetOperation, apply_set_operation, collection_cache};
use crate::filter::{FilterCriteria, filter_collection};
use crate::history::{HistoryFormat, HistoryMiner, render_history};
use crate::matcher::{DEFAULT_MAX_RESURRECTION, Matcher, MatcherConfig, ResurrectionPolicy};
use crate::reconcile::{Reconciler, RunPreparation};
use crate::sarif::build_sarif;
use crate::telemetry::{Telemetry, current_trace_id, init_logging, with_span};

/// CLI arguments for bugtrail execution.
#[derive(Parser, Debug)]
#[command(
    name = "bugtrail",
    about = "Track static-analysis warnings across successive analysis runs.",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "OTLP HTTP collector URL (recommended: http://localhost:4318/)."
    )]
    otel: Option<String>,
    #[command(subcommand)]
    command: Command,
}

/// Subcommands supported by the CLI.
#[derive(Subcommand, Debug)]
enum Command {
    /// Merge analysis runs, oldest first, into one warning history.
    Update(UpdateArgs),
    /// Print per-version lifecycle statistics of a warning history.
    History(HistoryArgs),
    /// Select added, removed or retained warnings between two runs.
    Diff(DiffArgs),
    /// Export a warning history as SARIF with lifecycle properties.
    Sarif(SarifArgs),
    /// Keep the warnings of a history that match lifecycle and attribute criteria.
    Filter(FilterArgs),
}

/// Arguments for merging runs.
#[derive(Args, Debug, Clone)]
struct UpdateArgs {
    #[arg(
        value_name = "PATH",
        required = true,
        num_args = 1..,
        help = "Collections to merge, oldest first. Use @file to read paths (one per line)."
    )]
    inputs: Vec<String>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    #[arg(long, help = "Disable fuzzy matching.")]
    precise_match: bool,
    #[arg(long, help = "Only match warnings with equal priorities.")]
    precise_priority_match: bool,
    #[arg(
        long,
        help = "Match warnings by pattern family and class only, and keep one warning per family and class."
    )]
    sloppy_match: bool,
    #[arg(long, help = "Do not guess classes that moved to another package.")]
    no_package_moves: bool,
    #[arg(
        long,
        value_name = "PATH",
        help = "JSON object mapping old class names to new class names."
    )]
    class_renames: Option<PathBuf>,
    #[arg(long, help = "Allow fixed warnings to be matched again.")]
    match_fixed: bool,
    #[arg(
        long,
        value_name = "N",
        default_value_t = DEFAULT_MAX_RESURRECTION,
        help = "Versions after which a warning fixed in a persisting class is no longer matched again."
    )]
    max_resurrection: i64,
    #[arg(long, value_name = "N", help = "Drop warnings ranked above N.")]
    max_rank: Option<u32>,
    #[arg(long, value_name = "N", help = "Only merge the last N inputs.")]
    only_most_recent: Option<usize>,
    #[arg(long, help = "Name every version after its input path.")]
    override_revision_names: bool,
    #[arg(long, help = "Use analysis timestamps instead of code timestamps.")]
    use_analysis_times: bool,
}

/// Arguments for mining a history.
#[derive(Args, Debug, Clone)]
struct HistoryArgs {
    #[arg(value_name = "PATH")]
    input: PathBuf,
    #[arg(long, value_enum, default_value_t)]
    format: HistoryFormat,
    #[arg(long, help = "Render timestamps as yyyy.MM.dd instead of epoch seconds.")]
    format_dates: bool,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

/// Arguments for set operations between runs.
#[derive(Args, Debug, Clone)]
#[command(group(
    ArgGroup::new("operation")
        .required(true)
        .args(["added", "removed", "retained"])
))]
struct DiffArgs {
    #[arg(long)]
    added: bool,
    #[arg(long)]
    removed: bool,
    #[arg(long)]
    retained: bool,
    #[arg(long, value_enum, default_value_t)]
    matcher: DiffMatcher,
    #[arg(
        long,
        help = "Only print the number of selected warnings; with --bulk, one tab-separated line per pair."
    )]
    count: bool,
    #[arg(long, value_name = "PATH", conflicts_with = "bulk")]
    output: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "File of old,new collection pairs (one pair per line)."
    )]
    bulk: Option<PathBuf>,
    #[arg(long, value_name = "DIR", requires = "bulk", default_value = ".")]
    output_dir: PathBuf,
    #[arg(value_name = "OLD", required_unless_present = "bulk")]
    old: Option<PathBuf>,
    #[arg(value_name = "NEW", required_unless_present = "bulk")]
    new: Option<PathBuf>,
}

impl DiffArgs {
    fn operation(&self) -> SetOperation {
        if self.added {
            SetOperation::Added
        } else if self.removed {
            SetOperation::Removed
        } else {
            SetOperation::Retained
        }
    }
}

/// Arguments for filtering a history.
#[derive(Args, Debug, Clone)]
struct FilterArgs {
    #[arg(value_name = "PATH")]
    input: PathBuf,
    #[command(flatten)]
    criteria: FilterCriteria,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

/// Arguments for SARIF export.
#[derive(Args, Debug, Clone)]
struct SarifArgs {
    #[arg(value_name = "PATH")]
    input: PathBuf,
    #[arg(long, help = "Also report fixed warnings, marked as absent.")]
    include_fixed: bool,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            std::process::ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let telemetry = match &cli.otel {
        Some(url) => Some(Telemetry::new(url.clone())?),
        None => None,
    };
    init_logging();
    let telemetry_ref = telemetry.as_ref();
    let result = match cli.command {
        Command::Update(args) => run_update(args, telemetry_ref),
        Command::History(args) => run_history(args, telemetry_ref),
        Command::Diff(args) => run_diff(args, telemetry_ref),
        Command::Sarif(args) => run_sarif(args, telemetry_ref),
        Command::Filter(args) => run_filter(args, telemetry_ref),
    };
    if let Some(telemetry) = telemetry {
        if let Err(err) = telemetry.shutdown() {
            error!("telemetry shutdown failed: {err}");
        }
    }
    result
}

/// Runs `f` inside the root span of a command.
fn in_root_span<T>(
    telemetry: Option<&Telemetry>,
    command: &str,
    inputs: &[PathBuf],
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let name = build_root_span_name(inputs);
    let attributes = build_root_span_attributes(command, inputs);
    with_span(telemetry, &name, &attributes, || {
        if let Some(trace_id) = current_trace_id() {
            eprintln!("trace-id={trace_id}");
        }
        f()
    })
}

fn run_update(args: UpdateArgs, telemetry: Option<&Telemetry>) -> Result<()> {
    let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let inputs =
        expand_path_args(&args.inputs, &base_dir).context("failed to expand input arguments")?;
    let inputs: Vec<PathBuf> = most_recent(inputs, args.only_most_recent)
        .into_iter()
        .map(|path| {
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        })
        .collect();
    if inputs.is_empty() {
        anyhow::bail!("no input paths provided");
    }
    let config = matcher_config(&args)?;
    let preparation = RunPreparation {
        max_rank: args.max_rank,
        sloppy_unique: args.sloppy_match,
    };
    let reconciler = Reconciler::new(config);
    let names = release_names(&inputs);

    in_root_span(telemetry, "update", &inputs, || {
        let mut merged: Option<WarningCollection> = None;
        for (path, name) in inputs.iter().zip(names) {
            if is_empty_input(path) {
                info!("skipping empty input {}", path.display());
                continue;
            }
            let mut run = with_span(
                telemetry,
                "load",
                &[KeyValue::new("bugtrail.phase", "load")],
                || load_collection(path),
            )?;
            if args.override_revision_names || run.release_name.is_empty() {
                run.release_name = name;
            }
            if args.use_analysis_times {
                run.timestamp = run.analysis_timestamp;
            }
            preparation.apply(&mut run);
            let next = match merged.take() {
                None => {
                    run.validate()
                        .with_context(|| format!("invalid collection {}", path.display()))?;
                    run.sort_records();
                    run
                }
                Some(previous) => {
                    let outcome = with_span(
                        telemetry,
                        "merge",
                        &[
                            KeyValue::new("bugtrail.phase", "merge"),
                            KeyValue::new("bugtrail.release", run.release_name.clone()),
                        ],
                        || reconciler.merge(&previous, &run),
                    )
                    .with_context(|| format!("failed to merge {}", path.display()))?;
                    debug!(input = %path.display(), stats = ?outcome.stats, "merge statistics");
                    outcome.collection
                }
            };
            merged = Some(next);
        }
        let Some(merged) = merged else {
            anyhow::bail!("all input collections are empty");
        };
        with_span(
            telemetry,
            "write",
            &[KeyValue::new("bugtrail.phase", "write")],
            || store_collection(args.output.as_deref(), &merged),
        )
    })
}

fn run_history(args: HistoryArgs, telemetry: Option<&Telemetry>) -> Result<()> {
    let inputs = vec![args.input.clone()];
    in_root_span(telemetry, "history", &inputs, || {
        let collection = load_collection(&args.input)?;
        let rows = with_span(
            telemetry,
            "history",
            &[KeyValue::new("bugtrail.phase", "history")],
            || HistoryMiner::new(&collection).rows(),
        );
        let mut writer = output_writer(args.output.as_deref())?;
        render_history(&rows, args.format, args.format_dates, &mut *writer)?;
        writer.flush().context("failed to flush history output")?;
        Ok(())
    })
}

fn run_diff(args: DiffArgs, telemetry: Option<&Telemetry>) -> Result<()> {
    let operation = args.operation();
    let matcher: Matcher = args.matcher.into();
    if let Some(pairs_path) = &args.bulk {
        let pairs = diff::read_pairs(pairs_path)?;
        let inputs = vec![pairs_path.clone()];
        return in_root_span(telemetry, "diff", &inputs, || {
            let cache = collection_cache();
            let output = if args.count {
                BulkOutput::Counts
            } else {
                BulkOutput::Files(&args.output_dir)
            };
            let summary = with_span(
                telemetry,
                "diff",
                &[KeyValue::new("bugtrail.phase", "diff")],
                || diff::run_bulk(&pairs, operation, matcher, output, &cache),
            )?;
            if args.count {
                let mut writer = output_writer(None)?;
                for (new_path, count) in &summary.counts {
                    writeln!(writer, "{}\t{count}", new_path.display())
                        .context("failed to write count")?;
                }
                writer.flush().context("failed to flush counts")?;
            }
            Ok(())
        });
    }

    let (Some(old_path), Some(new_path)) = (&args.old, &args.new) else {
        anyhow::bail!("diff needs OLD and NEW collections, or --bulk");
    };
    let inputs = vec![old_path.clone(), new_path.clone()];
    in_root_span(telemetry, "diff", &inputs, || {
        let old = load_collection(old_path)?;
        let new = load_collection(new_path)?;
        let result = with_span(
            telemetry,
            "diff",
            &[
                KeyValue::new("bugtrail.phase", "diff"),
                KeyValue::new("bugtrail.operation", operation.label()),
            ],
            || apply_set_operation(operation, matcher, &old, &new),
        );
        if args.count {
            let mut writer = output_writer(args.output.as_deref())?;
            writeln!(writer, "{}", result.records.len()).context("failed to write count")?;
            writer.flush().context("failed to flush count")?;
            return Ok(());
        }
        store_collection(args.output.as_deref(), &result)
    })
}

fn run_sarif(args: SarifArgs, telemetry: Option<&Telemetry>) -> Result<()> {
    let inputs = vec![args.input.clone()];
    in_root_span(telemetry, "sarif", &inputs, || {
        let collection = load_collection(&args.input)?;
        let sarif = build_sarif(telemetry, &collection, args.include_fixed);
        with_span(
            telemetry,
            "sarif.write",
            &[KeyValue::new("bugtrail.phase", "write")],
            || -> Result<()> {
                let mut writer = output_writer(args.output.as_deref())?;
                serde_json::to_writer(&mut writer, &sarif)
                    .context("failed to serialize SARIF output")?;
                writer
                    .write_all(b"\n")
                    .context("failed to write SARIF output")?;
                writer.flush().context("failed to flush SARIF output")?;
                Ok(())
            },
        )
    })
}

fn run_filter(args: FilterArgs, telemetry: Option<&Telemetry>) -> Result<()> {
    let inputs = vec![args.input.clone()];
    in_root_span(telemetry, "filter", &inputs, || {
        let collection = load_collection(&args.input)?;
        let filter = args
            .criteria
            .resolve(&collection)
            .with_context(|| format!("invalid filter for {}", args.input.display()))?;
        let (filtered, stats) = with_span(
            telemetry,
            "filter",
            &[KeyValue::new("bugtrail.phase", "filter")],
            || filter_collection(&filter, &collection),
        );
        info!(
            passed = stats.passed,
            dropped = stats.dropped,
            "filtered warning history"
        );
        store_collection(args.output.as_deref(), &filtered)
    })
}

fn matcher_config(args: &UpdateArgs) -> Result<MatcherConfig> {
    let class_renames = match &args.class_renames {
        Some(path) => load_class_renames(path)?,
        None => BTreeMap::new(),
    };
    let resurrection = if args.match_fixed {
        ResurrectionPolicy::Within {
            max_gap: args.max_resurrection,
        }
    } else {
        ResurrectionPolicy::Never
    };
    Ok(MatcherConfig {
        precise_match: args.precise_match,
        precise_priority: args.precise_priority_match,
        sloppy_match: args.sloppy_match,
        package_moves: !args.no_package_moves,
        class_renames,
        resurrection,
    })
}

fn load_class_renames(path: &Path) -> Result<BTreeMap<String, String>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let deserializer = &mut serde_json::Deserializer::from_str(&content);
    serde_path_to_error::deserialize(deserializer)
        .with_context(|| format!("failed to parse class renames {}", path.display()))
}

fn most_recent(mut inputs: Vec<PathBuf>, limit: Option<usize>) -> Vec<PathBuf> {
    if let Some(limit) = limit {
        let skip = inputs.len().saturating_sub(limit);
        inputs.drain(..skip);
    }
    inputs
}

/// Names each input after the first path component that differs between
/// the inputs; falls back to the file name when all paths share a prefix.
fn release_names(inputs: &[PathBuf]) -> Vec<String> {
    let parts: Vec<Vec<String>> = inputs
        .iter()
        .map(|path| {
            path.iter()
                .map(|part| part.to_string_lossy().into_owned())
                .collect()
        })
        .collect();
    let Some(first) = parts.first() else {
        return Vec::new();
    };
    let mut common = first.len();
    for other in &parts[1..] {
        let shared = first
            .iter()
            .zip(other)
            .take_while(|(left, right)| left == right)
            .count();
        common = common.min(shared);
    }
    if common >= first.len() {
        common = first.len().saturating_sub(1);
    }
    parts
        .iter()
        .map(|path_parts| {
            path_parts
                .get(common)
                .or(path_parts.last())
                .cloned()
                .unwrap_or_default()
        })
        .collect()
}

fn expand_path_args(args: &[String], base_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut expanded = Vec::new();
    let mut stack = Vec::new();
    for arg in args {
        expanded.extend(expand_path_arg(arg, base_dir, &mut stack)?);
    }
    Ok(expanded)
}

fn expand_path_arg(arg: &str, base_dir: &Path, stack: &mut Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let Some(path_str) = arg.strip_prefix('@') else {
        return Ok(vec![PathBuf::from(arg)]);
    };
    if path_str.is_empty() {
        anyhow::bail!("empty @file reference");
    }
    let file_path = PathBuf::from(path_str);
    let resolved = if file_path.is_absolute() {
        file_path
    } else {
        base_dir.join(file_path)
    };
    let canonical = resolved
        .canonicalize()
        .with_context(|| format!("failed to resolve {}", resolved.display()))?;
    if stack.contains(&canonical) {
        anyhow::bail!("circular @file reference: {}", canonical.display());
    }
    let content = fs::read_to_string(&canonical)
        .with_context(|| format!("failed to read {}", canonical.display()))?;
    stack.push(canonical.clone());
    let file_dir = canonical.parent().unwrap_or_else(|| Path::new(""));
    let mut paths = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('@') {
            paths.extend(expand_path_arg(line, file_dir, stack)?);
            continue;
        }
        let entry = PathBuf::from(line);
        let resolved_entry = if entry.is_absolute() {
            entry
        } else {
            file_dir.join(entry)
        };
        paths.push(resolved_entry);
    }
    stack.pop();
    Ok(paths)
}

fn build_root_span_attributes(command: &str, inputs: &[PathBuf]) -> Vec<KeyValue> {
    vec![
        KeyValue::new("bugtrail.command", command.to_string()),
        KeyValue::new("bugtrail.input.count", inputs.len() as i64),
        KeyValue::new("bugtrail.input.primary_name", primary_input_name(inputs)),
    ]
}

fn build_root_span_name(inputs: &[PathBuf]) -> String {
    let primary_name = primary_input_name(inputs);
    if primary_name.is_empty() {
        return "execution".to_string();
    }
    let input_count = inputs.len();
    if input_count <= 1 {
        return format!("execution {primary_name}");
    }
    format!("execution {primary_name}(+{})", input_count - 1)
}

fn primary_input_name(inputs: &[PathBuf]) -> String {
    inputs.first().map_or_else(String::new, |path| {
        path.file_name().map_or_else(
            || path.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
    })
}
