use std::io::{self, BufRead, Write as _};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use samefold_core::{
    Engine, EqualityMode, GroupLabel, ScanReport, ScanRequest, ScanStatus, StructurePolicy,
    format_count, format_size,
};
use tracing_subscriber::EnvFilter;

/// samefold - find duplicate and near-duplicate folders under a root
#[derive(Parser, Debug)]
#[command(name = "samefold")]
#[command(about = "Find duplicate and near-duplicate folders under a single root")]
#[command(version)]
struct Args {
    /// State directory for the fingerprint cache and scan indexes
    /// (defaults to the platform data directory)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan a root and print its duplicate folder groups
    Scan {
        /// Path to scan (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Compare file contents (SHA-256) instead of name and size
        #[arg(long)]
        sha256: bool,

        /// Ignore folder structure; compare as bags of files
        #[arg(long)]
        bag_of_files: bool,

        /// Minimum similarity for near-duplicate folders
        #[arg(long, default_value_t = 0.80)]
        threshold: f64,

        /// Only scan files matching these globs
        #[arg(long)]
        include: Vec<String>,

        /// Skip paths matching these globs (replaces the default excludes)
        #[arg(long)]
        exclude: Vec<String>,

        /// Lowercase names before comparing
        #[arg(long)]
        case_insensitive: bool,

        /// Worker pool size cap
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Allow deletion planning against this scan
        #[arg(long)]
        deletion_enabled: bool,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,

        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Print the stored report of a completed scan
    Report {
        scan_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Show stored differences between two folders of a scan
    Diff {
        scan_id: String,
        left: String,
        right: String,

        /// Check both folders belong to this group first
        #[arg(long)]
        group: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Stage a deletion plan and, on confirmation, quarantine the folders
    Plan {
        scan_id: String,

        /// Folders (relative to the scan root) to quarantine
        #[arg(required = true)]
        paths: Vec<String>,

        /// Confirm without prompting
        #[arg(short, long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let state_dir = args
        .state_dir
        .clone()
        .or_else(|| dirs::data_local_dir().map(|d| d.join("samefold")))
        .unwrap_or_else(|| PathBuf::from(".samefold"));
    let engine = Engine::new(&state_dir)?;

    match args.command {
        Command::Scan {
            path,
            sha256,
            bag_of_files,
            threshold,
            include,
            exclude,
            case_insensitive,
            concurrency,
            deletion_enabled,
            json,
            quiet,
        } => {
            // Resolve path
            let path = path.canonicalize().unwrap_or(path);
            if !path.exists() {
                eprintln!("Error: Path does not exist: {}", path.display());
                std::process::exit(1);
            }
            if !path.is_dir() {
                eprintln!("Error: Path is not a directory: {}", path.display());
                std::process::exit(1);
            }

            let mut request = ScanRequest::new(path);
            if sha256 {
                request.file_equality = EqualityMode::Sha256;
            }
            if bag_of_files {
                request.structure_policy = StructurePolicy::BagOfFiles;
            }
            request.similarity_threshold = threshold;
            request.include = include;
            if !exclude.is_empty() {
                request.exclude = exclude;
            }
            request.force_case_insensitive = case_insensitive;
            request.concurrency = concurrency;
            request.deletion_enabled = deletion_enabled;

            run_scan(&engine, request, json, quiet)
        }
        Command::Report { scan_id, json } => {
            let report = engine.report(&scan_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&*report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }
        Command::Diff {
            scan_id,
            left,
            right,
            group,
            json,
        } => {
            let diff = engine.diff(&scan_id, group.as_deref(), &left, &right)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&diff)?);
                return Ok(());
            }
            println!("--- {}", diff.left);
            println!("+++ {}", diff.right);
            for entry in &diff.only_left {
                println!(
                    "-  {}  {}",
                    entry.identity,
                    format_size(entry.left_weight.unwrap_or(0))
                );
            }
            for entry in &diff.only_right {
                println!(
                    "+  {}  {}",
                    entry.identity,
                    format_size(entry.right_weight.unwrap_or(0))
                );
            }
            for entry in &diff.mismatched {
                println!(
                    "~  {}  {} != {}",
                    entry.identity,
                    format_size(entry.left_weight.unwrap_or(0)),
                    format_size(entry.right_weight.unwrap_or(0))
                );
            }
            Ok(())
        }
        Command::Plan {
            scan_id,
            paths,
            yes,
        } => run_plan(&engine, &scan_id, paths, yes),
    }
}

fn run_scan(engine: &Engine, request: ScanRequest, json: bool, quiet: bool) -> Result<()> {
    let scan_id = engine.submit(request)?;
    let events = engine.subscribe(&scan_id)?;

    let mut last_status = ScanStatus::Pending;
    for event in events.iter() {
        last_status = event.status;
        if !quiet && !event.status.is_terminal() {
            let progress = event
                .progress
                .map(|p| format!("{:3.0}% ", p * 100.0))
                .unwrap_or_default();
            eprint!(
                "\r{progress}{:?}: {} folders, {} files, {}        ",
                event.phase,
                format_count(event.stats.folders_scanned),
                format_count(event.stats.files_scanned),
                format_size(event.stats.bytes_scanned),
            );
            let _ = io::stderr().flush();
        }
        if event.status.is_terminal() {
            break;
        }
    }
    if !quiet {
        eprintln!();
    }

    match last_status {
        ScanStatus::Completed => {}
        ScanStatus::Cancelled => return Err(eyre!("scan was cancelled")),
        _ => {
            let state = engine.state(&scan_id)?;
            return Err(eyre!(
                "scan failed: {}",
                state.error.unwrap_or_else(|| "unknown error".to_string())
            ));
        }
    }

    let report = engine.report(&scan_id)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&*report)?);
    } else {
        print_report(&report);
        eprintln!("scan id: {scan_id}");
    }
    Ok(())
}

fn print_report(report: &ScanReport) {
    let reclaimable: u64 = report.groups.iter().map(|g| g.reclaimable_bytes).sum();
    println!(
        "{} files ({}) in {} folders under {}",
        format_count(report.stats.files_scanned),
        format_size(report.stats.bytes_scanned),
        format_count(report.stats.folders_scanned),
        report.root_path.display()
    );
    println!(
        "{} groups, {} reclaimable",
        report.groups.len(),
        format_size(reclaimable)
    );

    for group in &report.groups {
        let label = match group.label {
            GroupLabel::Identical => "identical",
            GroupLabel::NearDuplicate => "near-duplicate",
            GroupLabel::PartialOverlap => "partial-overlap",
        };
        println!(
            "\n{}  {}  {} members, {} reclaimable",
            group.group_id,
            label,
            group.members.len(),
            format_size(group.reclaimable_bytes)
        );
        for (i, member) in group.members.iter().enumerate() {
            let marker = if i == group.canonical_index { "*" } else { " " };
            println!(
                "  {marker} {}  {} ({} files)",
                member.relative_path,
                format_size(member.total_bytes),
                format_count(member.file_count)
            );
        }
    }

    if !report.warnings.is_empty() {
        eprintln!(
            "\n{} warnings (first {}):",
            report.warnings.len() as u64 + report.warnings_overflow,
            report.warnings.len().min(10)
        );
        for warning in report.warnings.iter().take(10) {
            eprintln!("  {:?} {}: {}", warning.kind, warning.path, warning.message);
        }
    }
}

fn run_plan(engine: &Engine, scan_id: &str, paths: Vec<String>, yes: bool) -> Result<()> {
    let plan = engine.plan_deletion(scan_id, &paths)?;
    println!(
        "plan {}: {} folders, {} reclaimable",
        plan.plan_id,
        plan.queue.len(),
        format_size(plan.reclaimable_bytes)
    );
    for rel in &plan.queue {
        println!("  {rel}");
    }
    println!(
        "quarantine: {} (token expires {})",
        plan.quarantine_root.display(),
        plan.expires_at.format("%H:%M:%S")
    );

    if !yes {
        print!("Move these folders to quarantine? [y/N] ");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("aborted; plan {} expires unused", plan.plan_id);
            return Ok(());
        }
    }

    let outcome = engine.confirm_deletion(&plan.plan_id, &plan.token)?;
    println!(
        "moved {} folders ({} reclaimed)",
        outcome.moved.len(),
        format_size(outcome.reclaimed_bytes)
    );
    for entry in &outcome.moved {
        println!("  {} -> {}", entry.relative_path, entry.quarantine_path.display());
    }
    if !outcome.failed.is_empty() {
        eprintln!("{} moves failed:", outcome.failed.len());
        for failure in &outcome.failed {
            eprintln!("  {}: {}", failure.relative_path, failure.message);
        }
        std::process::exit(1);
    }
    Ok(())
}
