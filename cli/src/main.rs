//! shelf - Command-line interface for the storage engine.
//!
//! A thin driver for manual use of the engine: fingerprint files, print a
//! drive's tree, preview collisions and run copy/move batches. Results are
//! printed to stdout as JSON; logs and progress go to stderr.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use shelf_engine::{
    BatchEntry, EngineConfig, FailureRule, Fingerprinter, IdentityBackend, Mode, NodeState, Policy,
    ProgressCallback, SinkState, Task, TaskNode, TaskPolicies, TaskSummary, Vfs,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// shelf - managed storage core
#[derive(Parser, Debug)]
#[command(name = "shelf")]
#[command(version)]
#[command(about = "Inspect drives and run copy/move batches")]
struct Args {
    /// Engine configuration (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Identity backend: xattr or sidecar
    #[arg(long, global = true, value_name = "BACKEND")]
    identity: Option<String>,

    /// Print every entry as it is processed
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the content fingerprint of a file
    Fingerprint { path: PathBuf },
    /// Print the tree of a drive
    Tree(DriveArgs),
    /// Fingerprint and register every file of a drive lacking a hash
    Index(DriveArgs),
    /// Show the collisions a copy or move would meet
    Preview(TransferArgs),
    /// Copy entries between directories of a drive
    Copy(TransferArgs),
    /// Move entries between directories of a drive
    Move(TransferArgs),
}

#[derive(clap::Args, Debug)]
struct DriveArgs {
    /// Directory holding `drives/<uuid>`
    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    #[arg(long, value_name = "UUID")]
    drive: String,
}

#[derive(clap::Args, Debug)]
struct TransferArgs {
    #[command(flatten)]
    drive: DriveArgs,

    /// Source directory, relative to the drive
    #[arg(long, value_name = "REL", default_value = "")]
    src: PathBuf,

    /// Destination directory, relative to the drive
    #[arg(long, value_name = "REL", default_value = "")]
    dst: PathBuf,

    /// Names in the source directory
    #[arg(required = true)]
    names: Vec<String>,

    /// Policy for every collision: keep, skip, replace or rename
    #[arg(long, value_name = "POLICY")]
    policy: Option<String>,
}

/// How a successful command ended.
#[derive(Debug, PartialEq, Eq)]
enum Status {
    Complete,
    /// Some entries failed or still wait on a conflict
    Incomplete,
}

/// Reports task progress on stderr
struct CliProgress {
    verbose: bool,
    start_time: Instant,
}

impl CliProgress {
    fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
        }
    }

    /// One-line status of a settled node; `None` while it is still queued.
    fn node_status(node: &TaskNode) -> Option<String> {
        let status = match &node.state {
            NodeState::Done { outcome } => format!("{:?}", outcome).to_lowercase(),
            NodeState::Conflict(conflict) => format!(
                "conflict, choose one of: {}",
                conflict
                    .policies
                    .iter()
                    .map(Policy::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            NodeState::Failed { code, message } => format!("failed ({}): {}", code, message),
            NodeState::Pending | NodeState::Working => return None,
        };
        Some(status)
    }

    fn summary_line(&self, summary: &TaskSummary) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = summary.bytes as f64;
        let mut unit_idx = 0;
        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!(
            "Summary: {} done, {} conflicts, {} failed, {:.2} {} copied in {:.1}s",
            summary.done,
            summary.conflicts,
            summary.failed,
            size,
            UNITS[unit_idx],
            self.start_time.elapsed().as_secs_f64()
        )
    }
}

impl ProgressCallback for CliProgress {
    fn on_task_started(&self, task: &Task) {
        eprintln!("{} {} -> {}", task.mode(), task.src_dir().display(), task.dst_dir().display());
    }

    fn on_node_started(&self, _task: &Task, _node: &TaskNode, src: &Path, dst: &Path) {
        if self.verbose {
            eprintln!("  {} -> {}", src.display(), dst.display());
        }
    }

    fn on_node_completed(&self, _task: &Task, node: &TaskNode) {
        if !self.verbose {
            return;
        }
        if let Some(status) = Self::node_status(node) {
            eprintln!("  [{}] {}", node.target_name, status);
        }
    }

    fn on_task_completed(&self, task: &Task) {
        eprintln!("{}", self.summary_line(&task.summary()));
    }
}

/// Parse arguments, install logging, then run the command
fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let exit_code = match run_cli(&args) {
        Ok(Status::Complete) => 0,
        Ok(Status::Incomplete) => 1,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            2
        }
    };

    std::process::exit(exit_code);
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> Result<Status, String> {
    match &args.command {
        Command::Fingerprint { path } => {
            let config = load_config(args, None)?;
            let fingerprinter = Fingerprinter::new(&config).map_err(|e| e.to_string())?;
            let fingerprint = fingerprinter.fingerprint(path).map_err(|e| e.to_string())?;
            println!("{}  {}", fingerprint, path.display());
            Ok(Status::Complete)
        }
        Command::Tree(drive) => {
            let (vfs, drive) = mount(args, drive)?;
            let tree = vfs.get_tree(drive).map_err(|e| e.to_string())?;
            print_json(&tree)?;
            vfs.shutdown().map_err(|e| e.to_string())?;
            Ok(Status::Complete)
        }
        Command::Index(drive) => {
            let (mut vfs, _) = mount(args, drive)?;
            let report = vfs.index_pending().map_err(|e| e.to_string())?;
            eprintln!(
                "Indexed {} files, {} new contents, {} skipped",
                report.hashed, report.registered, report.skipped
            );
            vfs.shutdown().map_err(|e| e.to_string())?;
            Ok(if report.skipped > 0 { Status::Incomplete } else { Status::Complete })
        }
        Command::Preview(transfer) => {
            let (vfs, drive) = mount(args, &transfer.drive)?;
            let (entries, dst) = batch_entries(&vfs, drive, transfer)?;
            let preview = vfs
                .preview_conflicts(&entries, drive, dst)
                .map_err(|e| e.to_string())?;
            print_json(&preview)?;
            let conflicts = preview.iter().any(|node| node.is_conflict());
            vfs.shutdown().map_err(|e| e.to_string())?;
            Ok(if conflicts { Status::Incomplete } else { Status::Complete })
        }
        Command::Copy(transfer) => transfer_entries(args, Mode::Copy, transfer),
        Command::Move(transfer) => transfer_entries(args, Mode::Move, transfer),
    }
}

fn load_config(args: &Args, root: Option<&Path>) -> Result<EngineConfig, String> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path).map_err(|e| e.to_string())?,
        None => EngineConfig::default(),
    };
    if let Some(root) = root {
        config.root = root.to_path_buf();
    }
    match args.identity.as_deref().map(str::to_lowercase).as_deref() {
        None => {}
        Some("xattr") => config.identity = IdentityBackend::Xattr,
        Some("sidecar") => config.identity = IdentityBackend::Sidecar,
        Some(other) => {
            return Err(format!(
                "Invalid identity backend '{}'. Must be 'xattr' or 'sidecar'",
                other
            ))
        }
    }
    if config.identity == IdentityBackend::Sidecar && config.sidecar_path.is_none() {
        config.sidecar_path = Some(config.root.join("identities.json"));
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

/// Open the engine and mount one drive.
fn mount(args: &Args, drive: &DriveArgs) -> Result<(Vfs, Uuid), String> {
    let uuid = Uuid::parse_str(&drive.drive).map_err(|e| format!("Invalid drive '{}': {}", drive.drive, e))?;
    let config = load_config(args, drive.root.as_deref())?;
    debug!("mounting {} from {}", uuid, config.root.display());
    let mut vfs = Vfs::open(config).map_err(|e| format!("Cannot open engine: {}", e))?;
    vfs.create_root(uuid).map_err(|e| format!("Cannot mount drive {}: {}", uuid, e))?;
    Ok((vfs, uuid))
}

/// Uuid of the directory at `rel` on `drive`.
fn dir_uuid(vfs: &Vfs, drive: Uuid, rel: &Path) -> Result<Uuid, String> {
    let forest = vfs.forest();
    forest
        .lookup(drive, rel)
        .and_then(|id| forest.get(id))
        .filter(|node| node.dir_state().is_some())
        .map(|node| node.uuid())
        .ok_or_else(|| format!("No directory '{}' on drive {}", rel.display(), drive))
}

fn batch_entries(vfs: &Vfs, drive: Uuid, transfer: &TransferArgs) -> Result<(Vec<BatchEntry>, Uuid), String> {
    let src = dir_uuid(vfs, drive, &transfer.src)?;
    let dst = dir_uuid(vfs, drive, &transfer.dst)?;
    let entries = transfer
        .names
        .iter()
        .map(|name| BatchEntry {
            drive,
            dir: src,
            name: name.clone(),
        })
        .collect();
    Ok((entries, dst))
}

fn parse_policies(policy: Option<&str>) -> Result<TaskPolicies, String> {
    match policy {
        None => Ok(TaskPolicies::default()),
        Some(name) => Policy::from_str(&name.to_lowercase())
            .map(TaskPolicies::uniform)
            .ok_or_else(|| {
                format!(
                    "Invalid policy '{}'. Must be 'keep', 'skip', 'replace' or 'rename'",
                    name
                )
            }),
    }
}

fn transfer_entries(args: &Args, mode: Mode, transfer: &TransferArgs) -> Result<Status, String> {
    let policies = parse_policies(transfer.policy.as_deref())?;
    let (mut vfs, drive) = mount(args, &transfer.drive)?;
    let (entries, dst) = batch_entries(&vfs, drive, transfer)?;

    let batch = vfs
        .create_batch_copy(mode, &entries, drive, dst, policies, FailureRule::Stop)
        .map_err(|e| format!("Batch creation failed: {}", e))?;
    let progress = CliProgress::new(args.verbose);
    let state = vfs
        .run_batch(batch, Some(&progress))
        .map_err(|e| format!("Batch execution failed: {}", e))?;
    let summary = vfs.batch_summary(batch).map_err(|e| e.to_string())?;
    print_json(&summary)?;
    vfs.shutdown().map_err(|e| e.to_string())?;

    match state {
        SinkState::Finished if summary.tasks.iter().all(|t| t.failed == 0) => Ok(Status::Complete),
        SinkState::Finished | SinkState::Blocked => Ok(Status::Incomplete),
        SinkState::Stopped { code, message } => Err(format!("{}: {}", code, message)),
        other => Err(format!("Batch ended {:?}", other)),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}
