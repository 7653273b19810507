//! converge - bring a node to its desired state.
//!
//! Usage:
//!   converge run <manifest>       Converge the node described by a manifest
//!   converge plan <manifest>      Show what a run would change, without changing it
//!   converge validate <manifest>  Check a manifest and its task graph
//!   converge list <manifest>      List tasks grouped by dependency level

use clap::{Args, Parser, Subcommand};
use converge::{
    ConvergenceContext, DependencyGraph, DirectTarget, DryRunTarget, EventBus, LoggingHandler,
    ManifestLoader, NodeConfig, ScriptFormat, ScriptTarget, Target, TargetKind, TaskMap,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// converge - a dependency-aware convergence engine for node provisioning
#[derive(Parser)]
#[command(name = "converge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Converge the node described by a manifest
    Run {
        #[command(flatten)]
        manifest: ManifestArgs,

        /// How to apply tasks: direct, dryrun or script (default: from the manifest)
        #[arg(long)]
        target: Option<TargetKind>,

        /// Script format when rendering: cloud_config or shell
        #[arg(long, value_parser = parse_format)]
        format: Option<ScriptFormat>,

        /// Where to write the plan or script (default: stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Consecutive passes allowed to complete nothing
        #[arg(long)]
        max_no_progress: Option<u32>,

        /// Task attempts in flight at once within a pass
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// Show what a run would change, without changing anything
    Plan {
        #[command(flatten)]
        manifest: ManifestArgs,
    },

    /// Check a manifest and its task graph without running
    Validate {
        #[command(flatten)]
        manifest: ManifestArgs,
    },

    /// List tasks grouped by dependency level
    List {
        #[command(flatten)]
        manifest: ManifestArgs,
    },
}

#[derive(Args)]
struct ManifestArgs {
    /// Path to the node manifest
    #[arg(value_name = "MANIFEST")]
    path: PathBuf,

    /// Override the manifest's filesystem root
    #[arg(long)]
    fs_root: Option<PathBuf>,

    /// Override the manifest's cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

impl ManifestArgs {
    /// Read the manifest, apply overrides, validate, build its tasks.
    fn load(&self) -> Result<(NodeConfig, TaskMap), Box<dyn std::error::Error>> {
        self.load_with(|_| {})
    }

    /// Like [`load`](Self::load), with extra overrides applied before validation.
    fn load_with(
        &self,
        adjust: impl FnOnce(&mut NodeConfig),
    ) -> Result<(NodeConfig, TaskMap), Box<dyn std::error::Error>> {
        let mut config = ManifestLoader::read(&self.path)?;
        if let Some(root) = &self.fs_root {
            config.fs_root = root.clone();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = Some(dir.clone());
        }
        adjust(&mut config);
        config.validate()?;
        let tasks = ManifestLoader::build_tasks(&config)?;
        Ok((config, tasks))
    }
}

fn parse_format(s: &str) -> Result<ScriptFormat, String> {
    match s {
        "cloud_config" | "cloud-config" | "cloudinit" => Ok(ScriptFormat::CloudConfig),
        "shell" | "sh" => Ok(ScriptFormat::Shell),
        other => Err(format!("unknown script format '{other}'")),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so rendered scripts on stdout stay clean.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            manifest,
            target,
            format,
            output,
            max_no_progress,
            concurrency,
        } => {
            let (config, tasks) = manifest.load_with(|config| {
                if let Some(kind) = target {
                    config.target = kind;
                }
                if let Some(format) = format {
                    config.script_format = format;
                }
                if let Some(max) = max_no_progress {
                    config.max_attempts_with_no_progress = max;
                }
                if concurrency.is_some() {
                    config.max_concurrency = concurrency;
                }
            })?;
            run_manifest(&manifest.path, config, tasks, output.as_deref()).await?;
        }
        Commands::Plan { manifest } => {
            let (config, tasks) =
                manifest.load_with(|config| config.target = TargetKind::DryRun)?;
            run_manifest(&manifest.path, config, tasks, None).await?;
        }
        Commands::Validate { manifest } => {
            validate_manifest(&manifest)?;
        }
        Commands::List { manifest } => {
            list_tasks(&manifest)?;
        }
    }

    Ok(())
}

fn open_output(path: Option<&Path>) -> Result<Box<dyn Write + Send>, std::io::Error> {
    match path {
        Some(path) => Ok(Box::new(std::fs::File::create(path)?)),
        None => Ok(Box::new(std::io::stdout())),
    }
}

fn build_target(
    config: &NodeConfig,
    output: Option<&Path>,
) -> Result<Box<dyn Target>, std::io::Error> {
    let target: Box<dyn Target> = match config.target {
        TargetKind::Direct => Box::new(DirectTarget::new(&config.fs_root)),
        TargetKind::DryRun => Box::new(DryRunTarget::new(&config.fs_root, open_output(output)?)),
        TargetKind::ScriptRender => Box::new(ScriptTarget::new(
            config.script_format,
            open_output(output)?,
        )),
    };
    Ok(target)
}

/// Converge the manifest's tasks, stopping between passes on Ctrl+C.
async fn run_manifest(
    manifest: &Path,
    config: NodeConfig,
    tasks: TaskMap,
    output: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Converging {} ({} task(s), target: {})",
        manifest.display(),
        tasks.len(),
        config.target
    );

    let options = config.run_options()?;
    let target = build_target(&config, output)?;

    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current pass...");
            let _ = shutdown_tx.send(true);
        }
    });

    let ctx = ConvergenceContext::new(target, config.target.checks_existing(), options)
        .with_event_bus(Arc::new(event_bus))
        .with_shutdown(shutdown_rx);

    match ctx.converge(&tasks).await {
        Ok(report) => {
            info!(
                "Converged {} task(s) in {} pass(es), {:?}",
                report.completed_count(),
                report.passes,
                report.duration
            );
            for task in report.retried() {
                info!("  {} took {} attempt(s)", task, report.attempts_for(task));
            }
            Ok(())
        }
        Err(e) => {
            error!("Convergence failed: {}", e);
            Err(e.into())
        }
    }
}

/// Validate a manifest and its dependency graph without running.
fn validate_manifest(manifest: &ManifestArgs) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating {}", manifest.path.display());

    let result = manifest.load().and_then(|(_, tasks)| {
        let graph = DependencyGraph::build(&tasks)?;
        Ok((tasks, graph))
    });
    match result {
        Ok((tasks, graph)) => {
            info!(
                "Manifest is valid: {} task(s), longest chain {}",
                tasks.len(),
                graph.depth()
            );
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e)
        }
    }
}

/// List tasks grouped by dependency level.
fn list_tasks(manifest: &ManifestArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (config, tasks) = manifest.load()?;
    let graph = DependencyGraph::build(&tasks)?;

    if tasks.is_empty() {
        println!("No tasks in {}", manifest.path.display());
        return Ok(());
    }

    println!("Tasks in {} (target: {}):", manifest.path.display(), config.target);
    println!();

    for (level, ids) in graph.levels().iter().enumerate() {
        println!("Level {}:", level);
        for id in ids {
            let deps: Vec<&str> = graph.dependencies(id).map(|d| d.as_str()).collect();
            if deps.is_empty() {
                println!("  - {}", id);
            } else {
                println!("  - {} (depends on: {})", id, deps.join(", "));
            }
        }
    }

    Ok(())
}
