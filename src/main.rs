use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use stow::{
    CheckoutOptions, ComponentId, DirWorkspace, LoadReport, StashConfig, StashManager, VersionRef,
};

#[derive(Parser)]
#[command(name = "stow", author, version, about = "Stash modified components", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project root
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,

    /// Without a sub-command, stash like `save`
    #[command(flatten)]
    save: SaveArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Stash modified components
    Save(SaveArgs),
    /// Load latest stash, checkout components and delete stash
    Load(LoadArgs),
    /// List stash entries, newest first
    List,
    /// Record a component's working files as its resolved version
    Track {
        component: String,
        #[arg(value_name = "VERSION")]
        version_ref: String,
    },
}

#[derive(Args)]
struct SaveArgs {
    /// Only stash components whose name matches this glob pattern
    #[arg(short, long)]
    pattern: Option<String>,

    /// Message to be attached to the stashed components
    #[arg(short, long)]
    message: Option<String>,
}

#[derive(Args)]
struct LoadArgs {
    /// In case of merge conflict, resolve according to the provided strategy: [ours, theirs, manual]
    #[arg(long, value_name = "MERGE_STRATEGY")]
    auto_merge_resolve: Option<String>,

    /// Same as "--auto-merge-resolve manual". Write the files with the conflict markers
    #[arg(long)]
    manual: bool,

    /// Do not merge, preserve local files as is
    #[arg(long)]
    force_ours: bool,

    /// Do not merge, just overwrite with incoming files
    #[arg(long)]
    force_theirs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let workspace = DirWorkspace::new(&cli.root);

    match cli.command {
        Some(Commands::Track { component, version_ref }) => {
            let files = workspace
                .track(&ComponentId::new(component.as_str()), &VersionRef::new(version_ref.as_str()))
                .await
                .with_context(|| format!("failed to track {}", component))?;
            println!("tracked {} at {} ({} files)", component, version_ref, files);
        }
        Some(Commands::Load(args)) => {
            // Flags are validated before the stash is opened
            let options = CheckoutOptions::from_flags(
                args.auto_merge_resolve.as_deref(),
                args.manual,
                args.force_ours,
                args.force_theirs,
            )?;
            let manager = open(&cli.root, workspace).await?;
            let report = manager.load_latest(options).await?;
            print_load_report(&report);
            if !report.is_complete() {
                std::process::exit(1);
            }
        }
        Some(Commands::List) => {
            let manager = open(&cli.root, workspace).await?;
            for (position, meta) in manager.list().iter().enumerate() {
                println!(
                    "stash@{{{}}} {} {} ({} components, {} files)",
                    position,
                    meta.id.short(),
                    meta.summary,
                    meta.components.len(),
                    meta.file_count
                );
            }
        }
        Some(Commands::Save(args)) => save(&cli.root, workspace, args).await?,
        None => save(&cli.root, workspace, cli.save).await?,
    }

    Ok(())
}

async fn open(root: &Path, workspace: DirWorkspace) -> Result<StashManager<DirWorkspace>> {
    StashManager::open(StashConfig::for_root(root), workspace)
        .await
        .context("failed to open stash")
}

async fn save(root: &Path, workspace: DirWorkspace, args: SaveArgs) -> Result<()> {
    let manager = open(root, workspace).await?;
    let ids = manager.save(args.pattern.as_deref(), args.message).await?;
    println!("stashed {} components", ids.len());
    Ok(())
}

fn print_load_report(report: &LoadReport) {
    println!(
        "checked out {} components according to the latest stash",
        report.restored.len()
    );

    for conflict in &report.conflicts {
        println!("conflict in {}:", conflict.component_id);
        for path in &conflict.paths {
            println!("  {}", path.display());
        }
    }
    for failure in &report.failures {
        eprintln!("failed to restore {}: {}", failure.component_id, failure.error);
    }
    if !report.popped {
        println!("stash {} was kept", report.stash_id.short());
    }
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
