//! pinbuild CLI tool.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "pinbuild")]
#[command(about = "Build a component against its pinned dependency, reusing cached builds", long_about = None)]
struct Cli {
    /// Pipeline definition
    #[arg(long, global = true, env = "PINBUILD_CONFIG", default_value = "pinbuild.kdl")]
    config: PathBuf,

    /// Root of the local artifact cache
    #[arg(long, global = true, env = "PINBUILD_CACHE_ROOT", default_value = "/var/build")]
    cache_root: PathBuf,

    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline for a parent revision
    Run(RunArgs),
    /// Validate a pipeline definition
    Validate {
        /// Path to the definition (defaults to --config)
        path: Option<PathBuf>,
    },
    /// Inspect the artifact cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
    /// Report whether a branch/revision pair is a release build
    ReleaseCheck {
        /// Branch label
        branch: String,
        /// Revision
        revision: String,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show whether a component revision is cached
    Status {
        /// Component name
        component: String,
        /// Revision
        revision: String,
    },
    /// List cached revisions of a component
    List {
        /// Component name
        component: String,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Directory holding one checkout per component
    #[arg(long, env = "PINBUILD_WORKSPACE", default_value = ".")]
    pub workspace: PathBuf,

    /// Remote the parent is fetched from
    #[arg(long, env = "PINBUILD_REMOTE")]
    pub remote: String,

    /// Branch label of the run
    #[arg(long, env = "PINBUILD_BRANCH", default_value = "master")]
    pub branch: String,

    /// Parent revision to build
    #[arg(long, env = "PINBUILD_REVISION")]
    pub revision: String,

    /// Dependency remote, replacing the manifest default
    #[arg(long, env = "PINBUILD_DEPENDENCY_REMOTE")]
    pub dependency_remote: Option<String>,

    /// Dependency revision, replacing the manifest default
    #[arg(long, env = "PINBUILD_DEPENDENCY_REVISION")]
    pub dependency_revision: Option<String>,

    /// Directory receiving `artifacts/` and `results/` (defaults to the workspace)
    #[arg(long, env = "PINBUILD_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Override the pointer file directory
    #[arg(long)]
    pub artifacts_dir: Option<PathBuf>,

    /// Override the test report directory
    #[arg(long)]
    pub results_dir: Option<PathBuf>,

    /// Run under continuous integration (adds ci-package commands)
    #[arg(long, env = "PINBUILD_CI")]
    pub ci: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    match cli.command {
        Commands::Run(args) => {
            commands::run::run(&cli.config, &cli.cache_root, args).await?;
        }
        Commands::Validate { path } => {
            commands::validate(path.as_deref().unwrap_or(cli.config.as_path()))?;
        }
        Commands::Cache { command } => match command {
            CacheCommands::Status {
                component,
                revision,
            } => {
                commands::cache_status(&cli.cache_root, &component, &revision)?;
            }
            CacheCommands::List { component } => {
                commands::cache_list(&cli.cache_root, &component)?;
            }
        },
        Commands::ReleaseCheck { branch, revision } => {
            commands::release_check(&branch, &revision);
        }
    }

    Ok(())
}
