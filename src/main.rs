use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use depot::config::{self, Config};
use depot::install::Drift;
use depot::project::{CheckReport, Project, SyncOutcome};
use depot::{logging, shutdown};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "depot")]
#[command(version, about = "Dependency resolution and package installation")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Install dependencies from depot.toml, reusing depot.lock when possible
    Install {
        /// Include dev dependencies
        #[arg(long)]
        dev: bool,
    },

    /// Add a dependency (`name`, `name@^1.2`, `name@latest`)
    Add {
        spec: String,

        /// Add as a dev dependency
        #[arg(long)]
        dev: bool,
    },

    /// Remove a dependency
    Remove { name: String },

    /// Re-resolve every dependency, ignoring depot.lock
    Update {
        /// Include dev dependencies
        #[arg(long)]
        dev: bool,
    },

    /// Report declared dependencies missing from depot.lock and modules out of step with it
    Check {
        /// Include dev dependencies
        #[arg(long)]
        dev: bool,
    },

    /// List locked packages
    List {
        /// Include dev dependencies
        #[arg(long)]
        dev: bool,

        /// Show the dependency tree below each declared dependency
        #[arg(long)]
        tree: bool,
    },

    /// Remove installed modules and the lock file
    Clean {
        /// Also clear the shared artifact cache
        #[arg(long)]
        cache: bool,
    },

    /// Pack the project and upload it to the registry
    Publish {
        /// Registry URL (defaults to the configured registry)
        #[arg(long)]
        registry: Option<String>,

        /// Pack without uploading
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _guard = logging::init(&config::log_path(), cli.verbose)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cli.command))
}

async fn run(command: Command) -> anyhow::Result<ExitCode> {
    let config = Config::load(&config::config_path())?;
    let root = std::env::current_dir().context("Failed to determine the project directory")?;

    let (handle, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling");
            handle.signal();
        }
    });

    let project = Project::new(root, config, shutdown);
    let outcome = match command {
        Command::Install { dev } => project.install(dev).await?,
        Command::Add { spec, dev } => project.add(&spec, dev).await?,
        Command::Remove { name } => project.remove(&name).await?,
        Command::Update { dev } => project.update(dev).await?,
        Command::Check { dev } => return Ok(print_check(&project.check(dev)?)),
        Command::List { dev, tree } => {
            let listing = project.list(dev)?;
            if tree {
                print!("{}", listing.tree());
            } else {
                for package in &listing.resolved {
                    println!("{} {}", package, package.integrity);
                }
            }
            return Ok(ExitCode::SUCCESS);
        }
        Command::Clean { cache } => {
            project.clean(cache)?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Publish { registry, dry_run } => {
            let published = project.publish(registry.as_deref(), dry_run).await?;
            println!(
                "{}{}@{} ({} bytes, {})",
                if published.dry_run { "[dry run] " } else { "" },
                published.name,
                published.version,
                published.size,
                published.integrity
            );
            return Ok(ExitCode::SUCCESS);
        }
    };

    Ok(summarize(&outcome))
}

fn print_check(report: &CheckReport) -> ExitCode {
    for name in &report.unlocked {
        println!("not locked: {name}");
    }
    for name in &report.stale {
        println!("no longer needed: {name}");
    }
    for drift in &report.drift {
        match drift {
            Drift::Missing(name) => println!("not installed: {name}"),
            Drift::Mismatch { name, found: Some(found) } => {
                println!("out of date: {name} (installed {found})")
            }
            Drift::Mismatch { name, found: None } => println!("damaged: {name}"),
            Drift::Extraneous(name) => println!("extraneous: {name}"),
        }
    }

    if report.is_clean() {
        println!("everything is up to date");
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn summarize(outcome: &SyncOutcome) -> ExitCode {
    for name in &outcome.pruned {
        println!("removed {name}");
    }
    println!("{}", outcome.report);

    if outcome.report.is_success() {
        ExitCode::SUCCESS
    } else {
        error!("{} package(s) failed to install", outcome.report.failures().count());
        ExitCode::FAILURE
    }
}
