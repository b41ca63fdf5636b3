//! stackline CLI
//!
//! Usage: stackline [--config PATH] [-v] <COMMAND>
//!
//! Commands:
//!   plan      Print the deploy order of the application's stacks
//!   deploy    Deploy stacks in dependency order, rolling back on failure
//!   teardown  Delete stacks, dependents first
//!   runs      List recorded runs
//!   status    Show one recorded run
//!   bundle    Upload or download immutable template bundles

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stackline::backend::{CloudFormationCli, MemoryBackend, StackBackend};
use stackline::bundle::{BundleStore, DirBundleStore};
use stackline::config::{AppConfig, DEFAULT_CONFIG_FILE, NAMESPACE_ENV};
use stackline::driver::{DriverConfig, StackDriver};
use stackline::graph::DeploymentPlan;
use stackline::ledger::{self, FileLedger, LedgerStore, MemoryLedger};
use stackline::orchestrator::{self, Orchestrator, OrchestratorOptions};
use stackline::summary::{EXIT_ERROR, format_run, outcome_exit_code};
use stackline::types::{BundleId, Run, RunId, StackName};

/// stackline - deploy infrastructure stacks in dependency order
#[derive(Parser, Debug)]
#[command(name = "stackline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Application file
    #[arg(short, long, env = "STACKLINE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// AWS region passed to the CLI backend
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// AWS profile passed to the CLI backend
    #[arg(long, env = "AWS_PROFILE")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the deploy order and dependency levels
    Plan {
        /// Only these stacks and their dependencies
        #[arg(long = "stack")]
        stacks: Vec<String>,
    },

    /// Deploy stacks in dependency order, rolling back on failure
    Deploy {
        /// Deploy templates from this bundle
        #[arg(long)]
        bundle: Option<String>,

        /// Only these stacks and their dependencies
        #[arg(long = "stack")]
        stacks: Vec<String>,

        /// Leave deployed stacks in place when a later stack fails
        #[arg(long)]
        no_rollback: bool,

        /// Run against an in-memory backend and ledger; nothing is deployed
        #[arg(long)]
        rehearse: bool,
    },

    /// Delete stacks in reverse dependency order
    Teardown {
        /// Only these stacks and the stacks depending on them
        #[arg(long = "stack")]
        stacks: Vec<String>,

        /// Also delete stacks marked `on_delete: retain`
        #[arg(long)]
        delete_retained: bool,
    },

    /// List recorded runs
    Runs,

    /// Show a recorded run
    Status {
        run_id: String,
    },

    /// Manage template bundles
    Bundle {
        #[command(subcommand)]
        command: BundleCommand,
    },
}

#[derive(Subcommand, Debug)]
enum BundleCommand {
    /// Store a directory of templates as an immutable bundle
    Upload {
        #[arg(long)]
        id: String,

        #[arg(long)]
        source: PathBuf,
    },

    /// Copy a bundle's templates into a directory
    Download {
        #[arg(long)]
        id: String,

        #[arg(long)]
        dest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose > 0 {
        "stackline=debug"
    } else {
        "stackline=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(EXIT_ERROR as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let namespace = config.namespace(std::env::var(NAMESPACE_ENV).ok().as_deref());

    match cli.command {
        Commands::Plan { stacks } => {
            let plan = select(
                DeploymentPlan::from_specs(config.topology_specs(&namespace)?)?,
                &stacks,
            )?;
            print_plan(&plan);
            Ok(0)
        }

        Commands::Deploy {
            bundle,
            stacks,
            no_rollback,
            rehearse,
        } => {
            let location = match bundle {
                Some(id) => Some(bundle_store(&config).locate(&BundleId::new(id))?),
                None => None,
            };
            let specs = config.to_specs(&namespace, location.as_ref())?;
            let plan = select(DeploymentPlan::from_specs(specs)?, &stacks)?;
            let bundle = location.map(|l| l.id);

            let mut options = OrchestratorOptions::from_env();
            if no_rollback {
                options.rollback = false;
            }

            let result = if rehearse {
                let driver = StackDriver::new(MemoryBackend::new(), rehearsal_config());
                deploy(Orchestrator::new(driver, MemoryLedger::new(), options), &plan, bundle)
                    .await
            } else {
                let driver = StackDriver::new(
                    backend(&cli.region, &cli.profile),
                    DriverConfig::from_env(),
                );
                let ledger = FileLedger::open(config.ledger_dir.clone())?;
                deploy(Orchestrator::new(driver, ledger, options), &plan, bundle).await
            };
            Ok(report(result))
        }

        Commands::Teardown {
            stacks,
            delete_retained,
        } => {
            let full = DeploymentPlan::from_specs(config.topology_specs(&namespace)?)?;
            let plan = if stacks.is_empty() {
                full
            } else {
                full.restrict_dependents(&names(&stacks))?
            };

            let driver = StackDriver::new(
                backend(&cli.region, &cli.profile),
                DriverConfig::from_env(),
            );
            let ledger = FileLedger::open(config.ledger_dir.clone())?;
            let mut options = OrchestratorOptions::from_env();
            if delete_retained {
                options.delete_retained = true;
            }
            let mut orchestrator = Orchestrator::new(driver, ledger, options);

            let watcher = watch_interrupts(orchestrator.abort_token(), orchestrator.force_token());
            let result = orchestrator.teardown(&plan).await;
            watcher.abort();
            Ok(report(result))
        }

        Commands::Runs => {
            let store = FileLedger::open(config.ledger_dir.clone())?;
            for id in store.runs()? {
                match ledger::load(&store, &id) {
                    Ok(run) => println!("{}  {:<8}  {}", id, run.kind.to_string(), run.state),
                    Err(e) => println!("{}  unreadable: {}", id, e),
                }
            }
            Ok(0)
        }

        Commands::Status { run_id } => {
            let store = FileLedger::open(config.ledger_dir.clone())?;
            let run = ledger::load(&store, &RunId::new(run_id))?;
            print!("{}", format_run(&run));
            Ok(0)
        }

        Commands::Bundle { command } => {
            let store = bundle_store(&config);
            match command {
                BundleCommand::Upload { id, source } => {
                    let location = store.upload(&BundleId::new(id), &source)?;
                    println!("{}", location.root.display());
                }
                BundleCommand::Download { id, dest } => {
                    let location = store.locate(&BundleId::new(id))?;
                    let manifest = store.download(&location, &dest)?;
                    println!("{} files written to {}", manifest.files.len(), dest.display());
                }
            }
            Ok(0)
        }
    }
}

/// Runs a deploy with Ctrl-C wired to the orchestrator's tokens.
async fn deploy<B: StackBackend, L: LedgerStore>(
    mut orchestrator: Orchestrator<B, L>,
    plan: &DeploymentPlan,
    bundle: Option<BundleId>,
) -> orchestrator::Result<Run> {
    let watcher = watch_interrupts(orchestrator.abort_token(), orchestrator.force_token());
    let result = orchestrator.execute(plan, bundle).await;
    watcher.abort();
    result
}

/// Prints the run summary and returns the exit code. An abandoned run is
/// printed as it stood, already marked incomplete.
fn report(result: orchestrator::Result<Run>) -> u8 {
    match &result {
        Ok(run) => print!("{}", format_run(run)),
        Err(e) => {
            print!("{}", format_run(e.run()));
            eprintln!("error: {}", e);
        }
    }
    outcome_exit_code(&result) as u8
}

/// First Ctrl-C aborts the run, which then rolls back. A second one also
/// interrupts rollback.
fn watch_interrupts(abort: CancellationToken, force: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("interrupt received; stopping and rolling back (interrupt again to stop rollback)");
        abort.cancel();

        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("second interrupt received; abandoning rollback");
        force.cancel();
    })
}

fn backend(region: &Option<String>, profile: &Option<String>) -> CloudFormationCli {
    CloudFormationCli::new()
        .with_region(region.clone())
        .with_profile(profile.clone())
}

fn bundle_store(config: &AppConfig) -> DirBundleStore {
    let root = config
        .bundle_dir
        .clone()
        .unwrap_or_else(|| config.ledger_dir.join("bundles"));
    DirBundleStore::new(root)
}

/// Short polling for the in-memory backend.
fn rehearsal_config() -> DriverConfig {
    let mut config = DriverConfig::default();
    for poll in [&mut config.deploy_poll, &mut config.rollback_poll] {
        poll.initial_interval = Duration::from_millis(10);
        poll.growth = Duration::ZERO;
    }
    config
}

fn names(stacks: &[String]) -> Vec<StackName> {
    stacks.iter().map(|s| StackName::new(s.as_str())).collect()
}

fn select(plan: DeploymentPlan, stacks: &[String]) -> Result<DeploymentPlan> {
    if stacks.is_empty() {
        return Ok(plan);
    }
    Ok(plan.restrict(&names(stacks))?)
}

fn print_plan(plan: &DeploymentPlan) {
    println!("deploy order:");
    for (i, spec) in plan.stacks().iter().enumerate() {
        println!("  {:>2}. {} ({})", i + 1, spec.name, spec.stack_name);
    }
    println!("levels:");
    for (i, level) in plan.levels().iter().enumerate() {
        let names: Vec<&str> = level.iter().map(|n| n.as_str()).collect();
        println!("  {}: {}", i, names.join(", "));
    }
}
