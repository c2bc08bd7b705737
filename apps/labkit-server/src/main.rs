mod registered_modules;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labkit::{ConfigTree, Manager, ModuleId, PluginRegistry};
use labkit_bootstrap::{AppConfig, CliArgs, init_logging, wait_for_shutdown};
use labkit_remote::{RemoteModuleServer, RemoteModuleService, TcpRemoteConnector};
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// `LabKit` Server - module orchestration for laboratory instruments
#[derive(Parser)]
#[command(name = "labkit-server")]
#[command(about = "LabKit Server - module orchestration for laboratory instruments")]
#[command(version)]
struct Cli {
    /// Path to the configuration file (module tree plus server/logging/threads)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Home directory override (status files, logs)
    #[arg(long)]
    home_dir: Option<String>,

    /// Print effective application configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the manager, the remote module server and the startup modules
    Run,
    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = CliArgs {
        config: cli.config.clone(),
        home_dir: cli.home_dir.clone(),
        verbose: cli.verbose,
    };
    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    config.apply_cli_overrides(&args)?;

    if cli.print_config {
        println!("Effective configuration:\n{}", config.to_yaml()?);
        return Ok(());
    }

    let _log_guard = init_logging(&config.logging, config.home_dir())?;
    tracing::info!(home_dir = %config.home_dir().display(), "LabKit Server starting");

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(&config, args.config.as_deref()).await,
        Commands::Check => check_config(&config, args.config.as_deref()),
    }
}

fn build_manager(config: &AppConfig) -> Result<Arc<Manager>> {
    let plugins = PluginRegistry::discover().context("module class registration failed")?;
    Ok(Manager::builder(plugins)
        .with_home_dir(config.home_dir())
        .with_join_timeout(config.threads.join_timeout())
        .with_remote_connector(Arc::new(TcpRemoteConnector::default()))
        .with_instance_id(uuid::Uuid::new_v4())
        .build())
}

fn load_modules(manager: &Manager, path: Option<&Path>) -> Result<Vec<String>> {
    let Some(path) = path else {
        tracing::warn!("No configuration file given; no modules are defined");
        return Ok(Vec::new());
    };
    let tree = ConfigTree::from_file(path)?;
    let report = manager.configure(tree);
    Ok(report
        .rejected
        .iter()
        .map(|(id, e)| format!("{id}: {e}"))
        .collect())
}

fn check_config(config: &AppConfig, path: Option<&Path>) -> Result<()> {
    tracing::info!("Checking configuration...");
    let manager = build_manager(config)?;
    let mut problems = load_modules(&manager, path)?;

    for id in manager.defined_modules() {
        let desc = manager.descriptor(&id)?;
        if let Some(class) = &desc.class_path
            && let Err(e) = manager.plugins().get(id.base, class)
        {
            problems.push(format!("{id}: {e}"));
        }
        if let Err(e) = manager.start_plan(&id) {
            problems.push(e.to_string());
        }
    }
    for name in &manager.global_config().startup {
        if let Err(e) = manager.find_module(name) {
            problems.push(format!("startup entry '{name}': {e}"));
        }
    }

    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("  - {problem}");
        }
        anyhow::bail!("configuration has {} problem(s)", problems.len());
    }
    println!("Configuration is valid");
    for id in manager.defined_modules() {
        println!("  {id}");
    }
    Ok(())
}

async fn run_server(config: &AppConfig, path: Option<&Path>) -> Result<()> {
    tracing::info!("Initializing modules...");
    let manager = build_manager(config)?;
    tracing::info!(instance_id = %manager.instance_id(), "Manager created");

    for problem in load_modules(&manager, path)? {
        tracing::error!(problem = %problem, "Module definition rejected");
    }

    let server = match manager.global_config().remote_modules_server {
        Some(server_config) => Some(
            RemoteModuleServer::from_config(&server_config, RemoteModuleService::new(&manager))
                .await?,
        ),
        None => None,
    };

    let cancel = CancellationToken::new();
    let cancel_for_signals = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            tracing::warn!(error = %e, "Signal listener failed, falling back to Ctrl+C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Cannot wait for Ctrl+C; shutting down");
            }
        }
        cancel_for_signals.cancel();
    });

    let startup = {
        let manager = Arc::clone(&manager);
        tokio::task::spawn_blocking(move || manager.start_startup_modules()).await?
    };
    for (name, result) in startup {
        match result {
            Ok(started) => {
                let started: Vec<String> = started.iter().map(ModuleId::to_string).collect();
                tracing::info!(module = %name, started = ?started, "Startup module running");
            }
            Err(e) => tracing::error!(module = %name, error = %e, "Startup module failed"),
        }
    }

    tracing::info!("Running; press Ctrl+C to quit");
    cancel.cancelled().await;

    if let Some(server) = server {
        server.stop().await;
    }
    let report = tokio::task::spawn_blocking(move || manager.force_quit()).await?;
    for (id, e) in &report.failed {
        tracing::error!(module = %id, error = %e, "Module did not shut down cleanly");
    }
    tracing::info!("LabKit Server stopped");
    Ok(())
}
