//! Tessera - Main entry point
//!
//! Loads a KDL declaration of issuers and certificates and keeps the
//! certificates issued and renewed until stopped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};

use tessera_config::Config;
use tessera_controller::{
    BackendFactory, ChallengeManager, ChallengeSolver, Context, Controller, FileSecretStore,
    Http01Solver, InstantAcmeConnector, MemoryResourceStore, TracingRecorder,
};

const DEFAULT_CONFIG_PATH: &str = "/etc/tessera/tessera.kdl";
const DEFAULT_SECRETS_DIR: &str = "/var/lib/tessera/secrets";

/// Tessera - X.509 certificate issuance and renewal
#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Declaration file path
    #[arg(short = 'c', long = "config", env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// Test the declaration file and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Directory holding issued certificates and backend credentials
    #[arg(long = "secrets-dir", env = "TESSERA_SECRETS_DIR", default_value = DEFAULT_SECRETS_DIR)]
    secrets_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the declaration file and exit
    Check {
        /// Declaration file to test
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
    /// Run the controller (default)
    Run {
        /// Declaration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let fallback = || cli.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if cli.test {
        return check_config(&fallback());
    }

    match &cli.command {
        Some(Commands::Check { config }) => {
            check_config(&config.clone().unwrap_or_else(fallback))
        }
        Some(Commands::Run { config }) => {
            run_controller(config.clone().unwrap_or_else(fallback), &cli.secrets_dir)
        }
        None => run_controller(fallback(), &cli.secrets_dir),
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::from_file(path)
        .with_context(|| format!("Failed to load declaration file {}", path.display()))?;
    config
        .validate()
        .context("Declaration validation failed")?;
    Ok(config)
}

/// Test a declaration file and exit
fn check_config(path: &Path) -> Result<()> {
    info!("Testing declaration file: {}", path.display());
    let config = load_config(path)?;

    info!("Declaration test successful:");
    info!("  - {} issuer(s)", config.issuers.len());
    info!("  - {} certificate(s)", config.certificates.len());
    info!("  - {} worker(s) per resource kind", config.controller.workers);

    println!(
        "tessera: declaration file {} test is successful",
        path.display()
    );
    Ok(())
}

/// Run the controller until SIGINT or SIGTERM
fn run_controller(config_path: PathBuf, secrets_dir: &Path) -> Result<()> {
    info!("Loading declaration from: {}", config_path.display());
    let config = load_config(&config_path)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(async move {
        let store = Arc::new(MemoryResourceStore::new());
        store.apply_declaration(config.issuers, config.certificates);

        let secrets = Arc::new(
            FileSecretStore::new(secrets_dir).with_context(|| {
                format!("Failed to open secret storage at {}", secrets_dir.display())
            })?,
        );

        // Tokens are published here; an HTTP front end serves them
        let challenges = ChallengeManager::new();
        let solvers: Vec<Arc<dyn ChallengeSolver>> =
            vec![Arc::new(Http01Solver::new(challenges.clone()))];

        let backends = BackendFactory::new(
            secrets.clone(),
            Arc::new(InstantAcmeConnector::new()),
            solvers,
            config.controller.clone(),
        );

        let controller = Controller::new(Context {
            store: store.clone(),
            secrets,
            backends: Arc::new(backends),
            recorder: Arc::new(TracingRecorder),
            config: config.controller.clone(),
        });

        let reloader = tokio::spawn(reload_on_hangup(
            config_path,
            store,
            config.controller,
        ));

        info!("Tessera controller started successfully");
        let result = controller.run(shutdown_signal()).await;
        reloader.abort();
        result.context("Controller failed")
    })
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
    info!("Received shutdown signal, initiating graceful shutdown");
}

/// Re-apply the declaration file on every SIGHUP
async fn reload_on_hangup(
    path: PathBuf,
    store: Arc<MemoryResourceStore>,
    running: tessera_config::ControllerConfig,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to register SIGHUP handler, reload disabled");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, reloading declaration from {}", path.display());
        match load_config(&path) {
            Ok(config) => {
                if config.controller != running {
                    warn!("Controller settings changed; they take effect after a restart");
                }
                info!(
                    issuers = config.issuers.len(),
                    certificates = config.certificates.len(),
                    "Applying reloaded declaration"
                );
                store.apply_declaration(config.issuers, config.certificates);
            }
            Err(e) => {
                error!(error = %format!("{:#}", e), "Reload failed, keeping current declaration");
            }
        }
    }
}
