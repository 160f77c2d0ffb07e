use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use convergd::config::{load_configuration, ConfigurationStore};
use convergd::controller::{ChangeExecutor, ConvergenceLoop};
use convergd::driver::{self, BackendKind};
use convergd::model::DesiredConfiguration;
use convergd::observer::StateObserver;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Initial desired-configuration YAML file; starts empty when omitted
    #[arg(long, env = "CONVERGD_CONFIG")]
    config: Option<PathBuf>,

    /// Storage and container backend to drive
    #[arg(long, env = "CONVERGD_BACKEND", value_enum, default_value = "memory")]
    backend: BackendKind,

    /// Seconds between convergence passes when nothing changes
    #[arg(long, env = "CONVERGD_POLL_INTERVAL", default_value = "10")]
    poll_interval: u64,

    /// Timeout in seconds for each individual backend call
    #[arg(long, env = "CONVERGD_CALL_TIMEOUT", default_value = "60")]
    call_timeout: u64,

    /// Address for the REST API server
    #[cfg(feature = "rest-api")]
    #[arg(long, env = "CONVERGD_API_ADDR", default_value = "0.0.0.0:4523")]
    api_addr: std::net::SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("convergd v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

async fn run_operator(args: RunArgs) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    info!("Starting convergd v{}", env!("CARGO_PKG_VERSION"));

    let initial = match &args.config {
        Some(path) => {
            let config = load_configuration(path)?;
            info!(path = %path.display(), "loaded desired configuration");
            config
        }
        None => DesiredConfiguration::default(),
    };

    let (storage, containers) = driver::build(args.backend);
    info!(backend = ?args.backend, "backend drivers ready");

    let store = Arc::new(ConfigurationStore::new(initial)?);
    let observer = Arc::new(StateObserver::new(storage.clone(), containers.clone()));
    let executor = ChangeExecutor::new(
        storage,
        containers,
        Duration::from_secs(args.call_timeout),
    );
    let convergence = Arc::new(ConvergenceLoop::new(
        store.clone(),
        observer.clone(),
        executor,
        Duration::from_secs(args.poll_interval),
    ));

    #[cfg(feature = "rest-api")]
    {
        let api_state = Arc::new(convergd::rest_api::ApiState {
            store: store.clone(),
            observer: observer.clone(),
            convergence: convergence.clone(),
        });
        let api_addr = args.api_addr;
        tokio::spawn(async move {
            if let Err(e) = convergd::rest_api::run_server(api_state, api_addr).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    tokio::select! {
        result = convergence.run() => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}
