use clap::Parser;
use pkg_constants::controller::{DEFAULT_RESYNC_SECS, DEFAULT_WORKERS};
use pkg_constants::paths::{DEFAULT_CONTROLLER_CONFIG, DEFAULT_CONTROLLER_DATA_DIR};
use pkg_controllers::client::StoreClient;
use pkg_controllers::collaborators::{Collaborators, LoggingTrafficRouter};
use pkg_controllers::rollout::RolloutController;
use pkg_state::client::StateStore;
use pkg_types::config::{ControllerConfigFile, load_config_file};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "rollouts-controller",
    about = "k3rs progressive delivery controller"
)]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONTROLLER_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds between full resyncs of every Rollout
    #[arg(long)]
    resync_secs: Option<u64>,

    /// Log format: text or json
    #[arg(long)]
    log_format: Option<String>,
}

fn init_logging(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ControllerConfigFile = load_config_file(&cli.config)?;

    // Merge: CLI args > config file > defaults
    let log_format = cli
        .log_format
        .or(file_cfg.log_format)
        .unwrap_or_else(|| "text".to_string());
    init_logging(&log_format);

    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| DEFAULT_CONTROLLER_DATA_DIR.to_string());
    let workers = cli.workers.or(file_cfg.workers).unwrap_or(DEFAULT_WORKERS);
    let resync_secs = cli
        .resync_secs
        .or(file_cfg.resync_secs)
        .unwrap_or(DEFAULT_RESYNC_SECS);

    info!("Starting rollouts-controller");
    info!("  Config:    {}", cli.config);
    info!("  Data dir:  {}", data_dir);
    info!("  Workers:   {}", workers);
    info!("  Resync:    {}s", resync_secs);

    let store = StateStore::new(&data_dir).await?;
    let event_log = store.event_log.clone();
    let client = Arc::new(StoreClient::new(store));
    let collaborators =
        Collaborators::default().with_router("log", Arc::new(LoggingTrafficRouter));

    let controller = RolloutController::new(client.clone(), collaborators)
        .with_workers(workers)
        .with_resync_interval(Duration::from_secs(resync_secs))
        .with_event_log(event_log);
    let queue = controller.queue();
    let handle = controller.start();

    // Block until Ctrl-C
    info!("Controller is running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down rollouts-controller");

    queue.shutdown();
    if let Err(e) = handle.await {
        warn!("Controller task ended abnormally: {}", e);
    }

    match Arc::try_unwrap(client) {
        Ok(client) => client.close().await?,
        Err(_) => warn!("State store still in use; skipping close"),
    }

    Ok(())
}
