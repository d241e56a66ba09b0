use clap::Parser;
use pkg_api::server::{ServerConfig, start_server};
use pkg_constants::network::DEFAULT_API_PORT;
use pkg_constants::paths::{DEFAULT_SERVER_CONFIG, DEFAULT_SERVER_DATA_DIR};
use pkg_constants::quota::{
    DEFAULT_ADMISSION_TIMEOUT_MS, DEFAULT_ADMISSION_WORKERS, DEFAULT_MAX_CONCURRENT_RECONCILES,
    DEFAULT_RESYNC_PERIOD_SECS,
};
use pkg_types::config::{ServerConfigFile, load_config_file};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(
    name = "sharedquota-server",
    about = "Shared quota admission webhook and reconciler"
)]
struct Cli {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_SERVER_CONFIG)]
    config: String,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Seconds between full recalculations of every shared quota
    #[arg(long)]
    resync_period_secs: Option<u64>,

    /// Shared quotas reconciled in parallel
    #[arg(long)]
    max_concurrent_reconciles: Option<usize>,

    /// Admission requests evaluated in parallel
    #[arg(long)]
    admission_workers: Option<usize>,

    /// Deadline for one admission evaluation, in milliseconds
    #[arg(long)]
    admission_timeout_ms: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_line_number(true))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config file (returns defaults if file not found)
    let file_cfg: ServerConfigFile = load_config_file(&cli.config)?;

    // Merge: CLI args > config file > defaults
    init_tracing(cli.log_json || file_cfg.log_json.unwrap_or(false));
    info!("Config file: {}", cli.config);

    let port = cli.port.or(file_cfg.port).unwrap_or(DEFAULT_API_PORT);
    let data_dir = cli
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| DEFAULT_SERVER_DATA_DIR.to_string());
    let resync = cli
        .resync_period_secs
        .or(file_cfg.resync_period_secs)
        .unwrap_or(DEFAULT_RESYNC_PERIOD_SECS);
    let reconciles = cli
        .max_concurrent_reconciles
        .or(file_cfg.max_concurrent_reconciles)
        .unwrap_or(DEFAULT_MAX_CONCURRENT_RECONCILES);
    let admission_workers = cli
        .admission_workers
        .or(file_cfg.admission_workers)
        .unwrap_or(DEFAULT_ADMISSION_WORKERS);
    let admission_timeout_ms = cli
        .admission_timeout_ms
        .or(file_cfg.admission_timeout_ms)
        .unwrap_or(DEFAULT_ADMISSION_TIMEOUT_MS);

    info!("Starting sharedquota-server");
    info!("  Port:              {}", port);
    info!("  Data dir:          {}", data_dir);
    info!("  Resync period:     {}s", resync);
    info!("  Reconcile workers: {}", reconciles);
    info!("  Admission workers: {}", admission_workers);
    info!("  Admission timeout: {}ms", admission_timeout_ms);

    let config = ServerConfig {
        addr: SocketAddr::from(([0, 0, 0, 0], port)),
        data_dir,
        resync_period: Duration::from_secs(resync),
        max_concurrent_reconciles: reconciles,
        admission_workers,
        admission_timeout: Duration::from_millis(admission_timeout_ms),
    };

    start_server(config).await?;

    Ok(())
}
