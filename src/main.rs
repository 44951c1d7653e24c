use clap::Parser;
use tracing_subscriber::EnvFilter;

use probehub::config::CoordinatorConfig;
use probehub::node::Coordinator;
use probehub::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "probehub")]
#[command(version)]
#[command(about = "Coordinator for a fleet of network speed-probe machines")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordinator server
    Server(ServerArgs),
}

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to serve the JSON API on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: std::net::SocketAddr,

    /// Seconds of silence before a machine is declared offline
    #[arg(long, default_value = "60")]
    liveness_timeout_secs: i64,

    /// Seconds between staleness sweeps
    #[arg(long, default_value = "30")]
    sweep_interval_secs: u64,

    /// Seconds an active task may run without a result
    #[arg(long, default_value = "3600")]
    active_deadline_secs: i64,

    /// Maximum pending+active tasks per machine
    #[arg(long, default_value = "15")]
    task_capacity: usize,

    /// Seconds finished tasks and their series are kept
    #[arg(long, default_value = "86400")]
    retention_secs: i64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Server(server) => {
            let mut config = CoordinatorConfig::new(server.listen)
                .with_liveness_timeout(server.liveness_timeout_secs)
                .with_active_deadline(server.active_deadline_secs)
                .with_task_capacity(server.task_capacity)
                .with_retention(server.retention_secs);
            config.sweep_interval_secs = server.sweep_interval_secs;

            tracing::info!(
                listen = %config.listen_addr,
                liveness_timeout_secs = config.liveness_timeout_secs,
                task_capacity = config.task_capacity,
                "Starting probehub coordinator"
            );

            let shutdown = install_shutdown_handler();
            Coordinator::new(config).run(shutdown).await;
            tracing::info!("Coordinator stopped");
        }
    }
}
