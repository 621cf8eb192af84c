//! Server binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use sshsync_server::api::{self, AppState};
use sshsync_server::config::{self, BrokerConfig, Config};
use sshsync_server::db::{self, MachineRepo, UserRepo};
use sshsync_server::{
    Authenticator, CoordinationBus, HandshakeContext, RedisBroker, SessionTable,
};

#[derive(Parser)]
#[command(name = "sshsyncd", version, about = "ssh-sync credential server")]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "SSHSYNC_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Path to the SQLite database
    #[arg(long, env = "SSHSYNC_DB", default_value = "sshsync.db")]
    db: PathBuf,

    /// Redis `host:port` for cross-node coordination. Without it the server
    /// runs single-node.
    #[arg(long, env = "SSHSYNC_REDIS_URL")]
    redis_url: Option<String>,

    /// Redis password
    #[arg(long, env = "SSHSYNC_REDIS_PASSWORD")]
    redis_password: Option<String>,

    /// Redis logical database index
    #[arg(long, env = "SSHSYNC_REDIS_DB", default_value_t = 0)]
    redis_db: u32,

    /// Identity of this node on the coordination bus; defaults to the
    /// hostname
    #[arg(long, env = "SSHSYNC_NODE_ID")]
    node_id: Option<String>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let broker = cli.redis_url.map(|addr| BrokerConfig {
        addr,
        password: cli.redis_password,
        db: cli.redis_db,
    });
    let config = Config::new(cli.port, cli.db, broker, cli.node_id)?;

    let pool = db::init(&config.db_path)?;
    let sessions = Arc::new(SessionTable::new());

    let bus = match &config.broker {
        Some(broker_cfg) => {
            let broker = RedisBroker::connect(&broker_cfg.url()).await?;
            tracing::info!(addr = %broker_cfg.addr, "coordination bus connected");
            CoordinationBus::new(Arc::new(broker), config.node_id.clone())
        }
        None => {
            tracing::info!("no broker configured, running single-node");
            CoordinationBus::disabled(config.node_id.clone())
        }
    };
    bus.start_dispatch(Arc::clone(&sessions)).await?;

    let state = AppState {
        ctx: HandshakeContext {
            sessions,
            bus,
            users: UserRepo::new(pool.clone()),
            machines: MachineRepo::new(pool.clone()),
            accept_timeout: Duration::from_secs(config::HANDSHAKE_TIMEOUT_SECS),
        },
        auth: Authenticator::new(MachineRepo::new(pool)),
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!(port = config.port, node_id = %config.node_id, "listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sshsync_server={level},sshsyncd={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
