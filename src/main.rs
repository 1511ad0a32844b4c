use anyhow::Result;
use clap::Parser;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use snigate::{Config, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "snigate")]
#[command(about = "Transparent SNI-based TLS filtering proxy")]
#[command(version)]
struct Args {
    /// Address to listen on (e.g., 0.0.0.0:443)
    #[arg(long, default_value = "0.0.0.0:443")]
    listen: String,

    /// Path to the access rules file
    #[arg(long, default_value = "/usr/local/etc/snigate/access_rules.txt")]
    rules: String,

    /// Path to the access log file
    #[arg(long, default_value = "/var/log/snigate.log")]
    log: String,

    /// Path to the PID file
    #[arg(long, default_value = "/var/run/snigate.pid")]
    pid: String,

    /// Path the activity snapshot is published to
    #[arg(long, default_value = "/var/lib/snigate/active_ips.json")]
    snapshot_file: String,

    /// Seconds between snapshot publications (floor 1)
    #[arg(long, default_value_t = 2)]
    snapshot_interval_sec: u64,

    /// Seconds of inactivity before a tracked IP is dropped (floor 5)
    #[arg(long, default_value_t = 120)]
    snapshot_idle_timeout_sec: u64,

    /// Upper bound on tracked IPs in the snapshot
    #[arg(long, default_value_t = 5000)]
    snapshot_max_ips: usize,

    /// Seconds before snapshot identity fields expire (0 disables)
    #[arg(long, default_value_t = 300)]
    identity_ttl_sec: u64,

    /// Heartbeat listen address (e.g., 0.0.0.0:8799); empty disables it
    #[arg(long, default_value = "")]
    agent_listen: String,

    /// Agent registry TTL in seconds (clamped to [10, 600])
    #[arg(long, default_value_t = 300)]
    agent_ttl_sec: u64,

    /// Seconds to wait for the ClientHello
    #[arg(long, default_value_t = 30)]
    read_timeout_sec: u64,

    /// Seconds to wait for the upstream dial and handshake replay
    #[arg(long, default_value_t = 30)]
    write_timeout_sec: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config {
        listen_addr: args.listen,
        rules_file: args.rules,
        log_file: args.log,
        pid_file: args.pid,
        snapshot_file: args.snapshot_file,
        snapshot_interval: Duration::from_secs(args.snapshot_interval_sec),
        snapshot_idle_timeout: Duration::from_secs(args.snapshot_idle_timeout_sec),
        snapshot_max_ips: args.snapshot_max_ips,
        identity_ttl: Duration::from_secs(args.identity_ttl_sec),
        agent_listen_addr: args.agent_listen,
        agent_ttl: Duration::from_secs(args.agent_ttl_sec),
        read_timeout: Duration::from_secs(args.read_timeout_sec),
        write_timeout: Duration::from_secs(args.write_timeout_sec),
    };
    config.clamp();

    info!("snigate {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "configuration: listen={} rules={} log={} snapshot={}",
        config.listen_addr, config.rules_file, config.log_file, config.snapshot_file
    );

    Supervisor::new(config).run().await
}
