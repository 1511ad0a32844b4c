use crate::agent::Registry;
use crate::appid::NoopResolver;
use crate::config::Config;
use crate::heartbeat::HeartbeatServer;
use crate::logger::{AccessLog, Sink};
use crate::proxy::{Handler, ProxyServer};
use crate::rules::SharedRules;
use crate::tracker::{write_snapshot_atomic, Options, Tracker};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Flush cadence for the buffered access log
const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Owns every process-wide resource and orchestrates startup, SIGHUP
/// (rules reload, log reopen) and SIGTERM/SIGINT (graceful drain).
pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(mut config: Config) -> Self {
        config.clamp();
        Self { config }
    }

    pub async fn run(&self) -> Result<()> {
        let cfg = &self.config;

        let pid_file =
            PidFile::create(Path::new(&cfg.pid_file)).context("failed to write PID file")?;

        let access_log = Arc::new(
            AccessLog::open(Path::new(&cfg.log_file))
                .with_context(|| format!("failed to open log file {}", cfg.log_file))?,
        );

        let rules = Arc::new(
            SharedRules::load(Path::new(&cfg.rules_file))
                .with_context(|| format!("failed to load rules from {}", cfg.rules_file))?,
        );
        info!(
            "loaded {} rules from {}",
            rules.rule_count(),
            cfg.rules_file
        );

        let tracker = Arc::new(Tracker::new(Options {
            idle_timeout: cfg.snapshot_idle_timeout,
            max_ips: cfg.snapshot_max_ips,
            identity_ttl: cfg.identity_ttl,
        }));
        let registry = Arc::new(Registry::new(cfg.agent_ttl));

        let listener = TcpListener::bind(&cfg.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", cfg.listen_addr))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let heartbeat_task = if cfg.agent_listen_addr.is_empty() {
            None
        } else {
            let hb_listener = TcpListener::bind(&cfg.agent_listen_addr)
                .await
                .with_context(|| {
                    format!("failed to bind heartbeat listener {}", cfg.agent_listen_addr)
                })?;
            let hb = Arc::new(HeartbeatServer::new(
                Arc::clone(&registry),
                Arc::clone(&tracker),
            ));
            Some(tokio::spawn(hb.run(hb_listener, shutdown_rx.clone())))
        };

        let handler = Handler::new(
            Arc::clone(&rules),
            Arc::clone(&tracker),
            Arc::clone(&registry),
            Arc::clone(&access_log) as Arc<dyn Sink>,
            Arc::new(NoopResolver),
            cfg.read_timeout,
            cfg.write_timeout,
        );
        let proxy = Arc::new(ProxyServer::new(handler));
        let active = proxy.active();
        let proxy_task = {
            let proxy = Arc::clone(&proxy);
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { proxy.serve(listener, rx).await })
        };

        let snapshot_task = tokio::spawn(snapshot_loop(
            Arc::clone(&tracker),
            Arc::clone(&registry),
            PathBuf::from(&cfg.snapshot_file),
            cfg.snapshot_interval,
            shutdown_rx.clone(),
        ));
        let flush_task = tokio::spawn(flush_loop(Arc::clone(&access_log), shutdown_rx.clone()));

        let mut sighup =
            signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading rules and reopening log");
                    match rules.reload() {
                        Ok(count) => info!("rules reloaded ({} rules)", count),
                        Err(e) => warn!("rules reload failed, keeping previous set: {}", e),
                    }
                    if let Err(e) = access_log.reopen() {
                        warn!("access log reopen failed: {}", e);
                    }
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    break;
                }
            }
        }

        // Stop accepting and cancel the periodic tasks.
        let _ = shutdown_tx.send(true);
        let _ = proxy_task.await;
        let _ = snapshot_task.await;
        let _ = flush_task.await;
        if let Some(task) = heartbeat_task {
            let _ = task.await;
        }

        let in_flight = active.len();
        if in_flight > 0 {
            info!("waiting for {} in-flight connections to drain", in_flight);
        }
        active.wait_idle().await;

        if let Err(e) = access_log.close() {
            warn!("failed to flush access log on shutdown: {}", e);
        }
        drop(pid_file);
        info!("shutdown complete");
        Ok(())
    }
}

/// Periodic tick: GC the tracker and the agent registry, then publish the
/// activity snapshot atomically. A write failure is a warning, never fatal;
/// the next tick retries.
async fn snapshot_loop(
    tracker: Arc<Tracker>,
    registry: Arc<Registry>,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let now = Utc::now();
                tracker.gc(now);
                registry.gc(now);
                let snapshot = tracker.snapshot(now);
                if let Err(e) = write_snapshot_atomic(&path, &snapshot) {
                    warn!(
                        "failed to write activity snapshot to {}: {}",
                        path.display(),
                        e
                    );
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Flushes the buffered access log once a second.
async fn flush_loop(access_log: Arc<AccessLog>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(LOG_FLUSH_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = access_log.flush() {
                    warn!("failed to flush access log: {}", e);
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// PID file written at startup, removed again on clean shutdown.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &Path) -> std::io::Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove PID file {}: {}", self.path.display(), e);
            }
        }
    }
}
