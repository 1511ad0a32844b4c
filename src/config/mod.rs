use std::time::Duration;

/// Floor for the snapshot publication interval.
const MIN_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

/// Floor for the snapshot idle timeout.
const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounds for the agent registry TTL.
const MIN_AGENT_TTL: Duration = Duration::from_secs(10);
const MAX_AGENT_TTL: Duration = Duration::from_secs(600);

/// Runtime configuration for the proxy process.
///
/// Values out of range are clamped, never rejected.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TLS proxy listens on.
    pub listen_addr: String,

    /// Path to the access rules file.
    pub rules_file: String,

    /// Path to the access log file.
    pub log_file: String,

    /// Path to the PID file.
    pub pid_file: String,

    /// Path the activity snapshot is published to.
    pub snapshot_file: String,

    /// Interval between snapshot publications.
    pub snapshot_interval: Duration,

    /// Tracked IPs idle beyond this are garbage-collected.
    pub snapshot_idle_timeout: Duration,

    /// Upper bound on tracked IPs in the snapshot.
    pub snapshot_max_ips: usize,

    /// Identity fields older than this are cleared from the snapshot.
    /// Zero disables the expiry.
    pub identity_ttl: Duration,

    /// Address of the heartbeat HTTP listener; empty disables it.
    pub agent_listen_addr: String,

    /// TTL for agent registry entries.
    pub agent_ttl: Duration,

    /// Deadline for reading the ClientHello from a client.
    pub read_timeout: Duration,

    /// Deadline for the upstream dial and the ClientHello replay.
    pub write_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:443".to_string(),
            rules_file: "/usr/local/etc/snigate/access_rules.txt".to_string(),
            log_file: "/var/log/snigate.log".to_string(),
            pid_file: "/var/run/snigate.pid".to_string(),
            snapshot_file: "/var/lib/snigate/active_ips.json".to_string(),
            snapshot_interval: Duration::from_secs(2),
            snapshot_idle_timeout: Duration::from_secs(120),
            snapshot_max_ips: 5000,
            identity_ttl: Duration::from_secs(300),
            agent_listen_addr: String::new(),
            agent_ttl: Duration::from_secs(300),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Clamps every bounded field into its documented range.
    pub fn clamp(&mut self) {
        if self.snapshot_interval < MIN_SNAPSHOT_INTERVAL {
            self.snapshot_interval = MIN_SNAPSHOT_INTERVAL;
        }
        if self.snapshot_idle_timeout < MIN_IDLE_TIMEOUT {
            self.snapshot_idle_timeout = MIN_IDLE_TIMEOUT;
        }
        self.agent_ttl = self.agent_ttl.clamp(MIN_AGENT_TTL, MAX_AGENT_TTL);
    }
}
