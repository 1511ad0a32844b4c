use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Tracker tuning knobs. Zero values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct Options {
    /// Entries with no active connections and no activity for this long are
    /// garbage-collected.
    pub idle_timeout: Duration,
    /// Upper bound on tracked IPs; the least recently active entries are
    /// dropped beyond it.
    pub max_ips: usize,
    /// Identity fields are cleared from snapshots when the last heartbeat is
    /// older than this. Zero disables the expiry.
    pub identity_ttl: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            max_ips: 5000,
            identity_ttl: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
struct IpStats {
    src_ip: String,
    first_seen: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    bytes_in: u64,
    bytes_out: u64,
    active_conns: u32,
    machine: String,
    username: String,
    identity_seen: Option<DateTime<Utc>>,
}

impl IpStats {
    fn new(src_ip: String, now: DateTime<Utc>) -> Self {
        Self {
            src_ip,
            first_seen: now,
            last_activity: now,
            bytes_in: 0,
            bytes_out: 0,
            active_conns: 0,
            machine: String::new(),
            username: String::new(),
            identity_seen: None,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}

/// Per-source-IP activity tracker.
///
/// A single mutex covers the whole map; every operation holds it briefly and
/// no callback runs under the lock, so identity and traffic updates on the
/// same IP are linearizable and snapshots observe everything that happened
/// before the call.
pub struct Tracker {
    opts: Options,
    ips: Mutex<HashMap<String, IpStats>>,
}

impl Tracker {
    pub fn new(mut opts: Options) -> Self {
        if opts.idle_timeout.is_zero() {
            opts.idle_timeout = Duration::from_secs(120);
        }
        if opts.max_ips == 0 {
            opts.max_ips = 5000;
        }
        Self {
            opts,
            ips: Mutex::new(HashMap::new()),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.opts.idle_timeout
    }

    /// Registers a new connection from `src_ip`, creating the entry if needed.
    pub fn conn_start(&self, src_ip: &str, now: DateTime<Utc>) {
        let Some(src_ip) = normalize_src_ip(src_ip) else {
            return;
        };
        let mut ips = self.ips.lock();
        let stats = ips
            .entry(src_ip.clone())
            .or_insert_with(|| IpStats::new(src_ip, now));
        stats.active_conns += 1;
        stats.touch(now);
    }

    /// Marks a connection from `src_ip` as finished. The counter never drops
    /// below zero and a missing entry is ignored.
    pub fn conn_end(&self, src_ip: &str, now: DateTime<Utc>) {
        let Some(src_ip) = normalize_src_ip(src_ip) else {
            return;
        };
        let mut ips = self.ips.lock();
        if let Some(stats) = ips.get_mut(&src_ip) {
            stats.active_conns = stats.active_conns.saturating_sub(1);
            stats.touch(now);
        }
    }

    /// Accounts relayed bytes for `src_ip`. This operation creates the entry
    /// when absent: traffic is what makes an IP tracked.
    pub fn add_bytes(&self, src_ip: &str, bytes_in: u64, bytes_out: u64, now: DateTime<Utc>) {
        let Some(src_ip) = normalize_src_ip(src_ip) else {
            return;
        };
        let mut ips = self.ips.lock();
        let stats = ips
            .entry(src_ip.clone())
            .or_insert_with(|| IpStats::new(src_ip, now));
        stats.bytes_in += bytes_in;
        stats.bytes_out += bytes_out;
        stats.touch(now);
    }

    /// Attaches machine/user identity to an already-tracked IP. An IP with no
    /// traffic yet is left untouched: identity alone never creates an entry.
    /// Empty fields preserve whatever was set before.
    pub fn set_identity(&self, src_ip: &str, machine: &str, username: &str, now: DateTime<Utc>) {
        let Some(src_ip) = normalize_src_ip(src_ip) else {
            return;
        };
        let mut ips = self.ips.lock();
        let Some(stats) = ips.get_mut(&src_ip) else {
            debug!(
                "identity for untracked IP {} dropped (machine={:?}, username={:?})",
                src_ip, machine, username
            );
            return;
        };
        let machine = sanitize_identity_field(machine);
        let username = sanitize_identity_field(username);
        if !machine.is_empty() {
            stats.machine = machine;
        }
        if !username.is_empty() {
            stats.username = username;
        }
        stats.identity_seen = Some(now);
    }

    /// Drops entries that are idle past the timeout with no active
    /// connections, then enforces the size cap keeping the most recently
    /// active entries.
    pub fn gc(&self, now: DateTime<Utc>) {
        let mut ips = self.ips.lock();

        let idle = self.opts.idle_timeout;
        ips.retain(|_, stats| {
            stats.active_conns > 0 || elapsed(stats.last_activity, now) <= idle
        });

        if ips.len() <= self.opts.max_ips {
            return;
        }
        let mut pairs: Vec<(String, DateTime<Utc>)> = ips
            .iter()
            .map(|(ip, stats)| (ip.clone(), stats.last_activity))
            .collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1));
        for (ip, _) in pairs.drain(self.opts.max_ips..) {
            ips.remove(&ip);
        }
    }

    /// Produces a point-in-time snapshot. Identity fields past their TTL are
    /// cleared in place before the record is emitted.
    pub fn snapshot(&self, now: DateTime<Utc>) -> SnapshotFile {
        let mut ips = self.ips.lock();

        let mut records = Vec::with_capacity(ips.len());
        for stats in ips.values_mut() {
            if !self.opts.identity_ttl.is_zero() {
                let expired = match stats.identity_seen {
                    None => true,
                    Some(seen) => elapsed(seen, now) > self.opts.identity_ttl,
                };
                if expired {
                    if !stats.machine.is_empty() || !stats.username.is_empty() {
                        debug!("clearing expired identity for IP {}", stats.src_ip);
                    }
                    stats.machine.clear();
                    stats.username.clear();
                }
            }

            let mut record = IpRecord {
                src_ip: stats.src_ip.clone(),
                machine: stats.machine.clone(),
                username: stats.username.clone(),
                first_seen: rfc3339(stats.first_seen),
                last_activity: rfc3339(stats.last_activity),
                identity_seen: String::new(),
                idle_seconds: elapsed(stats.last_activity, now).as_secs(),
                identity_idle_seconds: 0,
                bytes_in: stats.bytes_in,
                bytes_out: stats.bytes_out,
                bytes_total: stats.bytes_in + stats.bytes_out,
                active_conns: stats.active_conns,
            };

            if let Some(seen) = stats.identity_seen {
                record.identity_seen = rfc3339(seen);
                record.identity_idle_seconds = elapsed(seen, now).as_secs();
            }

            records.push(record);
        }

        // Most recent activity first, tie-break by bytes total. The sort key
        // is the RFC3339 string compared lexicographically, which is what the
        // snapshot consumer does with it.
        records.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then(b.bytes_total.cmp(&a.bytes_total))
        });

        SnapshotFile {
            version: 1,
            generated_at: rfc3339(now),
            idle_timeout_sec: self.opts.idle_timeout.as_secs(),
            ips: records,
        }
    }

    #[cfg(test)]
    fn contains(&self, src_ip: &str) -> bool {
        self.ips.lock().contains_key(src_ip)
    }
}

/// Activity snapshot as published to disk.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub version: u32,
    pub generated_at: String,
    pub idle_timeout_sec: u64,
    pub ips: Vec<IpRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpRecord {
    pub src_ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub machine: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    pub first_seen: String,
    pub last_activity: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub identity_seen: String,
    pub idle_seconds: u64,
    #[serde(skip_serializing_if = "is_zero")]
    pub identity_idle_seconds: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub bytes_total: u64,
    pub active_conns: u32,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// Writes the snapshot to `path` atomically: the content lands in `path.tmp`
/// first and is renamed over the target, so a reader only ever sees the
/// complete previous or the complete next version.
pub fn write_snapshot_atomic(path: &Path, snapshot: &SnapshotFile) -> std::io::Result<()> {
    let mut data = serde_json::to_vec(snapshot).map_err(std::io::Error::other)?;
    data.push(b'\n');

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, &data)?;
    std::fs::rename(&tmp, path)
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Elapsed wall time, floored at zero when `since` is in the future.
fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Canonicalizes an IP string by parsing and re-stringifying it. Invalid
/// input yields `None` and the caller drops the operation.
fn normalize_src_ip(src_ip: &str) -> Option<String> {
    src_ip
        .trim()
        .parse::<std::net::IpAddr>()
        .ok()
        .map(|ip| ip.to_string())
}

/// Strips control characters, clamps to 128 characters and trims surrounding
/// whitespace.
pub fn sanitize_identity_field(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_control())
        .take(128)
        .collect();
    cleaned.trim().to_string()
}
