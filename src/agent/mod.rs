use crate::tracker::sanitize_identity_field;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Identity reported by an endpoint agent heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub machine: String,
    pub username: String,
    pub last_seen: DateTime<Utc>,
}

/// Short-TTL map from source IP to the last reported (machine, username).
///
/// Independent from the activity tracker's identity store; the heartbeat
/// endpoint writes to both.
pub struct Registry {
    ttl: Duration,
    ips: Mutex<HashMap<String, Info>>,
}

impl Registry {
    /// A zero TTL falls back to five minutes.
    pub fn new(ttl: Duration) -> Self {
        let ttl = if ttl.is_zero() {
            Duration::from_secs(300)
        } else {
            ttl
        };
        Self {
            ttl,
            ips: Mutex::new(HashMap::new()),
        }
    }

    /// Records a heartbeat for `src_ip`, replacing any previous entry.
    pub fn update(&self, src_ip: &str, machine: &str, username: &str, now: DateTime<Utc>) {
        let Some(src_ip) = normalize_ip(src_ip) else {
            return;
        };
        let info = Info {
            machine: sanitize_identity_field(machine),
            username: sanitize_identity_field(username),
            last_seen: now,
        };
        self.ips.lock().insert(src_ip, info);
    }

    /// Returns the identity for `src_ip` if it is still fresh; a stale entry
    /// is deleted on the way out.
    pub fn lookup(&self, src_ip: &str, now: DateTime<Utc>) -> Option<Info> {
        let src_ip = normalize_ip(src_ip)?;

        let mut ips = self.ips.lock();
        let info = ips.get(&src_ip)?;
        if stale(info.last_seen, now, self.ttl) {
            ips.remove(&src_ip);
            return None;
        }
        Some(info.clone())
    }

    /// Purges every stale entry.
    pub fn gc(&self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        self.ips
            .lock()
            .retain(|_, info| !stale(info.last_seen, now, ttl));
    }
}

fn stale(last_seen: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    (now - last_seen).to_std().unwrap_or(Duration::ZERO) > ttl
}

fn normalize_ip(ip: &str) -> Option<String> {
    ip.trim()
        .parse::<std::net::IpAddr>()
        .ok()
        .map(|ip| ip.to_string())
}
