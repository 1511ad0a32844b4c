mod parser;

pub use parser::{load_rules, parse_rules, RuleError};

use arc_swap::ArcSwap;
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Action to take for a matching connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Allow,
    Block,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "ALLOW",
            Action::Block => "BLOCK",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hostname pattern, either a literal name or a leading wildcard
/// (`*.example.com`). Stored lowercased; matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPattern(String);

impl HostPattern {
    pub fn new(pattern: &str) -> Self {
        Self(pattern.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Matches `hostname` (already lowercased by the caller) against this
    /// pattern. `*.example.com` matches both `example.com` and anything
    /// ending in `.example.com`.
    pub fn matches(&self, hostname: &str) -> bool {
        let pattern = self.0.as_str();
        if pattern == hostname {
            return true;
        }

        if let Some(bare) = pattern.strip_prefix("*.") {
            let suffix = &pattern[1..]; // keep the leading dot
            if hostname.ends_with(suffix) {
                return true;
            }
            if hostname == bare {
                return true;
            }
        }

        false
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Standalone rule in the legacy flat dialect: action + source network + pattern.
#[derive(Debug, Clone)]
pub struct FlatRule {
    pub action: Action,
    pub source: IpNetwork,
    pub pattern: HostPattern,
}

/// Rule scoped to a group: action + pattern, applied to the group's members.
#[derive(Debug, Clone)]
pub struct GroupRule {
    pub action: Action,
    pub pattern: HostPattern,
}

/// Named set of source networks with its own scoped rule list.
/// Groups keep file order; the first group containing a source IP wins.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub members: Vec<IpNetwork>,
    pub rules: Vec<GroupRule>,
}

impl Group {
    fn contains(&self, ip: IpAddr) -> bool {
        self.members.iter().any(|net| net.contains(ip))
    }
}

/// Outcome of a rule evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    /// Name of the group that owned the decision, empty for flat rules.
    pub group: String,
    /// Whether an actual rule matched (false for default-allow).
    pub matched: bool,
}

/// Immutable collection of groups plus legacy flat rules.
/// Replaced wholesale on reload, never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub groups: Vec<Group>,
    pub flat: Vec<FlatRule>,
}

impl RuleSet {
    /// Evaluates `(source_ip, hostname)` against the set.
    ///
    /// Groups are walked in file order; the first group whose members contain
    /// the IP owns the decision. Within a scope Allow beats Block. An IP that
    /// belongs to a group but matches none of its rules is allowed by
    /// default. Only IPs outside every group fall through to the flat rules.
    pub fn match_decision(&self, source_ip: IpAddr, hostname: &str) -> Decision {
        let hostname = hostname.trim().to_ascii_lowercase();

        for group in &self.groups {
            if !group.contains(source_ip) {
                continue;
            }

            let mut block_matched = false;
            for rule in &group.rules {
                if rule.pattern.matches(&hostname) {
                    if rule.action == Action::Allow {
                        return Decision {
                            action: Action::Allow,
                            group: group.name.clone(),
                            matched: true,
                        };
                    }
                    block_matched = true;
                }
            }

            return Decision {
                action: if block_matched {
                    Action::Block
                } else {
                    Action::Allow
                },
                group: group.name.clone(),
                matched: block_matched,
            };
        }

        let mut block_matched = false;
        for rule in &self.flat {
            if rule.source.contains(source_ip) && rule.pattern.matches(&hostname) {
                if rule.action == Action::Allow {
                    return Decision {
                        action: Action::Allow,
                        group: String::new(),
                        matched: true,
                    };
                }
                block_matched = true;
            }
        }

        Decision {
            action: if block_matched {
                Action::Block
            } else {
                Action::Allow
            },
            group: String::new(),
            matched: block_matched,
        }
    }

    /// Total number of rules across groups and the flat list.
    pub fn rule_count(&self) -> usize {
        self.groups.iter().map(|g| g.rules.len()).sum::<usize>() + self.flat.len()
    }
}

/// Serializes the set back into the rules-file dialect. Parsing the output
/// yields the same set of (action, group, network, pattern) tuples.
impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for group in &self.groups {
            writeln!(f, "GROUP;{}", group.name)?;
            for member in &group.members {
                writeln!(f, "MEMBER;{}", member)?;
            }
            for rule in &group.rules {
                writeln!(f, "{};{}", rule.action, rule.pattern)?;
            }
        }
        for rule in &self.flat {
            writeln!(f, "{};{};{}", rule.action, rule.source, rule.pattern)?;
        }
        Ok(())
    }
}

/// Hot-swappable rule set bound to a file path.
///
/// Readers grab the current `Arc<RuleSet>` for the duration of one match
/// call; `reload` parses into a fresh set and swaps the reference, so
/// in-flight readers see either entirely the old or entirely the new set.
pub struct SharedRules {
    path: PathBuf,
    inner: ArcSwap<RuleSet>,
}

impl SharedRules {
    /// Loads the rules file; any parse error aborts the load.
    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let set = load_rules(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: ArcSwap::from_pointee(set),
        })
    }

    /// Re-parses the file and swaps the set atomically. On failure the prior
    /// set remains active and the error is returned for the caller to log.
    pub fn reload(&self) -> Result<usize, RuleError> {
        let set = load_rules(&self.path)?;
        let count = set.rule_count();
        self.inner.store(Arc::new(set));
        debug!("rules swapped: {} rules active", count);
        Ok(count)
    }

    pub fn match_decision(&self, source_ip: IpAddr, hostname: &str) -> Decision {
        self.inner.load().match_decision(source_ip, hostname)
    }

    pub fn rule_count(&self) -> usize {
        self.inner.load().rule_count()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current set, for inspection and the startup dump.
    pub fn current(&self) -> Arc<RuleSet> {
        self.inner.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn decision(set: &RuleSet, src: &str, host: &str) -> (Action, String, bool) {
        let d = set.match_decision(ip(src), host);
        (d.action, d.group, d.matched)
    }

    #[test]
    fn test_host_pattern_literal() {
        let p = HostPattern::new("example.com");
        assert!(p.matches("example.com"));
        assert!(!p.matches("www.example.com"));
    }

    #[test]
    fn test_host_pattern_wildcard() {
        let p = HostPattern::new("*.example.com");
        assert!(p.matches("www.example.com"));
        assert!(p.matches("sub.www.example.com"));
        assert!(p.matches("example.com"));
        assert!(!p.matches("otherexample.com"));

        let p = HostPattern::new("*.sub.example.com");
        assert!(p.matches("www.sub.example.com"));
        assert!(!p.matches("example.com"));
    }

    #[test]
    fn test_host_pattern_case_insensitive() {
        let p = HostPattern::new("*.Example.COM");
        assert_eq!(p.as_str(), "*.example.com");
        assert!(p.matches("www.example.com"));
    }

    #[test]
    fn test_first_group_wins_over_later_allow() {
        // Group order breaks ties for IP membership: 192.168.1.50 belongs to
        // g1's /24 first, so g2's ALLOW never runs.
        let set = parse_rules(
            "GROUP;g1\n\
             MEMBER;192.168.1.0/24\n\
             BLOCK;*.facebook.com\n\
             GROUP;g2\n\
             MEMBER;192.168.1.50\n\
             ALLOW;*.facebook.com\n",
        )
        .unwrap();

        assert_eq!(
            decision(&set, "192.168.1.50", "www.facebook.com"),
            (Action::Block, "g1".to_string(), true)
        );
        assert_eq!(
            decision(&set, "192.168.1.100", "www.facebook.com"),
            (Action::Block, "g1".to_string(), true)
        );
    }

    #[test]
    fn test_allow_beats_block_within_group() {
        let set = parse_rules(
            "GROUP;office\n\
             MEMBER;10.0.0.0/8\n\
             BLOCK;*.example.com\n\
             ALLOW;*.example.com\n",
        )
        .unwrap();

        assert_eq!(
            decision(&set, "10.1.2.3", "www.example.com"),
            (Action::Allow, "office".to_string(), true)
        );
    }

    #[test]
    fn test_default_allow_within_group() {
        let set = parse_rules(
            "GROUP;office\n\
             MEMBER;10.0.0.0/8\n\
             BLOCK;*.blocked.com\n",
        )
        .unwrap();

        assert_eq!(
            decision(&set, "10.1.2.3", "www.google.com"),
            (Action::Allow, "office".to_string(), false)
        );
    }

    #[test]
    fn test_wildcard_covers_apex_in_flat_rule() {
        let set = parse_rules("BLOCK;10.0.0.0/8;*.netflix.com\n").unwrap();

        assert_eq!(
            decision(&set, "10.1.2.3", "netflix.com"),
            (Action::Block, String::new(), true)
        );
        assert_eq!(
            decision(&set, "10.1.2.3", "api.netflix.com"),
            (Action::Block, String::new(), true)
        );
        assert_eq!(
            decision(&set, "10.1.2.3", "notnetflix.com"),
            (Action::Allow, String::new(), false)
        );
    }

    #[test]
    fn test_flat_allow_beats_flat_block() {
        let set = parse_rules(
            "BLOCK;192.168.1.0/24;*.facebook.com\n\
             ALLOW;192.168.1.100;*.facebook.com\n",
        )
        .unwrap();

        assert_eq!(
            decision(&set, "192.168.1.100", "www.facebook.com"),
            (Action::Allow, String::new(), true)
        );
        assert_eq!(
            decision(&set, "192.168.1.50", "www.facebook.com"),
            (Action::Block, String::new(), true)
        );
    }

    #[test]
    fn test_groups_evaluated_before_flat_rules() {
        // The IP is in a group whose rules do not match, so the flat BLOCK
        // for the same IP must not apply.
        let set = parse_rules(
            "GROUP;office\n\
             MEMBER;192.168.1.0/24\n\
             BLOCK;*.twitter.com\n\
             BLOCK;192.168.1.0/24;*.facebook.com\n",
        )
        .unwrap();

        assert_eq!(
            decision(&set, "192.168.1.10", "www.facebook.com"),
            (Action::Allow, "office".to_string(), false)
        );
    }

    #[test]
    fn test_no_match_default_allow() {
        let set = parse_rules("BLOCK;10.0.0.50;*.netflix.com\n").unwrap();
        assert_eq!(
            decision(&set, "172.16.0.1", "www.google.com"),
            (Action::Allow, String::new(), false)
        );
    }

    #[test]
    fn test_match_is_case_insensitive_on_hostname() {
        let set = parse_rules("BLOCK;10.0.0.0/8;*.netflix.com\n").unwrap();
        assert_eq!(
            decision(&set, "10.1.2.3", "API.Netflix.COM"),
            (Action::Block, String::new(), true)
        );
    }

    #[test]
    fn test_ipv6_member_match() {
        let set = parse_rules(
            "GROUP;lab\n\
             MEMBER;fd00::/8\n\
             BLOCK;*.example.com\n",
        )
        .unwrap();

        assert_eq!(
            decision(&set, "fd00::1", "www.example.com"),
            (Action::Block, "lab".to_string(), true)
        );
        // A v4 source never matches a v6 member network.
        assert_eq!(
            decision(&set, "10.0.0.1", "www.example.com"),
            (Action::Allow, String::new(), false)
        );
    }

    #[test]
    fn test_round_trip_preserves_rules() {
        let input = "GROUP;g1\n\
                     MEMBER;192.168.1.0/24\n\
                     MEMBER;10.0.0.1/32\n\
                     BLOCK;*.facebook.com\n\
                     ALLOW;mail.example.com\n\
                     GROUP;g2\n\
                     MEMBER;172.16.0.0/12\n\
                     ALLOW;*.example.org\n\
                     BLOCK;10.0.0.0/8;*.netflix.com\n\
                     ALLOW;192.168.5.5/32;api.github.com\n";
        let set = parse_rules(input).unwrap();
        let reparsed = parse_rules(&set.to_string()).unwrap();

        assert_eq!(reparsed.groups.len(), set.groups.len());
        assert_eq!(reparsed.flat.len(), set.flat.len());
        for (a, b) in set.groups.iter().zip(reparsed.groups.iter()) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.members, b.members);
            let ra: Vec<_> = a.rules.iter().map(|r| (r.action, r.pattern.clone())).collect();
            let rb: Vec<_> = b.rules.iter().map(|r| (r.action, r.pattern.clone())).collect();
            assert_eq!(ra, rb);
        }
        for (a, b) in set.flat.iter().zip(reparsed.flat.iter()) {
            assert_eq!(a.action, b.action);
            assert_eq!(a.source, b.source);
            assert_eq!(a.pattern, b.pattern);
        }
    }

    #[test]
    fn test_shared_rules_reload_keeps_prior_on_failure() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.txt");
        std::fs::write(&path, "BLOCK;10.0.0.0/8;*.netflix.com\n").unwrap();

        let shared = SharedRules::load(&path).unwrap();
        assert_eq!(shared.rule_count(), 1);

        // Corrupt the file; reload must fail and leave the old set active.
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "DENY;10.0.0.0/8;*.netflix.com").unwrap();
        drop(f);

        assert!(shared.reload().is_err());
        assert_eq!(shared.rule_count(), 1);
        let d = shared.match_decision(ip("10.1.2.3"), "netflix.com");
        assert_eq!(d.action, Action::Block);
    }
}
