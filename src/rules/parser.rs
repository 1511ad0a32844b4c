use super::{Action, FlatRule, Group, GroupRule, HostPattern, RuleSet};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rules file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {cause}")]
    Parse { line: usize, cause: String },
}

fn parse_err(line: usize, cause: impl Into<String>) -> RuleError {
    RuleError::Parse {
        line,
        cause: cause.into(),
    }
}

/// Reads and parses the rules file at `path`.
pub fn load_rules(path: &Path) -> Result<RuleSet, RuleError> {
    let content = std::fs::read_to_string(path)?;
    parse_rules(&content)
}

/// Parses the rules-file grammar.
///
/// Two dialects coexist: grouped (`GROUP;name` / `MEMBER;net` /
/// `ALLOW|BLOCK;pattern`) and legacy flat (`ALLOW|BLOCK;net;pattern`).
/// `#` starts a comment, also mid-line. Any malformed line aborts the whole
/// load with its line number.
pub fn parse_rules(input: &str) -> Result<RuleSet, RuleError> {
    let mut groups: Vec<Group> = Vec::new();
    let mut flat: Vec<FlatRule> = Vec::new();
    let mut current: Option<Group> = None;

    for (idx, raw) in input.lines().enumerate() {
        let line_num = idx + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(';').map(str::trim).collect();
        let directive = fields[0].to_ascii_uppercase();

        match directive.as_str() {
            "GROUP" => {
                if fields.len() != 2 || fields[1].is_empty() {
                    return Err(parse_err(line_num, "GROUP requires a non-empty name"));
                }
                if let Some(done) = current.take() {
                    groups.push(done);
                }
                current = Some(Group {
                    name: fields[1].to_string(),
                    members: Vec::new(),
                    rules: Vec::new(),
                });
            }
            "MEMBER" => {
                if fields.len() != 2 || fields[1].is_empty() {
                    return Err(parse_err(line_num, "MEMBER requires an IP or CIDR"));
                }
                let group = current
                    .as_mut()
                    .ok_or_else(|| parse_err(line_num, "MEMBER outside of a GROUP"))?;
                let network = parse_network(fields[1])
                    .map_err(|cause| parse_err(line_num, cause))?;
                group.members.push(network);
            }
            "ALLOW" | "BLOCK" => {
                let action = if directive == "ALLOW" {
                    Action::Allow
                } else {
                    Action::Block
                };
                match fields.len() {
                    // Scoped rule: TYPE;HOSTNAME inside an open group.
                    2 => {
                        if fields[1].is_empty() {
                            return Err(parse_err(line_num, "empty hostname pattern"));
                        }
                        let group = current.as_mut().ok_or_else(|| {
                            parse_err(
                                line_num,
                                "invalid rule format: expected TYPE;IP_OR_CIDR;HOSTNAME",
                            )
                        })?;
                        group.rules.push(GroupRule {
                            action,
                            pattern: HostPattern::new(fields[1]),
                        });
                    }
                    // Flat rule: TYPE;IP_OR_CIDR;HOSTNAME.
                    3 => {
                        if fields[2].is_empty() {
                            return Err(parse_err(line_num, "empty hostname pattern"));
                        }
                        let network = parse_network(fields[1])
                            .map_err(|cause| parse_err(line_num, cause))?;
                        flat.push(FlatRule {
                            action,
                            source: network,
                            pattern: HostPattern::new(fields[2]),
                        });
                    }
                    _ => {
                        return Err(parse_err(
                            line_num,
                            "invalid rule format: expected TYPE;IP_OR_CIDR;HOSTNAME",
                        ));
                    }
                }
            }
            other => {
                return Err(parse_err(
                    line_num,
                    format!("invalid rule type: {} (must be ALLOW or BLOCK)", other),
                ));
            }
        }
    }

    if let Some(done) = current.take() {
        groups.push(done);
    }

    Ok(RuleSet { groups, flat })
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Parses an IP address or CIDR. A bare address becomes /32 (or /128 for v6).
fn parse_network(s: &str) -> Result<IpNetwork, String> {
    if s.contains('/') {
        return s
            .parse::<IpNetwork>()
            .map_err(|e| format!("invalid IP/CIDR: {}", e));
    }

    let ip: IpAddr = s
        .parse()
        .map_err(|_| format!("invalid IP address: {}", s))?;
    let prefix = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNetwork::new(ip, prefix).map_err(|e| format!("invalid IP address: {}", e))
}
