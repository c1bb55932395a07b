//! Live link statistics.
//!
//! Parses the output of `tc -s qdisc show dev <iface>` as run on a node, so
//! an operator can see how much traffic a shaped link carried and how much
//! of it the shaper dropped.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// Counters reported for one queueing discipline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QdiscStats {
    /// Qdisc kind, e.g. `tbf` or `netem`
    pub kind: String,
    /// Qdisc handle, e.g. `1:`
    pub handle: String,
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub dropped: u64,
    pub overlimits: u64,
    pub requeues: u64,
    pub backlog_bytes: u64,
    pub backlog_packets: u64,
}

/// Build the command that dumps qdisc counters of an interface.
pub fn stats_command(interface: &str) -> String {
    format!("tc -s qdisc show dev {}", interface)
}

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^qdisc\s+(\S+)\s+(\S+)").expect("valid regex"))
}

fn sent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"Sent\s+(\d+)\s+bytes\s+(\d+)\s+pkts?\s+\(dropped\s+(\d+),\s+overlimits\s+(\d+)\s+requeues\s+(\d+)\)",
        )
        .expect("valid regex")
    })
}

fn backlog_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"backlog\s+(\d+)b\s+(\d+)p").expect("valid regex"))
}

fn capture_u64(caps: &regex::Captures<'_>, index: usize) -> u64 {
    caps.get(index)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Parse `tc -s qdisc show` output into one entry per qdisc.
///
/// Lines that do not belong to a recognised qdisc block are ignored.
pub fn parse_qdisc_stats(output: &str) -> Vec<QdiscStats> {
    let mut result: Vec<QdiscStats> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(caps) = header_re().captures(line) {
            result.push(QdiscStats {
                kind: caps[1].to_string(),
                handle: caps[2].to_string(),
                ..Default::default()
            });
            continue;
        }

        let Some(current) = result.last_mut() else {
            continue;
        };
        if let Some(caps) = sent_re().captures(line) {
            current.sent_bytes = capture_u64(&caps, 1);
            current.sent_packets = capture_u64(&caps, 2);
            current.dropped = capture_u64(&caps, 3);
            current.overlimits = capture_u64(&caps, 4);
            current.requeues = capture_u64(&caps, 5);
        } else if let Some(caps) = backlog_re().captures(line) {
            current.backlog_bytes = capture_u64(&caps, 1);
            current.backlog_packets = capture_u64(&caps, 2);
        }
    }

    result
}
