//! Link shaping parameters and live link statistics.

pub mod params;
pub mod stats;

pub use params::LinkParams;
pub use stats::{parse_qdisc_stats, stats_command, QdiscStats};
