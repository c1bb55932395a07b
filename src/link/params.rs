//! Link parameter codec.
//!
//! A link is shaped by three numbers: bandwidth (mbit/s), burst (kilobytes)
//! and latency (milliseconds). The routing cost of a link is the inverse of
//! its bandwidth, so paths made of fast hops are preferred and a path's cost
//! is the sum of its per-hop costs.
//!
//! In the persisted snapshot the parameters are stored as the positional
//! triple `[bandwidth, burst, latency]`. On the command line they are written
//! as `10mbit/32kb/5ms` (units optional).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ControllerError;

/// Latency budget given to the token bucket filter before it drops packets.
const TBF_LATENCY: &str = "10ms";

/// Shaping parameters applied to both interfaces of a link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "(f64, f64, f64)", into = "(f64, f64, f64)")]
pub struct LinkParams {
    bandwidth: f64,
    burst: f64,
    latency: f64,
}

impl LinkParams {
    /// Validate and build link parameters.
    ///
    /// Bandwidth and burst must be strictly positive, latency non-negative,
    /// and all three finite.
    pub fn new(bandwidth: f64, burst: f64, latency: f64) -> Result<Self, ControllerError> {
        if !bandwidth.is_finite() || bandwidth <= 0.0 {
            return Err(ControllerError::invalid(format!(
                "bandwidth must be a positive number of mbit/s, got {}",
                bandwidth
            )));
        }
        // The path cost 1/bandwidth must stay finite
        if !(1.0 / bandwidth).is_finite() {
            return Err(ControllerError::invalid(format!(
                "bandwidth {} is too small to route over",
                bandwidth
            )));
        }
        if !burst.is_finite() || burst <= 0.0 {
            return Err(ControllerError::invalid(format!(
                "burst must be a positive number of kb, got {}",
                burst
            )));
        }
        if !latency.is_finite() || latency < 0.0 {
            return Err(ControllerError::invalid(format!(
                "latency must be a non-negative number of ms, got {}",
                latency
            )));
        }
        Ok(Self {
            bandwidth,
            burst,
            latency,
        })
    }

    pub fn bandwidth(&self) -> f64 {
        self.bandwidth
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    pub fn latency(&self) -> f64 {
        self.latency
    }

    /// Routing cost of traversing this link once.
    pub fn cost(&self) -> f64 {
        1.0 / self.bandwidth
    }

    /// Commands that install the bandwidth and latency qdiscs on `interface`.
    pub fn shaping_commands(&self, interface: &str) -> [String; 2] {
        [
            format!(
                "tc qdisc add dev {} root handle 1: tbf rate {}mbit burst {}kb latency {}",
                interface, self.bandwidth, self.burst, TBF_LATENCY
            ),
            format!(
                "tc qdisc add dev {} parent 1:1 handle 10: netem delay {}ms",
                interface, self.latency
            ),
        ]
    }

    /// Commands that remove whatever qdiscs `shaping_commands` left behind.
    pub fn clear_commands(interface: &str) -> [String; 2] {
        [
            format!("tc qdisc del dev {} parent 1:1 handle 10", interface),
            format!("tc qdisc del dev {} root", interface),
        ]
    }
}

impl TryFrom<(f64, f64, f64)> for LinkParams {
    type Error = ControllerError;

    fn try_from((bandwidth, burst, latency): (f64, f64, f64)) -> Result<Self, Self::Error> {
        Self::new(bandwidth, burst, latency)
    }
}

impl From<LinkParams> for (f64, f64, f64) {
    fn from(params: LinkParams) -> Self {
        (params.bandwidth, params.burst, params.latency)
    }
}

impl fmt::Display for LinkParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}mbit/{}kb/{}ms", self.bandwidth, self.burst, self.latency)
    }
}

impl FromStr for LinkParams {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        let [bandwidth, burst, latency] = parts.as_slice() else {
            return Err(ControllerError::invalid(format!(
                "expected <bandwidth>/<burst>/<latency>, got '{}'",
                s
            )));
        };
        Self::new(
            parse_quantity(bandwidth, "mbit")?,
            parse_quantity(burst, "kb")?,
            parse_quantity(latency, "ms")?,
        )
    }
}

fn parse_quantity(value: &str, unit: &str) -> Result<f64, ControllerError> {
    let value = value.trim();
    let number = value.strip_suffix(unit).unwrap_or(value).trim();
    number
        .parse::<f64>()
        .map_err(|_| ControllerError::invalid(format!("invalid {} quantity '{}'", unit, value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_is_inverse_bandwidth() {
        let params = LinkParams::new(10.0, 32.0, 5.0).unwrap();
        assert!((params.cost() - 0.1).abs() < 1e-12);

        let unit = LinkParams::new(1.0, 1.0, 0.0).unwrap();
        assert_eq!(unit.cost(), 1.0);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            LinkParams::new(0.0, 32.0, 5.0),
            Err(ControllerError::InvalidParameter(_))
        ));
        assert!(LinkParams::new(-1.0, 32.0, 5.0).is_err());
        assert!(LinkParams::new(f64::NAN, 32.0, 5.0).is_err());
        assert!(LinkParams::new(10.0, 0.0, 5.0).is_err());
        assert!(LinkParams::new(10.0, 32.0, -1.0).is_err());
        assert!(LinkParams::new(10.0, 32.0, 0.0).is_ok());
    }

    #[test]
    fn test_rejects_bandwidth_with_infinite_cost() {
        assert!(matches!(
            LinkParams::new(1e-320, 32.0, 5.0),
            Err(ControllerError::InvalidParameter(_))
        ));
        assert!("1e-320/32/5".parse::<LinkParams>().is_err());
        assert!(serde_json::from_str::<LinkParams>("[1e-320, 32.0, 5.0]").is_err());

        let small = LinkParams::new(1e-300, 32.0, 5.0).unwrap();
        assert!(small.cost().is_finite());
    }

    #[test]
    fn test_parse_with_and_without_units() {
        let params: LinkParams = "10mbit/32kb/5ms".parse().unwrap();
        assert_eq!(params, LinkParams::new(10.0, 32.0, 5.0).unwrap());

        let bare: LinkParams = "2.5/8/0".parse().unwrap();
        assert_eq!(bare.bandwidth(), 2.5);
        assert_eq!(bare.latency(), 0.0);

        assert!("10mbit/32kb".parse::<LinkParams>().is_err());
        assert!("fast/32kb/5ms".parse::<LinkParams>().is_err());
        assert!("0mbit/32kb/5ms".parse::<LinkParams>().is_err());

        assert_eq!(params.to_string(), "10mbit/32kb/5ms");
    }

    #[test]
    fn test_json_form_is_positional_triple() {
        let params = LinkParams::new(10.0, 32.0, 5.0).unwrap();
        assert_eq!(serde_json::to_string(&params).unwrap(), "[10.0,32.0,5.0]");

        let decoded: LinkParams = serde_json::from_str("[5, 16, 1]").unwrap();
        assert_eq!(decoded, LinkParams::new(5.0, 16.0, 1.0).unwrap());

        assert!(serde_json::from_str::<LinkParams>("[0, 16, 1]").is_err());
    }

    #[test]
    fn test_shaping_commands() {
        let params = LinkParams::new(10.0, 32.0, 5.0).unwrap();
        let [tbf, netem] = params.shaping_commands("eth1");
        assert_eq!(
            tbf,
            "tc qdisc add dev eth1 root handle 1: tbf rate 10mbit burst 32kb latency 10ms"
        );
        assert_eq!(netem, "tc qdisc add dev eth1 parent 1:1 handle 10: netem delay 5ms");

        let [child, root] = LinkParams::clear_commands("eth1");
        assert_eq!(child, "tc qdisc del dev eth1 parent 1:1 handle 10");
        assert_eq!(root, "tc qdisc del dev eth1 root");
    }
}
