//! Device identifier parsing.
//!
//! `pcie:<path>` (default `pcie:/dev/m2sdr0`), `eth:<ip>[:<port>]`
//! (default `eth:192.168.1.50:1234`), or a bare `<path>`/`<ip>` classified
//! by shape: an absolute path means PCIe, an IP address means Ethernet.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Default character-device node.
pub const DEFAULT_PCIE_PATH: &str = "/dev/m2sdr0";
/// Default Ethernet peer.
pub const DEFAULT_ETH_ADDR: &str = "192.168.1.50";
/// Default Etherbone/streaming port.
pub const DEFAULT_ETH_PORT: u16 = m2sdr_udp::DEFAULT_PORT;

/// A parsed device identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceId {
    Pcie(PathBuf),
    Eth(SocketAddr),
}

impl Default for DeviceId {
    fn default() -> Self {
        DeviceId::Pcie(PathBuf::from(DEFAULT_PCIE_PATH))
    }
}

impl DeviceId {
    /// Parses an identifier string. An empty string yields the default
    /// PCIe device.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(DeviceId::default());
        }
        if let Some(rest) = s.strip_prefix("pcie:") {
            let path = if rest.is_empty() { DEFAULT_PCIE_PATH } else { rest };
            return Ok(DeviceId::Pcie(PathBuf::from(path)));
        }
        if let Some(rest) = s.strip_prefix("eth:") {
            let spec = if rest.is_empty() { DEFAULT_ETH_ADDR } else { rest };
            return Self::parse_eth(spec);
        }
        if s.starts_with('/') {
            return Ok(DeviceId::Pcie(PathBuf::from(s)));
        }
        if s.parse::<IpAddr>().is_ok() || s.contains(':') {
            return Self::parse_eth(s);
        }
        Err(Error::InvalidArgument(format!(
            "unrecognized device identifier '{s}'"
        )))
    }

    fn parse_eth(spec: &str) -> Result<Self> {
        // `ip` or `ip:port`.
        if let Ok(ip) = spec.parse::<IpAddr>() {
            return Ok(DeviceId::Eth(SocketAddr::new(ip, DEFAULT_ETH_PORT)));
        }
        if let Ok(addr) = spec.parse::<SocketAddr>() {
            return Ok(DeviceId::Eth(addr));
        }
        let (host, port) = spec
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("bad ethernet address '{spec}'")))?;
        let ip: IpAddr = host
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad ip address '{host}'")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad port '{port}'")))?;
        Ok(DeviceId::Eth(SocketAddr::new(ip, port)))
    }
}

impl std::str::FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceId::Pcie(path) => write!(f, "pcie:{}", path.display()),
            DeviceId::Eth(addr) => write!(f, "eth:{addr}"),
        }
    }
}
