//! Runtime configuration for the ingress layer.
//!
//! Values only; loading them from a file and wiring them to CLI flags is the
//! composition root's job (see the `gatehouse` crate).

use crate::admission::AdmissionConfig;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Configuration consumed by [`GateServer`](crate::server::GateServer) and
/// every [`Connection`](crate::connection::Connection) it accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Address the listening sockets bind to.
    pub bind_ip: IpAddr,

    /// Seconds a pending read may sit before the watchdog kills the connection.
    pub read_timeout_secs: u64,

    /// Seconds a pending write may sit before the watchdog kills the connection.
    pub write_timeout_secs: u64,

    /// Packets-per-second ceiling applied to sessions past admission control.
    pub max_packets_per_second: u32,

    /// Hard cap on simultaneously tracked connections.
    pub max_connections: usize,

    /// Scale accept loops across CPU cores with SO_REUSEPORT where supported.
    pub use_reuse_port: bool,

    /// Accept-time flood/backoff tunables.
    pub admission: AdmissionConfig,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            read_timeout_secs: 30,
            write_timeout_secs: 30,
            max_packets_per_second: 50,
            max_connections: 1_000,
            use_reuse_port: false,
            admission: AdmissionConfig::default(),
        }
    }
}

impl GateConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}
