//! Built-in status protocol.
//!
//! Answers a one-shot probe with a small report (uptime, live connection
//! count) and hangs up. Useful for monitoring scripts and as the reference
//! implementation of the [`Service`]/[`ProtocolHandler`] contract.

use async_trait::async_trait;
use gate_core::{
    Connection, ConnectionRegistry, NetworkMessage, OutputMessage, ProtocolHandler, Result,
    Service,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Protocol identifier byte for status probes.
pub const STATUS_PROTOCOL_ID: u8 = 0xff;

pub struct StatusService {
    registry: Arc<ConnectionRegistry>,
    started: Instant,
}

impl StatusService {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry, started: Instant::now() }
    }
}

impl Service for StatusService {
    fn protocol_identifier(&self) -> u8 {
        STATUS_PROTOCOL_ID
    }

    fn protocol_name(&self) -> &'static str {
        "status"
    }

    fn is_single_socket(&self) -> bool {
        // Owns its port outright; probes never carry an identifier byte.
        true
    }

    fn is_checksummed(&self) -> bool {
        false
    }

    fn make_handler(&self, connection: Arc<Connection>) -> Arc<dyn ProtocolHandler> {
        Arc::new(StatusHandler {
            connection,
            registry: Arc::clone(&self.registry),
            started: self.started,
        })
    }
}

struct StatusHandler {
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    started: Instant,
}

#[async_trait]
impl ProtocolHandler for StatusHandler {
    async fn on_recv_first_message(&self, _msg: NetworkMessage) -> Result<()> {
        debug!(addr = %self.connection.remote_addr(), "status probe");

        let mut reply = OutputMessage::new();
        reply.put_u64(self.started.elapsed().as_secs())?;
        reply.put_u32(self.registry.len() as u32)?;
        self.connection.send_message(reply)?;

        // One request, one reply; the write queue drains before the socket
        // actually closes.
        self.connection.disconnect().await;
        Ok(())
    }

    async fn on_recv_message(&self, _msg: NetworkMessage) -> Result<()> {
        // A probe that keeps talking after the report is misbehaving.
        Err(gate_core::GateError::Closed)
    }
}
