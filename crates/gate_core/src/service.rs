//! Service registration and protocol demultiplexing.
//!
//! A [`ServicePort`] owns one listening port and the list of [`Service`]s
//! reachable through it. A port with exactly one service binds a handler the
//! moment a socket is accepted; a port with several services waits for the
//! first framed payload and matches its identifier byte against each service.
//! The connection layer never learns protocol semantics, only the lifecycle
//! contract expressed by [`ProtocolHandler`].

use crate::connection::Connection;
use crate::error::{GateError, Result};
use crate::message::{NetworkMessage, OutputMessage};
use async_trait::async_trait;
use std::sync::Arc;

/// Message-lifecycle contract implemented by the application layer.
///
/// Hook order for a session: `on_connect` once, `on_recv_first_message` once,
/// then `on_recv_message` per framed payload in arrival order, and finally
/// `release` exactly once on disconnect. `on_send_message` runs synchronously
/// just before each queued message is physically written.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Invoked once, right after the handler is bound, before any payload is
    /// dispatched to it.
    async fn on_connect(&self) {}

    /// First framed payload of the session, identifier and checksum bytes
    /// already stripped as appropriate. Returning an error rejects the
    /// session and disconnects the peer.
    async fn on_recv_first_message(&self, msg: NetworkMessage) -> Result<()>;

    /// Every subsequent framed payload, in arrival order.
    async fn on_recv_message(&self, msg: NetworkMessage) -> Result<()>;

    /// Last-moment mutation hook (e.g. appending a trailer) before `msg` is
    /// written to the socket.
    fn on_send_message(&self, msg: &mut OutputMessage) {
        let _ = msg;
    }

    /// Invoked once on disconnect; the handler must not touch the connection
    /// afterwards.
    async fn release(&self) {}
}

/// Factory contract for a registered protocol.
pub trait Service: Send + Sync {
    /// One-byte identifier matched against the first payload byte on
    /// multi-service ports.
    fn protocol_identifier(&self) -> u8;

    /// Human-readable protocol name, for diagnostics only.
    fn protocol_name(&self) -> &'static str;

    /// Whether this service requires sole ownership of its listening port.
    fn is_single_socket(&self) -> bool;

    /// Whether the checksum slot carries a validated adler-32 checksum.
    fn is_checksummed(&self) -> bool;

    /// Produces a handler bound to `connection`.
    fn make_handler(&self, connection: Arc<Connection>) -> Arc<dyn ProtocolHandler>;
}

/// One listening port plus the services registered on it.
///
/// Invariant: either exactly one service (protocol assumed without peeking)
/// or two or more (protocol chosen by the first payload byte). A
/// single-socket service can never share a port.
pub struct ServicePort {
    port: u16,
    services: Vec<Arc<dyn Service>>,
}

impl ServicePort {
    pub fn new(port: u16) -> Self {
        Self { port, services: Vec::new() }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registers a service on this port, enforcing the exclusivity invariant.
    pub fn add_service(&mut self, service: Arc<dyn Service>) -> Result<()> {
        if self.services.iter().any(|s| s.is_single_socket()) {
            return Err(GateError::ServiceRegistration(format!(
                "port {} is owned by a single-socket service",
                self.port
            )));
        }
        if service.is_single_socket() && !self.services.is_empty() {
            return Err(GateError::ServiceRegistration(format!(
                "single-socket service {} cannot share port {}",
                service.protocol_name(),
                self.port
            )));
        }
        if self
            .services
            .iter()
            .any(|s| s.protocol_identifier() == service.protocol_identifier())
        {
            return Err(GateError::ServiceRegistration(format!(
                "duplicate protocol identifier 0x{:02x} on port {}",
                service.protocol_identifier(),
                self.port
            )));
        }
        self.services.push(service);
        Ok(())
    }

    /// Whether a handler can be bound at accept time without peeking.
    pub fn is_single_service(&self) -> bool {
        self.services.len() == 1
    }

    /// The sole service on a single-service port.
    pub fn sole_service(&self) -> Option<&Arc<dyn Service>> {
        if self.is_single_service() {
            self.services.first()
        } else {
            None
        }
    }

    /// Matches a protocol identifier byte against the registered services.
    pub fn find_service(&self, identifier: u8) -> Option<&Arc<dyn Service>> {
        self.services.iter().find(|s| s.protocol_identifier() == identifier)
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeService {
        identifier: u8,
        single: bool,
    }

    impl Service for FakeService {
        fn protocol_identifier(&self) -> u8 {
            self.identifier
        }

        fn protocol_name(&self) -> &'static str {
            "fake"
        }

        fn is_single_socket(&self) -> bool {
            self.single
        }

        fn is_checksummed(&self) -> bool {
            false
        }

        fn make_handler(&self, _connection: Arc<Connection>) -> Arc<dyn ProtocolHandler> {
            unreachable!("registration tests never build handlers")
        }
    }

    fn service(identifier: u8, single: bool) -> Arc<dyn Service> {
        Arc::new(FakeService { identifier, single })
    }

    #[test]
    fn test_single_then_multi_classification() {
        let mut port = ServicePort::new(7171);
        port.add_service(service(0x01, false)).unwrap();
        assert!(port.is_single_service());

        port.add_service(service(0x02, false)).unwrap();
        assert!(!port.is_single_service());
        assert!(port.sole_service().is_none());

        assert_eq!(port.find_service(0x02).unwrap().protocol_identifier(), 0x02);
        assert!(port.find_service(0x7f).is_none());
    }

    #[test]
    fn test_single_socket_service_owns_its_port() {
        let mut port = ServicePort::new(7172);
        port.add_service(service(0x0a, true)).unwrap();
        assert!(port.add_service(service(0x0b, false)).is_err());

        let mut shared = ServicePort::new(7173);
        shared.add_service(service(0x0a, false)).unwrap();
        assert!(shared.add_service(service(0x0b, true)).is_err());
    }

    #[test]
    fn test_duplicate_identifier_rejected() {
        let mut port = ServicePort::new(7174);
        port.add_service(service(0x01, false)).unwrap();
        assert!(port.add_service(service(0x01, false)).is_err());
    }
}
