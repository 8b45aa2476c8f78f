//! Server core: listener setup, accept loops, and shutdown coordination.
//!
//! `GateServer` owns the composition of the ingress layer — the connection
//! registry, the admission table, and one [`ServicePort`] per listening port.
//! It contains no protocol logic; the application layer registers services
//! and everything else flows through the lifecycle contract.

use crate::admission::AddressBlockTable;
use crate::config::GateConfig;
use crate::connection::Connection;
use crate::error::{GateError, Result};
use crate::registry::ConnectionRegistry;
use crate::service::{Service, ServicePort};
use futures::stream::{FuturesUnordered, StreamExt};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// The network ingress server.
///
/// Accepts TCP connections, applies accept-time admission control, and hands
/// each surviving socket to a [`Connection`] bound to the right
/// [`ServicePort`]. Runs until [`shutdown`](Self::shutdown) is called, at
/// which point every live connection is hard-stopped.
pub struct GateServer {
    config: Arc<GateConfig>,
    registry: Arc<ConnectionRegistry>,
    admission: Arc<AddressBlockTable>,
    ports: Mutex<HashMap<u16, ServicePort>>,
    bound_addrs: Mutex<Vec<SocketAddr>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GateServer {
    pub fn new(config: GateConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.max_connections));
        let admission = Arc::new(AddressBlockTable::new(config.admission.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            registry,
            admission,
            ports: Mutex::new(HashMap::new()),
            bound_addrs: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Registers `service` on `port`, creating the port on first use.
    /// Registration must finish before [`start`](Self::start).
    pub fn register_service(&self, port: u16, service: Arc<dyn Service>) -> Result<()> {
        let mut ports = self.ports.lock().expect("port table lock poisoned");
        let service_port = ports.entry(port).or_insert_with(|| ServicePort::new(port));
        info!(port, protocol = service.protocol_name(), "service registered");
        service_port.add_service(service)
    }

    /// Binds every registered port and runs the accept loops until shutdown.
    pub async fn start(&self) -> Result<()> {
        let ports: Vec<Arc<ServicePort>> = {
            let mut table = self.ports.lock().expect("port table lock poisoned");
            table.drain().map(|(_, port)| Arc::new(port)).collect()
        };
        if ports.is_empty() {
            return Err(GateError::Network("no services registered".into()));
        }

        let acceptors_per_port = if self.config.use_reuse_port { num_cpus::get() } else { 1 };
        info!(
            bind_ip = %self.config.bind_ip,
            ports = ports.len(),
            acceptors_per_port,
            "🚀 starting ingress server"
        );

        let mut accept_futures = FuturesUnordered::new();
        for service_port in &ports {
            let addr = SocketAddr::new(self.config.bind_ip, service_port.port());
            for _ in 0..acceptors_per_port {
                let listener = build_listener(addr, self.config.use_reuse_port)?;
                let local = listener.local_addr().map_err(GateError::Io)?;
                self.bound_addrs.lock().expect("bound addrs lock poisoned").push(local);
                info!(%local, services = service_port.service_count(), "✅ listener bound");

                accept_futures.push(accept_loop(
                    listener,
                    Arc::clone(service_port),
                    Arc::clone(&self.registry),
                    Arc::clone(&self.admission),
                    Arc::clone(&self.config),
                ));
            }
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::select! {
            _ = accept_futures.next() => {
                error!("accept loop terminated unexpectedly");
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown signal received");
            }
        }

        self.registry.disconnect_all().await;
        info!("server stopped");
        Ok(())
    }

    /// Signals the accept loops to stop; `start` then hard-stops every
    /// connection and returns.
    pub fn shutdown(&self) {
        info!("🛑 shutting down ingress server");
        let _ = self.shutdown_tx.send(());
    }

    /// Addresses actually bound, available once `start` has set them up.
    /// With port 0 this reports the OS-assigned ports.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.bound_addrs.lock().expect("bound addrs lock poisoned").clone()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// The live-connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The accept-time admission table.
    pub fn admission(&self) -> &Arc<AddressBlockTable> {
        &self.admission
    }
}

async fn accept_loop(
    listener: TcpListener,
    service_port: Arc<ServicePort>,
    registry: Arc<ConnectionRegistry>,
    admission: Arc<AddressBlockTable>,
    config: Arc<GateConfig>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                // Admission runs before any per-connection state exists; a
                // rejected attempt allocates nothing.
                if !admission.check(addr.ip()) {
                    debug!(%addr, "connection attempt rejected by admission control");
                    continue;
                }
                if registry.is_full() {
                    warn!(%addr, "connection limit reached, refusing socket");
                    continue;
                }
                Connection::accept(
                    stream,
                    addr,
                    Arc::clone(&service_port),
                    Arc::clone(&registry),
                    Arc::clone(&config),
                );
            }
            Err(err) => {
                error!(port = service_port.port(), %err, "failed to accept connection");
                break;
            }
        }
    }
}

/// Builds a nonblocking listener: socket2 socket with SO_REUSEADDR, optional
/// SO_REUSEPORT for multi-acceptor scaling, converted into a tokio listener.
fn build_listener(addr: SocketAddr, use_reuse_port: bool) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| GateError::Network(format!("socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();

    if use_reuse_port {
        #[cfg(unix)]
        if let Err(err) = socket.set_reuse_port(true) {
            warn!(%err, "failed to set SO_REUSEPORT");
        }
        #[cfg(not(unix))]
        warn!("SO_REUSEPORT is not supported on this platform; using SO_REUSEADDR only");
    }

    socket
        .bind(&addr.into())
        .map_err(|e| GateError::Network(format!("bind to {addr} failed: {e}")))?;
    socket
        .listen(1024)
        .map_err(|e| GateError::Network(format!("listen on {addr} failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener.set_nonblocking(true).ok();
    TcpListener::from_std(std_listener)
        .map_err(|e| GateError::Network(format!("tokio listener creation failed: {e}")))
}
