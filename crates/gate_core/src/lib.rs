//! # gate_core — game-server network ingress
//!
//! The connection and transport-framing subsystem of a persistent multiplayer
//! game server. It accepts TCP connections, frames a length-prefixed binary
//! protocol, demultiplexes each socket to one of several registered protocol
//! services, enforces per-connection and per-address abuse controls, and
//! manages asynchronous read/write lifecycles with watchdog deadlines.
//!
//! This crate contains **no protocol semantics** — opcodes and payload
//! meaning belong to the application layer, which plugs in through the
//! [`Service`]/[`ProtocolHandler`] contract.
//!
//! ## Components
//!
//! * [`message`] — fixed-capacity buffers and the wire envelope
//! * [`admission`] — accept-time flood/backoff table
//! * [`connection`] — per-socket state machine and I/O loops
//! * [`service`] — service registration and protocol demultiplexing
//! * [`registry`] — process-wide set of live connections
//! * [`server`] — listener setup, accept loops, shutdown
//!
//! ## Data flow
//!
//! listener accepts socket → admission check → [`Connection`] registered →
//! read loop frames the stream (legacy single-byte handshake first, when the
//! port binds a handler at accept) → first payload classifies the protocol →
//! handler callbacks per message → replies queue through the serialized write
//! path → disconnect drains the queue, then the socket closes.
//!
//! ## Failure policy
//!
//! Every failure — framing, I/O, timeout, protocol mismatch, rate-limit — is
//! fatal to its connection only. Nothing propagates across connection
//! boundaries; the only process-wide effect is registry removal and a log
//! line.

pub mod admission;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod registry;
pub mod server;
pub mod service;

pub use admission::{AddressBlockTable, AdmissionConfig};
pub use config::GateConfig;
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{GateError, Result};
pub use message::{NetworkMessage, OutputMessage};
pub use registry::ConnectionRegistry;
pub use server::GateServer;
pub use service::{ProtocolHandler, Service, ServicePort};
