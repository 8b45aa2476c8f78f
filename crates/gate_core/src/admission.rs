//! Accept-time admission control (flood/backoff table).
//!
//! Consulted before a [`Connection`](crate::connection::Connection) object
//! exists, so a rejected attempt costs nothing beyond the kernel accept. The
//! table is a deliberately approximate rate limiter, not a token bucket; the
//! thresholds are tunable but their interplay must stay exactly as shipped or
//! retry storms start slipping through.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tunables for the accept-time flood/backoff heuristic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Attempts tolerated inside one rolling window before the burst check trips.
    pub max_attempts: u32,

    /// Length of the rolling attempt window, in milliseconds.
    pub window_ms: u64,

    /// A burst only trips the block when the final inter-attempt gap is at
    /// most this many milliseconds.
    pub trigger_gap_ms: u64,

    /// Initial block duration, in milliseconds.
    pub block_ms: u64,

    /// Every attempt made while blocked extends the block by this much.
    pub block_extension_ms: u64,

    /// Soft bound on the number of tracked addresses. When exceeded, expired
    /// unblocked records are purged before inserting a new one.
    pub max_entries: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_ms: 5_000,
            trigger_gap_ms: 500,
            block_ms: 3_000,
            block_extension_ms: 250,
            max_entries: 10_000,
        }
    }
}

impl AdmissionConfig {
    fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn trigger_gap(&self) -> Duration {
        Duration::from_millis(self.trigger_gap_ms)
    }

    fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    fn block_extension(&self) -> Duration {
        Duration::from_millis(self.block_extension_ms)
    }
}

/// Per-address throttle record.
#[derive(Debug, Clone)]
struct AddressBlockRecord {
    /// When this address last attempted to connect.
    last_attempt: Instant,

    /// Deadline until which further attempts are rejected, if blocked.
    blocked_until: Option<Instant>,

    /// Attempts observed inside the current window.
    count: u32,
}

/// Process-wide map from remote address to throttle record.
///
/// Owned by the server's composition root and passed by reference to the
/// accept path; protected by its own lock, independent of any per-connection
/// state, so slow connection work never stalls admission decisions.
#[derive(Debug)]
pub struct AddressBlockTable {
    config: AdmissionConfig,
    records: Mutex<HashMap<IpAddr, AddressBlockRecord>>,
}

impl AddressBlockTable {
    pub fn new(config: AdmissionConfig) -> Self {
        Self { config, records: Mutex::new(HashMap::new()) }
    }

    /// Checks whether a connection attempt from `addr` may proceed.
    pub fn check(&self, addr: IpAddr) -> bool {
        self.check_at(addr, Instant::now())
    }

    /// Clock-injected form of [`check`](Self::check), used by tests.
    pub(crate) fn check_at(&self, addr: IpAddr, now: Instant) -> bool {
        let mut records = self.records.lock().expect("admission table lock poisoned");

        let record = match records.get_mut(&addr) {
            Some(record) => record,
            None => {
                if records.len() >= self.config.max_entries {
                    Self::purge_expired(&mut records, now, &self.config);
                }
                records.insert(
                    addr,
                    AddressBlockRecord { last_attempt: now, blocked_until: None, count: 1 },
                );
                return true;
            }
        };

        // Attempts made while blocked push the deadline further out, so a
        // retry storm digs its own hole.
        if let Some(blocked_until) = record.blocked_until {
            if blocked_until > now {
                record.blocked_until = Some(blocked_until + self.config.block_extension());
                debug!(%addr, "rejected attempt from blocked address");
                return false;
            }
            record.blocked_until = None;
        }

        let gap = now.duration_since(record.last_attempt);
        record.last_attempt = now;

        if gap <= self.config.window() {
            record.count += 1;
            if record.count > self.config.max_attempts {
                record.count = 0;
                if gap <= self.config.trigger_gap() {
                    record.blocked_until = Some(now + self.config.block());
                    debug!(%addr, "address blocked for flooding");
                    return false;
                }
            }
        } else {
            // Window expired: start counting afresh.
            record.count = 1;
        }
        true
    }

    /// Number of tracked addresses.
    pub fn len(&self) -> usize {
        self.records.lock().expect("admission table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn purge_expired(
        records: &mut HashMap<IpAddr, AddressBlockRecord>,
        now: Instant,
        config: &AdmissionConfig,
    ) {
        let before = records.len();
        records.retain(|_, record| {
            record.blocked_until.is_some_and(|until| until > now)
                || now.duration_since(record.last_attempt) <= config.window()
        });
        debug!(purged = before - records.len(), "admission table purge");
    }
}
