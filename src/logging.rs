//! Logging helpers and the operation log
//!
//! Diagnostic output goes through the `log` facade; wire traffic is dumped
//! through `tracing` by [`log_packet`]. The [`OperationLog`] is a separate,
//! user-facing record of the last transactions (what a dashboard shows in its
//! "communication log" panel), with an optional callback that sees every
//! entry as it is appended.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::utils::format::bytes_to_hex;
use crate::utils::now_millis;

/// Entries kept by [`OperationLog::default`]
pub const DEFAULT_OPERATION_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Success,
    Error,
    Timeout,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Success => f.write_str("success"),
            OperationStatus::Error => f.write_str("error"),
            OperationStatus::Timeout => f.write_str("timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLogEntry {
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub message: String,
}

/// Observer invoked for every appended entry
pub type OperationCallback = Box<dyn Fn(&OperationLogEntry) + Send + Sync>;

struct OperationLogInner {
    entries: VecDeque<OperationLogEntry>,
    capacity: usize,
}

/// Bounded, shared ring of operation entries
///
/// Clones share the same ring.
#[derive(Clone)]
pub struct OperationLog {
    inner: Arc<Mutex<OperationLogInner>>,
    callback: Option<Arc<OperationCallback>>,
}

impl OperationLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OperationLogInner {
                entries: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
            })),
            callback: None,
        }
    }

    pub fn with_callback(capacity: usize, callback: OperationCallback) -> Self {
        let mut log = Self::new(capacity);
        log.callback = Some(Arc::new(callback));
        log
    }

    /// Append an entry stamped with the current time
    pub fn record<S: Into<String>>(&self, op_type: OperationType, status: OperationStatus, message: S) {
        self.push(OperationLogEntry {
            timestamp: now_millis(),
            op_type,
            status,
            message: message.into(),
        });
    }

    pub fn push(&self, entry: OperationLogEntry) {
        if let Some(callback) = &self.callback {
            callback(&entry);
        }
        if let Ok(mut inner) = self.inner.lock() {
            if inner.entries.len() == inner.capacity {
                inner.entries.pop_front();
            }
            inner.entries.push_back(entry);
        }
    }

    /// Oldest first
    pub fn entries(&self) -> Vec<OperationLogEntry> {
        self.inner
            .lock()
            .map(|inner| inner.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, status: OperationStatus) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.entries.iter().filter(|e| e.status == status).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
        }
    }
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new(DEFAULT_OPERATION_LOG_CAPACITY)
    }
}

impl fmt::Debug for OperationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationLog")
            .field("len", &self.len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Dump a frame as hex, e.g. `[MODBUS-RTU] send slave:1 01 03 00 00 00 08 44 0C`
pub fn log_packet(protocol: &str, direction: &str, data: &[u8], slave_id: Option<u8>) {
    let hex_string = bytes_to_hex(data);
    match slave_id {
        Some(id) => info!("[MODBUS-{}] {} slave:{} {}", protocol, direction, id, hex_string),
        None => info!("[MODBUS-{}] {} {}", protocol, direction, hex_string),
    }
}

/// Set up `env_logger` (default level `info`) and a `tracing` fmt
/// subscriber for packet dumps; safe to call more than once
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
    let _ = tracing_subscriber::fmt().with_target(false).try_init();
}

/// Logger for tests: captured output, debug level, idempotent
pub fn init_test_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
