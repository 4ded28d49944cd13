//! Audit sinks for balance mutations

use std::sync::Mutex;

use common::model::audit::{AuditEntry, Outcome};
use tracing::{error, info};

/// Destination for audit entries
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Emits each entry as a structured tracing event
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        let before = entry.balance_before.map(|b| b.to_string()).unwrap_or_default();
        let after = entry.balance_after.map(|b| b.to_string()).unwrap_or_default();

        match entry.outcome {
            Outcome::Success => info!(
                target: "audit",
                operation = ?entry.operation,
                store = ?entry.store,
                account = %entry.account_id,
                amount = %entry.amount,
                balance_before = %before,
                balance_after = %after,
                "mutation succeeded"
            ),
            Outcome::Failure => error!(
                target: "audit",
                operation = ?entry.operation,
                store = ?entry.store,
                account = %entry.account_id,
                amount = %entry.amount,
                balance_before = %before,
                balance_after = %after,
                error = entry.error.as_deref().unwrap_or_default(),
                "mutation failed"
            ),
        }
    }
}

/// Keeps entries in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}
