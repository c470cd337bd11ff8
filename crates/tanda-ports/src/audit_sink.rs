//! The `Audit` port (SPEC_FULL.md §6.7): an append-only sink for system
//! events, never read back by the core itself.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;

use tanda_core::{AuditEvent, Error};
use tanda_state::StateDb;

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), Error>;
}

/// Production adapter: appends to the `audit_event` sled tree.
pub struct StateDbAuditSink {
    db: Arc<StateDb>,
}

impl StateDbAuditSink {
    pub fn new(db: Arc<StateDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for StateDbAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), Error> {
        self.db.append_audit_event(&event)
    }
}

/// Test adapter: records events in memory for assertion.
#[derive(Default)]
pub struct StubAuditSink {
    pub recorded: StdMutex<Vec<AuditEvent>>,
}

impl StubAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for StubAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), Error> {
        self.recorded.lock().expect("stub audit sink poisoned").push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tanda_core::AuditSeverity;

    #[tokio::test]
    async fn stub_sink_records_events() {
        let sink = StubAuditSink::new();
        sink.record(AuditEvent {
            id: uuid::Uuid::new_v4(),
            group_id: None,
            severity: AuditSeverity::Info,
            kind: "test".into(),
            message: "hello".into(),
            auto_corrected: false,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
        assert_eq!(sink.recorded.lock().unwrap().len(), 1);
    }
}
