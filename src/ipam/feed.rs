//! Audit log and change feed access.
//!
//! Every committed mutation writes its change records in the same
//! transaction as the data, so a poller never sees a change that was rolled
//! back and never misses one that was committed. Consumers track their own
//! position with a named cursor.

use tokio::sync::watch;
use tracing::debug;

use super::Ipam;
use crate::auth::Principal;
use crate::db::models::{AuditEntry, AuditFilter, Change};
use crate::error::{IpamError, Result};

impl Ipam {
    pub async fn list_audit(&self, _principal: &Principal, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        self.store().list_audit(filter).await
    }

    /// Changes committed after `consumer`'s cursor, oldest first. The cursor
    /// does not move until [`Ipam::ack_changes`].
    pub async fn poll_changes(&self, consumer: &str, limit: u32) -> Result<Vec<Change>> {
        let cursor = self.store().get_cursor(consumer).await?;
        let changes = self.store().changes_after(cursor, limit).await?;
        debug!(consumer, cursor, returned = changes.len(), "Polled changes");
        Ok(changes)
    }

    /// Move `consumer`'s cursor to `seq`. Cursors only move forward.
    pub async fn ack_changes(&self, consumer: &str, seq: i64) -> Result<()> {
        let cursor = self.store().get_cursor(consumer).await?;
        let last = *self.inner.changes.borrow();
        if seq > last {
            return Err(IpamError::value("seq", format!("{seq} is past the last committed change {last}")));
        }
        if seq <= cursor {
            return Ok(());
        }
        self.store().set_cursor(consumer, seq).await?;
        debug!(consumer, seq, "Acknowledged changes");
        Ok(())
    }

    /// Watch the sequence number of the latest committed change.
    pub fn subscribe(&self) -> watch::Receiver<i64> {
        self.inner.changes.subscribe()
    }
}
