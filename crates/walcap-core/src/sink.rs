//! Destinations for decoded change events.
//!
//! A session hands every event to its sink in log order, one at a time.
//! `accept` is expected to return quickly; a sink that blocks stalls the
//! whole replication session.

use tokio::sync::mpsc;
use tracing::info;

use crate::error::{Error, Result};
use crate::types::{ChangeEvent, ChangeRecord};

/// Receives change events from a replication session.
pub trait ChangeSink {
    fn accept(&mut self, record: ChangeRecord) -> Result<()>;
}

/// Writes every event as a structured log line.
#[derive(Debug, Default)]
pub struct LogSink {
    accepted: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events logged so far.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

impl ChangeSink for LogSink {
    fn accept(&mut self, record: ChangeRecord) -> Result<()> {
        self.accepted += 1;
        let lsn = record.lsn;

        match &record.event {
            ChangeEvent::Begin { xid, .. } => {
                info!(lsn, xid, "begin");
            }
            ChangeEvent::Commit { end_lsn, .. } => {
                info!(lsn, end_lsn, "commit");
            }
            ChangeEvent::Insert { relation, row } => {
                let row = serde_json::to_string(row)?;
                info!(lsn, relation = %relation, %row, "insert");
            }
            ChangeEvent::Update {
                relation,
                before,
                after,
            } => {
                let after = serde_json::to_string(after)?;
                let before = match before {
                    Some(before) => serde_json::to_string(before)?,
                    None => "-".to_string(),
                };
                info!(lsn, relation = %relation, %before, %after, "update");
            }
            ChangeEvent::Delete { relation, before } => {
                let before = serde_json::to_string(before)?;
                info!(lsn, relation = %relation, %before, "delete");
            }
            ChangeEvent::Truncate {
                relations,
                cascade,
                restart_identity,
            } => {
                let relations: Vec<String> = relations.iter().map(|r| r.to_string()).collect();
                info!(lsn, relations = ?relations, cascade, restart_identity, "truncate");
            }
            ChangeEvent::SchemaChange {
                relation_id,
                relation,
                columns,
            } => {
                info!(
                    lsn,
                    relation_id,
                    relation = %relation,
                    columns = columns.len(),
                    "schema change"
                );
            }
        }

        Ok(())
    }
}

/// Forwards events to an unbounded channel, e.g. a consumer task shared by
/// several sessions.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ChangeRecord>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ChangeRecord>) -> Self {
        Self { tx }
    }

    /// Create a sink together with the receiving half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ChangeRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ChangeSink for ChannelSink {
    fn accept(&mut self, record: ChangeRecord) -> Result<()> {
        self.tx.send(record).map_err(|_| Error::SinkClosed)
    }
}

impl ChangeSink for Vec<ChangeRecord> {
    fn accept(&mut self, record: ChangeRecord) -> Result<()> {
        self.push(record);
        Ok(())
    }
}
