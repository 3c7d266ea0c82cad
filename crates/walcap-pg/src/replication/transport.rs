//! The contracts between a replication session and the connection it runs
//! over.
//!
//! The session loop only ever sees [`ReplicationTransport`]; bootstrap only
//! sees [`ReplicationCommands`]. `PgWireTransport` implements both over a
//! real socket, tests implement them over scripted frames.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::lsn::Lsn;
use super::publication::quote_literal;
use crate::error::{PgError, PgResult};

/// One backend message received while streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    CopyData(Bytes),
    CopyDone,
    Error(ServerError),
    /// Any other backend message, by name (NoticeResponse, ParameterStatus, ...).
    Other(String),
}

/// Fields of an ErrorResponse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} (code: {})", self.severity, self.message, self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, " detail: {}", detail)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The deadline passed before a frame arrived.
    #[error("receive deadline elapsed")]
    Timeout,

    /// The connection was shut down locally or by the peer.
    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Byte-level access to a connection in COPY-both mode.
#[async_trait]
pub trait ReplicationTransport: Send {
    /// Wait for the next frame, giving up at `deadline`.
    async fn receive_frame(&mut self, deadline: Instant) -> Result<Frame, ReceiveError>;

    /// Send one CopyData message.
    async fn send_copy_data(&mut self, data: Bytes) -> PgResult<()>;
}

/// Asks a transport to close its connection.
///
/// Triggering it makes the pending (or the next) `receive_frame` close the
/// connection and return [`ReceiveError::Closed`].
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        // notify_one keeps a permit when nobody is waiting yet
        self.notify.notify_one();
    }

    /// Resolves once `shutdown` has been called.
    pub async fn triggered(&self) {
        self.notify.notified().await;
    }
}

/// Result of IDENTIFY_SYSTEM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentification {
    pub system_id: String,
    pub timeline: i32,
    pub xlog_pos: Lsn,
    pub dbname: String,
}

/// Logical decoding output plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    PgOutput,
    Wal2Json,
}

impl OutputFormat {
    pub fn plugin_name(&self) -> &'static str {
        match self {
            OutputFormat::PgOutput => "pgoutput",
            OutputFormat::Wal2Json => "wal2json",
        }
    }

    /// Plugin options for START_REPLICATION.
    pub fn start_options(&self, publication: &str) -> Vec<String> {
        match self {
            OutputFormat::PgOutput => vec![
                "proto_version '1'".to_string(),
                format!("publication_names {}", quote_literal(publication)),
            ],
            OutputFormat::Wal2Json => vec![
                "\"format-version\" '2'".to_string(),
                "\"include-xids\" '1'".to_string(),
                "\"include-timestamp\" '1'".to_string(),
                "\"include-lsn\" '1'".to_string(),
                "\"include-type-oids\" '1'".to_string(),
            ],
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plugin_name())
    }
}

impl FromStr for OutputFormat {
    type Err = PgError;

    fn from_str(s: &str) -> PgResult<Self> {
        match s {
            "pgoutput" => Ok(OutputFormat::PgOutput),
            "wal2json" => Ok(OutputFormat::Wal2Json),
            other => Err(PgError::Replication(format!(
                "unsupported output format '{}'",
                other
            ))),
        }
    }
}

/// A logical replication slot as this consumer wants it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub name: String,
    pub output_format: OutputFormat,
    pub temporary: bool,
}

/// An existing slot, as found in pg_replication_slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub name: String,
    pub plugin: Option<String>,
    pub confirmed_flush: Option<Lsn>,
    pub temporary: bool,
}

/// Request/response commands issued on a replication connection before
/// streaming starts.
#[async_trait]
pub trait ReplicationCommands: Send {
    async fn identify_system(&mut self) -> PgResult<SystemIdentification>;

    /// Look up a slot by name. Never creates anything.
    async fn find_slot(&mut self, name: &str) -> PgResult<Option<SlotInfo>>;

    async fn create_slot(&mut self, slot: &ReplicationSlot) -> PgResult<()>;

    /// Switch the connection into COPY-both streaming from `start`.
    async fn start_replication(&mut self, slot: &str, start: Lsn, options: &[String])
        -> PgResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_names() {
        assert_eq!(OutputFormat::PgOutput.plugin_name(), "pgoutput");
        assert_eq!("wal2json".parse::<OutputFormat>().unwrap(), OutputFormat::Wal2Json);
        assert!("test_decoding".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_pgoutput_start_options_quote_publication() {
        let options = OutputFormat::PgOutput.start_options("it's_pub");
        assert_eq!(options[0], "proto_version '1'");
        assert_eq!(options[1], "publication_names 'it''s_pub'");
    }

    #[test]
    fn test_wal2json_start_options() {
        let options = OutputFormat::Wal2Json.start_options("ignored");
        assert!(options.contains(&"\"format-version\" '2'".to_string()));
        assert!(options.iter().all(|o| !o.contains("ignored")));
    }

    #[tokio::test]
    async fn test_shutdown_before_wait_is_not_lost() {
        let handle = ShutdownHandle::new();
        handle.clone().shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle.triggered())
            .await
            .expect("shutdown permit should be stored");
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError {
            severity: "FATAL".into(),
            code: "57P01".into(),
            message: "terminating connection due to administrator command".into(),
            detail: None,
        };
        assert_eq!(
            err.to_string(),
            "FATAL: terminating connection due to administrator command (code: 57P01)"
        );
    }
}
