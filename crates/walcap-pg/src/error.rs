use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IDENTIFY_SYSTEM failed: {0}")]
    IdentifySystem(String),

    #[error("failed to create replication slot: {0}")]
    SlotCreationFailed(String),

    #[error("replication slot '{slot}' uses plugin {actual:?}, expected '{expected}'")]
    SlotPluginMismatch {
        slot: String,
        expected: String,
        actual: Option<String>,
    },

    #[error("publication '{0}' does not exist")]
    PublicationNotFound(String),

    #[error("table {schema}.{table} does not exist")]
    TableNotFound { schema: String, table: String },

    #[error("failed to start replication: {0}")]
    StartReplication(String),

    #[error("replication error: {0}")]
    Replication(String),

    #[error("malformed replication frame: {0}")]
    MalformedFrame(String),

    #[error("failed to send status update: {0}")]
    StatusSend(String),

    #[error("connection closed unexpectedly")]
    ConnectionClosed,

    #[error("pgoutput decode error: {0}")]
    PgOutput(String),

    #[error("unknown logical message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("relation {0} not found in cache")]
    RelationNotFound(u32),

    #[error("relation {relation_id} has {expected} columns but tuple carries {actual}")]
    ColumnCountMismatch {
        relation_id: u32,
        expected: usize,
        actual: usize,
    },

    #[error("log position overflow: {0}")]
    PositionOverflow(String),

    #[error("sink error: {0}")]
    Sink(#[from] walcap_core::Error),

    #[error("invalid LSN format: {0}")]
    InvalidLsn(String),
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            let msg = format!(
                "{}: {} (code: {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            );
            PgError::Postgres(msg)
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;
