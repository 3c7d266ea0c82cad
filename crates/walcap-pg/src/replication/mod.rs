//! Logical replication: bootstrap, the streaming session loop, and the
//! decoders for what flows through it.

pub mod bootstrap;
pub mod lsn;
pub mod pgoutput;
pub mod protocol;
pub mod publication;
pub mod relation_cache;
pub mod session;
pub mod slot;
pub mod tracker;
pub mod transport;
pub mod tuple;
pub mod validation;
pub mod wal2json;

pub use bootstrap::{bootstrap, BootstrapConfig, Bootstrapped};
pub use lsn::{format_lsn, parse_lsn, Lsn};
pub use pgoutput::{PgOutputDecoder, PgOutputMessage};
pub use publication::{
    drop_publication, ensure_publication, parse_table_ref, quote_ident, quote_table,
    PublicationPlan, PublicationSettings,
};
pub use relation_cache::{RelationCache, RelationSchema};
pub use session::{ReplicationSession, SessionConfig, SessionEnd, SessionStats};
pub use slot::drop_slot;
pub use tracker::{PositionTracker, DEFAULT_STATUS_INTERVAL};
pub use transport::{
    Frame, OutputFormat, ReceiveError, ReplicationCommands, ReplicationSlot, ReplicationTransport,
    ServerError, ShutdownHandle, SlotInfo, SystemIdentification,
};
pub use tuple::{TupleDecoder, TupleError};
pub use validation::{
    check_replication_setup, validate_tables_exist, PublicationStatus, ReplicationStatus,
    SlotStatus,
};
