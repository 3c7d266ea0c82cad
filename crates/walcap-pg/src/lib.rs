mod connect;
pub mod conninfo;
mod error;
pub mod replication;
pub mod wire;

pub use connect::connect_postgres;
pub use error::{PgError, PgResult};
pub use replication::{
    bootstrap, BootstrapConfig, Lsn, OutputFormat, ReplicationSession, SessionConfig, SessionEnd,
    SessionStats, ShutdownHandle,
};
pub use wire::PgWireTransport;
