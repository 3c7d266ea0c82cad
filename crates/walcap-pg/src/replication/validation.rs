//! Pre-flight checks and status reporting for the replication setup.

use tokio_postgres::Client;
use tracing::debug;
use walcap_core::TableRef;

use super::lsn::Lsn;
use super::publication::publication_tables;
use super::slot::slot_row;
use crate::error::{PgError, PgResult};

/// Check that a table exists.
pub async fn table_exists(client: &Client, table: &TableRef) -> PgResult<bool> {
    let exists: bool = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_schema = $1 AND table_name = $2)",
            &[&table.schema, &table.name],
        )
        .await?
        .get(0);

    Ok(exists)
}

/// Fail with `TableNotFound` for the first configured table that is absent.
pub async fn validate_tables_exist(client: &Client, tables: &[TableRef]) -> PgResult<()> {
    for table in tables {
        if !table_exists(client, table).await? {
            return Err(PgError::TableNotFound {
                schema: table.schema.clone(),
                table: table.name.clone(),
            });
        }
    }

    debug!(count = tables.len(), "All publication tables exist");
    Ok(())
}

/// Status of a replication slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotStatus {
    /// Slot exists with the expected plugin.
    Ready {
        active: bool,
        confirmed_flush: Option<Lsn>,
    },
    /// Slot exists but belongs to another plugin.
    WrongPlugin { plugin: Option<String> },
    Missing,
}

impl SlotStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, SlotStatus::Ready { .. })
    }
}

/// Status of a publication.
#[derive(Debug, Clone, PartialEq)]
pub enum PublicationStatus {
    Exists { tables: Vec<TableRef> },
    Missing,
}

impl PublicationStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, PublicationStatus::Exists { .. })
    }
}

/// Overall replication setup status.
#[derive(Debug, Clone)]
pub struct ReplicationStatus {
    pub slot: SlotStatus,
    pub publication: PublicationStatus,
}

impl ReplicationStatus {
    pub fn is_ready(&self) -> bool {
        self.slot.is_ready() && self.publication.is_ready()
    }
}

/// Inspect the slot and publication a consumer would use.
///
/// wal2json ignores publications, so callers streaming wal2json only need
/// the slot part.
pub async fn check_replication_setup(
    client: &Client,
    slot_name: &str,
    expected_plugin: &str,
    publication_name: &str,
) -> PgResult<ReplicationStatus> {
    let slot = match slot_row(client, slot_name).await? {
        Some(row) if row.plugin.as_deref() == Some(expected_plugin) => SlotStatus::Ready {
            active: row.active,
            confirmed_flush: row.confirmed_flush,
        },
        Some(row) => SlotStatus::WrongPlugin { plugin: row.plugin },
        None => SlotStatus::Missing,
    };

    let publication = match publication_tables(client, publication_name).await? {
        Some(tables) => {
            let mut tables: Vec<TableRef> = tables.into_iter().collect();
            tables.sort_by(|a, b| (&a.schema, &a.name).cmp(&(&b.schema, &b.name)));
            PublicationStatus::Exists { tables }
        }
        None => PublicationStatus::Missing,
    };

    Ok(ReplicationStatus { slot, publication })
}
