//! Cache for PostgreSQL relation metadata.
//!
//! PostgreSQL sends Relation messages before the first DML on each table
//! in a replication session, and again whenever the table's definition
//! changes. We cache these to resolve relation_id in subsequent
//! Insert/Update/Delete/Truncate messages.

use std::collections::HashMap;

use walcap_core::{ColumnMeta, TableRef};

use super::pgoutput::{ColumnDef, RelationMessage, ReplicaIdentity};
use crate::error::{PgError, PgResult};

/// The latest known definition of a relation.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationSchema {
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnDef>,
}

impl RelationSchema {
    pub fn table_ref(&self) -> TableRef {
        TableRef::new(self.namespace.clone(), self.name.clone())
    }

    pub fn column_meta(&self) -> Vec<ColumnMeta> {
        self.columns
            .iter()
            .map(|c| ColumnMeta {
                name: c.name.clone(),
                type_oid: c.type_oid,
                is_key: c.is_key(),
            })
            .collect()
    }
}

impl From<RelationMessage> for RelationSchema {
    fn from(msg: RelationMessage) -> Self {
        Self {
            relation_id: msg.relation_id,
            namespace: msg.namespace,
            name: msg.name,
            replica_identity: msg.replica_identity,
            columns: msg.columns,
        }
    }
}

/// Cache of relation OID to table metadata mappings. Owned by one session.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, RelationSchema>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a schema, replacing any previous definition of the relation.
    pub fn put(&mut self, schema: RelationSchema) {
        self.relations.insert(schema.relation_id, schema);
    }

    /// Look up relation info by OID.
    pub fn get(&self, relation_id: u32) -> PgResult<&RelationSchema> {
        self.relations
            .get(&relation_id)
            .ok_or(PgError::RelationNotFound(relation_id))
    }

    /// Clear the cache (e.g., on reconnect).
    pub fn clear(&mut self) {
        self.relations.clear();
    }

    /// Number of cached relations.
    pub fn len(&self) -> usize {
        self.relations.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}
