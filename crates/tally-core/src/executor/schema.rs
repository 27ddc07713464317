//! Fresh-database schema
//!
//! A new image is created from this fixed statement set. Each statement goes
//! through the same allow-list as caller statements.

use crate::models::EntityKind;

/// Which side of the sync boundary a database serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFlavor {
    /// Device store: entity tables carry a `synced` flag, plus sync bookkeeping
    Local,
    /// Authoritative store: no `synced` flag; rows carry a `changed_at` stamp
    Remote,
}

impl SchemaFlavor {
    pub const fn tracks_sync(self) -> bool {
        matches!(self, Self::Local)
    }
}

pub const SYNC_METADATA_TABLE: &str = "sync_metadata";
pub const SYNC_CONFLICTS_TABLE: &str = "sync_conflicts";

/// Create statements for `flavor`, in execution order.
pub fn statements(flavor: SchemaFlavor) -> Vec<String> {
    let mut statements = Vec::new();

    for kind in EntityKind::ALL {
        let table = kind.table();
        let marker_column = if flavor.tracks_sync() {
            ",\n            synced INTEGER NOT NULL DEFAULT 0"
        } else {
            ",\n            changed_at INTEGER NOT NULL DEFAULT 0"
        };
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {table} (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted_at INTEGER{marker_column}
        )"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{table}_updated ON {table}(updated_at)"
        ));
        if flavor.tracks_sync() {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_synced ON {table}(synced)"
            ));
        } else {
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_changed ON {table}(changed_at)"
            ));
        }
    }

    if flavor.tracks_sync() {
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {SYNC_METADATA_TABLE} (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_sync_timestamp INTEGER NOT NULL DEFAULT 0,
            last_full_sync_timestamp INTEGER NOT NULL DEFAULT 0,
            pending_changes INTEGER NOT NULL DEFAULT 0
        )"
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {SYNC_CONFLICTS_TABLE} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            record_id TEXT NOT NULL,
            local_updated_at INTEGER NOT NULL,
            remote_updated_at INTEGER NOT NULL,
            resolved_at INTEGER NOT NULL,
            resolution TEXT NOT NULL,
            reason TEXT NOT NULL
        )"
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS idx_{SYNC_CONFLICTS_TABLE}_resolved_at ON {SYNC_CONFLICTS_TABLE}(resolved_at DESC)"
        ));
    }

    statements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::guard::{authorize, StatementVerb};

    #[test]
    fn every_schema_statement_passes_the_allow_list() {
        for flavor in [SchemaFlavor::Local, SchemaFlavor::Remote] {
            for statement in statements(flavor) {
                let authorized = authorize(&statement).unwrap();
                assert!(matches!(
                    authorized.verb,
                    StatementVerb::CreateTable | StatementVerb::CreateIndex
                ));
            }
        }
    }

    #[test]
    fn remote_schema_has_no_sync_flag() {
        let remote = statements(SchemaFlavor::Remote);
        assert!(remote.iter().all(|statement| !statement.contains("synced")));
        assert!(remote.iter().all(|statement| !statement.contains(SYNC_METADATA_TABLE)));
        assert!(remote
            .iter()
            .any(|statement| statement.contains("changed_at INTEGER NOT NULL DEFAULT 0")));
    }

    #[test]
    fn local_schema_tracks_sync() {
        let local = statements(SchemaFlavor::Local);
        assert!(local
            .iter()
            .any(|statement| statement.contains("synced INTEGER NOT NULL DEFAULT 0")));
        assert!(local.iter().any(|statement| statement.contains(SYNC_CONFLICTS_TABLE)));
    }
}
