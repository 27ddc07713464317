//! SQL shared by both store flavors
//!
//! Every string built here passes the executor's statement guard: one
//! statement, allow-listed leading verb, positional parameters only.

use crate::executor::SchemaFlavor;
use crate::models::EntityKind;

/// Remote only. Newest change stamp across every entity table, 0 when empty.
fn latest_change_subquery() -> String {
    let tables = EntityKind::ALL
        .iter()
        .map(|kind| format!("SELECT MAX(changed_at) AS stamp FROM {}", kind.table()))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    format!("SELECT COALESCE(MAX(stamp), 0) FROM ({tables})")
}

/// Remote only. The stamp for a write the remote is about to accept: its own
/// wall clock in unix millis, forced past every stamp already handed out.
fn next_change_stamp() -> String {
    format!(
        "max(CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER), ({}) + 1)",
        latest_change_subquery()
    )
}

/// Remote only. Current position of the remote change clock.
pub fn change_cursor() -> String {
    format!("SELECT ({}) AS n", latest_change_subquery())
}

/// Statements for one entity kind in one store flavor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementSet {
    pub kind: EntityKind,
    pub flavor: SchemaFlavor,
    columns: &'static str,
}

impl StatementSet {
    pub const fn new(kind: EntityKind, flavor: SchemaFlavor) -> Self {
        let columns = if flavor.tracks_sync() {
            "id, payload, updated_at, deleted_at, synced"
        } else {
            "id, payload, updated_at, deleted_at"
        };
        Self {
            kind,
            flavor,
            columns,
        }
    }

    fn table(&self) -> &'static str {
        self.kind.table()
    }

    /// Params: id, payload, `updated_at`, `deleted_at`.
    /// Local rows start unsynced.
    pub fn insert(&self) -> String {
        if self.flavor.tracks_sync() {
            format!(
                "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, 0)",
                self.table(),
                self.columns
            )
        } else {
            format!(
                "INSERT INTO {} ({}, changed_at) VALUES (?, ?, ?, ?, {})",
                self.table(),
                self.columns,
                next_change_stamp()
            )
        }
    }

    /// Params: id.
    pub fn select_by_id(&self) -> String {
        format!("SELECT {} FROM {} WHERE id = ?", self.columns, self.table())
    }

    /// Params: limit, offset. Live records only, newest first.
    pub fn list_live(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE deleted_at IS NULL ORDER BY updated_at DESC LIMIT ? OFFSET ?",
            self.columns,
            self.table()
        )
    }

    pub fn count_live(&self) -> String {
        format!(
            "SELECT COUNT(*) AS n FROM {} WHERE deleted_at IS NULL",
            self.table()
        )
    }

    /// Params: payload, `updated_at`, `deleted_at`, id.
    /// Local writes clear the synced flag; remote writes take a change stamp.
    pub fn update_revision(&self) -> String {
        let marker = if self.flavor.tracks_sync() {
            ", synced = 0".to_string()
        } else {
            format!(", changed_at = {}", next_change_stamp())
        };
        format!(
            "UPDATE {} SET payload = ?, updated_at = ?, deleted_at = ?{marker} WHERE id = ?",
            self.table()
        )
    }

    /// Local only. Oldest first so pushes replay in write order.
    pub fn select_unsynced(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE synced = 0 ORDER BY updated_at ASC",
            self.columns,
            self.table()
        )
    }

    pub fn count_unsynced(&self) -> String {
        format!("SELECT COUNT(*) AS n FROM {} WHERE synced = 0", self.table())
    }

    /// Local only. Params: id.
    pub fn mark_synced(&self) -> String {
        format!("UPDATE {} SET synced = 1 WHERE id = ?", self.table())
    }

    /// Local only. Params: id, `updated_at`. No-op when the record has been
    /// rewritten since that revision was read.
    pub fn mark_revision_synced(&self) -> String {
        format!(
            "UPDATE {} SET synced = 1 WHERE id = ? AND updated_at = ?",
            self.table()
        )
    }

    /// Local only. Params: id, payload, `updated_at`, `deleted_at`.
    /// Stores a remote revision as synced unless the id already exists.
    pub fn insert_synced_if_absent(&self) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, 1) ON CONFLICT(id) DO NOTHING",
            self.table(),
            self.columns
        )
    }

    /// Local only. Params: payload, `updated_at`, `deleted_at`, id, expected
    /// `updated_at`, expected synced flag. Replaces the row with a remote
    /// revision only while it still holds the revision that was read.
    pub fn replace_revision_synced(&self) -> String {
        format!(
            "UPDATE {} SET payload = ?, updated_at = ?, deleted_at = ?, synced = 1 \
             WHERE id = ? AND updated_at = ? AND synced = ?",
            self.table()
        )
    }

    /// Remote only. Params: change stamp. Includes tombstones, in the order
    /// the remote accepted them.
    pub fn select_changed_since(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE changed_at > ? ORDER BY changed_at ASC",
            self.columns,
            self.table()
        )
    }

    /// Remote only. Params: id, payload, `updated_at`, `deleted_at`.
    /// Replaces an existing row only when the incoming revision is newer.
    /// Accepted revisions take a fresh change stamp.
    pub fn upsert_if_newer(&self) -> String {
        format!(
            "INSERT INTO {table} ({columns}, changed_at) VALUES (?, ?, ?, ?, {stamp}) \
             ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, \
             updated_at = excluded.updated_at, deleted_at = excluded.deleted_at, \
             changed_at = excluded.changed_at \
             WHERE excluded.updated_at > {table}.updated_at",
            table = self.table(),
            columns = self.columns,
            stamp = next_change_stamp()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{authorize, StatementVerb};

    fn all_statements(set: &StatementSet) -> Vec<String> {
        let mut statements = vec![
            set.insert(),
            set.select_by_id(),
            set.list_live(),
            set.count_live(),
            set.update_revision(),
        ];
        if set.flavor.tracks_sync() {
            statements.extend([
                set.select_unsynced(),
                set.count_unsynced(),
                set.mark_synced(),
                set.mark_revision_synced(),
                set.insert_synced_if_absent(),
                set.replace_revision_synced(),
            ]);
        } else {
            statements.extend([set.select_changed_since(), set.upsert_if_newer()]);
        }
        statements
    }

    #[test]
    fn every_statement_passes_the_guard() {
        for kind in EntityKind::ALL {
            for flavor in [SchemaFlavor::Local, SchemaFlavor::Remote] {
                let set = StatementSet::new(kind, flavor);
                for statement in all_statements(&set) {
                    authorize(&statement).unwrap();
                }
            }
        }
        assert_eq!(authorize(&change_cursor()).unwrap().verb, StatementVerb::Select);
    }

    #[test]
    fn remote_writes_take_a_change_stamp() {
        let set = StatementSet::new(EntityKind::Product, SchemaFlavor::Remote);
        for statement in [set.insert(), set.update_revision(), set.upsert_if_newer()] {
            assert!(statement.contains("changed_at"), "{statement}");
        }
        let local = StatementSet::new(EntityKind::Product, SchemaFlavor::Local);
        assert!(!local.insert().contains("changed_at"));
    }

    #[test]
    fn remote_statements_never_mention_synced() {
        let set = StatementSet::new(EntityKind::Sale, SchemaFlavor::Remote);
        for statement in all_statements(&set) {
            assert!(!statement.contains("synced"), "{statement}");
        }
    }

    #[test]
    fn reads_are_classified_as_reads() {
        let set = StatementSet::new(EntityKind::Product, SchemaFlavor::Local);
        assert_eq!(
            authorize(&set.select_unsynced()).unwrap().verb,
            StatementVerb::Select
        );
        assert_eq!(
            authorize(&set.insert_synced_if_absent()).unwrap().verb,
            StatementVerb::Insert
        );
    }
}
