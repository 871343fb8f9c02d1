//! Schema and migrations for per-agent store files.
//!
//! Migrations are forward-only, append-only, and idempotent by version:
//! the current version lives in `meta.schema_version` and each script runs
//! at most once per file, in order, inside a transaction.

use crate::{Error, Result};
use rusqlite::Connection;

/// Ordered migration scripts. Index + 1 is the schema version after apply.
const MIGRATIONS: [&str; 2] = [
    // v1: core tables — relational, vector, lexical, embed cache, KG side table.
    "
    CREATE TABLE IF NOT EXISTS memory (
        id                 TEXT PRIMARY KEY,
        agent              TEXT NOT NULL,
        text               TEXT NOT NULL,
        normalized_text    TEXT NOT NULL,
        category           TEXT NOT NULL,
        memory_type        TEXT NOT NULL,
        importance         REAL NOT NULL,
        strength           REAL NOT NULL,
        created_at         INTEGER NOT NULL,
        last_reinforced_at INTEGER NOT NULL,
        last_accessed_at   INTEGER NOT NULL,
        last_decayed_at    INTEGER NOT NULL,
        access_count       INTEGER NOT NULL DEFAULT 0,
        reinforce_count    INTEGER NOT NULL DEFAULT 0,
        pinned             INTEGER NOT NULL DEFAULT 0,
        soft_deleted_at    INTEGER,
        superseded_by      TEXT,
        session            TEXT,
        source             TEXT,
        provenance         TEXT,
        namespace          TEXT,
        embedding_status   TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_memory_live
        ON memory (soft_deleted_at) WHERE soft_deleted_at IS NULL;
    CREATE INDEX IF NOT EXISTS idx_memory_namespace ON memory (namespace);
    CREATE INDEX IF NOT EXISTS idx_memory_category ON memory (category);
    CREATE INDEX IF NOT EXISTS idx_memory_created ON memory (created_at);

    CREATE TABLE IF NOT EXISTS vec_memory (
        id        TEXT PRIMARY KEY REFERENCES memory (id),
        embedding BLOB NOT NULL
    );

    CREATE VIRTUAL TABLE IF NOT EXISTS fts_memory USING fts5(
        id UNINDEXED,
        normalized_text,
        tokenize='trigram'
    );

    CREATE TABLE IF NOT EXISTS embed_cache (
        hash       TEXT PRIMARY KEY,
        model      TEXT NOT NULL,
        dim        INTEGER NOT NULL,
        embedding  BLOB NOT NULL,
        created_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS kg_relation (
        subject_id TEXT NOT NULL,
        predicate  TEXT NOT NULL,
        object_id  TEXT NOT NULL,
        PRIMARY KEY (subject_id, predicate, object_id)
    );
    ",
    // v2: embed-cache eviction support.
    "
    CREATE INDEX IF NOT EXISTS idx_embed_cache_created ON embed_cache (created_at);
    ",
];

/// Current schema version produced by a full migration run.
#[allow(clippy::cast_possible_truncation)]
pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Applies pending migrations to an open connection.
///
/// # Errors
///
/// Returns [`Error::StoreIntegrity`] when the file reports a schema version
/// newer than this binary understands, and [`Error::StoreIo`] on SQL
/// failures.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )
    .map_err(|e| Error::StoreIo {
        operation: "create_meta".to_string(),
        cause: e.to_string(),
    })?;

    let current = schema_version(conn)?;
    if current > SCHEMA_VERSION {
        return Err(Error::StoreIntegrity(format!(
            "store schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }

    for (idx, script) in MIGRATIONS.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let version = idx as u32 + 1;
        if version <= current {
            continue;
        }

        let tx = conn.transaction().map_err(|e| Error::StoreIo {
            operation: "begin_migration".to_string(),
            cause: e.to_string(),
        })?;
        tx.execute_batch(script).map_err(|e| Error::StoreIo {
            operation: format!("migration_v{version}"),
            cause: e.to_string(),
        })?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            [version.to_string()],
        )
        .map_err(|e| Error::StoreIo {
            operation: "bump_schema_version".to_string(),
            cause: e.to_string(),
        })?;
        tx.commit().map_err(|e| Error::StoreIo {
            operation: "commit_migration".to_string(),
            cause: e.to_string(),
        })?;

        tracing::debug!(version, "Applied store migration");
    }

    Ok(())
}

/// Reads the schema version recorded in `meta` (0 for a fresh file).
pub fn schema_version(conn: &Connection) -> Result<u32> {
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|e| {
            if matches!(e, rusqlite::Error::QueryReturnedNoRows) {
                Ok(None)
            } else {
                Err(e)
            }
        })
        .map_err(|e| Error::StoreIo {
            operation: "read_schema_version".to_string(),
            cause: e.to_string(),
        })?;

    Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrate_fresh_database() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("migrate");
        assert_eq!(schema_version(&conn).expect("version"), SCHEMA_VERSION);
    }

    #[test]
    fn migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("first");
        migrate(&mut conn).expect("second");
        assert_eq!(schema_version(&conn).expect("version"), SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("migrate");
        conn.execute(
            "UPDATE meta SET value = '999' WHERE key = 'schema_version'",
            [],
        )
        .expect("bump");
        let err = migrate(&mut conn).unwrap_err();
        assert_eq!(err.kind(), "store_integrity");
    }

    #[test]
    fn all_tables_exist_after_migration() {
        let mut conn = Connection::open_in_memory().expect("open");
        migrate(&mut conn).expect("migrate");
        for table in ["memory", "vec_memory", "fts_memory", "embed_cache", "kg_relation", "meta"] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .expect("query");
            assert!(count >= 1, "missing table {table}");
        }
    }
}
