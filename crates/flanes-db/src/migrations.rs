//! Ordered schema migrations.
//!
//! Each entry in [`MIGRATIONS`] is a SQL batch; entry `i` moves the schema
//! from version `i` to `i + 1`. Applied inside a transaction together with
//! the version bump, so a crash mid-migration leaves the previous version
//! intact.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::{DbError, DbResult};

/// The schema version this binary writes.
pub const SCHEMA_VERSION: i64 = 1;

const MIGRATIONS: &[&str] = &[
    // v0 -> v1: initial schema.
    "
    CREATE TABLE blobs (
        hash    TEXT PRIMARY KEY,
        size    INTEGER NOT NULL,
        data    BLOB,
        spilled INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE trees (
        hash TEXT PRIMARY KEY,
        data BLOB NOT NULL
    );
    CREATE TABLE states (
        hash TEXT PRIMARY KEY,
        data BLOB NOT NULL
    );
    CREATE TABLE intents (
        id   TEXT PRIMARY KEY,
        data TEXT NOT NULL
    );
    CREATE TABLE transitions (
        id           TEXT PRIMARY KEY,
        from_state   TEXT,
        to_state     TEXT NOT NULL,
        lane         TEXT NOT NULL,
        intent_id    TEXT NOT NULL REFERENCES intents(id),
        status       TEXT NOT NULL,
        created_at   INTEGER NOT NULL,
        eval_summary TEXT,
        tokens_in    INTEGER NOT NULL DEFAULT 0,
        tokens_out   INTEGER NOT NULL DEFAULT 0,
        api_calls    INTEGER NOT NULL DEFAULT 0,
        wall_time_ms INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX idx_transitions_lane ON transitions(lane, created_at);
    CREATE INDEX idx_transitions_to_state ON transitions(to_state);
    CREATE TABLE lanes (
        name       TEXT PRIMARY KEY,
        head_state TEXT,
        fork_base  TEXT,
        created_at INTEGER NOT NULL,
        metadata   TEXT NOT NULL DEFAULT '{}'
    );
    CREATE TABLE workspaces (
        name       TEXT PRIMARY KEY,
        lane       TEXT NOT NULL,
        base_state TEXT,
        created_at INTEGER NOT NULL,
        status     TEXT NOT NULL,
        agent_id   TEXT
    );
    CREATE TABLE stat_cache (
        workspace TEXT NOT NULL,
        path      TEXT NOT NULL,
        size      INTEGER NOT NULL,
        mtime_ns  INTEGER NOT NULL,
        inode     INTEGER NOT NULL,
        blob_hash TEXT NOT NULL,
        PRIMARY KEY (workspace, path)
    );
    CREATE INDEX idx_stat_cache_blob ON stat_cache(blob_hash);
    ",
];

/// Read the schema version recorded in `meta`, creating the table if absent.
pub fn current_version(conn: &Connection) -> DbResult<i64> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )?;
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    match version {
        None => Ok(0),
        Some(v) => v
            .parse::<i64>()
            .map_err(|_| DbError::CorruptedLedger(format!("bad schema_version: {v:?}"))),
    }
}

/// Apply all pending migrations.
pub fn apply(conn: &Connection) -> DbResult<()> {
    let mut version = current_version(conn)?;
    if version > SCHEMA_VERSION {
        return Err(DbError::SchemaTooNew {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    while version < SCHEMA_VERSION {
        let batch = MIGRATIONS[version as usize];
        conn.execute_batch("BEGIN;")?;
        let applied = conn
            .execute_batch(batch)
            .and_then(|()| {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
                     ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                    [(version + 1).to_string()],
                )
            })
            .and_then(|_| conn.execute_batch("COMMIT;"));
        if let Err(e) = applied {
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(e.into());
        }
        version += 1;
        info!(version, "applied ledger migration");
    }
    Ok(())
}
