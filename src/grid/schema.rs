//! Grid schema definitions and migrations.
//!
//! Objects live in two tables per object-group prefix: `<prefix>_files`
//! holds one row per committed object and `<prefix>_chunks` holds its bytes
//! split into fixed-size chunks numbered from zero.

use rusqlite::Connection;

use super::error::GridError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 1;

fn schema_v1(prefix: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {prefix}_files (
    id TEXT PRIMARY KEY NOT NULL,
    length INTEGER NOT NULL,
    chunk_size INTEGER NOT NULL,
    upload_date INTEGER NOT NULL,
    metadata TEXT
);

CREATE TABLE IF NOT EXISTS {prefix}_chunks (
    files_id TEXT NOT NULL,
    n INTEGER NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (files_id, n)
);
"#
    )
}

/// Reject prefixes that could not safely be spliced into table names.
pub(crate) fn validate_prefix(prefix: &str) -> Result<(), GridError> {
    let valid = !prefix.is_empty()
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(GridError::InvalidPrefix(prefix.to_string()))
    }
}

/// Get the current schema version from the database.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, GridError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), GridError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Initialize or migrate the tables for `prefix`.
///
/// Idempotent. The DDL is re-applied on every open because one database may
/// hold several prefixes while `user_version` is database-wide.
pub(crate) fn migrate(conn: &Connection, prefix: &str) -> Result<(), GridError> {
    validate_prefix(prefix)?;
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(GridError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    conn.execute_batch(&schema_v1(prefix))?;

    if current_version < SCHEMA_VERSION {
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized grid schema at version {}", SCHEMA_VERSION);
    }

    Ok(())
}
