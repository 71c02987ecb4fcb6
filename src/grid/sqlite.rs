//! SQLite implementation of the grid store.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use super::error::GridError;
use super::schema;
use super::store::{ChunkStream, GridStore, GridUpload, ObjectMetadata, Order};
use crate::blob_id::BlobId;

/// Default chunk size: 255 KiB keeps each chunk row comfortably under
/// SQLite's page-overflow sweet spot while matching common grid layouts.
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

struct Shared {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    path: PathBuf,
    files: String,
    chunks: String,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>, GridError> {
        self.conn.lock().map_err(|e| GridError::Query(e.to_string()))
    }
}

/// Grid store kept in a SQLite database, namespaced by object-group prefix.
#[derive(Clone)]
pub struct SqliteGridStore {
    shared: Arc<Shared>,
    chunk_size: usize,
}

impl std::fmt::Debug for SqliteGridStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGridStore")
            .field("path", &self.shared.path)
            .field("files", &self.shared.files)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl SqliteGridStore {
    /// Open or create a store at the given path.
    pub async fn open(path: &Path, prefix: &str) -> Result<Self, GridError> {
        schema::validate_prefix(prefix)?;
        let path = path.to_path_buf();
        let path_clone = path.clone();
        let prefix_clone = prefix.to_string();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| GridError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(GridError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(GridError::Migration)?;

            schema::migrate(&conn, &prefix_clone)?;

            Ok::<_, GridError>(conn)
        })
        .await??;

        Ok(Self::from_connection(conn, path, prefix))
    }

    /// Open a private in-memory store.
    pub fn open_in_memory(prefix: &str) -> Result<Self, GridError> {
        let conn = Connection::open_in_memory().map_err(|e| GridError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn, prefix)?;
        Ok(Self::from_connection(conn, PathBuf::from(":memory:"), prefix))
    }

    fn from_connection(conn: Connection, path: PathBuf, prefix: &str) -> Self {
        Self {
            shared: Arc::new(Shared {
                conn: Mutex::new(conn),
                path,
                files: format!("{prefix}_files"),
                chunks: format!("{prefix}_chunks"),
            }),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Chunk size used by uploads started from this handle.
    #[cfg(test)]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

fn object_exists(conn: &Connection, files: &str, key: &str) -> Result<bool, GridError> {
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {files} WHERE id = ?1"),
            [key],
            |row| row.get(0),
        )
        .optional()
        .map_err(GridError::query)?;
    Ok(found.is_some())
}

fn fetch_chunk(shared: &Shared, key: &str, n: i64) -> Result<Option<Vec<u8>>, GridError> {
    let conn = shared.lock()?;
    conn.query_row(
        &format!("SELECT data FROM {} WHERE files_id = ?1 AND n = ?2", shared.chunks),
        rusqlite::params![key, n],
        |row| row.get(0),
    )
    .optional()
    .map_err(GridError::query)
}

fn delete_object(shared: &Shared, key: &str) -> Result<bool, GridError> {
    let conn = shared.lock()?;
    let tx = conn.unchecked_transaction().map_err(GridError::query)?;
    let chunks = tx
        .execute(
            &format!("DELETE FROM {} WHERE files_id = ?1", shared.chunks),
            [key],
        )
        .map_err(GridError::query)?;
    let files = tx
        .execute(&format!("DELETE FROM {} WHERE id = ?1", shared.files), [key])
        .map_err(GridError::query)?;
    tx.commit().map_err(GridError::query)?;
    Ok(chunks + files > 0)
}

#[async_trait]
impl GridStore for SqliteGridStore {
    fn describe(&self) -> String {
        format!("grid {} ({})", self.shared.path.display(), self.shared.files)
    }

    async fn count(&self) -> Result<u64, GridError> {
        let conn = self.shared.lock()?;
        let total: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", self.shared.files),
                [],
                |row| row.get(0),
            )
            .map_err(GridError::query)?;
        Ok(total as u64)
    }

    async fn next_id(
        &self,
        previous: Option<&BlobId>,
        order: Order,
    ) -> Result<Option<BlobId>, GridError> {
        let files = &self.shared.files;
        let (op, sort) = match order {
            Order::Ascending => (">", "ASC"),
            Order::Descending => ("<", "DESC"),
        };

        let conn = self.shared.lock()?;
        let found: Option<String> = match previous {
            Some(prev) => conn.query_row(
                &format!("SELECT id FROM {files} WHERE id {op} ?1 ORDER BY id {sort} LIMIT 1"),
                [prev.to_hex()],
                |row| row.get(0),
            ),
            None => conn.query_row(
                &format!("SELECT id FROM {files} ORDER BY id {sort} LIMIT 1"),
                [],
                |row| row.get(0),
            ),
        }
        .optional()
        .map_err(GridError::query)?;

        found
            .map(|raw| {
                BlobId::parse(&raw).map_err(|_| {
                    GridError::Query(format!("malformed identifier {raw:?} in {files}"))
                })
            })
            .transpose()
    }

    async fn exists(&self, id: &BlobId) -> Result<bool, GridError> {
        let conn = self.shared.lock()?;
        object_exists(&conn, &self.shared.files, &id.to_hex())
    }

    async fn file_checksum(&self, id: &BlobId) -> Result<Option<String>, GridError> {
        let key = id.to_hex();
        let conn = self.shared.lock()?;
        if !object_exists(&conn, &self.shared.files, &key)? {
            return Ok(None);
        }

        let mut stmt = conn
            .prepare(&format!(
                "SELECT data FROM {} WHERE files_id = ?1 ORDER BY n ASC",
                self.shared.chunks
            ))
            .map_err(GridError::query)?;
        let mut rows = stmt.query([&key]).map_err(GridError::query)?;

        let mut hasher = Sha256::new();
        while let Some(row) = rows.next().map_err(GridError::query)? {
            let data: Vec<u8> = row.get(0).map_err(GridError::query)?;
            hasher.update(&data);
        }
        Ok(Some(hex::encode(hasher.finalize())))
    }

    #[cfg(test)]
    async fn metadata(&self, id: &BlobId) -> Result<Option<ObjectMetadata>, GridError> {
        let conn = self.shared.lock()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                &format!("SELECT metadata FROM {} WHERE id = ?1", self.shared.files),
                [id.to_hex()],
                |row| row.get(0),
            )
            .optional()
            .map_err(GridError::query)?;

        match raw {
            None => Ok(None),
            Some(None) => Ok(Some(ObjectMetadata::default())),
            Some(Some(json)) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| GridError::Query(format!("bad metadata for {id}: {e}"))),
        }
    }

    async fn open_download(&self, id: &BlobId) -> Result<ChunkStream, GridError> {
        if !self.exists(id).await? {
            return Err(GridError::NotFound(id.to_hex()));
        }

        let shared = Arc::clone(&self.shared);
        let key = id.to_hex();
        let chunks = stream::try_unfold(0i64, move |n| {
            let shared = Arc::clone(&shared);
            let key = key.clone();
            async move {
                let data = fetch_chunk(&shared, &key, n)?;
                Ok(data.map(|data| (Bytes::from(data), n + 1)))
            }
        });
        Ok(chunks.boxed())
    }

    async fn start_upload(&self, id: &BlobId) -> Result<Box<dyn GridUpload>, GridError> {
        let key = id.to_hex();
        {
            let conn = self.shared.lock()?;
            if object_exists(&conn, &self.shared.files, &key)? {
                return Err(GridError::AlreadyExists(key));
            }
            let cleared = conn
                .execute(
                    &format!("DELETE FROM {} WHERE files_id = ?1", self.shared.chunks),
                    [&key],
                )
                .map_err(GridError::query)?;
            if cleared > 0 {
                tracing::debug!(id = %id, chunks = cleared, "Cleared chunks of an abandoned upload");
            }
        }

        Ok(Box::new(SqliteUpload {
            shared: Arc::clone(&self.shared),
            key,
            chunk_size: self.chunk_size,
            buffer: Vec::with_capacity(self.chunk_size),
            next_n: 0,
            length: 0,
        }))
    }

    async fn delete(&self, id: &BlobId) -> Result<bool, GridError> {
        delete_object(&self.shared, &id.to_hex())
    }
}

struct SqliteUpload {
    shared: Arc<Shared>,
    key: String,
    chunk_size: usize,
    buffer: Vec<u8>,
    next_n: i64,
    length: u64,
}

impl SqliteUpload {
    fn flush_chunk(&mut self, len: usize) -> Result<(), GridError> {
        let chunk: Vec<u8> = self.buffer.drain(..len).collect();
        let conn = self.shared.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (files_id, n, data) VALUES (?1, ?2, ?3)",
                self.shared.chunks
            ),
            rusqlite::params![self.key, self.next_n, chunk],
        )
        .map_err(GridError::query)?;
        drop(conn);
        self.next_n += 1;
        Ok(())
    }
}

#[async_trait]
impl GridUpload for SqliteUpload {
    async fn write(&mut self, data: &[u8]) -> Result<(), GridError> {
        self.buffer.extend_from_slice(data);
        self.length += data.len() as u64;
        while self.buffer.len() >= self.chunk_size {
            self.flush_chunk(self.chunk_size)?;
        }
        Ok(())
    }

    async fn finish(&mut self, metadata: &ObjectMetadata) -> Result<u64, GridError> {
        if !self.buffer.is_empty() {
            self.flush_chunk(self.buffer.len())?;
        }

        let metadata_json = if metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(metadata).map_err(|e| GridError::Query(e.to_string()))?)
        };

        let conn = self.shared.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, length, chunk_size, upload_date, metadata) VALUES (?1, ?2, ?3, ?4, ?5)",
                self.shared.files
            ),
            rusqlite::params![
                self.key,
                self.length as i64,
                self.chunk_size as i64,
                Utc::now().timestamp_millis(),
                metadata_json,
            ],
        )
        .map_err(GridError::query)?;

        Ok(self.length)
    }

    async fn discard(self: Box<Self>) -> bool {
        match delete_object(&self.shared, &self.key) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(id = %self.key, error = %e, "Failed to discard grid upload");
                false
            }
        }
    }
}
