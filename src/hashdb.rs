//! Known-spam / known-good hash cache.
//!
//! The cache key is a Sha256 digest of the normalized raster. Two backends
//! implement the same store contract: append-only JSON-lines partitions
//! for the local modes, and a shared SQLite database. Writes are
//! best-effort and non-transactional; on read the most recent record for a
//! digest wins.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::{HashingMode, Settings};

/// Cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    KnownSpam,
    KnownGood,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::KnownSpam => "spam",
            Self::KnownGood => "good",
        }
    }
}

/// Metadata recorded alongside a digest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HashMeta {
    pub filename: String,
    pub content_type: String,
    pub format: String,
}

/// One stored cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashRecord {
    pub digest: String,
    pub score: f32,
    pub description: String,
    #[serde(flatten)]
    pub meta: HashMeta,
    pub created: String,
}

#[derive(Debug, Error)]
pub enum HashDbError {
    #[error("hash store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hash store record error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("hash store backend error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Content digest of a normalized raster.
pub fn digest_raster(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Store contract required by the pipeline, plus the listing operations
/// the maintenance CLI uses.
pub trait HashStore: Send {
    fn get(&self, digest: &str, partition: Partition)
        -> Result<Option<(f32, String)>, HashDbError>;

    fn put(
        &mut self,
        digest: &str,
        score: f32,
        partition: Partition,
        meta: &HashMeta,
        description: &str,
    ) -> Result<(), HashDbError>;

    fn list(&self, partition: Partition) -> Result<Vec<HashRecord>, HashDbError>;

    fn remove(&mut self, digest: &str, partition: Partition) -> Result<usize, HashDbError>;
}

/// Open the backend selected by the hashing mode, or `None` when hashing
/// is disabled.
pub fn open_store(settings: &Settings) -> Result<Option<Box<dyn HashStore>>, HashDbError> {
    match settings.hashing.mode {
        HashingMode::Disabled => Ok(None),
        HashingMode::Local | HashingMode::LocalLearnHam => Ok(Some(Box::new(
            FlatFileStore::open(&settings.data_dir())?,
        ))),
        HashingMode::Shared => Ok(Some(Box::new(SqliteStore::open(
            &settings.hash_db_path(),
        )?))),
    }
}

/// Append-only JSON-lines partitions, one file per partition.
pub struct FlatFileStore {
    dir: PathBuf,
}

impl FlatFileStore {
    pub fn open(dir: &Path) -> Result<Self, HashDbError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn partition_path(&self, partition: Partition) -> PathBuf {
        self.dir.join(format!("known-{}.jsonl", partition.as_str()))
    }

    /// All records in a partition, last record per digest winning.
    fn read_partition(
        &self,
        partition: Partition,
    ) -> Result<BTreeMap<String, HashRecord>, HashDbError> {
        let path = self.partition_path(partition);
        let mut records = BTreeMap::new();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<HashRecord>(line) {
                Ok(record) => {
                    records.insert(record.digest.clone(), record);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "skipping bad cache line: {e}");
                }
            }
        }
        Ok(records)
    }
}

impl HashStore for FlatFileStore {
    fn get(
        &self,
        digest: &str,
        partition: Partition,
    ) -> Result<Option<(f32, String)>, HashDbError> {
        Ok(self
            .read_partition(partition)?
            .remove(digest)
            .map(|r| (r.score, r.description)))
    }

    fn put(
        &mut self,
        digest: &str,
        score: f32,
        partition: Partition,
        meta: &HashMeta,
        description: &str,
    ) -> Result<(), HashDbError> {
        let record = HashRecord {
            digest: digest.to_string(),
            score,
            description: description.to_string(),
            meta: meta.clone(),
            created: chrono::Utc::now().to_rfc3339(),
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.partition_path(partition))?;
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn list(&self, partition: Partition) -> Result<Vec<HashRecord>, HashDbError> {
        Ok(self.read_partition(partition)?.into_values().collect())
    }

    fn remove(&mut self, digest: &str, partition: Partition) -> Result<usize, HashDbError> {
        let mut records = self.read_partition(partition)?;
        let removed = usize::from(records.remove(digest).is_some());
        if removed > 0 {
            let mut body = String::new();
            for record in records.values() {
                body.push_str(&serde_json::to_string(record)?);
                body.push('\n');
            }
            std::fs::write(self.partition_path(partition), body)?;
        }
        Ok(removed)
    }
}

/// Shared SQLite backend; relies on SQLite's own locking for concurrent
/// external readers and writers.
pub struct SqliteStore {
    conn: rusqlite::Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, HashDbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS image_hashes (
                digest       TEXT NOT NULL,
                partition    TEXT NOT NULL,
                score        REAL NOT NULL,
                description  TEXT NOT NULL DEFAULT '',
                filename     TEXT NOT NULL DEFAULT '',
                content_type TEXT NOT NULL DEFAULT '',
                format       TEXT NOT NULL DEFAULT '',
                created      TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (digest, partition)
            );",
        )?;
        Ok(Self { conn })
    }
}

impl HashStore for SqliteStore {
    fn get(
        &self,
        digest: &str,
        partition: Partition,
    ) -> Result<Option<(f32, String)>, HashDbError> {
        let row = self
            .conn
            .query_row(
                "SELECT score, description FROM image_hashes
                 WHERE digest = ?1 AND partition = ?2",
                rusqlite::params![digest, partition.as_str()],
                |row| Ok((row.get::<_, f64>(0)? as f32, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    fn put(
        &mut self,
        digest: &str,
        score: f32,
        partition: Partition,
        meta: &HashMeta,
        description: &str,
    ) -> Result<(), HashDbError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO image_hashes
             (digest, partition, score, description, filename, content_type, format, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                digest,
                partition.as_str(),
                score as f64,
                description,
                meta.filename,
                meta.content_type,
                meta.format,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn list(&self, partition: Partition) -> Result<Vec<HashRecord>, HashDbError> {
        let mut stmt = self.conn.prepare(
            "SELECT digest, score, description, filename, content_type, format, created
             FROM image_hashes WHERE partition = ?1 ORDER BY digest",
        )?;
        let rows = stmt.query_map(rusqlite::params![partition.as_str()], |row| {
            Ok(HashRecord {
                digest: row.get(0)?,
                score: row.get::<_, f64>(1)? as f32,
                description: row.get(2)?,
                meta: HashMeta {
                    filename: row.get(3)?,
                    content_type: row.get(4)?,
                    format: row.get(5)?,
                },
                created: row.get(6)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn remove(&mut self, digest: &str, partition: Partition) -> Result<usize, HashDbError> {
        let removed = self.conn.execute(
            "DELETE FROM image_hashes WHERE digest = ?1 AND partition = ?2",
            rusqlite::params![digest, partition.as_str()],
        )?;
        Ok(removed)
    }
}
