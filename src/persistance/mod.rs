//! Storage collaborators: the fingerprint index and the song catalogue.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;

pub mod database;
pub mod memory;

pub use database::Database;
pub use memory::MemoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SongId(pub i64);

impl fmt::Display for SongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: SongId,
    pub name: String,
    /// Seconds.
    pub duration: f64,
    pub created_at: DateTime<Utc>,
}

/// A stored occurrence of a hash.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexEntry {
    pub song_id: SongId,
    pub offset: f64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait FingerprintIndex: Send + Sync {
    async fn put(&self, song_id: SongId, hash: u32, offset: f64) -> Result<(), StoreError>;

    async fn put_all(&self, song_id: SongId, fingerprints: &[Fingerprint]) -> Result<(), StoreError> {
        for fingerprint in fingerprints {
            self.put(song_id, fingerprint.hash, fingerprint.time).await?;
        }
        Ok(())
    }

    async fn lookup(&self, hash: u32) -> Result<Vec<IndexEntry>, StoreError>;

    /// Look up several hashes at once. Hashes without entries may be absent
    /// from the returned map.
    async fn lookup_many(&self, hashes: &[u32]) -> Result<HashMap<u32, Vec<IndexEntry>>, StoreError> {
        let mut found = HashMap::with_capacity(hashes.len());
        for &hash in hashes {
            let entries = self.lookup(hash).await?;
            if !entries.is_empty() {
                found.insert(hash, entries);
            }
        }
        Ok(found)
    }

    async fn delete_by_song(&self, song_id: SongId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SongStore: Send + Sync {
    async fn create(&self, name: &str, duration: f64) -> Result<Song, StoreError>;

    async fn get(&self, id: SongId) -> Result<Option<Song>, StoreError>;

    /// Returns whether a song was removed.
    async fn delete(&self, id: SongId) -> Result<bool, StoreError>;

    /// Newest first.
    async fn list_recent(&self) -> Result<Vec<Song>, StoreError>;

    /// Drop every song together with all stored fingerprints.
    async fn clear(&self) -> Result<(), StoreError>;
}
