use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::fingerprint::Fingerprint;
use crate::persistance::{FingerprintIndex, IndexEntry, Song, SongId, SongStore, StoreError};

/// In-process index and catalogue.
#[derive(Default)]
pub struct MemoryStore {
    index: RwLock<HashMap<u32, Vec<IndexEntry>>>,
    songs: RwLock<BTreeMap<SongId, Song>>,
    last_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored fingerprint records.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(read(&self.index)?.values().map(Vec::len).sum())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StoreError> {
    lock.read()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StoreError> {
    lock.write()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
}

#[async_trait]
impl FingerprintIndex for MemoryStore {
    async fn put(&self, song_id: SongId, hash: u32, offset: f64) -> Result<(), StoreError> {
        write(&self.index)?
            .entry(hash)
            .or_default()
            .push(IndexEntry { song_id, offset });
        Ok(())
    }

    async fn put_all(&self, song_id: SongId, fingerprints: &[Fingerprint]) -> Result<(), StoreError> {
        let mut index = write(&self.index)?;
        for fingerprint in fingerprints {
            index.entry(fingerprint.hash).or_default().push(IndexEntry {
                song_id,
                offset: fingerprint.time,
            });
        }
        Ok(())
    }

    async fn lookup(&self, hash: u32) -> Result<Vec<IndexEntry>, StoreError> {
        Ok(read(&self.index)?.get(&hash).cloned().unwrap_or_default())
    }

    async fn lookup_many(&self, hashes: &[u32]) -> Result<HashMap<u32, Vec<IndexEntry>>, StoreError> {
        let index = read(&self.index)?;
        Ok(hashes
            .iter()
            .filter_map(|hash| index.get(hash).map(|entries| (*hash, entries.clone())))
            .collect())
    }

    async fn delete_by_song(&self, song_id: SongId) -> Result<(), StoreError> {
        let mut index = write(&self.index)?;
        index.retain(|_, entries| {
            entries.retain(|entry| entry.song_id != song_id);
            !entries.is_empty()
        });
        Ok(())
    }
}

#[async_trait]
impl SongStore for MemoryStore {
    async fn create(&self, name: &str, duration: f64) -> Result<Song, StoreError> {
        let id = SongId(self.last_id.fetch_add(1, Ordering::Relaxed) + 1);
        let song = Song {
            id,
            name: name.to_owned(),
            duration,
            created_at: Utc::now(),
        };
        write(&self.songs)?.insert(id, song.clone());
        Ok(song)
    }

    async fn get(&self, id: SongId) -> Result<Option<Song>, StoreError> {
        Ok(read(&self.songs)?.get(&id).cloned())
    }

    async fn delete(&self, id: SongId) -> Result<bool, StoreError> {
        Ok(write(&self.songs)?.remove(&id).is_some())
    }

    async fn list_recent(&self) -> Result<Vec<Song>, StoreError> {
        let mut songs: Vec<Song> = read(&self.songs)?.values().cloned().collect();
        songs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(songs)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        write(&self.index)?.clear();
        write(&self.songs)?.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_hashes_keep_every_entry() {
        let store = MemoryStore::new();
        store.put(SongId(1), 42, 0.5).await.unwrap();
        store.put(SongId(2), 42, 1.5).await.unwrap();
        store.put(SongId(1), 7, 2.0).await.unwrap();

        let entries = store.lookup(42).await.unwrap();
        assert_eq!(
            entries,
            vec![
                IndexEntry { song_id: SongId(1), offset: 0.5 },
                IndexEntry { song_id: SongId(2), offset: 1.5 },
            ]
        );
        assert!(store.lookup(99).await.unwrap().is_empty());
        assert_eq!(store.len().unwrap(), 3);
    }

    #[tokio::test]
    async fn batch_lookup_agrees_with_single_lookups() {
        let store = MemoryStore::new();
        let fingerprints = [
            Fingerprint { hash: 1, time: 0.0 },
            Fingerprint { hash: 2, time: 0.1 },
            Fingerprint { hash: 1, time: 0.2 },
        ];
        store.put_all(SongId(3), &fingerprints).await.unwrap();

        let many = store.lookup_many(&[1, 2, 5]).await.unwrap();
        assert_eq!(many.len(), 2);
        assert_eq!(many[&1], store.lookup(1).await.unwrap());
        assert_eq!(many[&2], store.lookup(2).await.unwrap());
    }

    #[tokio::test]
    async fn deleting_a_song_leaves_the_others() {
        let store = MemoryStore::new();
        store.put(SongId(1), 42, 0.5).await.unwrap();
        store.put(SongId(2), 42, 1.5).await.unwrap();
        store.put(SongId(1), 7, 2.0).await.unwrap();

        store.delete_by_song(SongId(1)).await.unwrap();

        assert!(store.lookup(7).await.unwrap().is_empty());
        assert_eq!(store.lookup(42).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn catalogue_lists_newest_first() {
        let store = MemoryStore::new();
        let first = store.create("first", 10.0).await.unwrap();
        let second = store.create("second", 20.0).await.unwrap();
        assert_ne!(first.id, second.id);

        let listed: Vec<String> = store
            .list_recent()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(listed, vec!["second", "first"]);

        assert!(store.delete(first.id).await.unwrap());
        assert!(!store.delete(first.id).await.unwrap());
        assert_eq!(store.get(first.id).await.unwrap(), None);
        assert_eq!(store.get(second.id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn clear_drops_songs_and_fingerprints_but_not_the_id_counter() {
        let store = MemoryStore::new();
        let song = store.create("gone", 1.0).await.unwrap();
        store.put(song.id, 3, 0.0).await.unwrap();

        store.clear().await.unwrap();

        assert!(store.is_empty().unwrap());
        assert!(store.list_recent().await.unwrap().is_empty());
        assert!(store.create("next", 1.0).await.unwrap().id > song.id);
    }
}
