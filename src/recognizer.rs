//! Registration and identification on top of a store.
//!
//! Decoding and fingerprinting are CPU bound and run on the blocking pool;
//! everything else is plain async store traffic.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::fingerprint::{
    decode, fingerprint_pcm, flatten, Fingerprint, Mode, BYTES_PER_SAMPLE, SAMPLE_RATE,
};
use crate::matching::{MatchResult, MatchScorer};
use crate::persistance::{FingerprintIndex, Song, SongId, SongStore};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub song: Song,
    pub fingerprint_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Identification {
    pub result: MatchResult,
    /// The matched song's record, when there is a match and it still exists.
    pub song: Option<Song>,
}

pub struct Recognizer<S> {
    store: Arc<S>,
}

impl<S> Recognizer<S>
where
    S: FingerprintIndex + SongStore + 'static,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decode an uploaded file, fingerprint it and store it under `name`.
    #[instrument(skip(self, audio), fields(bytes = audio.len()))]
    pub async fn register(&self, name: &str, audio: Vec<u8>) -> Result<Registration> {
        let pcm = decode_blocking(audio).await?;
        self.register_pcm(name, pcm).await
    }

    pub async fn register_pcm(&self, name: &str, pcm: Vec<u8>) -> Result<Registration> {
        let duration = (pcm.len() / BYTES_PER_SAMPLE) as f64 / SAMPLE_RATE as f64;
        let fingerprints = fingerprint_blocking(pcm, Mode::File).await?;

        let song = self.store.create(name, duration).await?;
        if let Err(e) = self.store.put_all(song.id, &fingerprints).await {
            warn!(song = %song.id, error = %e, "storing fingerprints failed, rolling back song");
            if let Err(rollback) = self.store.delete_by_song(song.id).await {
                warn!(song = %song.id, error = %rollback, "could not remove partial fingerprints");
            }
            if let Err(rollback) = self.store.delete(song.id).await {
                warn!(song = %song.id, error = %rollback, "could not remove song row");
            }
            return Err(e.into());
        }

        info!(song = %song.id, name, duration, fingerprints = fingerprints.len(), "song registered");

        Ok(Registration {
            song,
            fingerprint_count: fingerprints.len(),
        })
    }

    /// Decode a clip and identify it.
    #[instrument(skip(self, audio), fields(bytes = audio.len()))]
    pub async fn identify(&self, audio: Vec<u8>, mode: Mode) -> Result<Identification> {
        let pcm = decode_blocking(audio).await?;
        self.identify_pcm(pcm, mode).await
    }

    pub async fn identify_pcm(&self, pcm: Vec<u8>, mode: Mode) -> Result<Identification> {
        let fingerprints = fingerprint_blocking(pcm, mode).await?;
        let result = MatchScorer::new(self.store.as_ref())
            .score(&fingerprints, mode)
            .await?;

        let song = match result.matched_song() {
            Some(id) => self.store.get(id).await?,
            None => None,
        };

        match &song {
            Some(song) => info!(song = %song.id, name = %song.name, confidence = result.confidence(), "match found"),
            None => info!(stats = ?result.stats(), "no confident match"),
        }

        Ok(Identification { result, song })
    }

    pub async fn songs(&self) -> Result<Vec<Song>> {
        Ok(self.store.list_recent().await?)
    }

    /// Remove a song and its fingerprints. Returns whether the song existed.
    pub async fn remove(&self, id: SongId) -> Result<bool> {
        self.store.delete_by_song(id).await?;
        let removed = self.store.delete(id).await?;
        if removed {
            info!(song = %id, "song removed");
        }
        Ok(removed)
    }

    /// Empty the catalogue and the fingerprint index.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await?;
        info!("catalogue cleared");
        Ok(())
    }
}

async fn decode_blocking(audio: Vec<u8>) -> Result<Vec<u8>> {
    Ok(tokio::task::spawn_blocking(move || decode::ingest(&audio)).await??)
}

async fn fingerprint_blocking(pcm: Vec<u8>, mode: Mode) -> Result<Vec<Fingerprint>> {
    Ok(tokio::task::spawn_blocking(move || flatten(fingerprint_pcm(&pcm, mode))).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::persistance::{IndexEntry, MemoryStore, StoreError};
    use crate::test_support::{pcm_to_samples, wav_bytes, white_noise};

    fn recognizer() -> Recognizer<MemoryStore> {
        Recognizer::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn registered_pcm_is_identified() {
        let recognizer = recognizer();
        let song = white_noise(6.0, 7);
        let registration = recognizer.register_pcm("noise", song.clone()).await.unwrap();

        assert!(registration.fingerprint_count > 0);
        assert!((registration.song.duration - 6.0).abs() < 1e-3);

        // a 3 second excerpt starting 86 frames in
        let start = 86 * 256 * BYTES_PER_SAMPLE;
        let clip = song[start..start + 3 * SAMPLE_RATE as usize * BYTES_PER_SAMPLE].to_vec();
        let identification = recognizer.identify_pcm(clip, Mode::File).await.unwrap();

        assert_eq!(identification.song.map(|s| s.name), Some("noise".to_string()));
        let MatchResult::Matched { candidate, .. } = identification.result else {
            panic!("expected a match");
        };
        assert!((candidate.offset - 1.0).abs() < 0.06);
    }

    #[tokio::test]
    async fn unknown_audio_is_not_matched() {
        let recognizer = recognizer();
        recognizer.register_pcm("noise", white_noise(4.0, 7)).await.unwrap();

        let identification = recognizer
            .identify_pcm(white_noise(3.0, 1234), Mode::File)
            .await
            .unwrap();

        assert!(!identification.result.is_match());
        assert!(identification.song.is_none());
    }

    #[tokio::test]
    async fn wav_upload_is_decoded_and_registered() {
        let recognizer = recognizer();
        let samples = pcm_to_samples(&white_noise(4.0, 21));
        let wav = wav_bytes(&samples, SAMPLE_RATE, 1);

        let registration = recognizer.register("upload.wav", wav.clone()).await.unwrap();
        assert!(registration.fingerprint_count > 0);

        let identification = recognizer.identify(wav, Mode::File).await.unwrap();
        assert_eq!(identification.result.matched_song(), Some(registration.song.id));
    }

    #[tokio::test]
    async fn undecodable_upload_is_a_decode_error() {
        let recognizer = recognizer();
        let err = recognizer.register("junk", b"not audio".to_vec()).await.unwrap_err();

        assert!(matches!(err, Error::Decode(_)));
        assert!(recognizer.songs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cleared_catalogue_matches_nothing() {
        let recognizer = recognizer();
        let pcm = white_noise(4.0, 7);
        recognizer.register_pcm("noise", pcm.clone()).await.unwrap();
        recognizer.register_pcm("other", white_noise(2.0, 8)).await.unwrap();

        recognizer.clear().await.unwrap();

        assert!(recognizer.songs().await.unwrap().is_empty());
        assert!(recognizer.store().is_empty().unwrap());
        let identification = recognizer.identify_pcm(pcm, Mode::File).await.unwrap();
        assert!(!identification.result.is_match());
    }

    /// Catalogue that works but refuses batch fingerprint writes.
    #[derive(Default)]
    struct FullDisk {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl FingerprintIndex for FullDisk {
        async fn put(&self, song_id: SongId, hash: u32, offset: f64) -> Result<(), StoreError> {
            self.inner.put(song_id, hash, offset).await
        }

        async fn put_all(&self, _: SongId, _: &[Fingerprint]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }

        async fn lookup(&self, hash: u32) -> Result<Vec<IndexEntry>, StoreError> {
            self.inner.lookup(hash).await
        }

        async fn delete_by_song(&self, song_id: SongId) -> Result<(), StoreError> {
            self.inner.delete_by_song(song_id).await
        }
    }

    #[async_trait::async_trait]
    impl SongStore for FullDisk {
        async fn create(&self, name: &str, duration: f64) -> Result<Song, StoreError> {
            self.inner.create(name, duration).await
        }

        async fn get(&self, id: SongId) -> Result<Option<Song>, StoreError> {
            self.inner.get(id).await
        }

        async fn delete(&self, id: SongId) -> Result<bool, StoreError> {
            self.inner.delete(id).await
        }

        async fn list_recent(&self) -> Result<Vec<Song>, StoreError> {
            self.inner.list_recent().await
        }

        async fn clear(&self) -> Result<(), StoreError> {
            self.inner.clear().await
        }
    }

    #[tokio::test]
    async fn failed_fingerprint_write_rolls_the_song_back() {
        let recognizer = Recognizer::new(Arc::new(FullDisk::default()));

        let err = recognizer
            .register_pcm("noise", white_noise(3.0, 7))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Store(StoreError::Unavailable(_))));
        assert!(recognizer.songs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removed_songs_no_longer_match() {
        let recognizer = recognizer();
        let pcm = white_noise(4.0, 7);
        let registration = recognizer.register_pcm("noise", pcm.clone()).await.unwrap();

        assert!(recognizer.remove(registration.song.id).await.unwrap());
        assert!(!recognizer.remove(registration.song.id).await.unwrap());
        assert!(recognizer.store().is_empty().unwrap());

        let identification = recognizer.identify_pcm(pcm, Mode::File).await.unwrap();
        assert!(!identification.result.is_match());
    }
}
