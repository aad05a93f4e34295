use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::fingerprint::Fingerprint;
use crate::persistance::{FingerprintIndex, IndexEntry, Song, SongId, SongStore, StoreError};

/// Keeps `IN (...)` lists well under SQLite's bound-parameter limit.
const LOOKUP_BATCH: usize = 500;

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS songs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        duration REAL NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fingerprints (
        hash INTEGER NOT NULL,
        song_id INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
        time_offset REAL NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS fingerprints_hash ON fingerprints (hash)",
    "CREATE INDEX IF NOT EXISTS fingerprints_song ON fingerprints (song_id)",
];

type SongRow = (i64, String, f64, DateTime<Utc>);

fn song(row: SongRow) -> Song {
    let (id, name, duration, created_at) = row;
    Song {
        id: SongId(id),
        name,
        duration,
        created_at,
    }
}

pub struct Database {
    connection: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `url` and ensure the schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let connection = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(connection).await
    }

    /// A private in-memory database, mostly for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // every pooled connection would otherwise get its own empty database
        let connection = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(connection).await
    }

    async fn with_pool(connection: SqlitePool) -> Result<Self, StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&connection).await?;
        }
        Ok(Self { connection })
    }
}

#[async_trait]
impl FingerprintIndex for Database {
    async fn put(&self, song_id: SongId, hash: u32, offset: f64) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO fingerprints (hash, song_id, time_offset) VALUES (?, ?, ?)")
            .bind(hash as i64)
            .bind(song_id.0)
            .bind(offset)
            .execute(&self.connection)
            .await?;
        Ok(())
    }

    async fn put_all(&self, song_id: SongId, fingerprints: &[Fingerprint]) -> Result<(), StoreError> {
        let mut tx = self.connection.begin().await?;

        for fingerprint in fingerprints {
            sqlx::query("INSERT INTO fingerprints (hash, song_id, time_offset) VALUES (?, ?, ?)")
                .bind(fingerprint.hash as i64)
                .bind(song_id.0)
                .bind(fingerprint.time)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn lookup(&self, hash: u32) -> Result<Vec<IndexEntry>, StoreError> {
        let rows: Vec<(i64, f64)> =
            sqlx::query_as("SELECT song_id, time_offset FROM fingerprints WHERE hash = ?")
                .bind(hash as i64)
                .fetch_all(&self.connection)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(song_id, offset)| IndexEntry {
                song_id: SongId(song_id),
                offset,
            })
            .collect())
    }

    async fn lookup_many(&self, hashes: &[u32]) -> Result<HashMap<u32, Vec<IndexEntry>>, StoreError> {
        let mut found: HashMap<u32, Vec<IndexEntry>> = HashMap::new();

        for batch in hashes.chunks(LOOKUP_BATCH) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "SELECT hash, song_id, time_offset FROM fingerprints WHERE hash IN (",
            );
            let mut separated = builder.separated(", ");
            for &hash in batch {
                separated.push_bind(hash as i64);
            }
            separated.push_unseparated(")");

            let rows: Vec<(i64, i64, f64)> =
                builder.build_query_as().fetch_all(&self.connection).await?;

            for (hash, song_id, offset) in rows {
                found.entry(hash as u32).or_default().push(IndexEntry {
                    song_id: SongId(song_id),
                    offset,
                });
            }
        }

        Ok(found)
    }

    async fn delete_by_song(&self, song_id: SongId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM fingerprints WHERE song_id = ?")
            .bind(song_id.0)
            .execute(&self.connection)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SongStore for Database {
    async fn create(&self, name: &str, duration: f64) -> Result<Song, StoreError> {
        let row: SongRow = sqlx::query_as(
            r#"
            INSERT INTO songs (name, duration, created_at)
            VALUES (?, ?, ?)
            RETURNING id, name, duration, created_at
            "#,
        )
        .bind(name)
        .bind(duration)
        .bind(Utc::now())
        .fetch_one(&self.connection)
        .await?;

        Ok(song(row))
    }

    async fn get(&self, id: SongId) -> Result<Option<Song>, StoreError> {
        let row: Option<SongRow> =
            sqlx::query_as("SELECT id, name, duration, created_at FROM songs WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&self.connection)
                .await?;

        Ok(row.map(song))
    }

    async fn delete(&self, id: SongId) -> Result<bool, StoreError> {
        let mut tx = self.connection.begin().await?;
        sqlx::query("DELETE FROM fingerprints WHERE song_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM songs WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(removed > 0)
    }

    async fn list_recent(&self) -> Result<Vec<Song>, StoreError> {
        let rows: Vec<SongRow> = sqlx::query_as(
            "SELECT id, name, duration, created_at FROM songs ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.connection)
        .await?;

        Ok(rows.into_iter().map(song).collect())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut tx = self.connection.begin().await?;
        sqlx::query("DELETE FROM fingerprints").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM songs").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}
