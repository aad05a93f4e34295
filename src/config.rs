use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub listen_addr: String,
    /// Upper bound on request bodies, in bytes.
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let max_upload_mb: usize = std::env::var("LANDMARK_MAX_UPLOAD_MB")
            .unwrap_or_else(|_| "50".into())
            .parse()
            .context("LANDMARK_MAX_UPLOAD_MB must be a whole number of megabytes")?;

        Ok(Self {
            database_url: std::env::var("LANDMARK_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:landmark.db".into()),
            listen_addr: std::env::var("LANDMARK_LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".into()),
            max_upload_bytes: max_upload_mb * 1024 * 1024,
        })
    }
}
