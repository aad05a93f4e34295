use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use landmark::config::Config;
use landmark::{Database, MatchResult, Mode, Recognizer, SongId};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "landmark", about = "Landmark audio fingerprinting and song recognition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve,
    /// Fingerprint an audio file and add it to the catalogue
    Add {
        path: PathBuf,
        /// Song name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Identify a clip against the catalogue
    Match {
        path: PathBuf,
        /// Score as a noisy live recording
        #[arg(long)]
        live: bool,
    },
    /// List registered songs, newest first
    Songs,
    /// Remove a song and its fingerprints
    Remove { id: i64 },
    /// Remove every song and fingerprint
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("landmark=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let database = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    let recognizer = Arc::new(Recognizer::new(Arc::new(database)));

    match cli.command {
        Commands::Serve => {
            let app = landmark::server::router(recognizer, config.max_upload_bytes);
            let listener = tokio::net::TcpListener::bind(&config.listen_addr)
                .await
                .with_context(|| format!("binding {}", config.listen_addr))?;
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                addr = %config.listen_addr,
                "landmark server listening"
            );
            axum::serve(listener, app).await?;
        }
        Commands::Add { path, name } => {
            let audio = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let name = name.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "untitled".into())
            });
            let registration = recognizer.register(&name, audio).await?;
            println!(
                "added {} as song {} ({} fingerprints)",
                registration.song.name, registration.song.id, registration.fingerprint_count
            );
        }
        Commands::Match { path, live } => {
            let audio = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let identification = recognizer.identify(audio, Mode::from_live_flag(live)).await?;
            match (&identification.result, &identification.song) {
                (MatchResult::Matched { candidate, confidence, .. }, Some(song)) => println!(
                    "{} (song {}) at {:.1}s, confidence {:.0}%",
                    song.name, song.id, candidate.offset, confidence
                ),
                _ => println!("no match: {}", serde_json::to_string(&identification.result)?),
            }
        }
        Commands::Songs => {
            for song in recognizer.songs().await? {
                println!(
                    "{:>5}  {:>7.1}s  {}  {}",
                    song.id,
                    song.duration,
                    song.created_at.format("%Y-%m-%d %H:%M"),
                    song.name
                );
            }
        }
        Commands::Remove { id } => {
            if recognizer.remove(SongId(id)).await? {
                println!("removed song {id}");
            } else {
                anyhow::bail!("no song with id {id}");
            }
        }
        Commands::Clear => {
            recognizer.clear().await?;
            println!("catalogue cleared");
        }
    }

    Ok(())
}
