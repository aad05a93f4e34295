pub mod config;
pub mod error;
pub mod fingerprint;
pub mod matching;
pub mod persistance;
pub mod recognizer;
pub mod server;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use fingerprint::{Fingerprint, Fingerprinter, Mode};
pub use matching::{MatchResult, MatchScorer};
pub use persistance::{Database, MemoryStore, Song, SongId};
pub use recognizer::Recognizer;
