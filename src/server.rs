//! HTTP route handlers for the landmark service.
//!
//! Exposes song registration, clip matching and catalogue management over
//! multipart uploads and JSON responses.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::{error, warn};

use crate::error::Error;
use crate::fingerprint::Mode;
use crate::matching::{MatchResult, MatchStats};
use crate::persistance::{FingerprintIndex, Song, SongId, SongStore};
use crate::recognizer::Recognizer;

const ALLOWED_EXTENSIONS: [&str; 4] = ["mp3", "wav", "m4a", "ogg"];

pub fn router<S>(recognizer: Arc<Recognizer<S>>, max_upload_bytes: usize) -> Router
where
    S: FingerprintIndex + SongStore + 'static,
{
    Router::new()
        .route("/add", post(add::<S>))
        .route("/match", post(identify::<S>))
        .route("/songs", get(songs::<S>))
        .route("/songs/:id", delete(remove::<S>))
        .route("/clear_db", post(clear::<S>))
        .route("/health", get(|| async { "healthy" }))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(recognizer)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unprocessable(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error while processing audio".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Decode(e) => {
                warn!(error = %e, "upload could not be decoded");
                ApiError::Unprocessable(e.to_string())
            }
            e => {
                error!(error = %e, "request failed");
                ApiError::Internal
            }
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(e: MultipartError) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

/// A multipart form with one audio file and any number of text fields.
struct Upload {
    filename: Option<String>,
    audio: Vec<u8>,
    fields: HashMap<String, String>,
}

async fn read_upload(mut form: Multipart) -> Result<Upload, ApiError> {
    let mut file = None;
    let mut fields = HashMap::new();

    while let Some(field) = form.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        if name == "file" {
            let filename = field.file_name().map(str::to_owned);
            file = Some((filename, field.bytes().await?.to_vec()));
        } else {
            fields.insert(name, field.text().await?);
        }
    }

    let (filename, audio) = file.ok_or_else(|| ApiError::BadRequest("No audio file provided".into()))?;

    if let Some(name) = &filename {
        if !has_allowed_extension(name) {
            return Err(ApiError::BadRequest(
                "Only audio files (mp3, wav, m4a, ogg) are allowed".into(),
            ));
        }
    }

    Ok(Upload {
        filename,
        audio,
        fields,
    })
}

fn has_allowed_extension(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddResponse {
    message: String,
    song_id: SongId,
    fingerprint_count: usize,
}

async fn add<S>(
    State(recognizer): State<Arc<Recognizer<S>>>,
    form: Multipart,
) -> Result<Json<AddResponse>, ApiError>
where
    S: FingerprintIndex + SongStore + 'static,
{
    let upload = read_upload(form).await?;
    let name = upload
        .fields
        .get("name")
        .filter(|n| !n.trim().is_empty())
        .cloned()
        .or(upload.filename)
        .unwrap_or_else(|| "untitled".into());

    let registration = recognizer.register(&name, upload.audio).await?;

    Ok(Json(AddResponse {
        message: "Song added successfully".into(),
        song_id: registration.song.id,
        fingerprint_count: registration.fingerprint_count,
    }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResponse {
    matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    song: Option<Song>,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<f64>,
    stats: MatchStats,
}

async fn identify<S>(
    State(recognizer): State<Arc<Recognizer<S>>>,
    form: Multipart,
) -> Result<Json<MatchResponse>, ApiError>
where
    S: FingerprintIndex + SongStore + 'static,
{
    let upload = read_upload(form).await?;
    let live = upload.fields.get("isLive").is_some_and(|v| v == "true");

    let identification = recognizer
        .identify(upload.audio, Mode::from_live_flag(live))
        .await?;

    let stats = *identification.result.stats();
    let response = match (identification.result, identification.song) {
        (MatchResult::Matched { candidate, confidence, .. }, Some(song)) => MatchResponse {
            matched: true,
            song: Some(song),
            confidence: Some(confidence),
            offset: Some(candidate.offset),
            stats,
        },
        _ => MatchResponse {
            matched: false,
            song: None,
            confidence: None,
            offset: None,
            stats,
        },
    };

    Ok(Json(response))
}

async fn songs<S>(State(recognizer): State<Arc<Recognizer<S>>>) -> Result<Json<Vec<Song>>, ApiError>
where
    S: FingerprintIndex + SongStore + 'static,
{
    Ok(Json(recognizer.songs().await?))
}

async fn remove<S>(
    State(recognizer): State<Arc<Recognizer<S>>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError>
where
    S: FingerprintIndex + SongStore + 'static,
{
    if recognizer.remove(SongId(id)).await? {
        Ok(Json(json!({ "message": "Song deleted successfully" })))
    } else {
        Err(ApiError::NotFound(format!("no song with id {id}")))
    }
}

async fn clear<S>(State(recognizer): State<Arc<Recognizer<S>>>) -> Result<Json<serde_json::Value>, ApiError>
where
    S: FingerprintIndex + SongStore + 'static,
{
    recognizer.clear().await?;
    Ok(Json(json!({ "message": "Database cleared successfully" })))
}
