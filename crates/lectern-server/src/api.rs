//! Read-only lookup endpoints the controllers use to find what to present.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use lectern_core::presentation::VerseRecord;
use lectern_core::SessionKey;
use lectern_store::{BibleRepo, BibleRow, Database, HymnDetail, HymnRepo, HymnSummary, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::server::AppState;

/// A store failure on its way to an HTTP response.
#[derive(Debug)]
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => {
                tracing::error!(error = %self.0, "lookup failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "message": self.0.to_string() }))).into_response()
    }
}

/// Run a blocking store call off the async executor.
async fn blocking<T, F>(db: &Database, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(Database) -> Result<T, StoreError> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(db))
        .await
        .map_err(|e| StoreError::Io(format!("lookup task failed: {e}")))?
        .map_err(ApiError::from)
}

#[derive(Debug, Serialize)]
pub struct BiblesResponse {
    pub bibles: Vec<BibleRow>,
}

#[derive(Debug, Serialize)]
pub struct VersesResponse {
    pub verses: Vec<VerseRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HymnQuery {
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyResponse {
    pub api_key: SessionKey,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/bibles", get(list_bibles))
        .route("/api/bibles/{shortname}", get(get_bible))
        .route("/api/hymns", get(list_hymns))
        .route("/api/hymns/{id}", get(get_hymn))
        .route("/api/generate-api-key", get(generate_api_key))
}

async fn list_bibles(State(state): State<AppState>) -> Result<Json<BiblesResponse>, ApiError> {
    let bibles = blocking(&state.db, |db| BibleRepo::new(db).list()).await?;
    Ok(Json(BiblesResponse { bibles }))
}

async fn get_bible(
    State(state): State<AppState>,
    Path(shortname): Path<String>,
) -> Result<Json<VersesResponse>, ApiError> {
    let verses = blocking(&state.db, move |db| BibleRepo::new(db).verses(&shortname)).await?;
    Ok(Json(VersesResponse { verses }))
}

async fn list_hymns(
    State(state): State<AppState>,
    Query(query): Query<HymnQuery>,
) -> Result<Json<Vec<HymnSummary>>, ApiError> {
    let hymns = blocking(&state.db, move |db| {
        let repo = HymnRepo::new(db);
        match query.q.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => repo.search(q),
            _ => repo.list(),
        }
    })
    .await?;
    Ok(Json(hymns))
}

async fn get_hymn(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<HymnDetail>, ApiError> {
    let hymn = blocking(&state.db, move |db| HymnRepo::new(db).get(id)).await?;
    Ok(Json(hymn))
}

async fn generate_api_key() -> Json<ApiKeyResponse> {
    Json(ApiKeyResponse {
        api_key: SessionKey::generate(),
    })
}
