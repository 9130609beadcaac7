use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::app::events;
use crate::app::orchestrator::Orchestrator;
use crate::error::ScrapeError;
use crate::model::{ScrapeOptions, ScrapeRequest};

pub const SERVICE_NAME: &str = "streamhound";

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
    /// Cancelled at shutdown; every request runs on a child token.
    pub shutdown: CancellationToken,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/scrape-episode", post(scrape_episode))
        .route("/api/test-scraper", post(test_scraper))
        .route("/api/scrape-all-episodes", post(scrape_all_episodes))
        .route("/api/batch-scrape-episodes", post(batch_scrape))
        .route("/api/batch-scrape-episodes-stream", post(batch_scrape_stream))
        .route("/api/start-large-scrape", post(start_large_scrape))
        .route("/api/scrape-chunk", post(scrape_chunk))
        .route("/api/scraping-progress/:anime_id", get(scraping_progress))
        .with_state(state)
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ScrapeError> for ApiError {
    fn from(err: ScrapeError) -> Self {
        let status = match err {
            ScrapeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Ids arrive as JSON numbers from some clients and as strings from others.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum AnimeId {
    Number(i64),
    Text(String),
}

impl AnimeId {
    fn into_key(self) -> Option<String> {
        let key = match self {
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.trim().to_string(),
        };
        (!key.is_empty()).then_some(key)
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ApiError> {
    value.ok_or_else(|| ApiError::bad_request(format!("{field} is required")))
}

fn required_title(value: Option<String>) -> Result<String, ApiError> {
    let title = required(value, "animeTitle")?;
    let title = title.trim().to_string();
    if title.is_empty() {
        return Err(ApiError::bad_request("animeTitle is required"));
    }
    Ok(title)
}

fn required_id(value: Option<AnimeId>) -> Result<String, ApiError> {
    required(value.and_then(AnimeId::into_key), "animeId")
}

fn positive(value: Option<u32>, field: &str) -> Result<u32, ApiError> {
    match required(value, field)? {
        0 => Err(ApiError::bad_request(format!("{field} must be positive"))),
        n => Ok(n),
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "OK",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeEpisodeBody {
    anime_title: Option<String>,
    anime_id: Option<AnimeId>,
    episode_number: Option<u32>,
    #[serde(default)]
    options: ScrapeOptions,
}

async fn scrape_episode(
    State(state): State<ApiState>,
    body: Result<Json<ScrapeEpisodeBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let title = required_title(body.anime_title)?;
    let anime_id = required_id(body.anime_id)?;
    let episode_number = positive(body.episode_number, "episodeNumber")?;

    let request = ScrapeRequest {
        title,
        episode_number,
        options: body.options,
    };
    let cancel = state.shutdown.child_token();
    let record = state
        .orchestrator
        .scrape_single(&anime_id, &request, &cancel)
        .await?;

    Ok(Json(json!({
        "success": true,
        "streamUrl": record.stream_url,
        "message": format!("episode {episode_number} scraped"),
        "episodeData": record,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TestScraperBody {
    anime_title: Option<String>,
    episode_number: Option<u32>,
}

async fn test_scraper(
    State(state): State<ApiState>,
    body: Result<Json<TestScraperBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let title = required_title(body.anime_title)?;
    let episode_number = body.episode_number.unwrap_or(1).max(1);

    match state
        .orchestrator
        .test_scraper(&title, episode_number)
        .await
    {
        Ok(report) => {
            let message = if report.degraded {
                "resolved, but no stream found on the page"
            } else {
                "scraper works"
            };
            Ok(Json(json!({
                "success": true,
                "message": message,
                "details": report,
            }))
            .into_response())
        }
        Err(err) => Ok((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "message": "scraper test failed",
                "details": { "error": err.to_string() },
            })),
        )
            .into_response()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeAllBody {
    anime_title: Option<String>,
    anime_id: Option<AnimeId>,
    max_episodes: Option<u32>,
    #[serde(default)]
    options: ScrapeOptions,
}

async fn scrape_all_episodes(
    State(state): State<ApiState>,
    body: Result<Json<ScrapeAllBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let title = required_title(body.anime_title)?;
    let anime_id = required_id(body.anime_id)?;
    let max_episodes = positive(body.max_episodes, "maxEpisodes")?;

    let cancel = state.shutdown.child_token();
    let report = state
        .orchestrator
        .scrape_all(&title, &anime_id, max_episodes, &body.options, &cancel)
        .await;

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "scraped {} of {} episodes",
            report.summary.success_count, report.summary.total_episodes
        ),
        "data": report,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchBody {
    anime_title: Option<String>,
    anime_id: Option<AnimeId>,
    episode_numbers: Option<Vec<u32>>,
    #[serde(default)]
    options: ScrapeOptions,
}

struct BatchInput {
    title: String,
    anime_id: String,
    episodes: Vec<u32>,
    options: ScrapeOptions,
}

impl TryFrom<BatchBody> for BatchInput {
    type Error = ApiError;

    fn try_from(body: BatchBody) -> Result<Self, Self::Error> {
        let episodes = required(body.episode_numbers, "episodeNumbers")?;
        if episodes.contains(&0) {
            return Err(ApiError::bad_request("episodeNumbers must be positive"));
        }
        Ok(Self {
            title: required_title(body.anime_title)?,
            anime_id: required_id(body.anime_id)?,
            episodes,
            options: body.options,
        })
    }
}

async fn batch_scrape(
    State(state): State<ApiState>,
    body: Result<Json<BatchBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let input = BatchInput::try_from(body)?;

    let cancel = state.shutdown.child_token();
    let report = state
        .orchestrator
        .scrape_batch(
            &input.title,
            &input.anime_id,
            &input.episodes,
            &input.options,
            &cancel,
        )
        .await;

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "batch finished: {} succeeded, {} failed",
            report.summary.success_count, report.summary.error_count
        ),
        "results": report.results,
        "summary": report.summary,
    })))
}

async fn batch_scrape_stream(
    State(state): State<ApiState>,
    body: Result<Json<BatchBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body?;
    let input = BatchInput::try_from(body)?;

    let (tx, rx) = events::channel(state.orchestrator.config().event_buffer);
    let cancel = state.shutdown.child_token();
    // Dropping the response stream (client gone) cancels the batch.
    let guard = cancel.clone().drop_guard();

    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(async move {
        orchestrator
            .scrape_batch_with_progress(
                &input.title,
                &input.anime_id,
                &input.episodes,
                &input.options,
                &cancel,
                &tx,
            )
            .await;
    });

    let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let event = rx.recv().await?;
        let sse = Event::default()
            .json_data(&event)
            .unwrap_or_else(|err| Event::default().event("error").data(err.to_string()));
        Some((Ok::<_, Infallible>(sse), (rx, guard)))
    });

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeBody {
    anime_id: Option<AnimeId>,
    anime_title: Option<String>,
    total_episodes: Option<u32>,
    chunk_size: Option<u32>,
}

const DEFAULT_CHUNK_SIZE: u32 = 10;

async fn start_large_scrape(
    State(state): State<ApiState>,
    body: Result<Json<StartLargeBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let anime_id = required_id(body.anime_id)?;
    let title = required_title(body.anime_title)?;
    let total_episodes = positive(body.total_episodes, "totalEpisodes")?;
    let chunk_size = positive(
        Some(body.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)),
        "chunkSize",
    )?;

    let job = state
        .orchestrator
        .start_large_job(&anime_id, &title, total_episodes, chunk_size)
        .await?;

    Ok(Json(json!({
        "success": true,
        "jobId": job.id,
        "totalEpisodes": job.total_episodes,
        "totalChunks": job.total_chunks,
        "chunkSize": job.chunk_size,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeChunkBody {
    /// Checked against the job when present. `animeTitle` and `chunkSize`
    /// are accepted but the job's own values win.
    anime_id: Option<AnimeId>,
    chunk_number: Option<u32>,
    progress_id: Option<String>,
    #[serde(default)]
    options: ScrapeOptions,
}

async fn scrape_chunk(
    State(state): State<ApiState>,
    body: Result<Json<ScrapeChunkBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let job_id = required(body.progress_id, "progressId")?;
    let chunk_number = positive(body.chunk_number, "chunkNumber")?;

    let Some(job) = state.orchestrator.job(&job_id).await.map_err(|err| {
        if uuid::Uuid::parse_str(job_id.trim()).is_err() {
            ApiError::bad_request(format!("invalid progressId: {job_id}"))
        } else {
            ApiError::from(err)
        }
    })?
    else {
        return Err(ApiError::not_found(format!("job not found: {job_id}")));
    };
    if let Some(anime_id) = body.anime_id.and_then(AnimeId::into_key) {
        if anime_id != job.content_id {
            return Err(ApiError::bad_request(format!(
                "job {job_id} belongs to {}, not {anime_id}",
                job.content_id
            )));
        }
    }

    let cancel = state.shutdown.child_token();
    let chunk = state
        .orchestrator
        .scrape_chunk(&job.id, chunk_number, &body.options, &cancel)
        .await?;

    Ok(Json(json!({
        "success": true,
        "results": chunk.report.results,
        "summary": chunk.report.summary,
    })))
}

async fn scraping_progress(
    State(state): State<ApiState>,
    Path(anime_id): Path<String>,
) -> ApiResult {
    let report = state
        .orchestrator
        .progress(&anime_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no scraping job for {anime_id}")))?;

    let mut value = serde_json::to_value(&report)
        .map_err(|err| ApiError::from(ScrapeError::Persistence(err.to_string())))?;
    if let Value::Object(map) = &mut value {
        map.insert("success".to_string(), Value::Bool(true));
    }
    Ok(Json(value))
}
