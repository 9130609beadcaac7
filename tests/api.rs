mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as _;

use streamhound::api::{ApiState, router};

use common::{Harness, harness, naruto_site};

fn app(h: &Harness) -> axum::Router {
    router(ApiState {
        orchestrator: h.orchestrator.clone(),
        shutdown: CancellationToken::new(),
    })
}

async fn call(app: axum::Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn post_json(app: axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, text) = call(app, request).await;
    (status, serde_json::from_str(&text).unwrap())
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::get(uri).body(Body::empty()).unwrap();
    let (status, text) = call(app, request).await;
    (status, serde_json::from_str(&text).unwrap())
}

#[tokio::test]
async fn health_reports_service() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let (status, body) = get_json(app(&h), "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "OK");
    assert_eq!(body["service"], "streamhound");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn missing_fields_are_bad_requests() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let (status, body) = post_json(
        app(&h),
        "/api/scrape-episode",
        json!({ "animeId": 20, "episodeNumber": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("animeTitle"));

    let (status, body) = post_json(
        app(&h),
        "/api/batch-scrape-episodes",
        json!({ "animeTitle": "Naruto", "animeId": "20" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("episodeNumbers"));

    let request = Request::post("/api/start-large-scrape")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, text) = call(app(&h), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn scrape_episode_returns_stream_url() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let (status, body) = post_json(
        app(&h),
        "/api/scrape-episode",
        json!({ "animeTitle": "Naruto", "animeId": 20, "episodeNumber": 1 }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["streamUrl"], site.url("stream/naruto-1"));
    assert_eq!(body["episodeData"]["animeId"], "20");
    assert_eq!(body["episodeData"]["protected"], false);
}

#[tokio::test]
async fn scrape_episode_failure_is_server_error() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let (status, body) = post_json(
        app(&h),
        "/api/scrape-episode",
        json!({
            "animeTitle": "Naruto",
            "animeId": 20,
            "episodeNumber": 2,
            "options": { "maxRetries": 1 }
        }),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("episode 2"));
}

#[tokio::test]
async fn batch_with_a_failure_is_still_ok() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let (status, body) = post_json(
        app(&h),
        "/api/batch-scrape-episodes",
        json!({ "animeTitle": "Naruto", "animeId": 20, "episodeNumbers": [1, 2, 3] }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["results"].as_array().unwrap().len(), 3);
    assert!(body["summary"]["errorCount"].as_u64().unwrap() >= 1);
    assert_eq!(body["summary"]["successCount"], 2);
    assert_eq!(body["results"][1]["status"], "failed");
}

#[tokio::test]
async fn batch_stream_ends_with_complete_event() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let request = Request::post("/api/batch-scrape-episodes-stream")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({ "animeTitle": "Naruto", "animeId": 20, "episodeNumbers": [1] }).to_string(),
        ))
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let events: Vec<Value> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|data| serde_json::from_str(data).unwrap())
        .collect();

    let kinds: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["start", "progress", "success", "complete"]);
    assert_eq!(events[3]["summary"]["successCount"], 1);
}

#[tokio::test]
async fn large_scrape_round_trip() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let (status, started) = post_json(
        app(&h),
        "/api/start-large-scrape",
        json!({ "animeId": 20, "animeTitle": "Naruto", "totalEpisodes": 3, "chunkSize": 2 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(started["totalChunks"], 2);
    let job_id = started["jobId"].as_str().unwrap().to_string();

    let (status, chunk) = post_json(
        app(&h),
        "/api/scrape-chunk",
        json!({ "animeId": 20, "chunkNumber": 2, "chunkSize": 2, "progressId": job_id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chunk["summary"]["successCount"], 1);
    assert_eq!(chunk["results"][0]["episodeNumber"], 3);

    let (status, progress) = get_json(app(&h), "/api/scraping-progress/20").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(progress["id"], job_id.as_str());
    assert_eq!(progress["completedCount"], 1);
    assert_eq!(progress["status"], "in_progress");
    assert!(progress["progressPercentage"].as_f64().unwrap() > 33.0);
}

#[tokio::test]
async fn chunk_of_unknown_job_is_not_found() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let (status, _) = post_json(
        app(&h),
        "/api/scrape-chunk",
        json!({
            "chunkNumber": 1,
            "progressId": "8a0d3c8e-5f53-4c1e-9a59-3f3e8f1b2c11"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = post_json(
        app(&h),
        "/api/scrape-chunk",
        json!({ "chunkNumber": 1, "progressId": "../../etc" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn progress_of_unknown_anime_is_not_found() {
    let site = naruto_site();
    let dir = tempfile::tempdir().unwrap();
    let h = harness(&site, dir.path());

    let (status, body) = get_json(app(&h), "/api/scraping-progress/404").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}
