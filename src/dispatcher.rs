//! Request dispatcher (C8): the public HTTP surface.

use crate::app::{AppState, FetchCell};
use crate::codec::{self, source_hash, Format};
use crate::error::{FetchErrorKind, ProxyError, Result};
use crate::fetcher::FetchResult;
use crate::security;
use crate::store::RequestKey;
use crate::worker::TranslationJob;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;

static VIDEO_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{11}$").unwrap());

/// Same `(video_id, lang, track, fmt)` shape as the job dedup key in
/// `worker.rs`, but scoped to the fetch that happens before any job exists.
fn fetch_key(key: &RequestKey) -> String {
    format!("{}|{}|{}|{}", key.video_id, key.lang, key.track, key.fmt)
}

/// Fetch upstream once per `RequestKey`, letting concurrent duplicate
/// requests await the same in-flight call instead of issuing their own.
async fn fetch_single_flight(state: &AppState, key: &RequestKey, url: &str) -> Result<FetchResult> {
    let cache_key = fetch_key(key);

    let cell: FetchCell = {
        let mut in_flight = state.fetch_in_flight.lock().await;
        Arc::clone(
            in_flight
                .entry(cache_key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    };

    let result = cell
        .get_or_try_init(|| async {
            crate::fetcher::fetch(&state.http_client, url)
                .await
                .map_err(|e| e.to_string())
        })
        .await
        .map(|r| r.clone());

    state.fetch_in_flight.lock().await.remove(&cache_key);

    result.map_err(|message| ProxyError::UpstreamFetch {
        kind: FetchErrorKind::NonSuccessStatus,
        message,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/subtitle", get(get_subtitle))
        .route("/api/timedtext", get(get_subtitle))
        .route("/health", get(health))
        .route("/admin/stats", get(admin_stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SubtitleQuery {
    v: String,
    lang: String,
    #[serde(default)]
    tlang: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    fmt: Option<String>,
    #[serde(default)]
    original_url: Option<String>,
}

fn validate_video_id(v: &str) -> Result<()> {
    if VIDEO_ID_RE.is_match(v) {
        Ok(())
    } else {
        Err(ProxyError::InvalidVideoId)
    }
}

fn validate_language(lang: &str) -> Result<()> {
    if !lang.is_empty() && lang.len() <= 10 {
        Ok(())
    } else {
        Err(ProxyError::InvalidLanguage)
    }
}

fn upstream_url(query: &SubtitleQuery) -> String {
    if let Some(url) = &query.original_url {
        return url.clone();
    }
    format!(
        "https://www.youtube.com/api/timedtext?v={}&lang={}&kind={}&fmt={}",
        query.v,
        query.lang,
        query.kind.as_deref().unwrap_or("asr"),
        query.fmt.as_deref().unwrap_or("json3"),
    )
}

async fn get_subtitle(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubtitleQuery>,
) -> Result<Response> {
    validate_video_id(&query.v)?;
    validate_language(&query.lang)?;
    let target_lang = query.tlang.clone().unwrap_or_else(|| state.config.language.default_target_lang.clone());
    validate_language(&target_lang)?;

    let track = query.kind.clone().unwrap_or_else(|| state.config.language.default_track.clone());
    let requested_fmt = Format::from_query_param(
        query.fmt.as_deref().unwrap_or(&state.config.language.default_fmt),
    );

    let key = RequestKey {
        video_id: query.v.clone(),
        lang: target_lang.clone(),
        track: track.clone(),
        fmt: requested_fmt.as_str().to_string(),
    };

    if let Some(bilingual) = state.cache.get(&state.store, &key).await? {
        let cues = codec::parse(&bilingual, Format::Vtt)?;
        let body = codec::render(&cues, requested_fmt, state.config.segmenter.srv3_overlap_gap_ms)?;
        return Ok(subtitle_response(
            StatusCode::OK,
            body,
            "completed",
            "HIT",
            &query.v,
            None,
        ));
    }

    let url = upstream_url(&query);
    let fetch_result = fetch_single_flight(&state, &key, &url).await?;

    let hash = source_hash(&fetch_result.cues);

    if state.store.find_job(&key, &hash).await?.is_none() {
        let job = state
            .store
            .create_job(
                &key,
                &hash,
                &fetch_result.raw_body,
                fetch_result.format.as_str(),
                state.config.cache.ttl_hours as i64 * 3_600_000,
            )
            .await?;
        let _ = state
            .job_sender
            .send(TranslationJob {
                job_id: job.id,
                key: key.clone(),
                source_hash: hash,
                cues: fetch_result.cues,
                target_lang,
            })
            .await;
    }

    Ok(subtitle_response(
        StatusCode::OK,
        fetch_result.raw_body,
        "pending",
        "MISS",
        &query.v,
        Some("30"),
    ))
}

fn subtitle_response(
    status: StatusCode,
    body: String,
    translation_status: &str,
    cache_status: &str,
    video_id: &str,
    estimated_time_secs: Option<&str>,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        "X-Translation-Status",
        HeaderValue::from_str(translation_status).unwrap(),
    );
    headers.insert("X-Cache-Status", HeaderValue::from_str(cache_status).unwrap());
    headers.insert("X-Video-Id", HeaderValue::from_str(video_id).unwrap_or(HeaderValue::from_static("")));
    if let Some(eta) = estimated_time_secs {
        headers.insert("X-Estimated-Time", HeaderValue::from_str(eta).unwrap());
    }
    (status, headers, body).into_response()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    cache_hits: u64,
    cache_misses: u64,
    cache_hit_rate: f64,
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    let stats = state.cache.stats(&state.store).await?;
    Ok(Json(HealthResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        cache_hits: stats.hits,
        cache_misses: stats.misses,
        cache_hit_rate: stats.hit_rate(),
    }))
}

#[derive(Debug, Serialize)]
struct AdminStatsResponse {
    cache_hits: u64,
    cache_misses: u64,
    cache_memory_entries: usize,
}

async fn admin_stats(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Result<Json<AdminStatsResponse>> {
    let auth_header = headers.get("authorization").and_then(|v| v.to_str().ok());
    if !security::check_bearer_token(auth_header, state.config.admin_token.as_deref()) {
        return Err(ProxyError::Unauthorized);
    }

    let stats = state.cache.stats(&state.store).await?;
    Ok(Json(AdminStatsResponse {
        cache_hits: stats.hits,
        cache_misses: stats.misses,
        cache_memory_entries: state.cache.memory_len(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_video_ids() {
        assert!(validate_video_id("dQw4w9WgXcQ").is_ok());
    }

    #[test]
    fn rejects_malformed_video_ids() {
        assert!(validate_video_id("too_short").is_err());
        assert!(validate_video_id("has a space!").is_err());
    }

    #[test]
    fn rejects_overlong_language_tags() {
        assert!(validate_language("this-is-way-too-long").is_err());
        assert!(validate_language("").is_err());
        assert!(validate_language("zh-CN").is_ok());
    }

    #[test]
    fn upstream_url_prefers_original_url_when_present() {
        let query = SubtitleQuery {
            v: "dQw4w9WgXcQ".into(),
            lang: "en".into(),
            tlang: None,
            kind: None,
            fmt: None,
            original_url: Some("https://example.com/custom".into()),
        };
        assert_eq!(upstream_url(&query), "https://example.com/custom");
    }

    #[test]
    fn upstream_url_builds_youtube_timedtext_url_by_default() {
        let query = SubtitleQuery {
            v: "dQw4w9WgXcQ".into(),
            lang: "en".into(),
            tlang: None,
            kind: None,
            fmt: None,
            original_url: None,
        };
        let url = upstream_url(&query);
        assert!(url.starts_with("https://www.youtube.com/api/timedtext?v=dQw4w9WgXcQ"));
        assert!(url.contains("kind=asr"));
        assert!(url.contains("fmt=json3"));
    }
}
