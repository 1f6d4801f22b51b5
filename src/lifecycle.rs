//! Lifecycle (C9): startup orchestration, the cleanup ticker, the retry
//! ticker, and graceful shutdown on SIGINT/SIGTERM.

use crate::app::AppState;
use crate::codec::{self, Format};
use crate::store::RequestKey;
use crate::worker::TranslationJob;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{event, Level};

/// Cap on how many due jobs one retry tick re-enqueues, so a large backlog
/// doesn't flood the job channel in a single tick.
const RETRY_SCAN_LIMIT: i64 = 50;

/// Spawn the periodic cleanup tick that deletes expired job rows, and the
/// retry tick that re-enqueues jobs whose backoff has elapsed (§5/§7: a job
/// set back to `pending` with a future `next_retry_at` must eventually be
/// retried, not orphaned once the dispatcher sees an existing row).
pub fn spawn_cleanup_ticker(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let interval_ms = state.config.cache.cleanup_interval_ms;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp_millis();

            match state.store.cleanup_expired(now).await {
                Ok(removed) if removed > 0 => {
                    event!(Level::INFO, removed, "cleanup tick removed expired jobs");
                }
                Ok(_) => {}
                Err(e) => event!(Level::ERROR, error = %e, "cleanup tick failed"),
            }

            requeue_due_jobs(&state, now).await;
        }
    })
}

/// Scan for jobs due for a retry attempt and resend each as a fresh
/// `TranslationJob`, reconstructing cues from the row's persisted source
/// body rather than refetching upstream.
async fn requeue_due_jobs(state: &Arc<AppState>, now_ms: i64) {
    let due = match state.store.scan_due(now_ms, RETRY_SCAN_LIMIT).await {
        Ok(rows) => rows,
        Err(e) => {
            event!(Level::ERROR, error = %e, "retry scan failed");
            return;
        }
    };

    for row in due {
        let format = Format::from_query_param(&row.source_format);
        let cues = match codec::parse(&row.source_body, format) {
            Ok(cues) => cues,
            Err(e) => {
                event!(Level::ERROR, job_id = %row.id, error = %e, "could not decode persisted source for retry");
                continue;
            }
        };

        let job = TranslationJob {
            job_id: row.id.clone(),
            key: RequestKey {
                video_id: row.video_id.clone(),
                lang: row.lang.clone(),
                track: row.track.clone(),
                fmt: row.fmt.clone(),
            },
            source_hash: row.source_hash.clone(),
            cues,
            target_lang: row.lang.clone(),
        };

        event!(Level::INFO, job_id = %row.id, retry_count = row.retry_count, "re-enqueueing due job");
        if state.job_sender.send(job).await.is_err() {
            event!(Level::ERROR, job_id = %row.id, "job channel closed, dropping retry");
        }
    }
}

/// Resolves once a termination signal (Ctrl+C, or SIGTERM on Unix) arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            event!(Level::ERROR, error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => event!(Level::ERROR, error = %e, "failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    event!(Level::INFO, "shutdown signal received, draining in-flight work");
}
