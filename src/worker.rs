//! Translation job worker (C7): drains the in-process job channel and
//! drives each job through `pending -> translating -> {done | failed}`.

use crate::cache::Cache;
use crate::codec::{render, Cue, Format};
use crate::config::{Config, QueueConfig, SegmenterConfig};
use crate::segmenter;
use crate::store::{RequestKey, Store};
use crate::translator::Translator;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{event, Level};

/// One unit of translation work, submitted by the dispatcher on a cache miss.
pub struct TranslationJob {
    pub job_id: String,
    pub key: RequestKey,
    pub source_hash: String,
    pub cues: Vec<Cue>,
    pub target_lang: String,
}

fn in_flight_key(key: &RequestKey, source_hash: &str) -> String {
    format!("{}|{}|{}|{}|{}", key.video_id, key.lang, key.track, key.fmt, source_hash)
}

pub struct Worker {
    store: Arc<Store>,
    cache: Arc<Cache>,
    translator: Arc<Translator>,
    segmenter_config: SegmenterConfig,
    queue_config: QueueConfig,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Worker {
    pub fn new(
        store: Arc<Store>,
        cache: Arc<Cache>,
        translator: Arc<Translator>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            cache,
            translator,
            segmenter_config: config.segmenter.clone(),
            queue_config: config.queue.clone(),
            semaphore: Arc::new(Semaphore::new(config.queue.concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Consume jobs from `rx` until the channel closes, spawning one task per
    /// job bounded by `queue.concurrency` permits.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<TranslationJob>) {
        while let Some(job) = rx.recv().await {
            let dedup_key = in_flight_key(&job.key, &job.source_hash);
            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(dedup_key.clone()) {
                    event!(Level::DEBUG, job_id = %job.job_id, "job already in flight, skipping duplicate");
                    continue;
                }
            }

            let worker = Arc::clone(&self);
            let permit = Arc::clone(&self.semaphore);
            tokio::spawn(async move {
                let _permit = permit.acquire_owned().await.expect("semaphore closed");
                worker.process(job).await;
                worker.in_flight.lock().await.remove(&dedup_key);
            });
        }
    }

    async fn process(&self, job: TranslationJob) {
        event!(Level::INFO, job_id = %job.job_id, video_id = %job.key.video_id, "translating job");

        if let Err(e) = self.store.mark_translating(&job.job_id).await {
            event!(Level::ERROR, job_id = %job.job_id, error = %e, "failed to mark job translating");
            return;
        }

        match self.translate(&job).await {
            Ok(bilingual) => {
                if let Err(e) = self.store.mark_done(&job.job_id, &bilingual).await {
                    event!(Level::ERROR, job_id = %job.job_id, error = %e, "failed to persist completed job");
                    return;
                }
                self.cache.put(&job.key, bilingual);
                event!(Level::INFO, job_id = %job.job_id, "job completed");
            }
            Err(e) => self.fail(&job, &e.to_string()).await,
        }
    }

    async fn translate(&self, job: &TranslationJob) -> crate::error::Result<String> {
        let paragraphs = segmenter::segment(&job.cues, &self.segmenter_config);
        let lines: Vec<String> = paragraphs.iter().map(|c| c.text.clone()).collect();
        let bilingual_lines = self.translator.translate(&lines, &job.target_lang).await?;

        let bilingual_cues: Vec<Cue> = paragraphs
            .iter()
            .zip(bilingual_lines)
            .filter_map(|(cue, text)| Cue::new(cue.start_ms, cue.end_ms, text).ok())
            .collect();

        render(&bilingual_cues, Format::Vtt, self.segmenter_config.srv3_overlap_gap_ms)
    }

    async fn fail(&self, job: &TranslationJob, message: &str) {
        let current_retry_count = self.store_retry_count(job).await;
        let next_retry_count = current_retry_count + 1;

        let next_retry_at = if next_retry_count < self.queue_config.max_retries as i64 {
            let delay = self.queue_config.retry_base_ms * 2u64.pow(current_retry_count as u32);
            Some(chrono::Utc::now().timestamp_millis() + delay as i64)
        } else {
            None
        };

        event!(
            Level::WARN,
            job_id = %job.job_id,
            retry_count = next_retry_count,
            terminal = next_retry_at.is_none(),
            error = message,
            "job failed"
        );

        if let Err(e) = self
            .store
            .mark_failed(&job.job_id, "translation_error", message, next_retry_count, next_retry_at)
            .await
        {
            event!(Level::ERROR, job_id = %job.job_id, error = %e, "failed to record job failure");
        }
    }

    async fn store_retry_count(&self, job: &TranslationJob) -> i64 {
        match self.store.find_job(&job.key, &job.source_hash).await {
            Ok(Some(row)) => row.retry_count,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_stable_for_equal_inputs() {
        let key = RequestKey {
            video_id: "abc".into(),
            lang: "zh-CN".into(),
            track: "asr".into(),
            fmt: "json3".into(),
        };
        assert_eq!(in_flight_key(&key, "hash1"), in_flight_key(&key, "hash1"));
    }

    #[test]
    fn dedup_key_differs_on_source_hash() {
        let key = RequestKey {
            video_id: "abc".into(),
            lang: "zh-CN".into(),
            track: "asr".into(),
            fmt: "json3".into(),
        };
        assert_ne!(in_flight_key(&key, "hash1"), in_flight_key(&key, "hash2"));
    }
}
