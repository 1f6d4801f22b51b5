//! Application state: the explicit, once-constructed context threaded
//! through every axum handler and the worker. No module-level statics.

use crate::cache::Cache;
use crate::config::Config;
use crate::fetcher::{self, FetchResult};
use crate::store::Store;
use crate::translator::Translator;
use crate::worker::{TranslationJob, Worker};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, OnceCell};

const JOB_QUEUE_CAPACITY: usize = 256;

/// One upstream fetch shared by every concurrent request for the same
/// `RequestKey`, so a burst of identical cache misses issues exactly one
/// HTTP call instead of one per request.
pub type FetchCell = Arc<OnceCell<std::result::Result<FetchResult, String>>>;

pub struct AppState {
    pub config: Config,
    pub store: Arc<Store>,
    pub cache: Arc<Cache>,
    pub http_client: reqwest::Client,
    pub job_sender: mpsc::Sender<TranslationJob>,
    pub fetch_in_flight: Mutex<HashMap<String, FetchCell>>,
    pub started_at: Instant,
}

impl AppState {
    /// Build the application context and spawn the worker loop. Returns the
    /// state alongside the worker's join handle so `main` can await a clean
    /// shutdown.
    pub async fn new(config: Config) -> crate::error::Result<(Arc<Self>, tokio::task::JoinHandle<()>)> {
        let store = Arc::new(Store::connect(&config.db_path).await?);
        let cache = Arc::new(Cache::new(&config.cache));
        let http_client = fetcher::build_client(&config.fetch);
        let translator = Arc::new(Translator::new(&config.llm, &config.guidance, &config.context));

        let (job_sender, job_receiver) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let worker = Arc::new(Worker::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            translator,
            &config,
        ));
        let worker_handle = tokio::spawn(worker.run(job_receiver));

        let state = Arc::new(Self {
            config,
            store,
            cache,
            http_client,
            job_sender,
            fetch_in_flight: Mutex::new(HashMap::new()),
            started_at: Instant::now(),
        });

        Ok((state, worker_handle))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
