//! Typed configuration surface (C10). Every field has a `serde(default)` so
//! an empty or absent config file still produces a fully working instance.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const CONFIG_FILENAME: &str = "proxy.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_port() -> u16 {
    8080
}
fn default_bind_addr() -> String {
    "0.0.0.0".into()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_addr: default_bind_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageConfig {
    #[serde(default = "default_target_lang")]
    pub default_target_lang: String,
    #[serde(default = "default_track")]
    pub default_track: String,
    #[serde(default = "default_fmt")]
    pub default_fmt: String,
}

fn default_target_lang() -> String {
    "zh-CN".into()
}
fn default_track() -> String {
    "asr".into()
}
fn default_fmt() -> String {
    "json3".into()
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            default_target_lang: default_target_lang(),
            default_track: default_track(),
            default_fmt: default_fmt(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Consecutive failures before the circuit breaker opens.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    /// Seconds the circuit stays open before allowing a half-open probe.
    #[serde(default = "default_circuit_breaker_reset_secs")]
    pub circuit_breaker_reset_secs: u64,
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".into()
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_circuit_breaker_threshold() -> u32 {
    5
}
fn default_circuit_breaker_reset_secs() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key: String::new(),
            timeout_secs: default_llm_timeout_secs(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_reset_secs: default_circuit_breaker_reset_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuidanceConfig {
    #[serde(default = "default_true")]
    pub summary_enabled: bool,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
    #[serde(default = "default_chunk_chars")]
    pub summary_chunk_chars: usize,

    #[serde(default = "default_true")]
    pub glossary_enabled: bool,
    #[serde(default = "default_glossary_max_tokens")]
    pub glossary_max_tokens: u32,
    #[serde(default = "default_chunk_chars")]
    pub glossary_chunk_chars: usize,
}

fn default_true() -> bool {
    true
}
fn default_summary_max_tokens() -> u32 {
    512
}
fn default_glossary_max_tokens() -> u32 {
    512
}
fn default_chunk_chars() -> usize {
    8000
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            summary_enabled: true,
            summary_max_tokens: default_summary_max_tokens(),
            summary_chunk_chars: default_chunk_chars(),
            glossary_enabled: true,
            glossary_max_tokens: default_glossary_max_tokens(),
            glossary_chunk_chars: default_chunk_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_preceding_lines")]
    pub preceding_lines: usize,
    #[serde(default = "default_following_lines")]
    pub following_lines: usize,
    #[serde(default = "default_context_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_batch_retries")]
    pub batch_retries: u32,
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: u32,
}

fn default_batch_size() -> usize {
    8
}
fn default_preceding_lines() -> usize {
    3
}
fn default_following_lines() -> usize {
    3
}
fn default_context_concurrency() -> usize {
    4
}
fn default_batch_retries() -> u32 {
    2
}
fn default_context_max_tokens() -> u32 {
    1024
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            preceding_lines: default_preceding_lines(),
            following_lines: default_following_lines(),
            concurrency: default_context_concurrency(),
            batch_retries: default_batch_retries(),
            max_tokens: default_context_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default = "default_queue_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

fn default_queue_concurrency() -> usize {
    2
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    2000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_queue_concurrency(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u32,
    #[serde(default = "default_lru_max_items")]
    pub lru_max_items: usize,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
}

fn default_ttl_hours() -> u32 {
    24 * 30
}
fn default_lru_max_items() -> usize {
    1000
}
fn default_cleanup_interval_ms() -> u64 {
    60 * 60 * 1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            lru_max_items: default_lru_max_items(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmenterConfig {
    #[serde(default = "default_min_duration_ms")]
    pub min_duration_ms: u64,
    #[serde(default = "default_max_duration_ms")]
    pub max_duration_ms: u64,
    #[serde(default = "default_segment_gap_ms")]
    pub segment_gap_ms: u64,
    #[serde(default)]
    pub segment_max_chars: Option<usize>,
    #[serde(default)]
    pub segment_max_words: Option<usize>,
    #[serde(default = "default_overlap_gap_ms")]
    pub srv3_overlap_gap_ms: u64,
}

fn default_min_duration_ms() -> u64 {
    3000
}
fn default_max_duration_ms() -> u64 {
    7000
}
fn default_segment_gap_ms() -> u64 {
    1200
}
fn default_overlap_gap_ms() -> u64 {
    100
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_duration_ms: default_min_duration_ms(),
            max_duration_ms: default_max_duration_ms(),
            segment_gap_ms: default_segment_gap_ms(),
            segment_max_chars: None,
            segment_max_words: None,
            srv3_overlap_gap_ms: default_overlap_gap_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub language: LanguageConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub guidance: GuidanceConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub segmenter: SegmenterConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_db_path() -> String {
    "subtitle-proxy.db".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            language: LanguageConfig::default(),
            llm: LlmConfig::default(),
            guidance: GuidanceConfig::default(),
            context: ContextConfig::default(),
            queue: QueueConfig::default(),
            cache: CacheConfig::default(),
            segmenter: SegmenterConfig::default(),
            fetch: FetchConfig::default(),
            db_path: default_db_path(),
            admin_token: None,
        }
    }
}

/// Load configuration from an optional file plus environment overrides.
///
/// A missing or malformed config file is non-fatal: the error is logged by
/// the caller and defaults are used, so a typo never prevents startup.
pub fn load_config(path: Option<&std::path::Path>) -> Config {
    let mut config: Config = path
        .map(PathBuf::from)
        .or_else(find_config_file)
        .and_then(|path| {
            let content = std::fs::read_to_string(&path).ok()?;
            match serde_json::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "config parse error, using defaults");
                    None
                }
            }
        })
        .unwrap_or_default();

    if let Ok(val) = std::env::var("PROXY_PORT") {
        if let Ok(port) = val.parse::<u16>() {
            config.server.port = port;
        }
    }
    if let Ok(val) = std::env::var("PROXY_DB_PATH") {
        config.db_path = val;
    }
    if let Ok(val) = std::env::var("PROXY_LLM_API_KEY") {
        config.llm.api_key = val;
    }
    if let Ok(val) = std::env::var("PROXY_LLM_BASE_URL") {
        config.llm.base_url = val;
    }
    if let Ok(val) = std::env::var("PROXY_ADMIN_TOKEN") {
        config.admin_token = Some(val);
    }

    config
}

fn find_config_file() -> Option<PathBuf> {
    let search_paths = [
        std::env::current_dir().ok(),
        dirs::config_dir().map(|p| p.join("bilingual-subtitle-proxy")),
    ];

    for base in search_paths.into_iter().flatten() {
        let config_path = base.join(CONFIG_FILENAME);
        if config_path.exists() {
            return Some(config_path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.language.default_target_lang, "zh-CN");
        assert_eq!(config.language.default_track, "asr");
        assert_eq!(config.language.default_fmt, "json3");
        assert_eq!(config.segmenter.min_duration_ms, 3000);
        assert_eq!(config.segmenter.max_duration_ms, 7000);
        assert_eq!(config.segmenter.segment_gap_ms, 1200);
        assert_eq!(config.segmenter.srv3_overlap_gap_ms, 100);
        assert_eq!(config.cache.lru_max_items, 1000);
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.fetch.timeout_secs, 5);
        assert!(config.admin_token.is_none());
    }

    #[test]
    fn empty_json_deserializes_to_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.context.batch_size, 8);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let json = r#"{"queue": {"maxRetries": 5}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.concurrency, 2);
        assert_eq!(config.queue.retry_base_ms, 2000);
    }

}
