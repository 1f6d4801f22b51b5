//! Upstream fetcher (C5): retrieves the raw subtitle document for a video
//! and normalizes it into cues.

use crate::codec::{self, sniff_format, Cue, Format};
use crate::config::FetchConfig;
use crate::error::{FetchErrorKind, ProxyError, Result};
use std::time::Duration;
use tracing::{event, Level};

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub raw_body: String,
    pub format: Format,
    pub cues: Vec<Cue>,
}

/// Build the shared, connection-pooled client used for all upstream fetches.
/// Constructed once in `AppState::new` and threaded through explicitly.
pub fn build_client(config: &FetchConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(5))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .gzip(true)
        .brotli(true)
        .user_agent(USER_AGENT)
        .build()
        .expect("failed to build upstream fetch client")
}

/// Fetch and parse a timed-text document from `url`.
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<FetchResult> {
    event!(Level::DEBUG, url, "fetching upstream subtitle document");

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProxyError::UpstreamFetch {
                kind: FetchErrorKind::Timeout,
                message: e.to_string(),
            }
        } else {
            ProxyError::UpstreamFetch {
                kind: FetchErrorKind::ConnectionFailed,
                message: e.to_string(),
            }
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProxyError::UpstreamFetch {
            kind: FetchErrorKind::NonSuccessStatus,
            message: format!("upstream returned {status}"),
        });
    }

    let body = response.text().await.map_err(ProxyError::Http)?;
    if body.trim().is_empty() {
        return Err(ProxyError::UpstreamFetch {
            kind: FetchErrorKind::MalformedBody,
            message: "upstream returned an empty document".into(),
        });
    }

    let format = sniff_format(&body);
    let cues = codec::parse(&body, format).map_err(|e| ProxyError::UpstreamFetch {
        kind: FetchErrorKind::MalformedBody,
        message: e.to_string(),
    })?;

    Ok(FetchResult {
        raw_body: body,
        format,
        cues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_default_config() {
        let config = FetchConfig::default();
        let _client = build_client(&config);
    }
}
