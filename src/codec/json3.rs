//! YouTube JSON3 parse/render.

use super::Cue;
use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
struct Json3Doc {
    #[serde(default)]
    events: Vec<Json3Event>,
}

#[derive(Debug, Deserialize)]
struct Json3Event {
    #[serde(rename = "tStartMs")]
    t_start_ms: i64,
    #[serde(rename = "dDurationMs", default)]
    d_duration_ms: i64,
    #[serde(default)]
    segs: Option<Vec<Json3Seg>>,
}

#[derive(Debug, Deserialize)]
struct Json3Seg {
    #[serde(default)]
    utf8: String,
}

#[derive(Debug, Serialize)]
struct OutDoc {
    events: Vec<OutEvent>,
}

#[derive(Debug, Serialize)]
struct OutEvent {
    #[serde(rename = "tStartMs")]
    t_start_ms: i64,
    #[serde(rename = "dDurationMs")]
    d_duration_ms: i64,
    segs: Vec<OutSeg>,
}

#[derive(Debug, Serialize)]
struct OutSeg {
    utf8: String,
}

pub fn parse(body: &str) -> Result<Vec<Cue>> {
    let doc: Json3Doc = serde_json::from_str(body)
        .map_err(|e| ProxyError::Codec(format!("invalid json3 document: {e}")))?;

    let mut cues = Vec::new();
    for event in doc.events {
        let Some(segs) = event.segs else { continue };
        if segs.is_empty() {
            continue;
        }
        let text: String = segs.iter().map(|s| s.utf8.as_str()).collect();
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if event.t_start_ms < 0 || event.d_duration_ms <= 0 {
            continue;
        }
        let start = event.t_start_ms as u64;
        let end = start + event.d_duration_ms as u64;
        cues.push(Cue::new(start, end, text)?);
    }
    Ok(cues)
}

pub fn render(cues: &[Cue]) -> String {
    let doc = OutDoc {
        events: cues
            .iter()
            .map(|c| OutEvent {
                t_start_ms: c.start_ms as i64,
                d_duration_ms: c.duration_ms() as i64,
                segs: vec![OutSeg {
                    utf8: c.text.clone(),
                }],
            })
            .collect(),
    };
    serde_json::to_string(&doc).unwrap_or_else(|_| "{\"events\":[]}".to_string())
}
