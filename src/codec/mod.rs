//! Subtitle codec (C1): parse and render YouTube's JSON3 and SRV3 formats
//! plus WebVTT, all through one `Cue` model.

pub mod json3;
pub mod srv3;
pub mod vtt;

use crate::error::{ProxyError, Result};

/// One timed subtitle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

impl Cue {
    pub fn new(start_ms: u64, end_ms: u64, text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        if end_ms <= start_ms {
            return Err(ProxyError::Codec(format!(
                "cue end ({end_ms}) must be after start ({start_ms})"
            )));
        }
        if text.trim().is_empty() {
            return Err(ProxyError::Codec("cue text must not be empty".into()));
        }
        Ok(Self {
            start_ms,
            end_ms,
            text,
        })
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }
}

/// The three wire formats the proxy understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json3,
    Srv3,
    Vtt,
}

impl Format {
    pub fn from_query_param(s: &str) -> Self {
        match s {
            "vtt" => Self::Vtt,
            "srv3" => Self::Srv3,
            _ => Self::Json3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json3 => "json3",
            Self::Srv3 => "srv3",
            Self::Vtt => "vtt",
        }
    }
}

/// Sniff the wire format of an upstream subtitle document from its leading
/// bytes, per §4.5: `{` means JSON3, `WEBVTT` means WebVTT, otherwise SRV3.
pub fn sniff_format(body: &str) -> Format {
    let trimmed = body.trim_start();
    if trimmed.starts_with('{') {
        Format::Json3
    } else if trimmed.starts_with("WEBVTT") {
        Format::Vtt
    } else {
        Format::Srv3
    }
}

/// Parse a subtitle document of the given format into a cue list.
pub fn parse(body: &str, fmt: Format) -> Result<Vec<Cue>> {
    match fmt {
        Format::Json3 => json3::parse(body),
        Format::Srv3 => srv3::parse(body),
        Format::Vtt => vtt::parse(body),
    }
}

/// Render a cue list back into the given wire format.
pub fn render(cues: &[Cue], fmt: Format, overlap_gap_ms: u64) -> Result<String> {
    match fmt {
        Format::Json3 => Ok(json3::render(cues)),
        Format::Srv3 => Ok(srv3::render(cues, overlap_gap_ms)),
        Format::Vtt => Ok(vtt::render(cues)),
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Content fingerprint of a parsed cue sequence: 64-bit FNV-1a over the
/// canonical timestamps-and-text form, insensitive to upstream reformatting.
pub fn source_hash(cues: &[Cue]) -> String {
    let mut hash = FNV_OFFSET_BASIS;
    for cue in cues {
        for byte in format!("{}\t{}\t{}\n", cue.start_ms, cue.end_ms, cue.text).bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cue_rejects_non_positive_duration() {
        assert!(Cue::new(1000, 1000, "hi").is_err());
        assert!(Cue::new(1000, 500, "hi").is_err());
    }

    #[test]
    fn cue_rejects_empty_text() {
        assert!(Cue::new(0, 1000, "   ").is_err());
    }

    #[test]
    fn sniff_detects_json3() {
        assert_eq!(sniff_format("  {\"events\":[]}"), Format::Json3);
    }

    #[test]
    fn sniff_detects_vtt() {
        assert_eq!(sniff_format("WEBVTT\n\n1\n00:00.000 --> 00:01.000\nhi"), Format::Vtt);
    }

    #[test]
    fn sniff_defaults_to_srv3() {
        assert_eq!(sniff_format("<transcript><p t=\"0\" d=\"1000\">hi</p></transcript>"), Format::Srv3);
    }

    #[test]
    fn format_from_query_param_defaults_json3() {
        assert_eq!(Format::from_query_param("bogus"), Format::Json3);
        assert_eq!(Format::from_query_param("vtt"), Format::Vtt);
        assert_eq!(Format::from_query_param("srv3"), Format::Srv3);
    }

    #[test]
    fn source_hash_is_stable_for_equal_input() {
        let cues = vec![Cue::new(0, 1000, "hello").unwrap()];
        assert_eq!(source_hash(&cues), source_hash(&cues));
    }

    #[test]
    fn source_hash_differs_on_text_change() {
        let a = vec![Cue::new(0, 1000, "hello").unwrap()];
        let b = vec![Cue::new(0, 1000, "goodbye").unwrap()];
        assert_ne!(source_hash(&a), source_hash(&b));
    }
}
