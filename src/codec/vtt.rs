//! WebVTT parse/render.

use super::Cue;
use crate::error::Result;

pub fn parse(body: &str) -> Result<Vec<Cue>> {
    let mut cues = Vec::new();

    for block in body.replace("\r\n", "\n").split("\n\n") {
        let mut lines = block.lines().peekable();

        while let Some(line) = lines.peek() {
            if line.trim().is_empty() || *line == "WEBVTT" || line.starts_with("NOTE") {
                lines.next();
            } else {
                break;
            }
        }

        let Some(first) = lines.peek().copied() else {
            continue;
        };
        let timing_line = if first.contains("-->") {
            lines.next().unwrap()
        } else {
            lines.next();
            match lines.next() {
                Some(l) if l.contains("-->") => l,
                _ => continue,
            }
        };

        let Some((start_str, end_str)) = timing_line.split_once("-->") else {
            continue;
        };
        let start_ms = match parse_timestamp(start_str.trim()) {
            Some(ms) => ms,
            None => continue,
        };
        let end_token = end_str.trim().split_whitespace().next().unwrap_or("");
        let end_ms = match parse_timestamp(end_token) {
            Some(ms) => ms,
            None => continue,
        };

        let text: String = lines.collect::<Vec<_>>().join("\n");
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if let Ok(cue) = Cue::new(start_ms, end_ms, text) {
            cues.push(cue);
        }
    }

    Ok(cues)
}

fn parse_timestamp(raw: &str) -> Option<u64> {
    let (time_part, frac_part) = raw.split_once('.')?;
    let fields: Vec<&str> = time_part.split(':').collect();
    let (h, m, s) = match fields.as_slice() {
        [h, m, s] => (h.parse::<u64>().ok()?, m.parse::<u64>().ok()?, s.parse::<u64>().ok()?),
        [m, s] => (0, m.parse::<u64>().ok()?, s.parse::<u64>().ok()?),
        _ => return None,
    };
    let ms: u64 = frac_part.get(0..3).unwrap_or(frac_part).parse().ok()?;
    Some(((h * 3600 + m * 60 + s) * 1000) + ms)
}

fn format_timestamp(ms: u64) -> String {
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let seconds = (ms % 60_000) / 1000;
    let millis = ms % 1000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

pub fn render(cues: &[Cue]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for (i, cue) in cues.iter().enumerate() {
        out.push_str(&format!("{}\n", i + 1));
        out.push_str(&format!(
            "{} --> {}\n",
            format_timestamp(cue.start_ms),
            format_timestamp(cue.end_ms)
        ));
        out.push_str(&cue.text);
        out.push_str("\n\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_cue_without_identifier() {
        let body = "WEBVTT\n\n00:00:00.000 --> 00:00:01.500\nHello world\n";
        let cues = parse(body).unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "Hello world");
        assert_eq!(cues[0].start_ms, 0);
        assert_eq!(cues[0].end_ms, 1500);
    }

    #[test]
    fn parses_cue_with_identifier() {
        let body = "WEBVTT\n\n1\n00:00:01.000 --> 00:00:02.000\nfirst line\n";
        let cues = parse(body).unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].start_ms, 1000);
    }

    #[test]
    fn parses_short_mmss_timestamps() {
        let body = "WEBVTT\n\n00:01.000 --> 00:02.000\nhi\n";
        let cues = parse(body).unwrap();
        assert_eq!(cues[0].start_ms, 1000);
    }

    #[test]
    fn skips_notes_and_blank_lines() {
        let body = "WEBVTT\n\nNOTE this is a comment\n\n00:00:00.000 --> 00:00:01.000\nhi\n";
        let cues = parse(body).unwrap();
        assert_eq!(cues.len(), 1);
    }

    #[test]
    fn strips_cue_settings_suffix() {
        let body = "WEBVTT\n\n00:00:00.000 --> 00:00:01.000 align:start line:0\nhi\n";
        let cues = parse(body).unwrap();
        assert_eq!(cues[0].end_ms, 1000);
    }

    #[test]
    fn render_round_trips_through_parse() {
        let cues = vec![
            Cue::new(0, 1500, "orig\ntrans").unwrap(),
            Cue::new(2000, 3000, "second").unwrap(),
        ];
        let rendered = render(&cues);
        let parsed = parse(&rendered).unwrap();
        assert_eq!(parsed, cues);
    }
}
