//! YouTube SRV3 (timedtext XML) parse/render.

use super::Cue;
use crate::error::{ProxyError, Result};
use quick_xml::events::Event;
use quick_xml::Reader;

pub fn parse(body: &str) -> Result<Vec<Cue>> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(false);

    let mut cues = Vec::new();
    let mut buf = Vec::new();

    let mut in_p = false;
    let mut p_start: i64 = 0;
    let mut p_dur: i64 = 0;
    let mut text = String::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| ProxyError::Codec(format!("malformed srv3 xml: {e}")))?
        {
            Event::Eof => break,
            Event::Start(e) if e.local_name().as_ref() == b"p" => {
                in_p = true;
                p_start = 0;
                p_dur = 0;
                text.clear();
                for attr in e.attributes().flatten() {
                    let key = attr.key.local_name();
                    let value = attr
                        .decode_and_unescape_value(reader.decoder())
                        .unwrap_or_default();
                    match key.as_ref() {
                        b"t" => p_start = value.parse().unwrap_or(0),
                        b"d" => p_dur = value.parse().unwrap_or(0),
                        _ => {}
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"p" => {
                if in_p {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() && p_dur > 0 && p_start >= 0 {
                        if let Ok(cue) =
                            Cue::new(p_start as u64, (p_start + p_dur) as u64, trimmed)
                        {
                            cues.push(cue);
                        }
                    }
                }
                in_p = false;
            }
            Event::Start(e) if in_p && e.local_name().as_ref() == b"br" => {
                text.push('\n');
            }
            Event::Empty(e) if in_p && e.local_name().as_ref() == b"br" => {
                text.push('\n');
            }
            Event::Text(e) if in_p => {
                let decoded = e
                    .unescape()
                    .map_err(|err| ProxyError::Codec(format!("bad srv3 text node: {err}")))?;
                text.push_str(&decoded);
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(cues)
}

pub fn render(cues: &[Cue], overlap_gap_ms: u64) -> String {
    let mut out = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\" ?><timedtext format=\"3\"><body>",
    );

    for (i, cue) in cues.iter().enumerate() {
        let mut end = cue.end_ms;
        if let Some(next) = cues.get(i + 1) {
            let ceiling = next.start_ms.saturating_sub(overlap_gap_ms);
            end = if ceiling < cue.start_ms {
                cue.start_ms + 1
            } else {
                end.min(ceiling.max(cue.start_ms + 1))
            };
        }
        let duration = end.saturating_sub(cue.start_ms).max(1);

        let lines: Vec<&str> = cue.text.split('\n').collect();
        out.push_str(&format!(
            "<p t=\"{}\" d=\"{}\">",
            cue.start_ms, duration
        ));
        for (j, line) in lines.iter().enumerate() {
            if j > 0 {
                out.push_str("<s>&#x0A;</s>");
            }
            out.push_str("<s>");
            out.push_str(&escape_xml(line));
            out.push_str("</s>");
        }
        out.push_str("</p>");
    }

    out.push_str("</body></timedtext>");
    out
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_paragraph() {
        let body = r#"<?xml version="1.0" encoding="utf-8" ?><timedtext format="3"><body>
            <p t="0" d="1000">Hello world</p>
        </body></timedtext>"#;
        let cues = parse(body).unwrap();
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "Hello world");
        assert_eq!(cues[0].start_ms, 0);
        assert_eq!(cues[0].end_ms, 1000);
    }

    #[test]
    fn br_becomes_newline() {
        let body = r#"<timedtext><body><p t="0" d="1000">line one<br/>line two</p></body></timedtext>"#;
        let cues = parse(body).unwrap();
        assert_eq!(cues[0].text, "line one\nline two");
    }

    #[test]
    fn decodes_entities() {
        let body = r#"<timedtext><body><p t="0" d="1000">Tom &amp; Jerry</p></body></timedtext>"#;
        let cues = parse(body).unwrap();
        assert_eq!(cues[0].text, "Tom & Jerry");
    }

    #[test]
    fn skips_zero_duration_paragraphs() {
        let body = r#"<timedtext><body><p t="0" d="0">nothing</p></body></timedtext>"#;
        let cues = parse(body).unwrap();
        assert!(cues.is_empty());
    }

    #[test]
    fn rejects_malformed_xml() {
        assert!(parse("<timedtext><body><p t=\"0\" d=\"1").is_err());
    }

    #[test]
    fn render_clamps_overlap() {
        let cues = vec![
            Cue::new(0, 2000, "first").unwrap(),
            Cue::new(1500, 3000, "second").unwrap(),
        ];
        let xml = render(&cues, 100);
        assert!(xml.contains("d=\"1400\""));
    }

    #[test]
    fn render_escapes_special_chars() {
        let cues = vec![Cue::new(0, 1000, "Tom & Jerry <show>").unwrap()];
        let xml = render(&cues, 100);
        assert!(xml.contains("Tom &amp; Jerry &lt;show&gt;"));
    }

    #[test]
    fn render_joins_multiline_with_newline_span() {
        let cues = vec![Cue::new(0, 1000, "orig\ntrans").unwrap()];
        let xml = render(&cues, 100);
        assert!(xml.contains("<s>&#x0A;</s>"));
    }
}
