//! Paragraph segmenter (C2): fuses raw per-word cues into paragraph-level
//! cues suitable for display in a subtitle overlay.
//!
//! Pure and deterministic: given the same cues and parameters it always
//! produces the same output.

use crate::codec::Cue;
use crate::config::SegmenterConfig;

const SENTENCE_END: &[char] = &['.', '!', '?', '…', '。', '！', '？'];
const CLOSING_PUNCT: &[char] = &[',', '.', ';', ':', '!', '?', '。', '！', '？', '；', '：'];

struct OpenParagraph {
    start_ms: u64,
    end_ms: u64,
    pieces: Vec<String>,
    chars: usize,
    words: usize,
}

impl OpenParagraph {
    fn new(cue: &Cue) -> Self {
        Self {
            start_ms: cue.start_ms,
            end_ms: cue.end_ms,
            pieces: vec![cue.text.clone()],
            chars: cue.text.chars().count(),
            words: word_count(&cue.text),
        }
    }

    fn push(&mut self, cue: &Cue) {
        self.end_ms = cue.end_ms;
        self.chars += cue.text.chars().count();
        self.words += word_count(&cue.text);
        self.pieces.push(cue.text.clone());
    }

    fn into_cue(self) -> Option<Cue> {
        let text = join_text(&self.pieces);
        Cue::new(self.start_ms, self.end_ms, text).ok()
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Fuse raw cues into paragraph-level cues per the configured thresholds.
pub fn segment(cues: &[Cue], config: &SegmenterConfig) -> Vec<Cue> {
    let mut paragraphs: Vec<OpenParagraph> = Vec::new();
    let mut open: Option<OpenParagraph> = None;

    for cue in cues {
        let text = cue.text.trim();
        if text.is_empty() {
            continue;
        }
        let cue = match Cue::new(cue.start_ms, cue.end_ms, text) {
            Ok(c) => c,
            Err(_) => continue,
        };

        let Some(para) = open.as_mut() else {
            open = Some(OpenParagraph::new(&cue));
            continue;
        };

        let duration_if_included = cue.end_ms.saturating_sub(para.start_ms);
        let gap = cue.start_ms.saturating_sub(para.end_ms);

        if duration_if_included >= config.max_duration_ms || gap > config.segment_gap_ms {
            let finished = open.take().unwrap();
            paragraphs.push(finished);
            open = Some(OpenParagraph::new(&cue));
            continue;
        }

        para.push(&cue);

        let should_soft_break = duration_if_included >= config.min_duration_ms
            && (ends_with_sentence_terminator(&cue.text)
                || matches!(config.segment_max_chars, Some(max) if max > 0 && para.chars >= max)
                || matches!(config.segment_max_words, Some(max) if max > 0 && para.words >= max));

        if should_soft_break {
            let finished = open.take().unwrap();
            paragraphs.push(finished);
        }
    }

    if let Some(last) = open.take() {
        if last.end_ms.saturating_sub(last.start_ms) < config.min_duration_ms && !paragraphs.is_empty()
        {
            let prev = paragraphs.last_mut().unwrap();
            prev.end_ms = last.end_ms;
            prev.chars += last.chars;
            prev.words += last.words;
            prev.pieces.extend(last.pieces);
        } else {
            paragraphs.push(last);
        }
    }

    let mut out: Vec<Cue> = paragraphs.into_iter().filter_map(|p| p.into_cue()).collect();
    optimize_timing(&mut out);
    out
}

fn ends_with_sentence_terminator(text: &str) -> bool {
    text.trim_end().chars().next_back().is_some_and(|c| SENTENCE_END.contains(&c))
}

fn join_text(pieces: &[String]) -> String {
    let joined = pieces.join(" ");
    normalize_spacing(&joined)
}

fn normalize_spacing(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        if c == ' ' {
            if chars.peek().is_some_and(|next| CLOSING_PUNCT.contains(next) || is_closing_bracket(*next))
            {
                pending_space = false;
                continue;
            }
            pending_space = true;
            continue;
        }
        if pending_space {
            if !result.ends_with(|p: char| is_opening_bracket(p)) {
                result.push(' ');
            }
            pending_space = false;
        }
        result.push(c);
    }

    collapse_whitespace(&result)
}

fn is_opening_bracket(c: char) -> bool {
    matches!(c, '(' | '[' | '{' | '“' | '‘' | '「' | '『')
}

fn is_closing_bracket(c: char) -> bool {
    matches!(c, ')' | ']' | '}' | '”' | '’' | '」' | '』')
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out.trim().to_string()
}

const MIN_DISPLAY_MS: u64 = 1000;
const ABSOLUTE_FLOOR_MS: u64 = 500;

fn optimize_timing(cues: &mut [Cue]) {
    let len = cues.len();
    for i in 0..len {
        let next_start = cues.get(i + 1).map(|c| c.start_ms);
        let cue = &mut cues[i];
        let duration = cue.end_ms.saturating_sub(cue.start_ms);
        if duration < MIN_DISPLAY_MS {
            let mut desired_end = cue.start_ms + MIN_DISPLAY_MS;
            if let Some(next_start) = next_start {
                if desired_end > next_start {
                    desired_end = next_start.saturating_sub(100).max(cue.start_ms);
                }
            }
            if desired_end.saturating_sub(cue.start_ms) < ABSOLUTE_FLOOR_MS {
                desired_end = cue.start_ms + ABSOLUTE_FLOOR_MS;
            }
            cue.end_ms = desired_end.max(cue.start_ms + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SegmenterConfig {
        SegmenterConfig::default()
    }

    fn cue(start: u64, end: u64, text: &str) -> Cue {
        Cue::new(start, end, text).unwrap()
    }

    #[test]
    fn merges_short_word_cues_into_a_paragraph() {
        let cues = vec![
            cue(0, 300, "I"),
            cue(300, 600, "have"),
            cue(600, 900, "a"),
            cue(900, 1200, "dream."),
        ];
        let out = segment(&cues, &cfg());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "I have a dream.");
    }

    #[test]
    fn hard_breaks_on_large_gap() {
        let mut c = cfg();
        c.segment_gap_ms = 1000;
        let cues = vec![cue(0, 500, "hello"), cue(5000, 5500, "world")];
        let out = segment(&cues, &c);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn soft_breaks_on_sentence_terminator_after_min_duration() {
        let mut c = cfg();
        c.min_duration_ms = 100;
        let cues = vec![
            cue(0, 150, "Done."),
            cue(150, 400, "Next"),
            cue(400, 650, "sentence"),
        ];
        let out = segment(&cues, &c);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "Done.");
    }

    #[test]
    fn folds_short_trailing_paragraph_into_previous() {
        let mut c = cfg();
        c.min_duration_ms = 1000;
        c.segment_gap_ms = 5000;
        let cues = vec![cue(0, 1200, "first part."), cue(1200, 1300, "tiny")];
        let out = segment(&cues, &c);
        assert_eq!(out.len(), 1);
        assert!(out[0].text.ends_with("tiny"));
    }

    #[test]
    fn skips_empty_cue_text() {
        let cues = vec![cue(0, 500, "hello"), cue(500, 1000, "   ")];
        let out = segment(&cues, &cfg());
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn normalizes_space_before_closing_punctuation() {
        let joined = normalize_spacing("hello , world !");
        assert_eq!(joined, "hello, world!");
    }

    #[test]
    fn collapses_whitespace_runs() {
        assert_eq!(collapse_whitespace("a   b\t\tc"), "a b c");
    }

    #[test]
    fn timing_optimization_enforces_minimum_display_time() {
        let mut cues = vec![cue(0, 100, "hi")];
        optimize_timing(&mut cues);
        assert!(cues[0].end_ms - cues[0].start_ms >= MIN_DISPLAY_MS);
    }

    #[test]
    fn timing_optimization_respects_next_cue_start() {
        let mut cues = vec![cue(0, 100, "hi"), cue(1050, 2000, "there")];
        optimize_timing(&mut cues);
        assert!(cues[0].end_ms <= 1050);
        assert!(cues[0].end_ms - cues[0].start_ms >= ABSOLUTE_FLOOR_MS);
    }

    #[test]
    fn is_deterministic_for_fixed_input() {
        let cues = vec![cue(0, 300, "a"), cue(300, 900, "b."), cue(1000, 1500, "c")];
        let out1 = segment(&cues, &cfg());
        let out2 = segment(&cues, &cfg());
        assert_eq!(out1, out2);
    }
}
