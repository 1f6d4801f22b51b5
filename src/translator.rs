//! Translator (C6): turns a cue list into a parallel translated cue list by
//! batching calls against an external chat-completion LLM.
//!
//! The most intricate component. An optional guidance pass (summary +
//! glossary) seeds every batch prompt; batches translate with preceding/
//! following context, retry with backoff, and fall back to per-line
//! translation when a batch can't be salvaged.

use crate::config::{ContextConfig, GuidanceConfig, LlmConfig};
use crate::error::{ProxyError, Result};
use crate::resilience::{CircuitBreaker, RateLimiter};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{event, Level};

/// Owns the LLM HTTP client and the resilience primitives guarding it.
/// One instance per process, held in the application context.
pub struct Translator {
    client: reqwest::Client,
    llm: LlmConfig,
    guidance: GuidanceConfig,
    context: ContextConfig,
    circuit_breaker: CircuitBreaker,
    rate_limiter: RateLimiter,
}

#[derive(Debug, Clone)]
pub struct GlossaryEntry {
    pub source: String,
    pub target: String,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Guidance {
    pub summary: Option<String>,
    pub glossary: Vec<GlossaryEntry>,
}

#[derive(Debug, Deserialize)]
struct GlossaryJson {
    source: String,
    target: String,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BatchItem {
    id: i64,
    translation: String,
}

impl Translator {
    pub fn new(llm: &LlmConfig, guidance: &GuidanceConfig, context: &ContextConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(llm.timeout_secs))
            .build()
            .expect("failed to build LLM client");
        Self {
            client,
            llm: llm.clone(),
            guidance: guidance.clone(),
            context: context.clone(),
            circuit_breaker: CircuitBreaker::new(llm),
            rate_limiter: RateLimiter::new(),
        }
    }

    /// Translate every line's text into `target_lang`. Returns bilingual
    /// lines (`original + "\n" + translation`) in input order.
    pub async fn translate(&self, lines: &[String], target_lang: &str) -> Result<Vec<String>> {
        if lines.is_empty() {
            return Ok(Vec::new());
        }

        let guidance = self.build_guidance(lines, target_lang).await;

        if self.context.enabled {
            self.translate_with_context(lines, target_lang, &guidance)
                .await
        } else {
            self.translate_simple(lines, target_lang).await
        }
    }

    async fn build_guidance(&self, lines: &[String], target_lang: &str) -> Guidance {
        let mut guidance = Guidance::default();

        if self.guidance.summary_enabled {
            match self.build_summary(lines).await {
                Ok(summary) => guidance.summary = Some(summary),
                Err(e) => event!(Level::WARN, error = %e, "guidance summary generation failed, continuing without it"),
            }
        }

        if self.guidance.glossary_enabled {
            match self.build_glossary(lines, target_lang).await {
                Ok(glossary) => guidance.glossary = glossary,
                Err(e) => event!(Level::WARN, error = %e, "guidance glossary generation failed, continuing without it"),
            }
        }

        guidance
    }

    async fn build_summary(&self, lines: &[String]) -> Result<String> {
        let chunks = chunk_by_chars(lines, self.guidance.summary_chunk_chars);
        if chunks.len() == 1 {
            let prompt = format!(
                "Summarize the following transcript in its original language, preserving names and register. Respond with only the summary.\n\n{}",
                chunks[0]
            );
            return self.chat(&prompt, self.guidance.summary_max_tokens).await;
        }

        let mut partials = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let prompt = format!(
                "Summarize this excerpt of a transcript in its original language. Respond with only the summary.\n\n{chunk}"
            );
            partials.push(self.chat(&prompt, self.guidance.summary_max_tokens).await?);
        }
        let combined = partials.join("\n");
        let consolidate_prompt = format!(
            "Consolidate these partial summaries of one transcript into a single coherent summary, in the same language. Respond with only the summary.\n\n{combined}"
        );
        self.chat(&consolidate_prompt, self.guidance.summary_max_tokens)
            .await
    }

    async fn build_glossary(&self, lines: &[String], target_lang: &str) -> Result<Vec<GlossaryEntry>> {
        let chunks = chunk_by_chars(lines, self.guidance.glossary_chunk_chars);
        let mut entries = Vec::new();

        for chunk in &chunks {
            let prompt = format!(
                "Extract a glossary of proper nouns and domain terms from this transcript excerpt. \
                 Respond with only a JSON array of objects {{\"source\": str, \"target\": str, \"note\": str|null}}, \
                 where \"target\" is the canonical {target_lang} translation of \"source\".\n\n{chunk}"
            );
            let response = self.chat(&prompt, self.guidance.glossary_max_tokens).await?;
            if let Ok(parsed) = parse_json_array::<GlossaryJson>(&response) {
                entries.extend(parsed.into_iter().map(|e| GlossaryEntry {
                    source: e.source,
                    target: e.target,
                    note: e.note,
                }));
            }
        }

        entries.truncate(256);
        Ok(entries)
    }

    async fn translate_with_context(
        &self,
        lines: &[String],
        target_lang: &str,
        guidance: &Guidance,
    ) -> Result<Vec<String>> {
        let batch_size = self.context.batch_size.max(1);
        let batches: Vec<(usize, usize)> = (0..lines.len())
            .step_by(batch_size)
            .map(|start| (start, (start + batch_size).min(lines.len())))
            .collect();

        let mut slots: Vec<Option<String>> = vec![None; lines.len()];
        let semaphore = Semaphore::new(self.context.concurrency.max(1));

        let results = futures::future::join_all(batches.into_iter().map(|(start, end)| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let translations = self
                    .translate_batch_with_fallback(lines, start, end, target_lang, guidance)
                    .await;
                (start, translations)
            }
        }))
        .await;

        for (start, translations) in results {
            for (offset, translation) in translations.into_iter().enumerate() {
                slots[start + offset] = Some(translation);
            }
        }

        Ok(slots
            .into_iter()
            .zip(lines.iter())
            .map(|(translation, original)| {
                format!("{}\n{}", original, translation.unwrap_or_else(|| original.clone()))
            })
            .collect())
    }

    async fn translate_batch_with_fallback(
        &self,
        lines: &[String],
        start: usize,
        end: usize,
        target_lang: &str,
        guidance: &Guidance,
    ) -> Vec<String> {
        match self
            .translate_batch(lines, start, end, target_lang, guidance)
            .await
        {
            Ok(translations) => translations,
            Err(e) => {
                event!(
                    Level::WARN,
                    error = %e,
                    start,
                    end,
                    "batch translation exhausted retries, falling back to per-line"
                );
                self.translate_batch_per_line(lines, start, end, target_lang, guidance)
                    .await
            }
        }
    }

    async fn translate_batch(
        &self,
        lines: &[String],
        start: usize,
        end: usize,
        target_lang: &str,
        guidance: &Guidance,
    ) -> Result<Vec<String>> {
        let prompt = self.build_batch_prompt(lines, start, end, target_lang, guidance);

        let mut last_err = None;
        for attempt in 0..self.context.batch_retries.max(1) {
            match self.call_with_resilience(&prompt, self.context.max_tokens).await {
                Ok(response) => match parse_batch_response(&response, start, end) {
                    Ok(translations) => return Ok(translations),
                    Err(e) => last_err = Some(e),
                },
                Err(e) => last_err = Some(e),
            }

            let base_delay = 500u64 * (1u64 << attempt.min(6));
            let jitter = fastrand::u64(0..150);
            tokio::time::sleep(Duration::from_millis(base_delay + jitter)).await;
        }

        Err(last_err.unwrap_or_else(|| ProxyError::Translation("batch exhausted retries".into())))
    }

    async fn translate_batch_per_line(
        &self,
        lines: &[String],
        start: usize,
        end: usize,
        target_lang: &str,
        guidance: &Guidance,
    ) -> Vec<String> {
        let mut out = Vec::with_capacity(end - start);
        for line in &lines[start..end] {
            let prompt = self.build_single_line_prompt(line, target_lang, guidance);
            match self.call_with_resilience(&prompt, 256).await {
                Ok(translation) => out.push(translation.trim().to_string()),
                Err(e) => {
                    event!(Level::WARN, error = %e, "single-line fallback failed, using original text");
                    out.push(line.clone());
                }
            }
        }
        out
    }

    async fn translate_simple(&self, lines: &[String], target_lang: &str) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(lines.len());
        let concurrency = self.context.concurrency.max(1);

        for wave in lines.chunks(concurrency) {
            let results = futures::future::join_all(wave.iter().map(|line| async move {
                let prompt = self.build_single_line_prompt(line, target_lang, &Guidance::default());
                self.call_with_resilience(&prompt, 256).await
            }))
            .await;

            for (line, result) in wave.iter().zip(results) {
                let translation = result.unwrap_or_else(|_| line.clone());
                out.push(format!("{line}\n{translation}"));
            }

            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        Ok(out)
    }

    fn build_batch_prompt(
        &self,
        lines: &[String],
        start: usize,
        end: usize,
        target_lang: &str,
        guidance: &Guidance,
    ) -> String {
        let mut prompt = format!(
            "You are translating subtitle lines into {target_lang}. Respond with only a JSON array of \
             objects {{\"id\": integer, \"translation\": string}} covering exactly the current batch lines.\n\n"
        );

        if let Some(summary) = &guidance.summary {
            prompt.push_str(&format!("Transcript summary:\n{summary}\n\n"));
        }
        if !guidance.glossary.is_empty() {
            prompt.push_str("Glossary:\n");
            for entry in &guidance.glossary {
                prompt.push_str(&format!("- {} => {}\n", entry.source, entry.target));
            }
            prompt.push('\n');
        }

        let preceding_start = start.saturating_sub(self.context.preceding_lines);
        if preceding_start < start {
            prompt.push_str("Preceding context (do not translate):\n");
            for (i, line) in lines[preceding_start..start].iter().enumerate() {
                prompt.push_str(&format!("[{}] {}\n", preceding_start + i, line));
            }
            prompt.push('\n');
        }

        prompt.push_str("Current batch:\n");
        for (i, line) in lines[start..end].iter().enumerate() {
            prompt.push_str(&format!("[{}] {}\n", start + i, line));
        }
        prompt.push('\n');

        let following_end = (end + self.context.following_lines).min(lines.len());
        if following_end > end {
            prompt.push_str("Following context (do not translate):\n");
            for (i, line) in lines[end..following_end].iter().enumerate() {
                prompt.push_str(&format!("[{}] {}\n", end + i, line));
            }
        }

        prompt
    }

    fn build_single_line_prompt(&self, line: &str, target_lang: &str, guidance: &Guidance) -> String {
        let mut prompt = format!("Translate the following line into {target_lang}. Respond with only the translation.\n");
        if let Some(summary) = &guidance.summary {
            prompt.push_str(&format!("Context summary: {summary}\n"));
        }
        if !guidance.glossary.is_empty() {
            prompt.push_str("Glossary:\n");
            for entry in &guidance.glossary {
                prompt.push_str(&format!("- {} => {}\n", entry.source, entry.target));
            }
        }
        prompt.push_str(&format!("\nLine: {line}"));
        prompt
    }

    async fn chat(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        self.call_with_resilience(prompt, max_tokens).await
    }

    /// Issue one chat-completion call behind the circuit breaker and rate
    /// limiter, retrying transient failures with backoff plus jitter.
    async fn call_with_resilience(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        if !self.circuit_breaker.allow_request() {
            return Err(ProxyError::Translation(
                "circuit breaker open for LLM translation service".into(),
            ));
        }

        let mut last_err = None;
        for attempt in 0..3 {
            self.rate_limiter.wait_if_needed().await;

            match self.chat_completion(prompt, max_tokens).await {
                Ok(text) => {
                    self.circuit_breaker.record_success();
                    self.rate_limiter.record_success();
                    return Ok(text);
                }
                Err(e) => {
                    if !e.is_retryable() || attempt == 2 {
                        self.circuit_breaker.record_failure();
                        return Err(e);
                    }
                    last_err = Some(e);
                    let base_delay = 500u64 * (1u64 << attempt);
                    let jitter = fastrand::u64(0..100);
                    tokio::time::sleep(Duration::from_millis(base_delay + jitter)).await;
                }
            }
        }

        self.circuit_breaker.record_failure();
        Err(last_err.unwrap_or_else(|| ProxyError::Translation("LLM call exhausted retries".into())))
    }

    async fn chat_completion(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let url = format!("{}/chat/completions", self.llm.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.llm.api_key)
            .json(&json!({
                "model": self.llm.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": max_tokens,
            }))
            .send()
            .await
            .map_err(ProxyError::Http)?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            self.rate_limiter.record_rate_limit(retry_after_secs);
            return Err(ProxyError::Translation(format!(
                "LLM endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(ProxyError::Translation(format!(
                "LLM endpoint returned {status}"
            )));
        }

        let body: serde_json::Value = response.json().await.map_err(ProxyError::Http)?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| ProxyError::Translation("LLM response missing message content".into()))
    }
}

fn chunk_by_chars(lines: &[String], max_chars: usize) -> Vec<String> {
    if max_chars == 0 {
        return vec![lines.join("\n")];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in lines {
        if !current.is_empty() && current.chars().count() + line.chars().count() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(stripped) = trimmed.strip_prefix("```") {
        let without_lang = stripped.trim_start_matches(|c: char| c.is_alphabetic());
        without_lang.trim_end_matches("```").trim()
    } else {
        trimmed
    }
}

fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

fn parse_json_array<T: for<'de> Deserialize<'de>>(text: &str) -> Result<Vec<T>> {
    let stripped = strip_code_fence(text);
    let array = extract_json_array(stripped)
        .ok_or_else(|| ProxyError::Translation("response did not contain a JSON array".into()))?;
    serde_json::from_str(array).map_err(ProxyError::Json)
}

fn parse_batch_response(text: &str, start: usize, end: usize) -> Result<Vec<String>> {
    let expected_len = end - start;
    let items: Vec<BatchItem> = parse_json_array(text)?;

    if items.len() != expected_len {
        return Err(ProxyError::Translation(format!(
            "batch response length {} did not match expected {}",
            items.len(),
            expected_len
        )));
    }

    let mut slots: Vec<Option<String>> = vec![None; expected_len];
    for item in items {
        let index = item.id as usize;
        if index < start || index >= end {
            return Err(ProxyError::Translation(format!(
                "batch response id {} outside expected range [{start}, {end})",
                item.id
            )));
        }
        if item.translation.trim().is_empty() {
            return Err(ProxyError::Translation("batch response contained an empty translation".into()));
        }
        slots[index - start] = Some(item.translation);
    }

    slots
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| ProxyError::Translation("batch response missing an id".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_code_fence() {
        let text = "```json\n[{\"id\":0,\"translation\":\"hi\"}]\n```";
        assert_eq!(
            strip_code_fence(text),
            "[{\"id\":0,\"translation\":\"hi\"}]"
        );
    }

    #[test]
    fn extracts_outermost_array() {
        let text = "here you go: [{\"id\":0,\"translation\":\"hi\"}] thanks";
        assert_eq!(
            extract_json_array(text),
            Some("[{\"id\":0,\"translation\":\"hi\"}]")
        );
    }

    #[test]
    fn parses_valid_batch_response() {
        let text = r#"[{"id":0,"translation":"hola"},{"id":1,"translation":"mundo"}]"#;
        let out = parse_batch_response(text, 0, 2).unwrap();
        assert_eq!(out, vec!["hola".to_string(), "mundo".to_string()]);
    }

    #[test]
    fn rejects_batch_response_with_wrong_length() {
        let text = r#"[{"id":0,"translation":"hola"}]"#;
        assert!(parse_batch_response(text, 0, 2).is_err());
    }

    #[test]
    fn rejects_batch_response_with_out_of_range_id() {
        let text = r#"[{"id":5,"translation":"hola"},{"id":1,"translation":"mundo"}]"#;
        assert!(parse_batch_response(text, 0, 2).is_err());
    }

    #[test]
    fn rejects_batch_response_with_empty_translation() {
        let text = r#"[{"id":0,"translation":""},{"id":1,"translation":"mundo"}]"#;
        assert!(parse_batch_response(text, 0, 2).is_err());
    }

    #[test]
    fn chunk_by_chars_splits_at_budget() {
        let lines = vec!["a".repeat(5), "b".repeat(5), "c".repeat(5)];
        let chunks = chunk_by_chars(&lines, 8);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn chunk_by_chars_single_chunk_when_disabled() {
        let lines = vec!["x".to_string(), "y".to_string()];
        let chunks = chunk_by_chars(&lines, 0);
        assert_eq!(chunks.len(), 1);
    }
}
