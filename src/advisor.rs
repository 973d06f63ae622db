// =============================================================================
// Advisor — AI ticker recommendation + response extraction
// =============================================================================
//
// Treated per the external-interface contract as
// `Advisor::recommend(prompt) -> String`; the specific provider's request/
// response envelope is out of scope beyond "send a prompt, get text back".
// `HttpAdvisor` is a minimal bearer-token text-completion adapter.
//
// `extract_tickers` is the extraction ladder, grounded verbatim on
// `examples/original_source/common/helpers/ticker_helpers.py`:
//   1. strip a ```...``` fenced block if present (drop a leading `json` tag)
//   2. sniff whichever of `[` / `{` appears first and try that JSON shape
//      (array of objects with a case-insensitive "ticker" key, or an object
//      whose keys are themselves the tickers)
//   3. if JSON extraction yields nothing, fall back to regex matching over
//      the cleaned text
// every candidate is filtered against the supplied universe before being
// returned — the ladder can only narrow the original list, never invent.
// =============================================================================

use std::collections::HashSet;

use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::types::Symbol;

#[async_trait]
pub trait Advisor: Send + Sync {
    /// Send `prompt` to the provider and return its raw text response.
    async fn recommend(&self, prompt: &str) -> Result<String>;
}

pub struct HttpAdvisor {
    client: reqwest::Client,
    endpoint: String,
    bearer_token: String,
}

impl HttpAdvisor {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            bearer_token: bearer_token.into(),
        }
    }
}

#[derive(serde::Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
}

#[derive(serde::Deserialize)]
struct CompletionResponse {
    text: String,
}

#[async_trait]
impl Advisor for HttpAdvisor {
    async fn recommend(&self, prompt: &str) -> Result<String> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.bearer_token)
            .json(&CompletionRequest { prompt })
            .send()
            .await
            .context("advisor request failed")?
            .error_for_status()
            .context("advisor returned error status")?;

        let body: CompletionResponse = resp.json().await.context("advisor body was not valid JSON")?;
        Ok(body.text)
    }
}

// =============================================================================
// Extraction ladder
// =============================================================================

fn text_ticker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\b([A-Z]{1,5}(?:\.[A-Z]{1,2})?)(?:\s|,|\.|\n|$|:)").unwrap())
}

/// Extract ticker symbols from a free-form advisor response, filtered
/// against `valid`. Never panics on malformed input; worst case returns an
/// empty set.
pub fn extract_tickers(response: &str, valid: &[Symbol]) -> HashSet<Symbol> {
    let valid_set: HashSet<String> = valid.iter().map(|s| s.as_str().to_string()).collect();

    let cleaned = strip_code_fence(response);

    let from_json = try_extract_from_json(&cleaned, &valid_set);
    if !from_json.is_empty() {
        return from_json;
    }

    extract_from_text(&cleaned, &valid_set)
}

fn strip_code_fence(response: &str) -> String {
    if !response.contains("```") {
        return response.to_string();
    }
    let parts: Vec<&str> = response.split("```").collect();
    if parts.len() < 2 {
        return response.to_string();
    }
    let mut block = parts[1];
    if let Some(rest) = block.strip_prefix("json") {
        block = rest;
    }
    block.to_string()
}

fn try_extract_from_json(cleaned: &str, valid_set: &HashSet<String>) -> HashSet<Symbol> {
    let array_start = cleaned.find('[');
    let object_start = cleaned.find('{');

    match (array_start, object_start) {
        (Some(a), Some(o)) if a < o => extract_from_json_array(cleaned, a, valid_set),
        (Some(a), None) => extract_from_json_array(cleaned, a, valid_set),
        (_, Some(o)) => extract_from_json_object(cleaned, o, valid_set),
        (None, None) => HashSet::new(),
    }
}

fn extract_from_json_array(cleaned: &str, start: usize, valid_set: &HashSet<String>) -> HashSet<Symbol> {
    let mut out = HashSet::new();
    let Some(end) = cleaned.rfind(']') else {
        return out;
    };
    if end <= start {
        return out;
    }

    let slice = &cleaned[start..=end];
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(slice) else {
        debug!("array-shaped extraction failed to parse, falling through");
        return out;
    };

    for item in items {
        let Value::Object(map) = item else { continue };
        let ticker_value = map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("ticker"))
            .and_then(|(_, v)| v.as_str());
        if let Some(raw) = ticker_value {
            let ticker = raw.trim().to_uppercase();
            if valid_set.contains(&ticker) {
                out.insert(Symbol::new(&ticker));
            }
        }
    }
    out
}

fn extract_from_json_object(cleaned: &str, start: usize, valid_set: &HashSet<String>) -> HashSet<Symbol> {
    let mut out = HashSet::new();
    let Some(end) = cleaned.rfind('}') else {
        return out;
    };
    if end <= start {
        return out;
    }

    let slice = &cleaned[start..=end];
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(slice) else {
        debug!("object-shaped extraction failed to parse, falling through");
        return out;
    };

    for key in map.keys() {
        let ticker = key.trim().to_uppercase();
        if valid_set.contains(&ticker) {
            out.insert(Symbol::new(&ticker));
        }
    }
    out
}

fn extract_from_text(cleaned: &str, valid_set: &HashSet<String>) -> HashSet<Symbol> {
    let mut out = HashSet::new();
    for caps in text_ticker_pattern().captures_iter(cleaned) {
        let ticker = caps[1].to_uppercase();
        if valid_set.contains(&ticker) {
            out.insert(Symbol::new(&ticker));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe() -> Vec<Symbol> {
        vec![Symbol::new("NVDA"), Symbol::new("LOW"), Symbol::new("AAPL")]
    }

    #[test]
    fn extracts_from_json_array_with_ticker_key() {
        let response = r#"[{"Ticker": "NVDA", "Score": 94}, {"Ticker": "LOW", "Score": 86}]"#;
        let got = extract_tickers(response, &universe());
        assert_eq!(got, HashSet::from([Symbol::new("NVDA"), Symbol::new("LOW")]));
    }

    #[test]
    fn extracts_from_json_object_keys() {
        let response = r#"{"NVDA": 94, "LOW": 86}"#;
        let got = extract_tickers(response, &universe());
        assert_eq!(got, HashSet::from([Symbol::new("NVDA"), Symbol::new("LOW")]));
    }

    #[test]
    fn strips_markdown_code_fence() {
        let response = "Here you go:\n```json\n[{\"Ticker\": \"AAPL\"}]\n```\nHope that helps.";
        let got = extract_tickers(response, &universe());
        assert_eq!(got, HashSet::from([Symbol::new("AAPL")]));
    }

    #[test]
    fn falls_back_to_regex_on_plain_text() {
        let response = "NVDA is a strong buy, LOW looks weak, TSLA is not in our universe.";
        let got = extract_tickers(response, &universe());
        assert_eq!(got, HashSet::from([Symbol::new("NVDA"), Symbol::new("LOW")]));
    }

    #[test]
    fn filters_out_tickers_not_in_universe() {
        let response = r#"[{"Ticker": "TSLA"}]"#;
        let got = extract_tickers(response, &universe());
        assert!(got.is_empty());
    }

    #[test]
    fn malformed_json_does_not_panic_and_falls_through_to_regex() {
        let response = "[{\"Ticker\": \"NVDA\" malformed here, also mentions LOW.";
        let got = extract_tickers(response, &universe());
        assert!(got.contains(&Symbol::new("LOW")));
    }
}
