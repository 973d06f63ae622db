// =============================================================================
// Screener — today's earnings-reporting universe
// =============================================================================
//
// Treated per the external-interface contract as `Screener::list() -> []Symbol`;
// the HTML/finviz scraping mechanics the original's `EarningTommrow` scanner
// performs are explicitly out of scope. `HttpScreener` is a minimal concrete
// adapter: it walks a paginated JSON endpoint and stops at the first empty
// page, in the same "list of pages, stop when one comes back empty" shape the
// original's scanners use internally.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::types::Symbol;

#[async_trait]
pub trait Screener: Send + Sync {
    /// Fetch today's full reporting universe. A transport or parse failure
    /// here is fatal for the day — the selection pipeline does not retry.
    async fn list(&self) -> Result<Vec<Symbol>>;
}

#[derive(Debug, Deserialize)]
struct ScreenerPage {
    symbols: Vec<String>,
}

pub struct HttpScreener {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
}

impl HttpScreener {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, page_size: u32) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            page_size,
        }
    }
}

#[async_trait]
impl Screener for HttpScreener {
    async fn list(&self) -> Result<Vec<Symbol>> {
        let mut out = Vec::new();
        let mut page = 0u32;

        loop {
            let resp = self
                .client
                .get(&self.base_url)
                .query(&[("page", page.to_string()), ("page_size", self.page_size.to_string())])
                .send()
                .await
                .with_context(|| format!("screener request failed for page {page}"))?
                .error_for_status()
                .with_context(|| format!("screener returned error status for page {page}"))?;

            let body: ScreenerPage = resp
                .json()
                .await
                .with_context(|| format!("screener page {page} body was not valid JSON"))?;

            if body.symbols.is_empty() {
                debug!(page, "screener pagination ended on empty page");
                break;
            }

            out.extend(body.symbols.into_iter().map(Symbol::from));
            page += 1;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_deserialises_expected_shape() {
        let json = r#"{"symbols": ["AAPL", "MSFT"]}"#;
        let page: ScreenerPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.symbols, vec!["AAPL", "MSFT"]);
    }
}
