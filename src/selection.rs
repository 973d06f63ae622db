// =============================================================================
// SelectionPipeline — cache-gated, advisor-consensus watch-list selection
// =============================================================================
//
// Implements spec §4.3 end to end: a cache hit short-circuits the whole
// pipeline (idempotence guard — driven once per calendar day); otherwise the
// screener's paginated universe is fanned out to every advisor in parallel,
// each advisor run for `scan_passes` independent passes with its per-pass
// responses unioned, and the per-advisor sets intersected. A screener error
// is fatal for the day; a single advisor's total failure across both the
// first attempt and its one retry degrades that advisor's set to the empty
// set for the pass, which is a conservative (not fatal) outcome.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use futures_util::future::join_all;
use tracing::{debug, error, info, warn};

use crate::advisor::{extract_tickers, Advisor};
use crate::cache::TickerCache;
use crate::error::SelectionError;
use crate::screener::Screener;
use crate::types::Symbol;

pub struct SelectionPipeline {
    screener: Arc<dyn Screener>,
    advisors: Vec<Arc<dyn Advisor>>,
    cache: Arc<dyn TickerCache>,
    scan_passes: u32,
    prompt_template: String,
}

impl SelectionPipeline {
    pub fn new(
        screener: Arc<dyn Screener>,
        advisors: Vec<Arc<dyn Advisor>>,
        cache: Arc<dyn TickerCache>,
        scan_passes: u32,
        prompt_template: impl Into<String>,
    ) -> Self {
        assert!(!advisors.is_empty(), "selection pipeline requires at least one advisor");
        Self {
            screener,
            advisors,
            cache,
            scan_passes: scan_passes.max(1),
            prompt_template: prompt_template.into(),
        }
    }

    /// Run the full protocol for `today`, honoring the cache idempotence
    /// guard. Returns the lexicographically sorted consensus watch list.
    pub async fn select(&self, today: NaiveDate) -> Result<Vec<Symbol>, SelectionError> {
        if let Some(cached) = self.cache.load(today)? {
            if !cached.is_empty() {
                info!(date = %today, count = cached.len(), "selection served from cache, advisors not invoked");
                return Ok(cached);
            }
        }

        let universe = self
            .screener
            .list()
            .await
            .map_err(SelectionError::Screener)?;

        if universe.is_empty() {
            debug!("screener returned an empty universe, nothing to select");
            self.cache.save(today, &[])?;
            return Ok(Vec::new());
        }

        let prompt = build_prompt(&self.prompt_template, &universe);

        let per_advisor_sets: Vec<HashSet<Symbol>> = join_all(
            self.advisors
                .iter()
                .map(|advisor| self.run_advisor_passes(advisor.as_ref(), &prompt, &universe)),
        )
        .await;

        let result = intersect_all(per_advisor_sets);
        let mut sorted: Vec<Symbol> = result.into_iter().collect();
        sorted.sort();

        self.cache.save(today, &sorted)?;
        info!(date = %today, count = sorted.len(), "selection pipeline produced watch list");
        Ok(sorted)
    }

    /// Run `scan_passes` independent passes for one advisor, unioning the
    /// per-pass extracted sets. A pass whose advisor call fails is retried
    /// once; if the retry also fails, that pass contributes the empty set.
    async fn run_advisor_passes(&self, advisor: &dyn Advisor, prompt: &str, universe: &[Symbol]) -> HashSet<Symbol> {
        let mut union = HashSet::new();

        for pass in 0..self.scan_passes {
            let response = match advisor.recommend(prompt).await {
                Ok(r) => r,
                Err(first_err) => {
                    warn!(pass, error = %first_err, "advisor call failed, retrying once");
                    match advisor.recommend(prompt).await {
                        Ok(r) => r,
                        Err(retry_err) => {
                            error!(pass, error = %retry_err, "advisor call failed on retry, pass contributes empty set");
                            continue;
                        }
                    }
                }
            };
            union.extend(extract_tickers(&response, universe));
        }

        union
    }
}

fn build_prompt(template: &str, universe: &[Symbol]) -> String {
    let tickers: Vec<&str> = universe.iter().map(Symbol::as_str).collect();
    template.replace("{tickers}", &tickers.join(", "))
}

/// Intersect every advisor's set. Intersecting an empty `Vec` of sets (no
/// advisors) is not reachable — construction asserts at least one advisor.
fn intersect_all(sets: Vec<HashSet<Symbol>>) -> HashSet<Symbol> {
    let mut iter = sets.into_iter();
    let first = iter.next().unwrap_or_default();
    iter.fold(first, |acc, s| acc.intersection(&s).cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedScreener(Vec<Symbol>);

    #[async_trait]
    impl Screener for FixedScreener {
        async fn list(&self) -> anyhow::Result<Vec<Symbol>> {
            Ok(self.0.clone())
        }
    }

    struct FixedAdvisor(String);

    #[async_trait]
    impl Advisor for FixedAdvisor {
        async fn recommend(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingAdvisor;

    #[async_trait]
    impl Advisor for FailingAdvisor {
        async fn recommend(&self, _prompt: &str) -> anyhow::Result<String> {
            anyhow::bail!("advisor unreachable")
        }
    }

    struct MemCache(parking_lot::Mutex<std::collections::HashMap<NaiveDate, Vec<Symbol>>>);

    impl MemCache {
        fn new() -> Self {
            Self(parking_lot::Mutex::new(std::collections::HashMap::new()))
        }
    }

    impl TickerCache for MemCache {
        fn save(&self, date: NaiveDate, symbols: &[Symbol]) -> Result<(), crate::error::CacheError> {
            if symbols.is_empty() {
                return Ok(());
            }
            self.0.lock().insert(date, symbols.to_vec());
            Ok(())
        }
        fn load(&self, date: NaiveDate) -> Result<Option<Vec<Symbol>>, crate::error::CacheError> {
            Ok(self.0.lock().get(&date).cloned())
        }
        fn sweep(&self, _today: NaiveDate) -> Result<(), crate::error::CacheError> {
            Ok(())
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, 28).unwrap()
    }

    #[tokio::test]
    async fn consensus_happy_path_intersects_two_advisors() {
        let universe = vec!["AAPL", "MSFT", "GOOGL", "TSLA", "NVDA"]
            .into_iter()
            .map(Symbol::new)
            .collect::<Vec<_>>();
        let screener = Arc::new(FixedScreener(universe));
        let advisor_a = Arc::new(FixedAdvisor(r#"[{"ticker":"AAPL"},{"ticker":"MSFT"},{"ticker":"GOOGL"},{"ticker":"TSLA"}]"#.to_string()));
        let advisor_b = Arc::new(FixedAdvisor(r#"[{"ticker":"AAPL"},{"ticker":"MSFT"},{"ticker":"NVDA"},{"ticker":"AMZN"}]"#.to_string()));
        let cache = Arc::new(MemCache::new());

        let pipeline = SelectionPipeline::new(screener, vec![advisor_a, advisor_b], cache, 1, "{tickers}");
        let result = pipeline.select(today()).await.unwrap();

        assert_eq!(result, vec![Symbol::new("AAPL"), Symbol::new("MSFT")]);
    }

    #[tokio::test]
    async fn cache_hit_skips_advisors_entirely() {
        let calls = Arc::new(AtomicUsize::new(0));

        struct CountingAdvisor(Arc<AtomicUsize>);
        #[async_trait]
        impl Advisor for CountingAdvisor {
            async fn recommend(&self, _prompt: &str) -> anyhow::Result<String> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(r#"[{"ticker":"AAPL"}]"#.to_string())
            }
        }

        let screener = Arc::new(FixedScreener(vec![Symbol::new("AAPL")]));
        let cache = Arc::new(MemCache::new());
        cache.save(today(), &[Symbol::new("AAPL")]).unwrap();

        let pipeline = SelectionPipeline::new(
            screener,
            vec![Arc::new(CountingAdvisor(calls.clone()))],
            cache,
            1,
            "{tickers}",
        );
        let result = pipeline.select(today()).await.unwrap();

        assert_eq!(result, vec![Symbol::new("AAPL")]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_advisors_failing_for_a_pass_yields_empty_intersection() {
        let universe = vec![Symbol::new("AAPL")];
        let screener = Arc::new(FixedScreener(universe));
        let cache = Arc::new(MemCache::new());

        let pipeline = SelectionPipeline::new(screener, vec![Arc::new(FailingAdvisor), Arc::new(FailingAdvisor)], cache, 1, "{tickers}");
        let result = pipeline.select(today()).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn empty_screener_universe_is_benign_not_an_error() {
        let screener = Arc::new(FixedScreener(vec![]));
        let cache = Arc::new(MemCache::new());
        let pipeline = SelectionPipeline::new(screener, vec![Arc::new(FixedAdvisor("[]".to_string()))], cache, 1, "{tickers}");
        let result = pipeline.select(today()).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn scan_passes_union_within_advisor_before_cross_advisor_intersection() {
        struct SequencedAdvisor(parking_lot::Mutex<Vec<String>>);
        #[async_trait]
        impl Advisor for SequencedAdvisor {
            async fn recommend(&self, _prompt: &str) -> anyhow::Result<String> {
                let mut g = self.0.lock();
                Ok(if g.is_empty() { String::new() } else { g.remove(0) })
            }
        }

        let universe = vec![Symbol::new("AAPL"), Symbol::new("MSFT")];
        let screener = Arc::new(FixedScreener(universe));
        let cache = Arc::new(MemCache::new());

        // advisor A sees AAPL on pass 1, MSFT on pass 2: union = {AAPL, MSFT}
        let advisor_a = Arc::new(SequencedAdvisor(parking_lot::Mutex::new(vec![
            r#"[{"ticker":"AAPL"}]"#.to_string(),
            r#"[{"ticker":"MSFT"}]"#.to_string(),
        ])));
        // advisor B sees both every pass.
        let advisor_b = Arc::new(FixedAdvisor(r#"[{"ticker":"AAPL"},{"ticker":"MSFT"}]"#.to_string()));

        let pipeline = SelectionPipeline::new(screener, vec![advisor_a, advisor_b], cache, 2, "{tickers}");
        let result = pipeline.select(today()).await.unwrap();
        assert_eq!(result, vec![Symbol::new("AAPL"), Symbol::new("MSFT")]);
    }
}
