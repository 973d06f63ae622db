// =============================================================================
// Aurora Earnings Engine — Main Entry Point
// =============================================================================
//
// Wires the day-cycle together: calendar + cache + selection pipeline +
// order gateway + real-time fan-out feed a single `EarningsStrategy`
// supervised by a `StrategyRunner`, driven end to end by a
// `SessionOrchestrator`. Falls back to `DemoOrderGateway` whenever live
// broker credentials aren't configured, so the engine runs start to finish
// without a funded account — mirroring the teacher's safe-by-default startup
// posture.
// =============================================================================

mod advisor;
mod cache;
mod calendar;
mod candle;
mod config;
mod decoder;
mod error;
mod fanout;
mod gateway;
mod orchestrator;
mod runner;
mod screener;
mod selection;
mod strategy;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::advisor::{Advisor, HttpAdvisor};
use crate::cache::FileTickerCache;
use crate::calendar::NyseCalendar;
use crate::config::RuntimeConfig;
use crate::decoder::WireTickDecoder;
use crate::gateway::{BinanceBracketGateway, DemoOrderGateway, OrderGateway};
use crate::orchestrator::SessionOrchestrator;
use crate::runner::StrategyRunner;
use crate::screener::HttpScreener;
use crate::selection::SelectionPipeline;
use crate::strategy::{EarningsStrategy, Strategy};
use crate::fanout::{RealtimeFanout, WsRealtimeSource};

const CONFIG_PATH: &str = "runtime_config.json";

/// Parse `AI_ADVISOR_ENDPOINTS` as a comma-separated list of
/// `https://endpoint|bearer-token` pairs into a list of `HttpAdvisor`s.
fn build_advisors(client: &reqwest::Client) -> Result<Vec<Arc<dyn Advisor>>> {
    let raw = std::env::var("AI_ADVISOR_ENDPOINTS")
        .context("AI_ADVISOR_ENDPOINTS must be set to at least one \"endpoint|token\" pair")?;

    let advisors: Vec<Arc<dyn Advisor>> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pair| {
            let (endpoint, token) = pair
                .split_once('|')
                .with_context(|| format!("advisor entry \"{pair}\" is missing the \"|token\" suffix"))?;
            Ok(Arc::new(HttpAdvisor::new(client.clone(), endpoint, token)) as Arc<dyn Advisor>)
        })
        .collect::<Result<_>>()?;

    if advisors.is_empty() {
        anyhow::bail!("AI_ADVISOR_ENDPOINTS parsed to zero advisors");
    }
    Ok(advisors)
}

fn build_order_gateway() -> Arc<dyn OrderGateway> {
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();

    if !api_key.is_empty() && !api_secret.is_empty() {
        info!("live broker credentials found, using BinanceBracketGateway");
        Arc::new(BinanceBracketGateway::new(api_key, api_secret))
    } else {
        let starting_buying_power: f64 = std::env::var("DEMO_BUYING_POWER")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100_000.0);
        warn!(starting_buying_power, "no broker credentials configured, running against DemoOrderGateway");
        Arc::new(DemoOrderGateway::new(starting_buying_power))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Earnings Engine — Starting Up              ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, using defaults");
        RuntimeConfig::default()
    });

    let tz: chrono_tz::Tz = config
        .scheduler
        .timezone
        .parse()
        .with_context(|| format!("invalid exchange timezone {:?}", config.scheduler.timezone))?;
    let calendar = Arc::new(NyseCalendar::new(
        tz,
        config.scheduler.pre_market_open_hour,
        config.scheduler.post_session_close_hour,
    )) as Arc<dyn calendar::MarketCalendar>;

    let cache = Arc::new(FileTickerCache::new(config.cache.enabled, config.cache.cache_dir.clone()))
        as Arc<dyn cache::TickerCache>;

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .context("failed to build shared HTTP client")?;

    let screener_base_url =
        std::env::var("SCREENER_BASE_URL").context("SCREENER_BASE_URL must be set")?;
    let screener_page_size: u32 = std::env::var("SCREENER_PAGE_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);
    let screener = Arc::new(HttpScreener::new(http_client.clone(), screener_base_url, screener_page_size))
        as Arc<dyn screener::Screener>;

    let advisors = build_advisors(&http_client)?;

    let selection = Arc::new(SelectionPipeline::new(
        screener,
        advisors,
        cache.clone(),
        config.ai_scanner.scan_passes,
        config.ai_scanner.prompt_template.clone(),
    ));

    let gateway = build_order_gateway();

    let realtime_url = std::env::var("REALTIME_WS_URL").context("REALTIME_WS_URL must be set")?;
    let fanout = RealtimeFanout::new(
        Arc::new(WsRealtimeSource::new(realtime_url)),
        Arc::new(WireTickDecoder),
        Duration::from_millis(config.realtime.reconnect_delay_ms),
        config.realtime.max_reconnect_attempts,
    );

    let earnings_strategy = Arc::new(EarningsStrategy::new(
        "earnings-consensus",
        selection,
        gateway,
        fanout.clone(),
        calendar.clone(),
        config.strategy.candle_period_ms,
        config.strategy.warmup_hour,
        config.strategy.warmup_minute,
        1,
    ));

    let strategies: Vec<Arc<dyn Strategy>> = vec![earnings_strategy];
    let runner = Arc::new(StrategyRunner::new(
        strategies,
        config.scheduler.strategy_max_retries,
        Duration::from_secs(config.scheduler.strategy_retry_delay_secs),
    ));

    let orchestrator = Arc::new(SessionOrchestrator::new(calendar, runner, cache));

    let orchestrator_task = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    info!("engine running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    orchestrator.stop();
    if let Err(e) = orchestrator_task.await {
        error!(error = %e, "orchestrator task panicked during shutdown");
    }

    fanout.close();

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Aurora Earnings Engine shut down complete.");
    Ok(())
}
