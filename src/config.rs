// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Mirrors the teacher's `runtime_config.rs`: every tunable the core consumes
// (spec §6's configuration-surface table) lives in one struct, every field
// carries a `#[serde(default = "...")]` so older config files stay loadable,
// and persistence uses the same tmp-write-then-rename atomic pattern.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_exchange() -> String {
    "XNYS".to_string()
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_strategy_max_retries() -> u32 {
    3
}

fn default_strategy_retry_delay_secs() -> u64 {
    5
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_dir() -> String {
    "/tmp/aurora/tickers".to_string()
}

fn default_scan_passes() -> u32 {
    1
}

fn default_prompt_template() -> String {
    "Given this list of tickers reporting earnings tomorrow: {tickers}. \
     Which are likely to see a significant price move? Respond as a JSON \
     array of objects with a \"ticker\" field."
        .to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_candle_period_ms() -> i64 {
    300_000 // 5 minutes, per spec §9's resolution of the candle-period ambiguity
}

fn default_warmup_hour() -> u32 {
    9
}

fn default_warmup_minute() -> u32 {
    35
}

fn default_pre_market_hour() -> u32 {
    4
}

fn default_post_session_hour() -> u32 {
    20
}

// =============================================================================
// Sub-configs
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_strategy_max_retries")]
    pub strategy_max_retries: u32,
    #[serde(default = "default_strategy_retry_delay_secs")]
    pub strategy_retry_delay_secs: u64,
    #[serde(default = "default_pre_market_hour")]
    pub pre_market_open_hour: u32,
    #[serde(default = "default_post_session_hour")]
    pub post_session_close_hour: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            timezone: default_timezone(),
            strategy_max_retries: default_strategy_max_retries(),
            strategy_retry_delay_secs: default_strategy_retry_delay_secs(),
            pre_market_open_hour: default_pre_market_hour(),
            post_session_close_hour: default_post_session_hour(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            cache_dir: default_cache_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiScannerConfig {
    #[serde(default = "default_scan_passes")]
    pub scan_passes: u32,
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
}

impl Default for AiScannerConfig {
    fn default() -> Self {
        Self {
            scan_passes: default_scan_passes(),
            prompt_template: default_prompt_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

/// Strategy sizing parameters: warm-up boundary and candle period. The
/// bracket-sizing constants (entry/stop/take percentages) are intentionally
/// *not* here — the original hardcodes them and spec §4.7 keeps them fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_warmup_hour")]
    pub warmup_hour: u32,
    #[serde(default = "default_warmup_minute")]
    pub warmup_minute: u32,
    #[serde(default = "default_candle_period_ms")]
    pub candle_period_ms: i64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            warmup_hour: default_warmup_hour(),
            warmup_minute: default_warmup_minute(),
            candle_period_ms: default_candle_period_ms(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ai_scanner: AiScannerConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Symbols the engine watches if the selection pipeline is bypassed;
    /// empty by default since the watchlist is normally pipeline-derived.
    #[serde(default)]
    pub fallback_symbols: Vec<String>,
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;
        info!(path = %path.display(), "runtime config loaded");
        Ok(config)
    }

    /// Persist via an atomic write: write to a `.tmp` sibling, then rename.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.scheduler.exchange, "XNYS");
        assert_eq!(cfg.scheduler.strategy_max_retries, 3);
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.ai_scanner.scan_passes, 1);
        assert_eq!(cfg.realtime.max_reconnect_attempts, 5);
        assert_eq!(cfg.strategy.candle_period_ms, 300_000);
        assert_eq!(cfg.strategy.warmup_hour, 9);
        assert_eq!(cfg.strategy.warmup_minute, 35);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.scheduler.exchange, "XNYS");
        assert!(cfg.cache.enabled);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "ai_scanner": { "scan_passes": 3 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.ai_scanner.scan_passes, 3);
        assert_eq!(cfg.scheduler.strategy_max_retries, 3);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.scheduler.exchange, cfg2.scheduler.exchange);
        assert_eq!(cfg.cache.cache_dir, cfg2.cache.cache_dir);
    }

    #[test]
    fn save_then_load_roundtrips_through_disk() {
        let dir = std::env::temp_dir().join(format!(
            "aurora-cfg-test-{}",
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.ai_scanner.scan_passes = 7;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.ai_scanner.scan_passes, 7);

        std::fs::remove_dir_all(&dir).ok();
    }
}
