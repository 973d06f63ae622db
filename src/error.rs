// =============================================================================
// Error Taxonomy — typed errors per component boundary
// =============================================================================
//
// Each component that can fail in a way callers need to branch on (not just
// log-and-bubble) gets its own `thiserror` enum. Cross-cutting glue code in
// `main.rs` and the orchestrator still uses `anyhow::Result` with
// `.context(...)`, the same split the teacher crate used between
// `binance/client.rs` (anyhow) and its own internal invariants.
//
// Programming-invariant violations (a closed candle with `high < low`, a
// negative allocated capital) are never represented here — they are
// `debug_assert!`/`panic!` at the call site, per the non-retryable class in
// the error-handling design.
// =============================================================================

use thiserror::Error;

/// Failures from the [`crate::cache::TickerCache`] boundary.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to read cache entry for {date}: {source}")]
    Read {
        date: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write cache entry for {date}: {source}")]
    Write {
        date: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cache entry for {date} is not valid JSON: {source}")]
    Malformed {
        date: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures from the [`crate::selection::SelectionPipeline`] boundary.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("screener failed: {0}")]
    Screener(#[source] anyhow::Error),
    #[error("cache I/O failed: {0}")]
    Cache(#[from] CacheError),
}

/// Failures from the [`crate::fanout::RealtimeFanout`] boundary.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("connection attempt failed: {0}")]
    Connect(#[source] anyhow::Error),
    #[error("exhausted {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("fan-out is closed")]
    Closed,
}

/// Internal cursor-read failures used by [`crate::decoder`]. `decode_tick`
/// is total — it catches these at the tag/field loop and returns the `Tick`
/// accumulated so far instead of propagating them, per the forward-
/// compatibility contract. These variants exist for the cursor's internal
/// bookkeeping; a caller of [`crate::decoder::TickDecoder::decode`] never
/// observes them.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame truncated mid-tag at byte {offset}")]
    TruncatedTag { offset: usize },
    #[error("frame truncated mid-value at byte {offset}")]
    TruncatedValue { offset: usize },
}

/// Failures from the [`crate::gateway::OrderGateway`] boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway rejected order for {symbol}: {reason}")]
    Rejected { symbol: String, reason: String },
    #[error("gateway transport error: {0}")]
    Transport(#[source] anyhow::Error),
}

/// Failures that disable a strategy for the remainder of the session.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("initialization failed: {0}")]
    Init(#[source] anyhow::Error),
}
