// =============================================================================
// Core Data Model — Symbol, Tick, Candle, Watchlist, Order Intent
// =============================================================================
//
// Values in this module are cheap to clone and carry no I/O. `Symbol` is an
// opaque case-folded wrapper rather than a bare `String` so that every
// ingress point (screener, advisor extraction, wire decode) folds case
// exactly once and every downstream comparison is a plain byte compare.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Symbol
// =============================================================================

/// An equity ticker symbol, case-folded to upper-case on construction.
///
/// 1-5 letters plus an optional `.XX` suffix (e.g. `BRK.B`). Equality is
/// byte-equal after folding; no further validation is performed here — the
/// screener/advisor boundary is responsible for filtering out garbage.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// Session phase
// =============================================================================

/// Market session phase as reported by the real-time data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionPhase {
    Pre,
    Reg,
    Post,
    Ext,
    Ovn,
}

impl SessionPhase {
    /// Map a wire-level integer to a phase, clamping unknown values to
    /// `Reg` per the decoder contract.
    pub fn from_wire(value: i64) -> Self {
        match value {
            0 => Self::Pre,
            1 => Self::Reg,
            2 => Self::Post,
            3 => Self::Ext,
            4 => Self::Ovn,
            _ => Self::Reg,
        }
    }
}

impl Default for SessionPhase {
    fn default() -> Self {
        Self::Reg
    }
}

// =============================================================================
// Tick
// =============================================================================

/// A single immutable price update. Lives only as long as dispatch; it is
/// never retained by a subscriber past the callback invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: Symbol,
    pub price: f64,
    /// Milliseconds since the UNIX epoch.
    pub timestamp_ms: i64,
    pub currency: String,
    pub venue: String,
    pub session_phase: SessionPhase,
    pub day_volume: i64,
    pub day_high: f64,
    pub day_low: f64,
    pub open_price: f64,
    pub prev_close: f64,
    pub bid: f64,
    pub bid_size: i64,
    pub ask: f64,
    pub ask_size: i64,
    pub last_size: i64,
    pub change: f64,
    pub change_pct: f64,
    pub short_name: String,
}

impl Default for Tick {
    fn default() -> Self {
        Self {
            symbol: Symbol::new(""),
            price: 0.0,
            timestamp_ms: 0,
            currency: String::new(),
            venue: String::new(),
            session_phase: SessionPhase::Reg,
            day_volume: 0,
            day_high: 0.0,
            day_low: 0.0,
            open_price: 0.0,
            prev_close: 0.0,
            bid: 0.0,
            bid_size: 0,
            ask: 0.0,
            ask_size: 0,
            last_size: 0,
            change: 0.0,
            change_pct: 0.0,
            short_name: String::new(),
        }
    }
}

// =============================================================================
// Candle
// =============================================================================

/// A fixed-duration OHLCV bar. `closed` candles are immutable; only
/// `CandleBuilder` may mutate a candle while it is still open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    /// Milliseconds since the UNIX epoch, aligned to `period`.
    pub start_time_ms: i64,
    pub period_ms: i64,
}

impl Candle {
    /// Validate the invariants a *closed* candle must uphold.
    ///
    /// Used in tests and as a `debug_assert!` in the builder — an invariant
    /// failure here is a programming error, not a retryable condition.
    pub fn is_valid_closed(&self) -> bool {
        self.low <= self.open.min(self.close)
            && self.open.max(self.close) <= self.high
            && self.low <= self.high
            && self.volume >= 0
    }
}

// =============================================================================
// Watchlist / order intent
// =============================================================================

/// A symbol selected for today's session, with its frozen capital slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub symbol: Symbol,
    pub allocated_capital: f64,
}

/// Side of an order. The system only ever originates the long-entry leg of
/// a bracket; `Sell` exists so the type models the gateway's general shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
}

/// A bracketed limit-entry order intent: entry + stop-loss + take-profit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: Symbol,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub entry: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: u64,
}

impl OrderIntent {
    /// `stop_loss < entry < take_profit` and `quantity >= 1`.
    pub fn is_valid(&self) -> bool {
        self.stop_loss < self.entry && self.entry < self.take_profit && self.quantity >= 1
    }
}

/// Broker acknowledgement of a placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub symbol: Symbol,
}

/// Lifecycle state of a previously placed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

/// Coarse portfolio snapshot returned by `OrderGateway::get_portfolio`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub cash: f64,
    pub buying_power: f64,
    pub positions: Vec<PortfolioPosition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub symbol: Symbol,
    pub quantity: f64,
    pub average_price: f64,
}

// =============================================================================
// Ticker cache
// =============================================================================

/// A persisted date -> symbol-list mapping entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedDay {
    pub date: String,
    pub symbols: Vec<Symbol>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_case_folds_and_trims() {
        assert_eq!(Symbol::new(" aapl ").as_str(), "AAPL");
        assert_eq!(Symbol::from("brk.b"), Symbol::new("BRK.B"));
    }

    #[test]
    fn session_phase_clamps_unknown_to_reg() {
        assert_eq!(SessionPhase::from_wire(99), SessionPhase::Reg);
        assert_eq!(SessionPhase::from_wire(0), SessionPhase::Pre);
    }

    #[test]
    fn candle_invariant_detects_bad_high_low() {
        let bad = Candle {
            open: 10.0,
            high: 9.0,
            low: 8.0,
            close: 10.5,
            volume: 5,
            start_time_ms: 0,
            period_ms: 60_000,
        };
        assert!(!bad.is_valid_closed());

        let good = Candle {
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.5,
            volume: 5,
            start_time_ms: 0,
            period_ms: 60_000,
        };
        assert!(good.is_valid_closed());
    }

    #[test]
    fn order_intent_validity() {
        let valid = OrderIntent {
            symbol: Symbol::new("AAPL"),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            entry: 100.0,
            stop_loss: 95.0,
            take_profit: 110.0,
            quantity: 1,
        };
        assert!(valid.is_valid());

        let invalid = OrderIntent {
            quantity: 0,
            ..valid.clone()
        };
        assert!(!invalid.is_valid());
    }
}
