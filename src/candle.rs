// =============================================================================
// CandleBuilder — per-symbol tick-driven OHLCV accumulation
// =============================================================================
//
// Grounded on spec §4.6: the builder is driven by *tick arrival timestamps*,
// not wall clock, so a quiet symbol never emits a candle until its next tick
// arrives — every closed candle is backed by at least two observations (the
// seed tick plus whichever tick crosses the period boundary).
// =============================================================================

use std::collections::HashMap;

use crate::types::{Candle, Symbol, Tick};

/// Mutable accumulator for one symbol's in-progress candle.
#[derive(Debug, Clone)]
struct OpenCandle {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: i64,
    start_time_ms: i64,
}

impl OpenCandle {
    fn seed(tick: &Tick) -> Self {
        Self {
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.last_size,
            start_time_ms: tick.timestamp_ms,
        }
    }

    fn update(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.last_size;
    }

    fn close_at(&self, period_ms: i64) -> Candle {
        Candle {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            start_time_ms: self.start_time_ms,
            period_ms,
        }
    }
}

/// Per-symbol candle accumulator, owned 1:1 by a [`crate::strategy::Strategy`].
/// Destroyed at shutdown along with the rest of the strategy's state.
pub struct CandleBuilder {
    period_ms: i64,
    open: HashMap<Symbol, OpenCandle>,
}

impl CandleBuilder {
    pub fn new(period_ms: i64) -> Self {
        assert!(period_ms > 0, "candle period must be positive");
        Self {
            period_ms,
            open: HashMap::new(),
        }
    }

    /// Feed one tick. Returns `Some(closed candle)` if this tick closed the
    /// symbol's current window (the new window is already seeded from this
    /// tick when that happens).
    pub fn on_tick(&mut self, tick: &Tick) -> Option<Candle> {
        match self.open.get_mut(&tick.symbol) {
            None => {
                self.open.insert(tick.symbol.clone(), OpenCandle::seed(tick));
                None
            }
            Some(state) => {
                if tick.timestamp_ms - state.start_time_ms >= self.period_ms {
                    let closed = state.close_at(self.period_ms);
                    debug_assert!(
                        closed.is_valid_closed(),
                        "closed candle violated OHLC invariant for {}",
                        tick.symbol
                    );
                    self.open.insert(tick.symbol.clone(), OpenCandle::seed(tick));
                    Some(closed)
                } else {
                    state.update(tick);
                    None
                }
            }
        }
    }

    /// Drop all per-symbol state. Called at strategy shutdown.
    pub fn clear(&mut self) {
        self.open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionPhase;

    fn tick(symbol: &str, price: f64, ts: i64, last_size: i64) -> Tick {
        Tick {
            symbol: Symbol::new(symbol),
            price,
            timestamp_ms: ts,
            last_size,
            session_phase: SessionPhase::Reg,
            ..Default::default()
        }
    }

    #[test]
    fn first_tick_seeds_without_emitting() {
        let mut builder = CandleBuilder::new(60_000);
        let closed = builder.on_tick(&tick("AAPL", 100.0, 0, 10));
        assert!(closed.is_none());
    }

    #[test]
    fn ticks_within_period_update_high_low_close_without_emitting() {
        let mut builder = CandleBuilder::new(60_000);
        builder.on_tick(&tick("AAPL", 100.0, 0, 10));
        assert!(builder.on_tick(&tick("AAPL", 105.0, 10_000, 5)).is_none());
        assert!(builder.on_tick(&tick("AAPL", 98.0, 20_000, 3)).is_none());
    }

    #[test]
    fn tick_past_period_emits_closed_candle_and_reseeds() {
        let mut builder = CandleBuilder::new(60_000);
        builder.on_tick(&tick("AAPL", 100.0, 0, 10));
        builder.on_tick(&tick("AAPL", 105.0, 10_000, 5));
        let closed = builder.on_tick(&tick("AAPL", 102.0, 61_000, 7)).unwrap();

        assert_eq!(closed.open, 100.0);
        assert_eq!(closed.high, 105.0);
        assert_eq!(closed.low, 100.0);
        assert_eq!(closed.close, 105.0);
        assert_eq!(closed.volume, 15);
        assert_eq!(closed.start_time_ms, 0);
        assert!(closed.is_valid_closed());

        // The boundary tick reseeds a fresh window.
        assert!(builder.on_tick(&tick("AAPL", 103.0, 61_500, 1)).is_none());
    }

    #[test]
    fn symbols_accumulate_independently() {
        let mut builder = CandleBuilder::new(60_000);
        builder.on_tick(&tick("AAPL", 100.0, 0, 1));
        builder.on_tick(&tick("MSFT", 300.0, 0, 1));
        let aapl_closed = builder.on_tick(&tick("AAPL", 110.0, 61_000, 1));
        assert!(aapl_closed.is_some());
        // MSFT's window is untouched by AAPL's tick arrivals.
        assert!(builder.on_tick(&tick("MSFT", 305.0, 30_000, 1)).is_none());
    }

    #[test]
    fn quiet_symbol_never_emits_until_next_tick_arrives() {
        let mut builder = CandleBuilder::new(60_000);
        builder.on_tick(&tick("AAPL", 100.0, 0, 1));
        // No ticks at all for a long time: nothing to poll, nothing emits.
        // Only the next tick (whenever it arrives) can trigger a close.
        let closed = builder.on_tick(&tick("AAPL", 101.0, 3_600_000, 2));
        assert!(closed.is_some());
    }

    #[test]
    fn clear_drops_all_open_state() {
        let mut builder = CandleBuilder::new(60_000);
        builder.on_tick(&tick("AAPL", 100.0, 0, 1));
        builder.clear();
        // After clear, the next tick reseeds rather than closing.
        assert!(builder.on_tick(&tick("AAPL", 200.0, 61_000, 1)).is_none());
    }
}
