// =============================================================================
// Strategy — earnings/AI-consensus bracket-order business logic
// =============================================================================
//
// Implements spec §4.7. `EarningsStrategy` owns one `CandleBuilder`, one
// frozen per-symbol capital slice, and one "already-ordered" set, all behind
// a single consumer task that drains its tick inlet — so `on_candle` can
// never run concurrently with another `on_candle` for the same symbol in the
// same strategy, by construction (one task, one channel, sequential drain).
//
// The ordered set is the one-order-per-symbol guarantee's truth source: a
// symbol enters it only on a confirmed `OrderGateway::place_order` success.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, TimeZone};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::calendar::MarketCalendar;
use crate::candle::CandleBuilder;
use crate::gateway::OrderGateway;
use crate::selection::SelectionPipeline;
use crate::fanout::RealtimeFanout;
use crate::types::{Candle, OrderIntent, OrderSide, OrderType, Symbol};

/// Entry is shaved 1% below the closing candle's low; stop is 4% below
/// entry; take-profit is 8% above entry. From
/// `examples/original_source/strategy/earning_strategy/earning_strategy.py`,
/// kept as fixed constants per spec §4.7 rather than made configurable.
const ENTRY_DISCOUNT: f64 = 0.01;
const STOP_LOSS_PCT: f64 = 0.04;
const TAKE_PROFIT_PCT: f64 = 0.08;

#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    async fn initialize(&self) -> anyhow::Result<()>;
    async fn shutdown(&self);
    fn is_initialized(&self) -> bool;
}

struct Inner {
    gateway: Arc<dyn OrderGateway>,
    calendar: Arc<dyn MarketCalendar>,
    warmup_hour: u32,
    warmup_minute: u32,
    /// Symbol -> frozen allocated capital, fixed for the session at
    /// `initialize` and released at `shutdown`.
    watchlist: RwLock<HashMap<Symbol, f64>>,
    ordered: Mutex<HashSet<Symbol>>,
    builder: Mutex<CandleBuilder>,
}

/// The earnings-catalyst consensus strategy: subscribes to its
/// `SelectionPipeline`-derived watch list, aggregates ticks into candles via
/// its own `CandleBuilder`, and places one bracket order per symbol on the
/// first eligible closed candle after warm-up.
pub struct EarningsStrategy {
    name: String,
    pipeline: Arc<SelectionPipeline>,
    fanout: Arc<RealtimeFanout>,
    sink_id: u64,
    inner: Arc<Inner>,
    initialized: AtomicBool,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
}

impl EarningsStrategy {
    pub fn new(
        name: impl Into<String>,
        pipeline: Arc<SelectionPipeline>,
        gateway: Arc<dyn OrderGateway>,
        fanout: Arc<RealtimeFanout>,
        calendar: Arc<dyn MarketCalendar>,
        candle_period_ms: i64,
        warmup_hour: u32,
        warmup_minute: u32,
        sink_id: u64,
    ) -> Self {
        Self {
            name: name.into(),
            pipeline,
            fanout,
            sink_id,
            inner: Arc::new(Inner {
                gateway,
                calendar,
                warmup_hour,
                warmup_minute,
                watchlist: RwLock::new(HashMap::new()),
                ordered: Mutex::new(HashSet::new()),
                builder: Mutex::new(CandleBuilder::new(candle_period_ms)),
            }),
            initialized: AtomicBool::new(false),
            consumer_task: Mutex::new(None),
        }
    }

    /// Number of symbols currently watched. Exposed for tests/metrics; not
    /// part of the narrow `Strategy` contract.
    pub fn watchlist_len(&self) -> usize {
        self.inner.watchlist.read().len()
    }
}

#[async_trait]
impl Strategy for EarningsStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        let today = self.inner.calendar.now().date_naive();
        let symbols = self
            .pipeline
            .select(today)
            .await
            .map_err(|e| anyhow::anyhow!("selection pipeline failed: {e}"))?;

        let buying_power = self
            .inner
            .gateway
            .get_buying_power()
            .await
            .map_err(|e| anyhow::anyhow!("failed to read buying power: {e}"))?;

        let per_symbol = if symbols.is_empty() {
            0.0
        } else {
            buying_power / symbols.len() as f64
        };

        let watchlist: HashMap<Symbol, f64> = symbols.iter().map(|s| (s.clone(), per_symbol)).collect();
        *self.inner.watchlist.write() = watchlist;
        self.inner.builder.lock().clear();
        self.inner.ordered.lock().clear();

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.fanout.subscribe(&symbols, self.sink_id, &tx);

        let inner = self.inner.clone();
        let strategy_name = self.name.clone();
        let task = tokio::spawn(async move {
            while let Some(tick) = rx.recv().await {
                let closed = inner.builder.lock().on_tick(&tick);
                if let Some(candle) = closed {
                    handle_closed_candle(&inner, &strategy_name, tick.symbol, candle).await;
                }
            }
        });
        *self.consumer_task.lock() = Some(task);

        self.initialized.store(true, Ordering::SeqCst);
        info!(strategy = %self.name, watchlist = symbols.len(), per_symbol_capital = per_symbol, "strategy initialized");
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(task) = self.consumer_task.lock().take() {
            task.abort();
        }

        let symbols: Vec<Symbol> = self.inner.watchlist.read().keys().cloned().collect();
        self.fanout.unsubscribe(&symbols, self.sink_id);

        self.inner.builder.lock().clear();
        self.inner.ordered.lock().clear();
        self.inner.watchlist.write().clear();
        self.initialized.store(false, Ordering::SeqCst);
        debug!(strategy = %self.name, "strategy shut down");
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

async fn handle_closed_candle(inner: &Arc<Inner>, strategy_name: &str, symbol: Symbol, candle: Candle) {
    let now = inner.calendar.now();
    let today = now.date_naive();
    let warmup = now
        .timezone()
        .with_ymd_and_hms(today.year(), today.month(), today.day(), inner.warmup_hour, inner.warmup_minute, 0)
        .single();

    let Some(warmup) = warmup else {
        error!(strategy = strategy_name, "could not construct warm-up instant, skipping candle");
        return;
    };

    if now < warmup {
        debug!(strategy = strategy_name, symbol = %symbol, "candle closed before warm-up, ignoring");
        return;
    }

    if inner.ordered.lock().contains(&symbol) {
        return;
    }

    let allocated = match inner.watchlist.read().get(&symbol).copied() {
        Some(v) => v,
        None => return, // not (or no longer) in the watch list
    };

    let entry = round2(candle.low * (1.0 - ENTRY_DISCOUNT));
    if entry <= 0.0 {
        warn!(strategy = strategy_name, symbol = %symbol, "non-positive entry price computed, skipping");
        return;
    }
    let stop_loss = round2(entry * (1.0 - STOP_LOSS_PCT));
    let take_profit = round2(entry * (1.0 + TAKE_PROFIT_PCT));
    let quantity = (allocated / entry).floor() as i64;

    if quantity < 1 {
        debug!(strategy = strategy_name, symbol = %symbol, allocated, entry, "quantity floors below 1, no order, symbol stays untagged");
        return;
    }

    let intent = OrderIntent {
        symbol: symbol.clone(),
        side: OrderSide::Buy,
        order_type: OrderType::Limit,
        entry,
        stop_loss,
        take_profit,
        quantity: quantity as u64,
    };

    match inner.gateway.place_order(intent).await {
        Ok(ack) => {
            inner.ordered.lock().insert(symbol.clone());
            info!(strategy = strategy_name, symbol = %symbol, order_id = %ack.order_id, entry, stop_loss, take_profit, quantity, "bracket order placed");
        }
        Err(e) => {
            warn!(strategy = strategy_name, symbol = %symbol, error = %e, "order placement failed, symbol remains untagged for retry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::FakeCalendar;
    use crate::error::GatewayError;
    use crate::types::{OrderAck, OrderState, Portfolio};
    use async_trait::async_trait;
    use chrono_tz::America::New_York;
    use std::sync::atomic::AtomicU64;

    struct MockGateway {
        buying_power: f64,
        placed: Mutex<Vec<OrderIntent>>,
        reject_next: AtomicBool,
    }

    impl MockGateway {
        fn new(buying_power: f64) -> Self {
            Self {
                buying_power,
                placed: Mutex::new(Vec::new()),
                reject_next: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl OrderGateway for MockGateway {
        async fn place_order(&self, intent: OrderIntent) -> Result<OrderAck, GatewayError> {
            if self.reject_next.swap(false, Ordering::SeqCst) {
                return Err(GatewayError::Rejected {
                    symbol: intent.symbol.to_string(),
                    reason: "simulated rejection".to_string(),
                });
            }
            let ack = OrderAck {
                order_id: format!("mock-{}", self.placed.lock().len() + 1),
                symbol: intent.symbol.clone(),
            };
            self.placed.lock().push(intent);
            Ok(ack)
        }
        async fn cancel_order(&self, _id: &str) -> Result<OrderState, GatewayError> {
            Ok(OrderState::Cancelled)
        }
        async fn get_order(&self, _id: &str) -> Result<OrderState, GatewayError> {
            Ok(OrderState::Filled)
        }
        async fn get_portfolio(&self) -> Result<Portfolio, GatewayError> {
            Ok(Portfolio { cash: self.buying_power, buying_power: self.buying_power, positions: vec![] })
        }
        async fn get_buying_power(&self) -> Result<f64, GatewayError> {
            Ok(self.buying_power)
        }
    }

    fn post_warmup_calendar() -> Arc<FakeCalendar> {
        let start = New_York.with_ymd_and_hms(2026, 7, 28, 9, 40, 0).unwrap();
        Arc::new(FakeCalendar::new(start, 4, 20))
    }

    #[test]
    fn first_candle_order_matches_spec_example() {
        // low=100.00, per_symbol=$1000 -> entry=99.00, stop=95.04, take=106.92, qty=10
        let entry = round2(100.00 * (1.0 - ENTRY_DISCOUNT));
        let stop = round2(entry * (1.0 - STOP_LOSS_PCT));
        let take = round2(entry * (1.0 + TAKE_PROFIT_PCT));
        let qty = (1000.0_f64 / entry).floor() as i64;

        assert_eq!(entry, 99.00);
        assert_eq!(stop, 95.04);
        assert_eq!(take, 106.92);
        assert_eq!(qty, 10);
    }

    #[tokio::test]
    async fn below_minimum_quantity_places_no_order() {
        let inner = Arc::new(Inner {
            gateway: Arc::new(MockGateway::new(50.0)),
            calendar: post_warmup_calendar(),
            warmup_hour: 9,
            warmup_minute: 35,
            watchlist: RwLock::new(HashMap::from([(Symbol::new("X"), 50.0)])),
            ordered: Mutex::new(HashSet::new()),
            builder: Mutex::new(CandleBuilder::new(60_000)),
        });

        let candle = Candle { open: 100.0, high: 101.0, low: 100.0, close: 100.5, volume: 10, start_time_ms: 0, period_ms: 60_000 };
        handle_closed_candle(&inner, "test", Symbol::new("X"), candle).await;

        assert!(!inner.ordered.lock().contains(&Symbol::new("X")));
    }

    #[tokio::test]
    async fn successful_order_tags_symbol_and_blocks_further_orders() {
        let gateway = Arc::new(MockGateway::new(1000.0));
        let inner = Arc::new(Inner {
            gateway: gateway.clone(),
            calendar: post_warmup_calendar(),
            warmup_hour: 9,
            warmup_minute: 35,
            watchlist: RwLock::new(HashMap::from([(Symbol::new("X"), 1000.0)])),
            ordered: Mutex::new(HashSet::new()),
            builder: Mutex::new(CandleBuilder::new(60_000)),
        });

        let candle = Candle { open: 100.0, high: 101.0, low: 100.0, close: 100.5, volume: 10, start_time_ms: 0, period_ms: 60_000 };
        handle_closed_candle(&inner, "test", Symbol::new("X"), candle.clone()).await;
        assert!(inner.ordered.lock().contains(&Symbol::new("X")));
        assert_eq!(gateway.placed.lock().len(), 1);

        // A second closed candle for the same symbol must not place a second order.
        handle_closed_candle(&inner, "test", Symbol::new("X"), candle).await;
        assert_eq!(gateway.placed.lock().len(), 1);
    }

    #[tokio::test]
    async fn candle_before_warmup_is_ignored() {
        let start = New_York.with_ymd_and_hms(2026, 7, 28, 9, 31, 0).unwrap();
        let calendar = Arc::new(FakeCalendar::new(start, 4, 20));
        let gateway = Arc::new(MockGateway::new(1000.0));
        let inner = Arc::new(Inner {
            gateway: gateway.clone(),
            calendar,
            warmup_hour: 9,
            warmup_minute: 35,
            watchlist: RwLock::new(HashMap::from([(Symbol::new("X"), 1000.0)])),
            ordered: Mutex::new(HashSet::new()),
            builder: Mutex::new(CandleBuilder::new(60_000)),
        });

        let candle = Candle { open: 100.0, high: 101.0, low: 100.0, close: 100.5, volume: 10, start_time_ms: 0, period_ms: 60_000 };
        handle_closed_candle(&inner, "test", Symbol::new("X"), candle).await;
        assert!(gateway.placed.lock().is_empty());
    }

    #[tokio::test]
    async fn rejected_order_leaves_symbol_untagged_for_retry() {
        let gateway = Arc::new(MockGateway::new(1000.0));
        gateway.reject_next.store(true, Ordering::SeqCst);
        let inner = Arc::new(Inner {
            gateway: gateway.clone(),
            calendar: post_warmup_calendar(),
            warmup_hour: 9,
            warmup_minute: 35,
            watchlist: RwLock::new(HashMap::from([(Symbol::new("X"), 1000.0)])),
            ordered: Mutex::new(HashSet::new()),
            builder: Mutex::new(CandleBuilder::new(60_000)),
        });

        let candle = Candle { open: 100.0, high: 101.0, low: 100.0, close: 100.5, volume: 10, start_time_ms: 0, period_ms: 60_000 };
        handle_closed_candle(&inner, "test", Symbol::new("X"), candle.clone()).await;
        assert!(!inner.ordered.lock().contains(&Symbol::new("X")));

        handle_closed_candle(&inner, "test", Symbol::new("X"), candle).await;
        assert!(inner.ordered.lock().contains(&Symbol::new("X")));
        assert_eq!(gateway.placed.lock().len(), 1);
    }

    static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

    #[tokio::test]
    async fn shutdown_clears_watchlist_builder_and_ordered_set() {
        use crate::advisor::Advisor;
        use crate::cache::TickerCache;
        use crate::decoder::decode_tick;
        use crate::error::{CacheError, DecodeError};
        use crate::fanout::{RealtimeConnection, RealtimeSource};
        use crate::screener::Screener;
        use crate::types::Tick;
        use std::time::Duration;

        struct EmptyScreener;
        #[async_trait]
        impl Screener for EmptyScreener {
            async fn list(&self) -> anyhow::Result<Vec<Symbol>> {
                Ok(vec![])
            }
        }
        struct NoopAdvisor;
        #[async_trait]
        impl Advisor for NoopAdvisor {
            async fn recommend(&self, _prompt: &str) -> anyhow::Result<String> {
                Ok(String::new())
            }
        }
        struct NoCache;
        impl TickerCache for NoCache {
            fn save(&self, _d: chrono::NaiveDate, _s: &[Symbol]) -> Result<(), CacheError> {
                Ok(())
            }
            fn load(&self, _d: chrono::NaiveDate) -> Result<Option<Vec<Symbol>>, CacheError> {
                Ok(None)
            }
            fn sweep(&self, _d: chrono::NaiveDate) -> Result<(), CacheError> {
                Ok(())
            }
        }
        struct DummyConn;
        #[async_trait]
        impl RealtimeConnection for DummyConn {
            async fn send_subscribe(&mut self, _s: &[Symbol]) -> anyhow::Result<()> {
                Ok(())
            }
            async fn send_unsubscribe(&mut self, _s: &[Symbol]) -> anyhow::Result<()> {
                Ok(())
            }
            async fn recv(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
                std::future::pending().await
            }
        }
        struct DummySource;
        #[async_trait]
        impl RealtimeSource for DummySource {
            async fn connect(&self) -> anyhow::Result<Box<dyn RealtimeConnection>> {
                Ok(Box::new(DummyConn))
            }
        }
        struct PassthroughDecoder;
        impl crate::decoder::TickDecoder for PassthroughDecoder {
            fn decode(&self, bytes: &[u8]) -> Result<Tick, DecodeError> {
                decode_tick(bytes)
            }
        }

        let pipeline = Arc::new(SelectionPipeline::new(
            Arc::new(EmptyScreener),
            vec![Arc::new(NoopAdvisor)],
            Arc::new(NoCache),
            1,
            "{tickers}",
        ));
        let fanout = RealtimeFanout::new(Arc::new(DummySource), Arc::new(PassthroughDecoder), Duration::from_millis(1), 1);
        let gateway = Arc::new(MockGateway::new(1000.0));
        let calendar = post_warmup_calendar();

        let strategy = EarningsStrategy::new(
            "earnings",
            pipeline,
            gateway,
            fanout,
            calendar,
            60_000,
            9,
            35,
            NEXT_SINK_ID.fetch_add(1, Ordering::SeqCst),
        );

        strategy.initialize().await.unwrap();
        assert!(strategy.is_initialized());
        strategy.shutdown().await;
        assert!(!strategy.is_initialized());
        assert_eq!(strategy.watchlist_len(), 0);
    }
}
