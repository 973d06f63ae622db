// =============================================================================
// SessionOrchestrator — the day-cycle state machine
// =============================================================================
//
// Implements spec §4.9. One full cycle is
// WAIT_PREOPEN -> STARTING -> SERVING -> STOPPING -> SWEEP_CACHE, then back
// to WAIT_PREOPEN for the next session day. `stop()` is cooperative: it sets
// a flag that every wait loop and the serve loop check on each iteration, so
// a shutdown requested mid-SERVING still runs STOPPING and SWEEP_CACHE
// before `run()` returns, rather than abandoning open strategies.
//
// The pre-open wait sleeps in 60-second slices far from the open and refines
// to 1-second slices in the final minute, so the orchestrator wakes
// promptly without busy-polling for hours. `health_check` runs on a
// 1-second cadence throughout SERVING.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cache::TickerCache;
use crate::calendar::MarketCalendar;
use crate::runner::StrategyRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    WaitPreopen,
    Starting,
    Serving,
    Stopping,
    SweepCache,
}

const REFINE_WINDOW: Duration = Duration::from_secs(60);
const COARSE_SLEEP: Duration = Duration::from_secs(60);
const FINE_SLEEP: Duration = Duration::from_secs(1);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct SessionOrchestrator {
    calendar: Arc<dyn MarketCalendar>,
    runner: Arc<StrategyRunner>,
    cache: Arc<dyn TickerCache>,
    stop_flag: Arc<AtomicBool>,
    phase: parking_lot::Mutex<Phase>,
}

impl SessionOrchestrator {
    pub fn new(calendar: Arc<dyn MarketCalendar>, runner: Arc<StrategyRunner>, cache: Arc<dyn TickerCache>) -> Self {
        Self {
            calendar,
            runner,
            cache,
            stop_flag: Arc::new(AtomicBool::new(false)),
            phase: parking_lot::Mutex::new(Phase::Idle),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Request a cooperative shutdown. `run()` finishes its current phase
    /// (including STOPPING and SWEEP_CACHE if already past STARTING) and
    /// returns instead of beginning another cycle.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
        info!(phase = ?phase, "orchestrator phase transition");
    }

    /// Run day cycles until `stop()` is called.
    pub async fn run(&self) {
        loop {
            if self.stopped() {
                break;
            }
            self.run_one_cycle().await;
            if self.stopped() {
                break;
            }
        }
        self.set_phase(Phase::Idle);
    }

    /// Run exactly one WAIT_PREOPEN -> STARTING -> SERVING -> STOPPING ->
    /// SWEEP_CACHE cycle. Exposed directly for tests that need to assert on
    /// a single cycle's effects without looping forever.
    pub async fn run_one_cycle(&self) {
        self.wait_preopen().await;
        if self.stopped() {
            return;
        }

        self.set_phase(Phase::Starting);
        self.runner.start_all().await;

        self.serve().await;

        self.set_phase(Phase::Stopping);
        self.runner.stop_all().await;

        self.set_phase(Phase::SweepCache);
        let today = self.calendar.now().date_naive();
        if let Err(e) = self.cache.sweep(today) {
            tracing::warn!(error = %e, "ticker cache sweep failed");
        }
    }

    async fn wait_preopen(&self) {
        self.set_phase(Phase::WaitPreopen);
        loop {
            if self.stopped() {
                return;
            }
            let now = self.calendar.now();
            let next_open = self.calendar.next_session_open(now);
            let pre_open = self.calendar.pre_market_open(next_open);

            if now >= pre_open {
                return;
            }

            let remaining = pre_open - now;
            let sleep_for = if remaining > chrono::Duration::from_std(REFINE_WINDOW).unwrap() {
                COARSE_SLEEP
            } else {
                FINE_SLEEP
            };
            tokio::time::sleep(sleep_for).await;
        }
    }

    async fn serve(&self) {
        self.set_phase(Phase::Serving);
        loop {
            if self.stopped() {
                return;
            }
            let now = self.calendar.now();
            let post_close = self.calendar.post_session_close(now);
            if now >= post_close {
                return;
            }

            self.runner.health_check().await;
            tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
        }
    }
}
