// =============================================================================
// StrategyRunner — bounded-retry supervisor over a fixed set of strategies
// =============================================================================
//
// Implements spec §4.8. Each strategy gets up to `max_retries` consecutive
// `initialize()` failures, separated by `retry_delay`, before it is
// permanently disabled for the rest of the session. `health_check` is the
// liveness poll the orchestrator drives once a second during SERVING: a
// strategy that reports `is_initialized() == false` outside of a deliberate
// shutdown is treated as having crashed and is restarted under the same
// retry budget. `stop_all` shuts down only strategies that are currently
// active, so a strategy that never got past `initialize()` is skipped
// cleanly rather than having `shutdown()` called on state that was never
// built.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::strategy::Strategy;

#[derive(Debug, Clone, Copy, Default)]
struct RunnerState {
    failures: u32,
    active: bool,
    disabled: bool,
}

/// Supervises a fixed list of strategies through start, periodic health
/// checks, and coordinated shutdown.
pub struct StrategyRunner {
    strategies: Vec<Arc<dyn Strategy>>,
    max_retries: u32,
    retry_delay: Duration,
    state: Mutex<HashMap<usize, RunnerState>>,
}

impl StrategyRunner {
    pub fn new(strategies: Vec<Arc<dyn Strategy>>, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            strategies,
            max_retries: max_retries.max(1),
            retry_delay,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().values().filter(|s| s.active).count()
    }

    /// Attempt to bring every strategy up, retrying each independently.
    /// Strategies disabled here never run this session.
    pub async fn start_all(&self) {
        for (idx, strategy) in self.strategies.iter().enumerate() {
            let mut failures = 0u32;
            loop {
                match strategy.initialize().await {
                    Ok(()) => {
                        self.state.lock().insert(idx, RunnerState { failures: 0, active: true, disabled: false });
                        info!(strategy = strategy.name(), "strategy started");
                        break;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(strategy = strategy.name(), attempt = failures, error = %e, "strategy initialize failed");
                        if failures >= self.max_retries {
                            error!(strategy = strategy.name(), failures, "strategy disabled after exhausting retries");
                            self.state.lock().insert(idx, RunnerState { failures, active: false, disabled: true });
                            break;
                        }
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
    }

    /// Poll every non-disabled strategy's liveness; restart any that report
    /// `is_initialized() == false`, permanently disabling it once its retry
    /// budget is exhausted.
    pub async fn health_check(&self) {
        for (idx, strategy) in self.strategies.iter().enumerate() {
            let tracked = self.state.lock().get(&idx).copied().unwrap_or_default();
            if tracked.disabled || !tracked.active {
                continue;
            }
            if strategy.is_initialized() {
                continue;
            }

            let failures = tracked.failures + 1;
            if failures >= self.max_retries {
                error!(strategy = strategy.name(), failures, "strategy permanently disabled after liveness failures");
                self.state.lock().insert(idx, RunnerState { failures, active: false, disabled: true });
                continue;
            }

            warn!(strategy = strategy.name(), failures, "strategy found not initialized, restarting");
            match strategy.initialize().await {
                Ok(()) => {
                    self.state.lock().insert(idx, RunnerState { failures: 0, active: true, disabled: false });
                    info!(strategy = strategy.name(), "strategy restarted");
                }
                Err(e) => {
                    warn!(strategy = strategy.name(), error = %e, "strategy restart failed");
                    self.state.lock().insert(idx, RunnerState { failures, active: true, disabled: false });
                }
            }
        }
    }

    /// Shut down every strategy that is currently active. A strategy that
    /// never became active (disabled at start, or never attempted) is
    /// skipped without calling `shutdown()`.
    pub async fn stop_all(&self) {
        for (idx, strategy) in self.strategies.iter().enumerate() {
            let active = self.state.lock().get(&idx).map(|s| s.active).unwrap_or(false);
            if !active {
                debug!(strategy = strategy.name(), "skipping shutdown, strategy never became active");
                continue;
            }
            strategy.shutdown().await;
            self.state.lock().insert(idx, RunnerState { failures: 0, active: false, disabled: false });
            info!(strategy = strategy.name(), "strategy stopped");
        }
    }
}
