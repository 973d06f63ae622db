// =============================================================================
// RealtimeFanout — connection-managed tick publish/subscribe with reconnect
// =============================================================================
//
// Implements spec §4.5's reconnect state machine and subscription registry.
// Grounded on the teacher's `market_data/trade_stream.rs` for the "connect,
// read loop, return on error, caller reconnects" shape, generalized here into
// an explicit backoff-driven state machine that also resends the full
// subscription set on every successful (re)connect.
//
// The registry is a `parking_lot::Mutex`-guarded map, mutated only under the
// lock; dispatch takes a snapshot under the lock and invokes sinks outside
// it, so a sink that calls back into `subscribe`/`unsubscribe` cannot
// deadlock the dispatcher. Sink handles are held as `WeakUnboundedSender`s —
// true weak references per spec §3's ownership rule — so a strategy that
// drops its tick inlet without calling `unsubscribe` is pruned lazily on the
// next dispatch attempt rather than leaking a dead registration forever.
//
// Per-sink unsubscribe (spec §9's recommended resolution, not the legacy
// "remove all sinks for a symbol" text): `unsubscribe` takes a sink id and
// only removes that sink's registration; an upstream unsubscribe frame is
// emitted only once a symbol's sink set becomes empty.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::decoder::TickDecoder;
use crate::error::FanoutError;
use crate::types::{Symbol, Tick};

/// One outgoing control frame written to the wire.
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum OutgoingFrame {
    Subscribe { subscribe: Vec<String> },
    Unsubscribe { unsubscribe: Vec<String> },
}

#[derive(Debug, Deserialize)]
struct IncomingFrame {
    message: String,
}

/// A single connected session of the upstream real-time source. Implementors
/// wrap whatever transport carries the framed protocol (spec §6); the
/// fan-out only ever calls these three methods.
#[async_trait]
pub trait RealtimeConnection: Send {
    async fn send_subscribe(&mut self, symbols: &[Symbol]) -> Result<()>;
    async fn send_unsubscribe(&mut self, symbols: &[Symbol]) -> Result<()>;
    /// `Ok(None)` means the stream ended cleanly (server closed); the caller
    /// reconnects exactly as it would on an error.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Boundary the fan-out calls through to establish a fresh connection.
#[async_trait]
pub trait RealtimeSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>>;
}

// =============================================================================
// WsRealtimeSource — tokio-tungstenite concrete adapter
// =============================================================================

pub struct WsRealtimeSource {
    url: String,
}

impl WsRealtimeSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RealtimeSource for WsRealtimeSource {
    async fn connect(&self) -> Result<Box<dyn RealtimeConnection>> {
        let (stream, _response) = tokio_tungstenite::connect_async(&self.url).await?;
        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl RealtimeConnection for WsConnection {
    async fn send_subscribe(&mut self, symbols: &[Symbol]) -> Result<()> {
        let frame = OutgoingFrame::Subscribe {
            subscribe: symbols.iter().map(|s| s.as_str().to_string()).collect(),
        };
        let text = serde_json::to_string(&frame)?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn send_unsubscribe(&mut self, symbols: &[Symbol]) -> Result<()> {
        let frame = OutgoingFrame::Unsubscribe {
            unsubscribe: symbols.iter().map(|s| s.as_str().to_string()).collect(),
        };
        let text = serde_json::to_string(&frame)?;
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let frame: IncomingFrame = serde_json::from_str(&text)?;
                    let bytes = base64::engine::general_purpose::STANDARD.decode(frame.message)?;
                    return Ok(Some(bytes));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/binary control frames, ignored
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

// =============================================================================
// Subscription registry
// =============================================================================

#[derive(Clone)]
struct SinkHandle {
    id: u64,
    sender: mpsc::WeakUnboundedSender<Tick>,
}

type Registry = Arc<Mutex<HashMap<Symbol, Vec<SinkHandle>>>>;

enum OutboundCommand {
    Subscribe(Vec<Symbol>),
    Unsubscribe(Vec<Symbol>),
}

/// Connection-managed publish/subscribe of ticks by symbol, per spec §4.5.
pub struct RealtimeFanout {
    registry: Registry,
    outbound_tx: mpsc::UnboundedSender<OutboundCommand>,
    closed: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeFanout {
    pub fn new(
        source: Arc<dyn RealtimeSource>,
        decoder: Arc<dyn TickDecoder>,
        reconnect_delay: Duration,
        max_reconnect_attempts: u32,
    ) -> Arc<Self> {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let task_registry = registry.clone();
        let task_closed = closed.clone();
        let task = tokio::spawn(run_connection_loop(
            source,
            decoder,
            task_registry,
            outbound_rx,
            task_closed,
            reconnect_delay,
            max_reconnect_attempts,
        ));

        Arc::new(Self {
            registry,
            outbound_tx,
            closed,
            task: Mutex::new(Some(task)),
        })
    }

    /// Register `sink` for each of `symbols`. Idempotent per `(symbol,
    /// sink_id)`: re-subscribing the same sink to a symbol it already holds
    /// neither duplicates the registration nor re-sends the upstream frame.
    /// `sink_id` identifies the logical subscriber (a strategy typically uses
    /// one id for its whole tick inlet).
    pub fn subscribe(&self, symbols: &[Symbol], sink_id: u64, sink: &mpsc::UnboundedSender<Tick>) {
        if self.closed.load(Ordering::SeqCst) {
            warn!("subscribe called on a closed fan-out, ignoring");
            return;
        }

        let mut newly_subscribed = Vec::new();
        {
            let mut reg = self.registry.lock();
            for symbol in symbols {
                let entry = reg.entry(symbol.clone()).or_default();
                let is_new_symbol = entry.is_empty();
                if !entry.iter().any(|h| h.id == sink_id) {
                    entry.push(SinkHandle {
                        id: sink_id,
                        sender: sink.downgrade(),
                    });
                }
                if is_new_symbol {
                    newly_subscribed.push(symbol.clone());
                }
            }
        }

        if !newly_subscribed.is_empty() {
            let _ = self.outbound_tx.send(OutboundCommand::Subscribe(newly_subscribed));
        }
    }

    /// Remove `sink_id`'s registration from each of `symbols`. An upstream
    /// unsubscribe frame is emitted only for symbols whose sink set becomes
    /// empty as a result.
    pub fn unsubscribe(&self, symbols: &[Symbol], sink_id: u64) {
        let mut fully_unsubscribed = Vec::new();
        {
            let mut reg = self.registry.lock();
            for symbol in symbols {
                if let Some(list) = reg.get_mut(symbol) {
                    list.retain(|h| h.id != sink_id);
                    if list.is_empty() {
                        reg.remove(symbol);
                        fully_unsubscribed.push(symbol.clone());
                    }
                }
            }
        }

        if !fully_unsubscribed.is_empty() {
            let _ = self.outbound_tx.send(OutboundCommand::Unsubscribe(fully_unsubscribed));
        }
    }

    /// Disable reconnect, cancel the reader task, and drop every
    /// subscription. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.registry.lock().clear();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, symbol: &Symbol) -> usize {
        self.registry.lock().get(symbol).map(Vec::len).unwrap_or(0)
    }

    #[cfg(test)]
    fn known_symbols(&self) -> usize {
        self.registry.lock().len()
    }
}

fn dispatch(registry: &Registry, tick: Tick) {
    let snapshot: Vec<SinkHandle> = {
        let reg = registry.lock();
        reg.get(&tick.symbol).cloned().unwrap_or_default()
    };

    let mut dead_ids = Vec::new();
    for handle in &snapshot {
        match handle.sender.upgrade() {
            Some(sender) => {
                if sender.send(tick.clone()).is_err() {
                    dead_ids.push(handle.id);
                }
            }
            None => dead_ids.push(handle.id),
        }
    }

    if !dead_ids.is_empty() {
        let mut reg = registry.lock();
        if let Some(list) = reg.get_mut(&tick.symbol) {
            list.retain(|h| !dead_ids.contains(&h.id));
        }
    }
}

async fn run_connection_loop(
    source: Arc<dyn RealtimeSource>,
    decoder: Arc<dyn TickDecoder>,
    registry: Registry,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundCommand>,
    closed: Arc<AtomicBool>,
    reconnect_delay: Duration,
    max_reconnect_attempts: u32,
) {
    let mut attempt = 0u32;

    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }

        let mut conn = match source.connect().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, attempt, "fan-out connect failed");
                if !backoff_or_exhaust(&closed, &mut attempt, max_reconnect_attempts, reconnect_delay).await {
                    return;
                }
                continue;
            }
        };
        attempt = 0;
        info!("fan-out connected");

        let current_symbols: Vec<Symbol> = { registry.lock().keys().cloned().collect() };
        if !current_symbols.is_empty() {
            if let Err(e) = conn.send_subscribe(&current_symbols).await {
                warn!(error = %e, "failed to resend subscriptions after connect");
                continue;
            }
            debug!(count = current_symbols.len(), "resent subscriptions after connect");
        }

        loop {
            tokio::select! {
                cmd = outbound_rx.recv() => {
                    match cmd {
                        Some(OutboundCommand::Subscribe(symbols)) => {
                            if let Err(e) = conn.send_subscribe(&symbols).await {
                                warn!(error = %e, "failed to send subscribe frame");
                                break;
                            }
                        }
                        Some(OutboundCommand::Unsubscribe(symbols)) => {
                            if let Err(e) = conn.send_unsubscribe(&symbols).await {
                                warn!(error = %e, "failed to send unsubscribe frame");
                                break;
                            }
                        }
                        None => {
                            // The RealtimeFanout handle was dropped; nobody will
                            // ever call subscribe/unsubscribe again.
                            closed.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                }
                msg = conn.recv() => {
                    match msg {
                        Ok(Some(bytes)) => match decoder.decode(&bytes) {
                            Ok(tick) => dispatch(&registry, tick),
                            Err(e) => warn!(error = %e, "tick decode failed, dropping frame"),
                        },
                        Ok(None) => {
                            warn!("fan-out stream ended, reconnecting");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "fan-out read error, reconnecting");
                            break;
                        }
                    }
                }
            }

            if closed.load(Ordering::SeqCst) {
                return;
            }
        }

        if closed.load(Ordering::SeqCst) {
            return;
        }
        if !backoff_or_exhaust(&closed, &mut attempt, max_reconnect_attempts, reconnect_delay).await {
            return;
        }
    }
}

/// Sleep `base * 2^attempt`, incrementing `attempt`. Returns `false` (and
/// marks the fan-out terminally closed, surfacing [`FanoutError::ReconnectExhausted`]
/// via a log) once `max_attempts` is exceeded.
async fn backoff_or_exhaust(closed: &AtomicBool, attempt: &mut u32, max_attempts: u32, base: Duration) -> bool {
    *attempt += 1;
    if *attempt > max_attempts {
        let err = FanoutError::ReconnectExhausted { attempts: *attempt - 1 };
        error!(error = %err, "fan-out exhausted reconnect attempts, giving up");
        closed.store(true, Ordering::SeqCst);
        return false;
    }
    let delay = base.saturating_mul(1u32 << (*attempt - 1).min(16));
    debug!(attempt, delay_ms = delay.as_millis() as u64, "backing off before reconnect");
    tokio::time::sleep(delay).await;
    true
}
