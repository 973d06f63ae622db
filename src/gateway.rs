// =============================================================================
// OrderGateway — broker boundary: place/cancel/inspect orders, read buying power
// =============================================================================
//
// Treated per spec §6 as `PlaceOrder`, `CancelOrder`, `GetOrder`,
// `GetPortfolio`, `GetBuyingPower`. `BinanceBracketGateway` is grounded
// verbatim on the teacher's `binance/client.rs` signing convention
// (HMAC-SHA256 over the query string, `X-MBX-APIKEY` header, a fixed
// recv-window) and approximates a three-leg bracket with a parent LIMIT buy
// plus two OCO-shaped exit orders, since plain spot Binance has no native
// bracket endpoint. `DemoOrderGateway` mirrors the teacher's `execution.rs`
// simulated-fill path so the engine runs end-to-end without funded
// credentials.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use crate::error::GatewayError;
use crate::types::{OrderAck, OrderIntent, OrderState, Portfolio, PortfolioPosition, Symbol};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5000;

#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, intent: OrderIntent) -> Result<OrderAck, GatewayError>;
    async fn cancel_order(&self, order_id: &str) -> Result<OrderState, GatewayError>;
    async fn get_order(&self, order_id: &str) -> Result<OrderState, GatewayError>;
    async fn get_portfolio(&self) -> Result<Portfolio, GatewayError>;
    async fn get_buying_power(&self) -> Result<f64, GatewayError>;
}

// =============================================================================
// BinanceBracketGateway
// =============================================================================

pub struct BinanceBracketGateway {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceBracketGateway {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    async fn post_order(&self, params: &str) -> Result<serde_json::Value, GatewayError> {
        let qs = self.signed_query(params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /api/v3/order request failed")
            .map_err(GatewayError::Transport)?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")
            .map_err(GatewayError::Transport)?;

        if !status.is_success() {
            return Err(GatewayError::Rejected {
                symbol: params.to_string(),
                reason: body.to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl OrderGateway for BinanceBracketGateway {
    #[instrument(skip(self, intent), name = "binance_gateway::place_order")]
    async fn place_order(&self, intent: OrderIntent) -> Result<OrderAck, GatewayError> {
        if !intent.is_valid() {
            return Err(GatewayError::Rejected {
                symbol: intent.symbol.to_string(),
                reason: "order intent failed entry/stop/take or quantity invariant".to_string(),
            });
        }

        // Parent LIMIT buy.
        let parent_params = format!(
            "symbol={}&side=BUY&type=LIMIT&timeInForce=GTC&quantity={}&price={}",
            intent.symbol, intent.quantity, intent.entry
        );
        let parent = self.post_order(&parent_params).await?;
        let order_id = parent["orderId"].to_string();

        // Exit leg: OCO stop-loss / take-profit (spot Binance lacks a native
        // three-leg bracket; this is the closest two-order approximation).
        let oco_params = format!(
            "symbol={}&side=SELL&quantity={}&price={}&stopPrice={}&stopLimitPrice={}&stopLimitTimeInForce=GTC",
            intent.symbol, intent.quantity, intent.take_profit, intent.stop_loss, intent.stop_loss
        );
        if let Err(e) = self.post_order(&oco_params).await {
            warn!(symbol = %intent.symbol, error = %e, "OCO exit leg failed after parent fill — position is unprotected");
        }

        info!(symbol = %intent.symbol, order_id = %order_id, "bracket order placed");
        Ok(OrderAck {
            order_id,
            symbol: intent.symbol,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderState, GatewayError> {
        let params = format!("orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /api/v3/order request failed")
            .map_err(GatewayError::Transport)?;

        if resp.status().is_success() {
            Ok(OrderState::Cancelled)
        } else {
            Err(GatewayError::Rejected {
                symbol: order_id.to_string(),
                reason: format!("cancel returned {}", resp.status()),
            })
        }
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderState, GatewayError> {
        let params = format!("orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/order request failed")
            .map_err(GatewayError::Transport)?;

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order status response")
            .map_err(GatewayError::Transport)?;

        let state = match body["status"].as_str().unwrap_or("") {
            "FILLED" => OrderState::Filled,
            "CANCELED" => OrderState::Cancelled,
            "REJECTED" | "EXPIRED" => OrderState::Rejected,
            _ => OrderState::Open,
        };
        Ok(state)
    }

    async fn get_portfolio(&self) -> Result<Portfolio, GatewayError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/account request failed")
            .map_err(GatewayError::Transport)?;

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse account response")
            .map_err(GatewayError::Transport)?;

        let mut positions = Vec::new();
        if let Some(balances) = body["balances"].as_array() {
            for b in balances {
                let asset = b["asset"].as_str().unwrap_or("").to_string();
                let free: f64 = b["free"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                if free > 0.0 {
                    positions.push(PortfolioPosition {
                        symbol: Symbol::new(&asset),
                        quantity: free,
                        average_price: 0.0,
                    });
                }
            }
        }

        Ok(Portfolio {
            cash: 0.0,
            buying_power: self.get_buying_power().await?,
            positions,
        })
    }

    async fn get_buying_power(&self) -> Result<f64, GatewayError> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/account request failed")
            .map_err(GatewayError::Transport)?;

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse account response")
            .map_err(GatewayError::Transport)?;

        let balances = body["balances"].as_array().cloned().unwrap_or_default();
        for b in balances {
            if b["asset"].as_str() == Some("USDT") {
                let free: f64 = b["free"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                debug!(api_key_suffix = %self.api_key.chars().rev().take(4).collect::<String>(), free, "buying power read");
                return Ok(free);
            }
        }
        Ok(0.0)
    }
}

// =============================================================================
// DemoOrderGateway — in-memory simulated execution
// =============================================================================

struct DemoState {
    next_id: AtomicU64,
    buying_power: f64,
}

/// Local simulation used when no live broker credentials are configured —
/// mirrors the teacher's demo/simulated execution path so the engine is
/// exercisable without a funded account.
pub struct DemoOrderGateway {
    state: RwLock<DemoState>,
}

impl DemoOrderGateway {
    pub fn new(starting_buying_power: f64) -> Self {
        Self {
            state: RwLock::new(DemoState {
                next_id: AtomicU64::new(1),
                buying_power: starting_buying_power,
            }),
        }
    }
}

#[async_trait]
impl OrderGateway for DemoOrderGateway {
    async fn place_order(&self, intent: OrderIntent) -> Result<OrderAck, GatewayError> {
        if !intent.is_valid() {
            return Err(GatewayError::Rejected {
                symbol: intent.symbol.to_string(),
                reason: "order intent failed entry/stop/take or quantity invariant".to_string(),
            });
        }

        let cost = intent.entry * intent.quantity as f64;
        let state = self.state.read();
        if cost > state.buying_power {
            return Err(GatewayError::Rejected {
                symbol: intent.symbol.to_string(),
                reason: "insufficient simulated buying power".to_string(),
            });
        }
        let id = state.next_id.fetch_add(1, Ordering::Relaxed);
        drop(state);

        info!(symbol = %intent.symbol, entry = intent.entry, qty = intent.quantity, "demo bracket order simulated");
        Ok(OrderAck {
            order_id: format!("demo-{id}"),
            symbol: intent.symbol,
        })
    }

    async fn cancel_order(&self, _order_id: &str) -> Result<OrderState, GatewayError> {
        Ok(OrderState::Cancelled)
    }

    async fn get_order(&self, _order_id: &str) -> Result<OrderState, GatewayError> {
        Ok(OrderState::Filled)
    }

    async fn get_portfolio(&self) -> Result<Portfolio, GatewayError> {
        let state = self.state.read();
        Ok(Portfolio {
            cash: state.buying_power,
            buying_power: state.buying_power,
            positions: Vec::new(),
        })
    }

    async fn get_buying_power(&self) -> Result<f64, GatewayError> {
        Ok(self.state.read().buying_power)
    }
}
