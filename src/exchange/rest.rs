//! Binance-compatible REST client.
//!
//! Public endpoints (markets, tickers, depth) need no credentials. Balance
//! and order endpoints are signed with [`Credentials`] and fail with
//! [`ExchangeError::MissingCredentials`] when none are configured.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Method;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::client::Exchange;
use super::types::{
    FreeBalance, Market, OrderBook, OrderResponse, OrderSide, OrderStatus, PriceLevel, Ticker,
};
use crate::config::Config;
use crate::error::ExchangeError;
use crate::metrics;
use crate::signing::Credentials;

/// Taker fee applied when the exchange does not report one.
pub const DEFAULT_TAKER_FEE: Decimal = Decimal::from_parts(1, 0, 0, false, 3);

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    base_asset: String,
    quote_asset: String,
    #[serde(default)]
    filters: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTicker {
    symbol: String,
    bid_price: String,
    ask_price: String,
}

#[derive(Debug, Deserialize)]
struct Depth {
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct Account {
    balances: Vec<AssetBalance>,
}

#[derive(Debug, Deserialize)]
struct AssetBalance {
    asset: String,
    free: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderAck {
    order_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderState {
    order_id: u64,
    status: String,
    side: String,
    orig_qty: String,
    executed_qty: String,
    cummulative_quote_qty: String,
}

fn side_param(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

/// Parse a decimal string field.
fn parse_decimal(field: &str, value: &str) -> Result<Decimal, ExchangeError> {
    Decimal::from_str(value)
        .map_err(|e| ExchangeError::Parse(format!("invalid {field} {value:?}: {e}")))
}

/// Decimal places implied by a step such as "0.00100000".
fn step_precision(step: &str) -> Option<u32> {
    let step = Decimal::from_str(step).ok()?;
    if step.is_zero() {
        return None;
    }
    Some(step.normalize().scale())
}

fn filter_field<'a>(filters: &'a [serde_json::Value], kind: &str, field: &str) -> Option<&'a str> {
    filters
        .iter()
        .find(|f| f.get("filterType").and_then(|t| t.as_str()) == Some(kind))
        .and_then(|f| f.get(field))
        .and_then(|v| v.as_str())
}

fn markets_from_info(info: ExchangeInfo, taker_fee: Decimal) -> Vec<Market> {
    info.symbols
        .into_iter()
        .filter(|s| s.status == "TRADING")
        .map(|s| {
            let lot_step = filter_field(&s.filters, "LOT_SIZE", "stepSize");
            let min_qty = filter_field(&s.filters, "LOT_SIZE", "minQty");
            let tick = filter_field(&s.filters, "PRICE_FILTER", "tickSize");

            Market {
                symbol: format!("{}/{}", s.base_asset, s.quote_asset),
                base: s.base_asset,
                quote: s.quote_asset,
                id: s.symbol,
                taker_fee,
                min_amount: min_qty
                    .and_then(|q| Decimal::from_str(q).ok())
                    .unwrap_or(Decimal::ZERO),
                amount_precision: lot_step.and_then(step_precision).unwrap_or(8),
                price_precision: tick.and_then(step_precision).unwrap_or(8),
            }
        })
        .collect()
}

fn levels(raw: Vec<[String; 2]>) -> Result<Vec<PriceLevel>, ExchangeError> {
    raw.into_iter()
        .map(|[price, size]| {
            Ok(PriceLevel::new(
                parse_decimal("price", &price)?,
                parse_decimal("size", &size)?,
            ))
        })
        .collect()
}

fn balance_from_account(account: Account) -> Result<FreeBalance, ExchangeError> {
    account
        .balances
        .into_iter()
        .map(|b| Ok((b.asset, parse_decimal("free", &b.free)?)))
        .collect()
}

fn order_from_state(state: OrderState, taker_fee: Decimal) -> Result<OrderResponse, ExchangeError> {
    let status = OrderStatus::from_str(&state.status)
        .map_err(|_| ExchangeError::Parse(format!("unknown order status {:?}", state.status)))?;
    let side = OrderSide::from_str(&state.side)
        .map_err(|_| ExchangeError::Parse(format!("unknown order side {:?}", state.side)))?;
    let cost = parse_decimal("cummulativeQuoteQty", &state.cummulative_quote_qty)?;

    // Sell proceeds are paid in quote and taxed there; buy fees are taken
    // from the received base amount.
    let fee = match side {
        OrderSide::Sell => Some(cost * taker_fee),
        OrderSide::Buy => None,
    };

    Ok(OrderResponse {
        id: state.order_id.to_string(),
        status,
        amount: Some(parse_decimal("origQty", &state.orig_qty)?),
        filled: Some(parse_decimal("executedQty", &state.executed_qty)?),
        cost: Some(cost),
        fee,
    })
}

/// REST client for a Binance-compatible spot API.
#[derive(Debug)]
pub struct RestExchange {
    http: reqwest::Client,
    name: String,
    base_url: String,
    credentials: Option<Credentials>,
    /// Unified symbol -> market, filled by `load_markets`.
    markets: DashMap<String, Market>,
    /// Exchange id -> unified symbol.
    symbols: DashMap<String, String>,
}

impl RestExchange {
    /// Create a client from config.
    pub fn new(config: &Config) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .connect_timeout(Duration::from_millis(500))
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        let credentials = match (&config.exchange_api_key, &config.exchange_api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => {
                Some(Credentials::new(key.clone(), secret.clone()))
            }
            _ => None,
        };

        Ok(Self {
            http,
            name: config.exchange.clone(),
            base_url: config.exchange_rest_url.trim_end_matches('/').to_string(),
            credentials,
            markets: DashMap::new(),
            symbols: DashMap::new(),
        })
    }

    fn market_id(&self, symbol: &str) -> Result<String, ExchangeError> {
        self.markets
            .get(symbol)
            .map(|m| m.id.clone())
            .ok_or_else(|| ExchangeError::UnknownMarket(symbol.to_string()))
    }

    fn taker_fee(&self, symbol: &str) -> Decimal {
        self.markets
            .get(symbol)
            .map(|m| m.taker_fee)
            .unwrap_or(DEFAULT_TAKER_FEE)
    }

    async fn read<T: DeserializeOwned>(
        endpoint: &str,
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExchangeError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ExchangeError::Parse(format!("{endpoint}: {e}")))
    }

    async fn public<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self.http.get(&url).query(query).send().await?;
        Self::read(endpoint, response).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> Result<T, ExchangeError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(ExchangeError::MissingCredentials)?;
        let query = credentials.signed_query(params)?;
        let url = format!("{}{}?{}", self.base_url, endpoint, query);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await?;
        Self::read(endpoint, response).await
    }

    async fn place(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        let params = [
            ("symbol", self.market_id(symbol)?),
            ("side", side_param(side).to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", amount.normalize().to_string()),
            ("price", price.normalize().to_string()),
        ];

        let ack: OrderAck = self.signed(Method::POST, "/api/v3/order", &params).await?;
        debug!(symbol = %symbol, side = side_param(side), amount = %amount, price = %price, order_id = ack.order_id, "Order placed");
        Ok(ack.order_id.to_string())
    }
}

#[async_trait]
impl Exchange for RestExchange {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self))]
    async fn load_markets(&self) -> Result<Vec<Market>, ExchangeError> {
        let info: ExchangeInfo = self.public("/api/v3/exchangeInfo", &[]).await?;
        let markets = markets_from_info(info, DEFAULT_TAKER_FEE);

        for market in &markets {
            self.symbols.insert(market.id.clone(), market.symbol.clone());
            self.markets.insert(market.symbol.clone(), market.clone());
        }
        debug!(markets = markets.len(), "Markets loaded");
        Ok(markets)
    }

    async fn fetch_tickers(&self) -> Result<HashMap<String, Ticker>, ExchangeError> {
        let tickers: Vec<BookTicker> = self.public("/api/v3/ticker/bookTicker", &[]).await?;

        let mut out = HashMap::with_capacity(tickers.len());
        for ticker in tickers {
            let Some(symbol) = self.symbols.get(&ticker.symbol).map(|s| s.clone()) else {
                continue;
            };
            out.insert(
                symbol,
                Ticker {
                    bid: parse_decimal("bidPrice", &ticker.bid_price)?,
                    ask: parse_decimal("askPrice", &ticker.ask_price)?,
                },
            );
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, ExchangeError> {
        let start = Instant::now();
        let query = [
            ("symbol", self.market_id(symbol)?),
            ("limit", depth.max(1).to_string()),
        ];
        let raw: Depth = self.public("/api/v3/depth", &query).await?;
        metrics::record_orderbook_fetch_latency(start, symbol);

        Ok(OrderBook::new(symbol, levels(raw.bids)?, levels(raw.asks)?))
    }

    #[instrument(skip(self))]
    async fn fetch_balance(&self) -> Result<FreeBalance, ExchangeError> {
        let account: Account = self.signed(Method::GET, "/api/v3/account", &[]).await?;
        balance_from_account(account)
    }

    async fn create_limit_sell_order(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        self.place(symbol, OrderSide::Sell, amount, price).await
    }

    async fn create_limit_buy_order(
        &self,
        symbol: &str,
        amount: Decimal,
        price: Decimal,
    ) -> Result<String, ExchangeError> {
        self.place(symbol, OrderSide::Buy, amount, price).await
    }

    async fn fetch_order(&self, id: &str, symbol: &str) -> Result<OrderResponse, ExchangeError> {
        let params = [("symbol", self.market_id(symbol)?), ("orderId", id.to_string())];
        let state: OrderState = self.signed(Method::GET, "/api/v3/order", &params).await?;
        order_from_state(state, self.taker_fee(symbol))
    }

    async fn cancel_order(&self, id: &str, symbol: &str) -> Result<(), ExchangeError> {
        let params = [("symbol", self.market_id(symbol)?), ("orderId", id.to_string())];
        match self
            .signed::<serde_json::Value>(Method::DELETE, "/api/v3/order", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(ExchangeError::Status { status: 400, body, .. }) if body.contains("-2011") => {
                warn!(order_id = %id, symbol = %symbol, "Order already gone on cancel");
                Err(ExchangeError::UnknownOrder(id.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}
