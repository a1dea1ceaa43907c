//! Live gateway for Binance USD-M futures
//!
//! Thin translation layer over the signed REST API. Request signing is
//! HMAC-SHA256 over the query string, hex-encoded, with the API key in the
//! `X-MBX-APIKEY` header. Listen-key endpoints authenticate with the header
//! alone.

use crate::config::FuturesApi;
use crate::types::{AccountSnapshot, OrderSide, OrderSnapshot};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use super::gateway::{BookTicker, Gateway, PlacedOrder};
use super::gateway_error::GatewayError;

type HmacSha256 = Hmac<Sha256>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_WINDOW_MS: u64 = 5000;

// GTX (post-only) close orders are rejected with -5022 when they would
// cross; the fallback queues at the touch instead.
const CODE_POST_ONLY_WOULD_TRADE: i64 = -5022;

/// Signed REST client for the USD-M futures API
pub struct BinanceFutures {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

/// Order placement / query response (string-typed numerics as sent on the wire)
#[derive(Debug, Deserialize)]
struct RawOrder {
    #[serde(rename = "orderId")]
    order_id: i64,
    #[serde(default, rename = "clientOrderId")]
    client_order_id: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    price: String,
    #[serde(default, rename = "origQty")]
    orig_qty: String,
    #[serde(default, rename = "executedQty")]
    executed_qty: String,
    #[serde(default, rename = "avgPrice")]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct RawBookTicker {
    #[serde(rename = "bidPrice")]
    bid_price: String,
    #[serde(rename = "askPrice")]
    ask_price: String,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    #[serde(rename = "totalWalletBalance")]
    total_wallet_balance: String,
    #[serde(rename = "totalUnrealizedProfit")]
    total_unrealized_profit: String,
    #[serde(rename = "availableBalance")]
    available_balance: String,
}

#[derive(Debug, Deserialize)]
struct RawListenKey {
    #[serde(rename = "listenKey")]
    listen_key: String,
}

impl BinanceFutures {
    pub fn new(api_key: String, api_secret: String) -> Result<Self, GatewayError> {
        Self::with_base_url(api_key, api_secret, FuturesApi::REST_BASE.to_string())
    }

    pub fn with_base_url(
        api_key: String,
        api_secret: String,
        base_url: String,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Fatal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key,
            api_secret,
        })
    }

    fn timestamp_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn sign(&self, query: &str) -> Result<String, GatewayError> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| GatewayError::Fatal(format!("invalid API secret: {}", e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Send a signed request; `params` are appended with timestamp,
    /// recvWindow, and the signature.
    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<String, GatewayError> {
        params.push(("timestamp", Self::timestamp_ms().to_string()));
        params.push(("recvWindow", RECV_WINDOW_MS.to_string()));

        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::from_network_error(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::from_network_error(&e))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(GatewayError::from_response(status.as_u16(), &body))
        }
    }

    /// Listen-key endpoints use the API key header without a signature
    async fn keyed_request(&self, method: Method, path: &str) -> Result<String, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| GatewayError::from_network_error(&e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::from_network_error(&e))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(GatewayError::from_response(status.as_u16(), &body))
        }
    }

    async fn place_order(
        &self,
        params: Vec<(&str, String)>,
    ) -> Result<PlacedOrder, GatewayError> {
        let body = self
            .signed_request(Method::POST, "/fapi/v1/order", params)
            .await?;
        let raw: RawOrder = parse_body(&body)?;
        Ok(PlacedOrder {
            order_id: raw.order_id.to_string(),
            accepted_at: Utc::now(),
        })
    }
}

fn parse_body<'a, T: Deserialize<'a>>(body: &'a str) -> Result<T, GatewayError> {
    serde_json::from_str(body)
        .map_err(|e| GatewayError::Transient(format!("malformed API response: {}", e)))
}

fn parse_decimal(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

fn snapshot_from_raw(raw: RawOrder) -> OrderSnapshot {
    let side = OrderSide::from_str(&raw.side).unwrap_or(OrderSide::Buy);
    OrderSnapshot {
        order_id: raw.order_id.to_string(),
        client_tag: raw.client_order_id,
        side,
        price: parse_decimal(&raw.price),
        quantity: parse_decimal(&raw.orig_qty),
        executed_quantity: parse_decimal(&raw.executed_qty),
        avg_price: parse_decimal(&raw.avg_price),
    }
}

#[async_trait]
impl Gateway for BinanceFutures {
    async fn place_opening_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        client_tag: &str,
    ) -> Result<PlacedOrder, GatewayError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("positionSide", "BOTH".to_string()),
            ("type", "LIMIT".to_string()),
            ("quantity", quantity.to_string()),
            ("price", price.to_string()),
            ("timeInForce", "GTX".to_string()), // post-only
            ("newClientOrderId", client_tag.to_string()),
        ];

        let placed = self.place_order(params).await?;
        info!(
            "[Gateway] Opening order placed: id={} {} {} @ {}",
            placed.order_id, side, quantity, price
        );
        Ok(placed)
    }

    async fn place_closing_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: Decimal,
        quantity: Decimal,
        client_tag: &str,
    ) -> Result<PlacedOrder, GatewayError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("positionSide", "BOTH".to_string()),
            ("type", "LIMIT".to_string()),
            ("quantity", quantity.to_string()),
            ("price", price.to_string()),
            ("reduceOnly", "true".to_string()),
            ("timeInForce", "GTX".to_string()),
            ("newClientOrderId", client_tag.to_string()),
        ];

        match self.place_order(params).await {
            Ok(placed) => {
                info!(
                    "[Gateway] Closing order placed: id={} {} {} @ {}",
                    placed.order_id, side, quantity, price
                );
                Ok(placed)
            }
            Err(GatewayError::Rejected { code, .. }) if code == CODE_POST_ONLY_WOULD_TRADE => {
                // Target price already crossed; queue at the touch instead
                warn!(
                    "[Gateway] Post-only close at {} would trade, falling back to queue price",
                    price
                );
                let fallback = vec![
                    ("symbol", symbol.to_string()),
                    ("side", side.to_string()),
                    ("positionSide", "BOTH".to_string()),
                    ("type", "LIMIT".to_string()),
                    ("quantity", quantity.to_string()),
                    ("priceMatch", "QUEUE".to_string()),
                    ("reduceOnly", "true".to_string()),
                    ("timeInForce", "GTC".to_string()),
                    ("newClientOrderId", client_tag.to_string()),
                ];
                self.place_order(fallback).await
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        self.signed_request(Method::DELETE, "/fapi/v1/order", params)
            .await?;
        info!("[Gateway] Order {} cancelled", order_id);
        Ok(())
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OrderSnapshot>, GatewayError> {
        let params = vec![("symbol", symbol.to_string())];
        let body = self
            .signed_request(Method::GET, "/fapi/v1/openOrders", params)
            .await?;
        let raw: Vec<RawOrder> = parse_body(&body)?;
        Ok(raw.into_iter().map(snapshot_from_raw).collect())
    }

    async fn fetch_order(
        &self,
        symbol: &str,
        order_id: &str,
    ) -> Result<Option<OrderSnapshot>, GatewayError> {
        let params = vec![
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        match self
            .signed_request(Method::GET, "/fapi/v1/order", params)
            .await
        {
            Ok(body) => {
                let raw: RawOrder = parse_body(&body)?;
                Ok(Some(snapshot_from_raw(raw)))
            }
            // -2013 "Order does not exist": already purged server-side
            Err(GatewayError::Rejected { code: -2013, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn account_snapshot(&self) -> Result<AccountSnapshot, GatewayError> {
        let body = self
            .signed_request(Method::GET, "/fapi/v2/account", vec![])
            .await?;
        let raw: RawAccount = parse_body(&body)?;
        Ok(AccountSnapshot {
            wallet_balance: parse_decimal(&raw.total_wallet_balance),
            unrealized_pnl: parse_decimal(&raw.total_unrealized_profit),
            available_balance: parse_decimal(&raw.available_balance),
        })
    }

    async fn book_ticker(&self, symbol: &str) -> Result<BookTicker, GatewayError> {
        let url = format!(
            "{}/fapi/v1/ticker/bookTicker?symbol={}",
            self.base_url,
            urlencoding::encode(symbol)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GatewayError::from_network_error(&e))?;

        let status = response.status();
        if status == StatusCode::OK {
            let body = response
                .text()
                .await
                .map_err(|e| GatewayError::from_network_error(&e))?;
            let raw: RawBookTicker = parse_body(&body)?;
            Ok(BookTicker {
                bid: parse_decimal(&raw.bid_price),
                ask: parse_decimal(&raw.ask_price),
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(GatewayError::from_response(status.as_u16(), &body))
        }
    }

    async fn create_listen_key(&self) -> Result<String, GatewayError> {
        let body = self.keyed_request(Method::POST, "/fapi/v1/listenKey").await?;
        let raw: RawListenKey = parse_body(&body)?;
        Ok(raw.listen_key)
    }

    async fn renew_listen_key(&self, _listen_key: &str) -> Result<(), GatewayError> {
        // Futures renewal extends whichever key belongs to the API key; the
        // body is empty and no key parameter is accepted.
        self.keyed_request(Method::PUT, "/fapi/v1/listenKey").await?;
        Ok(())
    }
}
