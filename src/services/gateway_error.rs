//! Gateway error differentiation
//!
//! Classifies futures REST API failures into the three categories the bot
//! acts on: `Transient` (retry with backoff), `Rejected` (drop the order,
//! release the slot), `Fatal` (halt the bot).

use serde::Deserialize;
use thiserror::Error;

/// Structured gateway error
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Network trouble, rate limiting, or a server-side hiccup; safe to retry
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// Business-rule refusal from the exchange; retrying cannot help
    #[error("order rejected (code {code}): {reason}")]
    Rejected { code: i64, reason: String },

    /// Credential or permission failure; the bot must stop
    #[error("fatal gateway error: {0}")]
    Fatal(String),
}

/// Error response body format of the futures API
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
}

// Exchange-side error codes the classifier special-cases
const CODE_TOO_MANY_REQUESTS: i64 = -1003;
const CODE_TIMESTAMP_OUT_OF_WINDOW: i64 = -1021;
const CODE_INVALID_API_KEY: i64 = -2014;
const CODE_KEY_PERMISSION: i64 = -2015;

impl GatewayError {
    /// Parse an API response into a structured error
    pub fn from_response(status: u16, body: &str) -> Self {
        let (code, msg) = match serde_json::from_str::<ApiErrorResponse>(body) {
            Ok(parsed) => (parsed.code.unwrap_or(0), parsed.msg.unwrap_or_default()),
            Err(_) => (0, body.to_string()),
        };

        // Credential problems are fatal regardless of the code
        if status == 401 || status == 403 || code == CODE_INVALID_API_KEY || code == CODE_KEY_PERMISSION {
            return GatewayError::Fatal(format!("authentication failed ({}): {}", status, msg));
        }

        // Rate limits: 429 is the standard signal, 418 means the IP was
        // auto-banned for ignoring 429s; both clear with backoff
        if status == 429 || status == 418 || code == CODE_TOO_MANY_REQUESTS {
            return GatewayError::Transient(format!("rate limited: {}", msg));
        }

        // Clock skew beyond recvWindow; resolves on re-sign with a fresh timestamp
        if code == CODE_TIMESTAMP_OUT_OF_WINDOW {
            return GatewayError::Transient(format!("timestamp outside recvWindow: {}", msg));
        }

        if status == 408 || status >= 500 {
            return GatewayError::Transient(format!("server error {}: {}", status, msg));
        }

        // Everything else in the 4xx range is a business refusal: insufficient
        // margin (-2019), unknown order (-2011), post-only would trade (-5022), ...
        GatewayError::Rejected { code, reason: msg }
    }

    /// Classify a network-level failure
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Transient("request timed out".to_string())
        } else if err.is_connect() {
            GatewayError::Transient("connection failed".to_string())
        } else {
            GatewayError::Transient(err.to_string())
        }
    }

    /// Whether this error is retryable with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    /// Whether this error must halt the bot
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Fatal(_))
    }
}
