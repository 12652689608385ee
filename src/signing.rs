//! Request signing for authenticated exchange endpoints.
//!
//! Signed calls carry a `timestamp` and `recvWindow` parameter and a
//! hex-encoded HMAC-SHA256 of the whole query string, keyed by the API
//! secret.

use std::fmt;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::ExchangeError;

type HmacSha256 = Hmac<Sha256>;

/// Milliseconds a signed request stays valid on the server.
pub const RECV_WINDOW_MS: u64 = 5000;

/// API credentials.
#[derive(Clone)]
pub struct Credentials {
    /// Public key, sent as a header.
    pub api_key: String,
    secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
        }
    }

    /// Sign `params` plus timestamp and receive window. Returns the full
    /// query string including the `signature` parameter.
    pub fn signed_query(&self, params: &[(&str, String)]) -> Result<String, ExchangeError> {
        self.signed_query_at(params, Utc::now().timestamp_millis())
    }

    fn signed_query_at(&self, params: &[(&str, String)], timestamp_ms: i64) -> Result<String, ExchangeError> {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in params {
            query.append_pair(key, value);
        }
        query.append_pair("recvWindow", &RECV_WINDOW_MS.to_string());
        query.append_pair("timestamp", &timestamp_ms.to_string());
        let query = query.finish();

        let signature = sign(&self.secret, &query)?;
        Ok(format!("{query}&signature={signature}"))
    }
}

// Keep the secret out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Hex HMAC-SHA256 of `payload` keyed by `secret`.
pub fn sign(secret: &str, payload: &str) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Signing(format!("HMAC key error: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";

    #[test]
    fn signs_reference_payload() {
        let payload = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";

        assert_eq!(
            sign(SECRET, payload).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_query_appends_window_timestamp_and_signature() {
        let credentials = Credentials::new("key", SECRET);
        let params = [
            ("symbol", "LTCBTC".to_string()),
            ("side", "BUY".to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", "1".to_string()),
            ("price", "0.1".to_string()),
        ];

        let query = credentials.signed_query_at(&params, 1499827319559).unwrap();

        assert!(query.starts_with("symbol=LTCBTC&side=BUY"));
        assert!(query.contains("&recvWindow=5000&timestamp=1499827319559&"));
        assert!(query.ends_with("signature=c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"));
    }

    #[test]
    fn debug_hides_secret() {
        let credentials = Credentials::new("key", SECRET);
        assert!(!format!("{credentials:?}").contains(SECRET));
    }
}
