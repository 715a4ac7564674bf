//! The `Light-Auth-*` header wire contract
//!
//! All protocol state moves in HTTP headers. The server emits the constant
//! and per-client headers on every response from a configured route; the
//! client sends its token on every authorized request and, in discrete mode,
//! the invoice it is claiming plus the pre-image proving payment.
//!
//! Timestamps are RFC 3339; pre-images and payment hashes are lower-case hex;
//! the invoice list is a JSON array of `{payment_request, expiration_time}`.

use crate::{AuthResult, LightAuthError};
use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

/// Integer mirror of the intended HTTP status
pub const STATUS: HeaderName = HeaderName::from_static("light-auth-status");
/// Route identifier
pub const NAME: HeaderName = HeaderName::from_static("light-auth-name");
/// Authorization mode: `time` or `discrete`
pub const MODE: HeaderName = HeaderName::from_static("light-auth-mode");
/// Satoshi fee per invoice
pub const FEE: HeaderName = HeaderName::from_static("light-auth-fee");
/// How many unsettled invoices the server keeps outstanding
pub const MAX_INVOICES: HeaderName = HeaderName::from_static("light-auth-max-invoices");
/// Time mode only: `millisecond`, `second` or `minute`
pub const TIME_PERIOD: HeaderName = HeaderName::from_static("light-auth-time-period");
/// Opaque identity the server assigned to this caller
pub const TOKEN: HeaderName = HeaderName::from_static("light-auth-token");
/// JSON array of currently-unsettled invoices
pub const INVOICES: HeaderName = HeaderName::from_static("light-auth-invoices");
/// Time mode only: the caller's authorized-time horizon, RFC 3339
pub const EXPIRATION_TIME: HeaderName = HeaderName::from_static("light-auth-expiration-time");
/// Discrete mode: the invoice being claimed (request) or accepted (response)
pub const INVOICE: HeaderName = HeaderName::from_static("light-auth-invoice");
/// Discrete mode: hex pre-image proving payment of the claimed invoice
pub const PRE_IMAGE: HeaderName = HeaderName::from_static("light-auth-pre-image");

/// One entry of the `Light-Auth-Invoices` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceListing {
    /// Bech32 payment request issued by the node
    pub payment_request: String,
    /// When the invoice stops being payable
    pub expiration_time: DateTime<Utc>,
}

/// Read a header as a string, treating absence as the empty string
pub fn read_header<'a>(headers: &'a HeaderMap, name: &HeaderName) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Read a header the peer is required to send
pub fn require_header<'a>(headers: &'a HeaderMap, name: &HeaderName) -> AuthResult<&'a str> {
    let value = read_header(headers, name);
    if value.is_empty() {
        return Err(LightAuthError::Protocol(format!("missing {name} header")));
    }
    Ok(value)
}

/// Encode an invoice list into the `Light-Auth-Invoices` header value
pub fn encode_invoices(listings: &[InvoiceListing]) -> AuthResult<String> {
    serde_json::to_string(listings)
        .map_err(|e| LightAuthError::Protocol(format!("could not encode invoice list: {e}")))
}

/// Decode the `Light-Auth-Invoices` header value
pub fn decode_invoices(value: &str) -> AuthResult<Vec<InvoiceListing>> {
    serde_json::from_str(value)
        .map_err(|e| LightAuthError::Protocol(format!("could not decode invoice list: {e}")))
}

/// Format a timestamp the way the wire contract expects
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp from a header value
pub fn parse_timestamp(value: &str) -> AuthResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LightAuthError::Protocol(format!("invalid timestamp {value:?}: {e}")))
}

/// Build a header value from a string, rejecting values HTTP cannot carry
pub fn header_value(value: &str) -> AuthResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| LightAuthError::Protocol(format!("value not header-safe: {e}")))
}
