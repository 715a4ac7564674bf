//! Lightauth: pay-per-request HTTP authorization over Lightning Network
//! micropayments.
//!
//! A server protects HTTP routes by demanding payment of pre-issued Lightning
//! invoices before the wrapped handler runs; a client library transparently
//! pays invoices and attaches proof to outgoing requests. All protocol state
//! is exchanged in `Light-Auth-*` HTTP headers.
//!
//! Two authorization modes share a common invoice lifecycle:
//!
//! - **discrete**: every authorized request consumes exactly one settled
//!   invoice, proven by revealing its pre-image
//! - **time**: each settled invoice buys a fixed period of authorized time,
//!   tracked as an expiration timestamp on both sides
//!
//! # Architecture
//!
//! 1. [`server::LightAuthServer`] wraps application handlers as an axum
//!    middleware, issues tokens and invoices, and validates payment proof
//! 2. [`client::LightAuthClient`] discovers protected routes, pays invoices
//!    through the Lightning node, and prepares outgoing requests
//! 3. Two background reconcilers translate the node's settlement streams into
//!    ledger mutations on each side
//!
//! The Lightning node sits behind the [`node::LightningNode`] port and the
//! persistence backend behind the [`store::DataStore`] port.
#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod headers;
pub mod invoice;
pub mod node;
pub mod reconcile;
pub mod server;
pub mod store;

#[cfg(test)]
pub(crate) mod test_utils;

pub use client::LightAuthClient;
pub use config::{Config, Mode, Period, RouteConfig};
pub use server::LightAuthServer;

/// Error types for lightauth operations
#[derive(thiserror::Error, Debug)]
pub enum LightAuthError {
    /// Missing or corrupt configuration; fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Lightning node RPC failure; surfaced to the caller, non-fatal
    #[error("lightning node error: {0}")]
    Node(String),

    /// Persistence failure; the mutation is considered not to have happened
    #[error("store error: {0}")]
    Store(String),

    /// Peer sent a malformed or invalid header
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// HTTP transport failure while talking to the server
    #[error("http transport error: {0}")]
    Transport(String),

    /// Payment state advisory (402/409); retry after the next `clear_request`
    #[error("payment state mismatch: {0}")]
    PaymentState(String),

    /// Server reported success against state we do not hold
    #[error("ledger corruption: {0}")]
    Corruption(String),

    /// No path has been discovered for this URL
    #[error("no path configured for {0}")]
    NotConfigured(String),

    /// The server answered with an internal error
    #[error("internal server error: {0}")]
    ServerSide(String),
}

/// Result type alias for lightauth operations
pub type AuthResult<T> = std::result::Result<T, LightAuthError>;
