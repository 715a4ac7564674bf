//! Persistence port for lightauth
//!
//! The protocol core persists four kinds of records: routes, clients, paths
//! and invoices. The store itself is opaque behind the [`DataStore`] trait;
//! first persistence assigns a durable id, later mutations edit in place.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! ephemeral deployments, and [`SqliteStore`] for durable storage.

use crate::config::{Mode, Period};
use crate::AuthResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Who owns an invoice: a server-side client ledger or a client-side path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InvoiceOwner {
    /// Server side: the client ledger identified by route name and token
    Client {
        /// Owning route name
        route: String,
        /// Owning client token
        token: String,
    },
    /// Client side: the path ledger identified by `host + path`
    Path {
        /// Owning path URL key
        url: String,
    },
}

/// Durable form of an invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRecord {
    /// Store-assigned id; `None` until first persisted
    pub id: Option<String>,
    /// Owning ledger
    pub owner: InvoiceOwner,
    /// Bech32 payment request issued by the node
    pub payment_request: String,
    /// Lower-case hex payment hash
    pub payment_hash: String,
    /// Satoshi value
    pub fee: u64,
    /// Whether the node has observed the invoice as paid
    pub settled: bool,
    /// Whether the server consumed the invoice to authorize a request
    pub claimed: bool,
    /// Lower-case hex pre-image, revealed on settlement
    pub preimage: Option<String>,
    /// When the invoice stops being payable
    pub expires_at: DateTime<Utc>,
}

/// Durable form of a server route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRecord {
    /// Store-assigned id; `None` until first persisted
    pub id: Option<String>,
    /// Route identifier (`METHOD + path`)
    pub name: String,
    /// Satoshi fee per invoice
    pub fee: u64,
    /// Outstanding unsettled invoices per client
    pub max_invoices: usize,
    /// Authorization mode
    pub mode: Mode,
    /// Time period per invoice
    pub period: Period,
}

/// Durable form of a server-side client ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Store-assigned id; `None` until first persisted
    pub id: Option<String>,
    /// Owning route name
    pub route: String,
    /// Opaque caller identity
    pub token: String,
    /// Authorized-time horizon (time mode)
    pub expires_at: DateTime<Utc>,
}

/// Durable form of a client-side path ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRecord {
    /// Store-assigned id; `None` until first persisted
    pub id: Option<String>,
    /// Path key: `host + path`
    pub url: String,
    /// Token the server assigned on first contact
    pub token: String,
    /// Authorization mode
    pub mode: Mode,
    /// Time period per invoice
    pub period: Period,
    /// Satoshi fee per invoice
    pub fee: u64,
    /// Outstanding unsettled invoices the server keeps
    pub max_invoices: usize,
    /// The client's optimistic authorized-time horizon
    pub local_expiration: DateTime<Utc>,
    /// The horizon last echoed by the server
    pub sync_expiration: DateTime<Utc>,
}

/// Any record the store can hold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Record {
    /// A server route
    Route(RouteRecord),
    /// A server-side client ledger
    Client(ClientRecord),
    /// A client-side path ledger
    Path(PathRecord),
    /// An invoice
    Invoice(InvoiceRecord),
}

impl Record {
    fn id(&self) -> Option<&str> {
        match self {
            Record::Route(r) => r.id.as_deref(),
            Record::Client(r) => r.id.as_deref(),
            Record::Path(r) => r.id.as_deref(),
            Record::Invoice(r) => r.id.as_deref(),
        }
    }
}

/// A client ledger with its invoices, as reassembled from the store
#[derive(Debug, Clone)]
pub struct StoredClient {
    /// The client record
    pub client: ClientRecord,
    /// Invoices owned by this client
    pub invoices: Vec<InvoiceRecord>,
}

/// A route with its client ledgers, as reassembled from the store
#[derive(Debug, Clone)]
pub struct StoredRoute {
    /// The route record
    pub route: RouteRecord,
    /// Client ledgers under this route
    pub clients: Vec<StoredClient>,
}

/// Everything the server side persisted
#[derive(Debug, Clone, Default)]
pub struct ServerData {
    /// All persisted routes
    pub routes: Vec<StoredRoute>,
}

/// A path ledger with its invoices, as reassembled from the store
#[derive(Debug, Clone)]
pub struct StoredPath {
    /// The path record
    pub path: PathRecord,
    /// Invoices owned by this path
    pub invoices: Vec<InvoiceRecord>,
}

/// Everything the client side persisted
#[derive(Debug, Clone, Default)]
pub struct ClientData {
    /// All persisted paths
    pub paths: Vec<StoredPath>,
}

/// Abstract store for routes, clients, paths and invoices
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    /// Persist a new record and return its store-assigned id
    async fn create(&self, record: Record) -> AuthResult<String>;

    /// Overwrite an already-persisted record (`record.id` must be set)
    async fn edit(&self, record: Record) -> AuthResult<()>;

    /// Reassemble the server-side object graph: routes, clients, invoices
    async fn server_data(&self) -> AuthResult<ServerData>;

    /// Reassemble the client-side object graph: paths and their invoices
    async fn client_data(&self) -> AuthResult<ClientData>;
}
