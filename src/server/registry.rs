//! Server-side route table and per-token client ledgers
//!
//! Routes are configured once at startup and keyed by `METHOD + path`.
//! Each route holds the ledgers of every caller it has ever issued a token
//! to; ledger mutation goes through per-entity locks, table mutation through
//! the table lock.

use crate::config::RouteConfig;
use crate::invoice::Invoice;
use crate::store::{
    ClientRecord, DataStore, InvoiceOwner, Record, RouteRecord, ServerData, StoredClient,
    StoredRoute,
};
use crate::AuthResult;
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

const TOKEN_LENGTH: usize = 16;

/// Build the route-table key for an incoming request
pub fn route_key(method: &str, path: &str) -> String {
    format!("{method}{path}")
}

fn mint_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

#[derive(Debug)]
struct ClientState {
    expires_at: DateTime<Utc>,
    record_id: Option<String>,
}

/// Server-side ledger for one caller identity
pub struct Client {
    /// Opaque token assigned on first contact
    pub token: String,
    /// Name of the owning route, used for persistence and policy lookup
    pub route_name: String,
    state: Mutex<ClientState>,
    invoices: RwLock<HashMap<String, Arc<Invoice>>>,
}

impl Client {
    fn new(token: String, route_name: String, expires_at: DateTime<Utc>) -> Self {
        Self {
            token,
            route_name,
            state: Mutex::new(ClientState {
                expires_at,
                record_id: None,
            }),
            invoices: RwLock::new(HashMap::new()),
        }
    }

    fn from_stored(stored: &StoredClient) -> AuthResult<Self> {
        let mut invoices = HashMap::new();
        for record in &stored.invoices {
            let invoice = Invoice::from_record(record)?;
            invoices.insert(invoice.payment_request.clone(), Arc::new(invoice));
        }

        Ok(Self {
            token: stored.client.token.clone(),
            route_name: stored.client.route.clone(),
            state: Mutex::new(ClientState {
                expires_at: stored.client.expires_at,
                record_id: stored.client.id.clone(),
            }),
            invoices: RwLock::new(invoices),
        })
    }

    /// The caller's authorized-time horizon
    pub async fn expires_at(&self) -> DateTime<Utc> {
        self.state.lock().await.expires_at
    }

    /// Overwrite the authorized-time horizon
    pub async fn set_expires_at(&self, t: DateTime<Utc>) {
        self.state.lock().await.expires_at = t;
    }

    /// Look up an invoice by payment request
    pub async fn invoice(&self, payment_request: &str) -> Option<Arc<Invoice>> {
        self.invoices.read().await.get(payment_request).cloned()
    }

    /// Add a freshly-issued invoice to the ledger
    pub async fn add_invoice(&self, invoice: Arc<Invoice>) {
        self.invoices
            .write()
            .await
            .insert(invoice.payment_request.clone(), invoice);
    }

    /// Invoices the node has not yet reported as paid
    pub async fn unpaid_invoices(&self) -> Vec<Arc<Invoice>> {
        let invoices: Vec<_> = self.invoices.read().await.values().cloned().collect();
        let mut unpaid = Vec::new();
        for invoice in invoices {
            if !invoice.is_settled().await {
                unpaid.push(invoice);
            }
        }
        unpaid
    }

    /// The owner tag this ledger's invoices persist under
    pub fn invoice_owner(&self) -> InvoiceOwner {
        InvoiceOwner::Client {
            route: self.route_name.clone(),
            token: self.token.clone(),
        }
    }

    /// Persist the ledger: create on first save, edit afterwards
    pub async fn persist(&self, store: &dyn DataStore) -> AuthResult<()> {
        let record = {
            let state = self.state.lock().await;
            ClientRecord {
                id: state.record_id.clone(),
                route: self.route_name.clone(),
                token: self.token.clone(),
                expires_at: state.expires_at,
            }
        };

        if record.id.is_some() {
            store.edit(Record::Client(record)).await
        } else {
            let id = store.create(Record::Client(record)).await?;
            self.state.lock().await.record_id = Some(id);
            Ok(())
        }
    }
}

/// One configured route plus its client table
pub struct Route {
    /// Route policy: name, fee, mode, period, max invoices
    pub info: RouteConfig,
    record_id: Mutex<Option<String>>,
    clients: RwLock<HashMap<String, Arc<Client>>>,
}

impl Route {
    fn new(info: RouteConfig) -> Self {
        Self {
            info,
            record_id: Mutex::new(None),
            clients: RwLock::new(HashMap::new()),
        }
    }

    fn from_stored(stored: &StoredRoute) -> AuthResult<Self> {
        let info = RouteConfig {
            name: stored.route.name.clone(),
            fee: stored.route.fee,
            max_invoices: stored.route.max_invoices,
            mode: stored.route.mode,
            period: stored.route.period,
        };

        let mut clients = HashMap::new();
        for stored_client in &stored.clients {
            let client = Client::from_stored(stored_client)?;
            clients.insert(client.token.clone(), Arc::new(client));
        }

        Ok(Self {
            info,
            record_id: Mutex::new(stored.route.id.clone()),
            clients: RwLock::new(clients),
        })
    }

    /// Look up a caller's ledger by token
    pub async fn client(&self, token: &str) -> Option<Arc<Client>> {
        self.clients.read().await.get(token).cloned()
    }

    /// All ledgers under this route
    pub async fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Mint a fresh token, persist the new ledger and insert it.
    ///
    /// Retries on the (vanishingly unlikely) token collision so that a key
    /// is only ever inserted once.
    pub async fn create_client(&self, store: &dyn DataStore) -> AuthResult<Arc<Client>> {
        loop {
            let token = mint_token();
            if self.clients.read().await.contains_key(&token) {
                continue;
            }

            let client = Arc::new(Client::new(
                token.clone(),
                self.info.name.clone(),
                Utc::now(),
            ));
            client.persist(store).await?;

            let mut clients = self.clients.write().await;
            if clients.contains_key(&token) {
                continue;
            }
            clients.insert(token, client.clone());
            debug!(route = %self.info.name, token = %client.token, "issued new client token");
            return Ok(client);
        }
    }

    async fn persist(&self, store: &dyn DataStore) -> AuthResult<()> {
        let record = RouteRecord {
            id: self.record_id.lock().await.clone(),
            name: self.info.name.clone(),
            fee: self.info.fee,
            max_invoices: self.info.max_invoices,
            mode: self.info.mode,
            period: self.info.period,
        };

        if record.id.is_some() {
            store.edit(Record::Route(record)).await
        } else {
            let id = store.create(Record::Route(record)).await?;
            *self.record_id.lock().await = Some(id);
            Ok(())
        }
    }
}

/// Process-wide table of configured routes
#[derive(Default)]
pub struct ServerRegistry {
    routes: RwLock<HashMap<String, Arc<Route>>>,
}

impl ServerRegistry {
    /// Build a registry from persisted data, then seed routes the
    /// configuration names that the store does not yet hold
    pub async fn load(
        data: ServerData,
        configured: impl IntoIterator<Item = RouteConfig>,
        store: &dyn DataStore,
    ) -> AuthResult<Self> {
        let mut routes = HashMap::new();
        for stored in &data.routes {
            let route = Route::from_stored(stored)?;
            routes.insert(route.info.name.clone(), Arc::new(route));
        }

        for info in configured {
            if routes.contains_key(&info.name) {
                continue;
            }
            let route = Route::new(info);
            route.persist(store).await?;
            routes.insert(route.info.name.clone(), Arc::new(route));
        }

        Ok(Self {
            routes: RwLock::new(routes),
        })
    }

    /// Look up the route an incoming request maps to
    pub async fn route_for(&self, method: &str, path: &str) -> Option<Arc<Route>> {
        self.routes.read().await.get(&route_key(method, path)).cloned()
    }

    /// All configured routes
    pub async fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.read().await.values().cloned().collect()
    }

    /// Locate an invoice by payment request, anywhere in the table.
    ///
    /// Payment requests are node-issued and unique, so the first match is
    /// the only match.
    pub async fn find_invoice(
        &self,
        payment_request: &str,
    ) -> Option<(Arc<Route>, Arc<Client>, Arc<Invoice>)> {
        for route in self.routes().await {
            for client in route.clients().await {
                if let Some(invoice) = client.invoice(payment_request).await {
                    return Some((route, client, invoice));
                }
            }
        }
        None
    }
}
