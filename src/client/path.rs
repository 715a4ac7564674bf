//! Client-side per-route ledger
//!
//! A path tracks one protected server route: the token the server assigned,
//! the route policy learned at discovery, the invoices the server has issued
//! and the two expiration horizons of time mode. `local_expiration` is the
//! optimistic view advanced by the local settlement reconciler;
//! `sync_expiration` is the authoritative value echoed by the server.

use crate::config::{Mode, Period};
use crate::invoice::Invoice;
use crate::reconcile::extend_expiration;
use crate::store::{ClientData, DataStore, InvoiceOwner, PathRecord, Record, StoredPath};
use crate::AuthResult;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};

#[derive(Debug)]
struct PathState {
    local_expiration: DateTime<Utc>,
    sync_expiration: DateTime<Utc>,
    record_id: Option<String>,
}

/// Ledger for one protected route, keyed by `host + path`
pub struct Path {
    /// Path key: `host + path`
    pub url: String,
    /// Token the server assigned on first contact
    pub token: String,
    /// Authorization mode of the route
    pub mode: Mode,
    /// Duration one settled invoice buys, in time mode
    pub period: Period,
    /// Satoshi fee per invoice
    pub fee: u64,
    /// Outstanding unsettled invoices the server keeps
    pub max_invoices: usize,
    state: Mutex<PathState>,
    invoices: RwLock<HashMap<String, Arc<Invoice>>>,
    spendable: Notify,
}

impl Path {
    /// Build a path from a discovery response
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        token: String,
        mode: Mode,
        period: Period,
        fee: u64,
        max_invoices: usize,
        expiration: DateTime<Utc>,
    ) -> Self {
        Self {
            url,
            token,
            mode,
            period,
            fee,
            max_invoices,
            state: Mutex::new(PathState {
                local_expiration: expiration,
                sync_expiration: expiration,
                record_id: None,
            }),
            invoices: RwLock::new(HashMap::new()),
            spendable: Notify::new(),
        }
    }

    /// Rebuild a path from its durable form
    pub fn from_stored(stored: &StoredPath) -> AuthResult<Self> {
        let mut invoices = HashMap::new();
        for record in &stored.invoices {
            let invoice = Invoice::from_record(record)?;
            invoices.insert(invoice.hash_hex(), Arc::new(invoice));
        }

        Ok(Self {
            url: stored.path.url.clone(),
            token: stored.path.token.clone(),
            mode: stored.path.mode,
            period: stored.path.period,
            fee: stored.path.fee,
            max_invoices: stored.path.max_invoices,
            state: Mutex::new(PathState {
                local_expiration: stored.path.local_expiration,
                sync_expiration: stored.path.sync_expiration,
                record_id: stored.path.id.clone(),
            }),
            invoices: RwLock::new(invoices),
            spendable: Notify::new(),
        })
    }

    /// The optimistic authorized-time horizon
    pub async fn local_expiration(&self) -> DateTime<Utc> {
        self.state.lock().await.local_expiration
    }

    /// The horizon last echoed by the server
    pub async fn sync_expiration(&self) -> DateTime<Utc> {
        self.state.lock().await.sync_expiration
    }

    /// Record the horizon the server echoed, then persist
    pub async fn set_sync_expiration(
        &self,
        t: DateTime<Utc>,
        store: &dyn DataStore,
    ) -> AuthResult<()> {
        self.state.lock().await.sync_expiration = t;
        self.persist(store).await
    }

    /// Roll the optimistic horizon back to the server's view.
    ///
    /// Used when the server answers 402: whatever credit the client thought
    /// it had beyond the echoed horizon was not honored.
    pub async fn clamp_local_to_sync(&self, store: &dyn DataStore) -> AuthResult<()> {
        {
            let mut state = self.state.lock().await;
            state.local_expiration = state.sync_expiration;
        }
        self.persist(store).await
    }

    /// Advance the optimistic horizon for one settled invoice, then persist.
    ///
    /// The extension is additive: credit already accumulated beyond `now` is
    /// preserved, so N settlements always buy N periods.
    pub async fn update_balance(&self, now: DateTime<Utc>, store: &dyn DataStore) -> AuthResult<()> {
        if self.mode == Mode::Time {
            {
                let mut state = self.state.lock().await;
                state.local_expiration =
                    extend_expiration(state.local_expiration, now, self.period.duration());
            }
            self.persist(store).await?;
        }
        Ok(())
    }

    /// Look up an invoice by lower-case hex payment hash
    pub async fn invoice_by_hash(&self, hash_hex: &str) -> Option<Arc<Invoice>> {
        self.invoices.read().await.get(hash_hex).cloned()
    }

    /// Add an invoice unless one with the same payment hash is already held.
    /// Returns whether the invoice was inserted.
    pub async fn add_invoice(&self, invoice: Arc<Invoice>) -> bool {
        let mut invoices = self.invoices.write().await;
        match invoices.entry(invoice.hash_hex()) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(invoice);
                true
            }
        }
    }

    /// All invoices currently held
    pub async fn invoices(&self) -> Vec<Arc<Invoice>> {
        self.invoices.read().await.values().cloned().collect()
    }

    /// Settled invoices the server has not yet consumed
    pub async fn unclaimed_invoices(&self) -> Vec<Arc<Invoice>> {
        let mut unclaimed = Vec::new();
        for invoice in self.invoices().await {
            if invoice.is_settled().await && !invoice.is_claimed().await {
                unclaimed.push(invoice);
            }
        }
        unclaimed
    }

    /// Unsettled invoices still inside their payable window
    pub async fn payable_invoices(&self, now: DateTime<Utc>) -> Vec<Arc<Invoice>> {
        let mut payable = Vec::new();
        for invoice in self.invoices().await {
            if !invoice.is_settled().await && !invoice.is_expired(now) {
                payable.push(invoice);
            }
        }
        payable
    }

    /// Whether a request sent now would be authorized, as far as the local
    /// ledger knows
    pub async fn can_request(&self, now: DateTime<Utc>) -> bool {
        match self.mode {
            Mode::Time => self.local_expiration().await > now,
            Mode::Discrete => !self.unclaimed_invoices().await.is_empty(),
        }
    }

    /// Wake any request blocked on this path's balance
    pub fn notify_settlement(&self) {
        self.spendable.notify_waiters();
    }

    /// Block until the path is spendable or `limit` elapses.
    ///
    /// The settlement reconciler fires the signal; the wait is bounded so a
    /// payment that never settles cannot hang the caller.
    pub async fn await_spendable(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.spendable.notified();
            if self.can_request(Utc::now()).await {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.can_request(Utc::now()).await;
            }
        }
    }

    /// The owner tag this path's invoices persist under
    pub fn invoice_owner(&self) -> InvoiceOwner {
        InvoiceOwner::Path {
            url: self.url.clone(),
        }
    }

    /// Persist the path: create on first save, edit afterwards
    pub async fn persist(&self, store: &dyn DataStore) -> AuthResult<()> {
        let record = {
            let state = self.state.lock().await;
            PathRecord {
                id: state.record_id.clone(),
                url: self.url.clone(),
                token: self.token.clone(),
                mode: self.mode,
                period: self.period,
                fee: self.fee,
                max_invoices: self.max_invoices,
                local_expiration: state.local_expiration,
                sync_expiration: state.sync_expiration,
            }
        };

        if record.id.is_some() {
            store.edit(Record::Path(record)).await
        } else {
            let id = store.create(Record::Path(record)).await?;
            self.state.lock().await.record_id = Some(id);
            Ok(())
        }
    }
}

/// Table of every path the client has discovered
#[derive(Default)]
pub struct PathRegistry {
    paths: RwLock<HashMap<String, Arc<Path>>>,
}

impl PathRegistry {
    /// Build a registry from persisted data
    pub fn load(data: ClientData) -> AuthResult<Self> {
        let mut paths = HashMap::new();
        for stored in &data.paths {
            let path = Path::from_stored(stored)?;
            paths.insert(path.url.clone(), Arc::new(path));
        }
        Ok(Self {
            paths: RwLock::new(paths),
        })
    }

    /// Look up a path by its `host + path` key
    pub async fn get(&self, url: &str) -> Option<Arc<Path>> {
        self.paths.read().await.get(url).cloned()
    }

    /// Insert a newly-discovered path. If a concurrent discovery of the same
    /// URL won the race, the existing path is returned instead.
    pub async fn insert(&self, path: Arc<Path>) -> Arc<Path> {
        let mut paths = self.paths.write().await;
        match paths.entry(path.url.clone()) {
            std::collections::hash_map::Entry::Occupied(entry) => entry.get().clone(),
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(path.clone());
                path
            }
        }
    }

    /// Locate the path holding an invoice with this payment hash.
    ///
    /// Payment hashes are globally unique across paths, so the first match
    /// is the only match.
    pub async fn find_by_payment_hash(&self, hash_hex: &str) -> Option<(Arc<Path>, Arc<Invoice>)> {
        let paths: Vec<_> = self.paths.read().await.values().cloned().collect();
        for path in paths {
            if let Some(invoice) = path.invoice_by_hash(hash_hex).await {
                return Some((path, invoice));
            }
        }
        None
    }
}
