//! In-memory store, primarily for tests and ephemeral deployments

use super::{
    ClientData, ClientRecord, DataStore, InvoiceOwner, InvoiceRecord, PathRecord, Record,
    RouteRecord, ServerData, StoredClient, StoredPath, StoredRoute,
};
use crate::{AuthResult, LightAuthError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    routes: HashMap<String, RouteRecord>,
    clients: HashMap<String, ClientRecord>,
    paths: HashMap<String, PathRecord>,
    invoices: HashMap<String, InvoiceRecord>,
}

/// A [`DataStore`] that keeps everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of invoices currently held, for test assertions
    pub async fn invoice_count(&self) -> usize {
        self.tables.lock().await.invoices.len()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn create(&self, record: Record) -> AuthResult<String> {
        let id = Uuid::new_v4().to_string();
        let mut tables = self.tables.lock().await;

        match record {
            Record::Route(mut r) => {
                r.id = Some(id.clone());
                tables.routes.insert(id.clone(), r);
            }
            Record::Client(mut r) => {
                r.id = Some(id.clone());
                tables.clients.insert(id.clone(), r);
            }
            Record::Path(mut r) => {
                r.id = Some(id.clone());
                tables.paths.insert(id.clone(), r);
            }
            Record::Invoice(mut r) => {
                r.id = Some(id.clone());
                tables.invoices.insert(id.clone(), r);
            }
        }

        Ok(id)
    }

    async fn edit(&self, record: Record) -> AuthResult<()> {
        let id = record
            .id()
            .ok_or_else(|| LightAuthError::Store("cannot edit a record with no id".to_string()))?
            .to_string();
        let mut tables = self.tables.lock().await;

        let known = match record {
            Record::Route(r) => tables.routes.insert(id.clone(), r).is_some(),
            Record::Client(r) => tables.clients.insert(id.clone(), r).is_some(),
            Record::Path(r) => tables.paths.insert(id.clone(), r).is_some(),
            Record::Invoice(r) => tables.invoices.insert(id.clone(), r).is_some(),
        };

        if !known {
            return Err(LightAuthError::Store(format!("no record with id {id}")));
        }
        Ok(())
    }

    async fn server_data(&self) -> AuthResult<ServerData> {
        let tables = self.tables.lock().await;
        let mut routes = Vec::new();

        for route in tables.routes.values() {
            let mut clients = Vec::new();
            for client in tables.clients.values().filter(|c| c.route == route.name) {
                let invoices = tables
                    .invoices
                    .values()
                    .filter(|i| {
                        matches!(
                            &i.owner,
                            InvoiceOwner::Client { route: r, token }
                                if *r == route.name && *token == client.token
                        )
                    })
                    .cloned()
                    .collect();
                clients.push(StoredClient {
                    client: client.clone(),
                    invoices,
                });
            }
            routes.push(StoredRoute {
                route: route.clone(),
                clients,
            });
        }

        Ok(ServerData { routes })
    }

    async fn client_data(&self) -> AuthResult<ClientData> {
        let tables = self.tables.lock().await;
        let mut paths = Vec::new();

        for path in tables.paths.values() {
            let invoices = tables
                .invoices
                .values()
                .filter(|i| matches!(&i.owner, InvoiceOwner::Path { url } if *url == path.url))
                .cloned()
                .collect();
            paths.push(StoredPath {
                path: path.clone(),
                invoices,
            });
        }

        Ok(ClientData { paths })
    }
}
