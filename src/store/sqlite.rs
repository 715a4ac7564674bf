//! SQLite-backed store

use super::{
    ClientData, ClientRecord, DataStore, InvoiceOwner, InvoiceRecord, PathRecord, Record,
    RouteRecord, ServerData, StoredClient, StoredPath, StoredRoute,
};
use crate::config::{Mode, Period};
use crate::{AuthResult, LightAuthError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// A [`DataStore`] backed by a SQLite database file
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations
    pub async fn open(path: impl AsRef<Path>) -> AuthResult<Self> {
        let path = path.as_ref();
        info!("opening lightauth store at {}", path.display());

        let conn = Connection::open(path)
            .map_err(|e| LightAuthError::Store(format!("could not open database: {e}")))?;
        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database, useful for tests
    pub async fn open_in_memory() -> AuthResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| LightAuthError::Store(format!("could not open database: {e}")))?;
        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> AuthResult<()> {
        debug!("running store migrations");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS routes (
                id TEXT PRIMARY KEY,
                name TEXT UNIQUE NOT NULL,
                fee INTEGER NOT NULL,
                max_invoices INTEGER NOT NULL,
                mode TEXT NOT NULL,
                period TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                route TEXT NOT NULL,
                token TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS paths (
                id TEXT PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                token TEXT NOT NULL,
                mode TEXT NOT NULL,
                period TEXT NOT NULL,
                fee INTEGER NOT NULL,
                max_invoices INTEGER NOT NULL,
                local_expiration TEXT NOT NULL,
                sync_expiration TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS invoices (
                id TEXT PRIMARY KEY,
                owner_kind TEXT NOT NULL,
                owner_route TEXT,
                owner_token TEXT,
                owner_url TEXT,
                payment_request TEXT NOT NULL,
                payment_hash TEXT NOT NULL,
                fee INTEGER NOT NULL,
                settled INTEGER NOT NULL DEFAULT 0,
                claimed INTEGER NOT NULL DEFAULT 0,
                preimage TEXT,
                expires_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_clients_route ON clients(route);
            CREATE INDEX IF NOT EXISTS idx_invoices_client ON invoices(owner_route, owner_token);
            CREATE INDEX IF NOT EXISTS idx_invoices_path ON invoices(owner_url);
            CREATE INDEX IF NOT EXISTS idx_invoices_hash ON invoices(payment_hash);
            "#,
        )
        .map_err(store_err)?;

        debug!("store migrations completed");
        Ok(())
    }
}

fn store_err(e: rusqlite::Error) -> LightAuthError {
    LightAuthError::Store(e.to_string())
}

fn parse_timestamp(value: String) -> AuthResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| LightAuthError::Store(format!("corrupt timestamp {value:?}: {e}")))
}

fn route_from_row(row: &Row<'_>) -> rusqlite::Result<(RouteRecord, String, String)> {
    Ok((
        RouteRecord {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            fee: row.get::<_, i64>(2)? as u64,
            max_invoices: row.get::<_, i64>(3)? as usize,
            mode: Mode::Time, // overwritten by caller after parsing
            period: Period::Millisecond,
        },
        row.get(4)?,
        row.get(5)?,
    ))
}

fn invoice_from_row(row: &Row<'_>) -> rusqlite::Result<(InvoiceRecord, String, String)> {
    let owner_kind: String = row.get(1)?;
    let owner_route: Option<String> = row.get(2)?;
    let owner_token: Option<String> = row.get(3)?;
    let owner_url: Option<String> = row.get(4)?;

    let owner = if owner_kind == "path" {
        InvoiceOwner::Path {
            url: owner_url.unwrap_or_default(),
        }
    } else {
        InvoiceOwner::Client {
            route: owner_route.unwrap_or_default(),
            token: owner_token.unwrap_or_default(),
        }
    };

    Ok((
        InvoiceRecord {
            id: Some(row.get(0)?),
            owner,
            payment_request: row.get(5)?,
            payment_hash: row.get(6)?,
            fee: row.get::<_, i64>(7)? as u64,
            settled: row.get::<_, i64>(8)? != 0,
            claimed: row.get::<_, i64>(9)? != 0,
            preimage: row.get(10)?,
            expires_at: Utc::now(), // overwritten by caller after parsing
        },
        row.get::<_, String>(11)?,
        owner_kind,
    ))
}

fn owner_columns(owner: &InvoiceOwner) -> (&str, Option<&str>, Option<&str>, Option<&str>) {
    match owner {
        InvoiceOwner::Client { route, token } => ("client", Some(route), Some(token), None),
        InvoiceOwner::Path { url } => ("path", None, None, Some(url)),
    }
}

impl SqliteStore {
    fn insert(conn: &Connection, id: &str, record: &Record) -> AuthResult<()> {
        match record {
            Record::Route(r) => {
                conn.execute(
                    "INSERT INTO routes (id, name, fee, max_invoices, mode, period)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        r.name,
                        r.fee as i64,
                        r.max_invoices as i64,
                        r.mode.to_string(),
                        r.period.to_string(),
                    ],
                )
                .map_err(store_err)?;
            }
            Record::Client(r) => {
                conn.execute(
                    "INSERT INTO clients (id, route, token, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, r.route, r.token, r.expires_at.to_rfc3339()],
                )
                .map_err(store_err)?;
            }
            Record::Path(r) => {
                conn.execute(
                    "INSERT INTO paths (id, url, token, mode, period, fee, max_invoices,
                                        local_expiration, sync_expiration)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        id,
                        r.url,
                        r.token,
                        r.mode.to_string(),
                        r.period.to_string(),
                        r.fee as i64,
                        r.max_invoices as i64,
                        r.local_expiration.to_rfc3339(),
                        r.sync_expiration.to_rfc3339(),
                    ],
                )
                .map_err(store_err)?;
            }
            Record::Invoice(r) => {
                let (kind, route, token, url) = owner_columns(&r.owner);
                conn.execute(
                    "INSERT INTO invoices (id, owner_kind, owner_route, owner_token, owner_url,
                                           payment_request, payment_hash, fee, settled, claimed,
                                           preimage, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        id,
                        kind,
                        route,
                        token,
                        url,
                        r.payment_request,
                        r.payment_hash,
                        r.fee as i64,
                        r.settled as i64,
                        r.claimed as i64,
                        r.preimage,
                        r.expires_at.to_rfc3339(),
                    ],
                )
                .map_err(store_err)?;
            }
        }
        Ok(())
    }

    fn update(conn: &Connection, id: &str, record: &Record) -> AuthResult<()> {
        let changed = match record {
            Record::Route(r) => conn
                .execute(
                    "UPDATE routes SET name = ?2, fee = ?3, max_invoices = ?4, mode = ?5,
                                       period = ?6
                     WHERE id = ?1",
                    params![
                        id,
                        r.name,
                        r.fee as i64,
                        r.max_invoices as i64,
                        r.mode.to_string(),
                        r.period.to_string(),
                    ],
                )
                .map_err(store_err)?,
            Record::Client(r) => conn
                .execute(
                    "UPDATE clients SET route = ?2, token = ?3, expires_at = ?4 WHERE id = ?1",
                    params![id, r.route, r.token, r.expires_at.to_rfc3339()],
                )
                .map_err(store_err)?,
            Record::Path(r) => conn
                .execute(
                    "UPDATE paths SET url = ?2, token = ?3, mode = ?4, period = ?5, fee = ?6,
                                      max_invoices = ?7, local_expiration = ?8,
                                      sync_expiration = ?9
                     WHERE id = ?1",
                    params![
                        id,
                        r.url,
                        r.token,
                        r.mode.to_string(),
                        r.period.to_string(),
                        r.fee as i64,
                        r.max_invoices as i64,
                        r.local_expiration.to_rfc3339(),
                        r.sync_expiration.to_rfc3339(),
                    ],
                )
                .map_err(store_err)?,
            Record::Invoice(r) => {
                let (kind, route, token, url) = owner_columns(&r.owner);
                conn.execute(
                    "UPDATE invoices SET owner_kind = ?2, owner_route = ?3, owner_token = ?4,
                                         owner_url = ?5, payment_request = ?6, payment_hash = ?7,
                                         fee = ?8, settled = ?9, claimed = ?10, preimage = ?11,
                                         expires_at = ?12
                     WHERE id = ?1",
                    params![
                        id,
                        kind,
                        route,
                        token,
                        url,
                        r.payment_request,
                        r.payment_hash,
                        r.fee as i64,
                        r.settled as i64,
                        r.claimed as i64,
                        r.preimage,
                        r.expires_at.to_rfc3339(),
                    ],
                )
                .map_err(store_err)?
            }
        };

        if changed == 0 {
            return Err(LightAuthError::Store(format!("no record with id {id}")));
        }
        Ok(())
    }

    fn invoices_for(
        conn: &Connection,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> AuthResult<Vec<InvoiceRecord>> {
        let mut stmt = conn.prepare(sql).map_err(store_err)?;
        let rows = stmt
            .query_map(args, invoice_from_row)
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;

        rows.into_iter()
            .map(|(mut record, expires_at, _)| {
                record.expires_at = parse_timestamp(expires_at)?;
                Ok(record)
            })
            .collect()
    }
}

const INVOICE_COLUMNS: &str = "id, owner_kind, owner_route, owner_token, owner_url, \
     payment_request, payment_hash, fee, settled, claimed, preimage, expires_at";

#[async_trait]
impl DataStore for SqliteStore {
    async fn create(&self, record: Record) -> AuthResult<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().await;
        Self::insert(&conn, &id, &record)?;
        Ok(id)
    }

    async fn edit(&self, record: Record) -> AuthResult<()> {
        let id = record
            .id()
            .ok_or_else(|| LightAuthError::Store("cannot edit a record with no id".to_string()))?
            .to_string();
        let conn = self.conn.lock().await;
        Self::update(&conn, &id, &record)
    }

    async fn server_data(&self) -> AuthResult<ServerData> {
        let conn = self.conn.lock().await;

        let mut stmt = conn
            .prepare("SELECT id, name, fee, max_invoices, mode, period FROM routes")
            .map_err(store_err)?;
        let raw_routes = stmt
            .query_map([], route_from_row)
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;

        let mut routes = Vec::new();
        for (mut route, mode, period) in raw_routes {
            route.mode = mode
                .parse()
                .map_err(|_| LightAuthError::Store(format!("corrupt mode {mode:?}")))?;
            route.period = period
                .parse()
                .map_err(|_| LightAuthError::Store(format!("corrupt period {period:?}")))?;

            let mut client_stmt = conn
                .prepare("SELECT id, route, token, expires_at FROM clients WHERE route = ?1")
                .map_err(store_err)?;
            let raw_clients = client_stmt
                .query_map([&route.name], |row| {
                    Ok((
                        ClientRecord {
                            id: Some(row.get(0)?),
                            route: row.get(1)?,
                            token: row.get(2)?,
                            expires_at: Utc::now(),
                        },
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(store_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_err)?;

            let mut clients = Vec::new();
            for (mut client, expires_at) in raw_clients {
                client.expires_at = parse_timestamp(expires_at)?;
                let invoices = Self::invoices_for(
                    &conn,
                    &format!(
                        "SELECT {INVOICE_COLUMNS} FROM invoices \
                         WHERE owner_kind = 'client' AND owner_route = ?1 AND owner_token = ?2"
                    ),
                    params![client.route, client.token],
                )?;
                clients.push(StoredClient { client, invoices });
            }

            routes.push(StoredRoute { route, clients });
        }

        Ok(ServerData { routes })
    }

    async fn client_data(&self) -> AuthResult<ClientData> {
        let conn = self.conn.lock().await;

        let mut stmt = conn
            .prepare(
                "SELECT id, url, token, mode, period, fee, max_invoices,
                        local_expiration, sync_expiration
                 FROM paths",
            )
            .map_err(store_err)?;
        let raw_paths = stmt
            .query_map([], |row| {
                Ok((
                    PathRecord {
                        id: Some(row.get(0)?),
                        url: row.get(1)?,
                        token: row.get(2)?,
                        mode: Mode::Time,
                        period: Period::Millisecond,
                        fee: row.get::<_, i64>(5)? as u64,
                        max_invoices: row.get::<_, i64>(6)? as usize,
                        local_expiration: Utc::now(),
                        sync_expiration: Utc::now(),
                    },
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .map_err(store_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;

        let mut paths = Vec::new();
        for (mut path, mode, period, local, sync) in raw_paths {
            path.mode = mode
                .parse()
                .map_err(|_| LightAuthError::Store(format!("corrupt mode {mode:?}")))?;
            path.period = period
                .parse()
                .map_err(|_| LightAuthError::Store(format!("corrupt period {period:?}")))?;
            path.local_expiration = parse_timestamp(local)?;
            path.sync_expiration = parse_timestamp(sync)?;

            let invoices = Self::invoices_for(
                &conn,
                &format!(
                    "SELECT {INVOICE_COLUMNS} FROM invoices \
                     WHERE owner_kind = 'path' AND owner_url = ?1"
                ),
                params![path.url],
            )?;
            paths.push(StoredPath { path, invoices });
        }

        Ok(ClientData { paths })
    }
}
