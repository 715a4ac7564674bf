//! Client request preparer
//!
//! [`LightAuthClient`] turns ordinary outbound requests into authorized
//! ones. On first contact with a URL it performs a discovery GET, learns the
//! route policy from the response headers and builds a [`path::Path`]
//! ledger. Before each request it tops up payment (submitting payments on
//! the node's stream without blocking on settlement), waits for the local
//! ledger to become spendable and, in discrete mode, attaches the pre-image
//! proof. After the request returns, [`read_response`] folds the server's
//! headers back into the ledger.
//!
//! [`read_response`]: LightAuthClient::read_response

pub mod path;

use crate::config::{Mode, Period};
use crate::headers;
use crate::invoice::{ClaimOutcome, Invoice};
use crate::node::{LightningNode, SendRequest};
use crate::reconcile::spawn_client_reconciler;
use crate::store::DataStore;
use crate::{AuthResult, LightAuthError};
use chrono::Utc;
use http::header::{HeaderMap, HeaderName};
use path::{Path, PathRegistry};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a request may wait for its payment to settle locally
const WAIT_THRESHOLD: Duration = Duration::from_millis(500);

/// Client half of the protocol: path table, store and node handles
pub struct LightAuthClient {
    registry: Arc<PathRegistry>,
    store: Arc<dyn DataStore>,
    node: Arc<dyn LightningNode>,
    http: reqwest::Client,
    wait_threshold: Duration,
}

impl LightAuthClient {
    /// Load persisted paths and start the settlement reconciler over the
    /// node's payment stream
    pub async fn start(
        store: Arc<dyn DataStore>,
        node: Arc<dyn LightningNode>,
    ) -> AuthResult<Self> {
        let data = store.client_data().await?;
        let registry = Arc::new(PathRegistry::load(data)?);

        let updates = node.payment_updates().await?;
        spawn_client_reconciler(registry.clone(), store.clone(), updates);

        Ok(Self {
            registry,
            store,
            node,
            http: reqwest::Client::new(),
            wait_threshold: WAIT_THRESHOLD,
        })
    }

    /// Override the settlement wait bound (mainly for tests)
    pub fn with_wait_threshold(mut self, threshold: Duration) -> Self {
        self.wait_threshold = threshold;
        self
    }

    /// The `host + path` key a URL maps to
    fn url_key(url: &Url) -> AuthResult<String> {
        let host = url
            .host_str()
            .ok_or_else(|| LightAuthError::Protocol(format!("{url} has no host")))?;
        Ok(match url.port() {
            Some(port) => format!("{host}:{port}{}", url.path()),
            None => format!("{host}{}", url.path()),
        })
    }

    /// Prepare an outbound request: discover the route if needed, replenish
    /// payment, wait until spendable and attach the authorization headers
    pub async fn clear_request(&self, request: &mut reqwest::Request) -> AuthResult<()> {
        let key = Self::url_key(request.url())?;
        let path = match self.registry.get(&key).await {
            Some(path) => path,
            None => self.discover(request.url().clone(), key).await?,
        };

        request
            .headers_mut()
            .insert(headers::TOKEN, headers::header_value(&path.token)?);

        let now = Utc::now();
        let needs_payment = match path.mode {
            Mode::Time => path.sync_expiration().await < now,
            Mode::Discrete => path.unclaimed_invoices().await.is_empty(),
        };

        if needs_payment {
            for invoice in path.payable_invoices(now).await {
                let send = SendRequest {
                    payment_request: invoice.payment_request.clone(),
                    amount_sat: invoice.fee,
                };
                if let Err(e) = self.node.send_payment(send).await {
                    warn!(
                        "could not submit payment for {}: {e}",
                        invoice.payment_request
                    );
                }
            }
        }

        // The reconciler wakes us as soon as a settlement lands; past the
        // bound we proceed anyway and let the server's answer decide.
        if !path.await_spendable(self.wait_threshold).await {
            debug!("proceeding without a confirmed balance for {}", path.url);
        }

        if path.mode == Mode::Discrete {
            let spendable = path
                .unclaimed_invoices()
                .await
                .into_iter()
                .next()
                .ok_or_else(|| {
                    LightAuthError::PaymentState(
                        "no settled unclaimed invoice to spend".to_string(),
                    )
                })?;
            let preimage = spendable.preimage().await.ok_or_else(|| {
                LightAuthError::Corruption(format!(
                    "settled invoice {} holds no pre-image",
                    spendable.payment_request
                ))
            })?;

            let request_headers = request.headers_mut();
            request_headers.insert(
                headers::PRE_IMAGE,
                headers::header_value(&hex::encode(preimage))?,
            );
            request_headers.insert(
                headers::INVOICE,
                headers::header_value(&spendable.payment_request)?,
            );
        }

        Ok(())
    }

    /// First contact with a route: a bare GET whose response headers carry
    /// the policy and the first batch of invoices
    async fn discover(&self, mut url: Url, key: String) -> AuthResult<Arc<Path>> {
        url.set_query(None);
        url.set_fragment(None);
        debug!("discovering lightauth route at {url}");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| LightAuthError::Transport(format!("discovery request failed: {e}")))?;
        let response_headers = response.headers().clone();

        let mode_value = headers::read_header(&response_headers, &headers::MODE);
        if mode_value.is_empty() {
            return Err(LightAuthError::Protocol(format!(
                "{key} does not speak the lightauth protocol (no mode header)"
            )));
        }
        let mode: Mode = mode_value.parse()?;
        let fee = parse_number(&response_headers, &headers::FEE)?;
        let max_invoices = parse_number(&response_headers, &headers::MAX_INVOICES)? as usize;
        let token = headers::require_header(&response_headers, &headers::TOKEN)?.to_string();

        let (period, expiration) = match mode {
            Mode::Time => (
                headers::require_header(&response_headers, &headers::TIME_PERIOD)?.parse()?,
                headers::parse_timestamp(headers::require_header(
                    &response_headers,
                    &headers::EXPIRATION_TIME,
                )?)?,
            ),
            Mode::Discrete => (Period::default(), Utc::now()),
        };

        let path = Arc::new(Path::new(
            key, token, mode, period, fee, max_invoices, expiration,
        ));
        let path = self.registry.insert(path).await;
        path.persist(self.store.as_ref()).await?;
        self.harvest_invoices(&path, &response_headers).await?;

        Ok(path)
    }

    /// Fold new invoices from a response into the path, deduplicated by
    /// payment hash. An invoice the node cannot decode is dropped; the rest
    /// are kept.
    async fn harvest_invoices(
        &self,
        path: &Arc<Path>,
        response_headers: &HeaderMap,
    ) -> AuthResult<()> {
        let raw = headers::read_header(response_headers, &headers::INVOICES);
        if raw.is_empty() {
            return Ok(());
        }
        let listings = headers::decode_invoices(raw)?;

        for listing in listings {
            let decoded = match self.node.decode_pay_req(&listing.payment_request).await {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("server sent an invoice the node cannot decode: {e}");
                    continue;
                }
            };
            let hash = match hex::decode(&decoded.payment_hash) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("node returned a malformed payment hash: {e}");
                    continue;
                }
            };

            let invoice = Arc::new(Invoice::new(
                listing.payment_request,
                hash,
                path.fee,
                listing.expiration_time,
            ));
            if path.add_invoice(invoice.clone()).await {
                if let Err(e) = invoice.persist(path.invoice_owner(), self.store.as_ref()).await {
                    warn!(
                        "could not persist harvested invoice {}: {e}",
                        invoice.payment_request
                    );
                }
            }
        }

        Ok(())
    }

    /// Synchronize the ledger from an authorized request's response.
    ///
    /// Returns the response untouched on success; protocol denials become
    /// errors the caller can match on.
    pub async fn read_response(
        &self,
        response: reqwest::Response,
    ) -> AuthResult<reqwest::Response> {
        let key = Self::url_key(response.url())?;
        let path = self
            .registry
            .get(&key)
            .await
            .ok_or(LightAuthError::NotConfigured(key))?;

        let response_headers = response.headers().clone();
        let status_value = headers::read_header(&response_headers, &headers::STATUS);
        let status: u16 = status_value.parse().map_err(|_| {
            LightAuthError::Protocol(format!(
                "response carries no readable Light-Auth-Status (got {status_value:?})"
            ))
        })?;

        self.harvest_invoices(&path, &response_headers).await?;

        match status {
            200 => {
                match path.mode {
                    Mode::Time => {
                        let sync = headers::parse_timestamp(headers::require_header(
                            &response_headers,
                            &headers::EXPIRATION_TIME,
                        )?)?;
                        path.set_sync_expiration(sync, self.store.as_ref()).await?;
                    }
                    Mode::Discrete => {
                        self.claim_accepted_invoice(&path, &response_headers).await?;
                    }
                }
                Ok(response)
            }
            400 => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| LightAuthError::Transport(e.to_string()))?;
                Err(LightAuthError::Protocol(body))
            }
            402 => {
                // The server did not honor time we thought we had; fall
                // back to its view so the next request pays again.
                if path.mode == Mode::Time {
                    path.clamp_local_to_sync(self.store.as_ref()).await?;
                }
                Err(LightAuthError::PaymentState("payment required".to_string()))
            }
            409 => Err(LightAuthError::PaymentState("conflict".to_string())),
            500 => Err(LightAuthError::ServerSide(
                "internal server error".to_string(),
            )),
            other => Err(LightAuthError::Protocol(format!(
                "unrecognised Light-Auth-Status {other}"
            ))),
        }
    }

    /// Mark the invoice the server echoed as consumed
    async fn claim_accepted_invoice(
        &self,
        path: &Arc<Path>,
        response_headers: &HeaderMap,
    ) -> AuthResult<()> {
        let claimed_request =
            headers::require_header(response_headers, &headers::INVOICE)?.to_string();

        let mut claimed = None;
        for invoice in path.invoices().await {
            if invoice.payment_request == claimed_request {
                claimed = Some(invoice);
                break;
            }
        }
        let invoice = claimed.ok_or_else(|| {
            LightAuthError::Corruption(format!(
                "server accepted a claim for unknown invoice {claimed_request}"
            ))
        })?;

        match invoice.try_claim().await {
            ClaimOutcome::Claimed => {
                invoice
                    .persist(path.invoice_owner(), self.store.as_ref())
                    .await
            }
            ClaimOutcome::AlreadyClaimed => Ok(()),
            ClaimOutcome::NotSettled => Err(LightAuthError::Corruption(format!(
                "server accepted {claimed_request}, which is not settled locally"
            ))),
        }
    }
}

fn parse_number(response_headers: &HeaderMap, name: &HeaderName) -> AuthResult<u64> {
    let value = headers::require_header(response_headers, name)?;
    value
        .parse()
        .map_err(|_| LightAuthError::Protocol(format!("{name} is not a number: {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RouteConfig};
    use crate::server::{middleware, LightAuthServer};
    use crate::store::MemoryStore;
    use crate::test_utils::{init_tracing, MockNode};
    use axum::routing::get;
    use axum::Router;
    use reqwest::Method;
    use std::net::SocketAddr;

    fn discrete_route() -> RouteConfig {
        RouteConfig {
            name: "GET/x".to_string(),
            fee: 10,
            max_invoices: 2,
            mode: Mode::Discrete,
            period: Period::Millisecond,
        }
    }

    fn time_route() -> RouteConfig {
        RouteConfig {
            name: "GET/x".to_string(),
            fee: 1,
            max_invoices: 3,
            mode: Mode::Time,
            period: Period::Second,
        }
    }

    async fn spawn_protected_server(route: RouteConfig, node: Arc<MockNode>) -> SocketAddr {
        init_tracing();
        let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.routes.insert(route.name.clone(), route);
        let server = LightAuthServer::start(&config, store, node).await.unwrap();

        let app = Router::new()
            .route("/x", get(|| async { "protected" }))
            .route("/open", get(|| async { "open" }))
            .layer(axum::middleware::from_fn_with_state(
                server.clone(),
                middleware,
            ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn start_client(node: Arc<MockNode>) -> LightAuthClient {
        let store: Arc<dyn DataStore> = Arc::new(MemoryStore::new());
        LightAuthClient::start(store, node).await.unwrap()
    }

    /// Run the request loop a real caller would: prepare, execute, read,
    /// retrying while the server is still behind on settlements.
    async fn authorized_get(
        auth: &LightAuthClient,
        http: &reqwest::Client,
        url: &Url,
    ) -> AuthResult<reqwest::Response> {
        let mut last_err = None;
        for _ in 0..40 {
            let mut request = reqwest::Request::new(Method::GET, url.clone());
            auth.clear_request(&mut request).await?;
            let response = http
                .execute(request)
                .await
                .map_err(|e| LightAuthError::Transport(e.to_string()))?;
            match auth.read_response(response).await {
                Ok(response) => return Ok(response),
                Err(LightAuthError::PaymentState(reason)) => {
                    last_err = Some(LightAuthError::PaymentState(reason));
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap())
    }

    #[tokio::test]
    async fn test_discovery_builds_path_once() {
        let node = Arc::new(MockNode::new());
        let addr = spawn_protected_server(discrete_route(), node.clone()).await;
        let auth = start_client(node).await;

        let url: Url = format!("http://{addr}/x").parse().unwrap();
        let mut request = reqwest::Request::new(Method::GET, url.clone());
        auth.clear_request(&mut request).await.unwrap();

        let key = LightAuthClient::url_key(&url).unwrap();
        let path = auth.registry.get(&key).await.expect("path discovered");
        assert_eq!(path.mode, Mode::Discrete);
        assert_eq!(path.fee, 10);
        assert_eq!(path.max_invoices, 2);
        assert!(!path.token.is_empty());
        assert_eq!(path.invoices().await.len(), 2);

        // A second clear_request reuses the discovered path.
        let mut request = reqwest::Request::new(Method::GET, url.clone());
        auth.clear_request(&mut request).await.unwrap();
        let again = auth.registry.get(&key).await.unwrap();
        assert!(Arc::ptr_eq(&path, &again));
    }

    #[tokio::test]
    async fn test_discrete_round_trip_and_replay_rejection() {
        let node = Arc::new(MockNode::new());
        let addr = spawn_protected_server(discrete_route(), node.clone()).await;
        let auth = start_client(node.clone()).await;
        let http = reqwest::Client::new();

        let url: Url = format!("http://{addr}/x").parse().unwrap();
        let response = authorized_get(&auth, &http, &url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let claimed_request = response
            .headers()
            .get(&headers::INVOICE)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(response.text().await.unwrap(), "protected");

        // read_response marked the accepted invoice claimed locally.
        let key = LightAuthClient::url_key(&url).unwrap();
        let path = auth.registry.get(&key).await.unwrap();
        let claimed = path
            .invoice_by_hash(
                &node
                    .decode_pay_req(&claimed_request)
                    .await
                    .unwrap()
                    .payment_hash,
            )
            .await
            .unwrap();
        assert!(claimed.is_claimed().await);

        // Replaying the exact same proof is rejected by the server.
        let preimage = hex::encode(node.preimage_of(&claimed_request).await.unwrap());
        let mut replay = reqwest::Request::new(Method::GET, url.clone());
        {
            let h = replay.headers_mut();
            h.insert(headers::TOKEN, headers::header_value(&path.token).unwrap());
            h.insert(
                headers::INVOICE,
                headers::header_value(&claimed_request).unwrap(),
            );
            h.insert(headers::PRE_IMAGE, headers::header_value(&preimage).unwrap());
        }
        let response = http.execute(replay).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        match auth.read_response(response).await {
            Err(LightAuthError::Protocol(body)) => {
                assert!(body.contains("already been claimed"), "body: {body}")
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_time_round_trip_synchronizes_expiration() {
        let node = Arc::new(MockNode::new());
        let addr = spawn_protected_server(time_route(), node.clone()).await;
        let auth = start_client(node).await;
        let http = reqwest::Client::new();

        let url: Url = format!("http://{addr}/x").parse().unwrap();
        let before = Utc::now();
        let response = authorized_get(&auth, &http, &url).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "protected");

        let key = LightAuthClient::url_key(&url).unwrap();
        let path = auth.registry.get(&key).await.unwrap();
        assert!(path.sync_expiration().await > before);
    }

    #[tokio::test]
    async fn test_read_response_requires_discovered_path() {
        let node = Arc::new(MockNode::new());
        let addr = spawn_protected_server(discrete_route(), node.clone()).await;
        let auth = start_client(node).await;

        let response = reqwest::get(format!("http://{addr}/open")).await.unwrap();
        match auth.read_response(response).await {
            Err(LightAuthError::NotConfigured(_)) => {}
            other => panic!("expected NotConfigured, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discovery_rejects_non_lightauth_server() {
        let node = Arc::new(MockNode::new());
        let addr = spawn_protected_server(discrete_route(), node.clone()).await;
        let auth = start_client(node).await;

        // /open is served without the middleware headers.
        let url: Url = format!("http://{addr}/open").parse().unwrap();
        let mut request = reqwest::Request::new(Method::GET, url);
        match auth.clear_request(&mut request).await {
            Err(LightAuthError::Protocol(reason)) => {
                assert!(reason.contains("lightauth"), "reason: {reason}")
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_discrete_without_settlement_fails_cleanly() {
        let node = Arc::new(MockNode::new());
        let addr = spawn_protected_server(discrete_route(), node.clone()).await;
        node.set_auto_settle(false);
        let auth = start_client(node)
            .await
            .with_wait_threshold(Duration::from_millis(50));

        let url: Url = format!("http://{addr}/x").parse().unwrap();
        let mut request = reqwest::Request::new(Method::GET, url);
        match auth.clear_request(&mut request).await {
            Err(LightAuthError::PaymentState(_)) => {}
            other => panic!("expected payment state error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_time_mode_request_issued_even_when_wait_expires() {
        let node = Arc::new(MockNode::new());
        let addr = spawn_protected_server(time_route(), node.clone()).await;
        node.set_auto_settle(false);
        let auth = start_client(node)
            .await
            .with_wait_threshold(Duration::from_millis(50));
        let http = reqwest::Client::new();

        // With payments never settling the wait expires, but the request is
        // still prepared and issued; the server then demands payment and the
        // client rolls its optimistic horizon back.
        let url: Url = format!("http://{addr}/x").parse().unwrap();
        let mut request = reqwest::Request::new(Method::GET, url.clone());
        auth.clear_request(&mut request).await.unwrap();
        let response = http.execute(request).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::PAYMENT_REQUIRED);

        match auth.read_response(response).await {
            Err(LightAuthError::PaymentState(reason)) => {
                assert_eq!(reason, "payment required")
            }
            other => panic!("expected payment state error, got {other:?}"),
        }

        let key = LightAuthClient::url_key(&url).unwrap();
        let path = auth.registry.get(&key).await.unwrap();
        assert_eq!(
            path.local_expiration().await,
            path.sync_expiration().await
        );
    }
}
