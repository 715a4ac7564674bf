//! Server middleware: token issuance, invoice emission and payment
//! validation
//!
//! The middleware wraps opaque application handlers. Requests to routes the
//! configuration does not name pass through untouched. For configured
//! routes, every response carries the route's constant headers, the caller's
//! token and the caller's currently-unsettled invoices, so the next request
//! can always carry payment; then the mode-specific validator decides
//! whether the wrapped handler runs.
//!
//! Attach it to an axum router with
//! [`axum::middleware::from_fn_with_state`]:
//!
//! ```ignore
//! let app = Router::new()
//!     .route("/x", get(handler))
//!     .layer(middleware::from_fn_with_state(server.clone(), lightauth::server::middleware));
//! ```

pub mod registry;

use crate::config::{Config, Mode};
use crate::headers::{self, InvoiceListing};
use crate::invoice::{ClaimOutcome, Invoice};
use crate::node::LightningNode;
use crate::reconcile::spawn_server_reconciler;
use crate::store::DataStore;
use crate::AuthResult;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{Duration, Utc};
use registry::{Client, Route, ServerRegistry};
use std::sync::Arc;
use tracing::{debug, error, warn};

const INVALID_TOKEN: &str = "Lightauth error: Invalid token";
const TIME_EXPIRED: &str =
    "Lightauth error: Your authorized time has expired, pay up some balances to buy more time";
const INVALID_CREDENTIALS: &str = "Lightauth error: Invalid credentials";
const MISSING_INVOICE: &str = "Lightauth error: Missing invoice ID";
const MISSING_PRE_IMAGE: &str = "Lightauth error: Missing pre_image";
const TRY_AGAIN: &str = "Lightauth error: We can't validate your payment yet, please try again";
const INVOICE_ALREADY_CLAIMED: &str = "Lightauth error: Invoice has already been claimed";
const SOMETHING_WENT_WRONG: &str = "Something went wrong";

/// How far in the future issued invoices expire
const INVOICE_LIFETIME_MINUTES: i64 = 59;

/// Server half of the protocol: route table, store and node handles
#[derive(Clone)]
pub struct LightAuthServer {
    registry: Arc<ServerRegistry>,
    store: Arc<dyn DataStore>,
    node: Arc<dyn LightningNode>,
}

impl LightAuthServer {
    /// Load persisted server state, seed routes from the configuration and
    /// start the settlement reconciler
    pub async fn start(
        config: &Config,
        store: Arc<dyn DataStore>,
        node: Arc<dyn LightningNode>,
    ) -> AuthResult<Self> {
        config.validate()?;

        let data = store.server_data().await?;
        let registry = Arc::new(
            ServerRegistry::load(data, config.routes.values().cloned(), store.as_ref()).await?,
        );

        let updates = node.invoice_updates().await?;
        spawn_server_reconciler(registry.clone(), store.clone(), updates);

        Ok(Self {
            registry,
            store,
            node,
        })
    }

    /// The route table, for inspection
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Top up a caller's unsettled invoices to the route's `max_invoices`,
    /// returning everything currently unpaid.
    ///
    /// A node failure is tolerated: the shortfall stays and the invoices
    /// already issued are still returned. A store failure drops only the
    /// affected invoice.
    async fn replenish_invoices(
        &self,
        route: &Route,
        client: &Client,
    ) -> Vec<Arc<Invoice>> {
        let mut unpaid = client.unpaid_invoices().await;

        while unpaid.len() < route.info.max_invoices {
            let added = match self.node.add_invoice(route.info.fee).await {
                Ok(added) => added,
                Err(e) => {
                    warn!("could not generate an invoice on the lightning node: {e}");
                    break;
                }
            };

            let invoice = Arc::new(Invoice::new(
                added.payment_request,
                added.r_hash,
                route.info.fee,
                Utc::now() + Duration::minutes(INVOICE_LIFETIME_MINUTES),
            ));

            if let Err(e) = invoice
                .persist(client.invoice_owner(), self.store.as_ref())
                .await
            {
                warn!(
                    "dropping invoice {} that could not be persisted: {e}",
                    invoice.payment_request
                );
                continue;
            }

            client.add_invoice(invoice.clone()).await;
            unpaid.push(invoice);
        }

        unpaid
    }

    /// Emit the per-caller headers: token, unsettled invoices and, in time
    /// mode, the authorized-time horizon
    async fn client_headers(
        &self,
        emitted: &mut HeaderMap,
        route: &Route,
        client: &Client,
    ) -> AuthResult<()> {
        let unpaid = self.replenish_invoices(route, client).await;

        let mut listings = Vec::with_capacity(unpaid.len());
        for invoice in &unpaid {
            listings.push(InvoiceListing {
                payment_request: invoice.payment_request.clone(),
                expiration_time: invoice.expires_at,
            });
        }

        emitted.insert(headers::TOKEN, headers::header_value(&client.token)?);
        emitted.insert(
            headers::INVOICES,
            headers::header_value(&headers::encode_invoices(&listings)?)?,
        );

        if route.info.mode == Mode::Time {
            emitted.insert(
                headers::EXPIRATION_TIME,
                headers::header_value(&headers::format_timestamp(client.expires_at().await))?,
            );
        }

        Ok(())
    }
}

fn constant_headers(emitted: &mut HeaderMap, route: &Route) -> AuthResult<()> {
    emitted.insert(headers::NAME, headers::header_value(&route.info.name)?);
    emitted.insert(
        headers::MODE,
        headers::header_value(&route.info.mode.to_string())?,
    );
    emitted.insert(
        headers::FEE,
        headers::header_value(&route.info.fee.to_string())?,
    );
    emitted.insert(
        headers::MAX_INVOICES,
        headers::header_value(&route.info.max_invoices.to_string())?,
    );

    if route.info.mode == Mode::Time {
        emitted.insert(
            headers::TIME_PERIOD,
            headers::header_value(&route.info.period.to_string())?,
        );
    }

    Ok(())
}

/// Merge the emitted protocol headers into a response and mirror its status
/// into `Light-Auth-Status`
fn finish(mut response: Response, emitted: &HeaderMap) -> Response {
    let status = response.status();
    let response_headers = response.headers_mut();
    for (name, value) in emitted.iter() {
        response_headers.insert(name.clone(), value.clone());
    }
    response_headers.insert(headers::STATUS, HeaderValue::from(status.as_u16()));
    response
}

fn deny(status: StatusCode, body: &str, emitted: &HeaderMap) -> Response {
    finish((status, body.to_owned()).into_response(), emitted)
}

/// The lightauth middleware. Wraps the downstream handler; requests to
/// unconfigured routes pass through unchanged.
pub async fn middleware(
    State(server): State<LightAuthServer>,
    request: Request,
    next: Next,
) -> Response {
    let Some(route) = server
        .registry
        .route_for(request.method().as_str(), request.uri().path())
        .await
    else {
        return next.run(request).await;
    };

    let token = headers::read_header(request.headers(), &headers::TOKEN).to_string();
    let client = if token.is_empty() {
        match route.create_client(server.store.as_ref()).await {
            Ok(client) => Some(client),
            Err(e) => {
                error!("could not create a client ledger: {e}");
                return deny(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    SOMETHING_WENT_WRONG,
                    &HeaderMap::new(),
                );
            }
        }
    } else {
        route.client(&token).await
    };

    let mut emitted = HeaderMap::new();
    if let Err(e) = constant_headers(&mut emitted, &route) {
        error!("could not emit route headers: {e}");
        return deny(
            StatusCode::INTERNAL_SERVER_ERROR,
            SOMETHING_WENT_WRONG,
            &emitted,
        );
    }

    let Some(client) = client else {
        return deny(StatusCode::BAD_REQUEST, INVALID_TOKEN, &emitted);
    };

    if let Err(e) = server.client_headers(&mut emitted, &route, &client).await {
        error!("could not emit client headers: {e}");
        return deny(
            StatusCode::INTERNAL_SERVER_ERROR,
            SOMETHING_WENT_WRONG,
            &emitted,
        );
    }

    match route.info.mode {
        Mode::Time => time_validator(&client, emitted, request, next).await,
        Mode::Discrete => discrete_validator(&server, &client, emitted, request, next).await,
    }
}

/// Time mode: the request is authorized while the caller's horizon lies in
/// the future. The validator never advances the horizon; only the
/// settlement reconciler does.
async fn time_validator(
    client: &Client,
    emitted: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    if client.expires_at().await < Utc::now() {
        return deny(StatusCode::PAYMENT_REQUIRED, TIME_EXPIRED, &emitted);
    }

    finish(next.run(request).await, &emitted)
}

/// Discrete mode: the request must claim a settled, unclaimed invoice by
/// revealing its pre-image. An already-claimed invoice is reported before a
/// not-yet-settled one so a replay is never told to retry.
async fn discrete_validator(
    server: &LightAuthServer,
    client: &Client,
    mut emitted: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let payment_request =
        headers::read_header(request.headers(), &headers::INVOICE).to_string();
    if payment_request.is_empty() {
        return deny(StatusCode::BAD_REQUEST, MISSING_INVOICE, &emitted);
    }

    let preimage_hex = headers::read_header(request.headers(), &headers::PRE_IMAGE).to_string();
    if preimage_hex.is_empty() {
        return deny(StatusCode::BAD_REQUEST, MISSING_PRE_IMAGE, &emitted);
    }

    let Some(invoice) = client.invoice(&payment_request).await else {
        return deny(StatusCode::BAD_REQUEST, INVALID_CREDENTIALS, &emitted);
    };

    let Ok(preimage) = hex::decode(&preimage_hex) else {
        return deny(StatusCode::BAD_REQUEST, INVALID_CREDENTIALS, &emitted);
    };

    if crate::invoice::hash_preimage(&preimage) != invoice.payment_hash {
        return deny(StatusCode::BAD_REQUEST, INVALID_CREDENTIALS, &emitted);
    }

    match invoice.try_claim().await {
        ClaimOutcome::AlreadyClaimed => {
            deny(StatusCode::BAD_REQUEST, INVOICE_ALREADY_CLAIMED, &emitted)
        }
        ClaimOutcome::NotSettled => deny(StatusCode::CONFLICT, TRY_AGAIN, &emitted),
        ClaimOutcome::Claimed => {
            if let Err(e) = invoice
                .persist(client.invoice_owner(), server.store.as_ref())
                .await
            {
                error!(
                    "could not persist claim of {}: {e}",
                    invoice.payment_request
                );
            }

            match headers::header_value(&payment_request) {
                Ok(value) => {
                    emitted.insert(headers::INVOICE, value);
                }
                Err(e) => debug!("could not echo claimed invoice: {e}"),
            }

            finish(next.run(request).await, &emitted)
        }
    }
}
