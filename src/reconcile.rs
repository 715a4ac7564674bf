//! Settlement reconciliation
//!
//! Two long-lived consumers translate the node's streams into ledger
//! mutations. The client-side consumer reads the payment stream: each
//! completed payment reveals a pre-image, which locates the invoice by its
//! hash, settles it and advances the path's optimistic time balance. The
//! server-side consumer reads the invoice subscription: each settled invoice
//! is located across all routes and clients, settled and, in time mode,
//! converted into an extension of the caller's authorized time.
//!
//! Both loops skip transport errors after logging them and terminate when
//! the node closes the stream.

use crate::client::path::PathRegistry;
use crate::config::Mode;
use crate::invoice::hash_preimage;
use crate::node::{InvoiceUpdate, PaymentUpdate, UpdateStream};
use crate::server::registry::ServerRegistry;
use crate::store::DataStore;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Advance an expiration horizon by one period, additively.
///
/// Credit already accumulated beyond `now` is carried over, so settling N
/// invoices always buys N periods regardless of when the settlements land.
pub fn extend_expiration(
    current: DateTime<Utc>,
    now: DateTime<Utc>,
    period: Duration,
) -> DateTime<Utc> {
    if current > now {
        now + period + (current - now)
    } else {
        now + period
    }
}

/// Consume the node's payment stream and reconcile the client-side ledger
pub fn spawn_client_reconciler(
    registry: Arc<PathRegistry>,
    store: Arc<dyn DataStore>,
    mut updates: UpdateStream<PaymentUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = updates.next().await {
            let update = match item {
                Ok(update) => update,
                Err(e) => {
                    error!("payment stream error: {e}");
                    continue;
                }
            };

            if let Some(payment_error) = update.payment_error {
                warn!("lightning payment failed: {payment_error}");
                continue;
            }

            let hash_hex = hex::encode(hash_preimage(&update.payment_preimage));
            let Some((path, invoice)) = registry.find_by_payment_hash(&hash_hex).await else {
                debug!("settlement for unknown payment hash {hash_hex}");
                continue;
            };

            match invoice.settle_with_preimage(&update.payment_preimage).await {
                Ok(true) => {
                    if let Err(e) = invoice.persist(path.invoice_owner(), store.as_ref()).await {
                        error!("could not persist settled invoice {hash_hex}: {e}");
                    }
                    if let Err(e) = path.update_balance(Utc::now(), store.as_ref()).await {
                        error!("could not persist balance for {}: {e}", path.url);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    error!("rejected settlement for {hash_hex}: {e}");
                    continue;
                }
            }

            path.notify_settlement();
        }

        info!("payment stream closed");
    })
}

/// Consume the node's invoice subscription and reconcile the server-side
/// ledger
pub fn spawn_server_reconciler(
    registry: Arc<ServerRegistry>,
    store: Arc<dyn DataStore>,
    mut updates: UpdateStream<InvoiceUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = updates.next().await {
            let update = match item {
                Ok(update) => update,
                Err(e) => {
                    error!("invoice stream error: {e}");
                    continue;
                }
            };

            if !update.settled {
                continue;
            }

            let Some((route, client, invoice)) =
                registry.find_invoice(&update.payment_request).await
            else {
                debug!(
                    "settlement for unknown payment request {}",
                    update.payment_request
                );
                continue;
            };

            // Setting `settled` twice is a no-op; the time extension runs
            // only on the transition.
            if !invoice.mark_settled().await {
                continue;
            }

            if let Err(e) = invoice.persist(client.invoice_owner(), store.as_ref()).await {
                error!(
                    "could not persist settled invoice {}: {e}",
                    update.payment_request
                );
            }

            if route.info.mode == Mode::Time {
                let now = Utc::now();
                let extended = extend_expiration(
                    client.expires_at().await,
                    now,
                    route.info.period.duration(),
                );
                client.set_expires_at(extended).await;
                if let Err(e) = client.persist(store.as_ref()).await {
                    error!("could not persist client {}: {e}", client.token);
                }
            }
        }

        info!("invoice stream closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Period, RouteConfig};
    use crate::invoice::Invoice;
    use crate::store::{MemoryStore, ServerData};
    use crate::test_utils::{init_tracing, time_path};
    use crate::AuthResult;
    use futures::stream;

    #[test]
    fn test_extension_from_expired_horizon_starts_at_now() {
        let now = Utc::now();
        let expired = now - Duration::seconds(30);
        assert_eq!(
            extend_expiration(expired, now, Duration::seconds(1)),
            now + Duration::seconds(1)
        );
    }

    #[test]
    fn test_extension_preserves_accumulated_credit() {
        // Settlements at t=0 and t=0.5s with a one-second period end at
        // t=2s absolute: the second extension builds on the first.
        let t0 = Utc::now();
        let period = Duration::seconds(1);

        let after_first = extend_expiration(t0, t0, period);
        assert_eq!(after_first, t0 + Duration::seconds(1));

        let t_half = t0 + Duration::milliseconds(500);
        let after_second = extend_expiration(after_first, t_half, period);
        assert_eq!(after_second, t0 + Duration::seconds(2));
    }

    #[test]
    fn test_n_settlements_buy_n_periods() {
        let t0 = Utc::now();
        let period = Duration::milliseconds(10);
        let mut horizon = t0;
        for _ in 0..5 {
            horizon = extend_expiration(horizon, t0, period);
        }
        assert_eq!(horizon, t0 + Duration::milliseconds(50));
    }

    #[tokio::test]
    async fn test_client_reconciler_settles_and_extends() {
        init_tracing();
        let store: Arc<dyn crate::store::DataStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(PathRegistry::default());
        let path = registry.insert(Arc::new(time_path("example.com/x", Period::Second))).await;

        let preimage = b"reconciler test preimage bytes!!".to_vec();
        let invoice = Arc::new(Invoice::new(
            "lnbc1".to_string(),
            hash_preimage(&preimage),
            1,
            Utc::now() + Duration::minutes(59),
        ));
        path.add_invoice(invoice.clone()).await;

        let updates: Vec<AuthResult<PaymentUpdate>> = vec![
            // A failed payment is logged and skipped.
            Ok(PaymentUpdate {
                payment_error: Some("no route".to_string()),
                payment_preimage: Vec::new(),
            }),
            // A settlement for a hash no path holds is skipped.
            Ok(PaymentUpdate {
                payment_error: None,
                payment_preimage: b"some unrelated preimage material".to_vec(),
            }),
            Ok(PaymentUpdate {
                payment_error: None,
                payment_preimage: preimage.clone(),
            }),
            // A duplicate settlement must not extend the balance again.
            Ok(PaymentUpdate {
                payment_error: None,
                payment_preimage: preimage.clone(),
            }),
        ];

        let before = Utc::now();
        spawn_client_reconciler(
            registry.clone(),
            store.clone(),
            stream::iter(updates).boxed(),
        )
        .await
        .unwrap();

        assert!(invoice.is_settled().await);
        assert_eq!(invoice.preimage().await.unwrap(), preimage);

        let horizon = path.local_expiration().await;
        assert!(horizon > before);
        // One extension only, despite the duplicate event.
        assert!(horizon <= before + Duration::seconds(2));
    }

    #[tokio::test]
    async fn test_server_reconciler_extends_once() {
        init_tracing();
        let store: Arc<dyn crate::store::DataStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(
            ServerRegistry::load(
                ServerData::default(),
                [RouteConfig {
                    name: "GET/x".to_string(),
                    fee: 1,
                    max_invoices: 3,
                    mode: Mode::Time,
                    period: Period::Minute,
                }],
                store.as_ref(),
            )
            .await
            .unwrap(),
        );
        let route = registry.route_for("GET", "/x").await.unwrap();
        let client = route.create_client(store.as_ref()).await.unwrap();

        let invoice = Arc::new(Invoice::new(
            "lnbc1".to_string(),
            vec![0u8; 32],
            1,
            Utc::now() + Duration::minutes(59),
        ));
        client.add_invoice(invoice.clone()).await;

        let updates: Vec<AuthResult<InvoiceUpdate>> = vec![
            Ok(InvoiceUpdate {
                payment_request: "lnbc1".to_string(),
                settled: false,
            }),
            Ok(InvoiceUpdate {
                payment_request: "lnbc1".to_string(),
                settled: true,
            }),
            Ok(InvoiceUpdate {
                payment_request: "lnbc1".to_string(),
                settled: true,
            }),
        ];

        let before = Utc::now();
        spawn_server_reconciler(
            registry.clone(),
            store.clone(),
            stream::iter(updates).boxed(),
        )
        .await
        .unwrap();

        assert!(invoice.is_settled().await);
        let horizon = client.expires_at().await;
        assert!(horizon >= before + Duration::seconds(59));
        assert!(horizon <= before + Duration::minutes(1) + Duration::seconds(1));
    }
}
