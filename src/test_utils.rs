//! Shared test fixtures: an in-process Lightning node and ledger helpers

use crate::client::path::Path;
use crate::config::{Mode, Period};
use crate::invoice::hash_preimage;
use crate::node::{
    AddedInvoice, DecodedPayReq, InvoiceUpdate, LightningNode, PaymentUpdate, SendRequest,
    UpdateStream,
};
use crate::{AuthResult, LightAuthError};
use async_trait::async_trait;
use chrono::Utc;
use rand::RngCore;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

/// Install a tracing subscriber for the current test binary, so `RUST_LOG`
/// surfaces reconciler and middleware activity. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct MockInvoice {
    preimage: Vec<u8>,
}

struct MockState {
    invoices: HashMap<String, MockInvoice>,
    counter: u64,
}

/// An in-process node: every payment settles immediately and is reported on
/// both the payment stream and the invoice subscription, like a node that is
/// simultaneously payer and payee.
pub struct MockNode {
    state: Mutex<MockState>,
    auto_settle: std::sync::atomic::AtomicBool,
    payment_tx: UnboundedSender<AuthResult<PaymentUpdate>>,
    payment_rx: Mutex<Option<UnboundedReceiver<AuthResult<PaymentUpdate>>>>,
    invoice_tx: UnboundedSender<AuthResult<InvoiceUpdate>>,
    invoice_rx: Mutex<Option<UnboundedReceiver<AuthResult<InvoiceUpdate>>>>,
}

impl MockNode {
    pub fn new() -> Self {
        let (payment_tx, payment_rx) = unbounded_channel();
        let (invoice_tx, invoice_rx) = unbounded_channel();
        Self {
            state: Mutex::new(MockState {
                invoices: HashMap::new(),
                counter: 0,
            }),
            auto_settle: std::sync::atomic::AtomicBool::new(true),
            payment_tx,
            payment_rx: Mutex::new(Some(payment_rx)),
            invoice_tx,
            invoice_rx: Mutex::new(Some(invoice_rx)),
        }
    }

    /// When disabled, submitted payments are accepted but never settle
    pub fn set_auto_settle(&self, enabled: bool) {
        self.auto_settle
            .store(enabled, std::sync::atomic::Ordering::SeqCst);
    }

    /// Report an invoice as settled on the invoice subscription only, as if
    /// some other wallet paid it.
    pub async fn settle_out_of_band(&self, payment_request: &str) {
        let _ = self.invoice_tx.send(Ok(InvoiceUpdate {
            payment_request: payment_request.to_string(),
            settled: true,
        }));
    }

    /// The pre-image behind an issued invoice, as the paying wallet would
    /// learn it
    pub async fn preimage_of(&self, payment_request: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .invoices
            .get(payment_request)
            .map(|i| i.preimage.clone())
    }

    fn take_stream<T: Send + 'static>(
        rx: Option<UnboundedReceiver<AuthResult<T>>>,
    ) -> AuthResult<UpdateStream<T>> {
        let rx = rx.ok_or_else(|| LightAuthError::Node("stream already taken".to_string()))?;
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

#[async_trait]
impl LightningNode for MockNode {
    async fn add_invoice(&self, value_sat: u64) -> AuthResult<AddedInvoice> {
        let _ = value_sat;
        let mut state = self.state.lock().await;
        state.counter += 1;

        let mut preimage = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage);
        let r_hash = hash_preimage(&preimage);
        let payment_request = format!("lnmock{}", state.counter);

        state
            .invoices
            .insert(payment_request.clone(), MockInvoice { preimage });

        Ok(AddedInvoice {
            payment_request,
            r_hash,
        })
    }

    async fn decode_pay_req(&self, payment_request: &str) -> AuthResult<DecodedPayReq> {
        let state = self.state.lock().await;
        let invoice = state
            .invoices
            .get(payment_request)
            .ok_or_else(|| LightAuthError::Node(format!("unknown invoice {payment_request}")))?;
        Ok(DecodedPayReq {
            payment_hash: hex::encode(hash_preimage(&invoice.preimage)),
        })
    }

    async fn send_payment(&self, request: SendRequest) -> AuthResult<()> {
        if !self.auto_settle.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        let preimage = {
            let state = self.state.lock().await;
            state
                .invoices
                .get(&request.payment_request)
                .ok_or_else(|| {
                    LightAuthError::Node(format!("unknown invoice {}", request.payment_request))
                })?
                .preimage
                .clone()
        };

        let _ = self.payment_tx.send(Ok(PaymentUpdate {
            payment_error: None,
            payment_preimage: preimage,
        }));
        let _ = self.invoice_tx.send(Ok(InvoiceUpdate {
            payment_request: request.payment_request,
            settled: true,
        }));
        Ok(())
    }

    async fn payment_updates(&self) -> AuthResult<UpdateStream<PaymentUpdate>> {
        Self::take_stream(self.payment_rx.lock().await.take())
    }

    async fn invoice_updates(&self) -> AuthResult<UpdateStream<InvoiceUpdate>> {
        Self::take_stream(self.invoice_rx.lock().await.take())
    }
}

/// A time-mode path whose horizons start at `now`
pub fn time_path(url: &str, period: Period) -> Path {
    Path::new(
        url.to_string(),
        "tok".to_string(),
        Mode::Time,
        period,
        1,
        3,
        Utc::now(),
    )
}

/// Poll `cond` until it holds, for at most one second
pub async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within one second");
}
