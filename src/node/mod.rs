//! Lightning node port
//!
//! A thin contract over the node: issue invoices, decode payment requests,
//! submit payments on the node's bidirectional payment stream and subscribe
//! to invoice updates. The gRPC/TLS transport to a real node lives behind
//! this trait; the dial parameters come from [`crate::Config`].
//!
//! `send_payment` enqueues a payment and returns; settlement is reported
//! asynchronously on the [`payment_updates`](LightningNode::payment_updates)
//! stream. Stream items are `Err` for transport errors the consumer should
//! log and skip; the end of a stream means the node closed it.

use crate::AuthResult;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// A freshly-issued invoice, as returned by the node
#[derive(Debug, Clone)]
pub struct AddedInvoice {
    /// Bech32 payment request
    pub payment_request: String,
    /// 32-byte payment hash
    pub r_hash: Vec<u8>,
}

/// Decoded payment request
#[derive(Debug, Clone)]
pub struct DecodedPayReq {
    /// Lower-case hex payment hash
    pub payment_hash: String,
}

/// A payment to submit on the payment stream
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// Invoice to pay
    pub payment_request: String,
    /// Amount in satoshi
    pub amount_sat: u64,
}

/// One response from the node's payment stream
#[derive(Debug, Clone)]
pub struct PaymentUpdate {
    /// Failure reported by the node, if the payment did not complete
    pub payment_error: Option<String>,
    /// 32-byte pre-image revealed by a completed payment
    pub payment_preimage: Vec<u8>,
}

/// One update from the node's invoice subscription
#[derive(Debug, Clone)]
pub struct InvoiceUpdate {
    /// The invoice's payment request
    pub payment_request: String,
    /// Whether the node has observed the invoice as paid
    pub settled: bool,
}

/// Stream of updates from the node; items are transport results
pub type UpdateStream<T> = BoxStream<'static, AuthResult<T>>;

/// Contract over the Lightning node
#[async_trait]
pub trait LightningNode: Send + Sync + 'static {
    /// Issue a new invoice for `value_sat` satoshi
    async fn add_invoice(&self, value_sat: u64) -> AuthResult<AddedInvoice>;

    /// Decode a payment request into its payment hash
    async fn decode_pay_req(&self, payment_request: &str) -> AuthResult<DecodedPayReq>;

    /// Submit a payment on the payment stream without waiting for settlement
    async fn send_payment(&self, request: SendRequest) -> AuthResult<()>;

    /// Responses to payments submitted with
    /// [`send_payment`](LightningNode::send_payment)
    async fn payment_updates(&self) -> AuthResult<UpdateStream<PaymentUpdate>>;

    /// Settlement updates for invoices this node issued
    async fn invoice_updates(&self) -> AuthResult<UpdateStream<InvoiceUpdate>>;
}
