//! Per-invoice state and lifecycle
//!
//! An invoice is issued by the server, settled when the node observes payment
//! and, in discrete mode, claimed when the server consumes it to authorize a
//! request. `settled` is monotonic and `claimed` implies `settled`; whenever a
//! pre-image is held, its SHA-256 equals the payment hash.

use crate::store::{DataStore, InvoiceOwner, InvoiceRecord, Record};
use crate::{AuthResult, LightAuthError};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

/// Compute the payment hash of a pre-image
pub fn hash_preimage(preimage: &[u8]) -> Vec<u8> {
    Sha256::digest(preimage).to_vec()
}

/// Outcome of an atomic claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The invoice was settled and unclaimed; it is now claimed
    Claimed,
    /// The invoice had already been claimed
    AlreadyClaimed,
    /// The node has not reported settlement yet
    NotSettled,
}

#[derive(Debug, Default)]
struct State {
    settled: bool,
    claimed: bool,
    preimage: Option<Vec<u8>>,
    record_id: Option<String>,
}

/// The unit of payment
#[derive(Debug)]
pub struct Invoice {
    /// Bech32 payment request issued by the node
    pub payment_request: String,
    /// 32-byte payment hash
    pub payment_hash: Vec<u8>,
    /// Satoshi value
    pub fee: u64,
    /// When the invoice stops being payable
    pub expires_at: DateTime<Utc>,
    state: Mutex<State>,
}

impl Invoice {
    /// Create a freshly-issued, unsettled invoice
    pub fn new(
        payment_request: String,
        payment_hash: Vec<u8>,
        fee: u64,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payment_request,
            payment_hash,
            fee,
            expires_at,
            state: Mutex::new(State::default()),
        }
    }

    /// Rebuild an invoice from its durable form
    pub fn from_record(record: &InvoiceRecord) -> AuthResult<Self> {
        let payment_hash = hex::decode(&record.payment_hash).map_err(|e| {
            LightAuthError::Store(format!("corrupt payment hash in store: {e}"))
        })?;
        let preimage = record
            .preimage
            .as_deref()
            .map(hex::decode)
            .transpose()
            .map_err(|e| LightAuthError::Store(format!("corrupt pre-image in store: {e}")))?;

        Ok(Self {
            payment_request: record.payment_request.clone(),
            payment_hash,
            fee: record.fee,
            expires_at: record.expires_at,
            state: Mutex::new(State {
                settled: record.settled,
                claimed: record.claimed,
                preimage,
                record_id: record.id.clone(),
            }),
        })
    }

    /// Lower-case hex form of the payment hash
    pub fn hash_hex(&self) -> String {
        hex::encode(&self.payment_hash)
    }

    /// Whether the node has observed the invoice as paid
    pub async fn is_settled(&self) -> bool {
        self.state.lock().await.settled
    }

    /// Whether the server consumed the invoice
    pub async fn is_claimed(&self) -> bool {
        self.state.lock().await.claimed
    }

    /// Whether the invoice is past its payable window
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// The pre-image, if settlement revealed one
    pub async fn preimage(&self) -> Option<Vec<u8>> {
        self.state.lock().await.preimage.clone()
    }

    /// Mark the invoice settled with the revealed pre-image.
    ///
    /// Returns `true` on the unsettled-to-settled transition, `false` when
    /// the invoice was already settled. Fails if the pre-image does not hash
    /// to the payment hash.
    pub async fn settle_with_preimage(&self, preimage: &[u8]) -> AuthResult<bool> {
        if hash_preimage(preimage) != self.payment_hash {
            return Err(LightAuthError::Corruption(format!(
                "pre-image does not match payment hash {}",
                self.hash_hex()
            )));
        }

        let mut state = self.state.lock().await;
        if state.settled {
            return Ok(false);
        }
        state.settled = true;
        state.preimage = Some(preimage.to_vec());
        Ok(true)
    }

    /// Mark the invoice settled without a pre-image (server side learns of
    /// settlement from the node's invoice stream, which does not carry one).
    ///
    /// Returns `true` only on the unsettled-to-settled transition.
    pub async fn mark_settled(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.settled {
            return false;
        }
        state.settled = true;
        true
    }

    /// Atomically attempt to claim the invoice.
    ///
    /// An already-claimed invoice reports [`ClaimOutcome::AlreadyClaimed`]
    /// even when it is also settled; the caller relies on that precedence.
    pub async fn try_claim(&self) -> ClaimOutcome {
        let mut state = self.state.lock().await;
        if state.claimed {
            return ClaimOutcome::AlreadyClaimed;
        }
        if !state.settled {
            return ClaimOutcome::NotSettled;
        }
        state.claimed = true;
        ClaimOutcome::Claimed
    }

    /// Snapshot the invoice into its durable form
    pub async fn record(&self, owner: InvoiceOwner) -> InvoiceRecord {
        let state = self.state.lock().await;
        InvoiceRecord {
            id: state.record_id.clone(),
            owner,
            payment_request: self.payment_request.clone(),
            payment_hash: self.hash_hex(),
            fee: self.fee,
            settled: state.settled,
            claimed: state.claimed,
            preimage: state.preimage.as_deref().map(hex::encode),
            expires_at: self.expires_at,
        }
    }

    /// Persist the invoice: create on first save, edit afterwards
    pub async fn persist(&self, owner: InvoiceOwner, store: &dyn DataStore) -> AuthResult<()> {
        let record = self.record(owner).await;
        if record.id.is_some() {
            store.edit(Record::Invoice(record)).await
        } else {
            let id = store.create(Record::Invoice(record)).await?;
            self.state.lock().await.record_id = Some(id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::Duration;

    fn test_invoice() -> (Invoice, Vec<u8>) {
        let preimage = b"super secret pre-image, 32 bytes".to_vec();
        let hash = hash_preimage(&preimage);
        let invoice = Invoice::new(
            "lnbc10n1test".to_string(),
            hash,
            10,
            Utc::now() + Duration::minutes(59),
        );
        (invoice, preimage)
    }

    #[tokio::test]
    async fn test_settle_validates_preimage() {
        let (invoice, preimage) = test_invoice();

        assert!(invoice.settle_with_preimage(b"wrong").await.is_err());
        assert!(!invoice.is_settled().await);

        assert!(invoice.settle_with_preimage(&preimage).await.unwrap());
        assert!(invoice.is_settled().await);
        assert_eq!(invoice.preimage().await.unwrap(), preimage);
    }

    #[tokio::test]
    async fn test_settlement_is_idempotent() {
        let (invoice, preimage) = test_invoice();
        assert!(invoice.settle_with_preimage(&preimage).await.unwrap());
        assert!(!invoice.settle_with_preimage(&preimage).await.unwrap());
        assert!(invoice.is_settled().await);

        assert!(!invoice.mark_settled().await);
    }

    #[tokio::test]
    async fn test_claim_requires_settlement() {
        let (invoice, preimage) = test_invoice();

        assert_eq!(invoice.try_claim().await, ClaimOutcome::NotSettled);
        assert!(!invoice.is_claimed().await);

        invoice.settle_with_preimage(&preimage).await.unwrap();
        assert_eq!(invoice.try_claim().await, ClaimOutcome::Claimed);
        assert!(invoice.is_claimed().await);
    }

    #[tokio::test]
    async fn test_already_claimed_takes_precedence() {
        let (invoice, preimage) = test_invoice();
        invoice.settle_with_preimage(&preimage).await.unwrap();
        invoice.try_claim().await;

        // A replayed claim must be told "already claimed", not "try again".
        assert_eq!(invoice.try_claim().await, ClaimOutcome::AlreadyClaimed);
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let (invoice, _) = test_invoice();
        assert!(!invoice.is_expired(Utc::now()));
        assert!(invoice.is_expired(invoice.expires_at + Duration::seconds(1)));
    }

    #[tokio::test]
    async fn test_persist_creates_then_edits() {
        let (invoice, preimage) = test_invoice();
        let store = MemoryStore::new();
        let owner = InvoiceOwner::Path {
            url: "example.com/x".to_string(),
        };

        invoice.persist(owner.clone(), &store).await.unwrap();
        assert_eq!(store.invoice_count().await, 1);

        invoice.settle_with_preimage(&preimage).await.unwrap();
        invoice.persist(owner, &store).await.unwrap();
        assert_eq!(store.invoice_count().await, 1);
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let (invoice, preimage) = test_invoice();
        invoice.settle_with_preimage(&preimage).await.unwrap();

        let owner = InvoiceOwner::Path {
            url: "example.com/x".to_string(),
        };
        let record = invoice.record(owner).await;
        let restored = Invoice::from_record(&record).unwrap();

        assert_eq!(restored.payment_request, invoice.payment_request);
        assert_eq!(restored.payment_hash, invoice.payment_hash);
        assert!(restored.is_settled().await);
        assert_eq!(restored.preimage().await.unwrap(), preimage);
    }
}
