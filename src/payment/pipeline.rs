use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde_json::Value;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    invoice::{Invoice, InvoiceStatus, Receipt},
    wallet::UsdcWallet,
    MarketTransport,
};
use crate::{
    budget::BudgetReserve,
    chain::verifier::{SettlementVerifier, WatchOutcome, REASON_TX_ALREADY_USED},
    errors::{PaymentError, StoreError},
    observer::Observers,
    store::{
        records::{PaymentRecord, PaymentStatus},
        Store,
    },
    types::{MicroUsdc, RunId, UnixMillis},
};

const STATUS_OK: u16 = 200;
const STATUS_PAYMENT_REQUIRED: u16 = 402;

/// Holds a reservation until it is committed; releasing on drop covers
/// both error paths and cancellation at an await point (run deadline).
struct ReservationGuard {
    budget: Arc<dyn BudgetReserve>,
    handle: Option<crate::budget::ReservationHandle>,
}

impl ReservationGuard {
    fn new(budget: Arc<dyn BudgetReserve>, handle: crate::budget::ReservationHandle) -> Self {
        Self {
            budget,
            handle: Some(handle),
        }
    }

    fn commit(mut self) -> Result<(), crate::errors::BudgetError> {
        match self.handle.take() {
            Some(handle) => self.budget.commit(handle),
            None => Ok(()),
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.budget.release(handle);
        }
    }
}

/// Successful pipeline outcome: the payload plus what the request cost.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub body: Vec<u8>,
    /// Persisted payment row, absent when the gateway answered 200 without
    /// demanding payment (or served a cached/free response).
    pub payment_id: Option<u64>,
    pub cost_paid: MicroUsdc,
}

/// HTTP-402 client state machine.
///
/// One `fetch` walks: SEND -> (200 done | 402 -> parse invoice -> reserve
/// budget -> submit USDC transfer -> wait for settlement -> retry with
/// proof). Reservations are always settled before returning: committed on
/// a verified settlement, released on every failure path.
pub struct PaymentPipeline {
    transport: Arc<dyn MarketTransport>,
    budget: Arc<dyn BudgetReserve>,
    wallet: Arc<dyn UsdcWallet>,
    verifier: Arc<SettlementVerifier>,
    store: Arc<Store>,
    observers: Observers,
    invoice_ttl: Duration,
    poll_interval: Duration,
    /// Verified invoices, for idempotent replays.
    receipts: Mutex<HashMap<String, Receipt>>,
}

impl PaymentPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn MarketTransport>,
        budget: Arc<dyn BudgetReserve>,
        wallet: Arc<dyn UsdcWallet>,
        verifier: Arc<SettlementVerifier>,
        store: Arc<Store>,
        observers: Observers,
        invoice_ttl: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            budget,
            wallet,
            verifier,
            store,
            observers,
            invoice_ttl,
            poll_interval,
            receipts: Mutex::new(HashMap::new()),
        }
    }

    /// Receipt for an already-verified invoice, if any.
    pub fn receipt_for(&self, invoice_id: &str) -> Option<Receipt> {
        self.receipts
            .lock()
            .expect("receipts lock")
            .get(invoice_id)
            .cloned()
    }

    pub async fn fetch(
        &self,
        run_id: RunId,
        endpoint: &str,
        params: &Value,
    ) -> Result<Fetched, PaymentError> {
        let first = self.transport.request(endpoint, params, None).await?;
        match first.status {
            STATUS_OK => Ok(Fetched {
                body: first.body,
                payment_id: None,
                cost_paid: MicroUsdc::ZERO,
            }),
            STATUS_PAYMENT_REQUIRED => {
                let mut invoice = Invoice::parse(&first.body, self.invoice_ttl)?;
                debug!(
                    invoice_id = %invoice.id,
                    amount = %invoice.amount,
                    %endpoint,
                    "received 402 invoice"
                );
                self.settle_and_retry(run_id, endpoint, params, &mut invoice)
                    .await
            }
            status => Err(PaymentError::UpstreamError(format!(
                "unexpected gateway status {status}"
            ))),
        }
    }

    async fn settle_and_retry(
        &self,
        run_id: RunId,
        endpoint: &str,
        params: &Value,
        invoice: &mut Invoice,
    ) -> Result<Fetched, PaymentError> {
        // Idempotent replay: an invoice already VERIFIED is not paid again.
        if let Some(receipt) = self.receipt_for(invoice.id.as_str()) {
            info!(invoice_id = %invoice.id, "invoice already verified, replaying receipt");
            invoice.status = InvoiceStatus::Verified;
            return self
                .retry_with_proof(run_id, endpoint, params, invoice, &receipt, MicroUsdc::ZERO)
                .await;
        }

        let guard = match self.budget.reserve(invoice.amount) {
            Ok(handle) => ReservationGuard::new(self.budget.clone(), handle),
            Err(err) => {
                invoice.status = InvoiceStatus::Failed;
                self.append_payment(
                    run_id,
                    endpoint,
                    invoice,
                    None,
                    PaymentStatus::Failed,
                    None,
                    Some("budget_blocked".to_string()),
                );
                return Err(PaymentError::BudgetBlocked(err));
            }
        };

        let submitted = self.wallet.transfer(invoice.recipient, invoice.amount).await;
        let tx_submitted = match submitted {
            Ok(tx_hash) => tx_hash,
            Err(err) => {
                drop(guard);
                invoice.status = InvoiceStatus::Failed;
                self.append_payment(
                    run_id,
                    endpoint,
                    invoice,
                    None,
                    PaymentStatus::Failed,
                    None,
                    Some(format!("submit failed: {err}")),
                );
                return Err(PaymentError::SettlementFailed {
                    invoice: invoice.id.clone(),
                    reason: format!("transfer submission failed: {err}"),
                });
            }
        };
        invoice.status = InvoiceStatus::Submitted;

        let deadline =
            Instant::now() + invoice.remaining_ttl(OffsetDateTime::now_utc());
        let receipt = match self.await_settlement(invoice, tx_submitted, deadline).await {
            Ok(receipt) => receipt,
            Err(err) => {
                drop(guard);
                invoice.status = match err {
                    PaymentError::InvoiceExpired(_) => InvoiceStatus::Expired,
                    _ => InvoiceStatus::Failed,
                };
                self.append_payment(
                    run_id,
                    endpoint,
                    invoice,
                    Some(tx_submitted),
                    PaymentStatus::Failed,
                    None,
                    Some(err.to_string()),
                );
                return Err(err);
            }
        };

        if let Err(commit_err) = guard.commit() {
            // Settlement succeeded on-chain but the reservation vanished;
            // this indicates an administrative reset mid-flight.
            warn!(invoice_id = %invoice.id, error = %commit_err, "commit failed after settlement");
        }
        invoice.status = InvoiceStatus::Verified;
        self.receipts
            .lock()
            .expect("receipts lock")
            .insert(invoice.id.as_str().to_string(), receipt.clone());
        self.observers.notify_payment_settled(&receipt);

        self.retry_with_proof(run_id, endpoint, params, invoice, &receipt, invoice.amount)
            .await
    }

    /// WAIT_SETTLEMENT: poll until a matching transfer is confirmed, the
    /// invoice expires, or confirmations never arrive.
    async fn await_settlement(
        &self,
        invoice: &Invoice,
        tx_submitted: alloy_primitives::B256,
        deadline: Instant,
    ) -> Result<Receipt, PaymentError> {
        // The transfer we submitted is the expected settlement, but the
        // watch scan also covers replacement transactions.
        let mut candidate = Some(tx_submitted);
        loop {
            if Instant::now() >= deadline {
                return Err(PaymentError::InvoiceExpired(invoice.id.clone()));
            }
            let tx_hash = match candidate.take() {
                Some(tx) => tx,
                None => match self.verifier.watch(invoice.amount, deadline).await {
                    WatchOutcome::Settled { tx_hash } => tx_hash,
                    WatchOutcome::TimedOut => {
                        return Err(PaymentError::InvoiceExpired(invoice.id.clone()))
                    }
                },
            };

            let result = self.verifier.verify(tx_hash, invoice.amount, None).await;
            if result.verified {
                let fresh = self
                    .verifier
                    .mark_consumed(tx_hash, &invoice.id)
                    .map_err(|e| store_failure(&invoice.id, e))?;
                if !fresh {
                    return Err(PaymentError::SettlementFailed {
                        invoice: invoice.id.clone(),
                        reason: REASON_TX_ALREADY_USED.to_string(),
                    });
                }
                return Ok(Receipt {
                    invoice_id: invoice.id.clone(),
                    tx_hash,
                    sender: result.sender.unwrap_or_default(),
                    amount_observed: result.amount,
                    block_number: result.block,
                    confirmations: result.confirmations,
                    verified_at: UnixMillis::now(),
                });
            }
            match result.reason {
                Some(REASON_TX_ALREADY_USED) => {
                    return Err(PaymentError::SettlementFailed {
                        invoice: invoice.id.clone(),
                        reason: REASON_TX_ALREADY_USED.to_string(),
                    });
                }
                // Receipt not mined yet: fall back to the log watch, which
                // picks the transfer up once it lands (ours or a
                // replacement).
                Some("receipt_not_found") => {
                    candidate = None;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(PaymentError::InvoiceExpired(invoice.id.clone()));
                    }
                    tokio::time::sleep(self.poll_interval.min(remaining)).await;
                }
                // Mined but not confirmed (or transiently unobservable):
                // keep polling the same hash until the deadline.
                Some("insufficient_confirmations") | Some("rpc_unavailable") => {
                    candidate = Some(tx_hash);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(PaymentError::VerificationTimeout(invoice.id.clone()));
                    }
                    tokio::time::sleep(self.poll_interval.min(remaining)).await;
                }
                Some(reason) => {
                    return Err(PaymentError::SettlementFailed {
                        invoice: invoice.id.clone(),
                        reason: reason.to_string(),
                    });
                }
                None => {
                    return Err(PaymentError::SettlementFailed {
                        invoice: invoice.id.clone(),
                        reason: "unverified without reason".to_string(),
                    });
                }
            }
        }
    }

    /// RETRY_REQUEST: same endpoint with the settlement proof attached.
    async fn retry_with_proof(
        &self,
        run_id: RunId,
        endpoint: &str,
        params: &Value,
        invoice: &Invoice,
        receipt: &Receipt,
        cost_paid: MicroUsdc,
    ) -> Result<Fetched, PaymentError> {
        let response = self
            .transport
            .request(endpoint, params, Some(receipt.tx_hash))
            .await?;
        if response.status != STATUS_OK {
            // The settlement stands (budget already committed); only the
            // delivery failed.
            let payment_id = self.append_payment(
                run_id,
                endpoint,
                invoice,
                Some(receipt.tx_hash),
                PaymentStatus::Confirmed,
                Some(receipt),
                Some(format!("retry returned {}", response.status)),
            );
            debug!(?payment_id, status = response.status, "post-payment retry rejected");
            return Err(PaymentError::UpstreamError(format!(
                "retry with receipt returned {}",
                response.status
            )));
        }
        let payment_id = self.append_payment(
            run_id,
            endpoint,
            invoice,
            Some(receipt.tx_hash),
            PaymentStatus::Confirmed,
            Some(receipt),
            None,
        );
        Ok(Fetched {
            body: response.body,
            payment_id,
            cost_paid,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn append_payment(
        &self,
        run_id: RunId,
        endpoint: &str,
        invoice: &Invoice,
        tx_hash: Option<alloy_primitives::B256>,
        status: PaymentStatus,
        receipt: Option<&Receipt>,
        failure: Option<String>,
    ) -> Option<u64> {
        let id = match self.store.next_payment_id() {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "payment id allocation failed");
                return None;
            }
        };
        let record = PaymentRecord {
            id,
            run_id,
            endpoint: endpoint.to_string(),
            amount: invoice.amount,
            invoice_id: Some(invoice.id.clone()),
            tx_hash,
            status,
            created_at: UnixMillis::now(),
            settled_at: receipt.map(|r| r.verified_at),
            block_number: receipt.map(|r| r.block_number),
            confirmations: receipt.map(|r| r.confirmations),
            failure,
        };
        if let Err(err) = self.store.append_payment(&record) {
            warn!(error = %err, "payment row append failed");
            return None;
        }
        Some(id)
    }
}

fn store_failure(invoice: &crate::types::InvoiceId, err: StoreError) -> PaymentError {
    PaymentError::SettlementFailed {
        invoice: invoice.clone(),
        reason: format!("store failure: {err}"),
    }
}
