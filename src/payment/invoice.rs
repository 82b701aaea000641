use std::time::Duration;

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    errors::PaymentError,
    types::{InvoiceId, MicroUsdc, UnixMillis},
};

/// Wire shape of a 402 response body.
#[derive(Debug, Deserialize)]
struct InvoiceBody {
    invoice_id: String,
    amount_usdc: f64,
    payment_address: String,
    expires_at: String,
    endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Pending,
    Submitted,
    Verified,
    Expired,
    Failed,
}

/// Server-issued payment demand from a 402 response.
#[derive(Debug, Clone, PartialEq)]
pub struct Invoice {
    pub id: InvoiceId,
    pub amount: MicroUsdc,
    pub recipient: Address,
    pub endpoint: String,
    pub created_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub status: InvoiceStatus,
}

impl Invoice {
    /// Parse a 402 body. The effective expiry is the earlier of the
    /// server-declared `expires_at` and `created_at + max_ttl`.
    pub fn parse(body: &[u8], max_ttl: Duration) -> Result<Invoice, PaymentError> {
        let body: InvoiceBody = serde_json::from_slice(body)
            .map_err(|e| PaymentError::UpstreamError(format!("malformed invoice: {e}")))?;
        if body.invoice_id.is_empty() {
            return Err(PaymentError::UpstreamError(
                "malformed invoice: empty invoice_id".to_string(),
            ));
        }
        let amount = MicroUsdc::from_usdc(body.amount_usdc).ok_or_else(|| {
            PaymentError::UpstreamError(format!(
                "malformed invoice: bad amount {}",
                body.amount_usdc
            ))
        })?;
        let recipient: Address = body.payment_address.parse().map_err(|_| {
            PaymentError::UpstreamError(format!(
                "malformed invoice: bad payment_address {}",
                body.payment_address
            ))
        })?;
        let server_expiry = OffsetDateTime::parse(&body.expires_at, &Rfc3339).map_err(|_| {
            PaymentError::UpstreamError(format!(
                "malformed invoice: bad expires_at {}",
                body.expires_at
            ))
        })?;
        let created_at = OffsetDateTime::now_utc();
        let expires_at = server_expiry.min(created_at + max_ttl);
        Ok(Invoice {
            id: InvoiceId::new(body.invoice_id),
            amount,
            recipient,
            endpoint: body.endpoint,
            created_at,
            expires_at,
            status: InvoiceStatus::Pending,
        })
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self, now: OffsetDateTime) -> Duration {
        let remaining = self.expires_at - now;
        if remaining.is_negative() {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(remaining.as_seconds_f64())
        }
    }
}

/// Client-side record of a verified on-chain settlement. The observed
/// amount may exceed the invoice amount; the excess is not refunded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub invoice_id: InvoiceId,
    pub tx_hash: B256,
    pub sender: Address,
    pub amount_observed: MicroUsdc,
    pub block_number: u64,
    pub confirmations: u64,
    pub verified_at: UnixMillis,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(amount: f64, expires_in_secs: i64) -> Vec<u8> {
        let expires = OffsetDateTime::now_utc() + Duration::from_secs(expires_in_secs as u64);
        serde_json::to_vec(&serde_json::json!({
            "invoice_id": "inv-123",
            "amount_usdc": amount,
            "payment_address": "0x00000000000000000000000000000000000000bb",
            "expires_at": expires.format(&Rfc3339).unwrap(),
            "endpoint": "liquidity_depth",
        }))
        .unwrap()
    }

    #[test]
    fn parses_valid_invoice() {
        let invoice = Invoice::parse(&body(0.25, 600), Duration::from_secs(900)).unwrap();
        assert_eq!(invoice.id, InvoiceId::new("inv-123"));
        assert_eq!(invoice.amount, MicroUsdc::new(250_000));
        assert_eq!(invoice.endpoint, "liquidity_depth");
        assert!(!invoice.is_expired(OffsetDateTime::now_utc()));
    }

    #[test]
    fn expiry_is_capped_by_ttl() {
        // Server says one hour; local cap is 900 s.
        let invoice = Invoice::parse(&body(0.25, 3600), Duration::from_secs(900)).unwrap();
        let ttl = invoice.remaining_ttl(OffsetDateTime::now_utc());
        assert!(ttl <= Duration::from_secs(900));
        assert!(ttl > Duration::from_secs(890));
    }

    #[test]
    fn rejects_malformed_body() {
        let err = Invoice::parse(b"not json", Duration::from_secs(900)).unwrap_err();
        assert!(matches!(err, PaymentError::UpstreamError(_)));
    }

    #[test]
    fn rejects_negative_amount() {
        let err = Invoice::parse(&body(-0.25, 600), Duration::from_secs(900)).unwrap_err();
        assert!(matches!(err, PaymentError::UpstreamError(_)));
    }

    #[test]
    fn rejects_bad_address() {
        let raw = serde_json::to_vec(&serde_json::json!({
            "invoice_id": "inv-1",
            "amount_usdc": 0.25,
            "payment_address": "not-an-address",
            "expires_at": "2030-01-01T00:00:00Z",
            "endpoint": "spot_price",
        }))
        .unwrap();
        assert!(Invoice::parse(&raw, Duration::from_secs(900)).is_err());
    }
}
