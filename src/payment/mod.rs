pub mod invoice;
pub mod pipeline;
pub mod wallet;

use alloy_primitives::B256;
use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::errors::PaymentError;

/// Raw response from the market-data gateway.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Transport seam for gateway requests. The production implementation is
/// HTTP; tests drive the pipeline with scripted responses.
#[async_trait]
pub trait MarketTransport: Send + Sync {
    /// Issue one request. `proof` carries the settlement hash on the
    /// post-payment retry.
    async fn request(
        &self,
        endpoint: &str,
        params: &Value,
        proof: Option<B256>,
    ) -> Result<GatewayResponse, PaymentError>;
}

/// HTTP transport against the configured gateway base URL. The retry
/// request carries the proof both as the `X-Payment-Receipt` header and as
/// a `payment_proof` body field; the server accepts either.
pub struct HttpTransport {
    http: reqwest::Client,
    base: Url,
}

impl HttpTransport {
    pub fn new(base: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base,
        }
    }
}

#[async_trait]
impl MarketTransport for HttpTransport {
    async fn request(
        &self,
        endpoint: &str,
        params: &Value,
        proof: Option<B256>,
    ) -> Result<GatewayResponse, PaymentError> {
        let url = self
            .base
            .join(endpoint)
            .map_err(|e| PaymentError::UpstreamError(e.to_string()))?;
        let mut body = params.clone();
        if let (Some(proof), Some(map)) = (proof, body.as_object_mut()) {
            map.insert(
                "payment_proof".to_string(),
                Value::String(format!("{proof}")),
            );
        }
        let mut request = self.http.post(url).json(&body);
        if let Some(proof) = proof {
            request = request.header("X-Payment-Receipt", format!("{proof}"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| PaymentError::UpstreamError(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| PaymentError::UpstreamError(e.to_string()))?
            .to_vec();
        Ok(GatewayResponse { status, body })
    }
}
