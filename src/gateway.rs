use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    errors::PaymentError,
    payment::pipeline::{Fetched, PaymentPipeline},
    types::{MicroUsdc, RunId},
};

/// Typed market-data endpoints with their metered costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketEndpoint {
    SpotPrice,
    Ohlcv,
    Vwap,
    Trades,
    OrderBook,
    LiquidityDepth,
}

impl MarketEndpoint {
    pub fn path(self) -> &'static str {
        match self {
            MarketEndpoint::SpotPrice => "spot_price",
            MarketEndpoint::Ohlcv => "ohlcv",
            MarketEndpoint::Vwap => "vwap",
            MarketEndpoint::Trades => "trades",
            MarketEndpoint::OrderBook => "order_book",
            MarketEndpoint::LiquidityDepth => "liquidity_depth",
        }
    }

    /// Estimated cost in micro-USDC, used by the budget guard before any
    /// invoice is seen.
    pub fn cost(self) -> MicroUsdc {
        MicroUsdc::new(match self {
            MarketEndpoint::SpotPrice => 10_000,
            MarketEndpoint::Ohlcv => 20_000,
            MarketEndpoint::Vwap => 20_000,
            MarketEndpoint::Trades => 50_000,
            MarketEndpoint::OrderBook => 100_000,
            MarketEndpoint::LiquidityDepth => 250_000,
        })
    }

    /// Zero means never cached.
    pub fn cache_ttl(self) -> Duration {
        match self {
            MarketEndpoint::SpotPrice => Duration::from_secs(60),
            MarketEndpoint::Ohlcv | MarketEndpoint::Vwap => Duration::from_secs(300),
            MarketEndpoint::Trades => Duration::ZERO,
            MarketEndpoint::OrderBook | MarketEndpoint::LiquidityDepth => {
                Duration::from_secs(300)
            }
        }
    }
}

/// One side level of a depth response.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Order-book style payload shared by `order_book` and `liquidity_depth`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarketDepth {
    pub mid_price: f64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SpotPrice {
    pub price: f64,
}

/// Provenance of a gateway answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchMeta {
    pub payment_id: Option<u64>,
    pub cost_paid: MicroUsdc,
    pub from_cache: bool,
}

struct CacheEntry {
    inserted: Instant,
    body: Vec<u8>,
}

/// Capped per-endpoint response cache: TTL freshness plus LRU eviction.
struct ResponseCache {
    cap: usize,
    entries: HashMap<String, CacheEntry>,
    recency: Vec<String>,
}

impl ResponseCache {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            entries: HashMap::new(),
            recency: Vec::new(),
        }
    }

    fn touch(&mut self, key: &str) {
        self.recency.retain(|k| k != key);
        self.recency.push(key.to_string());
    }

    fn get(&mut self, key: &str, ttl: Duration, now: Instant) -> Option<Vec<u8>> {
        if ttl.is_zero() {
            return None;
        }
        let fresh = match self.entries.get(key) {
            Some(entry) => now.duration_since(entry.inserted) < ttl,
            None => return None,
        };
        if !fresh {
            self.entries.remove(key);
            self.recency.retain(|k| k != key);
            return None;
        }
        self.touch(key);
        self.entries.get(key).map(|e| e.body.clone())
    }

    fn insert(&mut self, key: String, body: Vec<u8>, now: Instant) {
        self.entries.insert(
            key.clone(),
            CacheEntry {
                inserted: now,
                body,
            },
        );
        self.touch(&key);
        while self.entries.len() > self.cap {
            let oldest = self.recency.remove(0);
            self.entries.remove(&oldest);
        }
    }
}

/// Typed facade over the metered market-data endpoints. Cached responses
/// bypass the payment pipeline entirely and spend nothing.
pub struct MarketDataGateway {
    pipeline: Arc<PaymentPipeline>,
    cache: Mutex<ResponseCache>,
}

const CACHE_CAP: usize = 64;

impl MarketDataGateway {
    pub fn new(pipeline: Arc<PaymentPipeline>) -> Self {
        Self {
            pipeline,
            cache: Mutex::new(ResponseCache::new(CACHE_CAP)),
        }
    }

    /// Canonical cache key: endpoint path plus the params rendered with
    /// sorted object keys.
    fn cache_key(endpoint: MarketEndpoint, params: &Value) -> String {
        format!("{}:{}", endpoint.path(), params)
    }

    pub async fn fetch_raw(
        &self,
        run_id: RunId,
        endpoint: MarketEndpoint,
        params: &Value,
    ) -> Result<(Vec<u8>, FetchMeta), PaymentError> {
        let key = Self::cache_key(endpoint, params);
        let now = Instant::now();
        if let Some(body) = self
            .cache
            .lock()
            .expect("cache lock")
            .get(&key, endpoint.cache_ttl(), now)
        {
            debug!(endpoint = endpoint.path(), "gateway cache hit");
            return Ok((
                body,
                FetchMeta {
                    payment_id: None,
                    cost_paid: MicroUsdc::ZERO,
                    from_cache: true,
                },
            ));
        }

        let Fetched {
            body,
            payment_id,
            cost_paid,
        } = self.pipeline.fetch(run_id, endpoint.path(), params).await?;
        self.cache
            .lock()
            .expect("cache lock")
            .insert(key, body.clone(), Instant::now());
        Ok((
            body,
            FetchMeta {
                payment_id,
                cost_paid,
                from_cache: false,
            },
        ))
    }

    pub async fn spot_price(
        &self,
        run_id: RunId,
        instrument: &str,
    ) -> Result<(SpotPrice, FetchMeta), PaymentError> {
        let params = json!({ "instrument": instrument });
        let (body, meta) = self
            .fetch_raw(run_id, MarketEndpoint::SpotPrice, &params)
            .await?;
        Ok((decode(&body)?, meta))
    }

    pub async fn order_book(
        &self,
        run_id: RunId,
        instrument: &str,
        limit: u32,
    ) -> Result<(MarketDepth, FetchMeta), PaymentError> {
        let params = json!({ "instrument": instrument, "limit": limit });
        let (body, meta) = self
            .fetch_raw(run_id, MarketEndpoint::OrderBook, &params)
            .await?;
        Ok((decode(&body)?, meta))
    }

    pub async fn liquidity_depth(
        &self,
        run_id: RunId,
        instrument: &str,
    ) -> Result<(MarketDepth, FetchMeta), PaymentError> {
        let params = json!({ "instrument": instrument });
        let (body, meta) = self
            .fetch_raw(run_id, MarketEndpoint::LiquidityDepth, &params)
            .await?;
        Ok((decode(&body)?, meta))
    }
}

fn decode<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, PaymentError> {
    serde_json::from_slice(body)
        .map_err(|e| PaymentError::UpstreamError(format!("bad gateway payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_table_matches_contract() {
        assert_eq!(MarketEndpoint::SpotPrice.cost(), MicroUsdc::new(10_000));
        assert_eq!(MarketEndpoint::Ohlcv.cost(), MicroUsdc::new(20_000));
        assert_eq!(MarketEndpoint::Vwap.cost(), MicroUsdc::new(20_000));
        assert_eq!(MarketEndpoint::Trades.cost(), MicroUsdc::new(50_000));
        assert_eq!(MarketEndpoint::OrderBook.cost(), MicroUsdc::new(100_000));
        assert_eq!(
            MarketEndpoint::LiquidityDepth.cost(),
            MicroUsdc::new(250_000)
        );
    }

    #[test]
    fn cache_respects_ttl() {
        let mut cache = ResponseCache::new(4);
        let now = Instant::now();
        cache.insert("k".to_string(), vec![1, 2], now);
        assert_eq!(
            cache.get("k", Duration::from_secs(60), now + Duration::from_secs(30)),
            Some(vec![1, 2])
        );
        assert_eq!(
            cache.get("k", Duration::from_secs(60), now + Duration::from_secs(61)),
            None
        );
    }

    #[test]
    fn zero_ttl_is_never_cached() {
        let mut cache = ResponseCache::new(4);
        let now = Instant::now();
        cache.insert("k".to_string(), vec![1], now);
        assert_eq!(cache.get("k", Duration::ZERO, now), None);
    }

    #[test]
    fn lru_evicts_oldest() {
        let mut cache = ResponseCache::new(2);
        let now = Instant::now();
        cache.insert("a".to_string(), vec![1], now);
        cache.insert("b".to_string(), vec![2], now);
        // Touch `a` so `b` becomes the eviction candidate.
        assert!(cache.get("a", Duration::from_secs(60), now).is_some());
        cache.insert("c".to_string(), vec![3], now);
        assert!(cache.get("b", Duration::from_secs(60), now).is_none());
        assert!(cache.get("a", Duration::from_secs(60), now).is_some());
        assert!(cache.get("c", Duration::from_secs(60), now).is_some());
    }
}
