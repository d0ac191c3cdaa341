// ===============================
// src/gateway.rs (backend seams + mock backend)
// ===============================
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashSet as HashSet;
use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::{
    sync::Mutex,
    time::{sleep, Duration},
};
use tracing::info;

use crate::config::MockCfg;
use crate::domain::Holding;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Confirms whether a ticker designates a real, tradable asset.
#[async_trait]
pub trait TickerOracle: Send + Sync {
    async fn validate_ticker(&self, ticker: &str) -> Result<bool, ApiError>;
}

/// Replaces the whole portfolio with `holdings`.
#[async_trait]
pub trait PortfolioSink: Send + Sync {
    async fn overwrite_portfolio(&self, holdings: &[Holding]) -> Result<(), ApiError>;
}

/// In-process backend: known tickers are valid, everything is slowed by a
/// jittered latency, and the last saved portfolio is kept in memory.
pub struct MockBackend {
    known: HashSet<String>,
    latency_ms: u64,
    saved: Mutex<Vec<Holding>>,
    lookups: AtomicU64,
}

impl MockBackend {
    pub fn new(cfg: &MockCfg) -> Self {
        Self {
            known: cfg.known_tickers.iter().cloned().collect(),
            latency_ms: cfg.latency_ms,
            saved: Mutex::new(Vec::new()),
            lookups: AtomicU64::new(0),
        }
    }

    pub async fn saved(&self) -> Vec<Holding> {
        self.saved.lock().await.clone()
    }

    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    async fn pace(&self) {
        if self.latency_ms == 0 {
            return;
        }
        // ThreadRng must not live across the await
        let jitter = rand::thread_rng().gen_range(0..=self.latency_ms / 2);
        sleep(Duration::from_millis(self.latency_ms + jitter)).await;
    }
}

#[async_trait]
impl TickerOracle for MockBackend {
    async fn validate_ticker(&self, ticker: &str) -> Result<bool, ApiError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.pace().await;
        Ok(self.known.contains(ticker))
    }
}

#[async_trait]
impl PortfolioSink for MockBackend {
    async fn overwrite_portfolio(&self, holdings: &[Holding]) -> Result<(), ApiError> {
        self.pace().await;
        *self.saved.lock().await = holdings.to_vec();
        info!(holdings = holdings.len(), "mock portfolio overwritten");
        Ok(())
    }
}
