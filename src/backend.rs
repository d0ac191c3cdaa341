// ===============================
// src/backend.rs
// ===============================
//
// REST client for the portfolio backend.
// - GET  {base}/validate-ticker?ticker=X   -> {"isValid": bool} (older builds: "exists")
// - POST {base}/overwrite-portfolio        <- {"ativos": [{ticker, preco, quantidade}]}
// - GET  {base}/health, {base}/system-status (startup probe only)
//
// Non-2xx answers carry {"error": "..."} when the backend knows why.
//
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, error, info};
use url::Url;

use crate::domain::Holding;
use crate::gateway::{ApiError, PortfolioSink, TickerOracle};

#[derive(Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base: String,
}

#[derive(Serialize)]
struct OverwriteBody<'a> {
    ativos: &'a [Holding],
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Transport(e.to_string())
        }
    }
}

impl HttpBackend {
    pub fn new(base: &Url, timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { http, base: base.as_str().trim_end_matches('/').to_string() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    async fn read_json(rsp: reqwest::Response) -> Result<Value, ApiError> {
        if rsp.status().is_success() {
            return Ok(rsp.json::<Value>().await?);
        }
        Err(Self::status_error(rsp).await)
    }

    async fn status_error(rsp: reqwest::Response) -> ApiError {
        let code = rsp.status();
        let body = rsp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(body);
        ApiError::Status { code: code.as_u16(), message }
    }

    async fn get(&self, path: &str) -> Result<Value, ApiError> {
        let url = self.url(path);
        debug!(%url, "GET");
        let rsp = self.http.get(url).send().await?;
        Self::read_json(rsp).await
    }

    pub async fn health_check(&self) -> Result<Value, ApiError> {
        self.get("health").await
    }

    pub async fn system_status(&self) -> Result<Value, ApiError> {
        self.get("system-status").await
    }

    /// Logs backend health; failures are reported but not fatal.
    pub async fn probe(&self) -> bool {
        match self.health_check().await {
            Ok(v) => {
                info!(health = %v, "backend reachable");
                if let Ok(st) = self.system_status().await {
                    debug!(status = %st, "backend system status");
                }
                true
            }
            Err(e) => {
                error!(?e, base = %self.base, "backend health check failed");
                false
            }
        }
    }
}

pub(crate) fn verdict_of(v: &Value) -> Result<bool, ApiError> {
    v.get("isValid")
        .or_else(|| v.get("exists"))
        .and_then(Value::as_bool)
        .ok_or_else(|| ApiError::Decode(format!("no verdict in {v}")))
}

#[async_trait]
impl TickerOracle for HttpBackend {
    async fn validate_ticker(&self, ticker: &str) -> Result<bool, ApiError> {
        let v = self
            .get(&format!("validate-ticker?ticker={}", urlencoding::encode(ticker)))
            .await?;
        verdict_of(&v)
    }
}

#[async_trait]
impl PortfolioSink for HttpBackend {
    async fn overwrite_portfolio(&self, holdings: &[Holding]) -> Result<(), ApiError> {
        let url = self.url("overwrite-portfolio");
        info!(%url, holdings = holdings.len(), "POST overwrite");
        let rsp = self
            .http
            .post(url)
            .json(&OverwriteBody { ativos: holdings })
            .send()
            .await?;
        if rsp.status().is_success() {
            return Ok(());
        }
        let err = Self::status_error(rsp).await;
        error!(?err, "overwrite rejected");
        Err(err)
    }
}
