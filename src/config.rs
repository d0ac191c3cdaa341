// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : portfolio_reconciler — manual portfolio import with async ticker
          validation
Module  : config.rs

Summary : Settings are read from the environment (a local .env is loaded
          first). Every key has a default so the reconciler runs against the
          in-process mock backend out of the box.
=============================================================================
*/
use std::env;
use std::time::Duration;

use dotenvy::dotenv;
use tracing::warn;
use url::Url;

const DEFAULT_API_BASE: &str = "http://localhost:5000/api";

/// Where ticker validation and the portfolio overwrite go
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendMode {
    Mock,
    Http,
}

impl BackendMode {
    pub fn from_env(key: &str, default_mode: BackendMode) -> BackendMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => BackendMode::Mock,
            "http" | "api" => BackendMode::Http,
            _ => default_mode,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendMode::Mock => "mock",
            BackendMode::Http => "http",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GridCfg {
    /// Rows on a fresh grid and after a successful save.
    pub initial_rows: usize,
    /// Blank rows kept after the last filled row.
    pub min_empty_rows: usize,
}

impl Default for GridCfg {
    fn default() -> Self {
        Self { initial_rows: 10, min_empty_rows: 5 }
    }
}

#[derive(Clone, Debug)]
pub struct ValidationCfg {
    /// Trailing-edge quiet period after the last ticker edit.
    pub debounce: Duration,
    /// Per oracle call; a timeout counts as an invalid ticker.
    pub oracle_timeout: Duration,
}

impl Default for ValidationCfg {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(400),
            oracle_timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Clone, Debug)]
pub struct MockCfg {
    pub known_tickers: Vec<String>,
    pub latency_ms: u64,
}

#[derive(Clone, Debug)]
pub struct Args {
    pub backend_mode: BackendMode,
    pub api_base: Url,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: Option<u16>,

    pub mock: MockCfg,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect()
}

pub fn load() -> (Args, GridCfg, ValidationCfg) {
    let _ = dotenv();

    // ===== Backend =====
    let backend_mode = BackendMode::from_env("BACKEND_MODE", BackendMode::Mock);
    let raw_base = env::var("API_BASE_URL").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
    let api_base = match Url::parse(&raw_base) {
        Ok(u) => u,
        Err(e) => {
            warn!(?e, %raw_base, "bad API_BASE_URL, using default");
            // DEFAULT_API_BASE is a literal that parses
            Url::parse(DEFAULT_API_BASE).unwrap()
        }
    };

    let record_file = env::var("RECORD_FILE").ok().filter(|s| !s.trim().is_empty());
    let metrics_port = env_parse::<u16>("METRICS_PORT").filter(|p| *p != 0);

    // ===== Mock backend =====
    // MOCK_TICKERS=PETR4,VALE3,ITUB4
    let known_tickers = env::var("MOCK_TICKERS")
        .ok()
        .map(|s| parse_list(&s))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| {
            ["PETR4", "VALE3", "ITUB4", "BBAS3", "WEGE3", "BOVA11", "IVVB11", "AAPL", "MSFT"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        });
    let mock = MockCfg {
        known_tickers,
        latency_ms: env_parse("MOCK_LATENCY_MS").unwrap_or(30),
    };

    let args = Args { backend_mode, api_base, record_file, metrics_port, mock };

    // ===== Grid =====
    let defaults = GridCfg::default();
    let min_empty_rows = env_parse::<usize>("MIN_EMPTY_ROWS").unwrap_or(defaults.min_empty_rows).max(1);
    let grid = GridCfg {
        initial_rows: env_parse::<usize>("INITIAL_ROWS").unwrap_or(defaults.initial_rows).max(min_empty_rows),
        min_empty_rows,
    };

    // ===== Validation =====
    let vdefaults = ValidationCfg::default();
    let validation = ValidationCfg {
        debounce: env_parse::<u64>("VALIDATE_DEBOUNCE_MS")
            .map(Duration::from_millis)
            .unwrap_or(vdefaults.debounce),
        oracle_timeout: env_parse::<u64>("ORACLE_TIMEOUT_MS")
            .map(Duration::from_millis)
            .unwrap_or(vdefaults.oracle_timeout),
    };

    (args, grid, validation)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parsing_uppercases_and_skips_blanks() {
        assert_eq!(parse_list(" petr4, ,vale3,"), vec!["PETR4".to_string(), "VALE3".into()]);
    }

    #[test]
    fn defaults_match_reference_behavior() {
        let g = GridCfg::default();
        assert_eq!((g.initial_rows, g.min_empty_rows), (10, 5));
        assert_eq!(ValidationCfg::default().debounce, Duration::from_millis(400));
    }
}
