// ===============================
// src/ticker.rs
// ===============================
//
// Ticker helpers:
// - normalize      : trim + upper-case (the validation key)
// - local_reject   : cheap filter applied before any oracle call
// - classify       : market of a ticker (BR / US / BDR / FX)
// - market_symbol  : ticker as the price provider expects it (".SA" suffix for B3)
//
use once_cell::sync::Lazy;
use regex::Regex;

static FX_PAIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{3,6}BRL=X$").unwrap());
static US_STOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]{1,5}$").unwrap());

const MIN_TICKER_LEN: usize = 4;

pub fn normalize(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// Why a ticker was rejected without asking the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalReject { TooShort, HasEquals, CurrencyPair }

impl LocalReject {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocalReject::TooShort => "too_short",
            LocalReject::HasEquals => "has_equals",
            LocalReject::CurrencyPair => "currency_pair",
        }
    }
}

/// `ticker` must already be normalised.
pub fn local_reject(ticker: &str) -> Option<LocalReject> {
    if FX_PAIR.is_match(ticker) {
        return Some(LocalReject::CurrencyPair);
    }
    if ticker.contains('=') {
        return Some(LocalReject::HasEquals);
    }
    if ticker.chars().count() < MIN_TICKER_LEN {
        return Some(LocalReject::TooShort);
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerKind { Br, Us, Bdr, Fx }

impl TickerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TickerKind::Br => "BR",
            TickerKind::Us => "US",
            TickerKind::Bdr => "BDR",
            TickerKind::Fx => "FX",
        }
    }
}

pub fn classify(raw: &str) -> TickerKind {
    let t = normalize(raw);
    if t.contains('=') {
        return TickerKind::Fx;
    }
    if ["32.SA", "34.SA", "35.SA"].iter().any(|s| t.ends_with(s)) {
        return TickerKind::Bdr;
    }
    if t.ends_with(".SA") {
        return TickerKind::Br;
    }
    if US_STOCK.is_match(&t) {
        return TickerKind::Us;
    }
    // unknown shapes are treated as B3 listings
    TickerKind::Br
}

pub fn market_symbol(raw: &str) -> String {
    let t = normalize(raw);
    if t.contains('=') || t.contains('.') || US_STOCK.is_match(&t) {
        return t;
    }
    format!("{t}.SA")
}
