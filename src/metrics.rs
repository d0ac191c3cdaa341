// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Grid --------
pub static GRID_ROWS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("grid_rows", "rows currently in the import grid").unwrap());

// -------- Validation scheduler --------
pub static VALIDATION_PASSES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("validation_passes_total", "debounced validation passes").unwrap()
});

pub static ORACLE_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("oracle_calls_total", "ticker oracle calls by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub static LOCAL_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ticker_local_rejects_total", "tickers rejected without an oracle call"),
        &["reason"],
    )
    .unwrap()
});

pub static STALE_DISCARDS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("validation_stale_discards_total", "resolutions dropped because the ticker changed")
        .unwrap()
});

pub static LAT_ORACLE: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "oracle_latency_ms",
        "Latency of one ticker oracle call (ms)",
    ))
    .unwrap()
});

// -------- Commit gate --------
pub static SAVES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("portfolio_saves_total", "overwrite attempts by outcome"),
        &["outcome"],
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(GRID_ROWS.clone())),
        REGISTRY.register(Box::new(VALIDATION_PASSES.clone())),
        REGISTRY.register(Box::new(ORACLE_CALLS.clone())),
        REGISTRY.register(Box::new(LOCAL_REJECTS.clone())),
        REGISTRY.register(Box::new(STALE_DISCARDS.clone())),
        REGISTRY.register(Box::new(LAT_ORACLE.clone())),
        REGISTRY.register(Box::new(SAVES.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Any GET gets the metrics page; headers are read and ignored
fn handle_client(mut stream: TcpStream) {
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Dedicated OS thread so the blocking accept loop stays off the runtime
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(?e, %addr, "metrics bind failed");
                return;
            }
        };
        info!(%addr, "metrics listening");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => error!(?e, "metrics accept error"),
            }
        }
    });
}
