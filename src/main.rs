// ===============================
// src/main.rs
// ===============================
/*
=============================================================================
Project : portfolio_reconciler — manual portfolio import with async ticker
          validation
Module  : main.rs

Summary : Pastes a spreadsheet export (ticker, price, quantity) into the
          import grid, lets the debounced scheduler validate every ticker
          against the backend (or the in-process mock), prints the per-row
          verdicts and, after confirmation, overwrites the whole portfolio
          with the valid rows in one batch.

Usage   : portfolio_reconciler holdings.tsv            # asks before saving
          portfolio_reconciler --yes holdings.csv
          pbpaste | portfolio_reconciler --yes
=============================================================================
*/
mod backend;
mod commit;
mod config;
mod domain;
mod gateway;
mod grid;
mod metrics;
mod recorder;
mod scheduler;
mod ticker;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    sync::mpsc,
    time::{timeout, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::commit::{CommitGate, GateError};
use crate::domain::{Event, Field, RowId};
use crate::gateway::{MockBackend, PortfolioSink, TickerOracle};
use crate::grid::{GridSnapshot, GridStore};
use crate::scheduler::Scheduler;

#[derive(Parser, Debug)]
#[command(name = "portfolio_reconciler", about = "Import holdings and overwrite the portfolio")]
struct Cli {
    /// Tab- or comma-separated file with ticker, price, quantity columns (stdin when omitted)
    input: Option<PathBuf>,

    /// Overwrite without asking for confirmation
    #[arg(long)]
    yes: bool,

    /// Skip the first input line (column headers)
    #[arg(long)]
    header: bool,

    /// Budget for ticker validation to settle, in milliseconds
    #[arg(long, default_value_t = 15_000)]
    settle_ms: u64,

    /// Cell correction applied after the paste, as ROW,COLUMN,VALUE (repeatable)
    #[arg(long = "edit", value_parser = parse_edit)]
    edits: Vec<CellEdit>,
}

#[derive(Clone, Debug)]
struct CellEdit {
    row: RowId,
    field: Field,
    value: String,
}

fn parse_edit(raw: &str) -> Result<CellEdit, String> {
    let mut parts = raw.splitn(3, ',');
    let (Some(row), Some(field), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected ROW,COLUMN,VALUE, got '{raw}'"));
    };
    let row = row.trim().parse::<u64>().map_err(|e| format!("bad row '{row}': {e}"))?;
    Ok(CellEdit { row: RowId(row), field: field.parse()?, value: value.to_string() })
}

async fn read_input(cli: &Cli) -> std::io::Result<String> {
    let raw = match &cli.input {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    if cli.header {
        return Ok(raw.lines().skip(1).collect::<Vec<_>>().join("\n"));
    }
    Ok(raw)
}

fn print_report(snap: &GridSnapshot) {
    println!(
        "{:>4}  {:<10} {:<12} {:>12} {:>10}  {:<12} {:<10} {}",
        "row", "ticker", "symbol", "price", "qty", "status", "checked", "submit"
    );
    for row in snap.rows.iter().filter(|r| !r.is_empty()) {
        println!(
            "{:>4}  {:<10} {:<12} {:>12} {:>10}  {:<12} {:<10} {}",
            row.id,
            row.ticker,
            ticker::market_symbol(&row.ticker),
            row.price,
            row.quantity,
            snap.status_of(row.id).as_str(),
            snap.last_validated(row.id).unwrap_or("-"),
            if snap.is_submittable(row) { "yes" } else { "no" },
        );
    }
}

async fn confirm_prompt(n: usize) -> bool {
    eprint!("Overwrite the entire portfolio with {n} holding(s)? This cannot be undone. [y/N] ");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match lines.next_line().await {
        Ok(Some(answer)) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        _ => false,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ---- Load config ----
    let (args, grid_cfg, validation_cfg) = config::load();

    // ---- Metrics ----
    metrics::init();
    if let Some(port) = args.metrics_port {
        metrics::serve_metrics(port);
    }

    info!(
        backend = args.backend_mode.as_str(),
        api_base = %args.api_base,
        debounce_ms = validation_cfg.debounce.as_millis() as u64,
        oracle_timeout_ms = validation_cfg.oracle_timeout.as_millis() as u64,
        initial_rows = grid_cfg.initial_rows,
        min_empty_rows = grid_cfg.min_empty_rows,
        "startup config"
    );

    // ---- Backend ----
    let mut mock = None;
    let (oracle, sink): (Arc<dyn TickerOracle>, Arc<dyn PortfolioSink>) = match args.backend_mode {
        config::BackendMode::Mock => {
            let m = Arc::new(MockBackend::new(&args.mock));
            mock = Some(m.clone());
            (m.clone() as Arc<dyn TickerOracle>, m as Arc<dyn PortfolioSink>)
        }
        config::BackendMode::Http => {
            let http = match backend::HttpBackend::new(&args.api_base, validation_cfg.oracle_timeout) {
                Ok(h) => Arc::new(h),
                Err(e) => {
                    error!(?e, "cannot build http client");
                    return ExitCode::FAILURE;
                }
            };
            http.probe().await;
            (http.clone() as Arc<dyn TickerOracle>, http as Arc<dyn PortfolioSink>)
        }
    };

    // ---- Recorder (optional) ----
    let mut store = GridStore::new(grid_cfg);
    let mut rec_task = None;
    if let Some(path) = args.record_file.clone() {
        let (rec_tx, rec_rx) = mpsc::channel::<Event>(4096);
        rec_task = Some(tokio::spawn(recorder::run(rec_rx, path)));
        store = store.with_recorder(rec_tx);
    }
    let store = Arc::new(store);

    // ---- Scheduler + gate ----
    let sched = Scheduler::new(store.clone(), oracle, validation_cfg);
    let sched_task = sched.spawn();
    let gate = CommitGate::new(store.clone(), sink)
        .on_saved(|n| info!(holdings = n, "import finished"));
    let mut gate_rx = gate.subscribe();
    let gate_log = tokio::spawn(async move {
        while gate_rx.changed().await.is_ok() {
            let state = *gate_rx.borrow_and_update();
            debug!(?state, "commit gate");
        }
    });

    let code = run_import(&cli, &store, &gate).await;
    if let Some(m) = &mock {
        info!(lookups = m.lookups(), saved = m.saved().await.len(), "mock backend stats");
    }

    // ---- Shutdown: stop the scheduler, then let the recorder drain ----
    sched_task.abort();
    let _ = sched_task.await;
    drop(sched);
    drop(gate);
    let _ = gate_log.await;
    drop(store);
    if let Some(task) = rec_task {
        let _ = timeout(Duration::from_secs(2), task).await;
    }
    code
}

async fn run_import(cli: &Cli, store: &GridStore, gate: &CommitGate) -> ExitCode {
    let text = match read_input(cli).await {
        Ok(t) => t,
        Err(e) => {
            error!(?e, input = ?cli.input, "cannot read input");
            return ExitCode::FAILURE;
        }
    };
    let records = store.paste_block(0, 0, &text);
    for edit in &cli.edits {
        if !store.set_cell(edit.row, edit.field, &edit.value) {
            warn!(row = %edit.row, "edit targets a row outside the grid, ignored");
        }
    }
    let snap = store.snapshot();
    info!(records, filled = snap.filled_rows(), rows = snap.rows.len(), "input loaded into grid");

    if !scheduler::settled(store, Duration::from_millis(cli.settle_ms)).await {
        warn!(settle_ms = cli.settle_ms, "validation did not settle in time; unresolved rows are skipped");
    }
    print_report(&store.snapshot());

    let ready = match gate.request_save() {
        Ok(n) => n,
        Err(e) => {
            let msg = store.snapshot().error.clone().unwrap_or_else(|| e.to_string());
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let confirmed = if cli.yes {
        true
    } else if cli.input.is_none() {
        warn!("input came from stdin; pass --yes to confirm the overwrite");
        false
    } else {
        confirm_prompt(ready).await
    };
    if !confirmed {
        gate.cancel();
        eprintln!("Overwrite cancelled; nothing was saved.");
        return ExitCode::SUCCESS;
    }

    match gate.confirm_save().await {
        Ok(n) => {
            println!("Portfolio overwritten with {n} holding(s).");
            ExitCode::SUCCESS
        }
        Err(GateError::Backend(e)) => {
            let msg = store.snapshot().error.clone().unwrap_or_default();
            eprintln!("{msg} ({e})");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
