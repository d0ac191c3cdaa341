// ===============================
// src/scheduler.rs (Validation Scheduler)
// ===============================
//
// Keeps per-row ticker status eventually consistent with the oracle.
//
// Trigger : any ticker edit (snapshot.ticker_rev moves), trailing-edge
//           debounce of `cfg.debounce`. Bursts of edits collapse into one pass.
// Pass    : 1) pending rows = ticker text neither resolved nor in flight
//           2) cheap local filter -> Invalid at once, no oracle call
//           3) rest marked Validating, one lookup per distinct ticker,
//              all concurrent, each bounded by `cfg.oracle_timeout`
//           4) every resolution of the pass merged in one snapshot; the store
//              drops those whose row no longer holds the looked-up ticker
// Passes are spawned, so a later pass can overtake a slow earlier one.
// Errors and timeouts fail closed (Invalid).
//
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap as HashMap;
use futures_util::future::join_all;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::config::ValidationCfg;
use crate::domain::{Resolution, RowId};
use crate::gateway::TickerOracle;
use crate::grid::{GridSnapshot, GridStore};
use crate::metrics::{LAT_ORACLE, LOCAL_REJECTS, ORACLE_CALLS, STALE_DISCARDS, VALIDATION_PASSES};
use crate::ticker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub local_rejects: usize,
    pub lookups: usize,
    pub applied: usize,
    pub stale: usize,
}

pub struct Scheduler {
    store: Arc<GridStore>,
    oracle: Arc<dyn TickerOracle>,
    cfg: ValidationCfg,
}

impl Scheduler {
    pub fn new(store: Arc<GridStore>, oracle: Arc<dyn TickerOracle>, cfg: ValidationCfg) -> Arc<Self> {
        Arc::new(Self { store, oracle, cfg })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Debounce loop. Runs until its task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.store.subscribe();
        let mut seen_rev = rx.borrow_and_update().ticker_rev;
        let mut armed = !rx.borrow().pending().is_empty();

        loop {
            if !armed && !wait_ticker_edit(&mut rx, &mut seen_rev).await {
                break;
            }
            armed = false;

            // trailing edge: restart the quiet period on every further edit
            loop {
                tokio::select! {
                    alive = wait_ticker_edit(&mut rx, &mut seen_rev) => {
                        if !alive {
                            return;
                        }
                    }
                    _ = sleep(self.cfg.debounce) => break,
                }
            }

            let me = Arc::clone(&self);
            tokio::spawn(async move {
                let report = me.run_pass().await;
                if report != PassReport::default() {
                    debug!(?report, "validation pass done");
                }
            });
        }
        info!("validation scheduler stopped");
    }

    /// One validation pass against the current snapshot.
    pub async fn run_pass(&self) -> PassReport {
        VALIDATION_PASSES.inc();
        let pending = self.store.snapshot().pending();
        if pending.is_empty() {
            return PassReport::default();
        }

        let mut report = PassReport::default();
        let mut rejected = Vec::new();
        let mut remote = Vec::new();
        for (row_id, t) in pending {
            match ticker::local_reject(&t) {
                Some(reason) => {
                    LOCAL_REJECTS.with_label_values(&[reason.as_str()]).inc();
                    debug!(%row_id, ticker = %t, reason = reason.as_str(), "rejected locally");
                    rejected.push(Resolution { row_id, ticker: t, valid: false });
                }
                None => remote.push((row_id, t)),
            }
        }
        report.local_rejects = rejected.len();
        let (a, s) = self.store.merge_resolutions(&rejected);
        report.applied += a;
        report.stale += s;

        let started = self.store.begin_validation(&remote);
        if started.is_empty() {
            return report;
        }

        // one lookup per distinct ticker
        let mut by_ticker: HashMap<String, Vec<RowId>> = HashMap::new();
        for (row_id, t) in started {
            by_ticker.entry(t).or_default().push(row_id);
        }
        report.lookups = by_ticker.len();

        let lookups = by_ticker.into_iter().map(|(t, rows)| async move {
            let valid = self.lookup(&t).await;
            rows.into_iter()
                .map(|row_id| Resolution { row_id, ticker: t.clone(), valid })
                .collect::<Vec<_>>()
        });
        let resolutions: Vec<Resolution> = join_all(lookups).await.into_iter().flatten().collect();

        let (a, s) = self.store.merge_resolutions(&resolutions);
        report.applied += a;
        report.stale += s;
        if s > 0 {
            STALE_DISCARDS.inc_by(s as u64);
            info!(stale = s, "discarded resolutions for edited tickers");
        }
        report
    }

    async fn lookup(&self, t: &str) -> bool {
        let t0 = Instant::now();
        let outcome = timeout(self.cfg.oracle_timeout, self.oracle.validate_ticker(t)).await;
        LAT_ORACLE.observe(t0.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(Ok(valid)) => {
                ORACLE_CALLS.with_label_values(&[if valid { "valid" } else { "invalid" }]).inc();
                debug!(ticker = %t, valid, "oracle verdict");
                valid
            }
            Ok(Err(e)) => {
                ORACLE_CALLS.with_label_values(&["error"]).inc();
                warn!(?e, ticker = %t, "oracle failed, marking invalid");
                false
            }
            Err(_) => {
                ORACLE_CALLS.with_label_values(&["timeout"]).inc();
                warn!(ticker = %t, timeout_ms = self.cfg.oracle_timeout.as_millis() as u64, "oracle timed out, marking invalid");
                false
            }
        }
    }
}

// Resolves on the next change of ticker text; false if the sender is gone.
async fn wait_ticker_edit(rx: &mut watch::Receiver<Arc<GridSnapshot>>, seen_rev: &mut u64) -> bool {
    loop {
        if rx.changed().await.is_err() {
            return false;
        }
        let rev = rx.borrow_and_update().ticker_rev;
        if rev != *seen_rev {
            *seen_rev = rev;
            return true;
        }
    }
}

/// Waits until no row is `Validating` and nothing is pending, or `budget` elapses.
pub async fn settled(store: &GridStore, budget: std::time::Duration) -> bool {
    let mut rx = store.subscribe();
    let quiet = |s: &GridSnapshot| {
        s.pending().is_empty()
            && s.status.values().all(|c| c.status != crate::domain::ValidationStatus::Validating)
    };
    let wait = async {
        loop {
            if quiet(&**rx.borrow_and_update()) {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    };
    timeout(budget, wait).await.is_ok()
}
