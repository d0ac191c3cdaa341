// ===============================
// src/commit.rs (Commit Gate)
// ===============================
//
// Guards the destructive "overwrite portfolio" call.
//
//   Idle --request_save (>=1 submittable row)--> Confirming
//   Confirming --cancel--> Idle
//   Confirming --confirm_save--> Saving --ok--> Idle (grid reset)
//                                       --err--> Idle (grid kept, error shown)
//
// Only one Saving at a time; the state lives in a watch channel so a host
// can disable its save button while Saving.
//
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};

use crate::domain::Event;
use crate::gateway::{ApiError, PortfolioSink};
use crate::grid::GridStore;
use crate::metrics::SAVES;
use crate::ticker;

pub const MSG_NO_VALID_ROWS: &str = "Fill in at least one valid asset.";
pub const MSG_SAVE_FAILED: &str = "Failed to save portfolio.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState { Idle, Confirming, Saving }

#[derive(Debug, Error)]
pub enum GateError {
    #[error("no submittable row")]
    NoSubmittableRows,
    #[error("no save is awaiting confirmation")]
    NotConfirming,
    #[error("a save is already in progress")]
    SaveInProgress,
    #[error("overwrite failed: {0}")]
    Backend(#[from] ApiError),
}

type SavedHook = Box<dyn Fn(usize) + Send + Sync>;

pub struct CommitGate {
    store: Arc<GridStore>,
    sink: Arc<dyn PortfolioSink>,
    state: watch::Sender<GateState>,
    on_saved: Option<SavedHook>,
}

impl CommitGate {
    pub fn new(store: Arc<GridStore>, sink: Arc<dyn PortfolioSink>) -> Self {
        let (state, _rx) = watch::channel(GateState::Idle);
        Self { store, sink, state, on_saved: None }
    }

    /// Called with the number of saved holdings after a successful overwrite.
    pub fn on_saved(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_saved = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<GateState> {
        self.state.subscribe()
    }

    // Moves from `from` to `to` atomically; returns the state seen.
    fn transition(&self, from: GateState, to: GateState) -> GateState {
        let mut seen = from;
        self.state.send_if_modified(|s| {
            seen = *s;
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        seen
    }

    /// Opens the confirmation step if at least one row is submittable.
    /// Returns how many rows would be saved. With nothing submittable an
    /// open confirmation is closed.
    pub fn request_save(&self) -> Result<usize, GateError> {
        if self.state() == GateState::Saving {
            return Err(GateError::SaveInProgress);
        }
        self.store.set_error(None);
        let ready = self.store.snapshot().submittable().count();
        if ready == 0 {
            self.store.set_error(Some(MSG_NO_VALID_ROWS.to_string()));
            self.transition(GateState::Confirming, GateState::Idle);
            return Err(GateError::NoSubmittableRows);
        }
        self.transition(GateState::Idle, GateState::Confirming);
        info!(rows = ready, "overwrite awaiting confirmation");
        Ok(ready)
    }

    /// Closes the confirmation step. No effect outside `Confirming`.
    pub fn cancel(&self) -> bool {
        self.transition(GateState::Confirming, GateState::Idle) == GateState::Confirming
    }

    /// Submits every submittable row as one overwrite batch.
    pub async fn confirm_save(&self) -> Result<usize, GateError> {
        match self.transition(GateState::Confirming, GateState::Saving) {
            GateState::Confirming => {}
            GateState::Saving => return Err(GateError::SaveInProgress),
            GateState::Idle => return Err(GateError::NotConfirming),
        }

        // rows may have been edited since request_save
        let holdings = self.store.snapshot().holdings();
        if holdings.is_empty() {
            self.store.set_error(Some(MSG_NO_VALID_ROWS.to_string()));
            self.state.send_replace(GateState::Idle);
            return Err(GateError::NoSubmittableRows);
        }
        for h in &holdings {
            info!(ticker = %h.ticker, market = ticker::classify(&h.ticker).as_str(), qty = h.quantity, px = h.price, "holding");
        }

        // Idle is published only after the grid reflects the outcome
        let result = self.sink.overwrite_portfolio(&holdings).await;
        match result {
            Ok(()) => {
                SAVES.with_label_values(&["ok"]).inc();
                self.store.record(Event::Saved { holdings: holdings.len() });
                self.store.reset();
                self.state.send_replace(GateState::Idle);
                info!(holdings = holdings.len(), "portfolio overwritten");
                if let Some(hook) = &self.on_saved {
                    hook(holdings.len());
                }
                Ok(holdings.len())
            }
            Err(e) => {
                SAVES.with_label_values(&["error"]).inc();
                error!(?e, "portfolio overwrite failed, grid kept");
                self.store.record(Event::SaveFailed { reason: e.to_string() });
                self.store.set_error(Some(MSG_SAVE_FAILED.to_string()));
                self.state.send_replace(GateState::Idle);
                Err(GateError::Backend(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridCfg;
    use crate::domain::{Holding, Resolution, RowId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{Mutex, Notify};

    #[derive(Default)]
    struct FakeSink {
        fail: bool,
        gate: Option<Arc<Notify>>,
        saved: Mutex<Vec<Holding>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PortfolioSink for FakeSink {
        async fn overwrite_portfolio(&self, holdings: &[Holding]) -> Result<(), ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(g) = &self.gate {
                g.notified().await;
            }
            if self.fail {
                return Err(ApiError::Status { code: 500, message: "db down".into() });
            }
            *self.saved.lock().await = holdings.to_vec();
            Ok(())
        }
    }

    fn store_with(text: &str) -> Arc<GridStore> {
        let store = Arc::new(GridStore::new(GridCfg::default()));
        store.paste_block(0, 0, text);
        let pending = store.begin_validation(&store.snapshot().pending());
        let res: Vec<Resolution> = pending
            .into_iter()
            .map(|(row_id, ticker)| Resolution { valid: ticker != "XXXX4", row_id, ticker })
            .collect();
        store.merge_resolutions(&res);
        store
    }

    #[test]
    fn request_without_valid_rows_stays_idle_with_error() {
        let store = store_with("XXXX4\t10\t1\nPETR4\t0\t1");
        let gate = CommitGate::new(store.clone(), Arc::new(FakeSink::default()));
        assert!(matches!(gate.request_save(), Err(GateError::NoSubmittableRows)));
        assert_eq!(gate.state(), GateState::Idle);
        assert_eq!(store.snapshot().error.as_deref(), Some(MSG_NO_VALID_ROWS));
    }

    #[test]
    fn request_then_cancel() {
        let store = store_with("PETR4\t29,90\t100");
        let gate = CommitGate::new(store.clone(), Arc::new(FakeSink::default()));
        assert_eq!(gate.request_save().unwrap(), 1);
        assert_eq!(gate.state(), GateState::Confirming);
        assert!(gate.cancel());
        assert_eq!(gate.state(), GateState::Idle);
        assert!(!gate.cancel());
        assert_eq!(store.snapshot().rows[0].ticker, "PETR4");
    }

    #[tokio::test]
    async fn confirm_submits_valid_rows_and_resets() {
        let store = store_with("PETR4\t29,90\t100\nXXXX4\t1\t1\nVALE3\t68,50\t50");
        let sink = Arc::new(FakeSink::default());
        let notified = Arc::new(AtomicUsize::new(0));
        let gate = CommitGate::new(store.clone(), sink.clone()).on_saved({
            let notified = notified.clone();
            move |n| { notified.store(n, Ordering::SeqCst); }
        });
        store.set_error(Some("stale".into()));

        gate.request_save().unwrap();
        assert_eq!(gate.confirm_save().await.unwrap(), 2);

        let saved = sink.saved.lock().await.clone();
        assert_eq!(saved, vec![
            Holding { ticker: "PETR4".into(), price: 29.90, quantity: 100 },
            Holding { ticker: "VALE3".into(), price: 68.50, quantity: 50 },
        ]);
        let snap = store.snapshot();
        assert_eq!(snap.rows.len(), 10);
        assert!(snap.rows.iter().enumerate().all(|(i, r)| r.id == RowId(i as u64) && r.is_empty()));
        assert!(snap.error.is_none());
        assert_eq!(gate.state(), GateState::Idle);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_overwrite_keeps_grid() {
        let store = store_with("PETR4\t29,90\t100");
        let before = store.snapshot().rows.clone();
        let gate = CommitGate::new(store.clone(), Arc::new(FakeSink { fail: true, ..Default::default() }));

        gate.request_save().unwrap();
        assert!(matches!(gate.confirm_save().await, Err(GateError::Backend(_))));
        let snap = store.snapshot();
        assert_eq!(snap.rows, before);
        assert_eq!(snap.error.as_deref(), Some(MSG_SAVE_FAILED));
        assert_eq!(gate.state(), GateState::Idle);

        // retry without re-entering data
        assert!(gate.request_save().is_ok());
    }

    #[test]
    fn request_with_nothing_left_closes_confirmation() {
        let store = store_with("PETR4\t29,90\t100");
        let gate = CommitGate::new(store.clone(), Arc::new(FakeSink::default()));
        gate.request_save().unwrap();
        assert_eq!(gate.state(), GateState::Confirming);

        store.set_cell(RowId(0), crate::domain::Field::Ticker, "");
        assert!(matches!(gate.request_save(), Err(GateError::NoSubmittableRows)));
        assert_eq!(gate.state(), GateState::Idle);
        assert!(!gate.cancel());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_is_published_after_reset() {
        let store = store_with("PETR4\t29,90\t100");
        let gate = Arc::new(CommitGate::new(store.clone(), Arc::new(FakeSink::default())));
        gate.request_save().unwrap();

        let mut state_rx = gate.subscribe();
        state_rx.borrow_and_update();
        let watcher = tokio::spawn({
            let store = store.clone();
            async move {
                loop {
                    state_rx.changed().await.unwrap();
                    if *state_rx.borrow_and_update() == GateState::Idle {
                        return store.snapshot().filled_rows();
                    }
                }
            }
        });

        assert_eq!(gate.confirm_save().await.unwrap(), 1);
        assert_eq!(watcher.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn confirm_requires_confirmation_step() {
        let store = store_with("PETR4\t29,90\t100");
        let gate = CommitGate::new(store, Arc::new(FakeSink::default()));
        assert!(matches!(gate.confirm_save().await, Err(GateError::NotConfirming)));
    }

    #[tokio::test]
    async fn no_second_save_while_saving() {
        let store = store_with("PETR4\t29,90\t100");
        let release = Arc::new(Notify::new());
        let sink = Arc::new(FakeSink { gate: Some(release.clone()), ..Default::default() });
        let gate = Arc::new(CommitGate::new(store, sink.clone()));

        gate.request_save().unwrap();
        let mut state_rx = gate.subscribe();
        let first = tokio::spawn({
            let gate = gate.clone();
            async move { gate.confirm_save().await }
        });
        while *state_rx.borrow_and_update() != GateState::Saving {
            state_rx.changed().await.unwrap();
        }

        assert!(matches!(gate.request_save(), Err(GateError::SaveInProgress)));
        assert!(matches!(gate.confirm_save().await, Err(GateError::SaveInProgress)));
        assert!(!gate.cancel());

        release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
    }
}
