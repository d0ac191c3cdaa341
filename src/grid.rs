// ===============================
// src/grid.rs (Grid State Store)
// ===============================
//
// Holds the editable rows and the per-row ticker validation state.
// - Every mutation publishes a new immutable Arc<GridSnapshot> on a watch
//   channel; readers never observe a half-applied edit.
// - Auto-grow: after each edit/paste exactly `min_empty_rows` blank rows
//   follow the last filled row.
// - `ticker_rev` only moves when some ticker text changes; the scheduler
//   debounces on it so status merges do not retrigger validation.
//
use std::sync::Arc;

use ahash::AHashMap as HashMap;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::GridCfg;
use crate::domain::{Event, Field, Holding, Resolution, Row, RowId, TickerCheck, ValidationStatus};
use crate::metrics::GRID_ROWS;
use crate::ticker;

#[derive(Debug, Clone, Default)]
pub struct GridSnapshot {
    pub rows: Vec<Row>,
    pub status: HashMap<RowId, TickerCheck>,
    pub error: Option<String>,
    pub ticker_rev: u64,
}

impl GridSnapshot {
    fn fresh(n: usize) -> Self {
        Self {
            rows: (0..n as u64).map(Row::empty).collect(),
            ..Default::default()
        }
    }

    pub fn row(&self, id: RowId) -> Option<&Row> {
        self.rows.get(id.0 as usize).filter(|r| r.id == id)
    }

    pub fn status_of(&self, id: RowId) -> ValidationStatus {
        self.status.get(&id).map(|c| c.status).unwrap_or_default()
    }

    pub fn last_validated(&self, id: RowId) -> Option<&str> {
        self.status.get(&id).and_then(|c| c.last_validated.as_deref())
    }

    pub fn is_submittable(&self, row: &Row) -> bool {
        let t = ticker::normalize(&row.ticker);
        if t.is_empty() {
            return false;
        }
        let validated = self
            .status
            .get(&row.id)
            .map(|c| c.status == ValidationStatus::Valid && c.last_validated.as_deref() == Some(t.as_str()))
            .unwrap_or(false);
        validated && row.parsed_price().is_some() && row.parsed_quantity().is_some()
    }

    pub fn submittable(&self) -> impl Iterator<Item = &Row> + '_ {
        self.rows.iter().filter(move |r| self.is_submittable(r))
    }

    pub fn holdings(&self) -> Vec<Holding> {
        self.submittable()
            .filter_map(|r| {
                Some(Holding {
                    ticker: ticker::normalize(&r.ticker),
                    price: r.parsed_price()?,
                    quantity: r.parsed_quantity()?,
                })
            })
            .collect()
    }

    /// Rows whose current ticker text has neither been resolved nor is in flight.
    pub fn pending(&self) -> Vec<(RowId, String)> {
        self.rows
            .iter()
            .filter_map(|r| {
                let t = ticker::normalize(&r.ticker);
                if t.is_empty() {
                    return None;
                }
                let seen = self.status.get(&r.id).map(|c| {
                    c.last_validated.as_deref() == Some(t.as_str()) || c.in_flight.as_deref() == Some(t.as_str())
                });
                (!seen.unwrap_or(false)).then_some((r.id, t))
            })
            .collect()
    }

    pub fn filled_rows(&self) -> usize {
        self.rows.iter().filter(|r| !r.is_empty()).count()
    }

    // Keep the status entry of `id` consistent with its (new) ticker text.
    fn on_ticker_changed(&mut self, id: RowId, old: &str, new: &str) {
        let (old_t, new_t) = (ticker::normalize(old), ticker::normalize(new));
        if old_t == new_t {
            return;
        }
        self.ticker_rev += 1;
        if new_t.is_empty() {
            self.status.remove(&id);
            return;
        }
        if let Some(check) = self.status.get_mut(&id) {
            check.status = if check.last_validated.as_deref() == Some(new_t.as_str()) {
                ValidationStatus::from_verdict(check.last_valid)
            } else if check.in_flight.as_deref() == Some(new_t.as_str()) {
                ValidationStatus::Validating
            } else {
                ValidationStatus::Unvalidated
            };
        }
    }

    fn apply_auto_grow(&mut self, min_empty: usize) {
        self.rows = ensure_empty_rows(&self.rows, min_empty);
        let len = self.rows.len() as u64;
        self.status.retain(|id, _| id.0 < len);
    }
}

/// Returns `rows` trimmed or padded so exactly `min_empty` empty rows follow
/// the last filled row, with ids re-numbered to positions. Idempotent.
pub fn ensure_empty_rows(rows: &[Row], min_empty: usize) -> Vec<Row> {
    let keep = rows.iter().rposition(|r| !r.is_empty()).map(|i| i + 1).unwrap_or(0);
    let target = keep + min_empty;

    let mut out: Vec<Row> = rows.iter().take(target).cloned().collect();
    out.resize_with(target, Row::default);
    for (i, r) in out.iter_mut().enumerate() {
        r.id = RowId(i as u64);
    }
    out
}

/// Splits clipboard text into records and cells. A record holding a tab is
/// split on tabs only so decimal commas survive spreadsheet copies.
pub fn parse_clipboard(text: &str) -> Vec<Vec<String>> {
    text.split("\r\n")
        .flat_map(|l| l.split(&['\n', '\r'][..]))
        .filter(|l| !l.trim().is_empty())
        .map(|l| {
            let sep = if l.contains('\t') { '\t' } else { ',' };
            l.split(sep).map(|c| c.trim().to_string()).collect()
        })
        .collect()
}

pub struct GridStore {
    cfg: GridCfg,
    tx: watch::Sender<Arc<GridSnapshot>>,
    rec_tx: Option<mpsc::Sender<Event>>,
}

impl GridStore {
    pub fn new(cfg: GridCfg) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(GridSnapshot::fresh(cfg.initial_rows)));
        GRID_ROWS.set(cfg.initial_rows as i64);
        Self { cfg, tx, rec_tx: None }
    }

    pub fn with_recorder(mut self, rec_tx: mpsc::Sender<Event>) -> Self {
        self.rec_tx = Some(rec_tx);
        self
    }

    pub fn snapshot(&self) -> Arc<GridSnapshot> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<GridSnapshot>> {
        self.tx.subscribe()
    }

    pub(crate) fn record(&self, ev: Event) {
        if let Some(tx) = &self.rec_tx {
            let _ = tx.try_send(ev);
        }
    }

    // Copy-on-write commit; `f` returns (changed, result).
    fn commit<R: Default>(&self, f: impl FnOnce(&mut GridSnapshot) -> (bool, R)) -> R {
        let mut out = None;
        self.tx.send_if_modified(|cur| {
            let mut next = (**cur).clone();
            let (changed, r) = f(&mut next);
            out = Some(r);
            if changed {
                GRID_ROWS.set(next.rows.len() as i64);
                *cur = Arc::new(next);
            }
            changed
        });
        out.unwrap_or_default()
    }

    /// Replaces one cell. Returns `false` when the row does not exist.
    pub fn set_cell(&self, row_id: RowId, field: Field, value: &str) -> bool {
        let min_empty = self.cfg.min_empty_rows;
        let found = self.commit(|s| {
            let Some(idx) = s.rows.iter().position(|r| r.id == row_id) else {
                return (false, false);
            };
            let old = s.rows[idx].get(field).to_string();
            if old == value {
                return (false, true);
            }
            s.rows[idx].set(field, value.to_string());
            if field == Field::Ticker {
                s.on_ticker_changed(row_id, &old, value);
            }
            s.apply_auto_grow(min_empty);
            (true, true)
        });
        if found {
            self.record(Event::Edit { row_id, field, value: value.to_string() });
        } else {
            debug!(%row_id, "set_cell on unknown row");
        }
        found
    }

    /// Pastes clipboard text as a block starting at (start_row, start_col).
    /// Rows are grown first so no record is dropped. An origin past the last
    /// row is ignored. Returns the number of records applied.
    pub fn paste_block(&self, start_row: usize, start_col: usize, text: &str) -> usize {
        let records = parse_clipboard(text);
        if records.is_empty() || start_col >= Field::COLUMNS.len() {
            return 0;
        }
        let min_empty = self.cfg.min_empty_rows;
        let n = records.len();
        let applied = self.commit(|s| {
            // origin must be an existing row; only the spill past the end grows
            if start_row >= s.rows.len() {
                return (false, 0);
            }
            let needed = start_row.saturating_add(n);
            while s.rows.len() < needed {
                let id = s.rows.len() as u64;
                s.rows.push(Row::empty(id));
            }
            for (off, cells) in records.iter().enumerate() {
                let idx = start_row + off;
                for (c, cell) in cells.iter().enumerate() {
                    let Some(field) = Field::from_col(start_col + c) else { break };
                    let value = if field == Field::Ticker { ticker::normalize(cell) } else { cell.clone() };
                    let id = s.rows[idx].id;
                    let old = s.rows[idx].get(field).to_string();
                    s.rows[idx].set(field, value.clone());
                    if field == Field::Ticker {
                        s.on_ticker_changed(id, &old, &value);
                    }
                }
            }
            s.apply_auto_grow(min_empty);
            (true, n)
        });
        if applied == 0 {
            debug!(start_row, rows = self.snapshot().rows.len(), "paste origin outside the grid, ignored");
            return 0;
        }
        self.record(Event::Paste { start_row, start_col, records: applied });
        applied
    }

    /// Back to `initial_rows` empty rows, ids from 0, no statuses, no error.
    pub fn reset(&self) {
        let n = self.cfg.initial_rows;
        self.commit(|s| {
            let rev = s.ticker_rev + 1;
            *s = GridSnapshot { ticker_rev: rev, ..GridSnapshot::fresh(n) };
            (true, ())
        });
        self.record(Event::Reset { rows: n });
    }

    pub fn set_error(&self, msg: Option<String>) {
        self.commit(|s| {
            if s.error == msg {
                return (false, ());
            }
            s.error = msg;
            (true, ())
        });
    }

    /// Marks rows as in flight for the given ticker text. Rows whose ticker
    /// changed since `pending()` was computed are skipped.
    pub fn begin_validation(&self, batch: &[(RowId, String)]) -> Vec<(RowId, String)> {
        self.commit(|s| {
            let mut started = Vec::new();
            for (id, t) in batch {
                let Some(row) = s.row(*id) else { continue };
                if ticker::normalize(&row.ticker) != *t {
                    continue;
                }
                let check = s.status.entry(*id).or_default();
                check.status = ValidationStatus::Validating;
                check.in_flight = Some(t.clone());
                started.push((*id, t.clone()));
            }
            (!started.is_empty(), started)
        })
    }

    /// Merges one pass of resolutions in a single snapshot. A resolution is
    /// applied only if the row still holds the ticker it was issued for.
    /// Returns (applied, stale).
    pub fn merge_resolutions(&self, batch: &[Resolution]) -> (usize, usize) {
        if batch.is_empty() {
            return (0, 0);
        }
        let mut events = Vec::with_capacity(batch.len());
        let counts = self.commit(|s| {
            let (mut applied, mut stale) = (0, 0);
            for res in batch {
                let current = s.row(res.row_id).map(|r| ticker::normalize(&r.ticker));
                let check = s.status.entry(res.row_id).or_default();
                if check.in_flight.as_deref() == Some(res.ticker.as_str()) {
                    check.in_flight = None;
                }
                if current.as_deref() != Some(res.ticker.as_str()) {
                    stale += 1;
                    events.push(Event::Stale { row_id: res.row_id, ticker: res.ticker.clone() });
                    continue;
                }
                check.status = ValidationStatus::from_verdict(res.valid);
                check.last_validated = Some(res.ticker.clone());
                check.last_valid = res.valid;
                applied += 1;
                events.push(Event::Resolved {
                    row_id: res.row_id,
                    ticker: res.ticker.clone(),
                    status: check.status,
                });
            }
            // drop entries created for rows that vanished or were cleared
            let rows = &s.rows;
            s.status.retain(|id, _| rows.get(id.0 as usize).map(|r| !ticker::normalize(&r.ticker).is_empty()).unwrap_or(false));
            (true, (applied, stale))
        });
        for ev in events {
            self.record(ev);
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> GridStore {
        GridStore::new(GridCfg { initial_rows: 10, min_empty_rows: 5 })
    }

    fn filled(ticker: &str) -> Row {
        Row { ticker: ticker.into(), price: "1".into(), quantity: "1".into(), ..Default::default() }
    }

    fn trailing_empty(rows: &[Row]) -> usize {
        rows.iter().rev().take_while(|r| r.is_empty()).count()
    }

    #[test]
    fn ensure_empty_rows_is_idempotent() {
        let shapes: Vec<Vec<Row>> = vec![
            vec![],
            vec![Row::default(); 12],
            vec![filled("A"), Row::default(), filled("B")],
            (0..20).map(|i| if i % 7 == 0 { filled("X") } else { Row::default() }).collect(),
        ];
        for rows in shapes {
            let once = ensure_empty_rows(&rows, 5);
            assert_eq!(ensure_empty_rows(&once, 5), once);
        }
    }

    #[test]
    fn ensure_empty_rows_keeps_exactly_k_trailing() {
        let none = ensure_empty_rows(&vec![Row::default(); 10], 5);
        assert_eq!(none.len(), 5);

        let mut rows = vec![Row::default(); 3];
        rows[2] = filled("PETR4");
        let out = ensure_empty_rows(&rows, 5);
        assert_eq!(out.len(), 8);
        assert_eq!(trailing_empty(&out), 5);
        assert_eq!(out[2].ticker, "PETR4");

        let ids: Vec<u64> = out.iter().map(|r| r.id.0).collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn ensure_empty_rows_prunes_excess() {
        let mut rows = vec![Row::default(); 30];
        rows[1] = filled("VALE3");
        let out = ensure_empty_rows(&rows, 5);
        assert_eq!(out.len(), 7);
    }

    #[test]
    fn clipboard_tab_records_keep_decimal_comma() {
        let cells = parse_clipboard("PETR4\t29,90\t100\r\n\nVALE3,68.50,50\r");
        assert_eq!(cells, vec![
            vec!["PETR4".to_string(), "29,90".into(), "100".into()],
            vec!["VALE3".to_string(), "68.50".into(), "50".into()],
        ]);
    }

    #[test]
    fn paste_fills_block_from_origin() {
        let s = store();
        s.paste_block(0, 0, "PETR4\t29,90\t100\nVALE3\t68,50\t50");
        let snap = s.snapshot();
        let r0 = &snap.rows[0];
        assert_eq!((r0.ticker.as_str(), r0.quantity.as_str()), ("PETR4", "100"));
        assert_eq!(r0.parsed_price(), Some(29.90));
        let r1 = &snap.rows[1];
        assert_eq!((r1.ticker.as_str(), r1.quantity.as_str()), ("VALE3", "50"));
        assert_eq!(r1.parsed_price(), Some(68.50));
        assert!(snap.rows[2..].iter().all(Row::is_empty));
        assert_eq!(trailing_empty(&snap.rows), 5);
    }

    #[test]
    fn paste_uppercases_tickers_and_skips_extra_columns() {
        let s = store();
        s.paste_block(1, 1, "10\t5\textra\n");
        let snap = s.snapshot();
        assert_eq!(snap.rows[1].price, "10");
        assert_eq!(snap.rows[1].quantity, "5");

        s.paste_block(0, 0, " itub4 ");
        assert_eq!(s.snapshot().rows[0].ticker, "ITUB4");
    }

    #[test]
    fn paste_larger_than_grid_is_not_dropped() {
        let s = store();
        let text: String = (0..25).map(|i| format!("TCK{i:02}\t1\t1\n")).collect();
        assert_eq!(s.paste_block(3, 0, &text), 25);
        let snap = s.snapshot();
        assert_eq!(snap.rows[27].ticker, "TCK24");
        assert_eq!(snap.rows.len(), 28 + 5);
    }

    #[test]
    fn paste_origin_outside_grid_is_ignored() {
        let s = store();
        let mut rx = s.subscribe();
        rx.borrow_and_update();

        assert_eq!(s.paste_block(5000, 0, "PETR4\t1\t1"), 0);
        assert_eq!(s.paste_block(usize::MAX, 0, "PETR4"), 0);
        assert_eq!(s.paste_block(10, 0, "PETR4"), 0);
        assert!(!rx.has_changed().unwrap());
        let snap = s.snapshot();
        assert_eq!(snap.rows.len(), 10);
        assert_eq!(snap.filled_rows(), 0);

        // last existing row is a valid origin and spills past the end
        assert_eq!(s.paste_block(9, 0, "PETR4\nVALE3"), 2);
        assert_eq!(s.snapshot().rows.len(), 11 + 5);
    }

    #[test]
    fn set_cell_grows_and_bumps_ticker_rev() {
        let s = store();
        let rev0 = s.snapshot().ticker_rev;
        assert!(s.set_cell(RowId(7), Field::Ticker, "PETR4"));
        let snap = s.snapshot();
        assert_eq!(snap.ticker_rev, rev0 + 1);
        assert_eq!(snap.rows.len(), 13);

        s.set_cell(RowId(7), Field::Price, "10");
        assert_eq!(s.snapshot().ticker_rev, rev0 + 1);
        assert!(!s.set_cell(RowId(99), Field::Price, "1"));
    }

    #[test]
    fn reset_restores_initial_rows() {
        let s = store();
        s.paste_block(0, 0, "PETR4\t1\t1");
        s.set_error(Some("boom".into()));
        s.reset();
        let snap = s.snapshot();
        assert_eq!(snap.rows.len(), 10);
        assert!(snap.rows.iter().enumerate().all(|(i, r)| r.id == RowId(i as u64) && r.is_empty()));
        assert!(snap.status.is_empty());
        assert!(snap.error.is_none());
    }

    #[test]
    fn stale_resolution_is_discarded() {
        let s = store();
        s.set_cell(RowId(0), Field::Ticker, "AAAA");
        let started = s.begin_validation(&s.snapshot().pending());
        assert_eq!(started, vec![(RowId(0), "AAAA".to_string())]);

        s.set_cell(RowId(0), Field::Ticker, "BBBB");
        let (applied, stale) = s.merge_resolutions(&[Resolution { row_id: RowId(0), ticker: "AAAA".into(), valid: true }]);
        assert_eq!((applied, stale), (0, 1));
        let snap = s.snapshot();
        assert_eq!(snap.status_of(RowId(0)), ValidationStatus::Unvalidated);
        assert_eq!(snap.last_validated(RowId(0)), None);
        assert_eq!(snap.pending(), vec![(RowId(0), "BBBB".to_string())]);
    }

    #[test]
    fn returning_to_resolved_ticker_reuses_verdict() {
        let s = store();
        s.set_cell(RowId(0), Field::Ticker, "PETR4");
        s.begin_validation(&s.snapshot().pending());
        s.merge_resolutions(&[Resolution { row_id: RowId(0), ticker: "PETR4".into(), valid: true }]);
        s.set_cell(RowId(0), Field::Ticker, "PETR");
        assert_eq!(s.snapshot().status_of(RowId(0)), ValidationStatus::Unvalidated);
        s.set_cell(RowId(0), Field::Ticker, "PETR4");
        let snap = s.snapshot();
        assert_eq!(snap.status_of(RowId(0)), ValidationStatus::Valid);
        assert!(snap.pending().is_empty());
    }

    #[test]
    fn submittable_requires_valid_status_price_and_quantity() {
        let s = store();
        s.paste_block(0, 0, "PETR4\t29,90\t100\nVALE3\t0\t50\nITUB4\t10\t1.5");
        let pending = s.snapshot().pending();
        s.begin_validation(&pending);
        let res: Vec<Resolution> = pending
            .into_iter()
            .map(|(row_id, ticker)| Resolution { row_id, ticker, valid: true })
            .collect();
        s.merge_resolutions(&res);
        let snap = s.snapshot();
        let ok: Vec<&str> = snap.submittable().map(|r| r.ticker.as_str()).collect();
        assert_eq!(ok, vec!["PETR4"]);
        assert_eq!(snap.holdings(), vec![Holding { ticker: "PETR4".into(), price: 29.90, quantity: 100 }]);
    }
}
