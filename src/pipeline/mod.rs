//! Pipeline orchestrator: source → normalize → detect → coerce → upsert → notify.
//!
//! ## Run modes
//!
//! `run()` — cron mode:
//!   1. Fetch the flow table and turn it into raw rows
//!   2. Normalize every row (ticker discovery spans the whole table)
//!   3. Keep the most recent `pipeline.window` days and process them one by one
//!   4. Hand the change records to the notifier
//!   Idempotent: each day is keyed by its identity, re-running rewrites the same rows.
//!
//! `seed()` — process a full historical dump, no notifications.

pub mod change;
pub mod coerce;
pub mod identity;

use crate::config::{AppConfig, Market, StorageFailurePolicy};
use crate::error::{PipelineError, StorageError};
use crate::models::{ChangeRecord, DayIdentity, NormalizedDayRecord, PersistedFlowRecord, RawDayRecord};
use crate::normalize::{normalize_rows, TickerRegistry};
use crate::notify::{notify_changes, Notifier};
use crate::scraper::FlowSource;
use crate::storage::{FlowStore, Repository};
use anyhow::{Context, Result};
use tracing::{error, info, warn};

use self::change::{detect, FinalizedDay};
use self::coerce::{coerce_cell, coerce_total};
use self::identity::{close_of_business, day_label};

// ── Per-day unit of work ──────────────────────────────────────────────────────

/// Coerce the day's cells for every column the store knows about.
pub fn finalize(day: &NormalizedDayRecord, registry: &TickerRegistry, columns: &[String]) -> FinalizedDay {
    let flows = columns
        .iter()
        .map(|t| {
            let v = registry.position(t).map(|i| coerce_cell(day.flow(i))).unwrap_or(0.0);
            (t.clone(), v)
        })
        .collect();
    FinalizedDay { flows, total: coerce_total(day.total) }
}

/// Write the whole day under its identity.
pub fn upsert_day<S: FlowStore + ?Sized>(
    store: &S,
    id: &DayIdentity,
    day: &NormalizedDayRecord,
    finalized: &FinalizedDay,
) -> Result<(), StorageError> {
    let record = PersistedFlowRecord {
        id: id.clone(),
        day: day_label(day.date),
        close_of_business_hour: close_of_business(day.date),
        flows: finalized.flows.clone(),
        total: finalized.total,
        raw: day.raw.to_json(),
    };
    store.upsert(&record)
}

/// Detect, coerce, upsert. On failure nothing was written for this day.
pub fn process_day<S: FlowStore + ?Sized>(
    store: &S,
    registry: &TickerRegistry,
    columns: &[String],
    day: &NormalizedDayRecord,
) -> Result<ChangeRecord, PipelineError> {
    let pending = detect(store, day).map_err(|source| PipelineError::Storage {
        identity: identity::day_identity(day.date),
        source,
    })?;

    let finalized = finalize(day, registry, columns);

    upsert_day(store, &pending.id, day, &finalized).map_err(|source| PipelineError::Storage {
        identity: pending.id.clone(),
        source,
    })?;

    info!(
        "{}: total {} (was {:?}){}",
        pending.id,
        finalized.total,
        pending.previous_total,
        if pending.is_new_day { " [new]" } else { "" }
    );

    Ok(pending.complete(&finalized))
}

#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// One per committed day, including those before a halt.
    pub changes: Vec<ChangeRecord>,
    pub skipped: usize,
    /// Set when the halt policy stopped the batch early.
    pub halted: Option<PipelineError>,
}

/// Process days in order. Days already written stay written when a later one fails.
pub fn process_days<S: FlowStore + ?Sized>(
    store: &S,
    registry: &TickerRegistry,
    columns: &[String],
    days: &[NormalizedDayRecord],
    policy: StorageFailurePolicy,
) -> ProcessOutcome {
    for ticker in registry.tickers().iter().filter(|t| !columns.contains(*t)) {
        warn!("Ticker {} has no column in the store; kept in raw only", ticker);
    }

    let mut out = ProcessOutcome::default();
    for day in days {
        match process_day(store, registry, columns, day) {
            Ok(change) => out.changes.push(change),
            Err(e) if policy == StorageFailurePolicy::Skip => {
                warn!("{:#}; skipping day", e);
                out.skipped += 1;
            }
            Err(e) => {
                error!("{:#}; halting after {} days", e, out.changes.len());
                out.halted = Some(e);
                break;
            }
        }
    }
    out
}

/// The tail of `days` a run should touch; 0 = all.
pub fn window(days: &[NormalizedDayRecord], n: usize) -> &[NormalizedDayRecord] {
    if n == 0 || n >= days.len() { days } else { &days[days.len() - n..] }
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct Pipeline {
    config: AppConfig,
    market: Market,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub rows: usize,
    pub rejected: usize,
    pub cell_failures: usize,
    pub days_processed: usize,
    pub days_created: usize,
    pub skipped: usize,
    pub alerts_sent: usize,
}

/// Result of pushing a batch of rows into a store.
#[derive(Debug)]
pub struct RunReport {
    pub stats: PipelineStats,
    pub changes: Vec<ChangeRecord>,
    pub halted: Option<PipelineError>,
}

impl Pipeline {
    /// Fails with `ConfigurationMissing` before anything is opened.
    pub fn new(config: AppConfig) -> Result<Self, PipelineError> {
        let market = config.resolve()?;
        Ok(Self { config, market })
    }

    pub fn market(&self) -> &Market {
        &self.market
    }

    pub fn open_repository(&self) -> Result<Repository> {
        let repo = Repository::open(&self.config.storage.db_path, &self.market)
            .context("Failed to open DuckDB")?;
        if self.config.storage.run_migrations {
            repo.run_migrations()?;
        }
        Ok(repo)
    }

    /// Normalize all rows with a registry seeded from the store's columns,
    /// then process the last `window` days.
    pub fn process_rows<S: FlowStore + ?Sized>(
        &self,
        store: &S,
        rows: &[RawDayRecord],
        window_days: usize,
    ) -> RunReport {
        let mut registry = TickerRegistry::with_known(&self.market.tickers);
        let normalized = normalize_rows(rows, &mut registry);
        let days = window(&normalized.days, window_days);

        info!(
            "{} rows → {} days ({} rejected), processing {}",
            rows.len(), normalized.days.len(), normalized.rejected, days.len()
        );

        let outcome = process_days(
            store,
            &registry,
            &self.market.tickers,
            days,
            self.config.pipeline.on_storage_error,
        );

        let stats = PipelineStats {
            rows: rows.len(),
            rejected: normalized.rejected,
            cell_failures: normalized.cell_failures,
            days_processed: outcome.changes.len(),
            days_created: outcome.changes.iter().filter(|c| c.is_new_day).count(),
            skipped: outcome.skipped,
            alerts_sent: 0,
        };
        RunReport { stats, changes: outcome.changes, halted: outcome.halted }
    }

    /// Process rows and alert for every committed day, even when a later
    /// day halted the batch.
    pub async fn process_and_notify<S: FlowStore + ?Sized>(
        &self,
        store: &S,
        rows: &[RawDayRecord],
        notifier: &dyn Notifier,
        trigger: &str,
    ) -> RunReport {
        let mut report = self.process_rows(store, rows, self.config.pipeline.window);

        info!("=== Step 3: Notifying ===");
        match notify_changes(notifier, &report.changes, trigger, &self.config.notify.environment).await {
            Ok(sent) => report.stats.alerts_sent = sent,
            Err(e) => warn!("Notification failed: {:#}", e),
        }
        report
    }

    /// Cron entry point.
    pub async fn run(&self, source: &dyn FlowSource, notifier: &dyn Notifier, trigger: &str) -> Result<PipelineStats> {
        let repo = self.open_repository()?;
        let run_id = repo.begin_run().unwrap_or(0);

        info!("=== Step 1: Fetching flow table ===");
        let rows = match source.fetch_rows().await.context("Flow table fetch failed") {
            Ok(rows) => rows,
            Err(e) => {
                repo.finish_run(run_id, 0, 0, Some(&format!("{:#}", e))).ok();
                return Err(e);
            }
        };

        if rows.is_empty() {
            info!("Empty table, nothing to do");
            repo.finish_run(run_id, 0, 0, None).ok();
            return Ok(PipelineStats::default());
        }

        info!("=== Step 2: Upserting latest days ===");
        let report = self.process_and_notify(&repo, &rows, notifier, trigger).await;
        let stats = report.stats;

        let note = match &report.halted {
            Some(e) => Some(e.to_string()),
            None => (stats.skipped > 0).then(|| format!("{} days skipped", stats.skipped)),
        };
        repo.finish_run(run_id, stats.days_processed, stats.days_created, note.as_deref()).ok();

        match report.halted {
            Some(e) => Err(e.into()),
            None => Ok(stats),
        }
    }

    /// Historical load: every row, no window, no alerts.
    pub fn seed(&self, rows: &[RawDayRecord]) -> Result<PipelineStats> {
        let repo = self.open_repository()?;
        let report = self.process_rows(&repo, rows, 0);
        match report.halted {
            Some(e) => {
                warn!("Seed halted after {} days", report.stats.days_processed);
                Err(e.into())
            }
            None => Ok(report.stats),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FlowCell;
    use async_trait::async_trait;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// HashMap-backed store that can be told to fail on a given day.
    #[derive(Default)]
    struct MemoryStore {
        records: RefCell<HashMap<DayIdentity, PersistedFlowRecord>>,
        fail_on: Option<&'static str>,
        writes: Cell<usize>,
    }

    impl FlowStore for MemoryStore {
        fn find_by_identity(&self, id: &DayIdentity) -> Result<Option<PersistedFlowRecord>, StorageError> {
            Ok(self.records.borrow().get(id).cloned())
        }

        fn upsert(&self, record: &PersistedFlowRecord) -> Result<(), StorageError> {
            if self.fail_on == Some(record.id.as_str()) {
                return Err(StorageError::Rejected("injected".into()));
            }
            self.writes.set(self.writes.get() + 1);
            self.records.borrow_mut().insert(record.id.clone(), record.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, message: &str) -> Result<()> {
            self.0.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn pipeline() -> Pipeline {
        let mut cfg = AppConfig::default();
        cfg.market.tickers = Some(vec!["IBIT".into(), "FBTC".into()]);
        Pipeline::new(cfg).unwrap()
    }

    fn row(date: &str, ibit: &str) -> RawDayRecord {
        RawDayRecord::new().with("Date", date).with("IBIT", ibit).with("Total", ibit)
    }

    fn id(s: &str) -> DayIdentity {
        DayIdentity::from(s.to_string())
    }

    #[test]
    fn test_new_day_then_restatement() {
        let store = MemoryStore::default();
        let p = pipeline();

        let first = p.process_rows(&store, &[row("2024-01-10", "100.5")], 0);
        let c = &first.changes[0];
        assert!(c.is_new_day);
        assert_eq!(c.previous_total, None);
        assert_eq!(c.new_total, 100.5);

        let second = p.process_rows(&store, &[row("2024-01-10", "(20)")], 0);
        let c = &second.changes[0];
        assert!(!c.is_new_day);
        assert_eq!(c.previous_total, Some(100.5));
        assert_eq!(c.new_total, -20.0);
    }

    #[test]
    fn test_same_day_twice_is_idempotent() {
        let store = MemoryStore::default();
        let p = pipeline();
        let rows = [row("2024-01-10", "1,000")];

        p.process_rows(&store, &rows, 0);
        let after_first = store.records.borrow().clone();
        let again = p.process_rows(&store, &rows, 0);

        assert!(!again.changes[0].is_new_day);
        assert_eq!(again.changes[0].previous_total, Some(1000.0));
        assert_eq!(*store.records.borrow(), after_first);
    }

    #[test]
    fn test_restatement_within_one_batch() {
        let store = Repository::open_in_memory(pipeline().market()).unwrap();
        store.run_migrations().unwrap();
        let rows = [
            RawDayRecord::new().with("Date", "2024-01-10").with("IBIT", "100.5").with("Total", "100.5"),
            RawDayRecord::new().with("Date", "2024-01-10").with("IBIT", "(50)").with("Total", "-50"),
        ];

        let report = pipeline().process_rows(&store, &rows, 0);

        assert_eq!(store.day_count().unwrap(), 1);
        let stored = store.find_by_identity(&id("wed-10-jan-2024")).unwrap().unwrap();
        assert_eq!(stored.flow("IBIT"), Some(-50.0));
        assert_eq!(stored.total, -50.0);

        let second = &report.changes[1];
        assert_eq!(second.id.as_str(), "wed-10-jan-2024");
        assert!(!second.is_new_day);
        assert_eq!(second.previous_total, Some(100.5));
        assert_eq!(second.new_total, -50.0);
    }

    #[test]
    fn test_rejected_rows_never_stored() {
        let store = MemoryStore::default();
        let rows = [
            row("2024-01-10", "1"),
            row("Total", "5"),
            row("2024-01-11", "2"),
            row("Maximum", "9"),
        ];
        let report = pipeline().process_rows(&store, &rows, 0);
        assert_eq!(report.stats.rejected, 2);
        assert_eq!(report.stats.days_processed, 2);
        assert_eq!(store.records.borrow().len(), 2);
    }

    #[test]
    fn test_window_keeps_latest_days() {
        let store = MemoryStore::default();
        let rows: Vec<_> = (10..=16).map(|d| row(&format!("2024-01-{}", d), "1")).collect();
        let report = pipeline().process_rows(&store, &rows, 3);
        let ids: Vec<_> = report.changes.iter().map(|c| c.id.to_string()).collect();
        assert_eq!(ids, ["sun-14-jan-2024", "mon-15-jan-2024", "tue-16-jan-2024"]);
    }

    #[test]
    fn test_window_and_full_history_agree() {
        let rows: Vec<_> = (10..=14).map(|d| row(&format!("2024-01-{}", d), &d.to_string())).collect();
        let full = MemoryStore::default();
        pipeline().process_rows(&full, &rows, 0);

        let windowed = MemoryStore::default();
        pipeline().process_rows(&windowed, &rows, 0);
        pipeline().process_rows(&windowed, &rows, 2);

        assert_eq!(*full.records.borrow(), *windowed.records.borrow());
    }

    #[test]
    fn test_halt_keeps_earlier_days() {
        let store = MemoryStore { fail_on: Some("thu-11-jan-2024"), ..Default::default() };
        let rows = [row("2024-01-10", "1"), row("2024-01-11", "2"), row("2024-01-12", "3")];
        let report = pipeline().process_rows(&store, &rows, 0);
        assert_eq!(report.stats.days_processed, 1);
        match report.halted.unwrap() {
            PipelineError::Storage { identity, .. } => assert_eq!(identity.as_str(), "thu-11-jan-2024"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.writes.get(), 1);
        assert!(store.records.borrow().contains_key(&id("wed-10-jan-2024")));
    }

    #[test]
    fn test_halt_still_alerts_committed_days() {
        let store = MemoryStore { fail_on: Some("thu-11-jan-2024"), ..Default::default() };
        let rows = [row("2024-01-10", "1"), row("2024-01-11", "2")];
        let recorder = Recorder::default();

        let report = tokio_test::block_on(pipeline().process_and_notify(&store, &rows, &recorder, "cron"));

        assert!(matches!(report.halted, Some(PipelineError::Storage { .. })));
        assert_eq!(report.changes.len(), 1);
        assert_eq!(report.changes[0].id.as_str(), "wed-10-jan-2024");
        assert!(report.changes[0].is_new_day);
        assert_eq!(report.stats.days_processed, 1);
        assert_eq!(report.stats.days_created, 1);
        assert_eq!(report.stats.alerts_sent, 1);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_skip_policy_moves_on() {
        let mut cfg = AppConfig::default();
        cfg.market.tickers = Some(vec!["IBIT".into()]);
        cfg.pipeline.on_storage_error = StorageFailurePolicy::Skip;
        let p = Pipeline::new(cfg).unwrap();

        let store = MemoryStore { fail_on: Some("thu-11-jan-2024"), ..Default::default() };
        let rows = [row("2024-01-10", "1"), row("2024-01-11", "2"), row("2024-01-12", "3")];
        let report = p.process_rows(&store, &rows, 0);
        assert_eq!(report.stats.skipped, 1);
        assert_eq!(report.stats.days_processed, 2);
        assert!(!store.records.borrow().contains_key(&id("thu-11-jan-2024")));
    }

    #[test]
    fn test_finalize_zeroes_missing_and_unreadable() {
        let mut registry = TickerRegistry::with_known(["IBIT", "FBTC"]);
        let day = crate::normalize::normalize(
            &RawDayRecord::new().with("Date", "2024-01-10").with("IBIT", "oops"),
            &mut registry,
        )
        .unwrap();
        assert_eq!(day.flow(0), &FlowCell::Untouched(serde_json::json!("oops")));

        let cols = vec!["IBIT".to_string(), "FBTC".to_string(), "HODL".to_string()];
        let f = finalize(&day, &registry, &cols);
        assert_eq!(f.flows, vec![("IBIT".into(), 0.0), ("FBTC".into(), 0.0), ("HODL".into(), 0.0)]);
        assert_eq!(f.total, 0.0);
        assert_eq!(f.payload(), r#"{"IBIT":0,"FBTC":0,"HODL":0}"#);
    }

    #[test]
    fn test_undeclared_ticker_kept_in_raw_only() {
        let store = MemoryStore::default();
        let rows = [
            row("2024-01-10", "1").with("NEWX", "5"),
            row("2024-01-11", "1").with("NEWX", "6"),
        ];
        let report = pipeline().process_rows(&store, &rows, 0);
        // Discovery on day one, counted on day two.
        assert_eq!(report.changes[0].new_total, 1.0);
        assert_eq!(report.changes[1].new_total, 7.0);
        let stored = store.records.borrow()[&id("thu-11-jan-2024")].clone();
        assert_eq!(stored.flow("NEWX"), None);
        assert_eq!(stored.raw["NEWX"], "6");
    }
}
