use crate::config::Market;
use crate::error::StorageError;
use crate::models::{DayIdentity, PersistedFlowRecord};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use duckdb::{params, Connection, OptionalExt, ToSql};
use std::path::Path;
use tracing::{debug, info};

// ── Store contract ────────────────────────────────────────────────────────────

/// The two operations the pipeline needs from durable storage.
pub trait FlowStore {
    fn find_by_identity(&self, id: &DayIdentity) -> Result<Option<PersistedFlowRecord>, StorageError>;

    /// Replace-or-insert the one record for `record.id`, all fields at once.
    fn upsert(&self, record: &PersistedFlowRecord) -> Result<(), StorageError>;
}

// ── Schema ────────────────────────────────────────────────────────────────────

const RUN_DDL: &str = r#"
CREATE SEQUENCE IF NOT EXISTS flow_runs_seq START 1;

CREATE TABLE IF NOT EXISTS flow_runs (
    id              BIGINT PRIMARY KEY DEFAULT nextval('flow_runs_seq'),
    flow_table      VARCHAR NOT NULL,
    started_at      TIMESTAMP NOT NULL,
    finished_at     TIMESTAMP,
    status          VARCHAR NOT NULL DEFAULT 'running',
    days_processed  INTEGER DEFAULT 0,
    days_created    INTEGER DEFAULT 0,
    error_msg       VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

/// Flow table layout: fixed columns plus one DOUBLE per known ticker.
/// Names were checked by `config::is_identifier` before they get here.
#[derive(Debug, Clone)]
struct FlowTable {
    name: String,
    tickers: Vec<String>,
}

impl FlowTable {
    fn ddl(&self) -> String {
        format!(
            r#"CREATE TABLE IF NOT EXISTS {t} (
    id                      VARCHAR PRIMARY KEY,
    day                     VARCHAR NOT NULL,
    close_of_business_hour  TIMESTAMP NOT NULL,
    total                   DOUBLE NOT NULL DEFAULT 0,
    raw                     VARCHAR NOT NULL,
    updated_at              TIMESTAMP NOT NULL
);"#,
            t = self.name
        )
    }

    fn add_column(&self, ticker: &str) -> String {
        format!(
            r#"ALTER TABLE {} ADD COLUMN IF NOT EXISTS "{}" DOUBLE DEFAULT 0"#,
            self.name, ticker
        )
    }

    fn ticker_columns(&self) -> String {
        self.tickers.iter().map(|t| format!(r#""{}""#, t)).collect::<Vec<_>>().join(", ")
    }

    fn select_sql(&self) -> String {
        format!(
            "SELECT id, day, close_of_business_hour, total, raw, {} FROM {}",
            self.ticker_columns(),
            self.name
        )
    }

    fn upsert_sql(&self) -> String {
        let placeholders = vec!["?"; 6 + self.tickers.len()].join(", ");
        let updates: Vec<String> = ["day", "close_of_business_hour", "total", "raw", "updated_at"]
            .iter()
            .map(|c| c.to_string())
            .chain(self.tickers.iter().map(|t| format!(r#""{}""#, t)))
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        format!(
            r#"INSERT INTO {t}
                (id, day, close_of_business_hour, total, raw, updated_at, {cols})
            VALUES ({placeholders})
            ON CONFLICT (id) DO UPDATE SET {updates}"#,
            t = self.name,
            cols = self.ticker_columns(),
            updates = updates.join(", "),
        )
    }
}

// ── Repository ────────────────────────────────────────────────────────────────

pub struct Repository {
    conn: Connection,
    table: FlowTable,
}

impl Repository {
    pub fn open(path: &Path, market: &Market) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self::with_connection(conn, market))
    }

    pub fn open_in_memory(market: &Market) -> Result<Self> {
        Ok(Self::with_connection(Connection::open_in_memory()?, market))
    }

    fn with_connection(conn: Connection, market: &Market) -> Self {
        let table = FlowTable { name: market.table.clone(), tickers: market.tickers.clone() };
        Self { conn, table }
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations on {}…", self.table.name);
        self.conn.execute_batch(RUN_DDL).context("Run log DDL failed")?;
        self.conn.execute_batch(&self.table.ddl()).context("Flow table DDL failed")?;
        for ticker in &self.table.tickers {
            self.conn
                .execute_batch(&self.table.add_column(ticker))
                .with_context(|| format!("add column {}", ticker))?;
        }
        self.conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Reads ─────────────────────────────────────────────────────────────────

    fn read_record(&self, row: &duckdb::Row<'_>) -> duckdb::Result<(PersistedFlowRecord, String)> {
        let mut flows = Vec::with_capacity(self.table.tickers.len());
        for (i, ticker) in self.table.tickers.iter().enumerate() {
            flows.push((ticker.clone(), row.get::<_, f64>(5 + i)?));
        }
        let raw: String = row.get(4)?;
        let record = PersistedFlowRecord {
            id: DayIdentity::from(row.get::<_, String>(0)?),
            day: row.get(1)?,
            close_of_business_hour: row.get(2)?,
            total: row.get(3)?,
            flows,
            raw: serde_json::Value::Null,
        };
        Ok((record, raw))
    }

    fn decode(&self, (mut record, raw): (PersistedFlowRecord, String)) -> Result<PersistedFlowRecord, StorageError> {
        record.raw = serde_json::from_str(&raw)?;
        Ok(record)
    }

    /// Latest `limit` days by close of business, newest first.
    pub fn recent_days(&self, limit: usize) -> Result<Vec<PersistedFlowRecord>> {
        let sql = format!("{} ORDER BY close_of_business_hour DESC LIMIT ?", self.table.select_sql());
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit as i64], |r| self.read_record(r))?
            .collect::<duckdb::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|r| self.decode(r).map_err(anyhow::Error::from))
            .collect()
    }

    pub fn day_count(&self) -> Result<i64> {
        let mut s = self.conn.prepare(&format!("SELECT COUNT(*) FROM {}", self.table.name))?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn date_range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let mut s = self.conn.prepare(&format!(
            "SELECT MIN(close_of_business_hour)::DATE, MAX(close_of_business_hour)::DATE FROM {}",
            self.table.name
        ))?;
        Ok(s.query_row([], |r| Ok((r.get(0)?, r.get(1)?)))?)
    }

    // ── Run log ───────────────────────────────────────────────────────────────

    pub fn begin_run(&self) -> Result<i64> {
        let id: i64 = self.conn.query_row(
            "INSERT INTO flow_runs (flow_table, started_at, status) VALUES (?, ?, 'running') RETURNING id",
            params![self.table.name, Utc::now().naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_run(&self, run_id: i64, processed: usize, created: usize, error: Option<&str>) -> Result<()> {
        self.conn.execute(
            r#"UPDATE flow_runs SET
               finished_at = ?, status = ?,
               days_processed = ?, days_created = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                Utc::now().naive_utc(),
                if error.is_none() { "success" } else { "error" },
                processed as i64, created as i64, error, run_id,
            ],
        )?;
        Ok(())
    }

    pub fn last_run_status(&self) -> Result<Option<(NaiveDateTime, String)>> {
        let row = self
            .conn
            .query_row(
                "SELECT started_at, status FROM flow_runs WHERE flow_table = ? ORDER BY id DESC LIMIT 1",
                params![self.table.name],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }
}

impl FlowStore for Repository {
    fn find_by_identity(&self, id: &DayIdentity) -> Result<Option<PersistedFlowRecord>, StorageError> {
        let sql = format!("{} WHERE id = ?", self.table.select_sql());
        let found = self
            .conn
            .query_row(&sql, params![id.as_str()], |r| self.read_record(r))
            .optional()?;
        found.map(|r| self.decode(r)).transpose()
    }

    fn upsert(&self, record: &PersistedFlowRecord) -> Result<(), StorageError> {
        if record.flows.len() != self.table.tickers.len()
            || record.flows.iter().zip(&self.table.tickers).any(|((t, _), col)| t != col)
        {
            return Err(StorageError::Rejected(format!(
                "{}: flow columns do not match table {}",
                record.id, self.table.name
            )));
        }

        let raw = serde_json::to_string(&record.raw)?;
        let now = Utc::now().naive_utc();
        let id = record.id.to_string();

        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(6 + record.flows.len());
        values.push(&id);
        values.push(&record.day);
        values.push(&record.close_of_business_hour);
        values.push(&record.total);
        values.push(&raw);
        values.push(&now);
        for (_, v) in &record.flows {
            values.push(v);
        }

        // Single statement: the row is written whole or not at all.
        self.conn.execute(&self.table.upsert_sql(), values.as_slice())?;
        debug!("upserted {} into {}", record.id, self.table.name);
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn market() -> Market {
        Market {
            page_url: "http://localhost/flows".into(),
            table: "flows".into(),
            tickers: vec!["IBIT".into(), "FBTC".into()],
        }
    }

    fn repo() -> Repository {
        let repo = Repository::open_in_memory(&market()).unwrap();
        repo.run_migrations().unwrap();
        repo
    }

    fn record(id: &str, ibit: f64, fbtc: f64) -> PersistedFlowRecord {
        PersistedFlowRecord {
            id: DayIdentity::from(id.to_string()),
            day: "Wed 10 Jan 2024".into(),
            close_of_business_hour: NaiveDate::from_ymd_opt(2024, 1, 10)
                .unwrap()
                .and_hms_opt(17, 0, 0)
                .unwrap(),
            flows: vec![("IBIT".into(), ibit), ("FBTC".into(), fbtc)],
            total: ibit + fbtc,
            raw: json!({"Date": "10 Jan 2024", "IBIT": ibit.to_string()}),
        }
    }

    #[test]
    fn test_migrations_are_repeatable() {
        let repo = repo();
        repo.run_migrations().unwrap();
        assert_eq!(repo.day_count().unwrap(), 0);
    }

    #[test]
    fn test_find_missing_is_none() {
        let repo = repo();
        let id = DayIdentity::from("wed-10-jan-2024".to_string());
        assert!(repo.find_by_identity(&id).unwrap().is_none());
    }

    #[test]
    fn test_upsert_then_find() {
        let repo = repo();
        let rec = record("wed-10-jan-2024", 100.5, -2.0);
        repo.upsert(&rec).unwrap();
        let back = repo.find_by_identity(&rec.id).unwrap().unwrap();
        assert_eq!(back.flow("IBIT"), Some(100.5));
        assert_eq!(back.total, 98.5);
        assert_eq!(back.raw, rec.raw);
        assert_eq!(back.close_of_business_hour, rec.close_of_business_hour);
    }

    #[test]
    fn test_upsert_replaces_without_duplicating() {
        let repo = repo();
        repo.upsert(&record("wed-10-jan-2024", 100.5, 0.0)).unwrap();
        repo.upsert(&record("wed-10-jan-2024", -50.0, 0.0)).unwrap();
        assert_eq!(repo.day_count().unwrap(), 1);
        let back = repo
            .find_by_identity(&DayIdentity::from("wed-10-jan-2024".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(back.flow("IBIT"), Some(-50.0));
        assert_eq!(back.total, -50.0);
    }

    #[test]
    fn test_mismatched_columns_rejected() {
        let repo = repo();
        let mut rec = record("wed-10-jan-2024", 1.0, 2.0);
        rec.flows.pop();
        assert!(matches!(repo.upsert(&rec), Err(StorageError::Rejected(_))));
        assert_eq!(repo.day_count().unwrap(), 0);
    }

    #[test]
    fn test_new_ticker_column_added_on_migrate() {
        let repo = repo();
        repo.upsert(&record("wed-10-jan-2024", 1.0, 2.0)).unwrap();

        let mut wider = market();
        wider.tickers.push("HODL".into());
        let repo = Repository { conn: repo.conn, table: FlowTable { name: wider.table, tickers: wider.tickers } };
        repo.run_migrations().unwrap();
        let back = repo
            .find_by_identity(&DayIdentity::from("wed-10-jan-2024".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(back.flow("HODL"), Some(0.0));
    }

    #[test]
    fn test_recent_days_and_range() {
        let repo = repo();
        let mut older = record("tue-09-jan-2024", 1.0, 1.0);
        older.close_of_business_hour = NaiveDate::from_ymd_opt(2024, 1, 9)
            .unwrap()
            .and_hms_opt(17, 0, 0)
            .unwrap();
        repo.upsert(&older).unwrap();
        repo.upsert(&record("wed-10-jan-2024", 2.0, 2.0)).unwrap();

        let recent = repo.recent_days(1).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id.as_str(), "wed-10-jan-2024");

        let (min, max) = repo.date_range().unwrap();
        assert_eq!(min, NaiveDate::from_ymd_opt(2024, 1, 9));
        assert_eq!(max, NaiveDate::from_ymd_opt(2024, 1, 10));
    }

    #[test]
    fn test_run_log() {
        let repo = repo();
        let run = repo.begin_run().unwrap();
        repo.finish_run(run, 5, 1, None).unwrap();
        let (_, status) = repo.last_run_status().unwrap().unwrap();
        assert_eq!(status, "success");
    }
}
