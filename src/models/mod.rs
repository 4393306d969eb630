use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Reserved column holding the day.
pub const DATE_KEY: &str = "Date";

/// Reserved column holding the source's precomputed total (never trusted).
pub const TOTAL_KEY: &str = "Total";

/// Literal cell value meaning "no flow reported".
pub const MISSING_SENTINEL: &str = "-";

// ── Raw day record ────────────────────────────────────────────────────────────

/// One scraped table row: column name → string or number, in column order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct RawDayRecord(Map<String, Value>);

impl RawDayRecord {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert, keeps insertion order.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The date cell as text, if it is a string at all.
    pub fn date_text(&self) -> Option<&str> {
        self.0.get(DATE_KEY).and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

// ── Normalized day record ─────────────────────────────────────────────────────

/// State of one ticker column after normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowCell {
    /// Successfully parsed, counted in the day's total.
    Parsed(f64),
    /// Discovery occurrence or parse failure: the raw value, not counted.
    Untouched(Value),
    /// The row has no such column.
    Absent,
}

/// A raw row after ticker discovery and cell parsing.
///
/// `flows` is indexed by the run's `TickerRegistry`; records normalized
/// before a ticker was registered are simply shorter.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedDayRecord {
    pub date: NaiveDate,
    pub flows: Vec<FlowCell>,
    pub total: f64,
    pub raw: RawDayRecord,
}

static ABSENT: FlowCell = FlowCell::Absent;

impl NormalizedDayRecord {
    pub fn flow(&self, index: usize) -> &FlowCell {
        self.flows.get(index).unwrap_or(&ABSENT)
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// Deterministic natural key of a calendar day, e.g. `wed-10-jan-2024`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayIdentity(String);

impl DayIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DayIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Persisted record ──────────────────────────────────────────────────────────

/// One stored day. `flows` follows the table's column order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedFlowRecord {
    pub id: DayIdentity,
    /// Display label, e.g. `Wed 10 Jan 2024`.
    pub day: String,
    /// 17:00 UTC on the day.
    pub close_of_business_hour: NaiveDateTime,
    pub flows: Vec<(String, f64)>,
    pub total: f64,
    pub raw: Value,
}

impl PersistedFlowRecord {
    pub fn flow(&self, ticker: &str) -> Option<f64> {
        self.flows.iter().find(|(t, _)| t == ticker).map(|(_, v)| *v)
    }
}

// ── Change record ─────────────────────────────────────────────────────────────

/// What one processed day changed in the store. Handed to the notifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    pub id: DayIdentity,
    pub is_new_day: bool,
    pub previous_total: Option<f64>,
    pub new_total: f64,
    /// JSON object of the persisted per-ticker flows.
    pub payload: String,
}
