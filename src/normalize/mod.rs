//! Raw scraped rows → typed day records.
//!
//! Ticker columns are discovered as rows are read: the run's
//! [`TickerRegistry`] is threaded through every call and only ever grows.
//! A key that was never declared is *registered* on its first physical
//! occurrence and contributes no value on that occurrence; from then on it is
//! parsed like any other ticker.

pub mod cell;
pub mod registry;

use crate::models::{FlowCell, NormalizedDayRecord, RawDayRecord, DATE_KEY};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::debug;

pub use self::cell::parse_cell;
pub use self::registry::{Classification, TickerRegistry};

const DATE_FORMATS: &[&str] = &["%d %b %Y", "%Y-%m-%d", "%b %d, %Y", "%d/%m/%Y", "%m/%d/%Y"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse a calendar day. Time-of-day and offsets are dropped; the date is
/// the one written in the string.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local().date());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S %z") {
        return Some(dt.naive_local().date());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }

    None
}

/// Normalize one row. Returns `None` when the row's date is unusable.
pub fn normalize(raw: &RawDayRecord, registry: &mut TickerRegistry) -> Option<NormalizedDayRecord> {
    normalize_counting(raw, registry, &mut 0)
}

fn normalize_counting(
    raw: &RawDayRecord,
    registry: &mut TickerRegistry,
    cell_failures: &mut usize,
) -> Option<NormalizedDayRecord> {
    let Some(date) = raw.date_text().and_then(parse_date) else {
        debug!("Rejected row with date {:?}", raw.get(DATE_KEY));
        return None;
    };

    let mut flows = vec![FlowCell::Absent; registry.len()];
    let mut total = 0.0;

    for (key, value) in raw.entries() {
        match registry.classify(key) {
            Classification::Date | Classification::Total => continue,
            Classification::NewTicker(i) => {
                debug!("Discovered ticker {} on {}", key, date);
                set_cell(&mut flows, i, FlowCell::Untouched(value.clone()));
            }
            Classification::KnownTicker(i) => match parse_cell(value) {
                Some(v) => {
                    set_cell(&mut flows, i, FlowCell::Parsed(v));
                    total += v;
                }
                None => {
                    debug!("{} on {}: unreadable cell {}", key, date, value);
                    *cell_failures += 1;
                    set_cell(&mut flows, i, FlowCell::Untouched(value.clone()));
                }
            },
        }
    }

    Some(NormalizedDayRecord { date, flows, total, raw: raw.clone() })
}

fn set_cell(flows: &mut Vec<FlowCell>, index: usize, cell: FlowCell) {
    if flows.len() <= index {
        flows.resize(index + 1, FlowCell::Absent);
    }
    flows[index] = cell;
}

/// Result of normalizing a whole batch of rows.
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    pub days: Vec<NormalizedDayRecord>,
    pub rejected: usize,
    pub cell_failures: usize,
}

/// Normalize rows in order, dropping rows whose date does not parse.
pub fn normalize_rows(rows: &[RawDayRecord], registry: &mut TickerRegistry) -> NormalizeOutcome {
    let mut out = NormalizeOutcome::default();
    for raw in rows {
        match normalize_counting(raw, registry, &mut out.cell_failures) {
            Some(day) => out.days.push(day),
            None => out.rejected += 1,
        }
    }
    debug!(
        "Normalized {} rows: {} days, {} rejected, {} unreadable cells, {} tickers",
        rows.len(), out.days.len(), out.rejected, out.cell_failures, registry.len()
    );
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────
