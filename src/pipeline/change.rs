use super::identity::day_identity;
use crate::error::StorageError;
use crate::models::{ChangeRecord, DayIdentity, NormalizedDayRecord};
use crate::storage::FlowStore;
use serde_json::{Map, Value};

/// Per-ticker values and total as they will be written.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedDay {
    pub flows: Vec<(String, f64)>,
    pub total: f64,
}

impl FinalizedDay {
    /// `{"IBIT":-50,"FBTC":1.5,…}` in column order; whole numbers carry no fraction.
    pub fn payload(&self) -> String {
        let map: Map<String, Value> = self
            .flows
            .iter()
            .map(|(t, v)| (t.clone(), json_number(*v)))
            .collect();
        Value::Object(map).to_string()
    }
}

fn json_number(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        Value::from(v as i64)
    } else {
        Value::from(v)
    }
}

/// Prior state of a day, read before it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub id: DayIdentity,
    pub is_new_day: bool,
    pub previous_total: Option<f64>,
}

impl PendingChange {
    pub fn complete(self, finalized: &FinalizedDay) -> ChangeRecord {
        ChangeRecord {
            id: self.id,
            is_new_day: self.is_new_day,
            previous_total: self.previous_total,
            new_total: finalized.total,
            payload: finalized.payload(),
        }
    }
}

/// Look up what is already stored for the record's day.
///
/// This read and the following upsert are separate calls; a concurrent
/// writer between them would make `previous_total` stale.
pub fn detect<S: FlowStore + ?Sized>(
    store: &S,
    day: &NormalizedDayRecord,
) -> Result<PendingChange, StorageError> {
    let id = day_identity(day.date);
    let existing = store.find_by_identity(&id)?;
    Ok(PendingChange {
        id,
        is_new_day: existing.is_none(),
        previous_total: existing.map(|r| r.total),
    })
}
