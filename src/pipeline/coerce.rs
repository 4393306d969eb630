use crate::models::FlowCell;
use serde_json::Value;

/// Last numeric guard before storage: anything that is not a number or a
/// numeric string becomes 0.
pub fn coerce_flow(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return 0.0;
            }
            s.parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0)
        }
        _ => 0.0,
    }
}

/// Same guard over a normalized cell. Absent and unreadable cells both land at 0.
pub fn coerce_cell(cell: &FlowCell) -> f64 {
    match cell {
        FlowCell::Parsed(v) if v.is_finite() => *v,
        FlowCell::Parsed(_) | FlowCell::Absent => 0.0,
        FlowCell::Untouched(raw) => coerce_flow(raw),
    }
}

pub fn coerce_total(total: f64) -> f64 {
    if total.is_finite() { total } else { 0.0 }
}
