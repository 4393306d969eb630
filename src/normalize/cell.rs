use crate::models::MISSING_SENTINEL;
use serde_json::Value;

/// Parse one flow cell into a signed number.
///
/// `"-"` → 0 | `"(1.5)"` → -1.5 | `"1,234.5"` → 1234.5 | `"n/a"` → None
///
/// `None` means the cell could not be read. Callers leave such cells alone
/// and keep them out of totals; zeroing happens later, at the store boundary.
pub fn parse_cell(value: &Value) -> Option<f64> {
    let text = match value {
        Value::Number(n) => return n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim(),
        _ => return None,
    };

    if text == MISSING_SENTINEL {
        return Some(0.0);
    }

    // Parenthesised figures are outflows.
    if text.contains(['(', ')']) {
        let stripped = text.replace(['(', ')'], "");
        return parse_magnitude(&stripped).map(|v| -v.abs());
    }

    parse_magnitude(text)
}

/// Strip thousands separators, whitespace and currency marks, then parse.
fn parse_magnitude(s: &str) -> Option<f64> {
    let cleaned: String = s
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '€' | '£') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}
