use crate::models::{RawDayRecord, DATE_KEY};
use anyhow::Result;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

// ── Flow table ────────────────────────────────────────────────────────────────

/// Extract the flow table as raw rows: header text → cell text.
///
/// Summary rows (Total, Average, …) come through as-is; their "date" does not
/// parse, so the normalizer drops them.
pub fn parse_flow_table(html: &str) -> Result<Vec<RawDayRecord>> {
    let doc = Html::parse_document(html);

    let Some(table) = find_flow_table(&doc)? else {
        warn!("No flow table found");
        return Ok(vec![]);
    };

    let tr_sel = selector("tr")?;
    let cell_sel = selector("th, td")?;

    let mut lines = table
        .select(&tr_sel)
        .map(|tr| tr.select(&cell_sel).map(cell_text).collect::<Vec<_>>())
        .filter(|cells| cells.iter().any(|c| !c.is_empty()));

    let Some(first) = lines.next() else {
        return Ok(vec![]);
    };
    let headers = header_keys(first);

    let rows: Vec<RawDayRecord> = lines
        .map(|cells| {
            let mut record = RawDayRecord::new();
            for (key, value) in headers.iter().zip(cells) {
                if !key.is_empty() {
                    record.insert(key.clone(), value);
                }
            }
            record
        })
        .collect();

    debug!("Flow table: {} rows, headers {:?}", rows.len(), headers);
    Ok(rows)
}

/// First header row becomes the key set; an unnamed leading column is the date.
fn header_keys(cells: Vec<String>) -> Vec<String> {
    cells
        .into_iter()
        .enumerate()
        .map(|(i, h)| if i == 0 && (h.is_empty() || h.eq_ignore_ascii_case("date")) { DATE_KEY.to_string() } else { h })
        .collect()
}

fn find_flow_table(doc: &Html) -> Result<Option<ElementRef<'_>>> {
    for candidate in ["table.etf", "table"] {
        if let Some(table) = doc.select(&selector(candidate)?).next() {
            return Ok(Some(table));
        }
    }
    Ok(None)
}

fn cell_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ")
}

fn selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| anyhow::anyhow!("selector {}: {:?}", s, e))
}
