//! Loader for historical flow dumps (JSON array of row objects, or CSV).

use crate::models::RawDayRecord;
use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::{info, warn};

/// Read a dump, picking the format from the file extension.
pub fn load_rows(path: &Path) -> Result<Vec<RawDayRecord>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let rows = match ext.as_deref() {
        Some("json") => load_json(path)?,
        Some("csv") => load_csv(path)?,
        other => bail!("Unsupported dump format {:?} for {:?}", other, path),
    };

    info!("{:?}: {} rows loaded", path, rows.len());
    Ok(rows)
}

/// JSON array of objects; key order is kept.
pub fn load_json(path: &Path) -> Result<Vec<RawDayRecord>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("Could not read {:?}", path))?;
    let rows: Vec<RawDayRecord> =
        serde_json::from_str(&text).with_context(|| format!("{:?} is not an array of row objects", path))?;
    Ok(rows)
}

/// CSV with a header row; every cell is kept as text.
pub fn load_csv(path: &Path) -> Result<Vec<RawDayRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Could not open {:?}", path))?;

    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();

    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Row {} in {:?}: {}", i + 1, path, e);
                continue;
            }
        };

        let mut row = RawDayRecord::new();
        for (key, value) in headers.iter().zip(record.iter()) {
            row.insert(key, value);
        }
        rows.push(row);
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;

    fn tmp_file(name: &str, contents: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("etf_flows_loader_{}_{}", std::process::id(), name));
        fs::write(&p, contents).unwrap();
        p
    }

    #[test]
    fn test_load_json_keeps_key_order() {
        let path = tmp_file(
            "rows.json",
            r#"[{"Date":"11 Jan 2024","IBIT":"111.7","FBTC":227,"Total":"338.7"}]"#,
        );
        let rows = load_rows(&path).unwrap();
        assert_eq!(rows.len(), 1);
        let keys: Vec<_> = rows[0].entries().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, ["Date", "IBIT", "FBTC", "Total"]);
        assert_eq!(rows[0].get("FBTC"), Some(&json!(227)));
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_load_csv() {
        let path = tmp_file("rows.csv", "Date,IBIT,GBTC,Total\n11 Jan 2024,111.7,(95.1),16.6\n12 Jan 2024,-,-,0\n");
        let rows = load_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("GBTC"), Some(&json!("(95.1)")));
        assert_eq!(rows[1].date_text(), Some("12 Jan 2024"));
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_unknown_extension() {
        let path = tmp_file("rows.xml", "<rows/>");
        assert!(load_rows(&path).is_err());
        fs::remove_file(path).ok();
    }
}
