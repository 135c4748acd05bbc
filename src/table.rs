#![forbid(unsafe_code)]

//! CSV tables keyed by video id.
//!
//! Every write rewrites the whole file through a sibling `.tmp` file and a
//! rename, so readers never observe a half-written table. Concurrent writers
//! against the same directory are not supported.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::record::TableRow;

/// Where the per-date tables and the combined table live.
#[derive(Debug, Clone)]
pub struct TableLayout {
    pub daily_dir: PathBuf,
    pub combined: PathBuf,
    pub prefix: String,
}

impl TableLayout {
    pub fn new(daily_dir: impl Into<PathBuf>, combined: impl Into<PathBuf>, prefix: &str) -> Self {
        Self {
            daily_dir: daily_dir.into(),
            combined: combined.into(),
            prefix: prefix.to_string(),
        }
    }

    /// `<daily_dir>/<prefix>_<YYYY-MM-DD>.csv`
    pub fn daily_path(&self, date: &str) -> PathBuf {
        self.daily_dir.join(format!("{}_{}.csv", self.prefix, date))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Row count per date table after the merge.
    pub daily_rows: BTreeMap<String, usize>,
    pub combined_rows: usize,
}

/// Keeps the first row seen for each id, preserving order.
pub fn dedup_first(rows: Vec<TableRow>) -> Vec<TableRow> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| seen.insert(row.id.clone()))
        .collect()
}

pub fn read_table(path: &Path) -> Result<Vec<TableRow>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        let row: TableRow = row.with_context(|| format!("parsing {}", path.display()))?;
        rows.push(row);
    }
    Ok(rows)
}

pub fn write_table(path: &Path, rows: &[TableRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        for row in rows {
            writer
                .serialize(row)
                .with_context(|| format!("writing row {} to {}", row.id, tmp_path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flushing {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Merges `rows` into the per-date tables and the combined table.
///
/// Existing rows always come first, so an id already on disk keeps its stored
/// values. Running this twice with the same rows leaves the files unchanged.
pub fn merge_and_persist(rows: &[TableRow], layout: &TableLayout) -> Result<MergeSummary> {
    let mut by_date: BTreeMap<&str, Vec<TableRow>> = BTreeMap::new();
    for row in rows {
        by_date
            .entry(row.utc_date_string.as_str())
            .or_default()
            .push(row.clone());
    }

    let mut combined = read_table(&layout.combined)?;
    let mut summary = MergeSummary::default();

    for (date, batch) in by_date {
        let path = layout.daily_path(date);
        let mut merged = read_table(&path)?;
        merged.extend(batch.iter().cloned());
        let merged = dedup_first(merged);
        write_table(&path, &merged)?;
        summary.daily_rows.insert(date.to_string(), merged.len());

        combined.extend(batch);
    }

    let combined = dedup_first(combined);
    write_table(&layout.combined, &combined)?;
    summary.combined_rows = combined.len();
    info!(
        rows = summary.combined_rows,
        path = %layout.combined.display(),
        "combined table updated"
    );

    Ok(summary)
}
