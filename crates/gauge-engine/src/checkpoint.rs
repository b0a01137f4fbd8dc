//! Append-only CSV checkpoint.
//!
//! One row per terminal item (completed or errored), flushed and fsynced on
//! every append so a crash never leaves a partial row. The header is fixed
//! once written: base columns, one `<metric>_score` column per metric in run
//! order, then `<metric>__meta__<key>` columns for the meta keys present in
//! the first row. Meta keys first seen later in the run are dropped rather
//! than rewriting the header. Row encoding uses the shared codec in
//! `gauge-wire`, the same one the platform's upload intake parses with.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use gauge_wire::{encode_csv_record, parse_csv_records};
use thiserror::Error;

pub const ERROR_PREFIX: &str = "ERROR:";

const BASE_COLUMNS: [&str; 6] = [
    "item_id",
    "input",
    "expected_output",
    "output",
    "time",
    "trace_id",
];

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointRow {
    pub item_id: String,
    pub input: String,
    pub expected_output: String,
    /// `ERROR: <message>` for errored items.
    pub output: String,
    pub time_seconds: f64,
    pub trace_id: String,
    pub scores: BTreeMap<String, Option<f64>>,
    pub metric_meta: BTreeMap<String, BTreeMap<String, String>>,
}

impl CheckpointRow {
    pub fn is_error(&self) -> bool {
        self.output.starts_with(ERROR_PREFIX)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.output.strip_prefix(ERROR_PREFIX).map(str::trim)
    }
}

#[derive(Debug, Default)]
pub struct CheckpointState {
    pub completed: HashSet<String>,
    pub errored: HashSet<String>,
    pub rows: Vec<CheckpointRow>,
}

impl CheckpointState {
    /// Items the scheduler must skip: completed or errored, either way
    /// already processed. Errored items are not retried automatically.
    pub fn processed(&self) -> HashSet<String> {
        self.completed.union(&self.errored).cloned().collect()
    }
}

pub struct CheckpointWriter {
    path: PathBuf,
    file: File,
    metrics: Vec<String>,
    /// None until the header is on disk; columns are frozen after that.
    header: Option<Vec<String>>,
}

impl CheckpointWriter {
    /// Open for appending; an existing header is reloaded and stays frozen.
    pub fn open(path: impl Into<PathBuf>, metrics: Vec<String>) -> Result<Self, CheckpointError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let existing_header = if path.exists() {
            let mut text = String::new();
            File::open(&path)?.read_to_string(&mut text)?;
            parse_csv_records(&text).into_iter().next()
        } else {
            None
        };
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file,
            metrics,
            header: existing_header,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn build_header(&self, first_row: &CheckpointRow) -> Vec<String> {
        let mut header: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
        for metric in &self.metrics {
            header.push(format!("{metric}_score"));
        }
        for metric in &self.metrics {
            if let Some(meta) = first_row.metric_meta.get(metric) {
                for key in meta.keys() {
                    header.push(format!("{metric}__meta__{key}"));
                }
            }
        }
        header
    }

    /// Append one row, then flush and fsync so the row is durable before the
    /// scheduler moves on.
    pub fn append(&mut self, row: &CheckpointRow) -> Result<(), CheckpointError> {
        let header = match self.header.take() {
            Some(header) => header,
            None => {
                let header = self.build_header(row);
                self.file.write_all(encode_csv_record(&header).as_bytes())?;
                header
            }
        };

        let mut fields = Vec::with_capacity(header.len());
        for column in &header {
            let value = match column.as_str() {
                "item_id" => row.item_id.clone(),
                "input" => row.input.clone(),
                "expected_output" => row.expected_output.clone(),
                "output" => row.output.clone(),
                "time" => format!("{:.3}", row.time_seconds),
                "trace_id" => row.trace_id.clone(),
                other => {
                    if let Some((metric, key)) = other.split_once("__meta__") {
                        row.metric_meta
                            .get(metric)
                            .and_then(|meta| meta.get(key))
                            .cloned()
                            .unwrap_or_default()
                    } else if let Some(metric) = other.strip_suffix("_score") {
                        row.scores
                            .get(metric)
                            .copied()
                            .flatten()
                            .map(|s| format!("{s}"))
                            .unwrap_or_default()
                    } else {
                        String::new()
                    }
                }
            };
            fields.push(value);
        }

        self.file.write_all(encode_csv_record(&fields).as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.header = Some(header);
        Ok(())
    }
}

/// Rebuild resume state from a checkpoint file. `None` when the file does
/// not exist or holds no rows.
pub fn load_checkpoint_state(
    path: impl AsRef<Path>,
    metrics: &[String],
) -> Result<Option<CheckpointState>, CheckpointError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let mut text = String::new();
    File::open(path)?.read_to_string(&mut text)?;
    let mut records = parse_csv_records(&text).into_iter();
    let Some(header) = records.next() else {
        return Ok(None);
    };

    let col = |name: &str| header.iter().position(|c| c == name);
    let item_id_col = col("item_id").ok_or_else(|| {
        CheckpointError::Malformed("missing item_id column".to_string())
    })?;
    let input_col = col("input");
    let expected_col = col("expected_output");
    let output_col = col("output");
    let time_col = col("time");
    let trace_col = col("trace_id");

    let mut state = CheckpointState::default();
    for record in records {
        let cell = |pos: Option<usize>| {
            pos.and_then(|p| record.get(p))
                .cloned()
                .unwrap_or_default()
        };
        let item_id = record
            .get(item_id_col)
            .cloned()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CheckpointError::Malformed("row without item_id".to_string()))?;

        let mut row = CheckpointRow {
            item_id: item_id.clone(),
            input: cell(input_col),
            expected_output: cell(expected_col),
            output: cell(output_col),
            time_seconds: cell(time_col).parse().unwrap_or(0.0),
            trace_id: cell(trace_col),
            scores: BTreeMap::new(),
            metric_meta: BTreeMap::new(),
        };
        for metric in metrics {
            let score = col(&format!("{metric}_score"))
                .and_then(|p| record.get(p))
                .and_then(|raw| raw.parse::<f64>().ok());
            row.scores.insert(metric.clone(), score);

            let prefix = format!("{metric}__meta__");
            for (pos, name) in header.iter().enumerate() {
                if let Some(key) = name.strip_prefix(&prefix) {
                    if let Some(value) = record.get(pos) {
                        if !value.is_empty() {
                            row.metric_meta
                                .entry(metric.clone())
                                .or_default()
                                .insert(key.to_string(), value.clone());
                        }
                    }
                }
            }
        }

        if row.is_error() {
            state.errored.insert(item_id);
        } else {
            state.completed.insert(item_id);
        }
        state.rows.push(row);
    }

    if state.rows.is_empty() {
        return Ok(None);
    }
    Ok(Some(state))
}
