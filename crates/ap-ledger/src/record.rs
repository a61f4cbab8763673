//! Evaluation records and their CSV row layout.

use ap_types::{ApResult, KnobSpace, LedgerError, RuntimeConfig};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const TIME_COLUMN: &str = "time";
pub const REPEAT_COLUMN: &str = "repeatCount";
pub const STEP_COLUMN: &str = "globalStepIndex";
pub const OVERHEAD_COLUMN: &str = "optimizerOverheadSeconds";
pub const RECORDED_AT_COLUMN: &str = "recordedAt";

const FIXED_COLUMNS: [&str; 5] = [
    TIME_COLUMN,
    REPEAT_COLUMN,
    STEP_COLUMN,
    OVERHEAD_COLUMN,
    RECORDED_AT_COLUMN,
];

/// One measured evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub config: RuntimeConfig,
    /// Measured execution time in seconds.
    pub time: f64,
    /// Number of records in the ledger sharing this config, this one
    /// included. Maintained by the ledger.
    pub repeat_count: usize,
    pub step: usize,
    pub optimizer_overhead: f64,
    pub recorded_at: DateTime<Utc>,
    /// Algorithm-specific columns, e.g. `generation` or `individual`.
    pub extras: BTreeMap<String, String>,
}

impl EvaluationRecord {
    pub fn new(config: RuntimeConfig, time: f64, step: usize) -> Self {
        Self {
            config,
            time,
            repeat_count: 1,
            step,
            optimizer_overhead: 0.0,
            recorded_at: Utc::now(),
            extras: BTreeMap::new(),
        }
    }

    pub fn with_overhead(mut self, seconds: f64) -> Self {
        self.optimizer_overhead = seconds;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.extras.insert(key.into(), value.to_string());
        self
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extras.get(key).map(String::as_str)
    }
}

/// Column layout for a ledger over one knob space.
#[derive(Debug, Clone)]
pub struct RecordLayout {
    space: KnobSpace,
}

impl RecordLayout {
    pub fn new(space: KnobSpace) -> Self {
        Self { space }
    }

    pub fn space(&self) -> &KnobSpace {
        &self.space
    }

    /// Knob columns, fixed columns, then the union of extras sorted by name.
    pub fn header(&self, records: &[EvaluationRecord]) -> Vec<String> {
        let extras: BTreeSet<&str> = records
            .iter()
            .flat_map(|r| r.extras.keys().map(String::as_str))
            .collect();
        self.space
            .names()
            .chain(FIXED_COLUMNS)
            .chain(extras)
            .map(str::to_string)
            .collect()
    }

    pub fn to_row(&self, header: &[String], record: &EvaluationRecord) -> ApResult<Vec<String>> {
        let labels = record.config.labels(&self.space)?;
        let mut row = Vec::with_capacity(header.len());
        for column in header {
            let cell = match column.as_str() {
                TIME_COLUMN => record.time.to_string(),
                REPEAT_COLUMN => record.repeat_count.to_string(),
                STEP_COLUMN => record.step.to_string(),
                OVERHEAD_COLUMN => record.optimizer_overhead.to_string(),
                RECORDED_AT_COLUMN => record
                    .recorded_at
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
                other => labels
                    .get(other)
                    .or_else(|| record.extras.get(other))
                    .cloned()
                    .unwrap_or_default(),
            };
            row.push(cell);
        }
        Ok(row)
    }

    /// Parse a full ledger file body.
    pub fn parse(&self, source: &str, data: &[u8]) -> ApResult<Vec<EvaluationRecord>> {
        let corrupt = |message: String| LedgerError::Corrupt {
            path: source.to_string(),
            message,
        };

        let mut reader = csv::Reader::from_reader(data);
        let header: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let index: HashMap<&str, usize> = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        for required in self.space.names().chain(FIXED_COLUMNS) {
            if !index.contains_key(required) {
                return Err(corrupt(format!("missing column {required:?}")).into());
            }
        }
        let extra_columns: Vec<(usize, &String)> = header
            .iter()
            .enumerate()
            .filter(|(_, name)| {
                self.space.get(name).is_none() && !FIXED_COLUMNS.contains(&name.as_str())
            })
            .collect();

        let mut records = Vec::new();
        for (line, row) in reader.records().enumerate() {
            let row = row?;
            let cell = |name: &str| row.get(index[name]).unwrap_or_default();
            let number = |name: &str| -> Result<f64, LedgerError> {
                cell(name).parse::<f64>().map_err(|e| {
                    corrupt(format!("row {}: column {name}: {e}", line + 1))
                })
            };
            let count = |name: &str| -> Result<usize, LedgerError> {
                cell(name).parse::<usize>().map_err(|e| {
                    corrupt(format!("row {}: column {name}: {e}", line + 1))
                })
            };

            let config = RuntimeConfig::from_labels(
                &self.space,
                self.space.names().map(|name| (name, cell(name))),
            )?;
            let recorded_at = DateTime::parse_from_rfc3339(cell(RECORDED_AT_COLUMN))
                .map_err(|e| corrupt(format!("row {}: recordedAt: {e}", line + 1)))?
                .with_timezone(&Utc);
            let extras = extra_columns
                .iter()
                .filter_map(|(i, name)| {
                    let value = row.get(*i)?;
                    (!value.is_empty()).then(|| ((*name).clone(), value.to_string()))
                })
                .collect();

            records.push(EvaluationRecord {
                config,
                time: number(TIME_COLUMN)?,
                repeat_count: count(REPEAT_COLUMN)?,
                step: count(STEP_COLUMN)?,
                optimizer_overhead: number(OVERHEAD_COLUMN)?,
                recorded_at,
                extras,
            });
        }
        Ok(records)
    }
}
