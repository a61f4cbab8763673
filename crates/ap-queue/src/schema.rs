//! Column layout shared by batch task files and completion files.

use ap_types::{CodecError, RuntimeConfig};
use std::collections::{BTreeSet, HashMap};

use crate::sweep::SweepDefinition;

pub const PROGRAM_COLUMN: &str = "program";
pub const PROBLEM_SIZE_COLUMN: &str = "problem_size";
pub const TIME_COLUMN: &str = "time";

/// A parsed row: the config plus the time cell, when the layout has one.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SweepRow {
    pub config: RuntimeConfig,
    pub time: Option<f64>,
}

/// `program`, `problem_size`, one column per knob in canonical order, and
/// optionally `time`.
pub(crate) fn header(sweep: &SweepDefinition, with_time: bool) -> Vec<String> {
    let mut header = vec![PROGRAM_COLUMN.to_string(), PROBLEM_SIZE_COLUMN.to_string()];
    header.extend(sweep.space.names().map(str::to_string));
    if with_time {
        header.push(TIME_COLUMN.to_string());
    }
    header
}

pub(crate) fn row(
    sweep: &SweepDefinition,
    config: &RuntimeConfig,
    time: Option<f64>,
) -> Vec<String> {
    let mut row = vec![sweep.program.clone(), sweep.problem_size.clone()];
    row.extend(sweep.space.knobs().iter().map(|knob| {
        config
            .get(&knob.name)
            .and_then(|index| knob.label(index))
            .unwrap_or_default()
            .to_string()
    }));
    if let Some(time) = time {
        row.push(time.to_string());
    }
    row
}

/// Parse rows for `sweep`, skipping rows of other program/problem-size
/// pairs. Any disagreement between the file and the sweep's knob set is
/// reported as a message for the caller to wrap.
pub(crate) fn parse(
    sweep: &SweepDefinition,
    data: &[u8],
    with_time: bool,
) -> Result<Vec<SweepRow>, String> {
    let mut reader = csv::Reader::from_reader(data);
    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| format!("unreadable header: {e}"))?
        .iter()
        .map(str::to_string)
        .collect();

    let expected: BTreeSet<String> = header(sweep, with_time).into_iter().collect();
    let found: BTreeSet<String> = columns.iter().cloned().collect();
    if found.len() != columns.len() {
        return Err("duplicate column names".to_string());
    }
    if expected != found {
        let missing: Vec<&String> = expected.difference(&found).collect();
        let unexpected: Vec<&String> = found.difference(&expected).collect();
        return Err(format!(
            "columns differ from the sweep's knob set (missing {missing:?}, unexpected {unexpected:?})"
        ));
    }
    let index: HashMap<&str, usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i))
        .collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("row {}: {e}", line + 1))?;
        let cell = |name: &str| record.get(index[name]).unwrap_or_default();
        if !sweep.matches(cell(PROGRAM_COLUMN), cell(PROBLEM_SIZE_COLUMN)) {
            continue;
        }

        let mut config = RuntimeConfig::new();
        for knob in sweep.space.knobs() {
            let label = cell(&knob.name);
            let value = knob.require_index(label).map_err(|e: CodecError| {
                format!("row {}: {e} (choices {:?})", line + 1, knob.choices)
            })?;
            config.set(knob.name.clone(), value);
        }

        let time = if with_time {
            let raw = cell(TIME_COLUMN);
            let time = raw
                .parse::<f64>()
                .map_err(|e| format!("row {}: time {raw:?}: {e}", line + 1))?;
            Some(time)
        } else {
            None
        };
        rows.push(SweepRow { config, time });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_types::KnobSpace;

    fn sweep() -> SweepDefinition {
        SweepDefinition::new("lulesh", "30", KnobSpace::openmp(&[10, 20], &["r"], 2).unwrap())
    }

    #[test]
    fn fixed_columns_are_reserved_knob_names() {
        for column in [PROGRAM_COLUMN, PROBLEM_SIZE_COLUMN, TIME_COLUMN] {
            assert!(ap_types::RESERVED_COLUMNS.contains(&column), "{column}");
        }
    }

    #[test]
    fn header_and_row_line_up() {
        let sweep = sweep();
        let config = RuntimeConfig::new()
            .with("num_threads", 1)
            .with("proc_bind", 0)
            .with("places", 2)
            .with("r", 1);
        assert_eq!(
            header(&sweep, true),
            vec!["program", "problem_size", "num_threads", "proc_bind", "places", "r", "time"]
        );
        assert_eq!(
            row(&sweep, &config, Some(3.5)),
            vec!["lulesh", "30", "20", "close", "sockets", "1", "3.5"]
        );
    }

    #[test]
    fn column_order_does_not_matter() {
        let data = "time,r,places,proc_bind,num_threads,problem_size,program\n\
                    2.5,0,cores,spread,10,30,lulesh\n";
        let rows = parse(&sweep(), data.as_bytes(), true).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].config.get("proc_bind"), Some(1));
        assert_eq!(rows[0].time, Some(2.5));
    }

    #[test]
    fn foreign_rows_are_skipped() {
        let data = "program,problem_size,num_threads,proc_bind,places,r,time\n\
                    lulesh,60,10,close,cores,0,1.0\n\
                    bt_nas,30,10,close,cores,0,1.0\n\
                    lulesh,30,20,close,cores,1,1.0\n";
        let rows = parse(&sweep(), data.as_bytes(), true).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].config.get("num_threads"), Some(1));
    }

    #[test]
    fn extra_knob_column_is_a_mismatch() {
        let data = "program,problem_size,num_threads,proc_bind,places,r,r2,time\n";
        let err = parse(&sweep(), data.as_bytes(), true).unwrap_err();
        assert!(err.contains("r2"));
    }
}
