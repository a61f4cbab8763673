//! What a sweep must measure.

use ap_types::{ApResult, KnobSpace, QueueError, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::schema;

/// One program/problem-size pair and the knob space explored for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepDefinition {
    pub program: String,
    pub problem_size: String,
    pub space: KnobSpace,
}

impl SweepDefinition {
    pub fn new(
        program: impl Into<String>,
        problem_size: impl Into<String>,
        space: KnobSpace,
    ) -> Self {
        Self {
            program: program.into(),
            problem_size: problem_size.into(),
            space,
        }
    }

    /// Every config in the space, last knob varying fastest.
    pub fn enumerate(&self) -> ApResult<Vec<RuntimeConfig>> {
        let total = self.space.grid_size().ok_or_else(|| {
            ap_types::validation_error!(
                "sweep over {} knobs is too large to enumerate",
                self.space.len()
            )
        })?;
        let cardinalities = self.space.cardinalities();
        let names: Vec<&str> = self.space.names().collect();

        let mut digits = vec![0usize; cardinalities.len()];
        let mut configs: Vec<RuntimeConfig> = Vec::with_capacity(total);
        for _ in 0..total {
            configs.push(
                names
                    .iter()
                    .zip(&digits)
                    .map(|(name, index)| (name.to_string(), *index))
                    .collect(),
            );
            for (digit, cardinality) in digits.iter_mut().zip(&cardinalities).rev() {
                *digit += 1;
                if *digit < *cardinality {
                    break;
                }
                *digit = 0;
            }
        }
        Ok(configs)
    }

    /// True when both the program and problem size match.
    pub fn matches(&self, program: &str, problem_size: &str) -> bool {
        self.program == program && self.problem_size == problem_size
    }
}

/// A sampling plan whose rows may coincide, reduced to the unique configs
/// that actually need measuring.
#[derive(Debug, Clone, Default)]
pub struct SamplingPlan {
    rows: Vec<RuntimeConfig>,
}

impl SamplingPlan {
    pub fn from_rows(rows: Vec<RuntimeConfig>) -> Self {
        Self { rows }
    }

    /// Saltelli-style plan: the rows of `a`, the rows of `b`, then for each
    /// knob the rows of `a` with that knob taken from `b`.
    pub fn saltelli(
        space: &KnobSpace,
        a: &[RuntimeConfig],
        b: &[RuntimeConfig],
    ) -> ApResult<Self> {
        if a.len() != b.len() {
            return Err(ap_types::validation_error!(
                "plan matrices differ in length: {} vs {}",
                a.len(),
                b.len()
            ));
        }
        for config in a.iter().chain(b) {
            config.validate(space)?;
        }

        let mut rows = Vec::with_capacity(a.len() * (space.len() + 2));
        rows.extend_from_slice(a);
        rows.extend_from_slice(b);
        for name in space.names() {
            for (row_a, row_b) in a.iter().zip(b) {
                let mut mixed = row_a.clone();
                if let Some(value) = row_b.get(name) {
                    mixed.set(name, value);
                }
                rows.push(mixed);
            }
        }
        Ok(Self { rows })
    }

    /// Read plan rows from a CSV laid out like a batch task file.
    pub fn load(path: &Path, sweep: &SweepDefinition) -> ApResult<Self> {
        let data = std::fs::read(path)?;
        let rows = schema::parse(sweep, &data, false).map_err(|message| {
            QueueError::SchemaMismatch {
                file: path.display().to_string(),
                message,
            }
        })?;
        Ok(Self::from_rows(rows.into_iter().map(|row| row.config).collect()))
    }

    pub fn rows(&self) -> &[RuntimeConfig] {
        &self.rows
    }

    /// Distinct configs in first-occurrence order.
    pub fn required(&self) -> Vec<RuntimeConfig> {
        let mut seen = HashSet::new();
        self.rows
            .iter()
            .filter(|c| seen.insert(*c))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_types::Knob;

    fn small_space() -> KnobSpace {
        KnobSpace::new(vec![
            Knob::global("num_threads", "OMP_NUM_THREADS", [10, 20]),
            Knob::global("proc_bind", "OMP_PROC_BIND", ["close", "spread"]),
            Knob::region("r", 3),
        ])
        .unwrap()
    }

    fn config(t: usize, b: usize, r: usize) -> RuntimeConfig {
        RuntimeConfig::new()
            .with("num_threads", t)
            .with("proc_bind", b)
            .with("r", r)
    }

    #[test]
    fn enumerates_odometer_order() {
        let sweep = SweepDefinition::new("bt_nas", "medprob", small_space());
        let configs = sweep.enumerate().unwrap();
        assert_eq!(configs.len(), 12);
        assert_eq!(configs[0], config(0, 0, 0));
        assert_eq!(configs[1], config(0, 0, 1));
        assert_eq!(configs[3], config(0, 1, 0));
        assert_eq!(configs[11], config(1, 1, 2));

        let unique: HashSet<_> = configs.iter().collect();
        assert_eq!(unique.len(), 12);
    }

    #[test]
    fn saltelli_rows_collapse_to_unique_set() {
        let space = small_space();
        let a = vec![config(0, 0, 0), config(1, 1, 1)];
        let b = vec![config(1, 1, 0), config(0, 1, 2)];
        let plan = SamplingPlan::saltelli(&space, &a, &b).unwrap();
        assert_eq!(plan.rows().len(), 2 * (3 + 2));

        // Two of the mixed rows coincide with rows of A.
        assert_eq!(
            plan.required(),
            vec![
                config(0, 0, 0),
                config(1, 1, 1),
                config(1, 1, 0),
                config(0, 1, 2),
                config(1, 0, 0),
                config(0, 1, 1),
                config(0, 1, 0),
                config(1, 1, 2),
            ]
        );
    }

    #[test]
    fn plan_keeps_first_occurrence_order() {
        let plan = SamplingPlan::from_rows(vec![
            config(1, 0, 0),
            config(0, 0, 0),
            config(1, 0, 0),
        ]);
        assert_eq!(plan.required(), vec![config(1, 0, 0), config(0, 0, 0)]);
    }

    #[test]
    fn sweep_definition_from_json() {
        let json = r#"{
            "program": "lulesh",
            "problem_size": "30",
            "space": [
                {"name": "r", "scope": "region", "choices": ["0", "1"]},
                {"name": "num_threads", "scope": "global", "env_var": "OMP_NUM_THREADS",
                 "choices": ["1", "2", "4"]}
            ]
        }"#;
        let sweep: SweepDefinition = serde_json::from_str(json).unwrap();
        let names: Vec<&str> = sweep.space.names().collect();
        assert_eq!(names, vec!["num_threads", "r"]);
        assert_eq!(sweep.enumerate().unwrap().len(), 6);
    }

    #[test]
    fn plan_loads_from_task_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.csv");
        std::fs::write(
            &path,
            "program,problem_size,num_threads,proc_bind,r\n\
             bt_nas,medprob,20,spread,1\n\
             bt_nas,medprob,10,close,0\n\
             bt_nas,medprob,20,spread,1\n",
        )
        .unwrap();
        let sweep = SweepDefinition::new("bt_nas", "medprob", small_space());
        let plan = SamplingPlan::load(&path, &sweep).unwrap();
        assert_eq!(plan.rows().len(), 3);
        assert_eq!(plan.required(), vec![config(1, 1, 1), config(0, 0, 0)]);
    }

    #[test]
    fn mismatched_matrices_rejected() {
        let space = small_space();
        assert!(SamplingPlan::saltelli(&space, &[config(0, 0, 0)], &[]).is_err());
    }
}
