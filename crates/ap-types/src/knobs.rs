//! Knob definitions and the canonical knob space.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::errors::{ApResult, CodecError};
use crate::validation_error;

/// OpenMP proc-bind choices, in index order.
pub const PROC_BIND_CHOICES: [&str; 2] = ["close", "spread"];

/// OpenMP places choices, in index order.
pub const PLACES_CHOICES: [&str; 3] = ["threads", "cores", "sockets"];

/// Columns the ledger and sweep files write next to the knob columns.
/// A knob with one of these names would shadow them.
pub const RESERVED_COLUMNS: [&str; 7] = [
    "time",
    "program",
    "problem_size",
    "repeatCount",
    "globalStepIndex",
    "optimizerOverheadSeconds",
    "recordedAt",
];

/// Where a knob's value is applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum KnobScope {
    /// Process-wide setting applied through an environment variable.
    Global { env_var: String },
    /// Scheduling policy of one instrumented code region.
    Region,
}

/// One tunable categorical parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Knob {
    pub name: String,
    #[serde(flatten)]
    pub scope: KnobScope,
    /// Choice labels; a config stores the index into this list.
    pub choices: Vec<String>,
}

impl Knob {
    pub fn global(
        name: impl Into<String>,
        env_var: impl Into<String>,
        choices: impl IntoIterator<Item = impl ToString>,
    ) -> Self {
        Self {
            name: name.into(),
            scope: KnobScope::Global {
                env_var: env_var.into(),
            },
            choices: choices.into_iter().map(|c| c.to_string()).collect(),
        }
    }

    /// A region knob whose choices are the policy indices `0..policies`.
    pub fn region(name: impl Into<String>, policies: usize) -> Self {
        Self {
            name: name.into(),
            scope: KnobScope::Region,
            choices: (0..policies).map(|p| p.to_string()).collect(),
        }
    }

    pub fn cardinality(&self) -> usize {
        self.choices.len()
    }

    pub fn is_region(&self) -> bool {
        matches!(self.scope, KnobScope::Region)
    }

    pub fn label(&self, index: usize) -> Option<&str> {
        self.choices.get(index).map(String::as_str)
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.choices.iter().position(|c| c == label)
    }

    /// Resolve a label, reporting an unknown label as a codec error.
    pub fn require_index(&self, label: &str) -> Result<usize, CodecError> {
        self.index_of(label).ok_or_else(|| CodecError::UnknownLabel {
            knob: self.name.clone(),
            label: label.to_string(),
        })
    }
}

/// The full set of knobs for one program/problem-size combination.
///
/// Global knobs keep their declared order and come first; region knobs are
/// sorted by name. Coordinate dimension `i` of a search point always refers
/// to `knobs()[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Knob>", into = "Vec<Knob>")]
pub struct KnobSpace {
    knobs: Vec<Knob>,
}

impl KnobSpace {
    /// Build a canonical space from knobs in any order.
    pub fn new(knobs: Vec<Knob>) -> ApResult<Self> {
        let (mut regions, globals): (Vec<Knob>, Vec<Knob>) =
            knobs.into_iter().partition(Knob::is_region);
        regions.sort_by(|a, b| a.name.cmp(&b.name));

        let mut knobs = globals;
        knobs.extend(regions);

        let mut seen = HashSet::new();
        for knob in &knobs {
            if knob.name.is_empty() {
                return Err(validation_error!("knob names must not be empty"));
            }
            if RESERVED_COLUMNS.contains(&knob.name.as_str()) {
                return Err(validation_error!(
                    "knob name {} clashes with a reserved column",
                    knob.name
                ));
            }
            if !seen.insert(knob.name.as_str()) {
                return Err(validation_error!("duplicate knob name: {}", knob.name));
            }
            if knob.choices.is_empty() {
                return Err(validation_error!("knob {} has no choices", knob.name));
            }
            let mut labels = HashSet::new();
            for choice in &knob.choices {
                if !labels.insert(choice.as_str()) {
                    return Err(validation_error!(
                        "knob {} lists choice {:?} twice",
                        knob.name,
                        choice
                    ));
                }
            }
        }

        Ok(Self { knobs })
    }

    /// The standard OpenMP space: thread count, proc-bind and places as
    /// globals, plus one region knob per instrumented region.
    pub fn openmp<S: AsRef<str>>(
        thread_counts: &[u32],
        regions: &[S],
        region_policies: usize,
    ) -> ApResult<Self> {
        let mut knobs = vec![
            Knob::global("num_threads", "OMP_NUM_THREADS", thread_counts.iter()),
            Knob::global("proc_bind", "OMP_PROC_BIND", PROC_BIND_CHOICES),
            Knob::global("places", "OMP_PLACES", PLACES_CHOICES),
        ];
        knobs.extend(
            regions
                .iter()
                .map(|r| Knob::region(r.as_ref(), region_policies)),
        );
        Self::new(knobs)
    }

    pub fn knobs(&self) -> &[Knob] {
        &self.knobs
    }

    pub fn len(&self) -> usize {
        self.knobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.knobs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Knob> {
        self.knobs.iter().find(|k| k.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.knobs.iter().position(|k| k.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.knobs.iter().map(|k| k.name.as_str())
    }

    pub fn cardinalities(&self) -> Vec<usize> {
        self.knobs.iter().map(Knob::cardinality).collect()
    }

    pub fn regions(&self) -> impl Iterator<Item = &Knob> {
        self.knobs.iter().filter(|k| k.is_region())
    }

    /// Number of distinct configs, `None` on overflow.
    pub fn grid_size(&self) -> Option<usize> {
        self.knobs
            .iter()
            .try_fold(1usize, |acc, k| acc.checked_mul(k.cardinality()))
    }
}

impl TryFrom<Vec<Knob>> for KnobSpace {
    type Error = crate::errors::ApError;

    fn try_from(knobs: Vec<Knob>) -> Result<Self, Self::Error> {
        Self::new(knobs)
    }
}

impl From<KnobSpace> for Vec<Knob> {
    fn from(space: KnobSpace) -> Self {
        space.knobs
    }
}
