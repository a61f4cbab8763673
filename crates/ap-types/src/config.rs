//! Discrete runtime configurations and continuous search points.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::{ApResult, CodecError};
use crate::knobs::{KnobScope, KnobSpace};

/// Environment variable carrying the per-region static policy model.
pub const REGION_POLICY_ENV: &str = "APOLLO_POLICY_MODEL";

/// A complete assignment of choice indices to knobs.
///
/// Keys are knob names, so equality never depends on insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeConfig {
    values: BTreeMap<String, usize>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, knob: impl Into<String>, index: usize) -> Self {
        self.values.insert(knob.into(), index);
        self
    }

    pub fn set(&mut self, knob: impl Into<String>, index: usize) {
        self.values.insert(knob.into(), index);
    }

    pub fn get(&self, knob: &str) -> Option<usize> {
        self.values.get(knob).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Check that the config covers exactly the knobs of `space` with
    /// in-range values.
    pub fn validate(&self, space: &KnobSpace) -> Result<(), CodecError> {
        for knob in space.knobs() {
            let value = self.get(&knob.name).ok_or_else(|| CodecError::MissingKnob {
                knob: knob.name.clone(),
            })?;
            if value >= knob.cardinality() {
                return Err(CodecError::OutOfRange {
                    knob: knob.name.clone(),
                    value,
                    cardinality: knob.cardinality(),
                });
            }
        }
        if let Some(extra) = self.values.keys().find(|k| space.get(k).is_none()) {
            return Err(CodecError::UnknownKnob { knob: extra.clone() });
        }
        Ok(())
    }

    /// Choice labels keyed by knob name.
    pub fn labels(&self, space: &KnobSpace) -> ApResult<BTreeMap<String, String>> {
        self.validate(space)?;
        Ok(space
            .knobs()
            .iter()
            .filter_map(|knob| {
                let index = self.get(&knob.name)?;
                knob.label(index)
                    .map(|label| (knob.name.clone(), label.to_string()))
            })
            .collect())
    }

    /// Build a config from knob-name → label pairs.
    pub fn from_labels<'a, I>(space: &KnobSpace, labels: I) -> ApResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::new();
        for (name, label) in labels {
            let knob = space.get(name).ok_or_else(|| CodecError::UnknownKnob {
                knob: name.to_string(),
            })?;
            config.set(name, knob.require_index(label)?);
        }
        config.validate(space)?;
        Ok(config)
    }

    /// Environment variables that apply this config to a child process.
    ///
    /// Global knobs map to their own variable; region knobs are folded into
    /// a single `StaticRegion,<region>=<policy>,...` model string.
    pub fn environment(&self, space: &KnobSpace) -> ApResult<Vec<(String, String)>> {
        self.validate(space)?;
        let mut env = Vec::new();
        let mut region_policies = Vec::new();

        for knob in space.knobs() {
            let index = self.get(&knob.name).unwrap_or_default();
            let label = knob.label(index).unwrap_or_default();
            match &knob.scope {
                KnobScope::Global { env_var } => env.push((env_var.clone(), label.to_string())),
                KnobScope::Region => region_policies.push(format!("{}={}", knob.name, label)),
            }
        }

        if !region_policies.is_empty() {
            env.push((
                REGION_POLICY_ENV.to_string(),
                format!("StaticRegion,{}", region_policies.join(",")),
            ));
        }
        Ok(env)
    }
}

impl fmt::Display for RuntimeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.values.iter().map(|(k, v)| format!("{k}={v}")).collect();
        write!(f, "{{{}}}", parts.join(","))
    }
}

impl FromIterator<(String, usize)> for RuntimeConfig {
    fn from_iter<T: IntoIterator<Item = (String, usize)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// A real-valued coordinate vector in optimizer space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchPoint {
    coords: Vec<f64>,
}

impl SearchPoint {
    pub fn new(coords: Vec<f64>) -> Self {
        Self { coords }
    }

    pub fn dim(&self) -> usize {
        self.coords.len()
    }

    pub fn coords(&self) -> &[f64] {
        &self.coords
    }

    pub fn into_coords(self) -> Vec<f64> {
        self.coords
    }
}

impl From<Vec<f64>> for SearchPoint {
    fn from(coords: Vec<f64>) -> Self {
        Self::new(coords)
    }
}

impl std::ops::Index<usize> for SearchPoint {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.coords[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knobs::{Knob, KnobSpace};

    fn space() -> KnobSpace {
        KnobSpace::openmp(&[10, 20], &["lulesh.cc@979", "lulesh.cc@283"], 4).unwrap()
    }

    #[test]
    fn equality_is_order_independent() {
        let a = RuntimeConfig::new().with("threads", 1).with("bind", 0);
        let b = RuntimeConfig::new().with("bind", 0).with("threads", 1);
        assert_eq!(a, b);
    }

    #[test]
    fn validate_catches_range_and_unknown_knobs() {
        let space = KnobSpace::new(vec![Knob::global("bind", "OMP_PROC_BIND", ["close", "spread"])])
            .unwrap();

        assert!(RuntimeConfig::new().with("bind", 1).validate(&space).is_ok());
        assert_eq!(
            RuntimeConfig::new().with("bind", 2).validate(&space),
            Err(CodecError::OutOfRange {
                knob: "bind".into(),
                value: 2,
                cardinality: 2
            })
        );
        assert!(matches!(
            RuntimeConfig::new().with("bind", 0).with("x", 0).validate(&space),
            Err(CodecError::UnknownKnob { .. })
        ));
        assert!(matches!(
            RuntimeConfig::new().validate(&space),
            Err(CodecError::MissingKnob { .. })
        ));
    }

    #[test]
    fn labels_round_trip() {
        let space = space();
        let config = RuntimeConfig::new()
            .with("num_threads", 1)
            .with("proc_bind", 1)
            .with("places", 2)
            .with("lulesh.cc@283", 3)
            .with("lulesh.cc@979", 0);

        let labels = config.labels(&space).unwrap();
        assert_eq!(labels["num_threads"], "20");
        assert_eq!(labels["proc_bind"], "spread");
        assert_eq!(labels["places"], "sockets");

        let back = RuntimeConfig::from_labels(
            &space,
            labels.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        )
        .unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn environment_applies_globals_and_regions() {
        let space = space();
        let config = RuntimeConfig::new()
            .with("num_threads", 0)
            .with("proc_bind", 0)
            .with("places", 1)
            .with("lulesh.cc@283", 2)
            .with("lulesh.cc@979", 1);

        let env = config.environment(&space).unwrap();
        assert!(env.contains(&("OMP_NUM_THREADS".into(), "10".into())));
        assert!(env.contains(&("OMP_PROC_BIND".into(), "close".into())));
        assert!(env.contains(&("OMP_PLACES".into(), "cores".into())));
        assert!(env.contains(&(
            REGION_POLICY_ENV.into(),
            "StaticRegion,lulesh.cc@283=2,lulesh.cc@979=1".into()
        )));
    }
}
