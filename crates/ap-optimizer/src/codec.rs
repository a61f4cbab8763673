//! Mapping between optimizer coordinates and discrete runtime configs.

use ap_types::{ApResult, CodecError, KnobSpace, RuntimeConfig, SearchPoint};

/// Round a coordinate to a choice index: half away from zero, then clamp
/// into `[0, cardinality - 1]`. NaN maps to 0.
///
/// Every conversion from optimizer space to a config goes through here.
pub fn round_to_index(x: f64, cardinality: usize) -> usize {
    let max = cardinality.saturating_sub(1) as f64;
    if x.is_nan() {
        return 0;
    }
    x.round().clamp(0.0, max) as usize
}

/// Bidirectional codec over a fixed knob space.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyCodec {
    space: KnobSpace,
}

impl PolicyCodec {
    pub fn new(space: KnobSpace) -> Self {
        Self { space }
    }

    pub fn space(&self) -> &KnobSpace {
        &self.space
    }

    pub fn dim(&self) -> usize {
        self.space.len()
    }

    /// Inclusive `(low, high)` bounds per dimension.
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        self.space
            .knobs()
            .iter()
            .map(|k| (0.0, k.cardinality().saturating_sub(1) as f64))
            .collect()
    }

    pub fn encode(&self, config: &RuntimeConfig) -> ApResult<SearchPoint> {
        config.validate(&self.space)?;
        let coords = self
            .space
            .knobs()
            .iter()
            .map(|k| config.get(&k.name).unwrap_or_default() as f64)
            .collect();
        Ok(SearchPoint::new(coords))
    }

    /// Decode a point. Out-of-bound coordinates are clamped, never rejected;
    /// only a wrong dimension is an error.
    pub fn decode(&self, point: &SearchPoint) -> ApResult<RuntimeConfig> {
        if point.dim() != self.dim() {
            return Err(CodecError::Dimension {
                expected: self.dim(),
                actual: point.dim(),
            }
            .into());
        }
        Ok(self
            .space
            .knobs()
            .iter()
            .zip(point.coords())
            .map(|(knob, &x)| (knob.name.clone(), round_to_index(x, knob.cardinality())))
            .collect())
    }
}
