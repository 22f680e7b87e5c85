use std::collections::BTreeMap;

use crate::AlgorithmError;
use crate::Result;

/// One admissible parameter of an algorithm: inclusive range and the value
/// used when the submission leaves it out.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub key: &'static str,
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

impl ParamSpec {
    pub const fn new(key: &'static str, min: f64, max: f64, default: f64) -> Self {
        Self {
            key,
            min,
            max,
            default,
        }
    }
}

/// A parameter map checked against an algorithm's [`ParamSpec`] table:
/// unknown keys rejected, ranges enforced, defaults filled in. After
/// resolution every declared key is present.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams(BTreeMap<String, f64>);

impl ResolvedParams {
    pub fn resolve(specs: &[ParamSpec], requested: &BTreeMap<String, f64>) -> Result<Self> {
        for key in requested.keys() {
            if !specs.iter().any(|spec| spec.key == key) {
                return Err(AlgorithmError::InvalidParam {
                    key: key.clone(),
                    reason: "not an admissible parameter for this algorithm".to_string(),
                });
            }
        }

        let mut resolved = BTreeMap::new();
        for spec in specs {
            let value = requested.get(spec.key).copied().unwrap_or(spec.default);
            if !value.is_finite() || value < spec.min || value > spec.max {
                return Err(AlgorithmError::InvalidParam {
                    key: spec.key.to_string(),
                    reason: format!("{value} is outside [{}, {}]", spec.min, spec.max),
                });
            }
            resolved.insert(spec.key.to_string(), value);
        }
        Ok(Self(resolved))
    }

    /// Value of a declared key. Returns 0.0 for keys the spec table does not
    /// declare; kernels only ask for their own keys.
    pub fn value(&self, key: &str) -> f64 {
        self.0.get(key).copied().unwrap_or_default()
    }

    pub fn usize_value(&self, key: &str) -> usize {
        self.value(key) as usize
    }

    pub fn u32_value(&self, key: &str) -> u32 {
        self.value(key) as u32
    }

    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }

    pub fn into_map(self) -> BTreeMap<String, f64> {
        self.0
    }
}
