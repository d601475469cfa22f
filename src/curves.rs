//! Named piecewise lookup curves used to reshape normalized scores.
//!
//! A curve is an ordered list of output values sampled at a fixed 0.01
//! step over the domain [0, 1]. Lookup returns the value at the smallest
//! sampled input at or above x, or the last value once x passes the
//! domain.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ConfigError;
use crate::types::LookupError;

/// Input step between curve samples.
pub const CURVE_STEP: f64 = 0.01;

/// Points of one named curve.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Curve {
    pub name: String,
    pub values: Vec<f64>,
}

impl Curve {
    /// The y value at an x position in the curve.
    pub fn value_at(&self, x: f64) -> f64 {
        for (i, value) in self.values.iter().enumerate() {
            let sample_x = i as f64 * CURVE_STEP;
            if x <= sample_x {
                return *value;
            }
        }
        // Past the sampled domain: clamp to the final value.
        self.values.last().copied().unwrap_or(0.0)
    }

    /// The x axis positions matching `values`, for plotting.
    pub fn sample_xs(&self) -> Vec<f64> {
        (0..self.values.len()).map(|i| i as f64 * CURVE_STEP).collect()
    }
}

/// All curves known to the engine, loaded once at startup and injected
/// into the scoring pass.
#[derive(Debug, Clone, Default)]
pub struct CurveTable {
    curves: HashMap<String, Curve>,
}

impl CurveTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, curve: Curve) {
        self.curves.insert(curve.name.clone(), curve);
    }

    pub fn get(&self, name: &str) -> Result<&Curve, LookupError> {
        self.curves.get(name).ok_or_else(|| LookupError::Curve {
            name: name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.curves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    /// Load every `*.json` curve file in a directory.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let mut table = Self::new();

        let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| ConfigError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let curve: Curve =
                serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.display().to_string(),
                    source: source.into(),
                })?;

            if curve.values.is_empty() {
                return Err(ConfigError::Invalid {
                    path: path.display().to_string(),
                    reason: format!("curve {} has no sample values", curve.name),
                });
            }

            debug!(curve = %curve.name, samples = curve.values.len(), "loaded curve");
            table.insert(curve);
        }

        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(values: Vec<f64>) -> Curve {
        Curve {
            name: "test".to_string(),
            values,
        }
    }

    #[test]
    fn lookup_returns_first_sample_at_or_above_x() {
        let c = curve(vec![0.0, 0.5, 1.0]);
        // Samples sit at x = 0.00, 0.01, 0.02.
        assert_eq!(c.value_at(0.0), 0.0);
        assert_eq!(c.value_at(0.005), 0.5);
        assert_eq!(c.value_at(0.01), 0.5);
        assert_eq!(c.value_at(0.015), 1.0);
    }

    #[test]
    fn lookup_clamps_past_domain() {
        let c = curve(vec![0.0, 0.5, 1.0]);
        assert_eq!(c.value_at(5.0), 1.0);
        assert_eq!(c.value_at(0.02), 1.0);
    }

    #[test]
    fn lookup_is_monotonic_in_index_for_monotonic_curves() {
        let c = curve(vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        let mut last = f64::NEG_INFINITY;
        for i in 0..50 {
            let v = c.value_at(i as f64 * 0.001);
            assert!(v >= last, "lookup regressed at step {i}");
            last = v;
        }
    }

    #[test]
    fn empty_curve_yields_zero() {
        let c = curve(vec![]);
        assert_eq!(c.value_at(0.5), 0.0);
    }

    #[test]
    fn table_lookup_by_name() {
        let mut table = CurveTable::new();
        table.insert(Curve {
            name: "linear".to_string(),
            values: vec![0.0, 1.0],
        });
        assert!(table.get("linear").is_ok());
        assert!(matches!(
            table.get("nope"),
            Err(LookupError::Curve { .. })
        ));
    }
}
