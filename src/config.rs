//! Export configuration, loaded from TOML or built in code.
//!
//! ```toml
//! opset_version = 17
//! output_path = "model.onnx"
//! output_names = ["logits"]
//! seed = 7
//!
//! [tolerance]
//! atol = 1e-5
//! rtol = 1e-4
//!
//! [[dynamic_axes]]
//! tensor = "input"
//! axis = 0
//! name = "batch"
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::verifier::Tolerance;

pub const MIN_OPSET: i64 = 7;
pub const MAX_OPSET: i64 = 21;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Parse(String),
    #[error("TOML serialise error: {0}")]
    Serialize(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Declares one axis of a graph input or output as symbolic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicAxis {
    pub tensor: String,
    pub axis: usize,
    /// Symbol name; defaults to `{tensor}_dynamic_axes_{axis}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl DynamicAxis {
    pub fn new(tensor: impl Into<String>, axis: usize) -> Self {
        Self {
            tensor: tensor.into(),
            axis,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn symbol(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}_dynamic_axes_{}", self.tensor, self.axis))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Target ONNX opset.
    pub opset_version: i64,
    /// Destination of the artifact.
    pub output_path: PathBuf,
    /// Names for the graph outputs, by position. Unnamed outputs keep their traced names.
    pub output_names: Vec<String>,
    /// Run fusion, constant folding and dead code elimination.
    pub optimize: bool,
    /// Write the artifact even when validation finds a divergence.
    pub allow_divergence: bool,
    /// Validate on boundary and zero-batch samples as well as the primary one.
    pub edge_case_samples: bool,
    pub seed: u64,
    /// How many times a divergent node may be re-mapped with its next candidate.
    pub max_remap_attempts: usize,
    pub tolerance: Tolerance,
    pub dynamic_axes: Vec<DynamicAxis>,
    /// Extra `metadata_props` entries.
    pub metadata: BTreeMap<String, String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            opset_version: 17,
            output_path: PathBuf::from("model.onnx"),
            output_names: Vec::new(),
            optimize: true,
            allow_divergence: false,
            edge_case_samples: true,
            seed: 0,
            max_remap_attempts: 3,
            tolerance: Tolerance::default(),
            dynamic_axes: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }
}

impl ExportConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_OPSET..=MAX_OPSET).contains(&self.opset_version) {
            return Err(ConfigError::Invalid(format!(
                "opset_version {} is outside {MIN_OPSET}..={MAX_OPSET}",
                self.opset_version
            )));
        }
        let Tolerance { atol, rtol } = self.tolerance;
        if !(atol.is_finite() && rtol.is_finite() && atol >= 0.0 && rtol >= 0.0) {
            return Err(ConfigError::Invalid(format!("tolerance atol={atol} rtol={rtol}")));
        }
        let mut seen = BTreeSet::new();
        for axis in &self.dynamic_axes {
            if axis.name.as_deref() == Some("") {
                return Err(ConfigError::Invalid(format!(
                    "dynamic axis {} of '{}' has an empty name",
                    axis.axis, axis.tensor
                )));
            }
            if !seen.insert((axis.tensor.as_str(), axis.axis)) {
                return Err(ConfigError::Invalid(format!(
                    "axis {} of '{}' is declared dynamic twice",
                    axis.axis, axis.tensor
                )));
            }
        }
        let mut names = BTreeSet::new();
        for name in &self.output_names {
            if name.is_empty() || !names.insert(name) {
                return Err(ConfigError::Invalid(format!("output name '{name}' is empty or repeated")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default() {
        let c = ExportConfig::default();
        assert_eq!(c.opset_version, 17);
        assert_eq!(c.tolerance, Tolerance { atol: 1e-5, rtol: 1e-4 });
        assert!(c.optimize);
        assert!(!c.allow_divergence);
        assert!(c.edge_case_samples);
        assert_eq!(c.max_remap_attempts, 3);
        c.validate().unwrap();
    }

    #[test]
    fn test_from_toml_partial() {
        let c = ExportConfig::from_toml(
            r#"
            opset_version = 13
            output_path = "out/m.onnx"

            [tolerance]
            atol = 0.001

            [[dynamic_axes]]
            tensor = "x"
            axis = 0
            "#,
        )
        .unwrap();
        assert_eq!(c.opset_version, 13);
        assert_eq!(c.output_path, PathBuf::from("out/m.onnx"));
        assert_eq!(c.tolerance.atol, 0.001);
        assert_eq!(c.tolerance.rtol, 1e-4);
        assert_eq!(c.dynamic_axes[0].symbol(), "x_dynamic_axes_0");
        assert!(c.optimize);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut c = ExportConfig {
            output_names: vec!["logits".into()],
            dynamic_axes: vec![DynamicAxis::new("x", 0).named("batch")],
            ..Default::default()
        };
        c.metadata.insert("author".into(), "me".into());
        let parsed = ExportConfig::from_toml(&c.to_toml().unwrap()).unwrap();
        assert_eq!(parsed, c);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("export.toml");
        std::fs::write(&path, "seed = 7\noutput_names = [\"logits\"]\n").unwrap();
        let c = ExportConfig::from_file(&path).unwrap();
        assert_eq!(c.seed, 7);
        assert_eq!(c.output_names, vec!["logits".to_string()]);

        let err = ExportConfig::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(ExportConfig::from_toml("opset_version = 5").is_err());
        assert!(ExportConfig::from_toml("opset_version = \"x\"").is_err());
        let c = ExportConfig {
            dynamic_axes: vec![DynamicAxis::new("x", 0), DynamicAxis::new("x", 0)],
            ..Default::default()
        };
        assert!(c.validate().is_err());
        let c = ExportConfig {
            output_names: vec!["y".into(), "y".into()],
            ..Default::default()
        };
        assert!(c.validate().is_err());
    }
}
