//! Restriction table and transformation parameters.

use std::{env, path::Path};

use anyhow::{Context, Result, ensure};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::graph::{ElementType, OpKind};

// Get the sweep bound from environment variable or use default value
pub static MAX_SWEEPS: Lazy<usize> = Lazy::new(|| {
    env::var("LPT_MAX_SWEEPS")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .filter(|val| *val > 0)
        .unwrap_or(16)
});

/// Precisions acceptable on one input of an operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRestriction {
    pub index: usize,
    pub precisions: Vec<ElementType>,
}

/// Per-input precision restrictions of an operation kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPrecisionRestriction {
    pub kind: OpKind,
    pub inputs: Vec<PortRestriction>,
}

impl OperationPrecisionRestriction {
    pub fn new(kind: OpKind, inputs: &[(usize, &[ElementType])]) -> Self {
        Self {
            kind,
            inputs: inputs
                .iter()
                .map(|(index, precisions)| PortRestriction {
                    index: *index,
                    precisions: precisions.to_vec(),
                })
                .collect(),
        }
    }
}

/// u8 activations and i8 weights for the kernels with integer implementations.
pub fn default_restrictions() -> Vec<OperationPrecisionRestriction> {
    use ElementType::{I8, U8};
    vec![
        OperationPrecisionRestriction::new(OpKind::Convolution, &[(0, &[U8]), (1, &[I8])]),
        OperationPrecisionRestriction::new(OpKind::GroupConvolution, &[(0, &[U8]), (1, &[I8])]),
        OperationPrecisionRestriction::new(OpKind::MatMul, &[(0, &[U8, I8]), (1, &[I8])]),
    ]
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LptParams {
    /// Store quantized tensors in their integer type. When false the fake-quantize outputs stay
    /// `f32` and the dequantization has no `Convert`.
    pub update_precisions: bool,
    /// Accept data precisions that need a zero point.
    pub support_asymmetric_quantization: bool,
    /// Bound on the number of rule sweeps.
    pub max_sweeps: usize,
}

impl Default for LptParams {
    fn default() -> Self {
        Self {
            update_precisions: true,
            support_asymmetric_quantization: true,
            max_sweeps: *MAX_SWEEPS,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LowPrecisionConfig {
    #[serde(default = "default_restrictions")]
    pub restrictions: Vec<OperationPrecisionRestriction>,
    #[serde(default)]
    pub params: LptParams,
}

impl Default for LowPrecisionConfig {
    fn default() -> Self {
        Self {
            restrictions: default_restrictions(),
            params: LptParams::default(),
        }
    }
}

impl LowPrecisionConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("parsing low precision config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json_str(&content)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.params.max_sweeps > 0, "max_sweeps must be positive");
        for restriction in &self.restrictions {
            for port in &restriction.inputs {
                ensure!(
                    port.precisions.iter().all(|p| p.is_low_precision()),
                    "{} input {} lists a precision that is not 8-bit: {:?}",
                    restriction.kind,
                    port.index,
                    port.precisions
                );
            }
        }
        Ok(())
    }

    /// Restriction registered for `kind`, if any.
    pub fn restriction(&self, kind: OpKind) -> Option<&OperationPrecisionRestriction> {
        self.restrictions.iter().find(|r| r.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "restrictions": [
                { "kind": "Convolution", "inputs": [ { "index": 0, "precisions": ["u8"] } ] }
            ],
            "params": { "update_precisions": false, "max_sweeps": 4 }
        }"#;
        let config = LowPrecisionConfig::from_json_str(json).unwrap();
        assert!(!config.params.update_precisions);
        assert!(config.params.support_asymmetric_quantization);
        assert_eq!(config.params.max_sweeps, 4);
        let conv = config.restriction(OpKind::Convolution).unwrap();
        assert_eq!(conv.inputs[0].precisions, vec![ElementType::U8]);
        assert!(config.restriction(OpKind::MatMul).is_none());
    }

    #[test]
    fn test_config_rejects_float_restriction() {
        let json = r#"{ "restrictions": [
            { "kind": "MatMul", "inputs": [ { "index": 1, "precisions": ["f32"] } ] }
        ] }"#;
        assert!(LowPrecisionConfig::from_json_str(json).is_err());
    }

    #[test]
    fn test_config_from_path_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();
        let config = LowPrecisionConfig::from_path(file.path()).unwrap();
        assert_eq!(config.restrictions, default_restrictions());
        assert!(config.params.update_precisions);
    }
}
