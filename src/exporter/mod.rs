pub mod onnx;
pub mod onnx_exporter;
pub mod onnx_importer;

use std::path::PathBuf;

use thiserror::Error;

pub use onnx_exporter::OnnxExporter;
pub use onnx_importer::{DecodedModel, OnnxImporter};

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("writing {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Oldest IR version whose runtime understands `opset`.
pub fn ir_version_for_opset(opset: i64) -> i64 {
    match opset {
        i64::MIN..=8 => 3,
        9..=10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        19..=20 => 9,
        _ => 10,
    }
}

/// Before IR 4 every initializer must also be declared as a graph input.
pub fn initializers_are_inputs(ir_version: i64) -> bool {
    ir_version < 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ir_version_for_each_opset_range() {
        for (opsets, ir) in [(7..=8, 3), (9..=10, 5), (11..=11, 6), (12..=14, 7), (15..=18, 8), (19..=20, 9), (21..=21, 10)] {
            for opset in opsets {
                assert_eq!(ir_version_for_opset(opset), ir, "opset {opset}");
            }
        }
    }

    #[test]
    fn test_initializers_listed_as_inputs_only_before_ir_4() {
        assert!(initializers_are_inputs(ir_version_for_opset(8)));
        assert!(!initializers_are_inputs(ir_version_for_opset(9)));
    }
}
