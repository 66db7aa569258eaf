//! Traces in-memory neural network models and exports them as ONNX graphs.
//!
//! A [`Model`] is run once through a recording [`TraceContext`], the recorded
//! operators are lowered to standard ONNX operators through a [`MappingTable`],
//! the graph is optimized and annotated with shapes, checked against the model
//! on generated samples, and written atomically.

pub mod config;
pub mod exporter;
pub mod ir;
pub mod loader;
pub mod mapper;
pub mod optimizer;
pub mod pipeline;
pub mod runtime;
pub mod tracer;
pub mod verifier;

pub use config::{DynamicAxis, ExportConfig};
pub use exporter::{DecodedModel, OnnxExporter, OnnxImporter};
pub use ir::{DataType, Dim, Graph, Tensor};
pub use loader::safetensors::SafetensorsLoader;
pub use loader::{WeightLoader, WeightStore};
pub use mapper::{Mapping, MappingTable};
pub use pipeline::{export, ExportError, ExportOutcome, ExportReport, ExportWarning, Exporter, Remap, SampleInput};
pub use runtime::TensorData;
pub use tracer::{Layer, Model, Sequential, TraceContext, Value};
pub use verifier::Tolerance;
