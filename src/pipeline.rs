//! End-to-end export: trace, map, optimize, infer shapes, validate, serialize.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ExportConfig};
use crate::exporter::{ExporterError, OnnxExporter, OnnxImporter};
use crate::ir::shape_inference::{ShapeError, ShapeInference};
use crate::ir::{DataType, Dim, Graph, GraphError, Tensor};
use crate::loader::WeightStore;
use crate::mapper::{MapperError, MappingRecord, MappingTable, OperatorMapper};
use crate::optimizer::{Optimizer, OptimizerError};
use crate::runtime::{Interpreter, RuntimeError, TensorData, Values};
use crate::tracer::{GraphTracer, Model, Trace, TraceError, TraceWarning};
use crate::verifier::{
    Divergence, GraphValidator, Sample, SampleGenerator, SampleKind, ValidationSummary, VerifierError,
};

/// Shape and dtype of one model input; the values are generated.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleInput {
    pub name: String,
    pub shape: Vec<usize>,
    pub data_type: DataType,
}

impl SampleInput {
    pub fn f32(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            data_type: DataType::F32,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("sample input '{name}': {detail}")]
    Input { name: String, detail: String },
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Mapper(#[from] MapperError),
    #[error(transparent)]
    Optimizer(#[from] OptimizerError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Verifier(#[from] VerifierError),
    #[error(transparent)]
    Exporter(#[from] ExporterError),
    #[error("decoded artifact disagrees with the exported graph: {0}")]
    RoundTrip(String),
}

/// How an export run ended, for callers that report a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportOutcome {
    Exported,
    ValidationFailed,
    Failed,
}

impl ExportOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ExportOutcome::Exported => 0,
            ExportOutcome::Failed => 1,
            ExportOutcome::ValidationFailed => 2,
        }
    }
}

impl ExportError {
    pub fn outcome(&self) -> ExportOutcome {
        match self {
            ExportError::Verifier(VerifierError::NumericalDivergence { .. })
            | ExportError::Verifier(VerifierError::OutputShapeMismatch { .. })
            | ExportError::RoundTrip(_) => ExportOutcome::ValidationFailed,
            _ => ExportOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportWarning {
    Trace(TraceWarning),
    /// A declared dynamic output axis whose size does not depend on any input symbol.
    StaticAxis { tensor: String, axis: usize, size: usize },
    SkippedSample { sample: SampleKind, reason: String },
    AllowedDivergence(Divergence),
}

impl fmt::Display for ExportWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportWarning::Trace(w) => write!(f, "{w}"),
            ExportWarning::StaticAxis { tensor, axis, size } => {
                write!(f, "axis {axis} of '{tensor}' was declared dynamic but is always {size}")
            }
            ExportWarning::SkippedSample { sample, reason } => {
                write!(f, "{sample} sample skipped: {reason}")
            }
            ExportWarning::AllowedDivergence(d) => write!(
                f,
                "{} sample diverges on '{}' (max abs {:e}) and was accepted",
                d.sample, d.output, d.max_abs
            ),
        }
    }
}

/// A traced node that was re-mapped after its encoding diverged.
#[derive(Debug, Clone, PartialEq)]
pub struct Remap {
    pub node: String,
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportReport {
    pub output_path: PathBuf,
    pub bytes_written: u64,
    /// Lowercase hex SHA-256 of the artifact.
    pub sha256: String,
    pub opset_version: i64,
    pub node_count: usize,
    /// Encoding chosen for each traced node.
    pub encodings: BTreeMap<String, &'static str>,
    pub warnings: Vec<ExportWarning>,
    pub validation: ValidationSummary,
    pub remaps: Vec<Remap>,
}

/// Runs export requests. Holds only configuration, so one instance can serve
/// concurrent exports from several threads.
pub struct Exporter {
    config: ExportConfig,
    table: MappingTable,
}

impl Exporter {
    pub fn new(config: ExportConfig) -> Result<Self, ExportError> {
        config.validate()?;
        Ok(Self {
            config,
            table: MappingTable::default(),
        })
    }

    /// Replaces the built-in mapping table (custom operators, alternative encodings).
    pub fn with_table(mut self, table: MappingTable) -> Self {
        self.table = table;
        self
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    /// Exports `model` and writes the artifact to the configured path.
    pub fn export<M: Model + ?Sized>(
        &self,
        model: &M,
        weights: &WeightStore,
        inputs: &[SampleInput],
    ) -> Result<ExportReport, ExportError> {
        let (bytes, mut report) = self.export_to_bytes(model, weights, inputs)?;
        OnnxExporter::write(&bytes, &self.config.output_path)?;
        report.output_path = self.config.output_path.clone();
        info!(
            path = %report.output_path.display(),
            bytes = report.bytes_written,
            sha256 = %report.sha256,
            "artifact written"
        );
        Ok(report)
    }

    /// Runs every stage up to and including the round-trip check, without touching the filesystem.
    pub fn export_to_bytes<M: Model + ?Sized>(
        &self,
        model: &M,
        weights: &WeightStore,
        inputs: &[SampleInput],
    ) -> Result<(Vec<u8>, ExportReport), ExportError> {
        let descriptors = self.input_descriptors(inputs)?;
        let shapes: Vec<Vec<usize>> = inputs.iter().map(|i| i.shape.clone()).collect();
        let samples = SampleGenerator::new(self.config.seed, self.config.edge_case_samples).generate(&descriptors, &shapes);
        let primary = &samples[0];

        let trace = GraphTracer::trace(model, weights, &descriptors, &primary.values)?;
        let mut warnings: Vec<ExportWarning> = trace.warnings.iter().cloned().map(ExportWarning::Trace).collect();

        let validator = GraphValidator::new(self.config.tolerance);
        let mut overrides = BTreeMap::new();
        let (mut graph, mut record, mut axis_warnings) = self.lower(&trace, &overrides)?;
        let mut summary = validator.validate(model, weights, &graph, &samples)?;
        let mut remaps = Vec::new();

        while let Some(divergence) = summary.divergence.clone() {
            if remaps.len() >= self.config.max_remap_attempts {
                break;
            }
            let Some(origin) = divergence.suspect_origin.clone() else {
                break;
            };
            let Some(choice) = record.choice(&origin).cloned() else {
                break;
            };
            let mut next = overrides.clone();
            next.insert(origin.clone(), choice.index + 1);
            let (g, r, w) = match self.lower(&trace, &next) {
                Ok(lowered) => lowered,
                Err(ExportError::Mapper(err)) => {
                    debug!(node = %origin, error = %err, "no alternative encoding left");
                    break;
                }
                Err(err) => return Err(err),
            };
            let to = r.choice(&origin).map(|c| c.encoding).unwrap_or(choice.encoding);
            warn!(node = %origin, from = choice.encoding, to, max_abs = divergence.max_abs, "re-mapping divergent node");
            remaps.push(Remap {
                node: origin,
                from: choice.encoding,
                to,
            });
            summary = validator.validate(model, weights, &g, &samples)?;
            overrides = next;
            graph = g;
            record = r;
            axis_warnings = w;
        }

        warnings.append(&mut axis_warnings);
        warnings.extend(
            summary
                .skipped
                .iter()
                .map(|(sample, reason)| ExportWarning::SkippedSample {
                    sample: *sample,
                    reason: reason.clone(),
                }),
        );
        if let Some(divergence) = summary.divergence.clone() {
            if !self.config.allow_divergence {
                return Err(VerifierError::from(divergence).into());
            }
            warn!(output = %divergence.output, max_abs = divergence.max_abs, "divergence accepted by configuration");
            warnings.push(ExportWarning::AllowedDivergence(divergence));
        }

        let bytes = OnnxExporter::encode(&graph, &self.config.metadata)?;
        let reference = if summary.divergence.is_some() {
            RoundTripReference::Graph(&graph)
        } else {
            RoundTripReference::Model(&trace)
        };
        round_trip(reference, &graph, &bytes, primary, &self.config)?;

        let report = ExportReport {
            output_path: PathBuf::new(),
            bytes_written: bytes.len() as u64,
            sha256: format!("{:x}", Sha256::digest(&bytes)),
            opset_version: graph.opset_version,
            node_count: graph.nodes.len(),
            encodings: record.iter().map(|(node, c)| (node.to_string(), c.encoding)).collect(),
            warnings,
            validation: summary,
            remaps,
        };
        info!(
            model = model.name(),
            nodes = report.node_count,
            max_abs = report.validation.max_abs(),
            warnings = report.warnings.len(),
            remaps = report.remaps.len(),
            "export validated"
        );
        Ok((bytes, report))
    }

    fn input_descriptors(&self, inputs: &[SampleInput]) -> Result<Vec<Tensor>, ExportError> {
        let mut names = BTreeSet::new();
        let mut descriptors = Vec::with_capacity(inputs.len());
        for input in inputs {
            let invalid = |detail: String| ExportError::Input {
                name: input.name.clone(),
                detail,
            };
            if !names.insert(input.name.as_str()) {
                return Err(invalid("declared twice".to_string()));
            }
            if input.data_type != DataType::F32 {
                return Err(invalid(format!("{:?} inputs cannot be executed", input.data_type)));
            }
            let mut shape: Vec<Dim> = input.shape.iter().map(|&d| Dim::Fixed(d)).collect();
            for axis in self.config.dynamic_axes.iter().filter(|a| a.tensor == input.name) {
                let dim = shape.get_mut(axis.axis).ok_or_else(|| {
                    invalid(format!("dynamic axis {} is out of range for rank {}", axis.axis, input.shape.len()))
                })?;
                *dim = Dim::Symbolic(axis.symbol());
            }
            descriptors.push(Tensor::value(input.name.clone(), shape, input.data_type));
        }
        Ok(descriptors)
    }

    /// Maps, optimizes and annotates a copy of the traced graph.
    fn lower(
        &self,
        trace: &Trace,
        overrides: &BTreeMap<String, usize>,
    ) -> Result<(Graph, MappingRecord, Vec<ExportWarning>), ExportError> {
        let mut graph = trace.graph.clone();
        graph.opset_version = self.config.opset_version;
        let record = OperatorMapper::new(&self.table).map(&mut graph, overrides)?;
        if self.config.optimize {
            Optimizer::default_passes().optimize(&mut graph)?;
        }
        graph.sort_topologically()?;
        graph.validate_topology()?;
        self.rename_outputs(&mut graph)?;
        ShapeInference::infer(&mut graph)?;
        let warnings = self.apply_output_axes(&mut graph)?;
        Ok((graph, record, warnings))
    }

    fn rename_outputs(&self, graph: &mut Graph) -> Result<(), ExportError> {
        let names = &self.config.output_names;
        if names.len() > graph.outputs.len() {
            return Err(ConfigError::Invalid(format!(
                "{} output names for {} outputs",
                names.len(),
                graph.outputs.len()
            ))
            .into());
        }
        for (idx, name) in names.iter().enumerate() {
            let current = graph.outputs[idx].name.clone();
            if current == *name {
                continue;
            }
            let taken = graph.descriptor(name).is_some()
                || graph.weights.contains_key(name)
                || graph.nodes.iter().any(|n| n.outputs.contains(name));
            if taken {
                return Err(ConfigError::Invalid(format!("output name '{name}' is already used in the graph")).into());
            }
            graph.rename_value(&current, name);
        }
        Ok(())
    }

    /// Names the symbolic axes declared for graph outputs.
    fn apply_output_axes(&self, graph: &mut Graph) -> Result<Vec<ExportWarning>, ExportError> {
        let input_symbols: BTreeSet<String> = graph
            .inputs
            .iter()
            .flat_map(|i| i.shape.iter().filter_map(Dim::symbol).map(str::to_string))
            .collect();
        let mut warnings = Vec::new();
        for axis in &self.config.dynamic_axes {
            if graph.inputs.iter().any(|i| i.name == axis.tensor) {
                continue;
            }
            let Some(idx) = graph.outputs.iter().position(|o| o.name == axis.tensor) else {
                return Err(ConfigError::Invalid(format!(
                    "dynamic axis names '{}', which is neither a graph input nor output",
                    axis.tensor
                ))
                .into());
            };
            let rank = graph.outputs[idx].shape.len();
            let dim = graph.outputs[idx].shape.get(axis.axis).cloned().ok_or_else(|| {
                ConfigError::Invalid(format!("dynamic axis {} of '{}' exceeds rank {rank}", axis.axis, axis.tensor))
            })?;
            let symbol = axis.symbol();
            match dim {
                Dim::Fixed(size) => {
                    warn!(tensor = %axis.tensor, axis = axis.axis, size, "declared dynamic axis is static");
                    warnings.push(ExportWarning::StaticAxis {
                        tensor: axis.tensor.clone(),
                        axis: axis.axis,
                        size,
                    });
                }
                Dim::Symbolic(current) if current == symbol => {}
                Dim::Symbolic(current) if input_symbols.contains(&current) => {
                    // Keep the input's symbol intact; only this output axis is renamed.
                    graph.outputs[idx].shape[axis.axis] = Dim::Symbolic(symbol);
                }
                Dim::Symbolic(current) => graph.rename_symbol(&current, &symbol),
            }
        }
        Ok(warnings)
    }
}

/// What the decoded artifact must reproduce.
enum RoundTripReference<'a> {
    /// The traced model outputs on the primary sample.
    Model(&'a Trace),
    /// The encoded graph itself, once a divergence from the model was accepted.
    Graph(&'a Graph),
}

/// Decodes the artifact and re-runs it on the primary sample.
fn round_trip(
    reference: RoundTripReference<'_>,
    graph: &Graph,
    bytes: &[u8],
    primary: &Sample,
    config: &ExportConfig,
) -> Result<(), ExportError> {
    let decoded = OnnxImporter::decode(bytes)?;
    if decoded.graph.nodes.len() != graph.nodes.len() || decoded.graph.weights.len() != graph.weights.len() {
        return Err(ExportError::RoundTrip(format!(
            "{} nodes / {} initializers decoded, {} / {} encoded",
            decoded.graph.nodes.len(),
            decoded.graph.weights.len(),
            graph.nodes.len(),
            graph.weights.len()
        )));
    }
    let feeds: Values = graph
        .inputs
        .iter()
        .zip(&primary.values)
        .map(|(input, value)| (input.name.clone(), value.clone()))
        .collect();
    let runtime = |e: RuntimeError| ExportError::RoundTrip(e.to_string());
    let expected: Vec<(String, TensorData)> = match reference {
        RoundTripReference::Model(trace) => trace
            .graph
            .outputs
            .iter()
            .map(|o| {
                trace
                    .values
                    .get(&o.name)
                    .map(|v| (o.name.clone(), v.clone()))
                    .ok_or_else(|| ExportError::RoundTrip(format!("no traced value for output '{}'", o.name)))
            })
            .collect::<Result<_, _>>()?,
        RoundTripReference::Graph(lowered) => Interpreter::new(lowered).run_outputs(&feeds).map_err(runtime)?,
    };
    let actual = Interpreter::new(&decoded.graph).run_outputs(&feeds).map_err(runtime)?;
    if expected.len() != actual.len() {
        return Err(ExportError::RoundTrip(format!(
            "{} outputs decoded, {} expected",
            actual.len(),
            expected.len()
        )));
    }
    for ((name, e), (_, a)) in expected.iter().zip(&actual) {
        let close = e.shape() == a.shape()
            && e
                .data()
                .iter()
                .zip(a.data())
                .all(|(&x, &y)| config.tolerance.close(y, x));
        if !close {
            return Err(ExportError::RoundTrip(format!("output '{name}' changed after decoding")));
        }
    }
    debug!(outputs = actual.len(), "round-trip check passed");
    Ok(())
}

/// Exports with the built-in mapping table.
pub fn export<M: Model + ?Sized>(
    model: &M,
    weights: &WeightStore,
    inputs: &[SampleInput],
    config: ExportConfig,
) -> Result<ExportReport, ExportError> {
    Exporter::new(config)?.export(model, weights, inputs)
}
