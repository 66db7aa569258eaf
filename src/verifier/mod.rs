//! Numerical equivalence checks between a model and its exported graph.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ir::{format_shape, Graph};
use crate::ir::shape_inference::{ShapeError, SymbolBindings};
use crate::loader::WeightStore;
use crate::runtime::{Interpreter, RuntimeError, TensorData, Values};
use crate::tracer::{GraphTracer, Model, TraceError};

pub mod samples;

pub use samples::{Sample, SampleGenerator, SampleKind};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerifierError {
    #[error(
        "{sample} sample: output '{output}' diverges (max abs {max_abs:e}, max rel {max_rel:e}); suspect node {}",
        .suspect_node.as_deref().unwrap_or("<unknown>")
    )]
    NumericalDivergence {
        sample: SampleKind,
        output: String,
        max_abs: f32,
        max_rel: f32,
        suspect_node: Option<String>,
        suspect_origin: Option<String>,
    },
    #[error("{sample} sample: output '{output}' has shape {actual:?}, expected {expected}")]
    OutputShapeMismatch {
        sample: SampleKind,
        output: String,
        expected: String,
        actual: Vec<usize>,
    },
    #[error("{sample} sample: reference trace failed: {source}")]
    Trace {
        sample: SampleKind,
        #[source]
        source: TraceError,
    },
    #[error("{sample} sample: exported graph failed: {source}")]
    Runtime {
        sample: SampleKind,
        #[source]
        source: RuntimeError,
    },
    #[error("{sample} sample: {source}")]
    Shape {
        sample: SampleKind,
        #[source]
        source: ShapeError,
    },
}

/// Element-wise closeness: `|a - b| <= atol + rtol * |b|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub atol: f32,
    pub rtol: f32,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self { atol: 1e-5, rtol: 1e-4 }
    }
}

impl Tolerance {
    /// NaN is close to NaN and to nothing else.
    pub fn close(&self, actual: f32, expected: f32) -> bool {
        if actual.is_nan() || expected.is_nan() {
            return actual.is_nan() && expected.is_nan();
        }
        if actual == expected {
            return true;
        }
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Largest absolute and relative deviation between two equally sized buffers.
fn deviation(actual: &[f32], expected: &[f32]) -> (f32, f32) {
    let mut max_abs = 0.0f32;
    let mut max_rel = 0.0f32;
    for (&a, &b) in actual.iter().zip(expected) {
        let abs = match (a.is_nan(), b.is_nan()) {
            (true, true) => 0.0,
            (false, false) if a == b => 0.0,
            (false, false) => (a - b).abs(),
            _ => f32::INFINITY,
        };
        max_abs = max_abs.max(abs);
        if b != 0.0 && b.is_finite() {
            max_rel = max_rel.max(abs / b.abs());
        } else if abs > 0.0 {
            max_rel = f32::INFINITY;
        }
    }
    (max_abs, max_rel)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleReport {
    pub kind: SampleKind,
    pub max_abs: f32,
    pub max_rel: f32,
}

/// First divergence found, localized to the node that introduces it.
#[derive(Debug, Clone, PartialEq)]
pub struct Divergence {
    pub sample: SampleKind,
    pub output: String,
    pub max_abs: f32,
    pub max_rel: f32,
    pub suspect_node: Option<String>,
    pub suspect_origin: Option<String>,
}

impl From<Divergence> for VerifierError {
    fn from(d: Divergence) -> Self {
        VerifierError::NumericalDivergence {
            sample: d.sample,
            output: d.output,
            max_abs: d.max_abs,
            max_rel: d.max_rel,
            suspect_node: d.suspect_node,
            suspect_origin: d.suspect_origin,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationSummary {
    pub samples: Vec<SampleReport>,
    /// Edge samples the reference model could not run, with the reason.
    pub skipped: Vec<(SampleKind, String)>,
    pub divergence: Option<Divergence>,
}

impl ValidationSummary {
    pub fn max_abs(&self) -> f32 {
        self.samples.iter().map(|s| s.max_abs).fold(0.0, f32::max)
    }

    pub fn max_rel(&self) -> f32 {
        self.samples.iter().map(|s| s.max_rel).fold(0.0, f32::max)
    }

    pub fn is_within_tolerance(&self) -> bool {
        self.divergence.is_none()
    }

    /// Turns a recorded divergence into an error.
    pub fn into_result(self) -> Result<Self, VerifierError> {
        match self.divergence.clone() {
            Some(d) => Err(d.into()),
            None => Ok(self),
        }
    }
}

pub struct GraphValidator {
    tolerance: Tolerance,
}

impl GraphValidator {
    pub fn new(tolerance: Tolerance) -> Self {
        Self { tolerance }
    }

    /// Runs `model` and `graph` on every sample and compares their outputs.
    ///
    /// Outputs are matched by position, so renamed graph outputs still compare
    /// against the traced ones. Divergences are recorded in the summary; hard
    /// failures (a primary sample the model cannot run, a crashing graph, a
    /// shape that contradicts inference) are errors.
    pub fn validate<M: Model + ?Sized>(
        &self,
        model: &M,
        weights: &WeightStore,
        graph: &Graph,
        samples: &[Sample],
    ) -> Result<ValidationSummary, VerifierError> {
        let mut summary = ValidationSummary::default();
        let interpreter = Interpreter::new(graph);

        for sample in samples {
            let kind = sample.kind;
            let reference = match GraphTracer::trace(model, weights, &graph.inputs, &sample.values) {
                Ok(trace) => trace,
                Err(source) if kind != SampleKind::Primary => {
                    warn!(sample = %kind, error = %source, "skipping sample the model cannot run");
                    summary.skipped.push((kind, source.to_string()));
                    continue;
                }
                Err(source) => return Err(VerifierError::Trace { sample: kind, source }),
            };

            let shapes: Vec<&[usize]> = sample.values.iter().map(TensorData::shape).collect();
            let mut bindings = SymbolBindings::bind_inputs(&graph.inputs, &shapes)
                .map_err(|source| VerifierError::Shape { sample: kind, source })?;
            let feeds: Values = graph
                .inputs
                .iter()
                .zip(&sample.values)
                .map(|(input, value)| (input.name.clone(), value.clone()))
                .collect();
            let values = interpreter
                .run(&feeds)
                .map_err(|source| VerifierError::Runtime { sample: kind, source })?;

            // Exported output name -> traced name.
            let aliases: BTreeMap<&str, &str> = graph
                .outputs
                .iter()
                .zip(&reference.graph.outputs)
                .map(|(exported, traced)| (exported.name.as_str(), traced.name.as_str()))
                .collect();

            let mut report = SampleReport {
                kind,
                max_abs: 0.0,
                max_rel: 0.0,
            };
            let mut diverged = None;
            for output in &graph.outputs {
                let actual = values.get(&output.name).ok_or_else(|| VerifierError::Runtime {
                    sample: kind,
                    source: RuntimeError::MissingValue {
                        node: "<graph output>".to_string(),
                        value: output.name.clone(),
                    },
                })?;
                let traced_name = aliases.get(output.name.as_str()).copied().unwrap_or(&output.name);
                let expected = reference.values.get(traced_name).ok_or_else(|| VerifierError::Trace {
                    sample: kind,
                    source: TraceError::UnknownValue(traced_name.to_string()),
                })?;

                let shape_mismatch = || VerifierError::OutputShapeMismatch {
                    sample: kind,
                    output: output.name.clone(),
                    expected: format_shape(&output.shape),
                    actual: actual.shape().to_vec(),
                };
                bindings
                    .observe(&output.name, &output.shape, actual.shape())
                    .map_err(|_| shape_mismatch())?;
                if actual.shape() != expected.shape() {
                    return Err(shape_mismatch());
                }

                let (max_abs, max_rel) = deviation(actual.data(), expected.data());
                report.max_abs = report.max_abs.max(max_abs);
                report.max_rel = report.max_rel.max(max_rel);
                let within = actual
                    .data()
                    .iter()
                    .zip(expected.data())
                    .all(|(&a, &b)| self.tolerance.close(a, b));
                if !within && diverged.is_none() {
                    diverged = Some((output.name.clone(), max_abs, max_rel));
                }
            }

            for (name, descriptor) in &graph.value_info {
                if let Some(value) = values.get(name) {
                    bindings
                        .observe(name, &descriptor.shape, value.shape())
                        .map_err(|source| VerifierError::Shape { sample: kind, source })?;
                }
            }

            debug!(sample = %kind, max_abs = report.max_abs, max_rel = report.max_rel, "sample compared");
            summary.samples.push(report);

            if let Some((output, max_abs, max_rel)) = diverged {
                if summary.divergence.is_none() {
                    let suspect = self.localize(graph, &interpreter, &reference.values, &aliases, &feeds);
                    let (suspect_node, suspect_origin) = match suspect {
                        Some((node, origin)) => (Some(node), origin),
                        None => (None, None),
                    };
                    summary.divergence = Some(Divergence {
                        sample: kind,
                        output,
                        max_abs,
                        max_rel,
                        suspect_node,
                        suspect_origin,
                    });
                }
            }
        }
        Ok(summary)
    }

    /// Finds the first node, in topological order, whose output differs from
    /// the traced value when its inputs are the traced values.
    ///
    /// Values without a traced counterpart (intermediates of a lowered op) are
    /// taken from the same reference-fed walk.
    fn localize(
        &self,
        graph: &Graph,
        interpreter: &Interpreter<'_>,
        reference: &Values,
        aliases: &BTreeMap<&str, &str>,
        feeds: &Values,
    ) -> Option<(String, Option<String>)> {
        let traced = |name: &str| -> Option<&TensorData> {
            reference.get(aliases.get(name).copied().unwrap_or(name))
        };
        let mut fed = interpreter.constants();
        fed.extend(feeds.iter().map(|(k, v)| (k.clone(), v.clone())));

        let order = graph.topological_order().ok()?;
        for idx in order {
            let node = &graph.nodes[idx];
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for name in &node.inputs {
                if name.is_empty() {
                    inputs.push(None);
                } else {
                    inputs.push(Some(traced(name).or_else(|| fed.get(name))?));
                }
            }
            let outputs = match interpreter.run_node(node, &inputs) {
                Ok(outputs) => outputs,
                Err(_) => return Some((node.name.clone(), node.origin.clone())),
            };
            for (name, value) in node.outputs.iter().zip(outputs) {
                if let Some(expected) = traced(name) {
                    let same = value.shape() == expected.shape()
                        && value
                            .data()
                            .iter()
                            .zip(expected.data())
                            .all(|(&a, &b)| self.tolerance.close(a, b));
                    if !same {
                        return Some((node.name.clone(), node.origin.clone()));
                    }
                }
                fed.insert(name.clone(), value);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{fixed_shape, DataType, Dim, Node, Op, OpKind, Tensor};
    use crate::tracer::{Layer, Sequential};

    fn relu_sigmoid_graph(slope: f32) -> Graph {
        // Relu scaled by `slope`, then Sigmoid; slope 1 matches the model.
        let mut graph = Graph::new("g");
        graph.inputs.push(Tensor::value("x", vec![Dim::Symbolic("batch".into()), Dim::Fixed(2)], DataType::F32));
        graph.weights.insert("k".into(), Tensor::from_f32("k", &[1], &[slope]));
        graph.nodes.push(
            Node::new("relu_0/Relu_0", Op::Onnx(OpKind::Relu), vec!["x".into()], vec!["relu_0/Relu_0_output_0".into()])
                .with_origin("relu_0"),
        );
        graph.nodes.push(
            Node::new(
                "relu_0/Mul_1",
                Op::Onnx(OpKind::Mul),
                vec!["relu_0/Relu_0_output_0".into(), "k".into()],
                vec!["relu_0_output_0".into()],
            )
            .with_origin("relu_0"),
        );
        graph.nodes.push(
            Node::new(
                "sigmoid_0/Sigmoid_0",
                Op::Onnx(OpKind::Sigmoid),
                vec!["relu_0_output_0".into()],
                vec!["sigmoid_0_output_0".into()],
            )
            .with_origin("sigmoid_0"),
        );
        graph.outputs.push(Tensor::value(
            "sigmoid_0_output_0",
            vec![Dim::Symbolic("batch".into()), Dim::Fixed(2)],
            DataType::F32,
        ));
        graph
    }

    fn model() -> Sequential {
        Sequential::new("m").with(Layer::Relu).with(Layer::Sigmoid)
    }

    #[test]
    fn test_tolerance_close() {
        let tol = Tolerance::default();
        assert!(tol.close(1.0, 1.0 + 1e-5));
        assert!(!tol.close(1.0, 1.01));
        assert!(tol.close(f32::NAN, f32::NAN));
        assert!(!tol.close(f32::NAN, 0.0));
        assert!(tol.close(f32::INFINITY, f32::INFINITY));
    }

    #[test]
    fn test_equivalent_graph_validates_on_all_samples() {
        let graph = relu_sigmoid_graph(1.0);
        let samples = SampleGenerator::new(0, true).generate(&graph.inputs, &[vec![3, 2]]);
        let summary = GraphValidator::new(Tolerance::default())
            .validate(&model(), &WeightStore::default(), &graph, &samples)
            .unwrap();
        assert_eq!(summary.samples.len(), 3);
        assert!(summary.is_within_tolerance());
        assert!(summary.max_abs() < 1e-6);
    }

    #[test]
    fn test_divergence_is_localized_to_origin() {
        let graph = relu_sigmoid_graph(2.0);
        let samples = vec![Sample {
            kind: SampleKind::Primary,
            values: vec![TensorData::new(vec![2, 2], vec![0.5, -0.5, 0.25, 1.0]).unwrap()],
        }];
        let summary = GraphValidator::new(Tolerance::default())
            .validate(&model(), &WeightStore::default(), &graph, &samples)
            .unwrap();
        let divergence = summary.divergence.clone().unwrap();
        assert_eq!(divergence.output, "sigmoid_0_output_0");
        assert_eq!(divergence.suspect_node.as_deref(), Some("relu_0/Mul_1"));
        assert_eq!(divergence.suspect_origin.as_deref(), Some("relu_0"));
        assert!(matches!(
            summary.into_result(),
            Err(VerifierError::NumericalDivergence { sample: SampleKind::Primary, .. })
        ));
    }

    #[test]
    fn test_renamed_outputs_compare_by_position() {
        let mut graph = relu_sigmoid_graph(1.0);
        graph.rename_value("sigmoid_0_output_0", "probabilities");
        let samples = SampleGenerator::new(0, false).generate(&graph.inputs, &[vec![1, 2]]);
        let summary = GraphValidator::new(Tolerance::default())
            .validate(&model(), &WeightStore::default(), &graph, &samples)
            .unwrap();
        assert!(summary.is_within_tolerance());
    }

    #[test]
    fn test_output_shape_contradicting_inference_fails() {
        let mut graph = relu_sigmoid_graph(1.0);
        graph.outputs[0].shape = fixed_shape(&[1, 2]);
        let samples = SampleGenerator::new(0, false).generate(&graph.inputs, &[vec![3, 2]]);
        let err = GraphValidator::new(Tolerance::default())
            .validate(&model(), &WeightStore::default(), &graph, &samples)
            .unwrap_err();
        assert!(matches!(err, VerifierError::OutputShapeMismatch { .. }));
    }
}
