//! Records a model's forward computation into a static [`Graph`].
//!
//! Tracing is eager: every operation a model issues through [`TraceContext`]
//! is executed on the sample input with source-framework semantics, and a
//! node carrying [`Op::Traced`] is appended to the graph. The concrete values
//! are kept as the reference the validator compares against.
//!
//! Control flow is resolved while tracing. A branch on a value known before
//! the sample is seen is baked in (with a warning about the branch that was
//! not taken); a branch on a tensor's runtime contents aborts the trace.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ir::{fixed_shape, format_shape, Attributes, DataType, Dim, Graph, Node, Op, Tensor};
use crate::loader::WeightStore;
use crate::runtime::kernels::KernelError;
use crate::runtime::{TensorData, Values};

pub mod ops;
pub mod sequential;

pub use ops::{Conv2dOptions, PaddingMode, Pool2dOptions};
pub use sequential::{Layer, Sequential};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TraceError {
    #[error(
        "branch '{branch}' depends on the runtime value of '{tensor}'{}; static graphs cannot represent it",
        .producer.as_ref().map(|p| format!(" (produced by '{p}')")).unwrap_or_default()
    )]
    DynamicControlFlow {
        branch: String,
        tensor: String,
        producer: Option<String>,
    },
    #[error("weight '{0}' is not in the weight store")]
    MissingWeight(String),
    #[error("value '{0}' was not produced by this trace")]
    UnknownValue(String),
    #[error("sample for input '{input}' does not match its descriptor: {detail}")]
    SampleMismatch { input: String, detail: String },
    #[error("'{kind}' is not a built-in traced operation")]
    UnknownOperator { kind: String },
    #[error("{kind} ('{node}') failed on inputs {shapes}: {detail}")]
    Operation {
        node: String,
        kind: String,
        shapes: String,
        detail: String,
    },
    #[error("'{0}' names both a weight and a traced value")]
    NameCollision(String),
    #[error("model forward returned no outputs")]
    NoOutputs,
}

/// Handle to a traced value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    name: String,
}

impl Value {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What a branch decision depends on.
#[derive(Debug, Clone, PartialEq)]
pub enum BranchCondition {
    /// Known independently of the sample (config flags, layer counts, static shapes).
    Static(bool),
    /// Decided by the contents of a traced tensor at runtime.
    Tensor(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceWarning {
    UnexercisedBranch {
        branch: String,
        taken: bool,
        after: Option<String>,
    },
}

impl fmt::Display for TraceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceWarning::UnexercisedBranch { branch, taken, after } => {
                write!(f, "branch '{branch}' baked in as {taken}")?;
                if let Some(after) = after {
                    write!(f, " after '{after}'")?;
                }
                write!(f, "; the {} path is not represented in the graph", !taken)
            }
        }
    }
}

/// Forward computation of an in-memory model.
pub trait Model {
    fn name(&self) -> &str {
        "model"
    }

    fn forward(&self, cx: &mut TraceContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, TraceError>;
}

/// The outcome of one traced forward evaluation.
#[derive(Debug, Clone)]
pub struct Trace {
    pub graph: Graph,
    /// Concrete value of every traced name for the sample.
    pub values: Values,
    pub warnings: Vec<TraceWarning>,
}

pub struct TraceContext<'w> {
    weights: &'w WeightStore,
    graph: Graph,
    values: Values,
    /// Names in `values` that came from the weight store.
    bound_weights: BTreeSet<String>,
    warnings: Vec<TraceWarning>,
    counters: BTreeMap<String, usize>,
}

impl<'w> TraceContext<'w> {
    fn new(weights: &'w WeightStore, name: &str) -> Self {
        Self {
            weights,
            graph: Graph::new(name),
            values: Values::new(),
            bound_weights: BTreeSet::new(),
            warnings: Vec::new(),
            counters: BTreeMap::new(),
        }
    }

    fn next_name(&mut self, kind: &str) -> String {
        let n = self.counters.entry(kind.to_string()).or_insert(0);
        let name = format!("{kind}_{n}");
        *n += 1;
        name
    }

    /// Generated names skip anything already traced or held by the weight store.
    fn is_taken(&self, name: &str) -> bool {
        self.values.contains_key(name) || self.weights.get(name).is_some()
    }

    fn lookup(&self, value: &Value) -> Result<&TensorData, TraceError> {
        self.values
            .get(&value.name)
            .ok_or_else(|| TraceError::UnknownValue(value.name.clone()))
    }

    /// Static shape of a traced value.
    pub fn shape(&self, value: &Value) -> Result<Vec<usize>, TraceError> {
        Ok(self.lookup(value)?.shape().to_vec())
    }

    /// Binds a parameter from the weight store.
    ///
    /// Binding the same weight twice shares it. A weight named like a graph
    /// input or another traced value is rejected.
    pub fn param(&mut self, name: &str) -> Result<Value, TraceError> {
        if self.bound_weights.contains(name) {
            return Ok(Value { name: name.to_string() });
        }
        if self.values.contains_key(name) {
            return Err(TraceError::NameCollision(name.to_string()));
        }
        let tensor = self
            .weights
            .get(name)
            .ok_or_else(|| TraceError::MissingWeight(name.to_string()))?;
        let data = TensorData::from_tensor(tensor).ok_or_else(|| TraceError::MissingWeight(name.to_string()))?;
        self.graph.weights.insert(name.to_string(), tensor.clone());
        self.values.insert(name.to_string(), data);
        self.bound_weights.insert(name.to_string());
        Ok(Value { name: name.to_string() })
    }

    /// Records a constant tensor created inside the forward computation.
    pub fn constant(&mut self, hint: &str, data: TensorData) -> Value {
        let kind = format!("{hint}_const");
        let mut name = self.next_name(&kind);
        while self.is_taken(&name) {
            name = self.next_name(&kind);
        }
        self.graph.weights.insert(name.clone(), data.to_tensor(name.clone()));
        self.values.insert(name.clone(), data);
        Value { name }
    }

    /// Resolves a control-flow decision.
    pub fn branch(&mut self, label: &str, condition: BranchCondition) -> Result<bool, TraceError> {
        match condition {
            BranchCondition::Static(taken) => {
                let after = self.graph.nodes.last().map(|n| n.name.clone());
                let warning = TraceWarning::UnexercisedBranch {
                    branch: label.to_string(),
                    taken,
                    after,
                };
                warn!(%warning, "static branch baked into graph");
                self.warnings.push(warning);
                Ok(taken)
            }
            BranchCondition::Tensor(value) => {
                let producer = self.graph.producer(&value.name).map(|n| n.name.clone());
                Err(TraceError::DynamicControlFlow {
                    branch: label.to_string(),
                    tensor: value.name,
                    producer,
                })
            }
        }
    }

    /// Records a built-in operation (see [`ops::BUILTIN_KINDS`]).
    pub fn call(&mut self, kind: &str, inputs: &[&Value], attrs: Attributes) -> Result<Value, TraceError> {
        if !ops::BUILTIN_KINDS.contains(&kind) {
            return Err(TraceError::UnknownOperator { kind: kind.to_string() });
        }
        self.record(kind, inputs, attrs, |args, attrs| ops::evaluate(kind, args, attrs))
    }

    /// Records an operation outside the built-in vocabulary. It exports only if a
    /// mapping for `kind` is registered.
    pub fn call_custom<F>(&mut self, kind: &str, inputs: &[&Value], attrs: Attributes, eval: F) -> Result<Value, TraceError>
    where
        F: FnOnce(&[&TensorData], &Attributes) -> Result<TensorData, KernelError>,
    {
        self.record(kind, inputs, attrs, eval)
    }

    fn record<F>(&mut self, kind: &str, inputs: &[&Value], attrs: Attributes, eval: F) -> Result<Value, TraceError>
    where
        F: FnOnce(&[&TensorData], &Attributes) -> Result<TensorData, KernelError>,
    {
        let mut node_name = self.next_name(kind);
        while self.is_taken(&format!("{node_name}_output_0")) {
            node_name = self.next_name(kind);
        }
        let args = inputs
            .iter()
            .map(|v| self.lookup(v))
            .collect::<Result<Vec<_>, _>>()?;
        let result = eval(&args, &attrs).map_err(|e| TraceError::Operation {
            node: node_name.clone(),
            kind: kind.to_string(),
            shapes: args
                .iter()
                .map(|a| format!("{:?}", a.shape()))
                .collect::<Vec<_>>()
                .join(", "),
            detail: e.to_string(),
        })?;

        let output = format!("{node_name}_output_0");
        debug!(node = %node_name, shape = ?result.shape(), "traced");
        self.graph.value_info.insert(
            output.clone(),
            Tensor::value(output.clone(), fixed_shape(result.shape()), DataType::F32),
        );
        let mut node = Node::new(
            node_name,
            Op::Traced(kind.to_string()),
            inputs.iter().map(|v| v.name.clone()).collect(),
            vec![output.clone()],
        );
        node.attributes = attrs;
        self.graph.nodes.push(node);
        self.values.insert(output.clone(), result);
        Ok(Value { name: output })
    }
}

/// Drives a [`Model`] through a [`TraceContext`].
pub struct GraphTracer;

impl GraphTracer {
    /// Traces `model` on `samples`, one per input descriptor.
    ///
    /// Descriptors may carry symbolic dims; each sample must agree with every
    /// fixed dim.
    pub fn trace<M: Model + ?Sized>(
        model: &M,
        weights: &WeightStore,
        inputs: &[Tensor],
        samples: &[TensorData],
    ) -> Result<Trace, TraceError> {
        if inputs.len() != samples.len() {
            return Err(TraceError::SampleMismatch {
                input: inputs.first().map(|t| t.name.clone()).unwrap_or_default(),
                detail: format!("{} descriptors but {} samples", inputs.len(), samples.len()),
            });
        }

        let mut cx = TraceContext::new(weights, model.name());
        let mut handles = Vec::with_capacity(inputs.len());
        for (desc, sample) in inputs.iter().zip(samples) {
            check_sample(desc, sample)?;
            cx.graph.inputs.push(desc.clone());
            cx.values.insert(desc.name.clone(), sample.clone());
            handles.push(Value { name: desc.name.clone() });
        }

        let outputs = model.forward(&mut cx, &handles)?;
        if outputs.is_empty() {
            return Err(TraceError::NoOutputs);
        }

        let mut declared: Vec<String> = Vec::with_capacity(outputs.len());
        for out in outputs {
            // Outputs must be produced by a node and be distinct.
            let needs_identity = cx.graph.producer(&out.name).is_none() || declared.contains(&out.name);
            let out = if needs_identity {
                cx.call("identity", &[&out], Attributes::new())?
            } else {
                out
            };
            let data = cx.lookup(&out)?;
            cx.graph
                .outputs
                .push(Tensor::value(out.name.clone(), fixed_shape(data.shape()), DataType::F32));
            cx.graph.value_info.remove(&out.name);
            declared.push(out.name);
        }

        info!(
            model = model.name(),
            nodes = cx.graph.nodes.len(),
            weights = cx.graph.weights.len(),
            warnings = cx.warnings.len(),
            "traced forward computation"
        );
        Ok(Trace {
            graph: cx.graph,
            values: cx.values,
            warnings: cx.warnings,
        })
    }
}

fn check_sample(desc: &Tensor, sample: &TensorData) -> Result<(), TraceError> {
    let mismatch = |detail: String| TraceError::SampleMismatch {
        input: desc.name.clone(),
        detail,
    };
    if desc.data_type != DataType::F32 {
        return Err(mismatch(format!("{:?} inputs cannot be executed", desc.data_type)));
    }
    if desc.shape.len() != sample.rank() {
        return Err(mismatch(format!(
            "descriptor {} has rank {}, sample {:?} has rank {}",
            format_shape(&desc.shape),
            desc.shape.len(),
            sample.shape(),
            sample.rank()
        )));
    }
    for (axis, (dim, &actual)) in desc.shape.iter().zip(sample.shape()).enumerate() {
        if let Dim::Fixed(expected) = dim {
            if *expected != actual {
                return Err(mismatch(format!("axis {axis} is fixed at {expected}, sample has {actual}")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Gate {
        use_tensor: bool,
    }

    impl Model for Gate {
        fn forward(&self, cx: &mut TraceContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, TraceError> {
            let y = cx.relu(&inputs[0])?;
            let condition = if self.use_tensor {
                BranchCondition::Tensor(y.clone())
            } else {
                BranchCondition::Static(true)
            };
            if cx.branch("gate", condition)? {
                Ok(vec![cx.sigmoid(&y)?])
            } else {
                Ok(vec![y])
            }
        }
    }

    fn input() -> (Vec<Tensor>, Vec<TensorData>) {
        (
            vec![Tensor::value("x", vec![Dim::Symbolic("batch".into()), Dim::Fixed(2)], DataType::F32)],
            vec![TensorData::new(vec![1, 2], vec![-1.0, 1.0]).unwrap()],
        )
    }

    #[test]
    fn test_static_branch_is_baked_with_warning() {
        let (inputs, samples) = input();
        let trace = GraphTracer::trace(&Gate { use_tensor: false }, &WeightStore::default(), &inputs, &samples).unwrap();
        assert_eq!(trace.graph.nodes.len(), 2);
        assert_eq!(trace.graph.nodes[1].op, Op::Traced("sigmoid".into()));
        assert_eq!(
            trace.warnings,
            vec![TraceWarning::UnexercisedBranch {
                branch: "gate".into(),
                taken: true,
                after: Some("relu_0".into()),
            }]
        );
    }

    #[test]
    fn test_tensor_branch_fails() {
        let (inputs, samples) = input();
        let err = GraphTracer::trace(&Gate { use_tensor: true }, &WeightStore::default(), &inputs, &samples).unwrap_err();
        assert_eq!(
            err,
            TraceError::DynamicControlFlow {
                branch: "gate".into(),
                tensor: "relu_0_output_0".into(),
                producer: Some("relu_0".into()),
            }
        );
    }

    #[test]
    fn test_sample_must_match_fixed_dims() {
        let (inputs, _) = input();
        let samples = vec![TensorData::zeros(vec![1, 3])];
        let err = GraphTracer::trace(&Gate { use_tensor: false }, &WeightStore::default(), &inputs, &samples).unwrap_err();
        assert!(matches!(err, TraceError::SampleMismatch { .. }));
    }

    #[test]
    fn test_missing_weight_is_reported() {
        struct NeedsWeight;
        impl Model for NeedsWeight {
            fn forward(&self, cx: &mut TraceContext<'_>, _inputs: &[Value]) -> Result<Vec<Value>, TraceError> {
                Ok(vec![cx.param("fc.weight")?])
            }
        }
        let (inputs, samples) = input();
        let err = GraphTracer::trace(&NeedsWeight, &WeightStore::default(), &inputs, &samples).unwrap_err();
        assert_eq!(err, TraceError::MissingWeight("fc.weight".into()));
    }

    struct AddWeight(&'static str);

    impl Model for AddWeight {
        fn forward(&self, cx: &mut TraceContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, TraceError> {
            let w = cx.param(self.0)?;
            Ok(vec![cx.add(&inputs[0], &w)?])
        }
    }

    #[test]
    fn test_weight_named_like_input_is_rejected() {
        let (inputs, samples) = input();
        let weights = WeightStore::builder().insert_f32("x", &[1, 2], vec![10.0, 10.0]).unwrap().build();
        let err = GraphTracer::trace(&AddWeight("x"), &weights, &inputs, &samples).unwrap_err();
        assert_eq!(err, TraceError::NameCollision("x".into()));
    }

    #[test]
    fn test_generated_names_skip_weight_store_entries() {
        struct ReluThenWeight;
        impl Model for ReluThenWeight {
            fn forward(&self, cx: &mut TraceContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, TraceError> {
                let y = cx.relu(&inputs[0])?;
                let scale = cx.constant("scale", TensorData::scalar(2.0));
                let y = cx.mul(&y, &scale)?;
                let w = cx.param("relu_0_output_0")?;
                let again = cx.param("relu_0_output_0")?;
                let y = cx.add(&y, &w)?;
                Ok(vec![cx.add(&y, &again)?])
            }
        }
        let (inputs, samples) = input();
        let weights = WeightStore::builder()
            .insert_f32("relu_0_output_0", &[1, 2], vec![10.0, 10.0])
            .unwrap()
            .insert_f32("scale_const_0", &[1], vec![100.0])
            .unwrap()
            .build();
        let trace = GraphTracer::trace(&ReluThenWeight, &weights, &inputs, &samples).unwrap();
        assert_eq!(trace.graph.nodes[0].outputs[0], "relu_1_output_0");
        assert!(trace.graph.weights.contains_key("scale_const_1"));
        assert_eq!(trace.graph.weights.len(), 2);
        // relu([-1, 1]) * 2 + 10 + 10
        let out = &trace.values[&trace.graph.outputs[0].name];
        assert_eq!(out.data(), &[20.0, 22.0]);
    }

    #[test]
    fn test_passthrough_output_gets_identity() {
        struct Echo;
        impl Model for Echo {
            fn forward(&self, _cx: &mut TraceContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, TraceError> {
                Ok(vec![inputs[0].clone()])
            }
        }
        let (inputs, samples) = input();
        let trace = GraphTracer::trace(&Echo, &WeightStore::default(), &inputs, &samples).unwrap();
        assert_eq!(trace.graph.nodes[0].op, Op::Traced("identity".into()));
        assert_eq!(trace.graph.outputs[0].name, "identity_0_output_0");
    }

    #[test]
    fn test_names_are_deterministic() {
        let (inputs, samples) = input();
        let model = Gate { use_tensor: false };
        let a = GraphTracer::trace(&model, &WeightStore::default(), &inputs, &samples).unwrap();
        let b = GraphTracer::trace(&model, &WeightStore::default(), &inputs, &samples).unwrap();
        let names = |t: &Trace| t.graph.nodes.iter().map(|n| n.name.clone()).collect::<Vec<_>>();
        assert_eq!(names(&a), names(&b));
        assert_eq!(a.values.keys().collect::<Vec<_>>(), b.values.keys().collect::<Vec<_>>());
    }
}
