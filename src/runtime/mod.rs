//! Reference interpreter for mapped graphs.
//!
//! Executes ONNX nodes with their target-format semantics so the exported graph
//! can be compared against the eagerly traced model.

use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace;

use crate::ir::{Graph, Node, Op, OpKind};

pub mod kernels;
pub mod tensor;

use kernels::{KernelError, PadMode, PoolKind, Rounding, Window2d};
pub use tensor::TensorData;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("node '{node}' still carries traced op '{kind}'")]
    Unmapped { node: String, kind: String },
    #[error("node '{node}': value '{value}' is not available")]
    MissingValue { node: String, value: String },
    #[error("no feed for graph input '{0}'")]
    MissingFeed(String),
    #[error("node '{node}' ({op}): {source}")]
    Kernel {
        node: String,
        op: OpKind,
        #[source]
        source: KernelError,
    },
}

pub type Values = BTreeMap<String, TensorData>;

pub struct Interpreter<'g> {
    graph: &'g Graph,
}

impl<'g> Interpreter<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self { graph }
    }

    /// Runs the whole graph and returns every computed value, constants included.
    pub fn run(&self, feeds: &Values) -> Result<Values, RuntimeError> {
        let mut values = self.constants();
        for input in &self.graph.inputs {
            let feed = feeds
                .get(&input.name)
                .ok_or_else(|| RuntimeError::MissingFeed(input.name.clone()))?;
            values.insert(input.name.clone(), feed.clone());
        }
        for node in &self.graph.nodes {
            let outputs = {
                let inputs = gather(node, &values)?;
                self.run_node(node, &inputs)?
            };
            for (name, value) in node.outputs.iter().zip(outputs) {
                values.insert(name.clone(), value);
            }
        }
        Ok(values)
    }

    /// Graph outputs only, in declaration order.
    pub fn run_outputs(&self, feeds: &Values) -> Result<Vec<(String, TensorData)>, RuntimeError> {
        let mut values = self.run(feeds)?;
        self.graph
            .outputs
            .iter()
            .map(|o| {
                values
                    .remove(&o.name)
                    .map(|v| (o.name.clone(), v))
                    .ok_or_else(|| RuntimeError::MissingValue {
                        node: "<graph output>".to_string(),
                        value: o.name.clone(),
                    })
            })
            .collect()
    }

    pub fn constants(&self) -> Values {
        self.graph
            .weights
            .iter()
            .filter_map(|(name, t)| TensorData::from_tensor(t).map(|v| (name.clone(), v)))
            .collect()
    }

    /// Evaluates one node in isolation; `inputs` align with `node.inputs`, `None` for omitted ones.
    pub fn run_node(&self, node: &Node, inputs: &[Option<&TensorData>]) -> Result<Vec<TensorData>, RuntimeError> {
        let op = match &node.op {
            Op::Onnx(op) => *op,
            Op::Traced(kind) => {
                return Err(RuntimeError::Unmapped {
                    node: node.name.clone(),
                    kind: kind.clone(),
                })
            }
        };
        trace!(node = %node.name, %op, "evaluating");
        evaluate(op, node, inputs, self.graph.opset_version).map_err(|source| RuntimeError::Kernel {
            node: node.name.clone(),
            op,
            source,
        })
    }
}

fn gather<'v>(node: &Node, values: &'v Values) -> Result<Vec<Option<&'v TensorData>>, RuntimeError> {
    node.inputs
        .iter()
        .map(|name| {
            if name.is_empty() {
                return Ok(None);
            }
            values.get(name).map(Some).ok_or_else(|| RuntimeError::MissingValue {
                node: node.name.clone(),
                value: name.clone(),
            })
        })
        .collect()
}

fn required<'a>(inputs: &[Option<&'a TensorData>], idx: usize, op: &'static str) -> Result<&'a TensorData, KernelError> {
    inputs
        .get(idx)
        .copied()
        .flatten()
        .ok_or_else(|| KernelError::invalid(op, format!("missing input #{idx}")))
}

fn ints_or(node: &Node, name: &str, default: Vec<i64>) -> Vec<i64> {
    node.attr_ints(name).map(<[i64]>::to_vec).unwrap_or(default)
}

fn to_usize(values: &[i64], op: &'static str, what: &str) -> Result<Vec<usize>, KernelError> {
    values
        .iter()
        .map(|&v| usize::try_from(v).map_err(|_| KernelError::invalid(op, format!("negative {what}: {values:?}"))))
        .collect()
}

fn pair(values: &[usize], op: &'static str, what: &str) -> Result<[usize; 2], KernelError> {
    match values {
        [a, b] => Ok([*a, *b]),
        _ => Err(KernelError::invalid(op, format!("expected 2 {what}, got {values:?}"))),
    }
}

/// Reads 2-D window attributes; `kernel` falls back to the weight's spatial dims.
fn window(node: &Node, op: &'static str, kernel: Option<[usize; 2]>, opset: i64) -> Result<Window2d, KernelError> {
    let kernel = match node.attr_ints("kernel_shape") {
        Some(k) => pair(&to_usize(k, op, "kernel_shape")?, op, "kernel dims")?,
        None => kernel.ok_or_else(|| KernelError::invalid(op, "missing kernel_shape"))?,
    };
    let mut w = Window2d::new(kernel);
    w.strides = pair(&to_usize(&ints_or(node, "strides", vec![1, 1]), op, "strides")?, op, "strides")?;
    w.dilations = pair(&to_usize(&ints_or(node, "dilations", vec![1, 1]), op, "dilations")?, op, "dilations")?;
    let pads = to_usize(&ints_or(node, "pads", vec![0; 4]), op, "pads")?;
    w.pads = match pads.as_slice() {
        [a, b, c, d] => [*a, *b, *c, *d],
        _ => return Err(KernelError::invalid(op, format!("expected 4 pads, got {pads:?}"))),
    };
    w.rounding = Rounding::onnx(node.attr_int("ceil_mode", 0) != 0, opset);
    if node.attr_str("auto_pad", "NOTSET") != "NOTSET" {
        return Err(KernelError::invalid(op, "auto_pad is not supported"));
    }
    Ok(w)
}

fn elementwise(op: OpKind, a: &TensorData, b: &TensorData) -> Result<TensorData, KernelError> {
    match op {
        OpKind::Add => kernels::binary("add", a, b, |x, y| x + y),
        OpKind::Sub => kernels::binary("sub", a, b, |x, y| x - y),
        OpKind::Mul => kernels::binary("mul", a, b, |x, y| x * y),
        _ => kernels::binary("div", a, b, |x, y| x / y),
    }
}

fn evaluate(op: OpKind, node: &Node, inputs: &[Option<&TensorData>], opset: i64) -> Result<Vec<TensorData>, KernelError> {
    let name = "onnx";
    let x = || required(inputs, 0, name);
    let out = match op {
        OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => elementwise(op, x()?, required(inputs, 1, name)?)?,
        OpKind::Relu => kernels::unary(x()?, |v| v.max(0.0)),
        OpKind::Sigmoid => kernels::unary(x()?, kernels::sigmoid),
        OpKind::Tanh => kernels::unary(x()?, f32::tanh),
        OpKind::Erf => kernels::unary(x()?, kernels::erf),
        OpKind::Sqrt => kernels::unary(x()?, f32::sqrt),
        OpKind::Identity => x()?.clone(),
        OpKind::Gelu => match node.attr_str("approximate", "none") {
            "none" => kernels::unary(x()?, kernels::gelu_exact),
            "tanh" => kernels::unary(x()?, kernels::gelu_tanh),
            other => return Err(KernelError::invalid("gelu", format!("unknown approximation '{other}'"))),
        },
        OpKind::MatMul => kernels::matmul(x()?, required(inputs, 1, name)?)?,
        OpKind::Gemm => kernels::gemm(
            x()?,
            required(inputs, 1, name)?,
            inputs.get(2).copied().flatten(),
            node.attr_float("alpha", 1.0),
            node.attr_float("beta", 1.0),
            node.attr_int("transA", 0) != 0,
            node.attr_int("transB", 0) != 0,
        )?,
        OpKind::Conv => {
            let w = required(inputs, 1, name)?;
            let spatial = (w.rank() == 4).then(|| [w.shape()[2], w.shape()[3]]);
            let window = window(node, "conv", spatial, opset)?;
            let group = usize::try_from(node.attr_int("group", 1)).map_err(|_| KernelError::invalid("conv", "negative group"))?;
            kernels::conv2d(x()?, w, inputs.get(2).copied().flatten(), &window, group)?
        }
        OpKind::MaxPool => kernels::pool2d(x()?, PoolKind::Max, &window(node, "max_pool", None, opset)?)?,
        OpKind::AveragePool => {
            let window = window(node, "average_pool", None, opset)?;
            if window.dilations != [1, 1] {
                return Err(KernelError::invalid("average_pool", "dilations are not supported"));
            }
            let kind = PoolKind::Average {
                count_include_pad: node.attr_int("count_include_pad", 0) != 0,
            };
            kernels::pool2d(x()?, kind, &window)?
        }
        OpKind::GlobalAveragePool => kernels::global_average_pool(x()?)?,
        OpKind::BatchNormalization => kernels::batch_norm(
            x()?,
            required(inputs, 1, name)?,
            required(inputs, 2, name)?,
            required(inputs, 3, name)?,
            required(inputs, 4, name)?,
            node.attr_float("epsilon", 1e-5),
        )?,
        OpKind::LayerNormalization => {
            let x = x()?;
            let axis = kernels::normalize_axis(node.attr_int("axis", -1), x.rank())?;
            kernels::layer_norm(
                x,
                required(inputs, 1, name)?,
                inputs.get(2).copied().flatten(),
                axis,
                node.attr_float("epsilon", 1e-5),
            )?
        }
        OpKind::Softmax => {
            let x = x()?;
            let default_axis = if opset >= 13 { -1 } else { 1 };
            let axis = kernels::normalize_axis(node.attr_int("axis", default_axis), x.rank())?;
            if opset >= 13 {
                kernels::softmax(x, axis)?
            } else {
                // Older opsets coerce the input to 2-D around `axis`.
                let outer: usize = x.shape()[..axis].iter().product();
                let inner: usize = x.shape()[axis..].iter().product();
                let flat = x.clone().reshape(vec![outer, inner])?;
                kernels::softmax(&flat, 1)?.reshape(x.shape().to_vec())?
            }
        }
        OpKind::Transpose => {
            let x = x()?;
            let perm = match node.attr_ints("perm") {
                Some(p) => to_usize(p, "transpose", "perm")?,
                None => (0..x.rank()).rev().collect(),
            };
            kernels::transpose(x, &perm)?
        }
        OpKind::Reshape => {
            let x = x()?;
            let target = required(inputs, 1, name)?.to_i64();
            let shape = kernels::reshape_target(x.shape(), &target, node.attr_int("allowzero", 0) != 0)?;
            x.clone().reshape(shape)?
        }
        OpKind::Flatten => {
            let x = x()?;
            let axis = node.attr_int("axis", 1);
            let axis = if axis == x.rank() as i64 { x.rank() } else { kernels::normalize_axis(axis, x.rank())? };
            let outer: usize = x.shape()[..axis].iter().product();
            let inner: usize = x.shape()[axis..].iter().product();
            x.clone().reshape(vec![outer, inner])?
        }
        OpKind::Concat => {
            let parts: Vec<&TensorData> = inputs.iter().copied().flatten().collect();
            let rank = parts.first().map(|t| t.rank()).unwrap_or(0);
            let axis = kernels::normalize_axis(node.attr_int("axis", 0), rank)?;
            kernels::concat(&parts, axis)?
        }
        OpKind::Pad => {
            let x = x()?;
            let pads = match inputs.get(1).copied().flatten() {
                Some(p) => p.to_i64(),
                None => ints_or(node, "pads", vec![0; 2 * x.rank()]),
            };
            let pads = to_usize(&pads, "pad", "pads")?;
            let mode = match node.attr_str("mode", "constant") {
                "constant" => {
                    let value = match inputs.get(2).copied().flatten() {
                        Some(v) => v.data().first().copied().unwrap_or(0.0),
                        None => node.attr_float("value", 0.0),
                    };
                    PadMode::Constant(value)
                }
                "reflect" => PadMode::Reflect,
                "edge" => PadMode::Edge,
                "wrap" if opset >= 19 => PadMode::Wrap,
                other => return Err(KernelError::invalid("pad", format!("unsupported mode '{other}'"))),
            };
            kernels::pad(x, &pads, mode)?
        }
        OpKind::Resize => {
            let x = x()?;
            let supported = node.attr_str("mode", "nearest") == "nearest"
                && node.attr_str("coordinate_transformation_mode", "half_pixel") == "asymmetric"
                && node.attr_str("nearest_mode", "round_prefer_floor") == "floor";
            if !supported {
                return Err(KernelError::invalid(
                    "resize",
                    "only nearest/asymmetric/floor resizing is supported",
                ));
            }
            let scales = required(inputs, 2, "resize")?;
            kernels::resize_nearest(x, scales.data())?
        }
        OpKind::ReduceMean => {
            let x = x()?;
            let axes = match inputs.get(1).copied().flatten() {
                Some(a) => a.to_i64(),
                None => ints_or(node, "axes", (0..x.rank() as i64).collect()),
            };
            let axes = axes
                .iter()
                .map(|&a| kernels::normalize_axis(a, x.rank()))
                .collect::<Result<Vec<_>, _>>()?;
            kernels::reduce_mean(x, &axes, node.attr_int("keepdims", 1) != 0)?
        }
    };
    Ok(vec![out])
}
