//! Static shape propagation over a mapped graph.
//!
//! Symbolic dims flow through unchanged where an operator preserves them.
//! When an output size depends on a symbol in a way that cannot be stated
//! exactly (a symbolic spatial axis through a strided window, say), the axis
//! gets a fresh symbol named `{node}_dim_{axis}`, so re-running inference on
//! the same graph always produces the same names.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::ir::{format_shape, DataType, Dim, Graph, Node, Op, OpKind, Tensor};
use crate::runtime::kernels::{window_output_len, Rounding};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("shape conflict at node '{node}' ({op}) with inputs {inputs}: {detail}")]
    Conflict {
        node: String,
        op: OpKind,
        detail: String,
        inputs: String,
    },
    #[error("node '{node}' reads '{value}', which has no known shape")]
    MissingInput { node: String, value: String },
    #[error("node '{node}' needs '{value}' to be a constant")]
    NonConstant { node: String, value: String },
    #[error("node '{node}' still carries traced op '{kind}'")]
    Unmapped { node: String, kind: String },
    #[error("'{value}' has runtime shape {actual:?}, inferred {expected}")]
    Mismatch {
        value: String,
        expected: String,
        actual: Vec<usize>,
    },
    #[error("symbol '{symbol}' is bound to {bound} but '{value}' has {actual}")]
    SymbolConflict {
        symbol: String,
        bound: usize,
        actual: usize,
        value: String,
    },
}

pub struct ShapeInference;

impl ShapeInference {
    /// Recomputes `value_info` and the output descriptors of `graph`.
    pub fn infer(graph: &mut Graph) -> Result<(), ShapeError> {
        let mut shapes: BTreeMap<String, Vec<Dim>> = BTreeMap::new();
        for input in &graph.inputs {
            shapes.insert(input.name.clone(), input.shape.clone());
        }
        for (name, weight) in &graph.weights {
            shapes.insert(name.clone(), weight.shape.clone());
        }

        for node in &graph.nodes {
            let op = match &node.op {
                Op::Onnx(op) => *op,
                Op::Traced(kind) => {
                    return Err(ShapeError::Unmapped {
                        node: node.name.clone(),
                        kind: kind.clone(),
                    })
                }
            };
            let mut inputs = Vec::with_capacity(node.inputs.len());
            for name in &node.inputs {
                if name.is_empty() {
                    inputs.push(None);
                    continue;
                }
                let shape = shapes.get(name).ok_or_else(|| ShapeError::MissingInput {
                    node: node.name.clone(),
                    value: name.clone(),
                })?;
                inputs.push(Some(shape.as_slice()));
            }
            let cx = Rule { graph, node, inputs: &inputs };
            let shape = cx.infer(op)?;
            debug!(node = %node.name, %op, shape = %format_shape(&shape), "inferred");
            for output in &node.outputs {
                shapes.insert(output.clone(), shape.clone());
            }
        }

        let mut value_info = BTreeMap::new();
        for node in &graph.nodes {
            for output in &node.outputs {
                if !graph.is_output(output) {
                    let shape = shapes.get(output).cloned().unwrap_or_default();
                    value_info.insert(output.clone(), Tensor::value(output.clone(), shape, DataType::F32));
                }
            }
        }
        graph.value_info = value_info;
        for output in &mut graph.outputs {
            if let Some(shape) = shapes.get(&output.name) {
                output.shape = shape.clone();
                output.data_type = DataType::F32;
            }
        }
        Ok(())
    }
}

struct Rule<'a> {
    graph: &'a Graph,
    node: &'a Node,
    inputs: &'a [Option<&'a [Dim]>],
}

impl<'a> Rule<'a> {
    fn conflict(&self, op: OpKind, detail: impl Into<String>) -> ShapeError {
        let inputs: Vec<String> = self
            .inputs
            .iter()
            .map(|s| s.map(format_shape).unwrap_or_else(|| "-".to_string()))
            .collect();
        ShapeError::Conflict {
            node: self.node.name.clone(),
            op,
            detail: detail.into(),
            inputs: inputs.join(", "),
        }
    }

    fn fresh(&self, axis: usize) -> Dim {
        Dim::Symbolic(format!("{}_dim_{axis}", self.node.name))
    }

    fn input(&self, idx: usize, op: OpKind) -> Result<&'a [Dim], ShapeError> {
        self.inputs
            .get(idx)
            .copied()
            .flatten()
            .ok_or_else(|| self.conflict(op, format!("missing input #{idx}")))
    }

    fn optional(&self, idx: usize) -> Option<&'a [Dim]> {
        self.inputs.get(idx).copied().flatten()
    }

    /// Integer values of a constant input (shape, pads, axes).
    fn constant_ints(&self, idx: usize) -> Result<Option<Vec<i64>>, ShapeError> {
        let Some(name) = self.node.inputs.get(idx).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let tensor = self.graph.weights.get(name).ok_or_else(|| ShapeError::NonConstant {
            node: self.node.name.clone(),
            value: name.clone(),
        })?;
        Ok(tensor
            .i64_values()
            .or_else(|| tensor.f32_values().map(|v| v.iter().map(|&x| x as i64).collect())))
    }

    fn constant_floats(&self, idx: usize) -> Result<Option<Vec<f32>>, ShapeError> {
        let Some(name) = self.node.inputs.get(idx).filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let tensor = self.graph.weights.get(name).ok_or_else(|| ShapeError::NonConstant {
            node: self.node.name.clone(),
            value: name.clone(),
        })?;
        Ok(tensor.f32_values())
    }

    fn axis(&self, op: OpKind, axis: i64, rank: usize) -> Result<usize, ShapeError> {
        let r = rank as i64;
        let a = if axis < 0 { axis + r } else { axis };
        if a < 0 || a >= r.max(1) {
            return Err(self.conflict(op, format!("axis {axis} out of range for rank {rank}")));
        }
        Ok(a as usize)
    }

    /// Merges two dims that must denote the same size.
    fn unify(&self, op: OpKind, a: &Dim, b: &Dim, what: &str) -> Result<Dim, ShapeError> {
        match (a, b) {
            (Dim::Fixed(x), Dim::Fixed(y)) if x != y => {
                Err(self.conflict(op, format!("{what}: {x} does not match {y}")))
            }
            (Dim::Fixed(_), _) => Ok(a.clone()),
            (_, Dim::Fixed(_)) => Ok(b.clone()),
            _ => Ok(a.clone()),
        }
    }

    fn broadcast(&self, op: OpKind, a: &[Dim], b: &[Dim]) -> Result<Vec<Dim>, ShapeError> {
        let rank = a.len().max(b.len());
        let one = Dim::Fixed(1);
        (0..rank)
            .map(|i| {
                let da = if i + a.len() >= rank { &a[i + a.len() - rank] } else { &one };
                let db = if i + b.len() >= rank { &b[i + b.len() - rank] } else { &one };
                match (da, db) {
                    _ if da == db => Ok(da.clone()),
                    (Dim::Fixed(1), _) => Ok(db.clone()),
                    (_, Dim::Fixed(1)) => Ok(da.clone()),
                    (Dim::Fixed(x), Dim::Fixed(y)) => Err(self.conflict(
                        op,
                        format!("axis {i}: {x} and {y} do not broadcast"),
                    )),
                    (Dim::Fixed(_), Dim::Symbolic(_)) => Ok(da.clone()),
                    (Dim::Symbolic(_), Dim::Fixed(_)) => Ok(db.clone()),
                    (Dim::Symbolic(_), Dim::Symbolic(_)) => Ok(self.fresh(i)),
                }
            })
            .collect()
    }

    /// Product of dims; a lone symbol times ones stays that symbol.
    fn product(&self, dims: &[Dim], axis: usize) -> Dim {
        let fixed: usize = dims.iter().filter_map(Dim::fixed).product();
        let symbols: Vec<&Dim> = dims.iter().filter(|d| d.symbol().is_some()).collect();
        match symbols.as_slice() {
            [] => Dim::Fixed(fixed),
            [only] if fixed == 1 => (*only).clone(),
            _ => self.fresh(axis),
        }
    }

    fn window_dim(&self, op: OpKind, input: &Dim, kernel: usize, stride: usize, pads: (usize, usize), dilation: usize, rounding: Rounding, axis: usize) -> Result<Dim, ShapeError> {
        match input {
            Dim::Fixed(d) => window_output_len(*d, kernel, stride, pads.0, pads.1, dilation, rounding)
                .map(Dim::Fixed)
                .ok_or_else(|| self.conflict(op, format!("window {kernel} (stride {stride}, dilation {dilation}) does not fit axis {axis} of size {d}"))),
            Dim::Symbolic(_) if kernel == 1 && stride == 1 && pads == (0, 0) => Ok(input.clone()),
            Dim::Symbolic(_) => Ok(self.fresh(axis)),
        }
    }

    fn ints_attr(&self, name: &str, default: Vec<i64>) -> Vec<i64> {
        self.node.attr_ints(name).map(<[i64]>::to_vec).unwrap_or(default)
    }

    fn window(&self, op: OpKind, x: &[Dim], kernel: [usize; 2], out_channels: Dim) -> Result<Vec<Dim>, ShapeError> {
        if x.len() != 4 {
            return Err(self.conflict(op, format!("expected a 4-D input, got rank {}", x.len())));
        }
        let to_usize = |v: Vec<i64>| v.into_iter().map(|i| i.max(0) as usize).collect::<Vec<_>>();
        let strides = to_usize(self.ints_attr("strides", vec![1, 1]));
        let dilations = to_usize(self.ints_attr("dilations", vec![1, 1]));
        let pads = to_usize(self.ints_attr("pads", vec![0; 4]));
        if strides.len() != 2 || dilations.len() != 2 || pads.len() != 4 {
            return Err(self.conflict(op, "strides, dilations and pads must cover two spatial axes"));
        }
        let rounding = Rounding::onnx(self.node.attr_int("ceil_mode", 0) != 0, self.graph.opset_version);
        let oh = self.window_dim(op, &x[2], kernel[0], strides[0], (pads[0], pads[2]), dilations[0], rounding, 2)?;
        let ow = self.window_dim(op, &x[3], kernel[1], strides[1], (pads[1], pads[3]), dilations[1], rounding, 3)?;
        Ok(vec![x[0].clone(), out_channels, oh, ow])
    }

    fn kernel_shape(&self, op: OpKind) -> Result<[usize; 2], ShapeError> {
        match self.node.attr_ints("kernel_shape") {
            Some([h, w]) if *h > 0 && *w > 0 => Ok([*h as usize, *w as usize]),
            other => Err(self.conflict(op, format!("invalid kernel_shape {other:?}"))),
        }
    }

    fn infer(&self, op: OpKind) -> Result<Vec<Dim>, ShapeError> {
        let x = || self.input(0, op);
        match op {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div => self.broadcast(op, x()?, self.input(1, op)?),
            OpKind::Relu
            | OpKind::Sigmoid
            | OpKind::Tanh
            | OpKind::Erf
            | OpKind::Sqrt
            | OpKind::Identity
            | OpKind::Gelu => Ok(x()?.to_vec()),
            OpKind::Softmax => {
                let x = x()?;
                self.axis(op, self.node.attr_int("axis", -1), x.len())?;
                Ok(x.to_vec())
            }
            OpKind::LayerNormalization => {
                let x = x()?;
                let axis = self.axis(op, self.node.attr_int("axis", -1), x.len())?;
                let scale = self.input(1, op)?;
                if scale.len() > x.len() - axis {
                    return Err(self.conflict(op, "scale has more axes than the normalized block"));
                }
                Ok(x.to_vec())
            }
            OpKind::BatchNormalization => {
                let x = x()?;
                if x.len() < 2 {
                    return Err(self.conflict(op, "input needs a channel axis"));
                }
                for idx in 1..5 {
                    let param = self.input(idx, op)?;
                    if param.len() != 1 {
                        return Err(self.conflict(op, format!("parameter #{idx} must be 1-D")));
                    }
                    self.unify(op, &x[1], &param[0], "channels")?;
                }
                Ok(x.to_vec())
            }
            OpKind::MatMul => self.matmul(x()?, self.input(1, op)?),
            OpKind::Gemm => {
                let (a, b) = (x()?, self.input(1, op)?);
                if a.len() != 2 || b.len() != 2 {
                    return Err(self.conflict(op, "Gemm operands must be 2-D"));
                }
                let (m, ka) = if self.node.attr_int("transA", 0) != 0 { (&a[1], &a[0]) } else { (&a[0], &a[1]) };
                let (kb, n) = if self.node.attr_int("transB", 0) != 0 { (&b[1], &b[0]) } else { (&b[0], &b[1]) };
                self.unify(op, ka, kb, "inner dimension")?;
                let out = vec![m.clone(), n.clone()];
                if let Some(c) = self.optional(2) {
                    let merged = self.broadcast(op, c, &out)?;
                    if merged.len() != 2 {
                        return Err(self.conflict(op, "bias does not broadcast to [M, N]"));
                    }
                }
                Ok(out)
            }
            OpKind::Conv => {
                let (x, w) = (x()?, self.input(1, op)?);
                if w.len() != 4 {
                    return Err(self.conflict(op, format!("weight must be 4-D, got rank {}", w.len())));
                }
                let group = self.node.attr_int("group", 1).max(1) as usize;
                if let (Some(c), Some(cg)) = (x.get(1).and_then(Dim::fixed), w[1].fixed()) {
                    if c != cg * group {
                        return Err(self.conflict(op, format!("{c} input channels, weight expects {cg} x {group} groups")));
                    }
                }
                let kernel = match self.node.attr_ints("kernel_shape") {
                    Some(_) => self.kernel_shape(op)?,
                    None => match (w[2].fixed(), w[3].fixed()) {
                        (Some(h), Some(k)) => [h, k],
                        _ => return Err(self.conflict(op, "kernel size is dynamic")),
                    },
                };
                self.window(op, x, kernel, w[0].clone())
            }
            OpKind::MaxPool | OpKind::AveragePool => {
                let x = x()?;
                let channels = x.get(1).cloned().unwrap_or(Dim::Fixed(0));
                self.window(op, x, self.kernel_shape(op)?, channels)
            }
            OpKind::GlobalAveragePool => {
                let x = x()?;
                if x.len() < 3 {
                    return Err(self.conflict(op, "input needs spatial axes"));
                }
                let mut out = x[..2].to_vec();
                out.extend(std::iter::repeat(Dim::Fixed(1)).take(x.len() - 2));
                Ok(out)
            }
            OpKind::Concat => {
                let parts: Vec<&[Dim]> = self.inputs.iter().copied().flatten().collect();
                let first = parts.first().ok_or_else(|| self.conflict(op, "no inputs"))?;
                let axis = self.axis(op, self.node.attr_int("axis", 0), first.len())?;
                let mut out = first.to_vec();
                for part in &parts[1..] {
                    if part.len() != first.len() {
                        return Err(self.conflict(op, "inputs differ in rank"));
                    }
                    for (i, d) in part.iter().enumerate() {
                        if i != axis {
                            out[i] = self.unify(op, &out[i], d, &format!("axis {i}"))?;
                        }
                    }
                }
                let along: Vec<Dim> = parts.iter().map(|p| p[axis].clone()).collect();
                out[axis] = match along.iter().map(Dim::fixed).sum::<Option<usize>>() {
                    Some(total) => Dim::Fixed(total),
                    None => self.fresh(axis),
                };
                Ok(out)
            }
            OpKind::Flatten => {
                let x = x()?;
                let axis = self.node.attr_int("axis", 1);
                let axis = if axis == x.len() as i64 { x.len() } else { self.axis(op, axis, x.len())? };
                Ok(vec![self.product(&x[..axis], 0), self.product(&x[axis..], 1)])
            }
            OpKind::Reshape => self.reshape(x()?),
            OpKind::Transpose => {
                let x = x()?;
                let perm: Vec<usize> = match self.node.attr_ints("perm") {
                    Some(p) => p
                        .iter()
                        .map(|&a| self.axis(op, a, x.len()))
                        .collect::<Result<_, _>>()?,
                    None => (0..x.len()).rev().collect(),
                };
                let mut seen = perm.clone();
                seen.sort_unstable();
                if seen != (0..x.len()).collect::<Vec<_>>() {
                    return Err(self.conflict(op, format!("perm {perm:?} is not a permutation")));
                }
                Ok(perm.iter().map(|&p| x[p].clone()).collect())
            }
            OpKind::Pad => {
                let x = x()?;
                let pads = match self.constant_ints(1)? {
                    Some(p) => p,
                    None => self.ints_attr("pads", vec![0; 2 * x.len()]),
                };
                if pads.len() != 2 * x.len() {
                    return Err(self.conflict(op, format!("{} pad values for rank {}", pads.len(), x.len())));
                }
                Ok(x.iter()
                    .enumerate()
                    .map(|(axis, d)| {
                        let extra = pads[axis] + pads[axis + x.len()];
                        match d {
                            Dim::Fixed(v) => Dim::Fixed((*v as i64 + extra).max(0) as usize),
                            Dim::Symbolic(_) if extra == 0 => d.clone(),
                            Dim::Symbolic(_) => self.fresh(axis),
                        }
                    })
                    .collect())
            }
            OpKind::Resize => {
                let x = x()?;
                let scales = self
                    .constant_floats(2)?
                    .ok_or_else(|| self.conflict(op, "Resize needs constant scales"))?;
                if scales.len() != x.len() {
                    return Err(self.conflict(op, format!("{} scales for rank {}", scales.len(), x.len())));
                }
                Ok(x.iter()
                    .zip(&scales)
                    .enumerate()
                    .map(|(axis, (d, &s))| match d {
                        Dim::Fixed(v) => Dim::Fixed((*v as f64 * s as f64).floor() as usize),
                        Dim::Symbolic(_) if s == 1.0 => d.clone(),
                        Dim::Symbolic(_) => self.fresh(axis),
                    })
                    .collect())
            }
            OpKind::ReduceMean => {
                let x = x()?;
                let axes = match self.constant_ints(1)? {
                    Some(a) => a,
                    None => self.ints_attr("axes", (0..x.len() as i64).collect()),
                };
                let axes = axes
                    .iter()
                    .map(|&a| self.axis(op, a, x.len()))
                    .collect::<Result<Vec<_>, _>>()?;
                let keep = self.node.attr_int("keepdims", 1) != 0;
                Ok(x.iter()
                    .enumerate()
                    .filter_map(|(i, d)| match (axes.contains(&i), keep) {
                        (true, true) => Some(Dim::Fixed(1)),
                        (true, false) => None,
                        (false, _) => Some(d.clone()),
                    })
                    .collect())
            }
        }
    }

    fn matmul(&self, a: &[Dim], b: &[Dim]) -> Result<Vec<Dim>, ShapeError> {
        let op = OpKind::MatMul;
        if a.is_empty() || b.is_empty() {
            return Err(self.conflict(op, "scalar operands"));
        }
        let a_full: Vec<Dim> = if a.len() == 1 { vec![Dim::Fixed(1), a[0].clone()] } else { a.to_vec() };
        let b_full: Vec<Dim> = if b.len() == 1 { vec![b[0].clone(), Dim::Fixed(1)] } else { b.to_vec() };
        let (ra, rb) = (a_full.len(), b_full.len());
        self.unify(op, &a_full[ra - 1], &b_full[rb - 2], "inner dimension")?;
        let mut out = self.broadcast(op, &a_full[..ra - 2], &b_full[..rb - 2])?;
        if a.len() > 1 {
            out.push(a_full[ra - 2].clone());
        }
        if b.len() > 1 {
            out.push(b_full[rb - 1].clone());
        }
        Ok(out)
    }

    fn reshape(&self, x: &[Dim]) -> Result<Vec<Dim>, ShapeError> {
        let op = OpKind::Reshape;
        let target = self
            .constant_ints(1)?
            .ok_or_else(|| self.conflict(op, "Reshape needs a constant shape"))?;
        let allowzero = self.node.attr_int("allowzero", 0) != 0;
        let mut out = Vec::with_capacity(target.len());
        let mut infer_at = None;
        // Input dims not accounted for by copied (0) entries.
        let mut remaining: Vec<Dim> = x.to_vec();
        let mut known = 1usize;
        for (i, &t) in target.iter().enumerate() {
            match t {
                -1 if infer_at.is_none() => {
                    infer_at = Some(i);
                    out.push(Dim::Fixed(1));
                }
                0 if !allowzero => {
                    let d = x
                        .get(i)
                        .cloned()
                        .ok_or_else(|| self.conflict(op, format!("0 at position {i} has no input dim")))?;
                    if let Some(pos) = remaining.iter().position(|r| *r == d) {
                        remaining.remove(pos);
                    } else if let Some(v) = d.fixed() {
                        known *= v;
                    }
                    out.push(d);
                }
                t if t >= 0 => {
                    known *= t as usize;
                    out.push(Dim::Fixed(t as usize));
                }
                _ => return Err(self.conflict(op, format!("invalid target {target:?}"))),
            }
        }
        let fixed_remaining: Option<usize> = remaining.iter().map(Dim::fixed).product();
        match (infer_at, fixed_remaining) {
            (Some(i), Some(total)) => {
                if known == 0 || total % known != 0 {
                    return Err(self.conflict(op, format!("cannot infer -1 in {target:?}")));
                }
                out[i] = Dim::Fixed(total / known);
            }
            (Some(i), None) => {
                let symbols: Vec<&Dim> = remaining.iter().filter(|d| d.symbol().is_some()).collect();
                let fixed: usize = remaining.iter().filter_map(Dim::fixed).product();
                out[i] = match symbols.as_slice() {
                    [only] if fixed == known => (*only).clone(),
                    _ => self.fresh(i),
                };
            }
            (None, Some(total)) => {
                if known != total {
                    return Err(self.conflict(op, format!("{} elements cannot be reshaped to {target:?}", total)));
                }
            }
            (None, None) => {}
        }
        Ok(out)
    }
}

/// Concrete sizes observed for symbolic dims during one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolBindings {
    values: BTreeMap<String, usize>,
}

impl SymbolBindings {
    /// Binds every symbol of the graph inputs to the sizes in `shapes`.
    pub fn bind_inputs(inputs: &[Tensor], shapes: &[&[usize]]) -> Result<Self, ShapeError> {
        let mut bindings = Self::default();
        for (input, shape) in inputs.iter().zip(shapes) {
            bindings.observe(&input.name, &input.shape, shape)?;
        }
        Ok(bindings)
    }

    /// Checks a runtime shape against its descriptor, binding new symbols.
    pub fn observe(&mut self, value: &str, expected: &[Dim], actual: &[usize]) -> Result<(), ShapeError> {
        let mismatch = || ShapeError::Mismatch {
            value: value.to_string(),
            expected: format_shape(expected),
            actual: actual.to_vec(),
        };
        if expected.len() != actual.len() {
            return Err(mismatch());
        }
        for (dim, &size) in expected.iter().zip(actual) {
            match dim {
                Dim::Fixed(d) if *d != size => return Err(mismatch()),
                Dim::Fixed(_) => {}
                Dim::Symbolic(symbol) => match self.values.get(symbol) {
                    Some(&bound) if bound != size => {
                        return Err(ShapeError::SymbolConflict {
                            symbol: symbol.clone(),
                            bound,
                            actual: size,
                            value: value.to_string(),
                        })
                    }
                    Some(_) => {}
                    None => {
                        self.values.insert(symbol.clone(), size);
                    }
                },
            }
        }
        Ok(())
    }

    pub fn get(&self, symbol: &str) -> Option<usize> {
        self.values.get(symbol).copied()
    }

    /// Concrete shape when every symbol in `shape` is bound.
    pub fn resolve(&self, shape: &[Dim]) -> Option<Vec<usize>> {
        shape
            .iter()
            .map(|d| match d {
                Dim::Fixed(v) => Some(*v),
                Dim::Symbolic(s) => self.get(s),
            })
            .collect()
    }
}
