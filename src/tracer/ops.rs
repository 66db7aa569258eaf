//! Built-in source operations: attribute conventions, eager semantics, and
//! the typed helpers models call on [`TraceContext`].
//!
//! Attributes are recorded in source-framework form (`stride`, `padding`,
//! `dim`, torch pad layout). Translating them into ONNX form is the mapper's
//! job.

use crate::ir::{Attribute, Attributes};
use crate::runtime::kernels::{self, KernelError, KernelResult, PadMode, PoolKind, Rounding, Window2d};
use crate::runtime::TensorData;

use super::{TraceContext, TraceError, Value};

/// Source kinds [`TraceContext::call`] knows how to evaluate.
pub const BUILTIN_KINDS: &[&str] = &[
    "adaptive_avg_pool2d",
    "add",
    "avg_pool2d",
    "batch_norm2d",
    "cat",
    "conv2d",
    "div",
    "dropout",
    "flatten",
    "gelu",
    "identity",
    "layer_norm",
    "linear",
    "matmul",
    "max_pool2d",
    "mul",
    "pad",
    "permute",
    "relu",
    "reshape",
    "sigmoid",
    "silu",
    "softmax",
    "sub",
    "tanh",
    "upsample_nearest2d",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingMode {
    Zeros,
    Reflect,
    Replicate,
    Circular,
}

impl PaddingMode {
    /// Name used by `conv2d`'s `padding_mode` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaddingMode::Zeros => "zeros",
            PaddingMode::Reflect => "reflect",
            PaddingMode::Replicate => "replicate",
            PaddingMode::Circular => "circular",
        }
    }

    /// Name used by `pad`'s `mode` attribute.
    pub fn pad_mode(&self) -> &'static str {
        match self {
            PaddingMode::Zeros => "constant",
            other => other.as_str(),
        }
    }
}

fn kernel_pad_mode(mode: &str, value: f32) -> Result<PadMode, KernelError> {
    match mode {
        "zeros" | "constant" => Ok(PadMode::Constant(value)),
        "reflect" => Ok(PadMode::Reflect),
        "replicate" => Ok(PadMode::Edge),
        "circular" => Ok(PadMode::Wrap),
        other => Err(KernelError::invalid("pad", format!("unknown padding mode '{other}'"))),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dOptions {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
    pub padding_mode: PaddingMode,
}

impl Default for Conv2dOptions {
    fn default() -> Self {
        Self {
            stride: [1, 1],
            padding: [0, 0],
            dilation: [1, 1],
            groups: 1,
            padding_mode: PaddingMode::Zeros,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pool2dOptions {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub ceil_mode: bool,
    /// Average pooling only.
    pub count_include_pad: bool,
}

impl Pool2dOptions {
    /// Stride defaults to the kernel size.
    pub fn new(kernel: [usize; 2]) -> Self {
        Self {
            kernel,
            stride: kernel,
            padding: [0, 0],
            dilation: [1, 1],
            ceil_mode: false,
            count_include_pad: true,
        }
    }
}

fn ints(values: &[usize]) -> Attribute {
    Attribute::Ints(values.iter().map(|&v| v as i64).collect())
}

/// Converts torch pad layout (last axis first, begin/end pairs) into ONNX
/// layout (all begins, then all ends) for a tensor of `rank`.
pub fn torch_pads_to_onnx(pad: &[i64], rank: usize) -> Result<Vec<i64>, String> {
    if pad.len() % 2 != 0 || pad.len() / 2 > rank {
        return Err(format!("pad {pad:?} is invalid for rank {rank}"));
    }
    let mut onnx = vec![0; 2 * rank];
    for (i, pair) in pad.chunks(2).enumerate() {
        let axis = rank - 1 - i;
        onnx[axis] = pair[0];
        onnx[axis + rank] = pair[1];
    }
    Ok(onnx)
}

fn int(attrs: &Attributes, name: &str, default: i64) -> i64 {
    attrs.get(name).and_then(Attribute::as_int).unwrap_or(default)
}

fn float(attrs: &Attributes, name: &str, default: f32) -> f32 {
    attrs.get(name).and_then(Attribute::as_float).unwrap_or(default)
}

fn string<'a>(attrs: &'a Attributes, name: &str, default: &'a str) -> &'a str {
    attrs.get(name).and_then(Attribute::as_str).unwrap_or(default)
}

fn usize_pair(attrs: &Attributes, name: &str, default: [usize; 2], op: &'static str) -> Result<[usize; 2], KernelError> {
    match attrs.get(name) {
        None => Ok(default),
        Some(Attribute::Ints(v)) => match v.as_slice() {
            [a, b] if *a >= 0 && *b >= 0 => Ok([*a as usize, *b as usize]),
            _ => Err(KernelError::invalid(op, format!("{name} must be two non-negative ints, got {v:?}"))),
        },
        Some(other) => Err(KernelError::invalid(op, format!("{name} has unexpected value {other}"))),
    }
}

fn arg<'a>(args: &[&'a TensorData], idx: usize, op: &'static str) -> Result<&'a TensorData, KernelError> {
    args.get(idx)
        .copied()
        .ok_or_else(|| KernelError::invalid(op, format!("missing operand #{idx}")))
}

fn pool_window(attrs: &Attributes, op: &'static str) -> Result<Window2d, KernelError> {
    let kernel = usize_pair(attrs, "kernel_size", [0, 0], op)?;
    let mut window = Window2d::new(kernel);
    window.strides = usize_pair(attrs, "stride", kernel, op)?;
    let [ph, pw] = usize_pair(attrs, "padding", [0, 0], op)?;
    window.pads = [ph, pw, ph, pw];
    window.dilations = usize_pair(attrs, "dilation", [1, 1], op)?;
    window.rounding = Rounding::torch(int(attrs, "ceil_mode", 0) != 0);
    Ok(window)
}

fn adaptive_avg_pool2d(x: &TensorData, out: [usize; 2]) -> KernelResult {
    if x.rank() != 4 || out.contains(&0) {
        return Err(KernelError::invalid(
            "adaptive_avg_pool2d",
            format!("cannot pool {:?} to {out:?}", x.shape()),
        ));
    }
    let [n, c, h, w] = [x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]];
    let [oh, ow] = out;
    let mut data = Vec::with_capacity(n * c * oh * ow);
    for plane in 0..n * c {
        let base = plane * h * w;
        for oy in 0..oh {
            let (h0, h1) = (oy * h / oh, ((oy + 1) * h).div_ceil(oh));
            for ox in 0..ow {
                let (w0, w1) = (ox * w / ow, ((ox + 1) * w).div_ceil(ow));
                let mut sum = 0.0f32;
                for iy in h0..h1 {
                    for ix in w0..w1 {
                        sum += x.data()[base + iy * w + ix];
                    }
                }
                let count = (h1 - h0) * (w1 - w0);
                data.push(if count == 0 { 0.0 } else { sum / count as f32 });
            }
        }
    }
    TensorData::new(vec![n, c, oh, ow], data)
}

/// Evaluates a built-in source operation.
pub(crate) fn evaluate(kind: &str, args: &[&TensorData], attrs: &Attributes) -> KernelResult {
    let x = || arg(args, 0, "source");
    match kind {
        "linear" => {
            let (x, w) = (x()?, arg(args, 1, "linear")?);
            let bias = args.get(2).copied();
            if w.rank() != 2 {
                return Err(KernelError::invalid("linear", format!("weight must be 2-D, got {:?}", w.shape())));
            }
            if x.rank() == 2 {
                kernels::gemm(x, w, bias, 1.0, 1.0, false, true)
            } else {
                let y = kernels::matmul(x, &kernels::transpose(w, &[1, 0])?)?;
                match bias {
                    Some(b) => kernels::binary("linear", &y, b, |p, q| p + q),
                    None => Ok(y),
                }
            }
        }
        "conv2d" => {
            let (x, w) = (x()?, arg(args, 1, "conv2d")?);
            if w.rank() != 4 {
                return Err(KernelError::invalid("conv2d", format!("weight must be 4-D, got {:?}", w.shape())));
            }
            let mut window = Window2d::new([w.shape()[2], w.shape()[3]]);
            window.strides = usize_pair(attrs, "stride", [1, 1], "conv2d")?;
            window.dilations = usize_pair(attrs, "dilation", [1, 1], "conv2d")?;
            let [ph, pw] = usize_pair(attrs, "padding", [0, 0], "conv2d")?;
            let groups = int(attrs, "groups", 1).max(0) as usize;
            match string(attrs, "padding_mode", "zeros") {
                "zeros" => {
                    window.pads = [ph, pw, ph, pw];
                    kernels::conv2d(x, w, args.get(2).copied(), &window, groups)
                }
                mode => {
                    let padded = kernels::pad(x, &[0, 0, ph, pw, 0, 0, ph, pw], kernel_pad_mode(mode, 0.0)?)?;
                    kernels::conv2d(&padded, w, args.get(2).copied(), &window, groups)
                }
            }
        }
        "batch_norm2d" => kernels::batch_norm(
            x()?,
            arg(args, 1, "batch_norm2d")?,
            arg(args, 2, "batch_norm2d")?,
            arg(args, 3, "batch_norm2d")?,
            arg(args, 4, "batch_norm2d")?,
            float(attrs, "eps", 1e-5),
        ),
        "relu" => Ok(kernels::unary(x()?, |v| v.max(0.0))),
        "sigmoid" => Ok(kernels::unary(x()?, kernels::sigmoid)),
        "tanh" => Ok(kernels::unary(x()?, f32::tanh)),
        "silu" => Ok(kernels::unary(x()?, |v| v * kernels::sigmoid(v))),
        "gelu" => match string(attrs, "approximate", "none") {
            "none" => Ok(kernels::unary(x()?, kernels::gelu_exact)),
            "tanh" => Ok(kernels::unary(x()?, kernels::gelu_tanh)),
            other => Err(KernelError::invalid("gelu", format!("unknown approximation '{other}'"))),
        },
        "add" => kernels::binary("add", x()?, arg(args, 1, "add")?, |a, b| a + b),
        "sub" => kernels::binary("sub", x()?, arg(args, 1, "sub")?, |a, b| a - b),
        "mul" => kernels::binary("mul", x()?, arg(args, 1, "mul")?, |a, b| a * b),
        "div" => kernels::binary("div", x()?, arg(args, 1, "div")?, |a, b| a / b),
        "matmul" => kernels::matmul(x()?, arg(args, 1, "matmul")?),
        "max_pool2d" => kernels::pool2d(x()?, PoolKind::Max, &pool_window(attrs, "max_pool2d")?),
        "avg_pool2d" => {
            let kind = PoolKind::Average {
                count_include_pad: int(attrs, "count_include_pad", 1) != 0,
            };
            kernels::pool2d(x()?, kind, &pool_window(attrs, "avg_pool2d")?)
        }
        "adaptive_avg_pool2d" => {
            adaptive_avg_pool2d(x()?, usize_pair(attrs, "output_size", [1, 1], "adaptive_avg_pool2d")?)
        }
        "upsample_nearest2d" => {
            let scales = match attrs.get("scale_factor") {
                Some(Attribute::Floats(s)) if s.len() == 2 => [1.0, 1.0, s[0], s[1]],
                _ => return Err(KernelError::invalid("upsample_nearest2d", "scale_factor must be two floats")),
            };
            kernels::resize_nearest(x()?, &scales)
        }
        "cat" => {
            let rank = x()?.rank();
            kernels::concat(args, kernels::normalize_axis(int(attrs, "dim", 0), rank)?)
        }
        "flatten" => {
            let x = x()?;
            if x.rank() == 0 {
                return x.clone().reshape(vec![1]);
            }
            let start = kernels::normalize_axis(int(attrs, "start_dim", 1), x.rank())?;
            let end = kernels::normalize_axis(int(attrs, "end_dim", -1), x.rank())?;
            if start > end {
                return Err(KernelError::invalid("flatten", format!("start_dim {start} is after end_dim {end}")));
            }
            let mut shape = x.shape()[..start].to_vec();
            shape.push(x.shape()[start..=end].iter().product());
            shape.extend_from_slice(&x.shape()[end + 1..]);
            x.clone().reshape(shape)
        }
        "reshape" => {
            let x = x()?;
            let target = attrs.get("shape").and_then(Attribute::as_ints).unwrap_or(&[]);
            let shape = kernels::reshape_target(x.shape(), target, true)?;
            x.clone().reshape(shape)
        }
        "permute" => {
            let x = x()?;
            let dims = attrs.get("dims").and_then(Attribute::as_ints).unwrap_or(&[]);
            let perm = dims
                .iter()
                .map(|&d| kernels::normalize_axis(d, x.rank()))
                .collect::<Result<Vec<_>, _>>()?;
            kernels::transpose(x, &perm)
        }
        "softmax" => {
            let x = x()?;
            kernels::softmax(x, kernels::normalize_axis(int(attrs, "dim", -1), x.rank())?)
        }
        "layer_norm" => {
            let x = x()?;
            let normalized = attrs.get("normalized_shape").and_then(Attribute::as_ints).unwrap_or(&[]);
            if normalized.is_empty() || normalized.len() > x.rank() {
                return Err(KernelError::invalid("layer_norm", format!("normalized_shape {normalized:?} invalid for {:?}", x.shape())));
            }
            let axis = x.rank() - normalized.len();
            if x.shape()[axis..].iter().zip(normalized).any(|(&d, &n)| d as i64 != n) {
                return Err(KernelError::invalid(
                    "layer_norm",
                    format!("trailing dims of {:?} do not match {normalized:?}", x.shape()),
                ));
            }
            kernels::layer_norm(x, arg(args, 1, "layer_norm")?, args.get(2).copied(), axis, float(attrs, "eps", 1e-5))
        }
        "pad" => {
            let x = x()?;
            let pad = attrs.get("pad").and_then(Attribute::as_ints).unwrap_or(&[]);
            let onnx = torch_pads_to_onnx(pad, x.rank()).map_err(|e| KernelError::invalid("pad", e))?;
            let onnx: Vec<usize> = onnx
                .iter()
                .map(|&p| usize::try_from(p).map_err(|_| KernelError::invalid("pad", "negative padding (cropping) is not supported")))
                .collect::<Result<_, _>>()?;
            let mode = kernel_pad_mode(string(attrs, "mode", "constant"), float(attrs, "value", 0.0))?;
            kernels::pad(x, &onnx, mode)
        }
        "dropout" | "identity" => Ok(x()?.clone()),
        other => Err(KernelError::invalid("source", format!("no evaluator for '{other}'"))),
    }
}

fn attrs<const N: usize>(entries: [(&str, Attribute); N]) -> Attributes {
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Typed wrappers around [`TraceContext::call`], one per built-in source kind.
impl TraceContext<'_> {
    pub fn linear(&mut self, x: &Value, weight: &str, bias: Option<&str>) -> Result<Value, TraceError> {
        let w = self.param(weight)?;
        match bias {
            Some(bias) => {
                let b = self.param(bias)?;
                self.call("linear", &[x, &w, &b], Attributes::new())
            }
            None => self.call("linear", &[x, &w], Attributes::new()),
        }
    }

    pub fn conv2d(&mut self, x: &Value, weight: &str, bias: Option<&str>, options: &Conv2dOptions) -> Result<Value, TraceError> {
        let w = self.param(weight)?;
        let b = bias.map(|b| self.param(b)).transpose()?;
        let a = attrs([
            ("stride", ints(&options.stride)),
            ("padding", ints(&options.padding)),
            ("dilation", ints(&options.dilation)),
            ("groups", Attribute::Int(options.groups as i64)),
            ("padding_mode", Attribute::String(options.padding_mode.as_str().to_string())),
        ]);
        match &b {
            Some(b) => self.call("conv2d", &[x, &w, b], a),
            None => self.call("conv2d", &[x, &w], a),
        }
    }

    /// Inference-mode batch norm reading `{prefix}.weight`, `.bias`, `.running_mean`, `.running_var`.
    pub fn batch_norm2d(&mut self, x: &Value, prefix: &str, eps: f32) -> Result<Value, TraceError> {
        let w = self.param(&format!("{prefix}.weight"))?;
        let b = self.param(&format!("{prefix}.bias"))?;
        let mean = self.param(&format!("{prefix}.running_mean"))?;
        let var = self.param(&format!("{prefix}.running_var"))?;
        self.call("batch_norm2d", &[x, &w, &b, &mean, &var], attrs([("eps", Attribute::Float(eps))]))
    }

    pub fn relu(&mut self, x: &Value) -> Result<Value, TraceError> {
        self.call("relu", &[x], Attributes::new())
    }

    pub fn sigmoid(&mut self, x: &Value) -> Result<Value, TraceError> {
        self.call("sigmoid", &[x], Attributes::new())
    }

    pub fn tanh(&mut self, x: &Value) -> Result<Value, TraceError> {
        self.call("tanh", &[x], Attributes::new())
    }

    pub fn silu(&mut self, x: &Value) -> Result<Value, TraceError> {
        self.call("silu", &[x], Attributes::new())
    }

    /// `approximate` is `"none"` or `"tanh"`.
    pub fn gelu(&mut self, x: &Value, approximate: &str) -> Result<Value, TraceError> {
        self.call("gelu", &[x], attrs([("approximate", Attribute::String(approximate.to_string()))]))
    }

    pub fn add(&mut self, a: &Value, b: &Value) -> Result<Value, TraceError> {
        self.call("add", &[a, b], Attributes::new())
    }

    pub fn sub(&mut self, a: &Value, b: &Value) -> Result<Value, TraceError> {
        self.call("sub", &[a, b], Attributes::new())
    }

    pub fn mul(&mut self, a: &Value, b: &Value) -> Result<Value, TraceError> {
        self.call("mul", &[a, b], Attributes::new())
    }

    pub fn div(&mut self, a: &Value, b: &Value) -> Result<Value, TraceError> {
        self.call("div", &[a, b], Attributes::new())
    }

    pub fn matmul(&mut self, a: &Value, b: &Value) -> Result<Value, TraceError> {
        self.call("matmul", &[a, b], Attributes::new())
    }

    pub fn max_pool2d(&mut self, x: &Value, options: &Pool2dOptions) -> Result<Value, TraceError> {
        let a = attrs([
            ("kernel_size", ints(&options.kernel)),
            ("stride", ints(&options.stride)),
            ("padding", ints(&options.padding)),
            ("dilation", ints(&options.dilation)),
            ("ceil_mode", Attribute::Int(options.ceil_mode as i64)),
        ]);
        self.call("max_pool2d", &[x], a)
    }

    pub fn avg_pool2d(&mut self, x: &Value, options: &Pool2dOptions) -> Result<Value, TraceError> {
        let a = attrs([
            ("kernel_size", ints(&options.kernel)),
            ("stride", ints(&options.stride)),
            ("padding", ints(&options.padding)),
            ("ceil_mode", Attribute::Int(options.ceil_mode as i64)),
            ("count_include_pad", Attribute::Int(options.count_include_pad as i64)),
        ]);
        self.call("avg_pool2d", &[x], a)
    }

    pub fn adaptive_avg_pool2d(&mut self, x: &Value, output_size: [usize; 2]) -> Result<Value, TraceError> {
        self.call("adaptive_avg_pool2d", &[x], attrs([("output_size", ints(&output_size))]))
    }

    pub fn upsample_nearest2d(&mut self, x: &Value, scale: [f32; 2]) -> Result<Value, TraceError> {
        self.call("upsample_nearest2d", &[x], attrs([("scale_factor", Attribute::Floats(scale.to_vec()))]))
    }

    pub fn cat(&mut self, values: &[&Value], dim: i64) -> Result<Value, TraceError> {
        self.call("cat", values, attrs([("dim", Attribute::Int(dim))]))
    }

    pub fn flatten(&mut self, x: &Value, start_dim: i64, end_dim: i64) -> Result<Value, TraceError> {
        let a = attrs([("start_dim", Attribute::Int(start_dim)), ("end_dim", Attribute::Int(end_dim))]);
        self.call("flatten", &[x], a)
    }

    /// Torch `reshape`: `-1` is inferred, `0` is a literal zero-sized axis.
    pub fn reshape(&mut self, x: &Value, shape: &[i64]) -> Result<Value, TraceError> {
        self.call("reshape", &[x], attrs([("shape", Attribute::Ints(shape.to_vec()))]))
    }

    pub fn permute(&mut self, x: &Value, dims: &[i64]) -> Result<Value, TraceError> {
        self.call("permute", &[x], attrs([("dims", Attribute::Ints(dims.to_vec()))]))
    }

    pub fn softmax(&mut self, x: &Value, dim: i64) -> Result<Value, TraceError> {
        self.call("softmax", &[x], attrs([("dim", Attribute::Int(dim))]))
    }

    /// Reads `{prefix}.weight` and, when present, `{prefix}.bias`.
    pub fn layer_norm(&mut self, x: &Value, prefix: &str, normalized_shape: &[usize], eps: f32) -> Result<Value, TraceError> {
        let w = self.param(&format!("{prefix}.weight"))?;
        let bias_name = format!("{prefix}.bias");
        let b = if self.weights.get(&bias_name).is_some() {
            Some(self.param(&bias_name)?)
        } else {
            None
        };
        let a = attrs([
            ("normalized_shape", ints(normalized_shape)),
            ("eps", Attribute::Float(eps)),
        ]);
        match &b {
            Some(b) => self.call("layer_norm", &[x, &w, b], a),
            None => self.call("layer_norm", &[x, &w], a),
        }
    }

    /// `pad` uses torch layout: `[last_begin, last_end, second_last_begin, ...]`.
    pub fn pad(&mut self, x: &Value, pad: &[i64], mode: PaddingMode, value: f32) -> Result<Value, TraceError> {
        let a = attrs([
            ("pad", Attribute::Ints(pad.to_vec())),
            ("mode", Attribute::String(mode.pad_mode().to_string())),
            ("value", Attribute::Float(value)),
        ]);
        self.call("pad", &[x], a)
    }

    /// Inference-mode dropout (identity).
    pub fn dropout(&mut self, x: &Value, p: f32) -> Result<Value, TraceError> {
        self.call("dropout", &[x], attrs([("p", Attribute::Float(p))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(shape: &[usize], data: &[f32]) -> TensorData {
        TensorData::new(shape.to_vec(), data.to_vec()).unwrap()
    }

    #[test]
    fn test_torch_pads_to_onnx() {
        assert_eq!(torch_pads_to_onnx(&[1, 2], 4).unwrap(), vec![0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(torch_pads_to_onnx(&[1, 2, 3, 4], 2).unwrap(), vec![3, 1, 4, 2]);
        assert!(torch_pads_to_onnx(&[1, 2, 3], 2).is_err());
    }

    #[test]
    fn test_linear_rank3_uses_matmul_path() {
        let x = TensorData::from_fn(vec![2, 1, 3], |i| i as f32);
        let w = t(&[2, 3], &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0]);
        let b = t(&[2], &[0.5, -0.5]);
        let y = evaluate("linear", &[&x, &w, &b], &Attributes::new()).unwrap();
        assert_eq!(y.shape(), &[2, 1, 2]);
        assert_eq!(y.data(), &[0.5, 1.5, 3.5, 4.5]);
    }

    #[test]
    fn test_adaptive_pool_uneven_windows() {
        let x = TensorData::from_fn(vec![1, 1, 1, 3], |i| i as f32);
        let y = adaptive_avg_pool2d(&x, [1, 2]).unwrap();
        assert_eq!(y.data(), &[0.5, 1.5]);
    }

    #[test]
    fn test_flatten_range() {
        let x = TensorData::zeros(vec![2, 3, 4, 5]);
        let a = attrs([("start_dim", Attribute::Int(1)), ("end_dim", Attribute::Int(2))]);
        assert_eq!(evaluate("flatten", &[&x], &a).unwrap().shape(), &[2, 12, 5]);
    }

    #[test]
    fn test_reshape_zero_is_literal() {
        let x = TensorData::zeros(vec![0, 4]);
        let a = attrs([("shape", Attribute::Ints(vec![0, 2, 2]))]);
        assert_eq!(evaluate("reshape", &[&x], &a).unwrap().shape(), &[0, 2, 2]);
    }

    #[test]
    fn test_circular_conv_wraps_input() {
        let x = t(&[1, 1, 1, 3], &[1.0, 2.0, 3.0]);
        let w = t(&[1, 1, 1, 3], &[1.0, 0.0, 0.0]);
        let a = attrs([
            ("padding", Attribute::Ints(vec![0, 1])),
            ("padding_mode", Attribute::String("circular".into())),
        ]);
        let y = evaluate("conv2d", &[&x, &w], &a).unwrap();
        assert_eq!(y.data(), &[3.0, 1.0, 2.0]);
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let x = TensorData::scalar(1.0);
        assert!(evaluate("lstm", &[&x], &Attributes::new()).is_err());
    }
}
