//! Dense f32 reference kernels.
//!
//! Shared by eager tracing (source semantics) and graph execution (ONNX
//! semantics); the two differ in how operators are composed, not in these
//! primitives. Layout is row-major, images are NCHW.

use thiserror::Error;

use super::tensor::{strides, unravel, TensorData};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("{op}: {detail}")]
    Invalid { op: &'static str, detail: String },
}

impl KernelError {
    pub fn invalid(op: &'static str, detail: impl Into<String>) -> Self {
        KernelError::Invalid { op, detail: detail.into() }
    }
}

pub type KernelResult = Result<TensorData, KernelError>;

/// Normalizes a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize, KernelError> {
    let r = rank as i64;
    let a = if axis < 0 { axis + r } else { axis };
    if a < 0 || a >= r.max(1) {
        return Err(KernelError::invalid("axis", format!("axis {axis} out of range for rank {rank}")));
    }
    Ok(a as usize)
}

/// Multidirectional (numpy) broadcasting of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Strides of `shape` viewed through a broadcast to `out`; broadcast axes get stride 0.
fn broadcast_strides(shape: &[usize], out: &[usize]) -> Vec<usize> {
    let offset = out.len() - shape.len();
    let own = strides(shape);
    (0..out.len())
        .map(|i| {
            if i < offset || shape[i - offset] == 1 {
                0
            } else {
                own[i - offset]
            }
        })
        .collect()
}

pub fn binary(op: &'static str, a: &TensorData, b: &TensorData, f: impl Fn(f32, f32) -> f32) -> KernelResult {
    let shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        KernelError::invalid(op, format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape()))
    })?;
    if a.shape() == b.shape() {
        let data = a.data().iter().zip(b.data()).map(|(&x, &y)| f(x, y)).collect();
        return TensorData::new(shape, data);
    }
    let sa = broadcast_strides(a.shape(), &shape);
    let sb = broadcast_strides(b.shape(), &shape);
    let n: usize = shape.iter().product();
    let mut data = Vec::with_capacity(n);
    for idx in 0..n {
        let coords = unravel(idx, &shape);
        let ia: usize = coords.iter().zip(&sa).map(|(c, s)| c * s).sum();
        let ib: usize = coords.iter().zip(&sb).map(|(c, s)| c * s).sum();
        data.push(f(a.data()[ia], b.data()[ib]));
    }
    TensorData::new(shape, data)
}

pub fn unary(a: &TensorData, f: impl Fn(f32) -> f32) -> TensorData {
    TensorData::from_fn(a.shape().to_vec(), |i| f(a.data()[i]))
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Error function (Abramowitz & Stegun 7.1.26, evaluated in f64).
pub fn erf(x: f32) -> f32 {
    let x = x as f64;
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    (sign * (1.0 - poly * (-x * x).exp())) as f32
}

pub fn gelu_exact(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x / std::f32::consts::SQRT_2))
}

pub fn gelu_tanh(x: f32) -> f32 {
    let k = (2.0 / std::f32::consts::PI).sqrt();
    0.5 * x * (1.0 + (k * (x + 0.044_715 * x * x * x)).tanh())
}

/// Numpy-style matrix product with batch broadcasting and 1-D promotion.
pub fn matmul(a: &TensorData, b: &TensorData) -> KernelResult {
    if a.rank() == 0 || b.rank() == 0 {
        return Err(KernelError::invalid("matmul", "scalar operands are not allowed"));
    }
    let a_shape = if a.rank() == 1 { vec![1, a.shape()[0]] } else { a.shape().to_vec() };
    let b_shape = if b.rank() == 1 { vec![b.shape()[0], 1] } else { b.shape().to_vec() };
    let (ra, rb) = (a_shape.len(), b_shape.len());
    let (m, k) = (a_shape[ra - 2], a_shape[ra - 1]);
    let (k2, n) = (b_shape[rb - 2], b_shape[rb - 1]);
    if k != k2 {
        return Err(KernelError::invalid(
            "matmul",
            format!("inner dimensions differ: {:?} x {:?}", a.shape(), b.shape()),
        ));
    }
    let batch = broadcast_shapes(&a_shape[..ra - 2], &b_shape[..rb - 2]).ok_or_else(|| {
        KernelError::invalid("matmul", format!("batch dims of {:?} and {:?} do not broadcast", a.shape(), b.shape()))
    })?;
    let a_batch = broadcast_strides(&a_shape[..ra - 2], &batch);
    let b_batch = broadcast_strides(&b_shape[..rb - 2], &batch);
    let batch_count: usize = batch.iter().product();

    let mut data = vec![0.0f32; batch_count * m * n];
    for bi in 0..batch_count {
        let coords = unravel(bi, &batch);
        let am: usize = coords.iter().zip(&a_batch).map(|(c, s)| c * s).sum();
        let bm: usize = coords.iter().zip(&b_batch).map(|(c, s)| c * s).sum();
        let a_off = am * m * k;
        let b_off = bm * k * n;
        let o_off = bi * m * n;
        for i in 0..m {
            for j in 0..n {
                let mut acc = 0.0f32;
                for p in 0..k {
                    acc += a.data()[a_off + i * k + p] * b.data()[b_off + p * n + j];
                }
                data[o_off + i * n + j] = acc;
            }
        }
    }

    let mut shape = batch;
    if a.rank() > 1 {
        shape.push(m);
    }
    if b.rank() > 1 {
        shape.push(n);
    }
    TensorData::new(shape, data)
}

/// `alpha * A' * B' + beta * C` with optional transposes; C broadcasts to [M, N].
pub fn gemm(
    a: &TensorData,
    b: &TensorData,
    c: Option<&TensorData>,
    alpha: f32,
    beta: f32,
    trans_a: bool,
    trans_b: bool,
) -> KernelResult {
    if a.rank() != 2 || b.rank() != 2 {
        return Err(KernelError::invalid(
            "gemm",
            format!("expected 2-D operands, got {:?} and {:?}", a.shape(), b.shape()),
        ));
    }
    let (m, k) = if trans_a { (a.shape()[1], a.shape()[0]) } else { (a.shape()[0], a.shape()[1]) };
    let (k2, n) = if trans_b { (b.shape()[1], b.shape()[0]) } else { (b.shape()[0], b.shape()[1]) };
    if k != k2 {
        return Err(KernelError::invalid(
            "gemm",
            format!("inner dimensions differ: {:?} x {:?}", a.shape(), b.shape()),
        ));
    }
    let bias = match c {
        Some(c) => {
            let target = broadcast_shapes(c.shape(), &[m, n]);
            if target.as_deref() != Some(&[m, n][..]) {
                return Err(KernelError::invalid(
                    "gemm",
                    format!("bias {:?} does not broadcast to [{m}, {n}]", c.shape()),
                ));
            }
            Some((c, broadcast_strides(c.shape(), &[m, n])))
        }
        None => None,
    };

    let mut data = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                let av = if trans_a { a.data()[p * m + i] } else { a.data()[i * k + p] };
                let bv = if trans_b { b.data()[j * k + p] } else { b.data()[p * n + j] };
                acc += av * bv;
            }
            let mut v = alpha * acc;
            if let Some((c, s)) = &bias {
                v += beta * c.data()[i * s[0] + j * s[1]];
            }
            data[i * n + j] = v;
        }
    }
    TensorData::new(vec![m, n], data)
}

pub fn transpose(a: &TensorData, perm: &[usize]) -> KernelResult {
    let rank = a.rank();
    let mut seen = vec![false; rank];
    if perm.len() != rank || perm.iter().any(|&p| p >= rank || std::mem::replace(&mut seen[p], true)) {
        return Err(KernelError::invalid(
            "transpose",
            format!("{perm:?} is not a permutation of rank {rank}"),
        ));
    }
    let out_shape: Vec<usize> = perm.iter().map(|&p| a.shape()[p]).collect();
    let in_strides = strides(a.shape());
    let data = (0..a.numel())
        .map(|idx| {
            let coords = unravel(idx, &out_shape);
            let src: usize = coords.iter().zip(perm).map(|(&c, &p)| c * in_strides[p]).sum();
            a.data()[src]
        })
        .collect();
    TensorData::new(out_shape, data)
}

/// How a window count that does not divide evenly is rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rounding {
    #[default]
    Floor,
    /// Rounds up, but the last window must start inside the input or the
    /// leading padding.
    Ceil,
    /// Rounds up and keeps a last window that starts in the trailing padding.
    CeilKeepPadded,
}

impl Rounding {
    /// ONNX pooling only drops windows starting in the trailing padding from opset 19.
    pub fn onnx(ceil_mode: bool, opset: i64) -> Self {
        match (ceil_mode, opset >= 19) {
            (false, _) => Rounding::Floor,
            (true, true) => Rounding::Ceil,
            (true, false) => Rounding::CeilKeepPadded,
        }
    }

    pub fn torch(ceil_mode: bool) -> Self {
        if ceil_mode {
            Rounding::Ceil
        } else {
            Rounding::Floor
        }
    }
}

/// Output length of a convolution or pooling window along one axis.
pub fn window_output_len(
    input: usize,
    kernel: usize,
    stride: usize,
    pad_begin: usize,
    pad_end: usize,
    dilation: usize,
    rounding: Rounding,
) -> Option<usize> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let effective = dilation * (kernel - 1) + 1;
    let span = input + pad_begin + pad_end;
    if span < effective {
        return None;
    }
    let room = span - effective;
    let mut out = match rounding {
        Rounding::Floor => room / stride + 1,
        Rounding::Ceil | Rounding::CeilKeepPadded => room.div_ceil(stride) + 1,
    };
    if rounding == Rounding::Ceil && (out - 1) * stride >= input + pad_begin {
        out -= 1;
    }
    Some(out)
}

/// Spatial parameters shared by convolution and pooling, ONNX pad layout
/// `[top, left, bottom, right]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Window2d {
    pub kernel: [usize; 2],
    pub strides: [usize; 2],
    pub pads: [usize; 4],
    pub dilations: [usize; 2],
    pub rounding: Rounding,
}

impl Window2d {
    pub fn new(kernel: [usize; 2]) -> Self {
        Self {
            kernel,
            strides: [1, 1],
            pads: [0; 4],
            dilations: [1, 1],
            rounding: Rounding::Floor,
        }
    }

    pub fn output_hw(&self, h: usize, w: usize, op: &'static str) -> Result<(usize, usize), KernelError> {
        let oh = window_output_len(h, self.kernel[0], self.strides[0], self.pads[0], self.pads[2], self.dilations[0], self.rounding);
        let ow = window_output_len(w, self.kernel[1], self.strides[1], self.pads[1], self.pads[3], self.dilations[1], self.rounding);
        match (oh, ow) {
            (Some(oh), Some(ow)) => Ok((oh, ow)),
            _ => Err(KernelError::invalid(
                op,
                format!("window {self:?} does not fit input {h}x{w}"),
            )),
        }
    }
}

fn expect_rank(x: &TensorData, rank: usize, op: &'static str) -> Result<(), KernelError> {
    if x.rank() != rank {
        return Err(KernelError::invalid(op, format!("expected rank {rank}, got {:?}", x.shape())));
    }
    Ok(())
}

pub fn conv2d(x: &TensorData, w: &TensorData, bias: Option<&TensorData>, window: &Window2d, groups: usize) -> KernelResult {
    expect_rank(x, 4, "conv")?;
    expect_rank(w, 4, "conv")?;
    let [n, c, h, wd] = [x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]];
    let [m, cg, kh, kw] = [w.shape()[0], w.shape()[1], w.shape()[2], w.shape()[3]];
    if groups == 0 || c != cg * groups || m % groups != 0 {
        return Err(KernelError::invalid(
            "conv",
            format!("input {:?} incompatible with weight {:?} and group {groups}", x.shape(), w.shape()),
        ));
    }
    if [kh, kw] != window.kernel {
        return Err(KernelError::invalid("conv", format!("kernel {:?} does not match weight {:?}", window.kernel, w.shape())));
    }
    if let Some(b) = bias {
        if b.shape() != [m] {
            return Err(KernelError::invalid("conv", format!("bias {:?} does not match {m} channels", b.shape())));
        }
    }
    let (oh, ow) = window.output_hw(h, wd, "conv")?;
    let m_per_group = m / groups;
    let mut out = vec![0.0f32; n * m * oh * ow];
    for b in 0..n {
        for oc in 0..m {
            let g = oc / m_per_group;
            let init = bias.map(|t| t.data()[oc]).unwrap_or(0.0);
            for y in 0..oh {
                for xo in 0..ow {
                    let mut acc = 0.0f32;
                    for ic in 0..cg {
                        let cin = g * cg + ic;
                        for ky in 0..kh {
                            let iy = (y * window.strides[0] + ky * window.dilations[0]) as isize - window.pads[0] as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (xo * window.strides[1] + kx * window.dilations[1]) as isize - window.pads[1] as isize;
                                if ix < 0 || ix >= wd as isize {
                                    continue;
                                }
                                let xv = x.data()[((b * c + cin) * h + iy as usize) * wd + ix as usize];
                                let wv = w.data()[((oc * cg + ic) * kh + ky) * kw + kx];
                                acc += xv * wv;
                            }
                        }
                    }
                    out[((b * m + oc) * oh + y) * ow + xo] = acc + init;
                }
            }
        }
    }
    TensorData::new(vec![n, m, oh, ow], out)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoolKind {
    Max,
    Average { count_include_pad: bool },
}

pub fn pool2d(x: &TensorData, kind: PoolKind, window: &Window2d) -> KernelResult {
    expect_rank(x, 4, "pool")?;
    let [n, c, h, w] = [x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]];
    let (oh, ow) = window.output_hw(h, w, "pool")?;
    let mut out = vec![0.0f32; n * c * oh * ow];
    for plane in 0..n * c {
        let base = plane * h * w;
        for y in 0..oh {
            for xo in 0..ow {
                let hstart = (y * window.strides[0]) as isize - window.pads[0] as isize;
                let wstart = (xo * window.strides[1]) as isize - window.pads[1] as isize;
                let value = match kind {
                    PoolKind::Max => {
                        let mut best = f32::NEG_INFINITY;
                        for ky in 0..window.kernel[0] {
                            let iy = hstart + (ky * window.dilations[0]) as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..window.kernel[1] {
                                let ix = wstart + (kx * window.dilations[1]) as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let v = x.data()[base + iy as usize * w + ix as usize];
                                if v > best || v.is_nan() {
                                    best = v;
                                }
                            }
                        }
                        best
                    }
                    PoolKind::Average { count_include_pad } => {
                        let hend = (hstart + window.kernel[0] as isize).min((h + window.pads[2]) as isize);
                        let wend = (wstart + window.kernel[1] as isize).min((w + window.pads[3]) as isize);
                        let padded_area = (hend - hstart).max(0) * (wend - wstart).max(0);
                        let (h0, w0) = (hstart.max(0), wstart.max(0));
                        let (h1, w1) = (hend.min(h as isize), wend.min(w as isize));
                        let mut sum = 0.0f32;
                        for iy in h0..h1 {
                            for ix in w0..w1 {
                                sum += x.data()[base + iy as usize * w + ix as usize];
                            }
                        }
                        let divisor = if count_include_pad {
                            padded_area
                        } else {
                            (h1 - h0).max(0) * (w1 - w0).max(0)
                        };
                        if divisor > 0 {
                            sum / divisor as f32
                        } else {
                            0.0
                        }
                    }
                };
                out[(plane * oh + y) * ow + xo] = value;
            }
        }
    }
    TensorData::new(vec![n, c, oh, ow], out)
}

/// Mean over every axis after the channel axis, keeping them as size 1.
pub fn global_average_pool(x: &TensorData) -> KernelResult {
    if x.rank() < 3 {
        return Err(KernelError::invalid("global_average_pool", format!("expected rank >= 3, got {:?}", x.shape())));
    }
    let planes = x.shape()[0] * x.shape()[1];
    let spatial: usize = x.shape()[2..].iter().product();
    let data = (0..planes)
        .map(|p| {
            let sum: f64 = x.data()[p * spatial..(p + 1) * spatial].iter().map(|&v| v as f64).sum();
            if spatial == 0 { 0.0 } else { (sum / spatial as f64) as f32 }
        })
        .collect();
    let mut shape = x.shape()[..2].to_vec();
    shape.extend(std::iter::repeat(1).take(x.rank() - 2));
    TensorData::new(shape, data)
}

/// Inference-mode batch normalization over channel axis 1.
pub fn batch_norm(
    x: &TensorData,
    scale: &TensorData,
    bias: &TensorData,
    mean: &TensorData,
    var: &TensorData,
    epsilon: f32,
) -> KernelResult {
    if x.rank() < 2 {
        return Err(KernelError::invalid("batch_norm", format!("expected rank >= 2, got {:?}", x.shape())));
    }
    let c = x.shape()[1];
    for (name, t) in [("scale", scale), ("bias", bias), ("mean", mean), ("var", var)] {
        if t.numel() != c {
            return Err(KernelError::invalid(
                "batch_norm",
                format!("{name} has {} elements, expected {c}", t.numel()),
            ));
        }
    }
    let inner: usize = x.shape()[2..].iter().product();
    let data = (0..x.numel())
        .map(|i| {
            let ch = (i / inner.max(1)) % c;
            let inv = 1.0 / (var.data()[ch] + epsilon).sqrt();
            (x.data()[i] - mean.data()[ch]) * inv * scale.data()[ch] + bias.data()[ch]
        })
        .collect();
    TensorData::new(x.shape().to_vec(), data)
}

/// Normalizes over all axes from `axis` on.
pub fn layer_norm(x: &TensorData, scale: &TensorData, bias: Option<&TensorData>, axis: usize, epsilon: f32) -> KernelResult {
    let inner: usize = x.shape()[axis..].iter().product();
    if scale.numel() != inner || bias.is_some_and(|b| b.numel() != inner) {
        return Err(KernelError::invalid(
            "layer_norm",
            format!("affine parameters do not match normalized size {inner}"),
        ));
    }
    let mut data = vec![0.0f32; x.numel()];
    if inner == 0 {
        return TensorData::new(x.shape().to_vec(), data);
    }
    for (row, chunk) in x.data().chunks(inner).enumerate() {
        let mean = chunk.iter().map(|&v| v as f64).sum::<f64>() / inner as f64;
        let var = chunk.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / inner as f64;
        let inv = 1.0 / (var + epsilon as f64).sqrt();
        for (j, &v) in chunk.iter().enumerate() {
            let normed = ((v as f64 - mean) * inv) as f32;
            let shift = bias.map(|b| b.data()[j]).unwrap_or(0.0);
            data[row * inner + j] = normed * scale.data()[j] + shift;
        }
    }
    TensorData::new(x.shape().to_vec(), data)
}

pub fn softmax(x: &TensorData, axis: usize) -> KernelResult {
    if axis >= x.rank() {
        return Err(KernelError::invalid("softmax", format!("axis {axis} out of range for {:?}", x.shape())));
    }
    let outer: usize = x.shape()[..axis].iter().product();
    let len = x.shape()[axis];
    let inner: usize = x.shape()[axis + 1..].iter().product();
    let mut data = vec![0.0f32; x.numel()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| o * len * inner + k * inner + i;
            let max = (0..len).map(|k| x.data()[at(k)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0f32;
            for k in 0..len {
                let e = (x.data()[at(k)] - max).exp();
                data[at(k)] = e;
                sum += e;
            }
            for k in 0..len {
                data[at(k)] /= sum;
            }
        }
    }
    TensorData::new(x.shape().to_vec(), data)
}

pub fn concat(inputs: &[&TensorData], axis: usize) -> KernelResult {
    let first = inputs.first().ok_or_else(|| KernelError::invalid("concat", "no inputs"))?;
    let rank = first.rank();
    if axis >= rank {
        return Err(KernelError::invalid("concat", format!("axis {axis} out of range for rank {rank}")));
    }
    for t in inputs {
        let compatible = t.rank() == rank
            && t.shape().iter().zip(first.shape()).enumerate().all(|(i, (a, b))| i == axis || a == b);
        if !compatible {
            return Err(KernelError::invalid(
                "concat",
                format!("{:?} does not match {:?} outside axis {axis}", t.shape(), first.shape()),
            ));
        }
    }
    let outer: usize = first.shape()[..axis].iter().product();
    let inner: usize = first.shape()[axis + 1..].iter().product();
    let mut shape = first.shape().to_vec();
    shape[axis] = inputs.iter().map(|t| t.shape()[axis]).sum();
    let mut data = Vec::with_capacity(shape.iter().product());
    for o in 0..outer {
        for t in inputs {
            let block = t.shape()[axis] * inner;
            data.extend_from_slice(&t.data()[o * block..(o + 1) * block]);
        }
    }
    TensorData::new(shape, data)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PadMode {
    Constant(f32),
    Reflect,
    Edge,
    Wrap,
}

/// Pads with ONNX layout: all begins, then all ends.
pub fn pad(x: &TensorData, pads: &[usize], mode: PadMode) -> KernelResult {
    let rank = x.rank();
    if pads.len() != 2 * rank {
        return Err(KernelError::invalid("pad", format!("expected {} pad values, got {}", 2 * rank, pads.len())));
    }
    for axis in 0..rank {
        let dim = x.shape()[axis];
        let (b, e) = (pads[axis], pads[axis + rank]);
        let bad = match mode {
            PadMode::Reflect => (b > 0 || e > 0) && (b >= dim || e >= dim),
            PadMode::Edge => (b > 0 || e > 0) && dim == 0,
            PadMode::Wrap => (b > 0 || e > 0) && (b > dim || e > dim),
            PadMode::Constant(_) => false,
        };
        if bad {
            return Err(KernelError::invalid("pad", format!("cannot pad axis {axis} of size {dim} by ({b}, {e}) in {mode:?} mode")));
        }
    }
    let shape: Vec<usize> = (0..rank).map(|a| x.shape()[a] + pads[a] + pads[a + rank]).collect();
    let in_strides = strides(x.shape());
    let n: usize = shape.iter().product();
    let mut data = Vec::with_capacity(n);
    'outer: for idx in 0..n {
        let coords = unravel(idx, &shape);
        let mut src = 0;
        for axis in 0..rank {
            let dim = x.shape()[axis] as isize;
            let mut c = coords[axis] as isize - pads[axis] as isize;
            if c < 0 || c >= dim {
                match mode {
                    PadMode::Constant(v) => {
                        data.push(v);
                        continue 'outer;
                    }
                    PadMode::Reflect => c = if c < 0 { -c } else { 2 * (dim - 1) - c },
                    PadMode::Edge => c = c.clamp(0, dim - 1),
                    PadMode::Wrap => c = c.rem_euclid(dim),
                }
            }
            src += c as usize * in_strides[axis];
        }
        data.push(x.data()[src]);
    }
    TensorData::new(shape, data)
}

/// Nearest-neighbour resize, asymmetric coordinates, floor rounding.
pub fn resize_nearest(x: &TensorData, scales: &[f32]) -> KernelResult {
    if scales.len() != x.rank() || scales.iter().any(|&s| !(s > 0.0)) {
        return Err(KernelError::invalid("resize", format!("invalid scales {scales:?} for {:?}", x.shape())));
    }
    let shape: Vec<usize> = x
        .shape()
        .iter()
        .zip(scales)
        .map(|(&d, &s)| (d as f64 * s as f64).floor() as usize)
        .collect();
    let in_strides = strides(x.shape());
    let n: usize = shape.iter().product();
    let data = (0..n)
        .map(|idx| {
            let coords = unravel(idx, &shape);
            let src: usize = coords
                .iter()
                .enumerate()
                .map(|(a, &c)| {
                    let s = ((c as f64 / scales[a] as f64).floor() as usize).min(x.shape()[a].saturating_sub(1));
                    s * in_strides[a]
                })
                .sum();
            x.data()[src]
        })
        .collect();
    TensorData::new(shape, data)
}

pub fn reduce_mean(x: &TensorData, axes: &[usize], keepdims: bool) -> KernelResult {
    let rank = x.rank();
    if axes.iter().any(|&a| a >= rank) {
        return Err(KernelError::invalid("reduce_mean", format!("axes {axes:?} out of range for rank {rank}")));
    }
    if (1..axes.len()).any(|i| axes[..i].contains(&axes[i])) {
        return Err(KernelError::invalid("reduce_mean", format!("axes {axes:?} repeat an axis")));
    }
    let kept: Vec<usize> = (0..rank).map(|a| if axes.contains(&a) { 1 } else { x.shape()[a] }).collect();
    let count: usize = axes.iter().map(|&a| x.shape()[a]).product();
    let mut sums = vec![0.0f64; kept.iter().product()];
    let out_strides = strides(&kept);
    for idx in 0..x.numel() {
        let coords = unravel(idx, x.shape());
        let o: usize = coords
            .iter()
            .enumerate()
            .map(|(a, &c)| if axes.contains(&a) { 0 } else { c * out_strides[a] })
            .sum();
        sums[o] += x.data()[idx] as f64;
    }
    let data = sums
        .into_iter()
        .map(|s| if count == 0 { f32::NAN } else { (s / count as f64) as f32 })
        .collect();
    let shape = if keepdims {
        kept
    } else {
        (0..rank).filter(|a| !axes.contains(a)).map(|a| x.shape()[a]).collect()
    };
    TensorData::new(shape, data)
}

/// Resolves an ONNX `Reshape` target against the input shape.
pub fn reshape_target(input: &[usize], target: &[i64], allowzero: bool) -> Result<Vec<usize>, KernelError> {
    let total: usize = input.iter().product();
    let mut shape = Vec::with_capacity(target.len());
    let mut infer_at = None;
    for (i, &t) in target.iter().enumerate() {
        match t {
            -1 if infer_at.is_none() => {
                infer_at = Some(i);
                shape.push(1);
            }
            0 if !allowzero => {
                let d = *input.get(i).ok_or_else(|| {
                    KernelError::invalid("reshape", format!("0 at position {i} has no input dim to copy"))
                })?;
                shape.push(d);
            }
            t if t >= 0 => shape.push(t as usize),
            _ => return Err(KernelError::invalid("reshape", format!("invalid target {target:?}"))),
        }
    }
    let known: usize = shape.iter().product();
    if let Some(i) = infer_at {
        if known == 0 || total % known != 0 {
            return Err(KernelError::invalid("reshape", format!("cannot infer -1 in {target:?} from {input:?}")));
        }
        shape[i] = total / known;
    } else if known != total {
        return Err(KernelError::invalid("reshape", format!("{input:?} cannot be reshaped to {target:?}")));
    }
    Ok(shape)
}
