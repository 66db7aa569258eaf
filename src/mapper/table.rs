//! Built-in candidate encodings for every source kind the tracer records.

use crate::ir::{Attribute, Attributes, Dim, Node, OpKind};
use crate::runtime::kernels::{window_output_len, Rounding};
use crate::tracer::ops::torch_pads_to_onnx;

use super::{attrs, LowerFn, Lowering, Mapping, MappingTable, Rejection};

fn candidate(
    encoding: &'static str,
    min_opset: i64,
    max_opset: Option<i64>,
    supported_attrs: &'static [&'static str],
    lower: LowerFn,
) -> Mapping {
    Mapping {
        encoding,
        min_opset,
        max_opset,
        supported_attrs,
        lower,
    }
}

const CONV_ATTRS: &[&str] = &["dilation", "groups", "padding", "padding_mode", "stride"];
const MAX_POOL_ATTRS: &[&str] = &["ceil_mode", "dilation", "kernel_size", "padding", "stride"];
const AVG_POOL_ATTRS: &[&str] = &["ceil_mode", "count_include_pad", "kernel_size", "padding", "stride"];
const PAD_ATTRS: &[&str] = &["mode", "pad", "value"];

pub(super) fn install(table: &mut MappingTable) {
    table.register("linear", candidate("Gemm", 7, None, &[], linear_gemm));
    table.register("linear", candidate("Transpose+MatMul+Add", 7, None, &[], linear_matmul));

    table.register("conv2d", candidate("Conv", 7, None, CONV_ATTRS, conv_direct));
    table.register("conv2d", candidate("Pad+Conv", 7, None, CONV_ATTRS, conv_padded));

    table.register("batch_norm2d", candidate("BatchNormalization", 7, None, &["eps"], batch_norm));

    table.register("relu", candidate("Relu", 7, None, &[], relu));
    table.register("sigmoid", candidate("Sigmoid", 7, None, &[], sigmoid));
    table.register("tanh", candidate("Tanh", 7, None, &[], tanh));
    table.register("silu", candidate("Sigmoid+Mul", 7, None, &[], silu));

    table.register("gelu", candidate("Gelu", 20, None, &["approximate"], gelu_native));
    table.register("gelu", candidate("Erf decomposition", 9, None, &["approximate"], gelu_erf));
    table.register("gelu", candidate("Tanh approximation", 7, None, &["approximate"], gelu_tanh));

    table.register("add", candidate("Add", 7, None, &[], add));
    table.register("sub", candidate("Sub", 7, None, &[], sub));
    table.register("mul", candidate("Mul", 7, None, &[], mul));
    table.register("div", candidate("Div", 7, None, &[], div));
    table.register("matmul", candidate("MatMul", 7, None, &[], matmul));

    table.register("max_pool2d", candidate("MaxPool", 7, None, MAX_POOL_ATTRS, max_pool));
    table.register("avg_pool2d", candidate("AveragePool", 7, None, AVG_POOL_ATTRS, avg_pool));
    table.register("avg_pool2d", candidate("Pad+AveragePool", 7, None, AVG_POOL_ATTRS, avg_pool_padded));
    table.register(
        "adaptive_avg_pool2d",
        candidate("GlobalAveragePool", 7, None, &["output_size"], adaptive_global),
    );
    table.register(
        "adaptive_avg_pool2d",
        candidate("AveragePool", 7, None, &["output_size"], adaptive_window),
    );
    table.register(
        "upsample_nearest2d",
        candidate("Resize", 11, None, &["scale_factor"], upsample_nearest),
    );

    table.register("cat", candidate("Concat", 7, None, &["dim"], cat));
    table.register("flatten", candidate("Flatten", 7, None, &["end_dim", "start_dim"], flatten_direct));
    table.register("flatten", candidate("Reshape", 7, None, &["end_dim", "start_dim"], flatten_reshape));
    table.register("reshape", candidate("Reshape", 7, None, &["shape"], reshape));
    table.register("permute", candidate("Transpose", 7, None, &["dims"], permute));

    table.register("softmax", candidate("Softmax", 13, None, &["dim"], softmax));
    table.register("softmax", candidate("Softmax (last axis)", 7, Some(12), &["dim"], softmax_last_axis));
    table.register(
        "softmax",
        candidate("Transpose+Softmax+Transpose", 7, Some(12), &["dim"], softmax_transposed),
    );

    table.register(
        "layer_norm",
        candidate("LayerNormalization", 17, None, &["eps", "normalized_shape"], layer_norm_native),
    );
    table.register(
        "layer_norm",
        candidate("ReduceMean decomposition", 7, None, &["eps", "normalized_shape"], layer_norm_decomposed),
    );

    table.register("pad", candidate("Pad", 11, None, PAD_ATTRS, pad));
    table.register("pad", candidate("Pad (attribute form)", 7, Some(10), PAD_ATTRS, pad_legacy));

    table.register("dropout", candidate("Identity", 7, None, &["p"], identity));
    table.register("identity", candidate("Identity", 7, None, &[], identity));
}

fn ints(values: &[i64]) -> Attribute {
    Attribute::Ints(values.to_vec())
}

fn text(value: &str) -> Attribute {
    Attribute::String(value.to_string())
}

/// Reads a two-element int attribute, `default` when absent.
fn pair(node: &Node, name: &str, default: [i64; 2]) -> Result<[i64; 2], Rejection> {
    match node.attributes.get(name) {
        None => Ok(default),
        Some(Attribute::Ints(v)) if v.len() == 2 && v.iter().all(|&x| x >= 0) => Ok([v[0], v[1]]),
        Some(other) => Err(Rejection(format!("{name} must be two non-negative ints, got {other}"))),
    }
}

fn normalize(axis: i64, rank: usize) -> Result<i64, Rejection> {
    let r = rank as i64;
    let a = if axis < 0 { axis + r } else { axis };
    if a < 0 || a >= r {
        return Err(Rejection(format!("axis {axis} is out of range for rank {rank}")));
    }
    Ok(a)
}

macro_rules! direct {
    ($($name:ident => $kind:ident),* $(,)?) => {
        $(
            fn $name(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
                cx.emit_final(OpKind::$kind, node.inputs.clone(), Attributes::new());
                Ok(())
            }
        )*
    };
}

direct!(
    relu => Relu,
    sigmoid => Sigmoid,
    tanh => Tanh,
    add => Add,
    sub => Sub,
    mul => Mul,
    div => Div,
    matmul => MatMul,
);

fn identity(_node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let x = cx.input(0)?;
    cx.emit_final(OpKind::Identity, vec![x], Attributes::new());
    Ok(())
}

fn linear_gemm(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let x = cx.input(0)?;
    let rank = cx.rank(&x)?;
    if rank != 2 {
        return Err(Rejection(format!("Gemm needs a 2-D input, got rank {rank}")));
    }
    let mut inputs = vec![x, cx.input(1)?];
    if node.inputs.len() > 2 {
        inputs.push(cx.input(2)?);
    } else if cx.opset() < 11 {
        return Err(Rejection::new("Gemm without a bias needs opset 11"));
    }
    cx.emit_final(OpKind::Gemm, inputs, attrs([("transB", Attribute::Int(1))]));
    Ok(())
}

fn linear_matmul(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let x = cx.input(0)?;
    let weight = cx.input(1)?;
    let transposed = cx.emit(OpKind::Transpose, vec![weight], attrs([("perm", ints(&[1, 0]))]));
    if node.inputs.len() > 2 {
        let product = cx.emit(OpKind::MatMul, vec![x, transposed], Attributes::new());
        let bias = cx.input(2)?;
        cx.emit_final(OpKind::Add, vec![product, bias], Attributes::new());
    } else {
        cx.emit_final(OpKind::MatMul, vec![x, transposed], Attributes::new());
    }
    Ok(())
}

fn conv_attributes(node: &Node, cx: &Lowering<'_>, with_pads: bool) -> Result<Attributes, Rejection> {
    let weight = cx.input(1)?;
    let kernel = match cx.shape(&weight)? {
        [_, _, kh, kw] => match (kh.fixed(), kw.fixed()) {
            (Some(kh), Some(kw)) => [kh as i64, kw as i64],
            _ => return Err(Rejection::new("conv weight has a dynamic kernel size")),
        },
        other => return Err(Rejection(format!("conv weight must be 4-D, got rank {}", other.len()))),
    };
    let [ph, pw] = pair(node, "padding", [0, 0])?;
    let mut a = attrs([
        ("kernel_shape", ints(&kernel)),
        ("strides", ints(&pair(node, "stride", [1, 1])?)),
        ("dilations", ints(&pair(node, "dilation", [1, 1])?)),
        ("group", Attribute::Int(node.attr_int("groups", 1))),
    ]);
    if with_pads {
        a.insert("pads".to_string(), ints(&[ph, pw, ph, pw]));
    }
    Ok(a)
}

fn conv_inputs(node: &Node, x: String) -> Vec<String> {
    let mut inputs = vec![x];
    inputs.extend(node.inputs.iter().skip(1).cloned());
    inputs
}

fn conv_direct(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let mode = node.attr_str("padding_mode", "zeros");
    if mode != "zeros" {
        return Err(Rejection(format!("Conv pads cannot express padding_mode '{mode}'")));
    }
    let a = conv_attributes(node, cx, true)?;
    let x = cx.input(0)?;
    cx.emit_final(OpKind::Conv, conv_inputs(node, x), a);
    Ok(())
}

fn conv_padded(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let mode = match node.attr_str("padding_mode", "zeros") {
        "reflect" => "reflect",
        "replicate" => "edge",
        "circular" if cx.opset() >= 19 => "wrap",
        "circular" => return Err(Rejection::new("circular padding needs Pad mode 'wrap' (opset 19)")),
        other => return Err(Rejection(format!("padding_mode '{other}' needs no separate Pad"))),
    };
    let a = conv_attributes(node, cx, false)?;
    let [ph, pw] = pair(node, "padding", [0, 0])?;
    let x = cx.input(0)?;
    let padded = emit_spatial_pad(cx, x, [ph, pw], mode);
    cx.emit_final(OpKind::Conv, conv_inputs(node, padded), a);
    Ok(())
}

/// Pads the spatial axes of an NCHW value. Opset 11 takes the pads as an input, older opsets as an attribute.
fn emit_spatial_pad(cx: &mut Lowering<'_>, x: String, [ph, pw]: [i64; 2], mode: &str) -> String {
    let pads = [0, 0, ph, pw, 0, 0, ph, pw];
    if cx.opset() >= 11 {
        let pads = cx.constant_i64("pads", &[8], &pads);
        cx.emit(OpKind::Pad, vec![x, pads], attrs([("mode", text(mode))]))
    } else {
        cx.emit(OpKind::Pad, vec![x], attrs([("mode", text(mode)), ("pads", ints(&pads))]))
    }
}

fn batch_norm(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    if node.inputs.len() != 5 {
        return Err(Rejection(format!("expected 5 inputs, got {}", node.inputs.len())));
    }
    let epsilon = node.attr_float("eps", 1e-5);
    cx.emit_final(
        OpKind::BatchNormalization,
        node.inputs.clone(),
        attrs([("epsilon", Attribute::Float(epsilon))]),
    );
    Ok(())
}

fn silu(_node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let x = cx.input(0)?;
    let gate = cx.emit(OpKind::Sigmoid, vec![x.clone()], Attributes::new());
    cx.emit_final(OpKind::Mul, vec![x, gate], Attributes::new());
    Ok(())
}

fn gelu_native(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let approximate = node.attr_str("approximate", "none").to_string();
    let x = cx.input(0)?;
    cx.emit_final(OpKind::Gelu, vec![x], attrs([("approximate", Attribute::String(approximate))]));
    Ok(())
}

fn gelu_erf(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    if node.attr_str("approximate", "none") != "none" {
        return Err(Rejection::new("the erf form computes exact gelu only"));
    }
    let x = cx.input(0)?;
    let sqrt2 = cx.scalar_f32("sqrt2", std::f32::consts::SQRT_2);
    let one = cx.scalar_f32("one", 1.0);
    let half = cx.scalar_f32("half", 0.5);
    let scaled = cx.emit(OpKind::Div, vec![x.clone(), sqrt2], Attributes::new());
    let erf = cx.emit(OpKind::Erf, vec![scaled], Attributes::new());
    let shifted = cx.emit(OpKind::Add, vec![erf, one], Attributes::new());
    let product = cx.emit(OpKind::Mul, vec![x, shifted], Attributes::new());
    cx.emit_final(OpKind::Mul, vec![product, half], Attributes::new());
    Ok(())
}

fn gelu_tanh(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    if node.attr_str("approximate", "none") != "tanh" {
        return Err(Rejection::new("the tanh form only matches approximate='tanh'"));
    }
    let x = cx.input(0)?;
    let k = cx.scalar_f32("sqrt_2_over_pi", (2.0 / std::f32::consts::PI).sqrt());
    let coeff = cx.scalar_f32("coeff", 0.044_715);
    let one = cx.scalar_f32("one", 1.0);
    let half = cx.scalar_f32("half", 0.5);
    let none = Attributes::new;
    let square = cx.emit(OpKind::Mul, vec![x.clone(), x.clone()], none());
    let cube = cx.emit(OpKind::Mul, vec![square, x.clone()], none());
    let term = cx.emit(OpKind::Mul, vec![cube, coeff], none());
    let inner = cx.emit(OpKind::Add, vec![x.clone(), term], none());
    let scaled = cx.emit(OpKind::Mul, vec![inner, k], none());
    let t = cx.emit(OpKind::Tanh, vec![scaled], none());
    let shifted = cx.emit(OpKind::Add, vec![t, one], none());
    let halved = cx.emit(OpKind::Mul, vec![x, half], none());
    cx.emit_final(OpKind::Mul, vec![halved, shifted], none());
    Ok(())
}

struct PoolParams {
    kernel: [i64; 2],
    stride: [i64; 2],
    padding: [i64; 2],
    ceil_mode: bool,
}

fn pool_params(node: &Node, cx: &Lowering<'_>) -> Result<PoolParams, Rejection> {
    let kernel = pair(node, "kernel_size", [0, 0])?;
    if kernel.contains(&0) {
        return Err(Rejection::new("kernel_size must be positive"));
    }
    let ceil_mode = node.attr_int("ceil_mode", 0) != 0;
    if ceil_mode && cx.opset() < 10 {
        return Err(Rejection::new("ceil_mode needs opset 10"));
    }
    let p = PoolParams {
        kernel,
        stride: pair(node, "stride", kernel)?,
        padding: pair(node, "padding", [0, 0])?,
        ceil_mode,
    };
    if ceil_mode && cx.opset() < 19 {
        let dilation = pair(node, "dilation", [1, 1])?;
        let x = node.inputs.first().ok_or_else(|| Rejection::new("missing input"))?;
        check_trailing_windows(&p, dilation, cx.shape(x)?)?;
    }
    Ok(p)
}

/// Before opset 19 an ONNX pool keeps a last ceil_mode window that starts in
/// the trailing padding; the traced pool drops it.
fn check_trailing_windows(p: &PoolParams, dilation: [i64; 2], shape: &[Dim]) -> Result<(), Rejection> {
    for axis in 0..2 {
        let size = match shape.get(axis + 2) {
            Some(Dim::Fixed(size)) => *size,
            _ => {
                return Err(Rejection::new(
                    "ceil_mode on a dynamic spatial axis needs opset 19 to match the traced window count",
                ))
            }
        };
        let [k, s, pad, d] = [p.kernel[axis], p.stride[axis], p.padding[axis], dilation[axis]].map(|v| v as usize);
        let len = |rounding| window_output_len(size, k, s, pad, pad, d, rounding);
        if len(Rounding::Ceil) != len(Rounding::CeilKeepPadded) {
            return Err(Rejection(format!(
                "ceil_mode window on axis {} starts in the trailing padding; needs opset 19",
                axis + 2
            )));
        }
    }
    Ok(())
}

fn pool_attributes(p: &PoolParams, opset: i64, with_pads: bool) -> Attributes {
    let [ph, pw] = p.padding;
    let mut a = attrs([("kernel_shape", ints(&p.kernel)), ("strides", ints(&p.stride))]);
    if with_pads {
        a.insert("pads".to_string(), ints(&[ph, pw, ph, pw]));
    }
    if opset >= 10 {
        a.insert("ceil_mode".to_string(), Attribute::Int(p.ceil_mode as i64));
    }
    a
}

fn max_pool(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let p = pool_params(node, cx)?;
    let dilation = pair(node, "dilation", [1, 1])?;
    let mut a = pool_attributes(&p, cx.opset(), true);
    if dilation != [1, 1] {
        if cx.opset() < 10 {
            return Err(Rejection::new("dilated MaxPool needs opset 10"));
        }
        a.insert("dilations".to_string(), ints(&dilation));
    }
    let x = cx.input(0)?;
    cx.emit_final(OpKind::MaxPool, vec![x], a);
    Ok(())
}

fn avg_pool(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let p = pool_params(node, cx)?;
    let mut a = pool_attributes(&p, cx.opset(), true);
    a.insert(
        "count_include_pad".to_string(),
        Attribute::Int(node.attr_int("count_include_pad", 1)),
    );
    let x = cx.input(0)?;
    cx.emit_final(OpKind::AveragePool, vec![x], a);
    Ok(())
}

/// Materializes zero padding so every window divides by the full kernel area.
fn avg_pool_padded(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let p = pool_params(node, cx)?;
    if node.attr_int("count_include_pad", 1) == 0 || p.ceil_mode {
        return Err(Rejection::new(
            "explicit zero padding only matches count_include_pad=1 without ceil_mode",
        ));
    }
    let x = cx.input(0)?;
    let padded = emit_spatial_pad(cx, x, p.padding, "constant");
    let a = pool_attributes(&p, cx.opset(), false);
    cx.emit_final(OpKind::AveragePool, vec![padded], a);
    Ok(())
}

fn adaptive_global(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let size = pair(node, "output_size", [1, 1])?;
    if size != [1, 1] {
        return Err(Rejection(format!("GlobalAveragePool only produces 1x1, not {size:?}")));
    }
    let x = cx.input(0)?;
    cx.emit_final(OpKind::GlobalAveragePool, vec![x], Attributes::new());
    Ok(())
}

fn adaptive_window(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let [oh, ow] = pair(node, "output_size", [1, 1])?;
    let x = cx.input(0)?;
    let (h, w) = match cx.shape(&x)? {
        [_, _, h, w] => match (h.fixed(), w.fixed()) {
            (Some(h), Some(w)) => (h as i64, w as i64),
            _ => return Err(Rejection::new("adaptive pooling over dynamic spatial dims")),
        },
        other => return Err(Rejection(format!("expected a 4-D input, got rank {}", other.len()))),
    };
    if oh == 0 || ow == 0 || h % oh != 0 || w % ow != 0 {
        return Err(Rejection(format!("{h}x{w} does not divide evenly into {oh}x{ow}")));
    }
    let kernel = [h / oh, w / ow];
    let a = attrs([
        ("kernel_shape", ints(&kernel)),
        ("strides", ints(&kernel)),
        ("count_include_pad", Attribute::Int(0)),
    ]);
    cx.emit_final(OpKind::AveragePool, vec![x], a);
    Ok(())
}

fn upsample_nearest(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let [sh, sw] = match node.attributes.get("scale_factor") {
        Some(Attribute::Floats(s)) if s.len() == 2 => [s[0], s[1]],
        _ => return Err(Rejection::new("scale_factor must be two floats")),
    };
    let x = cx.input(0)?;
    let roi = if cx.opset() >= 13 {
        String::new()
    } else {
        cx.constant_f32("roi", &[0], &[])
    };
    let scales = cx.constant_f32("scales", &[4], &[1.0, 1.0, sh, sw]);
    let a = attrs([
        ("mode", text("nearest")),
        ("coordinate_transformation_mode", text("asymmetric")),
        ("nearest_mode", text("floor")),
    ]);
    cx.emit_final(OpKind::Resize, vec![x, roi, scales], a);
    Ok(())
}

fn cat(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let rank = cx.rank(&cx.input(0)?)?;
    let axis = normalize(node.attr_int("dim", 0), rank)?;
    cx.emit_final(OpKind::Concat, node.inputs.clone(), attrs([("axis", Attribute::Int(axis))]));
    Ok(())
}

fn flatten_range(node: &Node, rank: usize) -> Result<(usize, usize), Rejection> {
    if rank == 0 {
        return Err(Rejection::new("flattening a scalar"));
    }
    let start = normalize(node.attr_int("start_dim", 1), rank)? as usize;
    let end = normalize(node.attr_int("end_dim", -1), rank)? as usize;
    if start > end {
        return Err(Rejection(format!("start_dim {start} is after end_dim {end}")));
    }
    Ok((start, end))
}

fn flatten_direct(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let x = cx.input(0)?;
    let rank = cx.rank(&x)?;
    let (start, end) = flatten_range(node, rank)?;
    if start != 1 || end != rank - 1 {
        return Err(Rejection(format!(
            "Flatten always yields 2-D; dims {start}..={end} of rank {rank} need a Reshape"
        )));
    }
    cx.emit_final(OpKind::Flatten, vec![x], attrs([("axis", Attribute::Int(1))]));
    Ok(())
}

fn flatten_reshape(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let x = cx.input(0)?;
    let shape = cx.shape(&x)?;
    let (start, end) = flatten_range(node, shape.len())?;
    // Leading axes copy the input dim (0); the merged block is inferred unless
    // it can be stated exactly, which keeps a dynamic batch axis usable.
    let mut target = vec![0i64; start];
    let merged: Option<usize> = shape[start..=end].iter().map(|d| d.fixed()).product();
    target.push(match merged {
        Some(size) if start > 0 && size > 0 => size as i64,
        _ => -1,
    });
    for (axis, dim) in shape.iter().enumerate().skip(end + 1) {
        match dim.fixed() {
            Some(d) if d > 0 => target.push(d as i64),
            _ => return Err(Rejection(format!("trailing axis {axis} ({dim}) cannot be stated statically"))),
        }
    }
    let target_name = cx.constant_i64("shape", &[target.len()], &target);
    cx.emit_final(OpKind::Reshape, vec![x, target_name], Attributes::new());
    Ok(())
}

fn reshape(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let target = node
        .attr_ints("shape")
        .ok_or_else(|| Rejection::new("missing shape"))?
        .to_vec();
    let mut a = Attributes::new();
    if target.contains(&0) {
        if target.contains(&-1) {
            return Err(Rejection::new("a zero-sized axis next to -1 is ambiguous"));
        }
        if cx.opset() < 14 {
            return Err(Rejection::new("literal zero-sized axes need Reshape allowzero (opset 14)"));
        }
        a.insert("allowzero".to_string(), Attribute::Int(1));
    }
    let x = cx.input(0)?;
    let target_name = cx.constant_i64("shape", &[target.len()], &target);
    cx.emit_final(OpKind::Reshape, vec![x, target_name], a);
    Ok(())
}

fn permute(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let x = cx.input(0)?;
    let rank = cx.rank(&x)?;
    let dims = node.attr_ints("dims").ok_or_else(|| Rejection::new("missing dims"))?;
    let perm = dims
        .iter()
        .map(|&d| normalize(d, rank))
        .collect::<Result<Vec<_>, _>>()?;
    cx.emit_final(OpKind::Transpose, vec![x], attrs([("perm", Attribute::Ints(perm))]));
    Ok(())
}

fn softmax_axis(node: &Node, cx: &Lowering<'_>) -> Result<(String, usize, usize), Rejection> {
    let x = cx.input(0)?;
    let rank = cx.rank(&x)?;
    let axis = normalize(node.attr_int("dim", -1), rank)? as usize;
    Ok((x, axis, rank))
}

fn softmax(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let (x, axis, _) = softmax_axis(node, cx)?;
    cx.emit_final(OpKind::Softmax, vec![x], attrs([("axis", Attribute::Int(axis as i64))]));
    Ok(())
}

/// Before opset 13 Softmax flattens to 2-D around `axis`, which only matches
/// the per-axis form when `axis` is the last one.
fn softmax_last_axis(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let (x, axis, rank) = softmax_axis(node, cx)?;
    if axis + 1 != rank {
        return Err(Rejection(format!("axis {axis} is not the last of rank {rank}")));
    }
    cx.emit_final(OpKind::Softmax, vec![x], attrs([("axis", Attribute::Int(axis as i64))]));
    Ok(())
}

fn softmax_transposed(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let (x, axis, rank) = softmax_axis(node, cx)?;
    let mut perm: Vec<i64> = (0..rank as i64).collect();
    perm.swap(axis, rank - 1);
    let moved = cx.emit(OpKind::Transpose, vec![x], attrs([("perm", ints(&perm))]));
    let normalized = cx.emit(OpKind::Softmax, vec![moved], attrs([("axis", Attribute::Int(rank as i64 - 1))]));
    cx.emit_final(OpKind::Transpose, vec![normalized], attrs([("perm", ints(&perm))]));
    Ok(())
}

fn layer_norm_axis(node: &Node, cx: &Lowering<'_>) -> Result<(String, usize, usize), Rejection> {
    let x = cx.input(0)?;
    let rank = cx.rank(&x)?;
    let normalized = node
        .attr_ints("normalized_shape")
        .ok_or_else(|| Rejection::new("missing normalized_shape"))?;
    if normalized.is_empty() || normalized.len() > rank {
        return Err(Rejection(format!("normalized_shape {normalized:?} invalid for rank {rank}")));
    }
    Ok((x, rank - normalized.len(), rank))
}

fn layer_norm_native(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let (x, axis, _) = layer_norm_axis(node, cx)?;
    let mut inputs = vec![x];
    inputs.extend(node.inputs.iter().skip(1).cloned());
    let a = attrs([
        ("axis", Attribute::Int(axis as i64)),
        ("epsilon", Attribute::Float(node.attr_float("eps", 1e-5))),
    ]);
    cx.emit_final(OpKind::LayerNormalization, inputs, a);
    Ok(())
}

fn reduce_mean(cx: &mut Lowering<'_>, x: String, axes: &[i64], suffix: &str) -> String {
    let keep = ("keepdims", Attribute::Int(1));
    if cx.opset() >= 18 {
        let axes = cx.constant_i64(suffix, &[axes.len()], axes);
        cx.emit(OpKind::ReduceMean, vec![x, axes], attrs([keep]))
    } else {
        cx.emit(OpKind::ReduceMean, vec![x], attrs([("axes", ints(axes)), keep]))
    }
}

fn layer_norm_decomposed(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let (x, axis, rank) = layer_norm_axis(node, cx)?;
    let weight = cx.input(1)?;
    let axes: Vec<i64> = (axis as i64..rank as i64).collect();
    let none = Attributes::new;

    let mean = reduce_mean(cx, x.clone(), &axes, "mean_axes");
    let centered = cx.emit(OpKind::Sub, vec![x, mean], none());
    let squared = cx.emit(OpKind::Mul, vec![centered.clone(), centered.clone()], none());
    let variance = reduce_mean(cx, squared, &axes, "variance_axes");
    let epsilon = cx.scalar_f32("epsilon", node.attr_float("eps", 1e-5));
    let shifted = cx.emit(OpKind::Add, vec![variance, epsilon], none());
    let std = cx.emit(OpKind::Sqrt, vec![shifted], none());
    let normalized = cx.emit(OpKind::Div, vec![centered, std], none());
    if node.inputs.len() > 2 {
        let scaled = cx.emit(OpKind::Mul, vec![normalized, weight], none());
        let bias = cx.input(2)?;
        cx.emit_final(OpKind::Add, vec![scaled, bias], none());
    } else {
        cx.emit_final(OpKind::Mul, vec![normalized, weight], none());
    }
    Ok(())
}

fn pad_params(node: &Node, cx: &Lowering<'_>) -> Result<(String, Vec<i64>, &'static str), Rejection> {
    let x = cx.input(0)?;
    let rank = cx.rank(&x)?;
    let torch = node.attr_ints("pad").ok_or_else(|| Rejection::new("missing pad"))?;
    let pads = torch_pads_to_onnx(torch, rank).map_err(Rejection)?;
    if pads.iter().any(|&p| p < 0) {
        return Err(Rejection::new("negative padding (cropping) is not supported"));
    }
    let mode = match node.attr_str("mode", "constant") {
        "constant" => "constant",
        "reflect" => "reflect",
        "replicate" => "edge",
        "circular" if cx.opset() >= 19 => "wrap",
        "circular" => return Err(Rejection::new("circular padding needs Pad mode 'wrap' (opset 19)")),
        other => return Err(Rejection(format!("unknown pad mode '{other}'"))),
    };
    Ok((x, pads, mode))
}

fn pad(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let (x, pads, mode) = pad_params(node, cx)?;
    let pads = cx.constant_i64("pads", &[pads.len()], &pads);
    let mut inputs = vec![x, pads];
    if mode == "constant" {
        inputs.push(cx.scalar_f32("constant_value", node.attr_float("value", 0.0)));
    }
    cx.emit_final(OpKind::Pad, inputs, attrs([("mode", text(mode))]));
    Ok(())
}

fn pad_legacy(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let (x, pads, mode) = pad_params(node, cx)?;
    let a = attrs([
        ("mode", text(mode)),
        ("pads", Attribute::Ints(pads)),
        ("value", Attribute::Float(node.attr_float("value", 0.0))),
    ]);
    cx.emit_final(OpKind::Pad, vec![x], a);
    Ok(())
}
