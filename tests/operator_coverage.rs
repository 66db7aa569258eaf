//! Every built-in traced kind must lower, validate and keep its traced shape.

use traceonnx::ir::fixed_shape;
use traceonnx::tracer::{GraphTracer, PaddingMode, Pool2dOptions, TraceError};
use traceonnx::{ExportConfig, Exporter, Layer, Model, OnnxImporter, SampleInput, Sequential, TraceContext, Value, WeightStore};

struct FnModel(fn(&mut TraceContext<'_>, &[Value]) -> Result<Vec<Value>, TraceError>);

impl Model for FnModel {
    fn forward(&self, cx: &mut TraceContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, TraceError> {
        (self.0)(cx, inputs)
    }
}

fn weights() -> WeightStore {
    let ramp = |n: usize| (0..n).map(|i| ((i as f32) * 0.61).cos() * 0.4).collect::<Vec<_>>();
    WeightStore::builder()
        .insert_f32("fc.weight", &[5, 8], ramp(40))
        .unwrap()
        .insert_f32("fc.bias", &[5], ramp(5))
        .unwrap()
        .insert_f32("conv.weight", &[4, 2, 3, 3], ramp(72))
        .unwrap()
        .insert_f32("conv.bias", &[4], ramp(4))
        .unwrap()
        .insert_f32("bn.weight", &[2], vec![1.2, 0.8])
        .unwrap()
        .insert_f32("bn.bias", &[2], vec![0.0, 0.1])
        .unwrap()
        .insert_f32("bn.running_mean", &[2], vec![0.05, -0.05])
        .unwrap()
        .insert_f32("bn.running_var", &[2], vec![1.0, 0.5])
        .unwrap()
        .insert_f32("ln.weight", &[8], ramp(8).iter().map(|v| v + 1.0).collect())
        .unwrap()
        .insert_f32("ln.bias", &[8], ramp(8))
        .unwrap()
        .insert_f32("proj", &[8, 3], ramp(24))
        .unwrap()
        .build()
}

/// Exports at `opset`, then checks the decoded output shapes against a fresh trace.
fn assert_exports<M: Model>(label: &str, model: &M, inputs: &[SampleInput], opset: i64) {
    let weights = weights();
    let config = ExportConfig {
        opset_version: opset,
        edge_case_samples: false,
        ..Default::default()
    };
    let (bytes, report) = Exporter::new(config)
        .unwrap()
        .export_to_bytes(model, &weights, inputs)
        .unwrap_or_else(|e| panic!("{label} at opset {opset}: {e}"));
    assert!(report.validation.is_within_tolerance(), "{label}: {:?}", report.validation);

    let decoded = OnnxImporter::decode(&bytes).unwrap();
    let samples: Vec<_> = inputs
        .iter()
        .map(|i| traceonnx::TensorData::full(i.shape.clone(), 0.5))
        .collect();
    let trace = GraphTracer::trace(model, &weights, &decoded.graph.inputs, &samples).unwrap();
    for (exported, traced) in decoded.graph.outputs.iter().zip(&trace.graph.outputs) {
        let expected = trace.values[&traced.name].shape();
        assert_eq!(exported.shape, fixed_shape(expected), "{label} at opset {opset}");
    }
}

fn sequential(label: &str, layer: Layer, shape: &[usize]) {
    let model = Sequential::new(label).with(layer);
    for opset in [13, 17] {
        assert_exports(label, &model, &[SampleInput::f32("x", shape)], opset);
    }
}

#[test]
fn test_dense_layers() {
    sequential("linear", Layer::linear("fc"), &[2, 3, 8]);
    sequential(
        "layer_norm",
        Layer::LayerNorm {
            prefix: "ln".into(),
            normalized_shape: vec![8],
            eps: 1e-5,
        },
        &[2, 8],
    );
    sequential("dropout", Layer::Dropout(0.1), &[2, 8]);
}

#[test]
fn test_activations() {
    for (label, layer) in [
        ("relu", Layer::Relu),
        ("sigmoid", Layer::Sigmoid),
        ("tanh", Layer::Tanh),
        ("silu", Layer::Silu),
        ("gelu", Layer::Gelu { approximate: "none".into() }),
        ("gelu_tanh", Layer::Gelu { approximate: "tanh".into() }),
        ("softmax", Layer::Softmax(-1)),
        ("softmax_axis0", Layer::Softmax(0)),
    ] {
        sequential(label, layer, &[3, 4]);
    }
}

#[test]
fn test_spatial_layers() {
    let conv = traceonnx::tracer::Conv2dOptions {
        padding: [1, 1],
        stride: [2, 2],
        ..Default::default()
    };
    sequential("conv2d", Layer::conv2d("conv", conv), &[1, 2, 7, 6]);
    let reflect = traceonnx::tracer::Conv2dOptions {
        padding: [1, 1],
        padding_mode: PaddingMode::Reflect,
        ..Default::default()
    };
    sequential("conv2d_reflect", Layer::conv2d("conv", reflect), &[1, 2, 5, 5]);
    sequential(
        "batch_norm2d",
        Layer::BatchNorm2d {
            prefix: "bn".into(),
            eps: 1e-5,
        },
        &[2, 2, 3, 3],
    );

    let mut pool = Pool2dOptions::new([2, 2]);
    pool.ceil_mode = true;
    sequential("max_pool2d", Layer::MaxPool2d(pool.clone()), &[1, 2, 5, 5]);
    sequential("avg_pool2d", Layer::AvgPool2d(pool), &[1, 2, 5, 5]);
    let mut padded = Pool2dOptions::new([3, 3]);
    padded.padding = [1, 1];
    padded.stride = [1, 1];
    padded.count_include_pad = false;
    sequential("avg_pool2d_padded", Layer::AvgPool2d(padded), &[1, 1, 4, 4]);
    sequential("adaptive_global", Layer::AdaptiveAvgPool2d([1, 1]), &[1, 2, 4, 6]);
    sequential("adaptive_window", Layer::AdaptiveAvgPool2d([2, 3]), &[1, 2, 4, 6]);
    sequential("upsample", Layer::UpsampleNearest2d([2.0, 2.0]), &[1, 1, 2, 3]);
}

#[test]
fn test_shape_layers() {
    sequential("flatten", Layer::Flatten { start_dim: 1, end_dim: -1 }, &[2, 3, 4]);
    sequential("flatten_middle", Layer::Flatten { start_dim: 1, end_dim: 2 }, &[2, 3, 4, 5]);
    sequential("reshape", Layer::Reshape(vec![-1, 6]), &[2, 3, 4]);
    sequential("permute", Layer::Permute(vec![0, 2, 1]), &[2, 3, 4]);
    for mode in [PaddingMode::Zeros, PaddingMode::Reflect, PaddingMode::Replicate] {
        sequential(
            "pad",
            Layer::Pad {
                pad: vec![1, 2, 0, 1],
                mode,
                value: 0.5,
            },
            &[1, 3, 4],
        );
    }
    sequential("residual", Layer::Residual(vec![Layer::Relu, Layer::Tanh]), &[2, 4]);
}

#[test]
fn test_binary_and_multi_input_kinds() {
    let inputs = [SampleInput::f32("a", &[2, 8]), SampleInput::f32("b", &[2, 8])];
    let model = FnModel(|cx, inputs| {
        let sum = cx.add(&inputs[0], &inputs[1])?;
        let diff = cx.sub(&sum, &inputs[1])?;
        let prod = cx.mul(&diff, &inputs[0])?;
        let two = cx.constant("two", traceonnx::TensorData::scalar(2.0));
        let half = cx.div(&prod, &two)?;
        let proj = cx.param("proj")?;
        let projected = cx.matmul(&half, &proj)?;
        let joined = cx.cat(&[&projected, &projected], 1)?;
        Ok(vec![joined, sum])
    });
    for opset in [13, 17] {
        assert_exports("binary", &model, &inputs, opset);
    }
}

#[test]
fn test_pass_through_output_gets_identity() {
    let model = FnModel(|cx, inputs| {
        let h = cx.relu(&inputs[0])?;
        Ok(vec![h.clone(), inputs[0].clone(), h])
    });
    assert_exports("identity", &model, &[SampleInput::f32("x", &[2, 2])], 17);
}

#[test]
fn test_legacy_opset_encodings() {
    sequential_at("softmax_axis0", Layer::Softmax(0), &[3, 4], 11);
    sequential_at(
        "layer_norm",
        Layer::LayerNorm {
            prefix: "ln".into(),
            normalized_shape: vec![8],
            eps: 1e-5,
        },
        &[2, 8],
        11,
    );
    sequential_at(
        "pad",
        Layer::Pad {
            pad: vec![1, 1],
            mode: PaddingMode::Zeros,
            value: 0.0,
        },
        &[1, 4],
        9,
    );
    for (label, padding_mode) in [("conv2d_reflect", PaddingMode::Reflect), ("conv2d_replicate", PaddingMode::Replicate)] {
        let options = traceonnx::tracer::Conv2dOptions {
            padding: [1, 2],
            padding_mode,
            ..Default::default()
        };
        for opset in [7, 10] {
            sequential_at(label, Layer::conv2d("conv", options.clone()), &[1, 2, 5, 5], opset);
        }
    }
}

#[test]
fn test_ceil_mode_pool_with_window_in_padding_is_versioned() {
    let mut pool = Pool2dOptions::new([2, 2]);
    pool.padding = [1, 1];
    pool.ceil_mode = true;
    let model = Sequential::new("pool").with(Layer::AvgPool2d(pool.clone()));
    let inputs = [SampleInput::f32("x", &[1, 2, 5, 5])];
    let config = ExportConfig {
        edge_case_samples: false,
        ..Default::default()
    };
    let err = Exporter::new(config).unwrap().export_to_bytes(&model, &weights(), &inputs).unwrap_err();
    assert!(err.to_string().contains("opset 19"), "{err}");
    sequential_at("avg_pool2d_ceil", Layer::AvgPool2d(pool), &[1, 2, 5, 5], 19);
}

fn sequential_at(label: &str, layer: Layer, shape: &[usize], opset: i64) {
    let model = Sequential::new(label).with(layer);
    assert_exports(label, &model, &[SampleInput::f32("x", shape)], opset);
}
