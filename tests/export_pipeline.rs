use std::collections::BTreeMap;

use tempfile::TempDir;
use traceonnx::ir::{fixed_shape, Attributes, Dim, Node, Op, OpKind};
use traceonnx::mapper::{Lowering, Mapping, MappingTable, Rejection};
use traceonnx::pipeline::{ExportError, ExportOutcome, ExportWarning};
use traceonnx::tracer::{BranchCondition, TraceError};
use traceonnx::verifier::VerifierError;
use traceonnx::{
    DynamicAxis, ExportConfig, Exporter, Layer, Model, OnnxImporter, SampleInput, Sequential, TensorData, TraceContext,
    Value, WeightStore,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn values(n: usize, scale: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32) * 0.37).sin() * scale).collect()
}

fn linear_weights() -> WeightStore {
    WeightStore::builder()
        .insert_f32("fc.weight", &[4, 3], values(12, 0.5))
        .unwrap()
        .insert_f32("fc.bias", &[4], vec![0.1, -0.2, 0.3, -0.4])
        .unwrap()
        .build()
}

fn config_in(dir: &TempDir, file: &str) -> ExportConfig {
    ExportConfig {
        output_path: dir.path().join(file),
        ..Default::default()
    }
}

/// Model defined by a plain function.
struct FnModel(fn(&mut TraceContext<'_>, &[Value]) -> Result<Vec<Value>, TraceError>);

impl Model for FnModel {
    fn forward(&self, cx: &mut TraceContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, TraceError> {
        (self.0)(cx, inputs)
    }
}

#[test]
fn test_linear_exports_as_single_gemm() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let model = Sequential::new("mlp").with(Layer::linear("fc"));
    let report = Exporter::new(config_in(&dir, "linear.onnx"))
        .unwrap()
        .export(&model, &linear_weights(), &[SampleInput::f32("x", &[1, 3])])
        .unwrap();

    assert!(report.validation.max_abs() < 1e-6);
    assert_eq!(report.node_count, 1);
    assert_eq!(report.sha256.len(), 64);

    let bytes = std::fs::read(dir.path().join("linear.onnx")).unwrap();
    assert_eq!(bytes.len() as u64, report.bytes_written);
    let decoded = OnnxImporter::decode(&bytes).unwrap();
    assert_eq!(decoded.graph.opset_version, 17);
    assert_eq!(decoded.graph.nodes.len(), 1);
    assert_eq!(decoded.graph.nodes[0].op, Op::Onnx(OpKind::Gemm));
    assert_eq!(decoded.graph.outputs[0].shape, fixed_shape(&[1, 4]));
}

#[test]
fn test_export_is_byte_deterministic() {
    let dir = TempDir::new().unwrap();
    let model = Sequential::new("mlp").with(Layer::linear("fc")).with(Layer::Relu);
    let weights = linear_weights();
    let inputs = [SampleInput::f32("x", &[2, 3])];

    let a = Exporter::new(config_in(&dir, "a.onnx")).unwrap().export(&model, &weights, &inputs).unwrap();
    let b = Exporter::new(config_in(&dir, "b.onnx")).unwrap().export(&model, &weights, &inputs).unwrap();

    assert_eq!(a.sha256, b.sha256);
    assert_eq!(
        std::fs::read(dir.path().join("a.onnx")).unwrap(),
        std::fs::read(dir.path().join("b.onnx")).unwrap()
    );
}

#[test]
fn test_decoded_artifact_reproduces_model_outputs() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir, "m.onnx");
    config.metadata.insert("task".into(), "regression".into());
    let model = Sequential::new("mlp").with(Layer::linear("fc")).with(Layer::Tanh);
    let weights = linear_weights();
    Exporter::new(config)
        .unwrap()
        .export(&model, &weights, &[SampleInput::f32("x", &[2, 3])])
        .unwrap();

    let decoded = OnnxImporter::decode(&std::fs::read(dir.path().join("m.onnx")).unwrap()).unwrap();
    assert_eq!(decoded.metadata["task"], "regression");
    assert_eq!(decoded.producer_name, "traceonnx");

    let x = TensorData::new(vec![2, 3], vec![0.5, -1.0, 2.0, 0.0, 0.25, -0.75]).unwrap();
    let mut feeds = BTreeMap::new();
    feeds.insert("x".to_string(), x.clone());
    let exported = traceonnx::runtime::Interpreter::new(&decoded.graph).run_outputs(&feeds).unwrap();

    let trace = traceonnx::tracer::GraphTracer::trace(&model, &weights, &decoded.graph.inputs, &[x]).unwrap();
    let traced = &trace.values[&trace.graph.outputs[0].name];
    for (a, b) in exported[0].1.data().iter().zip(traced.data()) {
        assert!((a - b).abs() < 1e-6);
    }
}

#[test]
fn test_tensor_branch_fails_without_writing() {
    let dir = TempDir::new().unwrap();
    let model = FnModel(|cx, inputs| {
        let h = cx.relu(&inputs[0])?;
        if cx.branch("all_positive", BranchCondition::Tensor(h.clone()))? {
            return Ok(vec![h]);
        }
        Ok(vec![cx.sigmoid(&h)?])
    });
    let err = Exporter::new(config_in(&dir, "never.onnx"))
        .unwrap()
        .export(&model, &WeightStore::default(), &[SampleInput::f32("x", &[1, 2])])
        .unwrap_err();

    match &err {
        ExportError::Trace(TraceError::DynamicControlFlow { branch, producer, .. }) => {
            assert_eq!(branch, "all_positive");
            assert_eq!(producer.as_deref(), Some("relu_0"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.outcome(), ExportOutcome::Failed);
    assert!(!dir.path().join("never.onnx").exists());
}

#[test]
fn test_weight_shadowing_an_input_fails_without_writing() {
    let dir = TempDir::new().unwrap();
    let model = FnModel(|cx, inputs| {
        let offset = cx.param("x")?;
        Ok(vec![cx.add(&inputs[0], &offset)?])
    });
    let weights = WeightStore::builder().insert_f32("x", &[1, 2], vec![10.0, 10.0]).unwrap().build();
    let err = Exporter::new(config_in(&dir, "shadowed.onnx"))
        .unwrap()
        .export(&model, &weights, &[SampleInput::f32("x", &[1, 2])])
        .unwrap_err();
    assert!(matches!(&err, ExportError::Trace(TraceError::NameCollision(name)) if name == "x"));
    assert_eq!(err.outcome(), ExportOutcome::Failed);
    assert!(!dir.path().join("shadowed.onnx").exists());
}

#[test]
fn test_static_branch_is_reported() {
    let dir = TempDir::new().unwrap();
    let model = FnModel(|cx, inputs| {
        let h = cx.relu(&inputs[0])?;
        if cx.branch("use_sigmoid", BranchCondition::Static(false))? {
            return Ok(vec![cx.sigmoid(&h)?]);
        }
        Ok(vec![h])
    });
    let report = Exporter::new(config_in(&dir, "s.onnx"))
        .unwrap()
        .export(&model, &WeightStore::default(), &[SampleInput::f32("x", &[1, 2])])
        .unwrap();
    assert!(report
        .warnings
        .iter()
        .any(|w| matches!(w, ExportWarning::Trace(_)) && w.to_string().contains("use_sigmoid")));
}

#[test]
fn test_shared_batch_symbol_flows_to_output() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir, "sum.onnx");
    config.dynamic_axes = vec![
        DynamicAxis::new("a", 0).named("batch"),
        DynamicAxis::new("b", 0).named("batch"),
    ];
    let model = FnModel(|cx, inputs| Ok(vec![cx.add(&inputs[0], &inputs[1])?]));
    let report = Exporter::new(config)
        .unwrap()
        .export(
            &model,
            &WeightStore::default(),
            &[SampleInput::f32("a", &[2, 3]), SampleInput::f32("b", &[2, 3])],
        )
        .unwrap();
    assert!(report.validation.samples.len() >= 2);

    let decoded = OnnxImporter::decode(&std::fs::read(dir.path().join("sum.onnx")).unwrap()).unwrap();
    let batch = Dim::Symbolic("batch".into());
    assert_eq!(decoded.graph.inputs[0].shape, vec![batch.clone(), Dim::Fixed(3)]);
    assert_eq!(decoded.graph.inputs[1].shape, vec![batch.clone(), Dim::Fixed(3)]);
    assert_eq!(decoded.graph.outputs[0].shape, vec![batch, Dim::Fixed(3)]);
}

fn sigmoid_doubled(_node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
    let x = cx.input(0)?;
    let s = cx.emit(OpKind::Sigmoid, vec![x], Attributes::new());
    let two = cx.scalar_f32("two", 2.0);
    cx.emit_final(OpKind::Mul, vec![s, two], Attributes::new());
    Ok(())
}

#[test]
fn test_divergent_mapping_is_replaced_by_next_candidate() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let mut table = MappingTable::default();
    table.register_preferred(
        "sigmoid",
        Mapping {
            encoding: "Sigmoid doubled",
            min_opset: 7,
            max_opset: None,
            supported_attrs: &[],
            lower: sigmoid_doubled,
        },
    );
    let model = Sequential::new("m").with(Layer::linear("fc")).with(Layer::Sigmoid);
    let report = Exporter::new(config_in(&dir, "remapped.onnx"))
        .unwrap()
        .with_table(table)
        .export(&model, &linear_weights(), &[SampleInput::f32("x", &[2, 3])])
        .unwrap();

    assert_eq!(report.remaps.len(), 1);
    assert_eq!(report.remaps[0].node, "sigmoid_0");
    assert_eq!(report.remaps[0].from, "Sigmoid doubled");
    assert_eq!(report.remaps[0].to, "Sigmoid");
    assert_eq!(report.encodings["sigmoid_0"], "Sigmoid");
    assert!(report.validation.is_within_tolerance());
}

#[test]
fn test_divergence_without_alternatives_fails_validation() {
    let dir = TempDir::new().unwrap();
    let mut table = MappingTable::empty();
    let sigmoid = Mapping {
        encoding: "Sigmoid doubled",
        min_opset: 7,
        max_opset: None,
        supported_attrs: &[],
        lower: sigmoid_doubled,
    };
    table.register("sigmoid", sigmoid);
    let model = Sequential::new("m").with(Layer::Sigmoid);
    let inputs = [SampleInput::f32("x", &[1, 4])];

    let err = Exporter::new(config_in(&dir, "bad.onnx"))
        .unwrap()
        .with_table(table.clone())
        .export(&model, &WeightStore::default(), &inputs)
        .unwrap_err();
    assert!(matches!(err, ExportError::Verifier(VerifierError::NumericalDivergence { .. })));
    assert_eq!(err.outcome(), ExportOutcome::ValidationFailed);
    assert_eq!(err.outcome().exit_code(), 2);
    assert!(!dir.path().join("bad.onnx").exists());

    let mut config = config_in(&dir, "accepted.onnx");
    config.allow_divergence = true;
    let report = Exporter::new(config)
        .unwrap()
        .with_table(table)
        .export(&model, &WeightStore::default(), &inputs)
        .unwrap();
    assert!(report.warnings.iter().any(|w| matches!(w, ExportWarning::AllowedDivergence(_))));
    assert!(dir.path().join("accepted.onnx").exists());
}

#[test]
fn test_custom_operator_needs_a_registered_mapping() {
    let dir = TempDir::new().unwrap();
    let model = FnModel(|cx, inputs| {
        let y = cx.call_custom("swish", &[&inputs[0]], Attributes::new(), |args, _| {
            let x = args[0];
            TensorData::new(
                x.shape().to_vec(),
                x.data().iter().map(|&v| v / (1.0 + (-v).exp())).collect(),
            )
        })?;
        Ok(vec![y])
    });
    let inputs = [SampleInput::f32("x", &[2, 2])];

    let err = Exporter::new(config_in(&dir, "swish.onnx"))
        .unwrap()
        .export(&model, &WeightStore::default(), &inputs)
        .unwrap_err();
    assert!(matches!(err, ExportError::Mapper(_)));
    assert!(err.to_string().contains("swish"));

    fn swish(_node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
        let x = cx.input(0)?;
        let s = cx.emit(OpKind::Sigmoid, vec![x.clone()], Attributes::new());
        cx.emit_final(OpKind::Mul, vec![x, s], Attributes::new());
        Ok(())
    }
    let mut table = MappingTable::default();
    table.register(
        "swish",
        Mapping {
            encoding: "Sigmoid+Mul",
            min_opset: 7,
            max_opset: None,
            supported_attrs: &[],
            lower: swish,
        },
    );
    let report = Exporter::new(config_in(&dir, "swish.onnx"))
        .unwrap()
        .with_table(table)
        .export(&model, &WeightStore::default(), &inputs)
        .unwrap();
    assert_eq!(report.node_count, 2);
    assert!(report.validation.max_abs() < 1e-6);
}

#[test]
fn test_circular_padding_requires_opset_19() {
    let dir = TempDir::new().unwrap();
    let model = Sequential::new("m").with(Layer::Pad {
        pad: vec![1, 1],
        mode: traceonnx::tracer::PaddingMode::Circular,
        value: 0.0,
    });
    let inputs = [SampleInput::f32("x", &[1, 2, 4])];

    let err = Exporter::new(config_in(&dir, "pad17.onnx"))
        .unwrap()
        .export(&model, &WeightStore::default(), &inputs)
        .unwrap_err();
    match err {
        ExportError::Mapper(e) => assert!(e.to_string().contains("opset 19")),
        other => panic!("unexpected error: {other}"),
    }

    let mut config = config_in(&dir, "pad19.onnx");
    config.opset_version = 19;
    let report = Exporter::new(config)
        .unwrap()
        .export(&model, &WeightStore::default(), &inputs)
        .unwrap();
    assert_eq!(report.opset_version, 19);
    let decoded = OnnxImporter::decode(&std::fs::read(dir.path().join("pad19.onnx")).unwrap()).unwrap();
    assert_eq!(decoded.ir_version, 9);
    assert_eq!(decoded.graph.outputs[0].shape, fixed_shape(&[1, 2, 6]));
}

#[test]
fn test_conv_batch_norm_is_fused() {
    let dir = TempDir::new().unwrap();
    let weights = WeightStore::builder()
        .insert_f32("conv.weight", &[2, 1, 3, 3], values(18, 0.3))
        .unwrap()
        .insert_f32("conv.bias", &[2], vec![0.05, -0.05])
        .unwrap()
        .insert_f32("bn.weight", &[2], vec![1.5, 0.5])
        .unwrap()
        .insert_f32("bn.bias", &[2], vec![0.1, 0.2])
        .unwrap()
        .insert_f32("bn.running_mean", &[2], vec![0.01, -0.02])
        .unwrap()
        .insert_f32("bn.running_var", &[2], vec![0.9, 1.1])
        .unwrap()
        .build();
    let model = Sequential::new("cnn")
        .with(Layer::conv2d(
            "conv",
            traceonnx::tracer::Conv2dOptions {
                padding: [1, 1],
                ..Default::default()
            },
        ))
        .with(Layer::BatchNorm2d {
            prefix: "bn".into(),
            eps: 1e-5,
        })
        .with(Layer::Relu);
    let report = Exporter::new(config_in(&dir, "cnn.onnx"))
        .unwrap()
        .export(&model, &weights, &[SampleInput::f32("x", &[1, 1, 5, 5])])
        .unwrap();

    let decoded = OnnxImporter::decode(&std::fs::read(dir.path().join("cnn.onnx")).unwrap()).unwrap();
    let ops: Vec<_> = decoded.graph.nodes.iter().map(|n| n.op.clone()).collect();
    assert_eq!(ops, vec![Op::Onnx(OpKind::Conv), Op::Onnx(OpKind::Relu)]);
    assert!(decoded.graph.weights.contains_key("conv2d_0/Conv_0/fused_weight"));
    assert!(!decoded.graph.weights.contains_key("bn.running_var"));
    assert!(report.validation.max_abs() < 1e-4);
}

#[test]
fn test_concurrent_exports_agree() {
    let model = Sequential::new("mlp").with(Layer::linear("fc")).with(Layer::Silu);
    let weights = linear_weights();
    let exporter = Exporter::new(ExportConfig::default()).unwrap();
    let inputs = [SampleInput::f32("x", &[3, 3])];

    let (exporter, model, weights, inputs) = (&exporter, &model, &weights, &inputs);
    let digests: Vec<String> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(move || exporter.export_to_bytes(model, weights, inputs).unwrap().1.sha256))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(digests.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_missing_output_directory_is_an_io_error() {
    let dir = TempDir::new().unwrap();
    let config = ExportConfig {
        output_path: dir.path().join("missing").join("m.onnx"),
        ..Default::default()
    };
    let model = Sequential::new("m").with(Layer::Relu);
    let err = Exporter::new(config)
        .unwrap()
        .export(&model, &WeightStore::default(), &[SampleInput::f32("x", &[1, 2])])
        .unwrap_err();
    assert!(matches!(err, ExportError::Exporter(_)));
    assert_eq!(err.outcome(), ExportOutcome::Failed);
}

#[test]
fn test_invalid_config_is_rejected_up_front() {
    let config = ExportConfig {
        opset_version: 3,
        ..Default::default()
    };
    assert!(matches!(Exporter::new(config), Err(ExportError::Config(_))));
}
