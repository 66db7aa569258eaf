//! Property-based tests for the export pipeline.
//!
//! Key invariants:
//! - Exporting the same model twice yields identical bytes
//! - A declared batch symbol survives to the graph output
//! - Topological sorting restores a valid order from any node permutation
//! - Config TOML round-trip is lossless

use proptest::prelude::*;
use traceonnx::ir::{DataType, Dim, Graph, Node, Op, OpKind, Tensor};
use traceonnx::{DynamicAxis, ExportConfig, Exporter, Layer, OnnxImporter, SampleInput, Sequential, WeightStore};

fn activation() -> impl Strategy<Value = Layer> {
    prop_oneof![
        Just(Layer::Relu),
        Just(Layer::Sigmoid),
        Just(Layer::Tanh),
        Just(Layer::Silu),
        Just(Layer::Gelu { approximate: "none".into() }),
        Just(Layer::Softmax(-1)),
    ]
}

fn weights(out: usize) -> WeightStore {
    WeightStore::builder()
        .insert_f32("fc.weight", &[out, 3], (0..out * 3).map(|i| ((i as f32) * 0.7).sin()).collect())
        .unwrap()
        .insert_f32("fc.bias", &[out], vec![0.05; out])
        .unwrap()
        .build()
}

fn chain_graph(len: usize) -> Graph {
    let mut graph = Graph::new("chain");
    graph.inputs.push(Tensor::value("v0", vec![Dim::Fixed(2)], DataType::F32));
    for i in 0..len {
        graph.nodes.push(Node::new(
            format!("n{i}"),
            Op::Onnx(OpKind::Relu),
            vec![format!("v{i}")],
            vec![format!("v{}", i + 1)],
        ));
    }
    graph.outputs.push(Tensor::value(format!("v{len}"), vec![Dim::Fixed(2)], DataType::F32));
    graph
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Same model, same config, same bytes; the batch symbol reaches the output.
    #[test]
    fn mlp_export_is_deterministic(
        layers in prop::collection::vec(activation(), 0..4),
        batch in 1usize..4,
        out in 1usize..6,
        seed in any::<u64>(),
    ) {
        let mut model = Sequential::new("mlp").with(Layer::linear("fc"));
        for layer in layers {
            model = model.with(layer);
        }
        let config = ExportConfig {
            seed,
            dynamic_axes: vec![DynamicAxis::new("x", 0).named("batch")],
            ..Default::default()
        };
        let exporter = Exporter::new(config).unwrap();
        let inputs = [SampleInput::f32("x", &[batch, 3])];
        let weights = weights(out);

        let (first, report) = exporter.export_to_bytes(&model, &weights, &inputs).unwrap();
        let (second, _) = exporter.export_to_bytes(&model, &weights, &inputs).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert!(report.validation.is_within_tolerance());

        let decoded = OnnxImporter::decode(&first).unwrap();
        prop_assert_eq!(
            &decoded.graph.outputs[0].shape,
            &vec![Dim::Symbolic("batch".into()), Dim::Fixed(out)]
        );
    }

    /// Any permutation of a chain sorts back into the chain.
    #[test]
    fn sort_restores_chain_order(order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle()) {
        let mut graph = chain_graph(8);
        let shuffled: Vec<Node> = order.iter().map(|&i| graph.nodes[i].clone()).collect();
        graph.nodes = shuffled;
        graph.sort_topologically().unwrap();
        prop_assert!(graph.validate_topology().is_ok());
        let names: Vec<String> = graph.nodes.iter().map(|n| n.name.clone()).collect();
        let expected: Vec<String> = (0..8).map(|i| format!("n{i}")).collect();
        prop_assert_eq!(names, expected);
    }

    #[test]
    fn config_toml_roundtrip(
        opset in 7i64..=21,
        seed in 0u64..(i64::MAX as u64),
        optimize in any::<bool>(),
        name in "[a-z][a-z0-9_]{0,12}",
    ) {
        let config = ExportConfig {
            opset_version: opset,
            seed,
            optimize,
            output_names: vec![name.clone()],
            dynamic_axes: vec![DynamicAxis::new(name, 0)],
            ..Default::default()
        };
        let parsed = ExportConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        prop_assert_eq!(parsed, config);
    }
}
