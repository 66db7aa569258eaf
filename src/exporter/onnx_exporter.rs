use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use prost::Message;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::exporter::{initializers_are_inputs, ir_version_for_opset, onnx, ExporterError};
use crate::ir::{Attribute, DataType, Dim, Graph, Node, Op, Tensor};

pub const PRODUCER_NAME: &str = "traceonnx";

pub struct OnnxExporter;

impl OnnxExporter {
    /// Encodes `graph` as an ONNX `ModelProto`.
    ///
    /// Identical graphs and metadata give identical bytes: initializers,
    /// value infos and metadata are emitted in name order, nodes in graph
    /// order and attributes in name order.
    pub fn encode(graph: &Graph, metadata: &BTreeMap<String, String>) -> Result<Vec<u8>, ExporterError> {
        let ir_version = ir_version_for_opset(graph.opset_version);
        let mut proto_graph = onnx::GraphProto {
            name: Some(graph.name.clone()),
            ..Default::default()
        };

        for (name, tensor) in &graph.weights {
            proto_graph.initializer.push(tensor_proto(name, tensor)?);
        }
        for node in &graph.nodes {
            proto_graph.node.push(node_proto(node)?);
        }
        for input in &graph.inputs {
            proto_graph.input.push(value_info(input)?);
        }
        if initializers_are_inputs(ir_version) {
            for tensor in graph.weights.values() {
                proto_graph.input.push(value_info(tensor)?);
            }
        }
        for output in &graph.outputs {
            proto_graph.output.push(value_info(output)?);
        }
        for info in graph.value_info.values() {
            proto_graph.value_info.push(value_info(info)?);
        }

        let model = onnx::ModelProto {
            ir_version: Some(ir_version),
            opset_import: vec![onnx::OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(graph.opset_version),
            }],
            producer_name: Some(PRODUCER_NAME.to_string()),
            producer_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            graph: Some(proto_graph),
            metadata_props: metadata
                .iter()
                .map(|(key, value)| onnx::StringStringEntryProto {
                    key: Some(key.clone()),
                    value: Some(value.clone()),
                })
                .collect(),
            ..Default::default()
        };

        let mut buf = Vec::with_capacity(model.encoded_len());
        model
            .encode(&mut buf)
            .map_err(|e| ExporterError::SerializationError(e.to_string()))?;
        debug!(bytes = buf.len(), nodes = graph.nodes.len(), "encoded model");
        Ok(buf)
    }

    /// Writes `bytes` to `path` atomically.
    ///
    /// The data goes to a temporary file in the destination directory first,
    /// so a failure never leaves a partial artifact at `path`.
    pub fn write(bytes: &[u8], path: &Path) -> Result<(), ExporterError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let io_err = |source: std::io::Error| ExporterError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = NamedTempFile::new_in(dir).map_err(io_err)?;
        file.write_all(bytes).map_err(io_err)?;
        file.as_file().sync_all().map_err(io_err)?;
        file.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

pub(crate) fn onnx_data_type(data_type: DataType) -> onnx::tensor_proto::DataType {
    use onnx::tensor_proto::DataType as P;
    match data_type {
        DataType::F32 => P::Float,
        DataType::F64 => P::Double,
        DataType::I32 => P::Int32,
        DataType::I64 => P::Int64,
        DataType::U8 => P::Uint8,
    }
}

fn tensor_proto(name: &str, tensor: &Tensor) -> Result<onnx::TensorProto, ExporterError> {
    let dims = tensor
        .shape
        .iter()
        .map(|d| match d {
            Dim::Fixed(v) => Ok(*v as i64),
            Dim::Symbolic(s) => Err(ExporterError::SerializationError(format!(
                "initializer '{name}' has symbolic dim '{s}'"
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let data = tensor
        .data
        .as_ref()
        .ok_or_else(|| ExporterError::SerializationError(format!("initializer '{name}' has no data")))?;
    let expected = dims.iter().product::<i64>() as usize * tensor.data_type.size_in_bytes();
    if data.len() != expected {
        return Err(ExporterError::SerializationError(format!(
            "initializer '{name}' holds {} bytes, shape {:?} of {:?} needs {expected}",
            data.len(),
            dims,
            tensor.data_type
        )));
    }
    Ok(onnx::TensorProto {
        dims,
        data_type: Some(onnx_data_type(tensor.data_type) as i32),
        name: Some(name.to_string()),
        raw_data: Some(data.clone()),
        ..Default::default()
    })
}

fn valid_attribute_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn node_proto(node: &Node) -> Result<onnx::NodeProto, ExporterError> {
    let op = match &node.op {
        Op::Onnx(op) => *op,
        Op::Traced(kind) => {
            return Err(ExporterError::SerializationError(format!(
                "node '{}' still carries traced op '{kind}'",
                node.name
            )))
        }
    };
    let mut attribute = Vec::with_capacity(node.attributes.len());
    for (name, value) in &node.attributes {
        if !valid_attribute_name(name) {
            return Err(ExporterError::SerializationError(format!(
                "node '{}' ({op}) has unencodable attribute name '{name}'",
                node.name
            )));
        }
        attribute.push(attribute_proto(name, value));
    }
    Ok(onnx::NodeProto {
        input: node.inputs.clone(),
        output: node.outputs.clone(),
        name: Some(node.name.clone()),
        op_type: Some(op.as_str().to_string()),
        domain: Some(String::new()),
        attribute,
        ..Default::default()
    })
}

fn attribute_proto(name: &str, value: &Attribute) -> onnx::AttributeProto {
    use onnx::attribute_proto::AttributeType;
    let mut a = onnx::AttributeProto {
        name: Some(name.to_string()),
        ..Default::default()
    };
    let kind = match value {
        Attribute::Float(f) => {
            a.f = Some(*f);
            AttributeType::Float
        }
        Attribute::Int(i) => {
            a.i = Some(*i);
            AttributeType::Int
        }
        Attribute::String(s) => {
            a.s = Some(s.as_bytes().to_vec());
            AttributeType::String
        }
        Attribute::Floats(fs) => {
            a.floats = fs.clone();
            AttributeType::Floats
        }
        Attribute::Ints(is) => {
            a.ints = is.clone();
            AttributeType::Ints
        }
    };
    a.r#type = Some(kind as i32);
    a
}

fn value_info(tensor: &Tensor) -> Result<onnx::ValueInfoProto, ExporterError> {
    use onnx::tensor_shape_proto::{dimension, Dimension};
    let mut dims = Vec::with_capacity(tensor.shape.len());
    for dim in &tensor.shape {
        let value = match dim {
            Dim::Fixed(v) => dimension::Value::DimValue(*v as i64),
            Dim::Symbolic(s) if s.is_empty() => {
                return Err(ExporterError::SerializationError(format!(
                    "'{}' has a symbolic dim with an empty name",
                    tensor.name
                )))
            }
            Dim::Symbolic(s) => dimension::Value::DimParam(s.clone()),
        };
        dims.push(Dimension {
            value: Some(value),
            ..Default::default()
        });
    }
    Ok(onnx::ValueInfoProto {
        name: Some(tensor.name.clone()),
        r#type: Some(onnx::TypeProto {
            value: Some(onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                elem_type: Some(onnx_data_type(tensor.data_type) as i32),
                shape: Some(onnx::TensorShapeProto { dim: dims }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{fixed_shape, OpKind};
    use tempfile::tempdir;

    fn linear_graph() -> Graph {
        let mut graph = Graph::new("linear");
        graph.inputs.push(Tensor::value(
            "x",
            vec![Dim::Symbolic("batch".into()), Dim::Fixed(3)],
            DataType::F32,
        ));
        graph.weights.insert("fc.weight".into(), Tensor::from_f32("fc.weight", &[1, 3], &[1.0, 2.0, 3.0]));
        graph.weights.insert("fc.bias".into(), Tensor::from_f32("fc.bias", &[1], &[0.5]));
        graph.nodes.push(
            Node::new(
                "linear_0/Gemm_0",
                Op::Onnx(OpKind::Gemm),
                vec!["x".into(), "fc.weight".into(), "fc.bias".into()],
                vec!["linear_0_output_0".into()],
            )
            .with_attr("transB", Attribute::Int(1))
            .with_attr("alpha", Attribute::Float(1.0)),
        );
        graph.outputs.push(Tensor::value(
            "linear_0_output_0",
            vec![Dim::Symbolic("batch".into()), Dim::Fixed(1)],
            DataType::F32,
        ));
        graph
    }

    #[test]
    fn test_encode_is_deterministic() {
        let mut metadata = BTreeMap::new();
        metadata.insert("author".to_string(), "tests".to_string());
        let a = OnnxExporter::encode(&linear_graph(), &metadata).unwrap();
        let b = OnnxExporter::encode(&linear_graph(), &metadata).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_ir_3_declares_initializers_as_inputs() {
        let mut graph = linear_graph();
        graph.opset_version = 8;
        let bytes = OnnxExporter::encode(&graph, &BTreeMap::new()).unwrap();
        let model = onnx::ModelProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(model.ir_version, Some(3));
        let inputs: Vec<_> = model.graph.unwrap().input.iter().map(|i| i.name.clone().unwrap()).collect();
        assert_eq!(inputs, ["x", "fc.bias", "fc.weight"]);

        let decoded = crate::exporter::OnnxImporter::decode(&bytes).unwrap();
        assert_eq!(decoded.graph.inputs, graph.inputs);
        assert_eq!(decoded.graph.weights.len(), 2);
    }

    #[test]
    fn test_encode_sorts_initializers_and_attributes() {
        let bytes = OnnxExporter::encode(&linear_graph(), &BTreeMap::new()).unwrap();
        let model = onnx::ModelProto::decode(bytes.as_slice()).unwrap();
        assert_eq!(model.ir_version, Some(8));
        assert_eq!(model.opset_import[0].version, Some(17));
        let graph = model.graph.unwrap();
        let names: Vec<_> = graph.initializer.iter().map(|t| t.name.clone().unwrap()).collect();
        assert_eq!(names, ["fc.bias", "fc.weight"]);
        let attrs: Vec<_> = graph.node[0].attribute.iter().map(|a| a.name.clone().unwrap()).collect();
        assert_eq!(attrs, ["alpha", "transB"]);
    }

    #[test]
    fn test_traced_node_is_unencodable() {
        let mut graph = linear_graph();
        graph.nodes[0].op = Op::Traced("linear".into());
        let err = OnnxExporter::encode(&graph, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ExporterError::SerializationError(ref m) if m.contains("linear_0/Gemm_0")));
    }

    #[test]
    fn test_bad_initializer_and_attribute_names_are_rejected() {
        let mut graph = linear_graph();
        graph.weights.get_mut("fc.bias").unwrap().data = Some(vec![0; 3]);
        assert!(OnnxExporter::encode(&graph, &BTreeMap::new()).is_err());

        let mut graph = linear_graph();
        graph.nodes[0].attributes.insert("bad name".into(), Attribute::Int(0));
        assert!(OnnxExporter::encode(&graph, &BTreeMap::new()).is_err());

        let mut graph = linear_graph();
        graph.inputs[0].shape[0] = Dim::Symbolic(String::new());
        assert!(OnnxExporter::encode(&graph, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_write_is_atomic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        OnnxExporter::write(b"first", &path).unwrap();
        OnnxExporter::write(b"second", &path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_write_into_missing_directory_fails_cleanly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("model.onnx");
        assert!(matches!(OnnxExporter::write(b"x", &path), Err(ExporterError::Io { .. })));
        assert!(!path.exists());
    }

    #[test]
    fn test_value_info_keeps_symbols() {
        let mut graph = linear_graph();
        graph.outputs[0].shape = fixed_shape(&[1, 1]);
        let bytes = OnnxExporter::encode(&graph, &BTreeMap::new()).unwrap();
        let model = onnx::ModelProto::decode(bytes.as_slice()).unwrap();
        let input = &model.graph.unwrap().input[0];
        let Some(onnx::type_proto::Value::TensorType(t)) = input.r#type.as_ref().and_then(|t| t.value.clone()) else {
            panic!("input has no tensor type");
        };
        let dims = t.shape.unwrap().dim;
        assert_eq!(
            dims[0].value,
            Some(onnx::tensor_shape_proto::dimension::Value::DimParam("batch".into()))
        );
    }
}
