use std::collections::BTreeMap;

use prost::Message;

use crate::exporter::{onnx, ExporterError};
use crate::ir::{Attribute, DataType, Dim, Graph, Node, Op, OpKind, Tensor};

/// A decoded artifact.
#[derive(Debug, Clone)]
pub struct DecodedModel {
    pub graph: Graph,
    pub ir_version: i64,
    pub producer_name: String,
    pub metadata: BTreeMap<String, String>,
}

pub struct OnnxImporter;

impl OnnxImporter {
    /// Decodes an artifact produced by [`OnnxExporter`](crate::exporter::OnnxExporter).
    pub fn decode(bytes: &[u8]) -> Result<DecodedModel, ExporterError> {
        let model = onnx::ModelProto::decode(bytes).map_err(|e| ExporterError::Deserialization(e.to_string()))?;
        let proto = model
            .graph
            .ok_or_else(|| ExporterError::Deserialization("model has no graph".to_string()))?;

        let mut graph = Graph::new(proto.name.unwrap_or_default());
        graph.opset_version = model
            .opset_import
            .iter()
            .find(|o| matches!(o.domain.as_deref(), None | Some("") | Some("ai.onnx")))
            .and_then(|o| o.version)
            .ok_or_else(|| ExporterError::Deserialization("no default-domain opset import".to_string()))?;

        for tensor in proto.initializer {
            let tensor = tensor_from_proto(tensor)?;
            graph.weights.insert(tensor.name.clone(), tensor);
        }
        for node in proto.node {
            graph.nodes.push(node_from_proto(node)?);
        }
        for info in proto.input {
            let input = value_from_proto(info)?;
            // IR 3 repeats initializers among the inputs.
            if !graph.weights.contains_key(&input.name) {
                graph.inputs.push(input);
            }
        }
        for info in proto.output {
            graph.outputs.push(value_from_proto(info)?);
        }
        for info in proto.value_info {
            let tensor = value_from_proto(info)?;
            graph.value_info.insert(tensor.name.clone(), tensor);
        }

        Ok(DecodedModel {
            graph,
            ir_version: model.ir_version.unwrap_or_default(),
            producer_name: model.producer_name.unwrap_or_default(),
            metadata: model
                .metadata_props
                .into_iter()
                .map(|e| (e.key.unwrap_or_default(), e.value.unwrap_or_default()))
                .collect(),
        })
    }
}

fn data_type(code: i32, what: &str) -> Result<DataType, ExporterError> {
    use onnx::tensor_proto::DataType as P;
    match P::try_from(code).ok() {
        Some(P::Float) => Ok(DataType::F32),
        Some(P::Double) => Ok(DataType::F64),
        Some(P::Int32) => Ok(DataType::I32),
        Some(P::Int64) => Ok(DataType::I64),
        Some(P::Uint8) => Ok(DataType::U8),
        _ => Err(ExporterError::Deserialization(format!(
            "'{what}' has unsupported element type {code}"
        ))),
    }
}

fn tensor_from_proto(proto: onnx::TensorProto) -> Result<Tensor, ExporterError> {
    let name = proto.name.unwrap_or_default();
    let data_type = data_type(proto.data_type.unwrap_or_default(), &name)?;
    let shape = proto
        .dims
        .iter()
        .map(|&d| {
            usize::try_from(d)
                .map(Dim::Fixed)
                .map_err(|_| ExporterError::Deserialization(format!("initializer '{name}' has dim {d}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let data = match proto.raw_data {
        Some(raw) => raw,
        None if !proto.float_data.is_empty() => proto.float_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        None if !proto.int64_data.is_empty() => proto.int64_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        None if !proto.int32_data.is_empty() => proto.int32_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        None if !proto.double_data.is_empty() => proto.double_data.iter().flat_map(|v| v.to_le_bytes()).collect(),
        None => Vec::new(),
    };
    let expected = shape.iter().filter_map(Dim::fixed).product::<usize>() * data_type.size_in_bytes();
    if data.len() != expected {
        return Err(ExporterError::Deserialization(format!(
            "initializer '{name}' holds {} bytes, expected {expected}",
            data.len()
        )));
    }
    Ok(Tensor {
        name,
        shape,
        data_type,
        data: Some(data),
    })
}

fn node_from_proto(proto: onnx::NodeProto) -> Result<Node, ExporterError> {
    use onnx::attribute_proto::AttributeType;
    let name = proto.name.unwrap_or_default();
    let op_type = proto.op_type.unwrap_or_default();
    let op: OpKind = op_type
        .parse()
        .map_err(|e: String| ExporterError::Deserialization(format!("node '{name}': {e}")))?;
    let mut node = Node::new(name.clone(), Op::Onnx(op), proto.input, proto.output);
    for a in proto.attribute {
        let attr_name = a.name.clone().unwrap_or_default();
        let value = match a.r#type.and_then(|t| AttributeType::try_from(t).ok()) {
            Some(AttributeType::Float) => a.f.map(Attribute::Float),
            Some(AttributeType::Int) => a.i.map(Attribute::Int),
            Some(AttributeType::String) => a.s.map(|s| Attribute::String(String::from_utf8_lossy(&s).into_owned())),
            Some(AttributeType::Floats) => Some(Attribute::Floats(a.floats)),
            Some(AttributeType::Ints) => Some(Attribute::Ints(a.ints)),
            _ => None,
        };
        let value = value.ok_or_else(|| {
            ExporterError::Deserialization(format!("node '{name}': attribute '{attr_name}' has an unsupported type"))
        })?;
        node.attributes.insert(attr_name, value);
    }
    Ok(node)
}

fn value_from_proto(proto: onnx::ValueInfoProto) -> Result<Tensor, ExporterError> {
    use onnx::tensor_shape_proto::dimension::Value as D;
    let name = proto.name.unwrap_or_default();
    let Some(onnx::type_proto::Value::TensorType(tensor)) = proto.r#type.and_then(|t| t.value) else {
        return Err(ExporterError::Deserialization(format!("'{name}' is not a tensor value")));
    };
    let data_type = data_type(tensor.elem_type.unwrap_or_default(), &name)?;
    let shape = tensor
        .shape
        .map(|s| s.dim)
        .unwrap_or_default()
        .into_iter()
        .map(|d| match d.value {
            Some(D::DimValue(v)) if v >= 0 => Ok(Dim::Fixed(v as usize)),
            Some(D::DimParam(p)) if !p.is_empty() => Ok(Dim::Symbolic(p)),
            _ => Err(ExporterError::Deserialization(format!("'{name}' has an unknown dimension"))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Tensor::value(name, shape, data_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::OnnxExporter;

    #[test]
    fn test_decode_round_trips_graph_structure() {
        let mut graph = Graph::new("g");
        graph.opset_version = 13;
        graph.inputs.push(Tensor::value("x", vec![Dim::Symbolic("n".into()), Dim::Fixed(4)], DataType::F32));
        graph.weights.insert("shape".into(), Tensor::from_i64("shape", &[2], &[0, -1]));
        graph.nodes.push(
            Node::new("r", Op::Onnx(OpKind::Reshape), vec!["x".into(), "shape".into()], vec!["y".into()])
                .with_attr("allowzero", Attribute::Int(0)),
        );
        graph.nodes.push(
            Node::new("s", Op::Onnx(OpKind::Softmax), vec!["y".into()], vec!["z".into()])
                .with_attr("axis", Attribute::Int(-1)),
        );
        graph.value_info.insert(
            "y".into(),
            Tensor::value("y", vec![Dim::Symbolic("n".into()), Dim::Fixed(4)], DataType::F32),
        );
        graph.outputs.push(Tensor::value("z", vec![Dim::Symbolic("n".into()), Dim::Fixed(4)], DataType::F32));
        let mut metadata = BTreeMap::new();
        metadata.insert("k".to_string(), "v".to_string());

        let bytes = OnnxExporter::encode(&graph, &metadata).unwrap();
        let decoded = OnnxImporter::decode(&bytes).unwrap();

        assert_eq!(decoded.ir_version, 7);
        assert_eq!(decoded.producer_name, "traceonnx");
        assert_eq!(decoded.metadata, metadata);
        assert_eq!(decoded.graph.opset_version, 13);
        assert_eq!(decoded.graph.weights, graph.weights);
        assert_eq!(decoded.graph.inputs, graph.inputs);
        assert_eq!(decoded.graph.outputs, graph.outputs);
        assert_eq!(decoded.graph.value_info, graph.value_info);
        assert_eq!(decoded.graph.nodes.len(), 2);
        assert_eq!(decoded.graph.nodes[0].attributes, graph.nodes[0].attributes);
        assert_eq!(decoded.graph.nodes[1].op, Op::Onnx(OpKind::Softmax));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            OnnxImporter::decode(&[0xff, 0xff, 0xff]),
            Err(ExporterError::Deserialization(_))
        ));
    }
}
