use tracing::trace;

use crate::ir::{Graph, Node, OpKind};
use crate::optimizer::{OptimizationPass, OptimizerError};
use crate::runtime::TensorData;

/// Folds `BatchNormalization(Conv(x))` into the convolution's weight and bias.
///
/// Applies only when the conv output feeds nothing but the batch norm, is not a
/// graph output, and every parameter involved is an initializer.
pub struct ConvBatchNormFusion;

impl OptimizationPass for ConvBatchNormFusion {
    fn name(&self) -> &'static str {
        "conv_batch_norm_fusion"
    }

    fn apply(&self, graph: &mut Graph) -> Result<usize, OptimizerError> {
        let mut fused = 0;
        let mut i = 0;
        while i < graph.nodes.len() {
            let Some(bn_idx) = fusable_batch_norm(graph, i) else {
                i += 1;
                continue;
            };
            let (weight, bias) = fold(graph, &graph.nodes[i], &graph.nodes[bn_idx])?;

            let conv_name = graph.nodes[i].name.clone();
            let weight_name = format!("{conv_name}/fused_weight");
            let bias_name = format!("{conv_name}/fused_bias");
            graph.weights.insert(weight_name.clone(), weight.to_tensor(weight_name.clone()));
            graph.weights.insert(bias_name.clone(), bias.to_tensor(bias_name.clone()));

            let bn = graph.nodes.remove(bn_idx);
            let conv = &mut graph.nodes[if bn_idx < i { i - 1 } else { i }];
            graph.value_info.remove(&conv.outputs[0]);
            conv.inputs.truncate(1);
            conv.inputs.push(weight_name);
            conv.inputs.push(bias_name);
            conv.outputs[0] = bn.outputs[0].clone();
            trace!(conv = %conv.name, batch_norm = %bn.name, "fused");
            fused += 1;
            i += 1;
        }
        Ok(fused)
    }
}

fn fusable_batch_norm(graph: &Graph, conv_idx: usize) -> Option<usize> {
    let conv = &graph.nodes[conv_idx];
    if conv.op.onnx() != Some(OpKind::Conv) || conv.outputs.len() != 1 {
        return None;
    }
    let conv_out = &conv.outputs[0];
    if graph.is_output(conv_out) || !conv.present_inputs().skip(1).all(|n| graph.weights.contains_key(n)) {
        return None;
    }
    let mut consumers = graph.consumers(conv_out);
    let bn = consumers.next()?;
    if consumers.next().is_some() || bn.op.onnx() != Some(OpKind::BatchNormalization) || bn.outputs.len() != 1 {
        return None;
    }
    if bn.inputs.len() != 5 || bn.inputs[0] != *conv_out || !bn.inputs[1..].iter().all(|n| graph.weights.contains_key(n)) {
        return None;
    }
    graph.nodes.iter().position(|n| n.name == bn.name)
}

fn constant(graph: &Graph, node: &Node, name: &str) -> Result<TensorData, OptimizerError> {
    graph
        .weights
        .get(name)
        .and_then(TensorData::from_tensor)
        .ok_or_else(|| OptimizerError::InvalidConstant {
            node: node.name.clone(),
            name: name.to_string(),
            detail: "cannot be decoded as f32".to_string(),
        })
}

/// `scale = gamma / sqrt(var + eps)`, `W' = W * scale`, `b' = (b - mean) * scale + beta`.
fn fold(graph: &Graph, conv: &Node, bn: &Node) -> Result<(TensorData, TensorData), OptimizerError> {
    let weight = constant(graph, conv, &conv.inputs[1])?;
    let gamma = constant(graph, bn, &bn.inputs[1])?;
    let beta = constant(graph, bn, &bn.inputs[2])?;
    let mean = constant(graph, bn, &bn.inputs[3])?;
    let var = constant(graph, bn, &bn.inputs[4])?;
    let eps = bn.attr_float("epsilon", 1e-5);

    let out_channels = weight.shape().first().copied().unwrap_or(0);
    let invalid = |name: &str, detail: String| OptimizerError::InvalidConstant {
        node: bn.name.clone(),
        name: name.to_string(),
        detail,
    };
    for (tensor, name) in [(&gamma, &bn.inputs[1]), (&beta, &bn.inputs[2]), (&mean, &bn.inputs[3]), (&var, &bn.inputs[4])] {
        if tensor.numel() != out_channels {
            return Err(invalid(name, format!("has {} values for {out_channels} channels", tensor.numel())));
        }
    }
    let bias = match conv.inputs.get(2).filter(|n| !n.is_empty()) {
        Some(name) => constant(graph, conv, name)?,
        None => TensorData::zeros(vec![out_channels]),
    };
    if bias.numel() != out_channels {
        return Err(invalid(&conv.inputs[2], format!("has {} values for {out_channels} channels", bias.numel())));
    }

    let scale: Vec<f32> = gamma
        .data()
        .iter()
        .zip(var.data())
        .map(|(g, v)| g / (v + eps).sqrt())
        .collect();
    let per_channel = weight.numel() / out_channels.max(1);
    let folded_weight: Vec<f32> = weight
        .data()
        .iter()
        .enumerate()
        .map(|(idx, w)| w * scale[idx / per_channel.max(1)])
        .collect();
    let folded_bias: Vec<f32> = (0..out_channels)
        .map(|c| (bias.data()[c] - mean.data()[c]) * scale[c] + beta.data()[c])
        .collect();

    let weight = TensorData::new(weight.shape().to_vec(), folded_weight)
        .map_err(|e| invalid(&conv.inputs[1], e.to_string()))?;
    let bias = TensorData::new(vec![out_channels], folded_bias).map_err(|e| invalid("bias", e.to_string()))?;
    Ok((weight, bias))
}
