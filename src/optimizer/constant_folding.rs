use tracing::trace;

use crate::ir::Graph;
use crate::optimizer::{OptimizationPass, OptimizerError};
use crate::runtime::{Interpreter, TensorData};

/// Evaluates nodes whose inputs are all initializers and stores the results as
/// initializers. Nodes that produce graph outputs are left in place so the
/// exported graph keeps at least one node per output.
pub struct ConstantFolding;

impl OptimizationPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "constant_folding"
    }

    fn apply(&self, graph: &mut Graph) -> Result<usize, OptimizerError> {
        let mut folded = 0;
        let mut i = 0;
        while i < graph.nodes.len() {
            let node = &graph.nodes[i];
            let foldable = node.present_inputs().next().is_some()
                && node.present_inputs().all(|input| graph.weights.contains_key(input))
                && !node.outputs.iter().any(|output| graph.is_output(output));
            if !foldable {
                i += 1;
                continue;
            }

            let mut args = Vec::with_capacity(node.inputs.len());
            for input in &node.inputs {
                if input.is_empty() {
                    args.push(None);
                    continue;
                }
                let value = graph
                    .weights
                    .get(input)
                    .and_then(TensorData::from_tensor)
                    .ok_or_else(|| OptimizerError::InvalidConstant {
                        node: node.name.clone(),
                        name: input.clone(),
                        detail: "cannot be decoded as f32".to_string(),
                    })?;
                args.push(Some(value));
            }
            let refs: Vec<Option<&TensorData>> = args.iter().map(Option::as_ref).collect();
            let results = Interpreter::new(graph)
                .run_node(node, &refs)
                .map_err(|source| OptimizerError::Fold {
                    node: node.name.clone(),
                    source,
                })?;

            let node = graph.nodes.remove(i);
            trace!(node = %node.name, op = %node.op, "folded");
            for (name, value) in node.outputs.iter().zip(results) {
                graph.value_info.remove(name);
                graph.weights.insert(name.clone(), value.to_tensor(name.clone()));
            }
            folded += 1;
        }
        Ok(folded)
    }
}
