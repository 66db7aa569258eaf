use std::collections::BTreeSet;

use crate::ir::Graph;
use crate::optimizer::{OptimizationPass, OptimizerError};

/// Drops nodes whose outputs nothing reads, then initializers nothing reads.
pub struct DeadCodeElimination;

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn apply(&self, graph: &mut Graph) -> Result<usize, OptimizerError> {
        let mut removed = 0;
        loop {
            let used: BTreeSet<String> = used_values(graph).into_iter().map(str::to_string).collect();
            let before = graph.nodes.len();
            graph
                .nodes
                .retain(|node| node.outputs.iter().any(|output| used.contains(output)));
            if graph.nodes.len() == before {
                break;
            }
            removed += before - graph.nodes.len();
        }

        let used: BTreeSet<String> = used_values(graph).into_iter().map(str::to_string).collect();
        let before = graph.weights.len();
        graph.weights.retain(|name, _| used.contains(name));
        removed += before - graph.weights.len();

        let live: BTreeSet<&String> = graph.nodes.iter().flat_map(|n| n.outputs.iter()).collect();
        let stale: Vec<String> = graph
            .value_info
            .keys()
            .filter(|name| !live.contains(name))
            .cloned()
            .collect();
        for name in stale {
            graph.value_info.remove(&name);
        }
        Ok(removed)
    }
}

fn used_values(graph: &Graph) -> BTreeSet<&str> {
    graph
        .outputs
        .iter()
        .map(|o| o.name.as_str())
        .chain(graph.nodes.iter().flat_map(|n| n.present_inputs().map(String::as_str)))
        .collect()
}
