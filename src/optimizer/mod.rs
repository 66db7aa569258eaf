use thiserror::Error;
use tracing::debug;

use crate::ir::{Graph, GraphError};
use crate::runtime::RuntimeError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizerError {
    #[error("pass '{pass}' left an invalid graph: {source}")]
    Graph {
        pass: &'static str,
        #[source]
        source: GraphError,
    },
    #[error("folding node '{node}' failed: {source}")]
    Fold {
        node: String,
        #[source]
        source: RuntimeError,
    },
    #[error("node '{node}': constant '{name}' {detail}")]
    InvalidConstant { node: String, name: String, detail: String },
}

/// A graph rewrite. Returns how many rewrites it made.
pub trait OptimizationPass {
    fn name(&self) -> &'static str;
    fn apply(&self, graph: &mut Graph) -> Result<usize, OptimizerError>;
}

pub mod constant_folding;
pub mod dce;
pub mod fusion;

pub use constant_folding::ConstantFolding;
pub use dce::DeadCodeElimination;
pub use fusion::ConvBatchNormFusion;

#[derive(Default)]
pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Fusion, then folding, then dead code elimination.
    pub fn default_passes() -> Self {
        let mut optimizer = Self::new();
        optimizer.add_pass(Box::new(ConvBatchNormFusion));
        optimizer.add_pass(Box::new(ConstantFolding));
        optimizer.add_pass(Box::new(DeadCodeElimination));
        optimizer
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    pub fn optimize(&self, graph: &mut Graph) -> Result<(), OptimizerError> {
        for pass in &self.passes {
            let rewrites = pass.apply(graph)?;
            graph
                .validate_topology()
                .map_err(|source| OptimizerError::Graph { pass: pass.name(), source })?;
            debug!(pass = pass.name(), rewrites, nodes = graph.nodes.len(), "optimization pass done");
        }
        Ok(())
    }
}
