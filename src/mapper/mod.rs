//! Lowers traced source operations into ONNX operators.
//!
//! The mapping is data: a [`MappingTable`] from source kind to an ordered list
//! of candidate [`Mapping`]s. Each candidate declares the opset range it is
//! valid for, the source attributes it understands, and a pure lowering
//! function. The first candidate that accepts a node wins, so table order is
//! the tie-break between equivalent encodings.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::{debug, info};

use crate::ir::{format_attributes, Attribute, Attributes, Dim, Graph, Node, Op, OpKind, Tensor};

mod table;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MapperError {
    #[error(
        "unsupported operator '{kind}' at node '{op}' with attributes {attributes} (opset {opset}): {}",
        .reasons.join("; ")
    )]
    UnsupportedOperator {
        op: String,
        kind: String,
        attributes: String,
        opset: i64,
        reasons: Vec<String>,
    },
}

/// Why a candidate declined a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection(pub String);

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Rejection(reason.into())
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type LowerFn = fn(&Node, &mut Lowering<'_>) -> Result<(), Rejection>;

/// One way of expressing a source kind in ONNX.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    /// Human-readable name of the encoding, e.g. `"Pad+Conv"`.
    pub encoding: &'static str,
    pub min_opset: i64,
    pub max_opset: Option<i64>,
    /// Source attributes this encoding knows how to honour.
    pub supported_attrs: &'static [&'static str],
    pub lower: LowerFn,
}

impl Mapping {
    pub fn admits_opset(&self, opset: i64) -> bool {
        opset >= self.min_opset && self.max_opset.map_or(true, |max| opset <= max)
    }

    fn check(&self, node: &Node, opset: i64) -> Result<(), Rejection> {
        if !self.admits_opset(opset) {
            let range = match self.max_opset {
                Some(max) => format!("{}..={max}", self.min_opset),
                None => format!("{}+", self.min_opset),
            };
            return Err(Rejection(format!("{} requires opset {range}", self.encoding)));
        }
        if let Some(attr) = node.attributes.keys().find(|a| !self.supported_attrs.contains(&a.as_str())) {
            return Err(Rejection(format!("{} does not support attribute '{attr}'", self.encoding)));
        }
        Ok(())
    }
}

/// Candidate encodings per source kind, in preference order.
#[derive(Debug, Clone)]
pub struct MappingTable {
    entries: BTreeMap<String, Vec<Mapping>>,
}

impl Default for MappingTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table::install(&mut table);
        table
    }
}

impl MappingTable {
    pub fn empty() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Adds `mapping` as the last resort for `kind`.
    pub fn register(&mut self, kind: &str, mapping: Mapping) {
        self.entries.entry(kind.to_string()).or_default().push(mapping);
    }

    /// Adds `mapping` ahead of every existing candidate for `kind`.
    pub fn register_preferred(&mut self, kind: &str, mapping: Mapping) {
        self.entries.entry(kind.to_string()).or_default().insert(0, mapping);
    }

    pub fn candidates(&self, kind: &str) -> &[Mapping] {
        self.entries.get(kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Builder handed to a [`LowerFn`]. Collects the ONNX nodes and constants
/// replacing one traced node.
pub struct Lowering<'a> {
    graph: &'a Graph,
    source: &'a Node,
    nodes: Vec<Node>,
    constants: Vec<Tensor>,
}

impl<'a> Lowering<'a> {
    fn new(graph: &'a Graph, source: &'a Node) -> Self {
        Self {
            graph,
            source,
            nodes: Vec::new(),
            constants: Vec::new(),
        }
    }

    pub fn opset(&self) -> i64 {
        self.graph.opset_version
    }

    /// Name of the source node's `idx`-th input.
    pub fn input(&self, idx: usize) -> Result<String, Rejection> {
        self.source
            .inputs
            .get(idx)
            .cloned()
            .ok_or_else(|| Rejection(format!("expected at least {} inputs", idx + 1)))
    }

    /// Traced shape of a value.
    pub fn shape(&self, value: &str) -> Result<&'a [Dim], Rejection> {
        self.graph
            .descriptor(value)
            .map(|t| t.shape.as_slice())
            .ok_or_else(|| Rejection(format!("no shape recorded for '{value}'")))
    }

    pub fn rank(&self, value: &str) -> Result<usize, Rejection> {
        self.shape(value).map(<[Dim]>::len)
    }

    fn node_name(&self, kind: OpKind) -> String {
        format!("{}/{}_{}", self.source.name, kind, self.nodes.len())
    }

    /// Emits an intermediate node and returns its output name.
    pub fn emit(&mut self, kind: OpKind, inputs: Vec<String>, attributes: Attributes) -> String {
        let name = self.node_name(kind);
        let output = format!("{name}_output_0");
        self.push(name, kind, inputs, vec![output.clone()], attributes);
        output
    }

    /// Emits the node producing the source node's outputs.
    pub fn emit_final(&mut self, kind: OpKind, inputs: Vec<String>, attributes: Attributes) {
        let name = self.node_name(kind);
        let outputs = self.source.outputs.clone();
        self.push(name, kind, inputs, outputs, attributes);
    }

    fn push(&mut self, name: String, kind: OpKind, inputs: Vec<String>, outputs: Vec<String>, attributes: Attributes) {
        let mut node = Node::new(name, Op::Onnx(kind), inputs, outputs);
        node.attributes = attributes;
        node.origin = Some(self.source.name.clone());
        self.nodes.push(node);
    }

    pub fn constant_i64(&mut self, suffix: &str, dims: &[usize], values: &[i64]) -> String {
        let name = format!("{}/{suffix}", self.source.name);
        self.constants.push(Tensor::from_i64(name.clone(), dims, values));
        name
    }

    pub fn constant_f32(&mut self, suffix: &str, dims: &[usize], values: &[f32]) -> String {
        let name = format!("{}/{suffix}", self.source.name);
        self.constants.push(Tensor::from_f32(name.clone(), dims, values));
        name
    }

    pub fn scalar_f32(&mut self, suffix: &str, value: f32) -> String {
        self.constant_f32(suffix, &[], &[value])
    }
}

/// Convenience for building attribute maps in lowerings.
pub fn attrs<const N: usize>(entries: [(&str, Attribute); N]) -> Attributes {
    entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Which candidate a traced node was lowered with.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingChoice {
    pub kind: String,
    pub index: usize,
    pub encoding: &'static str,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingRecord {
    choices: BTreeMap<String, MappingChoice>,
}

impl MappingRecord {
    pub fn choice(&self, traced_node: &str) -> Option<&MappingChoice> {
        self.choices.get(traced_node)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MappingChoice)> {
        self.choices.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }
}

pub struct OperatorMapper<'t> {
    table: &'t MappingTable,
}

impl<'t> OperatorMapper<'t> {
    pub fn new(table: &'t MappingTable) -> Self {
        Self { table }
    }

    /// Replaces every traced node of `graph` in place.
    ///
    /// `overrides` maps a traced node name to the first candidate index that
    /// may be used for it; the validator's feedback loop raises it to skip an
    /// encoding that diverged.
    pub fn map(&self, graph: &mut Graph, overrides: &BTreeMap<String, usize>) -> Result<MappingRecord, MapperError> {
        let mut record = MappingRecord::default();
        let mut nodes = Vec::with_capacity(graph.nodes.len());
        let mut constants = Vec::new();

        for node in &graph.nodes {
            let kind = match &node.op {
                Op::Onnx(_) => {
                    nodes.push(node.clone());
                    continue;
                }
                Op::Traced(kind) => kind,
            };
            let start = overrides.get(&node.name).copied().unwrap_or(0);
            let (choice, lowering) = self.lower(graph, node, kind, start)?;
            debug!(node = %node.name, %kind, encoding = choice.encoding, emitted = lowering.nodes.len(), "mapped");
            record.choices.insert(node.name.clone(), choice);
            nodes.extend(lowering.nodes);
            constants.extend(lowering.constants);
        }

        graph.nodes = nodes;
        for constant in constants {
            graph.weights.insert(constant.name.clone(), constant);
        }
        info!(mapped = record.len(), nodes = graph.nodes.len(), opset = graph.opset_version, "operator mapping complete");
        Ok(record)
    }

    fn lower<'g>(&self, graph: &'g Graph, node: &'g Node, kind: &str, start: usize) -> Result<(MappingChoice, Lowering<'g>), MapperError> {
        let candidates = self.table.candidates(kind);
        let opset = graph.opset_version;
        let mut reasons = Vec::new();
        if candidates.is_empty() {
            reasons.push("no mapping is registered for this kind".to_string());
        } else if start >= candidates.len() {
            reasons.push(format!("all {} candidate encodings were tried", candidates.len()));
        }

        for (index, mapping) in candidates.iter().enumerate().skip(start) {
            let mut lowering = Lowering::new(graph, node);
            let outcome = mapping.check(node, opset).and_then(|()| (mapping.lower)(node, &mut lowering));
            match outcome {
                Ok(()) => {
                    let choice = MappingChoice {
                        kind: kind.to_string(),
                        index,
                        encoding: mapping.encoding,
                        nodes: lowering.nodes.iter().map(|n| n.name.clone()).collect(),
                    };
                    return Ok((choice, lowering));
                }
                Err(Rejection(reason)) => {
                    debug!(node = %node.name, encoding = mapping.encoding, %reason, "candidate rejected");
                    reasons.push(reason);
                }
            }
        }

        Err(MapperError::UnsupportedOperator {
            op: node.name.clone(),
            kind: kind.to_string(),
            attributes: format_attributes(&node.attributes),
            opset,
            reasons,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{fixed_shape, DataType};

    fn traced(kind: &str, inputs: &[&str]) -> Node {
        Node::new(
            format!("{kind}_0"),
            Op::Traced(kind.to_string()),
            inputs.iter().map(|s| s.to_string()).collect(),
            vec![format!("{kind}_0_output_0")],
        )
    }

    fn graph_with(node: Node, opset: i64) -> Graph {
        let mut graph = Graph::new("g");
        graph.opset_version = opset;
        graph.inputs.push(Tensor::value("x", fixed_shape(&[1, 4]), DataType::F32));
        graph.outputs.push(Tensor::value(node.outputs[0].clone(), fixed_shape(&[1, 4]), DataType::F32));
        graph.nodes.push(node);
        graph
    }

    fn lower_relu(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
        cx.emit_final(OpKind::Relu, vec![node.inputs[0].clone()], Attributes::new());
        Ok(())
    }

    fn lower_sigmoid(node: &Node, cx: &mut Lowering<'_>) -> Result<(), Rejection> {
        cx.emit_final(OpKind::Sigmoid, vec![node.inputs[0].clone()], Attributes::new());
        Ok(())
    }

    #[test]
    fn test_unknown_kind_is_reported_with_attributes() {
        let node = traced("lstm", &["x"]).with_attr("hidden", Attribute::Int(8));
        let mut graph = graph_with(node, 17);
        let err = OperatorMapper::new(&MappingTable::default())
            .map(&mut graph, &BTreeMap::new())
            .unwrap_err();
        let MapperError::UnsupportedOperator { kind, attributes, reasons, .. } = err;
        assert_eq!(kind, "lstm");
        assert_eq!(attributes, "{hidden=8}");
        assert_eq!(reasons, ["no mapping is registered for this kind"]);
    }

    #[test]
    fn test_preferred_registration_wins_and_override_skips_it() {
        let mut table = MappingTable::empty();
        let relu = Mapping { encoding: "Relu", min_opset: 7, max_opset: None, supported_attrs: &[], lower: lower_relu };
        let sigmoid = Mapping { encoding: "Sigmoid", lower: lower_sigmoid, ..relu };
        table.register("act", relu);
        table.register_preferred("act", sigmoid);

        let mut graph = graph_with(traced("act", &["x"]), 17);
        let record = OperatorMapper::new(&table).map(&mut graph, &BTreeMap::new()).unwrap();
        assert_eq!(graph.nodes[0].op, Op::Onnx(OpKind::Sigmoid));
        assert_eq!(graph.nodes[0].origin.as_deref(), Some("act_0"));
        assert_eq!(record.choice("act_0").unwrap().index, 0);

        let mut graph = graph_with(traced("act", &["x"]), 17);
        let overrides = BTreeMap::from([("act_0".to_string(), 1)]);
        let record = OperatorMapper::new(&table).map(&mut graph, &overrides).unwrap();
        assert_eq!(graph.nodes[0].op, Op::Onnx(OpKind::Relu));
        assert_eq!(record.choice("act_0").unwrap().encoding, "Relu");
    }

    #[test]
    fn test_opset_range_and_attributes_are_checked() {
        let mut table = MappingTable::empty();
        table.register(
            "act",
            Mapping { encoding: "Relu", min_opset: 18, max_opset: None, supported_attrs: &[], lower: lower_relu },
        );
        let mut graph = graph_with(traced("act", &["x"]).with_attr("inplace", Attribute::Int(1)), 17);
        let err = OperatorMapper::new(&table).map(&mut graph, &BTreeMap::new()).unwrap_err();
        let MapperError::UnsupportedOperator { reasons, .. } = err;
        assert_eq!(reasons, ["Relu requires opset 18+"]);
    }

    #[test]
    fn test_exhausted_overrides_fail() {
        let mut graph = graph_with(traced("relu", &["x"]), 17);
        let overrides = BTreeMap::from([("relu_0".to_string(), 5)]);
        let err = OperatorMapper::new(&MappingTable::default()).map(&mut graph, &overrides).unwrap_err();
        assert!(err.to_string().contains("candidate encodings were tried"));
    }
}
