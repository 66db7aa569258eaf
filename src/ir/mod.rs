//! Graph intermediate representation shared by every pipeline stage.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod shape_inference;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    F64,
    I32,
    I64,
    U8,
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::U8 => 1,
        }
    }
}

/// One axis of a tensor shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dim {
    Fixed(usize),
    /// Size unknown at export time, tracked by name.
    Symbolic(String),
}

impl Dim {
    pub fn fixed(&self) -> Option<usize> {
        match self {
            Dim::Fixed(d) => Some(*d),
            Dim::Symbolic(_) => None,
        }
    }

    pub fn symbol(&self) -> Option<&str> {
        match self {
            Dim::Fixed(_) => None,
            Dim::Symbolic(s) => Some(s),
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(d) => write!(f, "{d}"),
            Dim::Symbolic(s) => write!(f, "{s}"),
        }
    }
}

pub fn fixed_shape(dims: &[usize]) -> Vec<Dim> {
    dims.iter().map(|&d| Dim::Fixed(d)).collect()
}

pub fn format_shape(shape: &[Dim]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(", "))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<Dim>,
    pub data_type: DataType,
    pub data: Option<Vec<u8>>,
}

impl Tensor {
    /// A descriptor without constant data.
    pub fn value(name: impl Into<String>, shape: Vec<Dim>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            shape,
            data_type,
            data: None,
        }
    }

    pub fn from_f32(name: impl Into<String>, dims: &[usize], values: &[f32]) -> Self {
        Self {
            name: name.into(),
            shape: fixed_shape(dims),
            data_type: DataType::F32,
            data: Some(values.iter().flat_map(|v| v.to_le_bytes()).collect()),
        }
    }

    pub fn from_i64(name: impl Into<String>, dims: &[usize], values: &[i64]) -> Self {
        Self {
            name: name.into(),
            shape: fixed_shape(dims),
            data_type: DataType::I64,
            data: Some(values.iter().flat_map(|v| v.to_le_bytes()).collect()),
        }
    }

    /// Decodes the constant payload as f32 values, widening or narrowing other dtypes.
    pub fn f32_values(&self) -> Option<Vec<f32>> {
        let data = self.data.as_ref()?;
        let values = match self.data_type {
            DataType::F32 => data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            DataType::F64 => data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes(c.try_into().unwrap_or([0; 8])) as f32)
                .collect(),
            DataType::I32 => data
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
                .collect(),
            DataType::I64 => data
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().unwrap_or([0; 8])) as f32)
                .collect(),
            DataType::U8 => data.iter().map(|&b| b as f32).collect(),
        };
        Some(values)
    }

    pub fn i64_values(&self) -> Option<Vec<i64>> {
        let data = self.data.as_ref()?;
        match self.data_type {
            DataType::I64 => Some(
                data.chunks_exact(8)
                    .map(|c| i64::from_le_bytes(c.try_into().unwrap_or([0; 8])))
                    .collect(),
            ),
            DataType::I32 => Some(
                data.chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                    .collect(),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
}

impl Attribute {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Attribute::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Attribute::Float(f) => Some(*f),
            Attribute::Int(i) => Some(*i as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Attribute::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Float(v) => write!(f, "{v}"),
            Attribute::Int(v) => write!(f, "{v}"),
            Attribute::String(v) => write!(f, "{v:?}"),
            Attribute::Floats(v) => write!(f, "{v:?}"),
            Attribute::Ints(v) => write!(f, "{v:?}"),
        }
    }
}

pub type Attributes = BTreeMap<String, Attribute>;

pub fn format_attributes(attrs: &Attributes) -> String {
    let parts: Vec<String> = attrs.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{{{}}}", parts.join(", "))
}

macro_rules! op_kinds {
    ($($kind:ident),* $(,)?) => {
        /// The closed set of ONNX operators the exporter emits.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum OpKind {
            $($kind),*
        }

        impl OpKind {
            pub const ALL: &'static [OpKind] = &[$(OpKind::$kind),*];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(OpKind::$kind => stringify!($kind)),*
                }
            }
        }

        impl FromStr for OpKind {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($kind) => Ok(OpKind::$kind),)*
                    other => Err(format!("unknown operator '{other}'")),
                }
            }
        }
    };
}

op_kinds!(
    Add,
    AveragePool,
    BatchNormalization,
    Concat,
    Conv,
    Div,
    Erf,
    Flatten,
    Gelu,
    Gemm,
    GlobalAveragePool,
    Identity,
    LayerNormalization,
    MatMul,
    MaxPool,
    Mul,
    Pad,
    ReduceMean,
    Relu,
    Reshape,
    Resize,
    Sigmoid,
    Softmax,
    Sqrt,
    Sub,
    Tanh,
    Transpose,
);

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a node computes: a recorded source operation, or an ONNX operator after mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Traced(String),
    Onnx(OpKind),
}

impl Op {
    pub fn onnx(&self) -> Option<OpKind> {
        match self {
            Op::Onnx(kind) => Some(*kind),
            Op::Traced(_) => None,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Traced(kind) => write!(f, "traced:{kind}"),
            Op::Onnx(kind) => write!(f, "{kind}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Attributes,
    /// Traced node this one was lowered from.
    pub origin: Option<String>,
}

impl Node {
    pub fn new(name: impl Into<String>, op: Op, inputs: Vec<String>, outputs: Vec<String>) -> Self {
        Self {
            name: name.into(),
            op,
            inputs,
            outputs,
            attributes: Attributes::new(),
            origin: None,
        }
    }

    pub fn with_attr(mut self, name: &str, value: Attribute) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn attr_int(&self, name: &str, default: i64) -> i64 {
        self.attributes.get(name).and_then(Attribute::as_int).unwrap_or(default)
    }

    pub fn attr_float(&self, name: &str, default: f32) -> f32 {
        self.attributes.get(name).and_then(Attribute::as_float).unwrap_or(default)
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        self.attributes.get(name).and_then(Attribute::as_ints)
    }

    pub fn attr_str<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.attributes.get(name).and_then(Attribute::as_str).unwrap_or(default)
    }

    /// Present (non-empty) input names.
    pub fn present_inputs(&self) -> impl Iterator<Item = &String> {
        self.inputs.iter().filter(|i| !i.is_empty())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("node '{node}' reads '{input}', which is not a graph input, constant or node output")]
    DanglingInput { node: String, input: String },
    #[error("value '{name}' is produced more than once")]
    DuplicateValue { name: String },
    #[error("graph output '{name}' is never produced")]
    UnknownOutput { name: String },
    #[error("graph contains a cycle through nodes {nodes:?}")]
    Cycle { nodes: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct Graph {
    pub name: String,
    pub nodes: Vec<Node>,
    pub weights: BTreeMap<String, Tensor>,
    pub inputs: Vec<Tensor>,
    pub outputs: Vec<Tensor>,
    pub value_info: BTreeMap<String, Tensor>,
    pub opset_version: i64,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            weights: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            value_info: BTreeMap::new(),
            opset_version: 17,
        }
    }

    /// Descriptor of any named value: input, output, constant or intermediate.
    pub fn descriptor(&self, name: &str) -> Option<&Tensor> {
        self.inputs
            .iter()
            .find(|t| t.name == name)
            .or_else(|| self.weights.get(name))
            .or_else(|| self.outputs.iter().find(|t| t.name == name))
            .or_else(|| self.value_info.get(name))
    }

    pub fn producer(&self, value: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.outputs.iter().any(|o| o == value))
    }

    pub fn consumers<'a>(&'a self, value: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes.iter().filter(move |n| n.inputs.iter().any(|i| i == value))
    }

    pub fn is_output(&self, value: &str) -> bool {
        self.outputs.iter().any(|t| t.name == value)
    }

    /// Renames a value everywhere it is referenced.
    pub fn rename_value(&mut self, from: &str, to: &str) {
        for node in &mut self.nodes {
            for name in node.inputs.iter_mut().chain(node.outputs.iter_mut()) {
                if name == from {
                    *name = to.to_string();
                }
            }
        }
        for tensor in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            if tensor.name == from {
                tensor.name = to.to_string();
            }
        }
        if let Some(mut info) = self.value_info.remove(from) {
            info.name = to.to_string();
            self.value_info.insert(to.to_string(), info);
        }
    }

    /// Renames a symbolic dimension in every descriptor.
    pub fn rename_symbol(&mut self, from: &str, to: &str) {
        let rename = |tensor: &mut Tensor| {
            for dim in &mut tensor.shape {
                if dim.symbol() == Some(from) {
                    *dim = Dim::Symbolic(to.to_string());
                }
            }
        };
        self.inputs.iter_mut().for_each(rename);
        self.outputs.iter_mut().for_each(rename);
        self.value_info.values_mut().for_each(rename);
    }

    /// Stable Kahn ordering: among ready nodes the earliest position wins.
    pub fn topological_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut producer_of: BTreeMap<&str, usize> = BTreeMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            for out in &node.outputs {
                if producer_of.insert(out.as_str(), idx).is_some() {
                    return Err(GraphError::DuplicateValue { name: out.clone() });
                }
            }
        }

        let mut pending = vec![0usize; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            let deps: BTreeSet<usize> = node
                .present_inputs()
                .filter_map(|i| producer_of.get(i.as_str()).copied())
                .collect();
            pending[idx] = deps.len();
            for dep in deps {
                dependents[dep].push(idx);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|&(_, &n)| n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for &next in &dependents[idx] {
                pending[next] -= 1;
                if pending[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if order.len() != self.nodes.len() {
            let nodes = pending
                .iter()
                .enumerate()
                .filter(|&(_, &n)| n > 0)
                .map(|(i, _)| self.nodes[i].name.clone())
                .collect();
            return Err(GraphError::Cycle { nodes });
        }
        Ok(order)
    }

    /// Checks that every reference resolves and the node set is acyclic.
    pub fn validate_topology(&self) -> Result<(), GraphError> {
        self.topological_order()?;

        let mut known: BTreeSet<&str> = self.inputs.iter().map(|t| t.name.as_str()).collect();
        known.extend(self.weights.keys().map(String::as_str));
        for node in &self.nodes {
            known.extend(node.outputs.iter().map(String::as_str));
        }
        for node in &self.nodes {
            if let Some(input) = node.present_inputs().find(|i| !known.contains(i.as_str())) {
                return Err(GraphError::DanglingInput {
                    node: node.name.clone(),
                    input: input.clone(),
                });
            }
        }
        if let Some(out) = self.outputs.iter().find(|o| !known.contains(o.name.as_str())) {
            return Err(GraphError::UnknownOutput { name: out.name.clone() });
        }
        Ok(())
    }

    /// Puts the node list into topological order.
    pub fn sort_topologically(&mut self) -> Result<(), GraphError> {
        let order = self.topological_order()?;
        let mut slots: Vec<Option<Node>> = self.nodes.drain(..).map(Some).collect();
        self.nodes = order.into_iter().filter_map(|i| slots[i].take()).collect();
        Ok(())
    }
}
