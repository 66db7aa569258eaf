use crate::ir::Tensor;
use crate::runtime::kernels::KernelError;

/// Dense row-major f32 tensor used for eager tracing and graph execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TensorData {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, KernelError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(KernelError::invalid(
                "tensor",
                format!("shape {shape:?} needs {expected} elements, got {}", data.len()),
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let n = shape.iter().product();
        Self { shape, data: vec![value; n] }
    }

    pub fn scalar(value: f32) -> Self {
        Self { shape: Vec::new(), data: vec![value] }
    }

    pub fn from_fn(shape: Vec<usize>, f: impl FnMut(usize) -> f32) -> Self {
        let n: usize = shape.iter().product();
        Self { shape, data: (0..n).map(f).collect() }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, KernelError> {
        Self::new(shape, self.data)
    }

    /// Decodes a constant graph tensor. Symbolic or data-less tensors yield `None`.
    pub fn from_tensor(tensor: &Tensor) -> Option<Self> {
        let shape = tensor.shape.iter().map(|d| d.fixed()).collect::<Option<Vec<_>>>()?;
        let values = tensor.f32_values()?;
        Self::new(shape, values).ok()
    }

    pub fn to_tensor(&self, name: impl Into<String>) -> Tensor {
        Tensor::from_f32(name, &self.shape, &self.data)
    }

    /// Reads the values as integers (shape operands, pads, axes).
    pub fn to_i64(&self) -> Vec<i64> {
        self.data.iter().map(|&v| v as i64).collect()
    }
}

pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// Splits a linear index into per-axis coordinates.
pub fn unravel(mut index: usize, shape: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; shape.len()];
    for axis in (0..shape.len()).rev() {
        let dim = shape[axis].max(1);
        coords[axis] = index % dim;
        index /= dim;
    }
    coords
}
