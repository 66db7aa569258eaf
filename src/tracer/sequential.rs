use super::{Conv2dOptions, Model, PaddingMode, Pool2dOptions, TraceContext, TraceError, Value};

/// A layer of a [`Sequential`] model. Parameter fields name weight store entries.
#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Linear { weight: String, bias: Option<String> },
    Conv2d { weight: String, bias: Option<String>, options: Conv2dOptions },
    BatchNorm2d { prefix: String, eps: f32 },
    Relu,
    Sigmoid,
    Tanh,
    Silu,
    Gelu { approximate: String },
    MaxPool2d(Pool2dOptions),
    AvgPool2d(Pool2dOptions),
    AdaptiveAvgPool2d([usize; 2]),
    UpsampleNearest2d([f32; 2]),
    Flatten { start_dim: i64, end_dim: i64 },
    Reshape(Vec<i64>),
    Permute(Vec<i64>),
    Softmax(i64),
    LayerNorm { prefix: String, normalized_shape: Vec<usize>, eps: f32 },
    Pad { pad: Vec<i64>, mode: PaddingMode, value: f32 },
    Dropout(f32),
    /// `x + body(x)`.
    Residual(Vec<Layer>),
}

impl Layer {
    pub fn linear(prefix: &str) -> Self {
        Layer::Linear {
            weight: format!("{prefix}.weight"),
            bias: Some(format!("{prefix}.bias")),
        }
    }

    pub fn conv2d(prefix: &str, options: Conv2dOptions) -> Self {
        Layer::Conv2d {
            weight: format!("{prefix}.weight"),
            bias: Some(format!("{prefix}.bias")),
            options,
        }
    }

    pub fn apply(&self, cx: &mut TraceContext<'_>, x: &Value) -> Result<Value, TraceError> {
        match self {
            Layer::Linear { weight, bias } => cx.linear(x, weight, bias.as_deref()),
            Layer::Conv2d { weight, bias, options } => cx.conv2d(x, weight, bias.as_deref(), options),
            Layer::BatchNorm2d { prefix, eps } => cx.batch_norm2d(x, prefix, *eps),
            Layer::Relu => cx.relu(x),
            Layer::Sigmoid => cx.sigmoid(x),
            Layer::Tanh => cx.tanh(x),
            Layer::Silu => cx.silu(x),
            Layer::Gelu { approximate } => cx.gelu(x, approximate),
            Layer::MaxPool2d(options) => cx.max_pool2d(x, options),
            Layer::AvgPool2d(options) => cx.avg_pool2d(x, options),
            Layer::AdaptiveAvgPool2d(size) => cx.adaptive_avg_pool2d(x, *size),
            Layer::UpsampleNearest2d(scale) => cx.upsample_nearest2d(x, *scale),
            Layer::Flatten { start_dim, end_dim } => cx.flatten(x, *start_dim, *end_dim),
            Layer::Reshape(shape) => cx.reshape(x, shape),
            Layer::Permute(dims) => cx.permute(x, dims),
            Layer::Softmax(dim) => cx.softmax(x, *dim),
            Layer::LayerNorm { prefix, normalized_shape, eps } => cx.layer_norm(x, prefix, normalized_shape, *eps),
            Layer::Pad { pad, mode, value } => cx.pad(x, pad, *mode, *value),
            Layer::Dropout(p) => cx.dropout(x, *p),
            Layer::Residual(body) => {
                let mut h = x.clone();
                for layer in body {
                    h = layer.apply(cx, &h)?;
                }
                cx.add(x, &h)
            }
        }
    }
}

/// Single-input model applying its layers in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequential {
    name: String,
    layers: Vec<Layer>,
}

impl Sequential {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
        }
    }

    pub fn with(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
}

impl Model for Sequential {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, cx: &mut TraceContext<'_>, inputs: &[Value]) -> Result<Vec<Value>, TraceError> {
        let mut x = inputs
            .first()
            .cloned()
            .ok_or_else(|| TraceError::UnknownValue("<model input>".to_string()))?;
        for layer in &self.layers {
            x = layer.apply(cx, &x)?;
        }
        Ok(vec![x])
    }
}
