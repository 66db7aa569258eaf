use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::ir::{Dim, Tensor};
use crate::runtime::TensorData;

const BOUNDARY_VALUES: [f32; 7] = [0.0, 1.0, -1.0, 1e-6, -1e-6, 1e3, -1e3];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SampleKind {
    /// Seeded uniform values in [-1, 1] at the configured sample shapes.
    Primary,
    /// Values cycling over zero, unit, tiny and large magnitudes.
    Boundary,
    /// The symbolic leading axis set to zero.
    ZeroBatch,
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SampleKind::Primary => "primary",
            SampleKind::Boundary => "boundary",
            SampleKind::ZeroBatch => "zero_batch",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub kind: SampleKind,
    /// One tensor per graph input, in declaration order.
    pub values: Vec<TensorData>,
}

pub struct SampleGenerator {
    seed: u64,
    edge_cases: bool,
}

impl SampleGenerator {
    pub fn new(seed: u64, edge_cases: bool) -> Self {
        Self { seed, edge_cases }
    }

    /// Builds the validation samples for `inputs` at the concrete `shapes`.
    ///
    /// The primary sample always comes first and depends only on the seed.
    pub fn generate(&self, inputs: &[Tensor], shapes: &[Vec<usize>]) -> Vec<Sample> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let primary = shapes
            .iter()
            .map(|shape| TensorData::from_fn(shape.clone(), |_| rng.gen_range(-1.0f32..=1.0)))
            .collect();
        let mut samples = vec![Sample {
            kind: SampleKind::Primary,
            values: primary,
        }];
        if !self.edge_cases {
            return samples;
        }

        let mut offset = 0;
        let boundary = shapes
            .iter()
            .map(|shape| {
                let start = offset;
                offset += 1;
                TensorData::from_fn(shape.clone(), |i| BOUNDARY_VALUES[(start + i) % BOUNDARY_VALUES.len()])
            })
            .collect();
        samples.push(Sample {
            kind: SampleKind::Boundary,
            values: boundary,
        });

        let batch = inputs
            .iter()
            .find_map(|input| input.shape.first().and_then(Dim::symbol).map(str::to_string));
        if let Some(batch) = batch {
            let values = inputs
                .iter()
                .zip(shapes)
                .map(|(input, shape)| {
                    let shape = input
                        .shape
                        .iter()
                        .zip(shape)
                        .map(|(dim, &size)| if dim.symbol() == Some(batch.as_str()) { 0 } else { size })
                        .collect();
                    TensorData::zeros(shape)
                })
                .collect();
            samples.push(Sample {
                kind: SampleKind::ZeroBatch,
                values,
            });
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{fixed_shape, DataType};

    fn inputs() -> Vec<Tensor> {
        vec![
            Tensor::value("a", vec![Dim::Symbolic("batch".into()), Dim::Fixed(3)], DataType::F32),
            Tensor::value("b", fixed_shape(&[2]), DataType::F32),
        ]
    }

    #[test]
    fn test_primary_sample_is_seeded() {
        let shapes = vec![vec![2, 3], vec![2]];
        let first = SampleGenerator::new(7, false).generate(&inputs(), &shapes);
        let second = SampleGenerator::new(7, false).generate(&inputs(), &shapes);
        let other = SampleGenerator::new(8, false).generate(&inputs(), &shapes);
        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first.len(), 1);
        assert!(first[0].values[0].data().iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_edge_samples() {
        let shapes = vec![vec![2, 3], vec![2]];
        let samples = SampleGenerator::new(0, true).generate(&inputs(), &shapes);
        let kinds: Vec<SampleKind> = samples.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, [SampleKind::Primary, SampleKind::Boundary, SampleKind::ZeroBatch]);
        assert_eq!(&samples[1].values[0].data()[..4], &[0.0, 1.0, -1.0, 1e-6]);
        assert_eq!(samples[2].values[0].shape(), &[0, 3]);
        assert_eq!(samples[2].values[1].shape(), &[2]);
    }

    #[test]
    fn test_no_zero_batch_without_symbolic_batch() {
        let inputs = vec![Tensor::value("a", fixed_shape(&[1, 3]), DataType::F32)];
        let samples = SampleGenerator::new(0, true).generate(&inputs, &[vec![1, 3]]);
        assert_eq!(samples.len(), 2);
    }
}
