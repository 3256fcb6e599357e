//! The Gram matrix style descriptor.
//!
//! For an activation with `C` channels, the Gram matrix holds the inner
//! product of every pair of flattened channel planes, normalized by the total
//! element count `H * W * C` so that layers of different sizes land on a
//! comparable scale.

use crate::{errors::ShapeMismatch, tensor::FeatureMap};

/// A symmetric `channels x channels` matrix, stored row-major
#[derive(Clone, Debug, PartialEq)]
pub struct GramMatrix {
    channels: usize,
    data: Vec<f64>,
}

impl GramMatrix {
    /// Computes the Gram matrix of an activation
    pub fn new(activation: &FeatureMap) -> Self {
        let shape = activation.shape();
        let c = shape.channels;
        let norm = 1.0 / shape.len() as f64;
        let mut data = vec![0.0; c * c];

        for i in 0..c {
            let a = activation.plane(i);
            for j in i..c {
                let b = activation.plane(j);
                let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();

                data[i * c + j] = dot * norm;
                data[j * c + i] = dot * norm;
            }
        }

        Self { channels: c, data }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channels
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.channels + j]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Pulls a gradient w.r.t. this Gram matrix back to the activation it was
    /// computed from, `dL/dX = (dL/dG + dL/dG^T) X / (H * W * C)`.
    ///
    /// `grad` is row-major with the same layout as the matrix itself.
    pub fn backward(activation: &FeatureMap, grad: &[f64]) -> Result<FeatureMap, ShapeMismatch> {
        let shape = activation.shape();
        let c = shape.channels;

        if grad.len() != c * c {
            return Err(ShapeMismatch {
                what: "gram matrix gradient".to_owned(),
                expected: vec![c, c],
                actual: vec![grad.len()],
            });
        }

        let norm = 1.0 / shape.len() as f64;
        let plane = shape.plane_len();
        let mut out = FeatureMap::zeros(shape);

        {
            let dst = out.as_mut_slice();
            for i in 0..c {
                let row = &mut dst[i * plane..(i + 1) * plane];

                for j in 0..c {
                    let coeff = (grad[i * c + j] + grad[j * c + i]) * norm;
                    if coeff == 0.0 {
                        continue;
                    }

                    for (d, x) in row.iter_mut().zip(activation.plane(j)) {
                        *d += coeff * x;
                    }
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tensor::Shape;
    use rand::{Rng, SeedableRng};

    fn random_map(shape: Shape, seed: u64) -> FeatureMap {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
        let data = (0..shape.len()).map(|_| rng.gen_range(-2.0..2.0)).collect();
        FeatureMap::from_vec(shape, data).unwrap()
    }

    #[test]
    fn known_values() {
        // two 1x2 channels: [1, 2] and [3, 4], N = 4
        let fm = FeatureMap::from_vec(Shape::new(1, 2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let g = GramMatrix::new(&fm);

        assert_eq!(g.channels(), 2);
        assert_eq!(g.as_slice(), &[5.0 / 4.0, 11.0 / 4.0, 11.0 / 4.0, 25.0 / 4.0]);
    }

    #[test]
    fn symmetric() {
        let g = GramMatrix::new(&random_map(Shape::new(5, 7, 6), 3));

        for i in 0..g.channels() {
            for j in 0..g.channels() {
                assert!((g.get(i, j) - g.get(j, i)).abs() < 1e-12);
            }
            assert!(g.get(i, i) >= 0.0);
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let fm = random_map(Shape::new(3, 2, 3), 11);
        let weights: Vec<f64> = (0..9).map(|i| (i as f64) - 3.5).collect();

        // L = sum(W .* G)
        let loss = |fm: &FeatureMap| -> f64 {
            GramMatrix::new(fm)
                .as_slice()
                .iter()
                .zip(&weights)
                .map(|(g, w)| g * w)
                .sum()
        };

        let analytic = GramMatrix::backward(&fm, &weights).unwrap();
        let eps = 1e-6;

        for idx in 0..fm.shape().len() {
            let mut plus = fm.clone();
            plus.as_mut_slice()[idx] += eps;
            let mut minus = fm.clone();
            minus.as_mut_slice()[idx] -= eps;

            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert!(
                (numeric - analytic.as_slice()[idx]).abs() < 1e-6,
                "element {}: {} vs {}",
                idx,
                numeric,
                analytic.as_slice()[idx]
            );
        }
    }

    #[test]
    fn backward_rejects_wrong_gradient_shape() {
        let fm = random_map(Shape::new(2, 2, 3), 1);
        assert!(GramMatrix::backward(&fm, &[0.0; 4]).is_err());
    }
}
