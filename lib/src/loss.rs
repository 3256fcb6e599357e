//! Style loss between Gram matrices, and the fixed per-layer targets computed
//! from the style image.

use crate::{
    errors::ShapeMismatch,
    extractor::FeatureExtractor,
    gram::GramMatrix,
    tensor::FeatureMap,
    Error,
};

fn check_channels(candidate: &GramMatrix, target: &GramMatrix) -> Result<(), ShapeMismatch> {
    if candidate.channels() != target.channels() {
        return Err(ShapeMismatch {
            what: "candidate gram matrix".to_owned(),
            expected: vec![target.channels(), target.channels()],
            actual: vec![candidate.channels(), candidate.channels()],
        });
    }

    Ok(())
}

/// Mean of the squared elementwise differences of two Gram matrices
pub fn style_loss(candidate: &GramMatrix, target: &GramMatrix) -> Result<f64, Error> {
    check_channels(candidate, target)?;

    let sum: f64 = candidate
        .as_slice()
        .iter()
        .zip(target.as_slice())
        .map(|(c, t)| (c - t) * (c - t))
        .sum();

    Ok(sum / candidate.as_slice().len() as f64)
}

/// Style loss between two activations of the same shape
pub fn layer_style_loss(candidate: &FeatureMap, target: &FeatureMap) -> Result<f64, Error> {
    if candidate.shape() != target.shape() {
        return Err(ShapeMismatch {
            what: "candidate activation".to_owned(),
            expected: target.shape().to_vec(),
            actual: candidate.shape().to_vec(),
        }
        .into());
    }

    style_loss(&GramMatrix::new(candidate), &GramMatrix::new(target))
}

/// The style loss of an activation and its gradient w.r.t. that activation
fn style_loss_and_gradient(
    activation: &FeatureMap,
    target: &GramMatrix,
) -> Result<(f64, FeatureMap), Error> {
    let gram = GramMatrix::new(activation);
    check_channels(&gram, target)?;

    let n = gram.as_slice().len() as f64;
    let mut loss = 0.0;
    let grad: Vec<f64> = gram
        .as_slice()
        .iter()
        .zip(target.as_slice())
        .map(|(c, t)| {
            let d = c - t;
            loss += d * d;
            2.0 * d / n
        })
        .collect();

    Ok((loss / n, GramMatrix::backward(activation, &grad)?))
}

/// The fixed style statistics of one layer
#[derive(Clone, Debug)]
pub struct StyleTarget {
    pub(crate) name: String,
    pub(crate) index: usize,
    pub(crate) weight: f64,
    pub(crate) gram: GramMatrix,
}

impl StyleTarget {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn gram(&self) -> &GramMatrix {
        &self.gram
    }
}

/// The Gram matrices of the style image at every selected layer.
///
/// Computed once when a session is built, and never modified afterwards.
#[derive(Clone, Debug)]
pub struct StyleTargetSet {
    targets: Vec<StyleTarget>,
}

impl StyleTargetSet {
    /// Runs the (preprocessed) style image through the extractor and keeps the
    /// Gram matrix of each named layer.
    ///
    /// `weights`, when given, must have one entry per layer. Without it every
    /// layer contributes with a weight of 1.
    pub fn compute<S: AsRef<str>>(
        extractor: &FeatureExtractor,
        style: &FeatureMap,
        layers: &[S],
        weights: Option<&[f64]>,
    ) -> Result<Self, Error> {
        if let Some(weights) = weights {
            if weights.len() != layers.len() {
                return Err(ShapeMismatch {
                    what: "layer weights".to_owned(),
                    expected: vec![layers.len()],
                    actual: vec![weights.len()],
                }
                .into());
            }
        }

        let activations = extractor.extract(style, layers)?;

        let targets = layers
            .iter()
            .zip(activations.iter())
            .enumerate()
            .map(|(i, (name, act))| -> Result<StyleTarget, Error> {
                Ok(StyleTarget {
                    name: name.as_ref().to_owned(),
                    index: extractor.layer_index(name.as_ref())?,
                    weight: weights.map_or(1.0, |w| w[i]),
                    gram: GramMatrix::new(act),
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self { targets })
    }

    pub fn targets(&self) -> &[StyleTarget] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// The index of the deepest extractor layer any target depends on
    pub fn deepest(&self) -> Option<usize> {
        self.targets.iter().map(|t| t.index).max()
    }

    /// Weighted sum of the style losses of activations taken at the target
    /// layers, in target order
    pub fn loss(&self, activations: &[FeatureMap]) -> Result<f64, Error> {
        self.check_len(activations.len())?;

        let mut total = 0.0;
        for (target, act) in self.targets.iter().zip(activations) {
            total += target.weight * style_loss(&GramMatrix::new(act), &target.gram)?;
        }

        Ok(total)
    }

    /// Like `loss`, but also returns the gradient w.r.t. each activation,
    /// paired with the extractor layer it belongs to
    pub fn loss_and_gradients<'a, I>(
        &self,
        activations: I,
    ) -> Result<(f64, Vec<(usize, FeatureMap)>), Error>
    where
        I: IntoIterator<Item = &'a FeatureMap>,
    {
        let mut total = 0.0;
        let mut grads = Vec::with_capacity(self.targets.len());
        let mut targets = self.targets.iter();

        for act in activations {
            let target = match targets.next() {
                Some(t) => t,
                None => return Err(self.count_mismatch(grads.len() + 1)),
            };

            let (loss, mut grad) = style_loss_and_gradient(act, &target.gram)?;
            if target.weight != 1.0 {
                for g in grad.as_mut_slice() {
                    *g *= target.weight;
                }
            }

            total += target.weight * loss;
            grads.push((target.index, grad));
        }

        self.check_len(grads.len())?;
        Ok((total, grads))
    }

    fn check_len(&self, len: usize) -> Result<(), Error> {
        if len != self.targets.len() {
            return Err(self.count_mismatch(len));
        }
        Ok(())
    }

    fn count_mismatch(&self, len: usize) -> Error {
        ShapeMismatch {
            what: "activation list".to_owned(),
            expected: vec![self.targets.len()],
            actual: vec![len],
        }
        .into()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backbone::{Backbone, Layout},
        tensor::Shape,
    };
    use std::sync::Arc;

    fn map(shape: Shape, phase: f64) -> FeatureMap {
        let data = (0..shape.len()).map(|i| (i as f64 * 0.3 + phase).sin()).collect();
        FeatureMap::from_vec(shape, data).unwrap()
    }

    #[test]
    fn identical_activations_have_zero_loss() {
        let a = map(Shape::new(4, 5, 3), 0.0);
        assert!(layer_style_loss(&a, &a.clone()).unwrap().abs() < 1e-15);
    }

    #[test]
    fn loss_is_positive_for_different_styles() {
        let a = map(Shape::new(4, 5, 3), 0.0);
        let b = map(Shape::new(4, 5, 3), 1.0);
        assert!(layer_style_loss(&a, &b).unwrap() > 0.0);
    }

    #[test]
    fn known_loss() {
        let a = FeatureMap::from_vec(Shape::new(1, 1, 2), vec![2.0, 0.0]).unwrap();
        let b = FeatureMap::zeros(Shape::new(1, 1, 2));

        // G(a) = [[2, 0], [0, 0]], mean of squares = 4 / 4
        assert_eq!(layer_style_loss(&a, &b).unwrap(), 1.0);
    }

    #[test]
    fn mismatched_shapes() {
        let a = map(Shape::new(4, 5, 3), 0.0);
        let b = map(Shape::new(4, 5, 2), 0.0);
        assert!(matches!(layer_style_loss(&a, &b), Err(Error::ShapeMismatch(_))));
        assert!(matches!(
            style_loss(&GramMatrix::new(&a), &GramMatrix::new(&b)),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn targets_sum_layers() {
        let backbone = Arc::new(Backbone::from_layout(&Layout::new(vec![vec![3], vec![4]]), 1));
        let extractor = FeatureExtractor::build(backbone, Shape::new(6, 6, 3), 1).unwrap();
        let style = map(Shape::new(6, 6, 3), 0.5);
        let candidate = map(Shape::new(6, 6, 3), 2.0);
        let layers = ["block1_conv1", "block2_conv1"];

        let targets = StyleTargetSet::compute(&extractor, &style, &layers, None).unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets.deepest(), Some(2));

        let acts = extractor.extract(&candidate, &layers).unwrap();
        let style_acts = extractor.extract(&style, &layers).unwrap();
        let expected = layer_style_loss(&acts[0], &style_acts[0]).unwrap()
            + layer_style_loss(&acts[1], &style_acts[1]).unwrap();

        assert!((targets.loss(&acts).unwrap() - expected).abs() < 1e-12);
        assert!(targets.loss(&style_acts).unwrap().abs() < 1e-15);

        let (loss, grads) = targets.loss_and_gradients(&acts).unwrap();
        assert!((loss - expected).abs() < 1e-12);
        assert_eq!(grads[0].0, 0);
        assert_eq!(grads[1].0, 2);

        let weighted =
            StyleTargetSet::compute(&extractor, &style, &layers, Some(&[2.0, 0.0][..])).unwrap();
        let single = layer_style_loss(&acts[0], &style_acts[0]).unwrap();
        assert!((weighted.loss(&acts).unwrap() - 2.0 * single).abs() < 1e-12);

        assert!(StyleTargetSet::compute(&extractor, &style, &layers, Some(&[1.0][..])).is_err());
        assert!(targets.loss(&acts[..1]).is_err());
    }
}
