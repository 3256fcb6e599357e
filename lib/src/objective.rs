use crate::{
    errors::{NumericInstability, ShapeMismatch},
    extractor::FeatureExtractor,
    lbfgs::Objective,
    loss::StyleTargetSet,
    tensor::{FeatureMap, Shape},
    Error,
};
use std::sync::Arc;

/// Maps a flattened, preprocessed candidate image to its aggregate style loss
/// and the gradient of that loss w.r.t. every pixel.
pub struct StyleObjective {
    extractor: Arc<FeatureExtractor>,
    targets: StyleTargetSet,
    shape: Shape,
    deepest: usize,
    guard_non_finite: bool,
}

impl StyleObjective {
    pub fn new(extractor: Arc<FeatureExtractor>, targets: StyleTargetSet) -> Result<Self, Error> {
        let deepest = match targets.deepest() {
            Some(d) => d,
            None => {
                return Err(ShapeMismatch {
                    what: "style target set".to_owned(),
                    expected: vec![1],
                    actual: vec![0],
                }
                .into())
            }
        };

        Ok(Self {
            shape: extractor.input_shape(),
            extractor,
            targets,
            deepest,
            guard_non_finite: true,
        })
    }

    /// Whether a non-finite loss or gradient is reported as an error, on by
    /// default
    pub fn guard_non_finite(mut self, guard: bool) -> Self {
        self.guard_non_finite = guard;
        self
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn targets(&self) -> &StyleTargetSet {
        &self.targets
    }

    pub fn evaluate(&self, x: &[f64]) -> Result<(f64, Vec<f64>), Error> {
        if x.len() != self.shape.len() {
            return Err(ShapeMismatch {
                what: "candidate vector".to_owned(),
                expected: vec![self.shape.len()],
                actual: vec![x.len()],
            }
            .into());
        }

        let input = FeatureMap::from_vec(self.shape, x.to_vec())?;
        let trace = self.extractor.forward(&input, self.deepest)?;

        let activations = self
            .targets
            .targets()
            .iter()
            .map(|t| {
                trace
                    .output(t.index)
                    .ok_or_else(|| Error::MissingLayer(t.name.clone()))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let (loss, grads) = self.targets.loss_and_gradients(activations)?;

        let grad = self.extractor.backward(&trace, grads)?.into_vec();

        if self.guard_non_finite {
            check_finite("loss", None, loss)?;
            if let Some((i, g)) = grad.iter().enumerate().find(|(_, g)| !g.is_finite()) {
                check_finite("gradient", Some(i), *g)?;
            }
        }

        tracing::trace!(loss, "evaluated style objective");

        Ok((loss, grad))
    }
}

fn check_finite(what: &'static str, index: Option<usize>, value: f64) -> Result<(), Error> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::NumericInstability(NumericInstability {
            what,
            index,
            value,
        }))
    }
}

impl Objective for StyleObjective {
    fn dimension(&self) -> usize {
        self.shape.len()
    }

    fn evaluate(&self, x: &[f64]) -> Result<(f64, Vec<f64>), Error> {
        StyleObjective::evaluate(self, x)
    }
}
