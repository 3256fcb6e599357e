//! Builds the network the style statistics are read from.
//!
//! The extractor mirrors its backbone layer for layer. Convolutions are used
//! as-is, straight out of the shared backbone, while every max-subsampling
//! layer is swapped for an average-subsampling layer with the same window
//! and stride. Taking the max throws away everything but the dominant
//! activation of each window, which flattens the spatial correlations the
//! Gram matrices are meant to capture.

use crate::{
    backbone::{Backbone, Conv2d, LayerKind, Pool},
    errors::ShapeMismatch,
    ops,
    tensor::{FeatureMap, Shape},
    Error,
};
use std::{collections::HashMap, sync::Arc};

/// A layer of the extractor, borrowed from the backbone
#[derive(Copy, Clone, Debug)]
pub enum ExtractorLayer<'a> {
    Conv2d(&'a Conv2d),
    AvgPool(Pool),
}

impl<'a> ExtractorLayer<'a> {
    fn from_kind(kind: &'a LayerKind) -> Self {
        match kind {
            LayerKind::Conv2d(conv) => Self::Conv2d(conv),
            // average with an identical window, so output shapes don't change
            LayerKind::MaxPool(pool) | LayerKind::AvgPool(pool) => Self::AvgPool(*pool),
        }
    }
}

/// Every intermediate output of a forward pass, needed to run the pass in
/// reverse
pub struct Trace {
    outputs: Vec<FeatureMap>,
}

impl Trace {
    /// The output of layer `index`, if the pass reached it
    pub fn output(&self, index: usize) -> Option<&FeatureMap> {
        self.outputs.get(index)
    }

    /// The number of layers that were run
    pub fn depth(&self) -> usize {
        self.outputs.len()
    }
}

/// A feedforward network for a fixed input shape, exposing the output of
/// every named layer.
pub struct FeatureExtractor {
    backbone: Arc<Backbone>,
    input_shape: Shape,
    output_shapes: Vec<Shape>,
    names: HashMap<String, usize>,
    max_thread_count: usize,
}

impl FeatureExtractor {
    /// Builds an extractor for `input_shape` images from the backbone.
    ///
    /// The input must have 3 channels, and must be large enough that no
    /// layer ends up with an empty output.
    pub fn build(
        backbone: Arc<Backbone>,
        input_shape: Shape,
        max_thread_count: usize,
    ) -> Result<Self, Error> {
        if input_shape.channels != 3 || input_shape.is_empty() {
            return Err(ShapeMismatch {
                what: "extractor input".to_owned(),
                expected: vec![input_shape.height, input_shape.width, 3],
                actual: input_shape.to_vec(),
            }
            .into());
        }

        let mut output_shapes = Vec::with_capacity(backbone.layers().len());
        let mut names = HashMap::with_capacity(backbone.layers().len());
        let mut shape = input_shape;

        for (index, layer) in backbone.layers().iter().enumerate() {
            let (out, min_extent) = match ExtractorLayer::from_kind(&layer.kind) {
                ExtractorLayer::Conv2d(conv) => (
                    ops::conv_output_shape(conv, shape),
                    conv.kernel_size.saturating_sub(2 * conv.padding).max(1),
                ),
                ExtractorLayer::AvgPool(pool) => (ops::pool_output_shape(pool, shape), pool.window),
            };

            shape = out.ok_or_else(|| {
                Error::ShapeMismatch(ShapeMismatch {
                    what: format!("the input of layer '{}'", layer.name),
                    expected: vec![min_extent, min_extent, shape.channels],
                    actual: shape.to_vec(),
                })
            })?;

            output_shapes.push(shape);
            names.insert(layer.name.clone(), index);
        }

        tracing::debug!(
            layers = output_shapes.len(),
            height = input_shape.height,
            width = input_shape.width,
            "built feature extractor"
        );

        Ok(Self {
            backbone,
            input_shape,
            output_shapes,
            names,
            max_thread_count: max_thread_count.max(1),
        })
    }

    #[inline]
    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    #[inline]
    pub fn backbone(&self) -> &Arc<Backbone> {
        &self.backbone
    }

    pub fn len(&self) -> usize {
        self.output_shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.output_shapes.is_empty()
    }

    pub fn layer(&self, index: usize) -> ExtractorLayer<'_> {
        ExtractorLayer::from_kind(&self.backbone.layers()[index].kind)
    }

    pub fn layer_name(&self, index: usize) -> &str {
        &self.backbone.layers()[index].name
    }

    /// All layers in topological order
    pub fn layers(&self) -> impl Iterator<Item = (&str, ExtractorLayer<'_>)> + '_ {
        self.backbone
            .layers()
            .iter()
            .map(|l| (l.name.as_str(), ExtractorLayer::from_kind(&l.kind)))
    }

    pub fn layer_index(&self, name: &str) -> Result<usize, Error> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| Error::MissingLayer(name.to_owned()))
    }

    #[inline]
    pub fn output_shape(&self, index: usize) -> Shape {
        self.output_shapes[index]
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.layers().map(|(name, _)| name)
    }

    /// The first convolution of every block, ie. the first convolution after
    /// the input and after each subsampling layer. For VGG style backbones
    /// these are the `block{n}_conv1` layers.
    pub fn default_style_layers(&self) -> Vec<String> {
        let mut block_start = true;
        let mut names = Vec::new();

        for (name, layer) in self.layers() {
            match layer {
                ExtractorLayer::Conv2d(_) if block_start => {
                    names.push(name.to_owned());
                    block_start = false;
                }
                ExtractorLayer::Conv2d(_) => {}
                ExtractorLayer::AvgPool(_) => block_start = true,
            }
        }

        names
    }

    /// The number of layers that reduce spatial resolution, all of which
    /// average
    pub fn pool_count(&self) -> usize {
        self.layers()
            .filter(|(_, l)| matches!(l, ExtractorLayer::AvgPool(_)))
            .count()
    }

    fn input_shape_of(&self, index: usize) -> Shape {
        if index == 0 {
            self.input_shape
        } else {
            self.output_shapes[index - 1]
        }
    }

    /// Runs the layers `0..=deepest`, keeping every intermediate output
    pub fn forward(&self, input: &FeatureMap, deepest: usize) -> Result<Trace, Error> {
        if input.shape() != self.input_shape {
            return Err(ShapeMismatch {
                what: "extractor input".to_owned(),
                expected: self.input_shape.to_vec(),
                actual: input.shape().to_vec(),
            }
            .into());
        }

        let depth = (deepest + 1).min(self.len());
        let mut outputs: Vec<FeatureMap> = Vec::with_capacity(depth);

        for index in 0..depth {
            let src = outputs.last().unwrap_or(input);
            let shape = self.output_shapes[index];

            let out = match self.layer(index) {
                ExtractorLayer::Conv2d(conv) => {
                    ops::conv_forward(conv, src, shape, self.max_thread_count)
                }
                ExtractorLayer::AvgPool(pool) => {
                    ops::avg_pool_forward(pool, src, shape, self.max_thread_count)
                }
            };

            outputs.push(out);
        }

        Ok(Trace { outputs })
    }

    /// Back-propagates gradients w.r.t. the outputs of any number of layers
    /// of a traced pass to the extractor input.
    ///
    /// Gradients given for the same layer more than once are summed.
    pub fn backward<I>(&self, trace: &Trace, grads: I) -> Result<FeatureMap, Error>
    where
        I: IntoIterator<Item = (usize, FeatureMap)>,
    {
        let mut pending: Vec<Option<FeatureMap>> = vec![None; trace.depth()];

        for (index, grad) in grads {
            let expected = match trace.output(index) {
                Some(out) => out.shape(),
                None => {
                    return Err(ShapeMismatch {
                        what: format!(
                            "gradient for layer {}, past the traced depth {},",
                            index,
                            trace.depth()
                        ),
                        expected: Vec::new(),
                        actual: grad.shape().to_vec(),
                    }
                    .into())
                }
            };

            if grad.shape() != expected {
                return Err(ShapeMismatch {
                    what: format!("gradient for layer '{}'", self.layer_name(index)),
                    expected: expected.to_vec(),
                    actual: grad.shape().to_vec(),
                }
                .into());
            }

            match pending[index] {
                Some(ref mut acc) => {
                    for (a, g) in acc.as_mut_slice().iter_mut().zip(grad.as_slice()) {
                        *a += g;
                    }
                }
                None => pending[index] = Some(grad),
            }
        }

        let mut grad: Option<FeatureMap> = None;

        for index in (0..trace.depth()).rev() {
            if let Some(g) = pending[index].take() {
                grad = Some(match grad {
                    Some(mut acc) => {
                        for (a, g) in acc.as_mut_slice().iter_mut().zip(g.as_slice()) {
                            *a += g;
                        }
                        acc
                    }
                    None => g,
                });
            }

            let g = match grad {
                Some(ref g) => g,
                None => continue,
            };

            let in_shape = self.input_shape_of(index);
            grad = Some(match self.layer(index) {
                ExtractorLayer::Conv2d(conv) => ops::conv_backward(
                    conv,
                    in_shape,
                    &trace.outputs[index],
                    g,
                    self.max_thread_count,
                ),
                ExtractorLayer::AvgPool(pool) => {
                    ops::avg_pool_backward(pool, in_shape, g, self.max_thread_count)
                }
            });
        }

        Ok(grad.unwrap_or_else(|| FeatureMap::zeros(self.input_shape)))
    }

    /// Returns the outputs of the named layers for `input`, in the order the
    /// names were given
    pub fn extract<S: AsRef<str>>(
        &self,
        input: &FeatureMap,
        names: &[S],
    ) -> Result<Vec<FeatureMap>, Error> {
        let indices = names
            .iter()
            .map(|n| self.layer_index(n.as_ref()))
            .collect::<Result<Vec<_>, Error>>()?;

        let deepest = match indices.iter().max() {
            Some(d) => *d,
            None => return Ok(Vec::new()),
        };

        let trace = self.forward(input, deepest)?;

        Ok(indices
            .iter()
            .map(|index| trace.outputs[*index].clone())
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backbone::Layout;

    fn tiny() -> Arc<Backbone> {
        Arc::new(Backbone::from_layout(&Layout::new(vec![vec![4], vec![6, 5]]), 3))
    }

    fn input(shape: Shape) -> FeatureMap {
        let data = (0..shape.len()).map(|i| (i as f64 * 0.71).sin() * 50.0).collect();
        FeatureMap::from_vec(shape, data).unwrap()
    }

    #[test]
    fn swaps_every_max_pool() {
        let backbone = Arc::new(Backbone::from_layout(&Layout::vgg19(), 0));
        let extractor =
            FeatureExtractor::build(backbone.clone(), Shape::new(64, 64, 3), 1).unwrap();

        assert_eq!(extractor.len(), backbone.layers().len());
        assert_eq!(extractor.pool_count(), backbone.subsampling_count());
        assert_eq!(extractor.pool_count(), 5);
        assert!(extractor.layer_names().eq(backbone.layers().iter().map(|l| l.name.as_str())));

        for ((name, layer), original) in extractor.layers().zip(backbone.layers()) {
            assert_eq!(name, original.name);

            match (layer, &original.kind) {
                (ExtractorLayer::AvgPool(pool), LayerKind::MaxPool(orig)) => {
                    assert_eq!(pool, *orig)
                }
                // the very same weights, not a copy
                (ExtractorLayer::Conv2d(conv), LayerKind::Conv2d(orig)) => {
                    assert!(std::ptr::eq(conv, orig))
                }
                (layer, kind) => panic!("{} became {:?} from {:?}", name, layer, kind),
            }
        }
    }

    #[test]
    fn default_layers_start_each_block() {
        let backbone = Arc::new(Backbone::from_layout(&Layout::vgg16(), 0));
        let extractor = FeatureExtractor::build(backbone, Shape::new(32, 32, 3), 1).unwrap();

        assert_eq!(
            extractor.default_style_layers(),
            vec![
                "block1_conv1",
                "block2_conv1",
                "block3_conv1",
                "block4_conv1",
                "block5_conv1"
            ]
        );
    }

    #[test]
    fn shapes_shrink_with_depth() {
        let extractor = FeatureExtractor::build(tiny(), Shape::new(8, 12, 3), 1).unwrap();

        let pool = extractor.layer_index("block2_pool").unwrap();
        assert_eq!(extractor.output_shape(pool), Shape::new(2, 3, 5));
        assert_eq!(
            extractor.output_shape(extractor.layer_index("block1_conv1").unwrap()),
            Shape::new(8, 12, 4)
        );
    }

    #[test]
    fn too_small_input() {
        assert!(matches!(
            FeatureExtractor::build(tiny(), Shape::new(3, 3, 3), 1),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(matches!(
            FeatureExtractor::build(tiny(), Shape::new(8, 8, 1), 1),
            Err(Error::ShapeMismatch(_))
        ));
    }

    #[test]
    fn missing_layer() {
        let extractor = FeatureExtractor::build(tiny(), Shape::new(8, 8, 3), 1).unwrap();

        match extractor.extract(&input(Shape::new(8, 8, 3)), &["block1_conv1", "block7_conv1"]) {
            Err(Error::MissingLayer(name)) => assert_eq!(name, "block7_conv1"),
            other => panic!("unexpected {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn extract_matches_forward() {
        let extractor = FeatureExtractor::build(tiny(), Shape::new(8, 8, 3), 2).unwrap();
        let img = input(Shape::new(8, 8, 3));

        let outs = extractor
            .extract(&img, &["block2_conv1", "block1_conv1", "block2_conv1"])
            .unwrap();
        let trace = extractor.forward(&img, 10).unwrap();

        assert_eq!(trace.depth(), extractor.len());
        assert_eq!(&outs[0], trace.output(2).unwrap());
        assert_eq!(&outs[1], trace.output(0).unwrap());
        assert_eq!(outs[0], outs[2]);
    }

    #[test]
    fn rejects_wrong_input_shape() {
        let extractor = FeatureExtractor::build(tiny(), Shape::new(8, 8, 3), 1).unwrap();
        assert!(extractor.forward(&input(Shape::new(8, 9, 3)), 0).is_err());
    }

    #[test]
    fn backward_matches_finite_differences() {
        let extractor = FeatureExtractor::build(tiny(), Shape::new(4, 4, 3), 1).unwrap();
        let img = input(Shape::new(4, 4, 3));
        let target = extractor.layer_index("block2_conv2").unwrap();
        let shape = extractor.output_shape(target);
        let probe = input(shape);

        // L = <probe, layer output>
        let loss = |x: &FeatureMap| -> f64 {
            let trace = extractor.forward(x, target).unwrap();
            trace
                .output(target)
                .unwrap()
                .as_slice()
                .iter()
                .zip(probe.as_slice())
                .map(|(a, b)| a * b)
                .sum()
        };

        let trace = extractor.forward(&img, target).unwrap();
        let analytic = extractor.backward(&trace, vec![(target, probe.clone())]).unwrap();
        let eps = 1e-4;

        for idx in (0..img.as_slice().len()).step_by(5) {
            let mut plus = img.clone();
            plus.as_mut_slice()[idx] += eps;
            let mut minus = img.clone();
            minus.as_mut_slice()[idx] -= eps;

            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            let exact = analytic.as_slice()[idx];
            assert!(
                (numeric - exact).abs() <= 1e-4 * (1.0 + exact.abs()),
                "element {}: {} vs {}",
                idx,
                numeric,
                exact
            );
        }
    }

    #[test]
    fn backward_without_gradients_is_zero() {
        let extractor = FeatureExtractor::build(tiny(), Shape::new(4, 4, 3), 1).unwrap();
        let trace = extractor.forward(&input(Shape::new(4, 4, 3)), 2).unwrap();
        let grad = extractor.backward(&trace, Vec::new()).unwrap();

        assert!(grad.as_slice().iter().all(|g| *g == 0.0));
    }
}
