use crate::*;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::{fmt, time::Duration, time::Instant};

/// Candidate pixels are clipped to `[-PIXEL_LIMIT, PIXEL_LIMIT]` after every
/// macro-iteration
pub const PIXEL_LIMIT: f64 = 127.0;

/// The states a synthesis run moves through
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Iterating,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "initializing",
            Self::Iterating => "iterating",
            Self::Done => "done",
        })
    }
}

/// Style synthesis session.
///
/// Calling `run()` will synthesize a new image and return it, consuming the
/// session in the process. You can provide a `GeneratorProgress`
/// implementation to get an update with the current candidate and its loss
/// after every macro-iteration.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use style_synthesis as ss;
///
/// let backbone = Arc::new(ss::Backbone::open("vgg19.weights").expect("failed to load weights"));
///
/// let session = ss::Session::builder()
///     .seed(10)
///     .style_image(&"imgs/starry_night.jpg")
///     .backbone(backbone)
///     .build().expect("failed to build session");
///
/// let generated = session.run(None).expect("synthesis failed");
/// generated.save("my_generated_img.png").expect("failed to save image");
/// ```
pub struct Session {
    objective: StyleObjective,
    preprocessing: Preprocessing,
    params: Parameters,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// The names of the layers whose style is matched
    pub fn style_layers(&self) -> impl Iterator<Item = &str> + '_ {
        self.objective.targets().targets().iter().map(|t| t.name())
    }

    /// The shape of the image that will be synthesized
    pub fn output_shape(&self) -> Shape {
        self.objective.shape()
    }

    /// Runs the optimization and outputs the synthesized image.
    pub fn run(
        self,
        mut progress: Option<Box<dyn GeneratorProgress>>,
    ) -> Result<GeneratedImage, Error> {
        let shape = self.objective.shape();
        let iterations = self.params.iterations as usize;

        tracing::info!(
            phase = %Phase::Initializing,
            height = shape.height,
            width = shape.width,
            seed = self.params.seed,
            "starting style synthesis"
        );

        let start = Instant::now();
        let mut rng = rand_pcg::Pcg32::seed_from_u64(self.params.seed);
        let mut candidate: Vec<f64> = StandardNormal
            .sample_iter(&mut rng)
            .take(shape.len())
            .collect();

        let minimizer = Lbfgs {
            history_size: self.params.history_size,
            max_evaluations: self.params.max_evaluations as usize,
            gradient_tolerance: self.params.gradient_tolerance,
        };

        let mut loss_history = Vec::with_capacity(iterations.min(1024));

        tracing::info!(phase = %Phase::Iterating, iterations, "optimizing");

        for iteration in 0..iterations {
            let min = minimizer
                .minimize(&self.objective, candidate)
                .map_err(|e| e.in_stage(Stage::Optimization))?;

            candidate = min.x;
            clip(&mut candidate);
            loss_history.push(min.value);

            tracing::debug!(
                iteration = iteration + 1,
                loss = min.value,
                evaluations = min.evaluations,
                termination = ?min.termination,
                "finished macro-iteration"
            );

            if let Some(ref mut progress) = progress {
                progress.update(ProgressUpdate {
                    candidate: &candidate,
                    shape,
                    loss: min.value,
                    total: ProgressStat {
                        current: iteration + 1,
                        total: iterations,
                    },
                    evaluations: ProgressStat {
                        current: min.evaluations,
                        total: minimizer.max_evaluations,
                    },
                    elapsed: start.elapsed(),
                });
            }

            if let Some(tolerance) = self.params.convergence_tolerance {
                if has_converged(&loss_history, tolerance) {
                    tracing::info!(
                        iteration = iteration + 1,
                        tolerance,
                        "loss stopped improving, stopping early"
                    );
                    break;
                }
            }
        }

        let candidate = FeatureMap::from_vec(shape, candidate)?;
        let pixels = utils::deprocess(&candidate, &self.preprocessing);

        tracing::info!(
            phase = %Phase::Done,
            elapsed = ?start.elapsed(),
            loss = loss_history.last().copied().unwrap_or(f64::NAN),
            "style synthesis finished"
        );

        Ok(GeneratedImage {
            dims: Dims::new(shape.width as u32, shape.height as u32),
            pixels,
            loss_history,
        })
    }
}

fn clip(candidate: &mut [f64]) {
    for v in candidate {
        *v = v.max(-PIXEL_LIMIT).min(PIXEL_LIMIT);
    }
}

/// Whether the relative improvement of the last macro-iteration is below the
/// tolerance
fn has_converged(history: &[f64], tolerance: f64) -> bool {
    match history {
        [.., prev, last] => {
            let improvement = (prev - last) / prev.abs().max(f64::MIN_POSITIVE);
            improvement < tolerance
        }
        _ => false,
    }
}

/// Builds a session by setting parameters and adding the style image and
/// backbone, calling `build` will load the style image and compute its style
/// statistics
#[derive(Default)]
pub struct SessionBuilder<'a> {
    style: Option<ImageSource<'a>>,
    backbone: Option<Arc<Backbone>>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the image whose style will be synthesized. The synthesized image
    /// has the same dimensions as the style image, after `resize_input`.
    pub fn style_image<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// The network the style statistics are computed with. The weights are
    /// never modified, so the same backbone can be shared by any number of
    /// sessions.
    pub fn backbone(mut self, backbone: Arc<Backbone>) -> Self {
        self.backbone = Some(backbone);
        self
    }

    /// The number of macro-iterations. The candidate is clipped and the loss
    /// recorded after each one.
    ///
    /// Default: 10
    pub fn iterations(mut self, count: u32) -> Self {
        self.params.iterations = count;
        self
    }

    /// The maximum number of loss evaluations L-BFGS may make during a single
    /// macro-iteration.
    ///
    /// Default: 20
    pub fn max_evaluations(mut self, count: u32) -> Self {
        self.params.max_evaluations = count;
        self
    }

    /// The layers whose Gram matrices are matched.
    ///
    /// Default: the first convolution of every block, which for VGG
    /// backbones is `block1_conv1` through `block5_conv1`
    pub fn layers<S: Into<String>, I: IntoIterator<Item = S>>(mut self, layers: I) -> Self {
        self.params.layers = Some(layers.into_iter().map(|s| s.into()).collect());
        self
    }

    /// Multiplies the loss of each layer by a weight, one weight per layer in
    /// the same order as the layers.
    ///
    /// Default: every layer has a weight of 1
    pub fn layer_weights<I: IntoIterator<Item = f64>>(mut self, weights: I) -> Self {
        self.params.layer_weights = Some(weights.into_iter().collect());
        self
    }

    /// Changes the seed of the initial noise image.
    ///
    /// Default: 0
    pub fn seed(mut self, value: u64) -> Self {
        self.params.seed = value;
        self
    }

    /// Overwrite the style image size
    pub fn resize_input(mut self, dims: Dims) -> Self {
        self.params.resize_input = Some(dims);
        self
    }

    /// Controls the maximum number of threads the convolutions are spread
    /// across.
    ///
    /// The result is the same regardless of thread count.
    ///
    /// Default: The number of logical cores on this system.
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Stops before all macro-iterations have run once the relative loss
    /// improvement of a macro-iteration drops below `tolerance`.
    ///
    /// Default: disabled, every macro-iteration runs
    pub fn convergence_tolerance(mut self, tolerance: f64) -> Self {
        self.params.convergence_tolerance = Some(tolerance);
        self
    }

    /// L-BFGS stops a macro-iteration early once every gradient component is
    /// at most this large.
    ///
    /// Default: 1e-5
    pub fn gradient_tolerance(mut self, tolerance: f64) -> Self {
        self.params.gradient_tolerance = tolerance;
        self
    }

    /// The number of curvature pairs L-BFGS remembers.
    ///
    /// Default: 10
    pub fn history_size(mut self, size: usize) -> Self {
        self.params.history_size = size;
        self
    }

    /// Fail the run as soon as the loss or its gradient is NaN or infinite.
    ///
    /// Default: true
    pub fn guard_non_finite(mut self, guard: bool) -> Self {
        self.params.guard_non_finite = guard;
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or
    /// inputs were specified.
    pub fn build(mut self) -> Result<Session, Error> {
        self.check_parameters_validity()?;

        let style = self.style.take().ok_or(Error::NoStyleImage)?;
        let backbone = self.backbone.take().ok_or(Error::NoBackbone)?;

        let preprocessing = backbone.preprocessing();
        let style = utils::preprocess(
            &load_image(style, self.params.resize_input)?,
            &preprocessing,
        );

        let extractor = FeatureExtractor::build(
            backbone,
            style.shape(),
            self.params.max_thread_count.unwrap_or_else(num_cpus::get),
        )
        .map_err(|e| e.in_stage(Stage::ExtractorConstruction))?;

        let layers = match self.params.layers.take() {
            Some(layers) => layers,
            None => extractor.default_style_layers(),
        };

        let objective = StyleTargetSet::compute(
            &extractor,
            &style,
            &layers,
            self.params.layer_weights.as_deref(),
        )
        .and_then(|targets| StyleObjective::new(Arc::new(extractor), targets))
        .map_err(|e| e.in_stage(Stage::TargetComputation))?;

        tracing::debug!(
            layers = ?layers,
            height = style.shape().height,
            width = style.shape().width,
            "computed style targets"
        );

        Ok(Session {
            objective: objective.guard_non_finite(self.params.guard_non_finite),
            preprocessing,
            params: self.params,
        })
    }

    fn check_parameters_validity(&self) -> Result<(), Error> {
        if self.params.iterations == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f64::from(u32::MAX),
                value: 0.0,
                name: "iterations",
            }));
        }

        if self.params.max_evaluations == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: f64::from(u32::MAX),
                value: 0.0,
                name: "max-evaluations",
            }));
        }

        if let Some(max_count) = self.params.max_thread_count {
            if max_count == 0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 1.0,
                    max: 1024.0,
                    value: max_count as f64,
                    name: "max-thread-count",
                }));
            }
        }

        if self.params.history_size == 0 || self.params.history_size > 1024 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: 1024.0,
                value: self.params.history_size as f64,
                name: "history-size",
            }));
        }

        // written so that NaN is rejected too
        if !(self.params.gradient_tolerance >= 0.0) {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 0.0,
                max: f64::INFINITY,
                value: self.params.gradient_tolerance,
                name: "gradient-tolerance",
            }));
        }

        if let Some(tol) = self.params.convergence_tolerance {
            if !(0.0..=1.0).contains(&tol) {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 0.0,
                    max: 1.0,
                    value: tol,
                    name: "convergence-tolerance",
                }));
            }
        }

        if let Some(ref layers) = self.params.layers {
            if layers.is_empty() {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 1.0,
                    max: f64::INFINITY,
                    value: 0.0,
                    name: "layers",
                }));
            }
        }

        if let Some(ref weights) = self.params.layer_weights {
            if let Some(w) = weights.iter().find(|w| !(w.is_finite() && **w >= 0.0)) {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 0.0,
                    max: f64::INFINITY,
                    value: *w,
                    name: "layer-weights",
                }));
            }
        }

        Ok(())
    }
}

/// Helper struct for passing progress information to external callers
pub struct ProgressStat {
    /// The current amount of work that has been done
    pub current: usize,
    /// The total amount of work to do
    pub total: usize,
}

/// The state of the synthesis after a macro-iteration
pub struct ProgressUpdate<'a> {
    /// The clipped candidate, preprocessed and channel-major
    pub candidate: &'a [f64],
    pub shape: Shape,
    /// The loss reached by the macro-iteration
    pub loss: f64,
    /// Completed macro-iterations
    pub total: ProgressStat,
    /// The loss evaluations used by the macro-iteration
    pub evaluations: ProgressStat,
    /// Time since the run started
    pub elapsed: Duration,
}

/// Allows the generator to update external callers with the current
/// progress of the synthesis
pub trait GeneratorProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> GeneratorProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}
