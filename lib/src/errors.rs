use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f64,
    pub(crate) max: f64,
    pub(crate) value: f64,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) what: String,
    pub(crate) expected: Vec<usize>,
    pub(crate) actual: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} has shape {:?}, but {:?} was expected",
            self.what, self.actual, self.expected
        )
    }
}

#[derive(Debug)]
pub struct NumericInstability {
    pub(crate) what: &'static str,
    /// Index of the first offending element, `None` for scalars
    pub(crate) index: Option<usize>,
    pub(crate) value: f64,
}

impl fmt::Display for NumericInstability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(i) => write!(
                f,
                "{} became non-finite ({}) at element {}",
                self.what, self.value, i
            ),
            None => write!(f, "{} became non-finite ({})", self.what, self.value),
        }
    }
}

/// The stage of a synthesis run a fatal error originated from
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Stage {
    /// Building the feature extractor from the backbone
    ExtractorConstruction,
    /// Computing the Gram matrices of the style image
    TargetComputation,
    /// The macro-iteration loop
    Optimization,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ExtractorConstruction => "feature extractor construction",
            Self::TargetComputation => "style target computation",
            Self::Optimization => "optimization",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// A tensor didn't have the shape an operation requires
    ShapeMismatch(ShapeMismatch),
    /// A requested layer name doesn't exist in the feature extractor
    MissingLayer(String),
    /// The loss or its gradient became NaN or infinite
    NumericInstability(NumericInstability),
    /// The backbone weights or layer list are malformed
    InvalidBackbone(String),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
    /// No style image was added to the session
    NoStyleImage,
    /// No backbone was given to the session
    NoBackbone,
    /// A fatal error, tagged with the stage of the run it stopped
    Stage(Stage, Box<Error>),
}

impl Error {
    pub(crate) fn in_stage(self, stage: Stage) -> Self {
        match self {
            // Never double wrap
            Self::Stage(..) => self,
            other => Self::Stage(stage, Box::new(other)),
        }
    }

    /// The stage this error stopped, if it was raised during a run
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage(stage, _) => Some(*stage),
            _ => None,
        }
    }

    /// The error with any stage information removed
    pub fn root(&self) -> &Error {
        match self {
            Self::Stage(_, inner) => inner.root(),
            other => other,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Stage(_, err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::MissingLayer(name) => {
                write!(f, "the feature extractor has no layer named '{}'", name)
            }
            Self::NumericInstability(ni) => write!(f, "{}", ni),
            Self::InvalidBackbone(reason) => write!(f, "invalid backbone: {}", reason),
            Self::Io(io) => write!(f, "{}", io),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
            Self::NoStyleImage => write!(f, "a style image must be provided"),
            Self::NoBackbone => write!(f, "a backbone network must be provided"),
            Self::Stage(stage, inner) => write!(f, "{} failed: {}", stage, inner),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}

impl From<ShapeMismatch> for Error {
    fn from(sm: ShapeMismatch) -> Self {
        Self::ShapeMismatch(sm)
    }
}
