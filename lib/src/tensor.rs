//! Planar feature maps shared by the extractor, the Gram descriptor and the
//! objective

use crate::errors::ShapeMismatch;

/// Spatial shape of a single image or activation, the batch axis of 1 is
/// implicit
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl Shape {
    pub fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Number of elements in a single channel
    #[inline]
    pub fn plane_len(&self) -> usize {
        self.height * self.width
    }

    /// Total number of elements
    #[inline]
    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn to_vec(self) -> Vec<usize> {
        vec![self.height, self.width, self.channels]
    }
}

/// An (height, width, channel) tensor stored channel-major, ie. every channel
/// is a contiguous `height * width` plane.
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMap {
    shape: Shape,
    data: Vec<f64>,
}

impl FeatureMap {
    pub fn zeros(shape: Shape) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.len()],
        }
    }

    /// Wraps planar data, failing if the length doesn't match the shape or
    /// if any axis is empty
    pub fn from_vec(shape: Shape, data: Vec<f64>) -> Result<Self, ShapeMismatch> {
        if shape.is_empty() || data.len() != shape.len() {
            return Err(ShapeMismatch {
                what: "feature map".to_owned(),
                expected: shape.to_vec(),
                actual: vec![data.len()],
            });
        }

        Ok(Self { shape, data })
    }

    /// Row-major, channel-interleaved copy of the data
    pub fn to_interleaved(&self) -> Vec<f64> {
        let plane = self.shape.plane_len();
        let channels = self.shape.channels;
        let mut out = vec![0.0; self.data.len()];
        for (c, p) in self.data.chunks_exact(plane).enumerate() {
            for (i, v) in p.iter().enumerate() {
                out[i * channels + c] = *v;
            }
        }
        out
    }

    #[inline]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// The contiguous plane of channel `c`
    #[inline]
    pub fn plane(&self, c: usize) -> &[f64] {
        let len = self.shape.plane_len();
        &self.data[c * len..(c + 1) * len]
    }

    #[inline]
    pub fn get(&self, y: usize, x: usize, c: usize) -> f64 {
        self.data[c * self.shape.plane_len() + y * self.shape.width + x]
    }
}
