use crate::{
    backbone::Preprocessing,
    tensor::{FeatureMap, Shape},
    Dims, Error,
};
use std::path::Path;

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the generator
    Image(image::DynamicImage),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }
}

impl<'a> From<image::DynamicImage> for ImageSource<'a> {
    fn from(img: image::DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl<'a, S> From<&'a S> for ImageSource<'a>
where
    S: AsRef<Path> + 'a,
{
    fn from(path: &'a S) -> Self {
        Self::Path(path.as_ref())
    }
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, image::ImageError> {
    match src {
        ImageSource::Memory(data) => image::load_from_memory(data),
        ImageSource::Path(path) => image::open(path),
        ImageSource::Image(img) => Ok(img),
    }
}

/// Decodes the image as 8-bit RGB, resizing it if it doesn't already have the
/// requested dimensions
pub(crate) fn load_image(
    src: ImageSource<'_>,
    resize: Option<Dims>,
) -> Result<image::RgbImage, Error> {
    let img = load_dynamic_image(src)?;

    let img = match resize {
        None => img.to_rgb(),
        Some(ref size) => {
            use image::GenericImageView;

            if img.width() != size.width || img.height() != size.height {
                image::imageops::resize(
                    &img.to_rgb(),
                    size.width,
                    size.height,
                    image::imageops::CatmullRom,
                )
            } else {
                img.to_rgb()
            }
        }
    };

    Ok(img)
}

/// Converts an RGB image into the backbone's input space: channels reversed
/// to BGR and each channel centered on the backbone's mean
pub fn preprocess(img: &image::RgbImage, preprocessing: &Preprocessing) -> FeatureMap {
    let (width, height) = img.dimensions();
    let shape = Shape::new(height as usize, width as usize, 3);
    let plane = shape.plane_len();
    let means = preprocessing.channel_means;

    let mut fm = FeatureMap::zeros(shape);
    {
        let data = fm.as_mut_slice();
        for (i, px) in img.pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] = f64::from(px[2 - c]) - means[c];
            }
        }
    }

    fm
}

/// Inverse of `preprocess`, without any rounding or clamping. Returns
/// row-major RGB triplets.
pub fn deprocess(fm: &FeatureMap, preprocessing: &Preprocessing) -> Vec<f64> {
    let means = preprocessing.channel_means;

    let mut out = fm.to_interleaved();
    for px in out.chunks_exact_mut(3) {
        for (v, mean) in px.iter_mut().zip(&means) {
            *v += mean;
        }
        px.reverse();
    }

    out
}

/// Maps arbitrary values to 8-bit by subtracting the minimum and dividing by
/// the maximum of the shifted values.
///
/// A constant input maps to black.
pub fn display_scale(values: &[f64]) -> Vec<u8> {
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().map(|v| v - min).fold(0.0f64, f64::max);

    values
        .iter()
        .map(|v| {
            if max > 0.0 {
                ((v - min) / max * 255.0).round().max(0.0).min(255.0) as u8
            } else {
                0
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn gradient_image(width: u32, height: u32) -> image::RgbImage {
        image::ImageBuffer::from_fn(width, height, |x, y| {
            image::Rgb([(x * 40) as u8, (y * 60) as u8, ((x + y) * 17) as u8])
        })
    }

    #[test]
    fn preprocessing_round_trip() {
        let img = gradient_image(5, 3);
        let preprocessing = Preprocessing::default();

        let fm = preprocess(&img, &preprocessing);
        assert_eq!(fm.shape(), Shape::new(3, 5, 3));

        // blue first, minus the blue mean
        let px = img.get_pixel(2, 1);
        assert!((fm.get(1, 2, 0) - (f64::from(px[2]) - 103.939)).abs() < 1e-12);
        assert!((fm.get(1, 2, 2) - (f64::from(px[0]) - 123.68)).abs() < 1e-12);

        let back = deprocess(&fm, &preprocessing);
        for (a, b) in back.iter().zip(img.as_raw()) {
            assert!((a - f64::from(*b)).abs() < 1e-9);
        }
    }

    #[test]
    fn display_scaling() {
        assert_eq!(display_scale(&[-2.0, 0.0, 2.0]), vec![0, 128, 255]);
        assert_eq!(display_scale(&[7.0, 7.0]), vec![0, 0]);
    }

    #[test]
    fn resizes_on_load() {
        let img = image::DynamicImage::ImageRgb8(gradient_image(8, 6));

        let same = load_image(ImageSource::from(img.clone()), None).unwrap();
        assert_eq!(same.dimensions(), (8, 6));

        let resized = load_image(ImageSource::from(img), Some(Dims::new(4, 5))).unwrap();
        assert_eq!(resized.dimensions(), (4, 5));
    }
}
