// BEGIN - Embark standard lints v0.4
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_on_vec_items,
    clippy::match_same_arms,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::mismatched_target_os,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v0.4

//! `style-synthesis` synthesizes images that share the "style" of an example
//! image, as captured by the correlations between the feature maps of a
//! pretrained convolutional network.
//!
//! The style of an image at a given layer of the network is summarized by a
//! Gram matrix, the inner products of every pair of that layer's feature maps.
//! Starting from noise, the candidate image is refined with L-BFGS until its
//! Gram matrices at a set of layers match those of the style image.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the
//! builder pattern. Calling `build` on the `SessionBuilder` loads the style
//! image, builds the feature extractor and computes the style targets.
//!
//! `Session` has a `run()` method which runs the optimization and returns the
//! result as a `GeneratedImage`, which you can save, stream, or inspect along
//! with the loss of every macro-iteration.
//!
//! ## Backbones
//!
//! The feature extractor is derived from a `Backbone`, a VGG style
//! classification network whose weights are loaded from a binary weights file
//! with `Backbone::open`. Every max-subsampling layer of the backbone is
//! swapped for average subsampling in the extractor.
//!
//! ## Usage
//! Session follows a "builder pattern" for defining parameters, meaning you
//! chain functions together.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! let backbone = style_synthesis::Backbone::open("vgg19.weights")
//!     .expect("failed to load backbone");
//!
//! // Create a new session with default parameters
//! let session = style_synthesis::Session::builder()
//!     // Set some parameters
//!     .seed(10)
//!     .iterations(10)
//!     // Specify the style image and the network
//!     .style_image(&"imgs/style.jpg")
//!     .backbone(Arc::new(backbone))
//!     // Build the session
//!     .build().expect("failed to build session");
//!
//! // Synthesize a new image
//! let generated_img = session.run(None).expect("synthesis failed");
//!
//! // Save the generated image to disk
//! generated_img.save("my_generated_img.png").expect("failed to save generated image");
//! ```
pub mod backbone;
mod errors;
pub mod extractor;
pub mod gram;
pub mod lbfgs;
pub mod loss;
pub mod objective;
mod ops;
pub mod session;
pub mod tensor;
mod utils;

pub use image;
use std::{path::Path, sync::Arc};

pub use backbone::{Activation, Backbone, Layout, Preprocessing};
pub use errors::{Error, Stage};
pub use extractor::FeatureExtractor;
pub use gram::GramMatrix;
pub use lbfgs::{Lbfgs, Minimum, Objective, Termination};
pub use loss::{layer_style_loss, style_loss, StyleTargetSet};
pub use objective::StyleObjective;
pub use session::{
    GeneratorProgress, Phase, ProgressStat, ProgressUpdate, Session, SessionBuilder, PIXEL_LIMIT,
};
pub use tensor::{FeatureMap, Shape};
pub use utils::{deprocess, display_scale, load_dynamic_image, preprocess, ImageSource};

use utils::load_image;

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Dims {
    pub width: u32,
    pub height: u32,
}

impl Dims {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

struct Parameters {
    iterations: u32,
    max_evaluations: u32,
    layers: Option<Vec<String>>,
    layer_weights: Option<Vec<f64>>,
    seed: u64,
    resize_input: Option<Dims>,
    max_thread_count: Option<usize>,
    convergence_tolerance: Option<f64>,
    gradient_tolerance: f64,
    history_size: usize,
    guard_non_finite: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            iterations: 10,
            max_evaluations: 20,
            layers: None,
            layer_weights: None,
            seed: 0,
            resize_input: None,
            max_thread_count: None,
            convergence_tolerance: None,
            gradient_tolerance: 1e-5,
            history_size: 10,
            guard_non_finite: true,
        }
    }
}

/// An image synthesized by a `Session::run()`
pub struct GeneratedImage {
    dims: Dims,
    /// Row-major RGB, with the backbone preprocessing undone
    pixels: Vec<f64>,
    loss_history: Vec<f64>,
}

impl GeneratedImage {
    #[inline]
    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// The synthesized `(height, width, 3)` RGB values, row-major. These are
    /// neither rounded nor clamped, use `into_image` for displayable pixels.
    #[inline]
    pub fn as_tensor(&self) -> &[f64] {
        &self.pixels
    }

    /// The loss reached by each macro-iteration, in order
    #[inline]
    pub fn loss_history(&self) -> &[f64] {
        &self.loss_history
    }

    /// Saves the generated image to the specified path
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        self.to_rgb().save(&path)?;
        Ok(())
    }

    /// Writes the generated image to the specified stream
    pub fn write<W: std::io::Write>(
        self,
        writer: &mut W,
        fmt: image::ImageOutputFormat,
    ) -> Result<(), Error> {
        let dyn_img = self.into_image();
        Ok(dyn_img.write_to(writer, fmt)?)
    }

    /// Returns the generated output image, display scaled to the full 8-bit
    /// range
    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(self.to_rgb())
    }

    fn to_rgb(&self) -> image::RgbImage {
        let scaled = display_scale(&self.pixels);
        let width = self.dims.width;

        image::ImageBuffer::from_fn(width, self.dims.height, |x, y| {
            let i = 3 * (y as usize * width as usize + x as usize);
            image::Rgb([scaled[i], scaled[i + 1], scaled[i + 2]])
        })
    }
}

impl AsRef<[f64]> for GeneratedImage {
    fn as_ref(&self) -> &[f64] {
        &self.pixels
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generated_image_scaling() {
        let generated = GeneratedImage {
            dims: Dims::new(2, 1),
            pixels: vec![-10.0, 0.0, 10.0, 30.0, 20.0, 10.0],
            loss_history: vec![3.0, 2.0],
        };

        assert_eq!(generated.loss_history(), &[3.0, 2.0]);

        let mut png = Vec::new();
        let img = generated.into_image().to_rgb();
        assert_eq!(img.dimensions(), (2, 1));
        assert_eq!(img.get_pixel(0, 0), &image::Rgb([0, 64, 128]));
        assert_eq!(img.get_pixel(1, 0), &image::Rgb([255, 191, 128]));

        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut png, image::ImageOutputFormat::Png)
            .unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgb();
        assert_eq!(decoded.get_pixel(1, 0), &image::Rgb([255, 191, 128]));
    }
}
