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

//! `deep-harmonization` is a light API for mask-guided, patch-matched neural
//! style transfer: the masked region of a content image is re-synthesized so
//! that it keeps its structure but takes on the texture of a style image,
//! and is then blended back into the style image.
//!
//! Style targets are not global statistics of the style image. At every
//! style layer each content feature is matched to its most similar style
//! neighbourhood first, so the texture that is transferred is the one found
//! in comparable places of the style image.
//!
//! First, you build a `Session` via a `SessionBuilder`, which follows the builder pattern. Calling
//! `build` on the `SessionBuilder` loads all of the input images and checks for various errors.
//!
//! `Session` has a `run()` method that takes a `FeatureExtractor` and optimizes an image, which is
//! returned as a `HarmonizedImage`. You can save, stream, encode, or inspect the image from
//! `HarmonizedImage`.
//!
//! If your images are already tensors, [`synthesize`] runs the same pipeline directly.
//!
//! ## Usage
//! Session follows a "builder pattern" for defining parameters, meaning you chain functions together.
//!
//! ```no_run
//! // The extractor is immutable, build it once and share it between sessions
//! let extractor = deep_harmonization::FeatureExtractor::vgg19(0);
//!
//! // Create a new session with default parameters
//! let session = deep_harmonization::Session::builder()
//!     // Set some parameters
//!     .num_steps(200)
//!     .style_weight(50.0)
//!     // Specify the input images
//!     .content(&"imgs/content.png")
//!     .style(&"imgs/style.png")
//!     .mask(&"imgs/mask.png")
//!     // Build the session
//!     .build().expect("failed to build session");
//!
//! // Harmonize the masked region
//! let harmonized = session.run(&extractor, None).expect("failed to harmonize");
//!
//! // Save the harmonized image to disk
//! harmonized.save("harmonized.png").expect("failed to save harmonized image");
//! ```
mod errors;
pub mod graph;
pub mod layers;
pub mod loss;
pub mod mask;
pub mod optim;
pub mod patch_match;
pub mod session;
mod synthesis;
mod utils;

pub use image;
pub use ndarray;

use ndarray::Array4;
use std::path::Path;

pub use errors::{Error, ErrorKind};
pub use graph::{GraphConfig, LossGraph, LossWeights};
pub use layers::{FeatureExtractor, Layer, LayerKind, LayerName};
pub use optim::TerminationReason;
pub use patch_match::{patch_match, PatchMatcher};
pub use session::{OptimizerProgress, ProgressStat, ProgressUpdate, Session, SessionBuilder};
pub use synthesis::{blend, synthesize, LossRecord, Report, Synthesis};
pub use utils::{
    decode_payload, encode_data_url, image_to_tensor, load_dynamic_image, mask_to_tensor,
    tensor_to_image, ImageSource,
};

/// Simple dimensions struct
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
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

/// Everything that controls a single harmonization
#[derive(Clone, Debug)]
pub struct Parameters {
    /// Weight of the summed style probe losses
    pub style_weight: f32,
    /// Weight of the summed content probe losses
    pub content_weight: f32,
    /// Maximum number of optimizer iterations
    pub num_steps: u32,
    pub content_layers: Vec<String>,
    pub style_layers: Vec<String>,
    /// Odd side length of the neighbourhoods compared by the patch matcher
    pub patch_size: usize,
    /// Gaussian sigma used to feather the mask for the final blend
    pub soft_mask_sigma: f32,
    pub max_thread_count: Option<usize>,
}

impl Default for Parameters {
    fn default() -> Self {
        let graph = GraphConfig::default();
        let weights = LossWeights::default();

        Self {
            style_weight: weights.style,
            content_weight: weights.content,
            num_steps: 500,
            content_layers: graph.content_layers,
            style_layers: graph.style_layers,
            patch_size: graph.patch_matcher.patch_size,
            soft_mask_sigma: 3.0,
            max_thread_count: None,
        }
    }
}

impl Parameters {
    fn graph_config(&self) -> GraphConfig {
        GraphConfig {
            content_layers: self.content_layers.clone(),
            style_layers: self.style_layers.clone(),
            patch_matcher: PatchMatcher {
                patch_size: self.patch_size,
                max_thread_count: self.max_thread_count.unwrap_or_else(num_cpus::get),
            },
        }
    }

    fn weights(&self) -> LossWeights {
        LossWeights {
            style: self.style_weight,
            content: self.content_weight,
        }
    }

    fn check_validity(&self) -> Result<(), Error> {
        if self.content_layers.is_empty() && self.style_layers.is_empty() {
            return Err(Error::NoLossLayers);
        }

        for &(value, name) in &[
            (self.style_weight, "style-weight"),
            (self.content_weight, "content-weight"),
            (self.soft_mask_sigma, "soft-mask-sigma"),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 0.0,
                    max: f32::MAX,
                    value,
                    name,
                }));
            }
        }

        if self.patch_size % 2 == 0 || self.patch_size > 15 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: 15.0,
                value: self.patch_size as f32,
                name: "patch-size (must be odd)",
            }));
        }

        if let Some(max_count) = self.max_thread_count {
            if max_count == 0 {
                return Err(Error::InvalidRange(errors::InvalidRange {
                    min: 1.0,
                    max: 1024.0,
                    value: max_count as f32,
                    name: "max-thread-count",
                }));
            }
        }

        Ok(())
    }
}

/// An image harmonized by a `Session::run()`
pub struct HarmonizedImage {
    tensor: Array4<f32>,
    report: Report,
}

impl HarmonizedImage {
    /// Saves the harmonized image to the specified path, the format is
    /// inferred from the extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        if let Some(parent_path) = path.parent() {
            std::fs::create_dir_all(&parent_path)?;
        }

        utils::rgb_image(&self.tensor).save(&path)?;
        Ok(())
    }

    /// Writes the harmonized image to the specified stream
    pub fn write<W: std::io::Write>(
        &self,
        writer: &mut W,
        fmt: image::ImageFormat,
    ) -> Result<(), Error> {
        let encoded = utils::encode(utils::rgb_image(&self.tensor), fmt)?;
        writer.write_all(&encoded)?;
        Ok(())
    }

    /// Encodes the harmonized image as a `data:image/png;base64,` URL
    pub fn to_data_url(&self) -> Result<String, Error> {
        utils::encode_data_url(&self.tensor)
    }

    /// The `[1, 3, H, W]` tensor the image was made from, values in `[0,1]`
    pub fn tensor(&self) -> &Array4<f32> {
        &self.tensor
    }

    /// How the optimization went
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Returns the harmonized output image
    pub fn into_image(self) -> image::DynamicImage {
        image::DynamicImage::ImageRgb8(utils::rgb_image(&self.tensor))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_parameters_are_valid() {
        let params = Parameters::default();
        params.check_validity().unwrap();

        assert_eq!(params.style_weight, 100.0);
        assert_eq!(params.content_weight, 5.0);
        assert_eq!(params.num_steps, 500);
        assert_eq!(params.content_layers, vec!["relu4_1"]);
        assert_eq!(params.style_layers, vec!["relu3_1", "relu4_1", "relu5_1"]);
        assert_eq!(params.patch_size, 3);
    }

    #[test]
    fn harmonized_image_streams_any_format() {
        let harmonized = HarmonizedImage {
            tensor: Array4::from_elem((1, 3, 4, 5), 0.5),
            report: Report {
                iterations: 0,
                evaluations: 1,
                termination: TerminationReason::Converged,
                history: Vec::new(),
            },
        };

        let mut png = Vec::new();
        harmonized.write(&mut png, image::ImageFormat::Png).unwrap();
        let decoded = image::load_from_memory(&png).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (5, 4));
        assert_eq!(decoded.get_pixel(2, 2)[1], 128);

        let mut bmp = Vec::new();
        harmonized.write(&mut bmp, image::ImageFormat::Bmp).unwrap();
        assert_eq!(&bmp[..2], b"BM");
    }
}
