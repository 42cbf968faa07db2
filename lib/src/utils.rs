use crate::{Dims, Error};
use base64::Engine as _;
use image::GenericImageView;
use ndarray::Array4;
use std::path::Path;

const DATA_URL_PNG: &str = "data:image/png;base64,";

/// Helper type used to define the source of `ImageSource`'s data
#[derive(Clone)]
pub enum ImageSource<'a> {
    /// A raw buffer of image data, see `image::load_from_memory` for details
    /// on what is supported
    Memory(&'a [u8]),
    /// The path to an image to load from disk. The image format is inferred
    /// from the file extension, see `image::open` for details
    Path(&'a Path),
    /// An already loaded image that is passed directly to the session
    Image(image::DynamicImage),
    /// A base64 encoded image, optionally carried in a data URL such as
    /// `data:image/png;base64,...`
    Base64(&'a str),
}

impl<'a> ImageSource<'a> {
    pub fn from_path(path: &'a Path) -> Self {
        Self::Path(path)
    }

    pub fn from_base64(payload: &'a str) -> Self {
        Self::Base64(payload)
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

/// Decodes a base64 payload. Anything up to and including `base64,` is a
/// data URL header and is skipped, as is any whitespace in the payload.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, Error> {
    const MARKER: &str = "base64,";

    let data = match payload.find(MARKER) {
        Some(start) => &payload[start + MARKER.len()..],
        None => payload,
    };

    let data: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(base64::engine::general_purpose::STANDARD.decode(data.as_bytes())?)
}

pub fn load_dynamic_image(src: ImageSource<'_>) -> Result<image::DynamicImage, Error> {
    match src {
        ImageSource::Memory(data) => Ok(image::load_from_memory(data)?),
        ImageSource::Path(path) => Ok(image::open(path)?),
        ImageSource::Image(img) => Ok(img),
        ImageSource::Base64(payload) => Ok(image::load_from_memory(&decode_payload(payload)?)?),
    }
}

fn resize(
    img: image::DynamicImage,
    size: Option<Dims>,
    filter: image::imageops::FilterType,
) -> image::DynamicImage {
    match size {
        Some(size) if img.dimensions() != (size.width, size.height) => {
            img.resize_exact(size.width, size.height, filter)
        }
        _ => img,
    }
}

/// Loads an RGB image as a `[1, 3, H, W]` tensor with values in `[0,1]`
pub(crate) fn load_image(src: ImageSource<'_>, size: Option<Dims>) -> Result<Array4<f32>, Error> {
    let img = resize(
        load_dynamic_image(src)?,
        size,
        image::imageops::FilterType::CatmullRom,
    );
    Ok(image_to_tensor(&img.to_rgb8()))
}

/// Loads a mask as a `[1, 1, H, W]` tensor, only the first channel is used
pub(crate) fn load_mask(src: ImageSource<'_>, size: Option<Dims>) -> Result<Array4<f32>, Error> {
    let img = resize(
        load_dynamic_image(src)?,
        size,
        image::imageops::FilterType::Triangle,
    );
    Ok(mask_to_tensor(&img))
}

pub fn image_to_tensor(img: &image::RgbImage) -> Array4<f32> {
    let (width, height) = img.dimensions();
    Array4::from_shape_fn((1, 3, height as usize, width as usize), |(_, c, y, x)| {
        f32::from(img.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
}

pub fn mask_to_tensor(img: &image::DynamicImage) -> Array4<f32> {
    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    Array4::from_shape_fn((1, 1, height as usize, width as usize), |(_, _, y, x)| {
        f32::from(rgba.get_pixel(x as u32, y as u32)[0]) / 255.0
    })
}

fn to_u8(v: f32) -> u8 {
    (v * 255.0).round().max(0.0).min(255.0) as u8
}

/// Builds an image from a tensor already known to be `[1, 3, H, W]`
pub(crate) fn rgb_image(tensor: &Array4<f32>) -> image::RgbImage {
    let (_, _, height, width) = tensor.dim();
    image::RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        image::Rgb([
            to_u8(tensor[[0, 0, y, x]]),
            to_u8(tensor[[0, 1, y, x]]),
            to_u8(tensor[[0, 2, y, x]]),
        ])
    })
}

/// Converts a `[1, 3, H, W]` tensor back to an 8-bit image
pub fn tensor_to_image(tensor: &Array4<f32>) -> Result<image::RgbImage, Error> {
    let (batch, channels, height, width) = tensor.dim();
    if batch != 1 || channels != 3 {
        return Err(Error::shape("output image", &[1, 3, height, width], tensor.shape()));
    }
    Ok(rgb_image(tensor))
}

pub(crate) fn encode(img: image::RgbImage, fmt: image::ImageFormat) -> Result<Vec<u8>, Error> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img).write_to(&mut buffer, fmt)?;
    Ok(buffer.into_inner())
}

/// Encodes a `[1, 3, H, W]` tensor as a PNG data URL
pub fn encode_data_url(tensor: &Array4<f32>) -> Result<String, Error> {
    let png = encode(tensor_to_image(tensor)?, image::ImageFormat::Png)?;
    Ok(format!(
        "{}{}",
        DATA_URL_PNG,
        base64::engine::general_purpose::STANDARD.encode(png)
    ))
}
