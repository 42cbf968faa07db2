//! Keeps a spatial mask aligned with the feature maps of the layer being
//! traversed.

use ndarray::{Array2, Array4, Axis};

use crate::layers::LayerKind;

/// Returns the mask that matches the output of a layer of the given kind,
/// given the mask that matched its input.
pub fn propagate(mask: &Array4<f32>, kind: LayerKind) -> Array4<f32> {
    match kind {
        LayerKind::Convolution => smooth3x3(mask),
        LayerKind::Pooling => downsample_half(mask),
        LayerKind::Activation | LayerKind::Normalization => mask.clone(),
    }
}

/// 3x3 box filter with unit stride and a zero padding of 1. The padding
/// counts towards the average, so the mask fades slightly at the border.
pub fn smooth3x3(mask: &Array4<f32>) -> Array4<f32> {
    let (batch, channels, height, width) = mask.dim();
    let mut out = Array4::zeros((batch, channels, height, width));

    for b in 0..batch {
        for c in 0..channels {
            for y in 0..height {
                let y0 = y.saturating_sub(1);
                let y1 = (y + 1).min(height - 1);
                for x in 0..width {
                    let x0 = x.saturating_sub(1);
                    let x1 = (x + 1).min(width - 1);

                    let mut sum = 0.0;
                    for yy in y0..=y1 {
                        for xx in x0..=x1 {
                            sum += mask[[b, c, yy, xx]];
                        }
                    }
                    out[[b, c, y, x]] = sum / 9.0;
                }
            }
        }
    }

    out
}

/// Area downsampling by a factor of 0.5, to `floor(h/2) x floor(w/2)`.
/// Every output cell is the mean of the input cells it covers.
pub fn downsample_half(mask: &Array4<f32>) -> Array4<f32> {
    let (batch, channels, height, width) = mask.dim();
    let (oh, ow) = (height / 2, width / 2);
    let mut out = Array4::zeros((batch, channels, oh, ow));

    // same bounds as an adaptive average pool
    let span = |i: usize, input: usize, output: usize| {
        let start = i * input / output;
        let end = ((i + 1) * input + output - 1) / output;
        (start, end)
    };

    for b in 0..batch {
        for c in 0..channels {
            for oy in 0..oh {
                let (y0, y1) = span(oy, height, oh);
                for ox in 0..ow {
                    let (x0, x1) = span(ox, width, ow);

                    let mut sum = 0.0;
                    for yy in y0..y1 {
                        for xx in x0..x1 {
                            sum += mask[[b, c, yy, xx]];
                        }
                    }
                    out[[b, c, oy, ox]] = sum / ((y1 - y0) * (x1 - x0)) as f32;
                }
            }
        }
    }

    out
}

/// Gaussian blurred copy of a `[1, 1, h, w]` mask, used to feather the
/// boundary when the synthesized region is blended back into the style
/// image.
pub fn soft_mask(mask: &Array4<f32>, sigma: f32) -> Array4<f32> {
    let (batch, channels, height, width) = mask.dim();
    if sigma <= 0.0 {
        return mask.clone();
    }

    let mut out = Array4::zeros((batch, channels, height, width));
    for b in 0..batch {
        for c in 0..channels {
            let plane: Array2<f32> = mask
                .index_axis(Axis(0), b)
                .index_axis(Axis(0), c)
                .to_owned();
            let buffer = image::ImageBuffer::<image::Luma<f32>, Vec<f32>>::from_fn(
                width as u32,
                height as u32,
                |x, y| image::Luma([plane[[y as usize, x as usize]]]),
            );

            let blurred = image::imageops::blur(&buffer, sigma);
            for (x, y, pixel) in blurred.enumerate_pixels() {
                out[[b, c, y as usize, x as usize]] = pixel[0];
            }
        }
    }

    out
}
