//! Masked content and style losses.
//!
//! Both probes are built once, with a target that is frozen from then on.
//! Evaluating a probe yields its discrepancy to the live feature map and the
//! gradient of that discrepancy with respect to the feature map.

use ndarray::{Array2, Array4, Axis, Zip};

use crate::Error;

/// Broadcasts a single channel mask over the channels of a feature map.
fn broadcast_mask(mask: &Array4<f32>, feature_shape: &[usize]) -> Result<Array4<f32>, Error> {
    let (_, _, mh, mw) = mask.dim();
    if feature_shape.len() != 4 || feature_shape[2] != mh || feature_shape[3] != mw {
        return Err(Error::shape(
            "mask for feature map",
            &[feature_shape[0], 1, feature_shape[2], feature_shape[3]],
            mask.shape(),
        ));
    }

    let dim = (
        feature_shape[0],
        feature_shape[1],
        feature_shape[2],
        feature_shape[3],
    );
    mask.broadcast(dim)
        .map(|m| m.to_owned())
        .ok_or_else(|| {
            Error::shape(
                "mask for feature map",
                &[feature_shape[0], 1, feature_shape[2], feature_shape[3]],
                mask.shape(),
            )
        })
}

fn check_live(context: &'static str, expected: &[usize], x: &Array4<f32>) -> Result<(), Error> {
    if x.shape() != expected {
        return Err(Error::shape(context, expected, x.shape()));
    }
    Ok(())
}

/// Unnormalized gram matrix of a feature map: every pair of (batch, channel)
/// feature planes reduced to their inner product.
pub fn gram_matrix(x: &Array4<f32>) -> Result<Array2<f32>, Error> {
    let features = flatten(x)?;
    Ok(features.dot(&features.t()))
}

fn flatten(x: &Array4<f32>) -> Result<Array2<f32>, Error> {
    let (batch, channels, height, width) = x.dim();
    Ok(x.as_standard_layout()
        .into_owned()
        .into_shape((batch * channels, height * width))?)
}

/// Mean squared difference between the masked live features and the masked
/// target features.
#[derive(Debug)]
pub struct ContentLoss {
    target: Array4<f32>,
    mask: Array4<f32>,
}

impl ContentLoss {
    /// `mask` is a `[1, 1, h, w]` mask that matches the feature map's spatial
    /// size.
    pub fn new(target: &Array4<f32>, mask: &Array4<f32>) -> Result<Self, Error> {
        let mask = broadcast_mask(mask, target.shape())?;
        let target = target * &mask;
        Ok(Self { target, mask })
    }

    pub fn target(&self) -> &Array4<f32> {
        &self.target
    }

    pub fn loss(&self, x: &Array4<f32>) -> Result<f32, Error> {
        self.loss_and_grad(x).map(|(loss, _)| loss)
    }

    pub(crate) fn loss_and_grad(&self, x: &Array4<f32>) -> Result<(f32, Array4<f32>), Error> {
        check_live("content loss input", self.target.shape(), x)?;

        let diff = x * &self.mask - &self.target;
        let n = diff.len().max(1) as f32;
        let loss = diff.iter().map(|d| d * d).sum::<f32>() / n;

        let mut grad = diff;
        Zip::from(&mut grad)
            .and(&self.mask)
            .for_each(|g, &m| *g *= 2.0 * m / n);

        Ok((loss, grad))
    }
}

/// Mean squared difference between the gram matrix of the masked live
/// features and a target gram matrix, both divided by the mask's mass so that
/// masks of different sizes are comparable.
#[derive(Debug)]
pub struct StyleLoss {
    target: Array2<f32>,
    mask: Array4<f32>,
    mass: f32,
    shape: Vec<usize>,
}

impl StyleLoss {
    /// `matched` holds the (already patch matched) style features, `mask` is
    /// the `[1, 1, h, w]` mask at this layer.
    pub fn new(matched: &Array4<f32>, mask: &Array4<f32>) -> Result<Self, Error> {
        let mass = mask_mass(mask);
        let mask = broadcast_mask(mask, matched.shape())?;
        let target = gram_matrix(&(matched * &mask))? / mass;

        Ok(Self {
            target,
            mask,
            mass,
            shape: matched.shape().to_vec(),
        })
    }

    pub fn target(&self) -> &Array2<f32> {
        &self.target
    }

    pub fn loss(&self, x: &Array4<f32>) -> Result<f32, Error> {
        self.loss_and_grad(x).map(|(loss, _)| loss)
    }

    pub(crate) fn loss_and_grad(&self, x: &Array4<f32>) -> Result<(f32, Array4<f32>), Error> {
        check_live("style loss input", &self.shape, x)?;

        let masked = flatten(&(x * &self.mask))?;
        let gram = masked.dot(&masked.t()) / self.mass;

        let diff = gram - &self.target;
        let n = diff.len().max(1) as f32;
        let loss = diff.iter().map(|d| d * d).sum::<f32>() / n;

        // gram is symmetric, so d(F F^T)/dF folds into a single product
        let d_gram = diff * (2.0 / n);
        let d_features = d_gram.dot(&masked) * (2.0 / self.mass);

        let mut grad = d_features.into_shape(self.mask.raw_dim())?;
        grad *= &self.mask;

        Ok((loss, grad))
    }
}

/// Total weight of a single channel mask. An empty mask is given a unit mass
/// so the normalization stays finite; everything it weighs is zero anyway.
fn mask_mass(mask: &Array4<f32>) -> f32 {
    let mass = mask.sum_axis(Axis(1)).sum() / mask.dim().1.max(1) as f32;
    if mass > 0.0 {
        mass
    } else {
        1.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array4::from_shape_fn(shape, |(b, c, y, x)| {
            ((b * 3 + c * 5 + y * 7 + x * 11) as f32 * 0.13).cos()
        })
    }

    #[test]
    fn content_loss_ignores_values_outside_mask() {
        let target = ramp((1, 3, 4, 4));
        let mut mask = Array4::zeros((1, 1, 4, 4));
        for y in 0..4 {
            for x in 0..2 {
                mask[[0, 0, y, x]] = 1.0;
            }
        }

        let probe = ContentLoss::new(&target, &mask).unwrap();

        let mut live = target.clone();
        for c in 0..3 {
            for y in 0..4 {
                for x in 2..4 {
                    live[[0, c, y, x]] = 42.0;
                }
            }
        }

        let (loss, grad) = probe.loss_and_grad(&live).unwrap();
        assert_eq!(loss, 0.0);
        assert!(grad.iter().all(|&g| g == 0.0));

        live[[0, 1, 0, 0]] += 1.0;
        assert!(probe.loss(&live).unwrap() > 0.0);
    }

    #[test]
    fn full_mask_gram_is_normalized_by_area() {
        let features = ramp((1, 4, 5, 6));
        let mask = Array4::ones((1, 1, 5, 6));

        let probe = StyleLoss::new(&features, &mask).unwrap();
        let expected = gram_matrix(&features).unwrap() / 30.0;

        for (a, b) in probe.target().iter().zip(expected.iter()) {
            assert!((a - b).abs() <= 1e-5 * b.abs().max(1.0));
        }
    }

    #[test]
    fn normalized_gram_is_resolution_independent() {
        let small = Array4::from_shape_fn((1, 3, 4, 4), |(_, c, _, _)| c as f32 + 0.5);
        let large = Array4::from_shape_fn((1, 3, 8, 8), |(_, c, _, _)| c as f32 + 0.5);

        let a = StyleLoss::new(&small, &Array4::ones((1, 1, 4, 4))).unwrap();
        let b = StyleLoss::new(&large, &Array4::ones((1, 1, 8, 8))).unwrap();

        for (x, y) in a.target().iter().zip(b.target().iter()) {
            assert!((x - y).abs() <= 1e-4 * y.abs().max(1.0));
        }
    }

    #[test]
    fn style_loss_is_zero_at_target() {
        let features = ramp((1, 3, 4, 5));
        let mask = Array4::from_shape_fn((1, 1, 4, 5), |(_, _, y, _)| if y < 2 { 1.0 } else { 0.5 });

        let probe = StyleLoss::new(&features, &mask).unwrap();
        let (loss, grad) = probe.loss_and_grad(&features).unwrap();

        assert!(loss.abs() < 1e-8);
        assert!(grad.iter().all(|g| g.abs() < 1e-5));
    }

    #[test]
    fn style_gradient_matches_finite_differences() {
        let target = ramp((1, 2, 3, 3));
        let mask = Array4::from_shape_fn((1, 1, 3, 3), |(_, _, y, x)| if x + y < 3 { 1.0 } else { 0.25 });
        let probe = StyleLoss::new(&target, &mask).unwrap();

        let live = target.mapv(|v| v * 0.5 + 0.3);
        let (_, grad) = probe.loss_and_grad(&live).unwrap();

        let eps = 1e-2;
        for &idx in &[[0, 0, 0, 0], [0, 1, 1, 2], [0, 0, 2, 1]] {
            let mut plus = live.clone();
            plus[idx] += eps;
            let mut minus = live.clone();
            minus[idx] -= eps;

            let numeric = (probe.loss(&plus).unwrap() - probe.loss(&minus).unwrap()) / (2.0 * eps);
            let analytic = grad[idx];
            assert!(
                (numeric - analytic).abs() <= 1e-2 * analytic.abs().max(1e-2),
                "{:?}: {} vs {}",
                idx,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn mismatched_live_shape_fails() {
        let probe = ContentLoss::new(&ramp((1, 3, 4, 4)), &Array4::ones((1, 1, 4, 4))).unwrap();
        let err = probe.loss(&ramp((1, 3, 4, 5))).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Shape);
    }

    #[test]
    fn mask_must_match_feature_resolution() {
        let err = StyleLoss::new(&ramp((1, 3, 4, 4)), &Array4::ones((1, 1, 2, 2))).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Shape);
    }
}
