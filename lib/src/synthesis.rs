//! Drives a single harmonization: builds the loss graph, optimizes the image
//! and blends the result back into the style image.

use ndarray::{Array4, Zip};
use tracing::info;

use crate::{
    errors::SizeMismatch,
    graph::{LossGraph, LossWeights},
    layers::FeatureExtractor,
    mask::soft_mask,
    optim::{lbfgs, LbfgsConfig, Objective, TerminationReason},
    session::{OptimizerProgress, ProgressStat, ProgressUpdate},
    Error, Parameters,
};

/// The weighted probe scores of a single evaluation
#[derive(Copy, Clone, Debug)]
pub struct LossRecord {
    pub content_score: f32,
    pub style_score: f32,
}

/// How the optimization of a harmonized image went
#[derive(Clone, Debug)]
pub struct Report {
    pub iterations: usize,
    pub evaluations: usize,
    pub termination: TerminationReason,
    /// One record per evaluation, in order
    pub history: Vec<LossRecord>,
}

pub struct Synthesis {
    /// `[1, 3, H, W]`, values in `[0,1]`
    pub image: Array4<f32>,
    pub report: Report,
}

/// Checks that content and style are `[1, 3, H, W]` and the mask is
/// `[1, 1, H, W]`.
pub(crate) fn check_inputs(
    content: &Array4<f32>,
    style: &Array4<f32>,
    mask: &Array4<f32>,
) -> Result<(), Error> {
    let (batch, channels, height, width) = content.dim();
    if batch != 1 || channels != 3 {
        return Err(Error::shape("content image", &[1, 3, height, width], content.shape()));
    }
    if height == 0 || width == 0 {
        return Err(Error::InputTooSmall {
            layer: "input".to_owned(),
            width,
            height,
        });
    }

    let same_size = |input: &'static str, x: &Array4<f32>| {
        let (_, _, h, w) = x.dim();
        if (h, w) != (height, width) {
            return Err(Error::SizeMismatch(SizeMismatch {
                input,
                expected: (width as u32, height as u32),
                actual: (w as u32, h as u32),
            }));
        }
        Ok(())
    };

    let (sb, sc, _, _) = style.dim();
    if sb != 1 || sc != 3 {
        return Err(Error::shape("style image", &[1, 3, height, width], style.shape()));
    }
    same_size("style", style)?;

    let (mb, mc, _, _) = mask.dim();
    if mb != 1 || mc != 1 {
        return Err(Error::shape("mask", &[1, 1, height, width], mask.shape()));
    }
    same_size("mask", mask)?;

    Ok(())
}

/// `soft * optimized + (1 - soft) * style`, the single channel `soft` mask
/// being broadcast over the image channels.
pub fn blend(
    optimized: &Array4<f32>,
    style: &Array4<f32>,
    soft: &Array4<f32>,
) -> Result<Array4<f32>, Error> {
    if optimized.dim() != style.dim() {
        return Err(Error::shape("style image", optimized.shape(), style.shape()));
    }

    let (batch, _, height, width) = optimized.dim();
    let weights = soft
        .broadcast(optimized.raw_dim())
        .ok_or_else(|| Error::shape("soft mask", &[batch, 1, height, width], soft.shape()))?;

    let mut out = style.clone();
    Zip::from(&mut out)
        .and(optimized)
        .and(weights)
        .for_each(|o, &x, &s| *o = s * x + (1.0 - s) * *o);

    Ok(out)
}

/// Whether the evaluation with the zero based index `run` is logged, the
/// first one always is
fn is_logged(run: usize) -> bool {
    run % 100 == 0
}

struct Harmonization<'g, 'a> {
    graph: &'g LossGraph<'a>,
    weights: LossWeights,
    iteration: usize,
    max_iterations: usize,
    evaluation: usize,
    max_evaluations: usize,
    progress: Option<Box<dyn OptimizerProgress>>,
    history: Vec<LossRecord>,
}

impl<'g, 'a> Objective for Harmonization<'g, 'a> {
    fn evaluate(&mut self, x: &Array4<f32>) -> Result<(f32, Array4<f32>), Error> {
        let eval = self.graph.evaluate(x, self.weights)?;

        if is_logged(self.evaluation) {
            info!(
                evaluation = self.evaluation + 1,
                style = eval.style_score,
                content = eval.content_score,
                "optimizing"
            );
        }
        self.evaluation += 1;

        self.history.push(LossRecord {
            content_score: eval.content_score,
            style_score: eval.style_score,
        });

        if let Some(progress) = self.progress.as_mut() {
            progress.update(ProgressUpdate {
                image: x,
                iteration: ProgressStat {
                    current: self.iteration,
                    total: self.max_iterations,
                },
                evaluation: ProgressStat {
                    current: self.evaluation,
                    total: self.max_evaluations,
                },
                content_score: eval.content_score,
                style_score: eval.style_score,
            });
        }

        Ok((eval.loss, eval.gradient))
    }

    fn iteration_done(&mut self, iteration: usize, _value: f32) {
        self.iteration = iteration;
    }
}

/// Harmonizes the masked region of `content` with `style`.
///
/// `content` and `style` are `[1, 3, H, W]` images with values in `[0,1]`,
/// `mask` is `[1, 1, H, W]`. Outside the (softened) mask the result is the
/// style image, inside it is the optimized image.
pub fn synthesize(
    extractor: &FeatureExtractor,
    content: &Array4<f32>,
    style: &Array4<f32>,
    mask: &Array4<f32>,
    params: &Parameters,
    progress: Option<Box<dyn OptimizerProgress>>,
) -> Result<Synthesis, Error> {
    params.check_validity()?;
    check_inputs(content, style, mask)?;

    let graph = LossGraph::build(extractor, content, style, mask, &params.graph_config())?;
    info!(
        content_probes = graph.content_losses().len(),
        style_probes = graph.style_losses().len(),
        "built loss graph"
    );

    let config = LbfgsConfig::with_max_iter(params.num_steps as usize);
    let mut objective = Harmonization {
        graph: &graph,
        weights: params.weights(),
        iteration: 0,
        max_iterations: config.max_iter,
        evaluation: 0,
        max_evaluations: config.max_eval,
        progress,
        history: Vec::new(),
    };

    let result = lbfgs(&mut objective, content.clone(), &config)?;
    info!(
        iterations = result.iterations,
        evaluations = result.evaluations,
        termination = ?result.termination,
        "optimization finished"
    );

    let optimized = result.x.mapv(|v| v.max(0.0).min(1.0));
    let image = blend(&optimized, style, &soft_mask(mask, params.soft_mask_sigma))?;

    Ok(Synthesis {
        image,
        report: Report {
            iterations: result.iterations,
            evaluations: result.evaluations,
            termination: result.termination,
            history: objective.history,
        },
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_soft_mask_keeps_style() {
        let optimized = Array4::from_elem((1, 3, 4, 4), 0.25);
        let style = Array4::from_shape_fn((1, 3, 4, 4), |(_, c, y, x)| (c + y + x) as f32 / 10.0);

        let out = blend(&optimized, &style, &Array4::zeros((1, 1, 4, 4))).unwrap();
        assert_eq!(out, style);
    }

    #[test]
    fn full_soft_mask_keeps_optimized() {
        let optimized = Array4::from_elem((1, 3, 2, 3), 0.25);
        let style = Array4::from_elem((1, 3, 2, 3), 0.75);

        let out = blend(&optimized, &style, &Array4::ones((1, 1, 2, 3))).unwrap();
        assert_eq!(out, optimized);
    }

    #[test]
    fn every_hundredth_evaluation_is_logged_from_the_first() {
        let logged: Vec<usize> = (0..250).filter(|&run| is_logged(run)).collect();
        assert_eq!(logged, vec![0, 100, 200]);
    }

    #[test]
    fn mismatched_sizes_are_rejected() {
        let content = Array4::zeros((1, 3, 8, 8));

        let err = check_inputs(&content, &Array4::zeros((1, 3, 8, 6)), &Array4::zeros((1, 1, 8, 8)))
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch(_)));

        let err = check_inputs(&content, &Array4::zeros((1, 3, 8, 8)), &Array4::zeros((1, 1, 4, 8)))
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch(_)));

        let err = check_inputs(&content, &Array4::zeros((1, 3, 8, 8)), &Array4::zeros((1, 3, 8, 8)))
            .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch(_)));
    }
}
