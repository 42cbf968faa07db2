//! Builds the loss graph: the feature extractor's layers, in order, with
//! content and style probes inserted after the layers they observe.

use ndarray::Array4;
use tracing::debug;

use crate::{
    layers::{FeatureExtractor, Layer, LayerKind, LayerName, Normalization, Saved},
    loss::{ContentLoss, StyleLoss},
    mask::propagate,
    patch_match::{mean_cosine_similarity, PatchMatcher},
    Error,
};

/// Which layers get probes, and how style targets are matched
#[derive(Clone, Debug)]
pub struct GraphConfig {
    pub content_layers: Vec<String>,
    pub style_layers: Vec<String>,
    pub patch_matcher: PatchMatcher,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            content_layers: vec!["relu4_1".to_owned()],
            style_layers: vec![
                "relu3_1".to_owned(),
                "relu4_1".to_owned(),
                "relu5_1".to_owned(),
            ],
            patch_matcher: PatchMatcher::default(),
        }
    }
}

enum Stage<'a> {
    Normalize(Normalization),
    Layer { name: LayerName, layer: &'a Layer },
    Content { probe: usize, at: LayerName },
    Style { probe: usize, at: LayerName },
}

impl<'a> Stage<'a> {
    fn is_probe(&self) -> bool {
        matches!(self, Self::Content { .. } | Self::Style { .. })
    }

    fn name(&self) -> String {
        match self {
            Self::Normalize(_) => "normalization".to_owned(),
            Self::Layer { name, .. } => name.to_string(),
            Self::Content { at, .. } => format!("content_loss{}_{}", at.block, at.index),
            Self::Style { at, .. } => format!("style_loss{}_{}", at.block, at.index),
        }
    }
}

enum Tape {
    Pass,
    Layer(Saved),
    Probe(Array4<f32>),
}

/// Relative importance of the style and content probes
#[derive(Copy, Clone, Debug)]
pub struct LossWeights {
    pub style: f32,
    pub content: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            style: 100.0,
            content: 5.0,
        }
    }
}

/// Result of a single forward/backward pass through the graph
pub struct Evaluation {
    /// `style + content`
    pub loss: f32,
    /// Sum of all content probe losses, times the content weight
    pub content_score: f32,
    /// Sum of all style probe losses, times the style weight
    pub style_score: f32,
    /// Gradient of `loss` with respect to the evaluated image
    pub gradient: Array4<f32>,
}

/// The frozen layers of a feature extractor interleaved with loss probes.
///
/// Layers are borrowed from the extractor, so building a graph never copies
/// any parameters.
pub struct LossGraph<'a> {
    stages: Vec<Stage<'a>>,
    content_losses: Vec<ContentLoss>,
    style_losses: Vec<StyleLoss>,
}

impl<'a> LossGraph<'a> {
    /// Walks the extractor layer by layer, keeping the mask in step with the
    /// feature maps, and inserts a probe after every configured layer. The
    /// graph is cut right after the last probe.
    pub fn build(
        extractor: &'a FeatureExtractor,
        content: &Array4<f32>,
        style: &Array4<f32>,
        mask: &Array4<f32>,
        config: &GraphConfig,
    ) -> Result<Self, Error> {
        if config.content_layers.is_empty() && config.style_layers.is_empty() {
            return Err(Error::NoLossLayers);
        }

        if style.dim() != content.dim() {
            return Err(Error::shape("style image", content.shape(), style.shape()));
        }

        let (batch, _, height, width) = content.dim();
        if mask.dim() != (batch, 1, height, width) && mask.dim() != (1, 1, height, width) {
            return Err(Error::shape("mask", &[1, 1, height, width], mask.shape()));
        }

        let normalization = Normalization::default();
        let mut content_features = normalization.forward(content)?;
        let mut style_features = normalization.forward(style)?;
        let mut mask = mask.clone();

        let mut pending_content: Vec<&str> = config.content_layers.iter().map(|s| s.as_str()).collect();
        let mut pending_style: Vec<&str> = config.style_layers.iter().map(|s| s.as_str()).collect();

        let mut graph = Self {
            stages: vec![Stage::Normalize(normalization)],
            content_losses: Vec::new(),
            style_losses: Vec::new(),
        };

        let mut block = 1;
        let mut index = 0;

        for layer in extractor.layers() {
            let kind = layer.kind()?;
            let name = match kind {
                LayerKind::Convolution => {
                    index += 1;
                    LayerName { kind, block, index }
                }
                LayerKind::Pooling => {
                    let name = LayerName { kind, block, index };
                    block += 1;
                    index = 0;
                    name
                }
                LayerKind::Activation | LayerKind::Normalization => {
                    LayerName { kind, block, index }
                }
            };

            mask = propagate(&mask, kind);

            debug!("Adding {}", name);
            graph.stages.push(Stage::Layer { name, layer });

            // keep traversing so every layer is still classified, but there
            // is nothing left to compute features for
            if pending_content.is_empty() && pending_style.is_empty() {
                continue;
            }

            content_features = layer.forward(&content_features)?;
            if !pending_style.is_empty() {
                style_features = layer.forward(&style_features)?;
            }

            let (_, _, fh, fw) = content_features.dim();
            if fh == 0 || fw == 0 {
                return Err(Error::InputTooSmall {
                    layer: name.to_string(),
                    width,
                    height,
                });
            }

            let label = name.to_string();

            // a layer listed more than once still gets a single loss
            if pending_content.contains(&label.as_str()) {
                pending_content.retain(|l| *l != label);

                let probe = ContentLoss::new(&content_features, &mask)?;
                graph.stages.push(Stage::Content {
                    probe: graph.content_losses.len(),
                    at: name,
                });
                graph.content_losses.push(probe);

                debug!("Adding content loss at {}", label);
            }

            if pending_style.contains(&label.as_str()) {
                pending_style.retain(|l| *l != label);

                let matched = config
                    .patch_matcher
                    .match_features(&content_features, &style_features)?;

                let unmatched = mean_cosine_similarity(&content_features, &style_features)?;
                let improved = mean_cosine_similarity(&content_features, &matched)?;
                debug!(
                    unmatched,
                    matched = improved,
                    "mean cosine similarity at {}",
                    label
                );

                let probe = StyleLoss::new(&matched, &mask)?;
                graph.stages.push(Stage::Style {
                    probe: graph.style_losses.len(),
                    at: name,
                });
                graph.style_losses.push(probe);

                debug!("Adding style loss at {}", label);
            }
        }

        if let Some(missing) = pending_content.first().or_else(|| pending_style.first()) {
            return Err(Error::MissingLayer((*missing).to_owned()));
        }

        // nothing after the last probe contributes to the loss
        if let Some(last) = graph.stages.iter().rposition(Stage::is_probe) {
            graph.stages.truncate(last + 1);
        }

        Ok(graph)
    }

    pub fn content_losses(&self) -> &[ContentLoss] {
        &self.content_losses
    }

    pub fn style_losses(&self) -> &[StyleLoss] {
        &self.style_losses
    }

    /// The names of every stage, in evaluation order, eg. `conv1_1` or
    /// `style_loss3_1`
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(Stage::name).collect()
    }

    /// Runs the image through the graph, letting every probe measure its
    /// discrepancy, then back propagates the weighted sum of those
    /// discrepancies to the image.
    pub fn evaluate(&self, image: &Array4<f32>, weights: LossWeights) -> Result<Evaluation, Error> {
        let mut tape = Vec::with_capacity(self.stages.len());
        let mut content_score = 0.0;
        let mut style_score = 0.0;

        let mut x = image.clone();
        for stage in &self.stages {
            match stage {
                Stage::Normalize(normalization) => {
                    x = normalization.forward(&x)?;
                    tape.push(Tape::Pass);
                }
                Stage::Layer { layer, .. } => {
                    let (out, saved) = layer.forward_saved(&x)?;
                    x = out;
                    tape.push(Tape::Layer(saved));
                }
                Stage::Content { probe, .. } => {
                    let (loss, grad) = self.content_losses[*probe].loss_and_grad(&x)?;
                    content_score += loss;
                    tape.push(Tape::Probe(grad * weights.content));
                }
                Stage::Style { probe, .. } => {
                    let (loss, grad) = self.style_losses[*probe].loss_and_grad(&x)?;
                    style_score += loss;
                    tape.push(Tape::Probe(grad * weights.style));
                }
            }
        }

        let mut grad = Array4::zeros(x.raw_dim());
        for (stage, saved) in self.stages.iter().zip(tape).rev() {
            grad = match (stage, saved) {
                (Stage::Normalize(normalization), _) => normalization.backward(&grad)?,
                (Stage::Layer { layer, .. }, Tape::Layer(saved)) => layer.backward(&saved, grad)?,
                (_, Tape::Probe(probe_grad)) => grad + probe_grad,
                _ => grad,
            };
        }

        let content_score = content_score * weights.content;
        let style_score = style_score * weights.style;

        Ok(Evaluation {
            loss: content_score + style_score,
            content_score,
            style_score,
            gradient: grad,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::layers::{BatchNorm2d, Block, Conv2d};
    use ndarray::Array1;

    const TINY: &[Block] = &[
        Block::Conv(4),
        Block::Pool,
        Block::Conv(6),
        Block::Conv(6),
        Block::Pool,
        Block::Conv(8),
        Block::Pool,
    ];

    fn image(h: usize, w: usize, phase: f32) -> Array4<f32> {
        Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| {
            0.5 + 0.4 * ((c as f32 + phase) * 1.3 + y as f32 * 0.7 + x as f32 * 0.45).sin()
        })
    }

    fn config(content: &[&str], style: &[&str]) -> GraphConfig {
        GraphConfig {
            content_layers: content.iter().map(|s| s.to_string()).collect(),
            style_layers: style.iter().map(|s| s.to_string()).collect(),
            patch_matcher: PatchMatcher {
                patch_size: 3,
                max_thread_count: 2,
            },
        }
    }

    #[test]
    fn graph_is_cut_after_last_probe() {
        let extractor = FeatureExtractor::vgg(TINY, false, 1);
        let mask = Array4::ones((1, 1, 8, 8));
        let graph = LossGraph::build(
            &extractor,
            &image(8, 8, 0.0),
            &image(8, 8, 1.0),
            &mask,
            &config(&["relu2_1"], &["relu1_1", "relu2_2"]),
        )
        .unwrap();

        let names = graph.stage_names();
        assert_eq!(
            names,
            vec![
                "normalization",
                "conv1_1",
                "relu1_1",
                "style_loss1_1",
                "pool1_1",
                "conv2_1",
                "relu2_1",
                "content_loss2_1",
                "conv2_2",
                "relu2_2",
                "style_loss2_2",
            ]
        );
        assert_eq!(graph.content_losses().len(), 1);
        assert_eq!(graph.style_losses().len(), 2);
    }

    #[test]
    fn content_probe_precedes_style_probe_on_shared_layer() {
        let extractor = FeatureExtractor::vgg(TINY, false, 2);
        let graph = LossGraph::build(
            &extractor,
            &image(8, 8, 0.0),
            &image(8, 8, 1.0),
            &Array4::ones((1, 1, 8, 8)),
            &config(&["relu1_1"], &["relu1_1"]),
        )
        .unwrap();

        let names = graph.stage_names();
        assert_eq!(&names[names.len() - 2..], &["content_loss1_1", "style_loss1_1"]);
    }

    #[test]
    fn batch_norm_layers_are_named() {
        let extractor = FeatureExtractor::vgg(TINY, true, 3);
        let graph = LossGraph::build(
            &extractor,
            &image(8, 8, 0.0),
            &image(8, 8, 1.0),
            &Array4::ones((1, 1, 8, 8)),
            &config(&["relu1_1"], &[]),
        )
        .unwrap();

        assert_eq!(
            graph.stage_names(),
            vec!["normalization", "conv1_1", "bn1_1", "relu1_1", "content_loss1_1"]
        );
    }

    #[test]
    fn unsupported_layer_aborts() {
        let extractor = FeatureExtractor::new(vec![
            Layer::Relu,
            Layer::Unsupported("AvgPool2d".to_owned()),
        ]);
        let err = LossGraph::build(
            &extractor,
            &image(4, 4, 0.0),
            &image(4, 4, 1.0),
            &Array4::ones((1, 1, 4, 4)),
            &config(&["relu1_0"], &[]),
        )
        .err()
        .unwrap();

        assert!(matches!(err, Error::UnrecognizedLayer(ref name) if name == "AvgPool2d"));
    }

    #[test]
    fn repeated_layer_names_get_one_loss() {
        let extractor = FeatureExtractor::vgg(TINY, false, 6);
        let graph = LossGraph::build(
            &extractor,
            &image(8, 8, 0.0),
            &image(8, 8, 1.0),
            &Array4::ones((1, 1, 8, 8)),
            &config(&["relu2_1", "relu2_1"], &["relu1_1", "relu2_1", "relu1_1"]),
        )
        .unwrap();

        assert_eq!(graph.content_losses().len(), 1);
        assert_eq!(graph.style_losses().len(), 2);
        assert_eq!(
            graph.stage_names(),
            vec![
                "normalization",
                "conv1_1",
                "relu1_1",
                "style_loss1_1",
                "pool1_1",
                "conv2_1",
                "relu2_1",
                "content_loss2_1",
                "style_loss2_1",
            ]
        );
    }

    #[test]
    fn missing_layers_are_reported() {
        let extractor = FeatureExtractor::vgg(TINY, false, 4);
        let err = LossGraph::build(
            &extractor,
            &image(8, 8, 0.0),
            &image(8, 8, 1.0),
            &Array4::ones((1, 1, 8, 8)),
            &config(&["relu9_1"], &[]),
        )
        .err()
        .unwrap();

        assert!(matches!(err, Error::MissingLayer(ref name) if name == "relu9_1"));
    }

    #[test]
    fn too_small_inputs_are_reported() {
        let extractor = FeatureExtractor::vgg(TINY, false, 5);
        let err = LossGraph::build(
            &extractor,
            &image(2, 2, 0.0),
            &image(2, 2, 1.0),
            &Array4::ones((1, 1, 2, 2)),
            &config(&["relu3_1"], &[]),
        )
        .err()
        .unwrap();

        assert_eq!(err.kind(), crate::ErrorKind::Shape);
    }

    fn conv(out_channels: usize, in_channels: usize, salt: usize) -> Layer {
        let weight = Array4::from_shape_fn((out_channels, in_channels, 3, 3), |(o, i, y, x)| {
            ((o * 7 + i * 3 + y * 5 + x + salt) as f32 * 0.37).sin() * 0.1
        });
        Layer::Conv2d(Conv2d::new(weight, Array1::zeros(out_channels), 1).unwrap())
    }

    #[test]
    fn gradient_matches_finite_differences() {
        // no ReLU or pooling, so the loss is smooth everywhere
        let extractor = FeatureExtractor::new(vec![
            conv(4, 3, 0),
            Layer::BatchNorm2d(
                BatchNorm2d::new(
                    Array1::zeros(4),
                    Array1::ones(4),
                    Array1::from_elem(4, 1.5),
                    Array1::from_elem(4, 0.1),
                    1e-5,
                )
                .unwrap(),
            ),
            conv(5, 4, 11),
        ]);

        let content = image(6, 6, 0.0);
        let style = image(6, 6, 2.0);
        let mask = Array4::from_shape_fn((1, 1, 6, 6), |(_, _, y, _)| if y < 4 { 1.0 } else { 0.0 });

        let graph = LossGraph::build(
            &extractor,
            &content,
            &style,
            &mask,
            &config(&["conv1_2"], &["conv1_1"]),
        )
        .unwrap();

        assert_eq!(
            graph.stage_names(),
            vec![
                "normalization",
                "conv1_1",
                "style_loss1_1",
                "bn1_1",
                "conv1_2",
                "content_loss1_2",
            ]
        );

        let weights = LossWeights {
            style: 1e-6,
            content: 1e-3,
        };
        let live = image(6, 6, 0.7);
        let eval = graph.evaluate(&live, weights).unwrap();
        assert!(eval.loss > 0.0);

        let eps = 1e-2;
        for &idx in &[[0, 0, 1, 1], [0, 2, 3, 2], [0, 1, 0, 5]] {
            let mut plus = live.clone();
            plus[idx] += eps;
            let mut minus = live.clone();
            minus[idx] -= eps;

            let numeric = (graph.evaluate(&plus, weights).unwrap().loss
                - graph.evaluate(&minus, weights).unwrap().loss)
                / (2.0 * eps);
            let analytic = eval.gradient[idx];

            let scale = analytic.abs().max(numeric.abs()).max(1e-3);
            assert!(
                (numeric - analytic).abs() <= 0.05 * scale,
                "{:?}: {} vs {}",
                idx,
                numeric,
                analytic
            );
        }
    }

    #[test]
    fn evaluation_at_content_has_no_content_loss() {
        let extractor = FeatureExtractor::vgg(TINY, false, 7);
        let content = image(8, 8, 0.0);
        let graph = LossGraph::build(
            &extractor,
            &content,
            &image(8, 8, 1.0),
            &Array4::ones((1, 1, 8, 8)),
            &config(&["relu2_1"], &[]),
        )
        .unwrap();

        let eval = graph.evaluate(&content, LossWeights::default()).unwrap();
        assert_eq!(eval.content_score, 0.0);
        assert!(eval.gradient.iter().all(|&g| g == 0.0));
    }
}
