//! Nearest neighbour patch matching between two feature maps.
//!
//! Every location of the content feature map is paired with the style
//! location whose surrounding patch is the most similar, and the style
//! feature vector found there is copied into the output. The result has the
//! content's spatial layout but contains only style features.

use ndarray::{s, Array1, Array2, Array4, ArrayView2, Axis};
use std::ops::Range;

use crate::{errors, Error};

/// Number of content rows handled by a single work item.
const ROWS_PER_TASK: usize = 4;

/// Configuration for [`PatchMatcher::match_features`]
#[derive(Copy, Clone, Debug)]
pub struct PatchMatcher {
    /// Side length of the (square) patch compared around each location,
    /// must be odd
    pub patch_size: usize,
    pub max_thread_count: usize,
}

impl Default for PatchMatcher {
    fn default() -> Self {
        Self {
            patch_size: 3,
            max_thread_count: num_cpus::get(),
        }
    }
}

/// Patch matches `style` against `content` with the default thread count.
pub fn patch_match(
    content: &Array4<f32>,
    style: &Array4<f32>,
    patch_size: usize,
) -> Result<Array4<f32>, Error> {
    PatchMatcher {
        patch_size,
        ..PatchMatcher::default()
    }
    .match_features(content, style)
}

/// Feature maps of a single batch entry, flattened to `[channels, h * w]`
struct Flat {
    features: Array2<f32>,
    sq_norms: Array1<f32>,
}

impl Flat {
    fn new(x: &Array4<f32>, b: usize) -> Result<Self, Error> {
        let (_, channels, height, width) = x.dim();
        let features = x
            .index_axis(Axis(0), b)
            .to_owned()
            .into_shape((channels, height * width))?;
        let sq_norms = features.map_axis(Axis(0), |v| v.dot(&v));

        Ok(Self { features, sq_norms })
    }
}

impl PatchMatcher {
    /// Returns a tensor shaped like `style` where each spatial location holds
    /// the style feature vector best matching the content at that location.
    ///
    /// Patches are compared with the cosine similarity of their flattened
    /// feature vectors. Near the border only the part of the patch that is
    /// inside both maps is compared, nothing is padded. Ties resolve to the
    /// first style location in row-major order.
    pub fn match_features(
        &self,
        content: &Array4<f32>,
        style: &Array4<f32>,
    ) -> Result<Array4<f32>, Error> {
        if content.dim() != style.dim() {
            return Err(Error::shape(
                "patch match style features",
                content.shape(),
                style.shape(),
            ));
        }

        if self.patch_size % 2 == 0 {
            return Err(Error::InvalidRange(errors::InvalidRange {
                min: 1.0,
                max: 15.0,
                value: self.patch_size as f32,
                name: "patch-size (must be odd)",
            }));
        }

        let (batch, _, height, width) = content.dim();
        let mut out = Array4::zeros(style.dim());

        for b in 0..batch {
            let query = Flat::new(content, b)?;
            let source = Flat::new(style, b)?;

            let matches = self.best_matches(&query, &source, (height, width));

            let mut out_b = out.index_axis_mut(Axis(0), b);
            for (p, q) in matches {
                let (y, x) = (p / width, p % width);
                out_b
                    .slice_mut(s![.., y, x])
                    .assign(&source.features.column(q));
            }
        }

        Ok(out)
    }

    fn best_matches(
        &self,
        query: &Flat,
        source: &Flat,
        dims: (usize, usize),
    ) -> Vec<(usize, usize)> {
        let radius = self.patch_size / 2;
        let task_count = (dims.0 + ROWS_PER_TASK - 1) / ROWS_PER_TASK;
        let rows_for = |task: usize| task * ROWS_PER_TASK..((task + 1) * ROWS_PER_TASK).min(dims.0);

        // for WASM we do not have threads, so just go serially
        #[cfg(target_arch = "wasm32")]
        let found = (0..task_count)
            .flat_map(|task| match_rows(query, source, dims, radius, rows_for(task)))
            .collect();

        #[cfg(not(target_arch = "wasm32"))]
        let found = {
            use std::sync::atomic::{AtomicUsize, Ordering};

            let n_workers = self.max_thread_count.max(1).min(task_count.max(1));
            let next_task = AtomicUsize::new(0);

            let worker_fn = || {
                let mut found = Vec::new();
                loop {
                    let task = next_task.fetch_add(1, Ordering::Relaxed);
                    if task >= task_count {
                        break;
                    }
                    found.extend(match_rows(query, source, dims, radius, rows_for(task)));
                }
                found
            };

            let scoped = crossbeam_utils::thread::scope(|scope| {
                let handles: Vec<_> = (0..n_workers)
                    .map(|_| scope.spawn(|_| (worker_fn)()))
                    .collect();

                handles
                    .into_iter()
                    .map(|h| h.join())
                    .collect::<Result<Vec<_>, _>>()
            });

            match scoped {
                Ok(Ok(per_worker)) => per_worker.into_iter().flatten().collect(),
                Ok(Err(panic)) | Err(panic) => std::panic::resume_unwind(panic),
            }
        };

        found
    }
}

/// Finds the best style location for every content location in `rows`.
fn match_rows(
    query: &Flat,
    source: &Flat,
    (height, width): (usize, usize),
    radius: usize,
    rows: Range<usize>,
) -> Vec<(usize, usize)> {
    // dot products of every content vector in the rows (plus the patch
    // overlap above and below) with every style vector
    let band_start = rows.start.saturating_sub(radius);
    let band_end = (rows.end + radius).min(height);
    let band: ArrayView2<'_, f32> = query
        .features
        .slice(s![.., band_start * width..band_end * width]);
    let dots = band.t().dot(&source.features);

    let r = radius as isize;
    let offsets: Vec<(isize, isize)> = (-r..=r)
        .flat_map(|dy| (-r..=r).map(move |dx| (dy, dx)))
        .collect();

    let inside = |v: isize, len: usize| v >= 0 && (v as usize) < len;

    let mut found = Vec::with_capacity(rows.len() * width);
    for y in rows {
        for x in 0..width {
            let mut best = f32::NEG_INFINITY;
            let mut best_q = 0;

            for sy in 0..height {
                for sx in 0..width {
                    let mut dot = 0.0;
                    let mut c_norm = 0.0;
                    let mut s_norm = 0.0;

                    for &(dy, dx) in &offsets {
                        let (cy, cx) = (y as isize + dy, x as isize + dx);
                        let (qy, qx) = (sy as isize + dy, sx as isize + dx);
                        if !inside(cy, height)
                            || !inside(cx, width)
                            || !inside(qy, height)
                            || !inside(qx, width)
                        {
                            continue;
                        }

                        let (cy, cx) = (cy as usize, cx as usize);
                        let q = qy as usize * width + qx as usize;

                        dot += dots[[(cy - band_start) * width + cx, q]];
                        c_norm += query.sq_norms[cy * width + cx];
                        s_norm += source.sq_norms[q];
                    }

                    let denom = (c_norm * s_norm).sqrt();
                    let score = if denom > 0.0 { dot / denom } else { 0.0 };

                    if score > best {
                        best = score;
                        best_q = sy * width + sx;
                    }
                }
            }

            found.push((y * width + x, best_q));
        }
    }

    found
}

/// Mean over all locations of the cosine similarity between the channel
/// vectors of `a` and `b` at that location.
pub fn mean_cosine_similarity(a: &Array4<f32>, b: &Array4<f32>) -> Result<f32, Error> {
    if a.dim() != b.dim() {
        return Err(Error::shape("cosine similarity", a.shape(), b.shape()));
    }

    let (batch, _, height, width) = a.dim();
    let count = batch * height * width;
    if count == 0 {
        return Ok(0.0);
    }

    let mut total = 0.0;
    for bi in 0..batch {
        for y in 0..height {
            for x in 0..width {
                let va = a.slice(s![bi, .., y, x]);
                let vb = b.slice(s![bi, .., y, x]);
                let denom = (va.dot(&va) * vb.dot(&vb)).sqrt();
                if denom > 0.0 {
                    total += va.dot(&vb) / denom;
                }
            }
        }
    }

    Ok(total / count as f32)
}

#[cfg(test)]
mod test {
    use super::*;

    use rand::{Rng, SeedableRng};

    fn features(k: usize, h: usize, w: usize, seed: u64) -> Array4<f32> {
        let mut rng = rand_pcg::Pcg32::seed_from_u64(seed);
        Array4::from_shape_simple_fn((1, k, h, w), || rng.gen_range(-0.5..1.0))
    }

    fn vectors(x: &Array4<f32>) -> Vec<Vec<f32>> {
        let (_, _, h, w) = x.dim();
        let mut out = Vec::new();
        for y in 0..h {
            for xx in 0..w {
                out.push(x.slice(s![0, .., y, xx]).to_vec());
            }
        }
        out
    }

    #[test]
    fn output_only_contains_style_vectors() {
        let content = features(4, 6, 5, 1);
        let style = features(4, 6, 5, 2);

        let matched = PatchMatcher {
            patch_size: 3,
            max_thread_count: 3,
        }
        .match_features(&content, &style)
        .unwrap();

        assert_eq!(matched.dim(), style.dim());
        let style_vectors = vectors(&style);
        for v in vectors(&matched) {
            assert!(style_vectors.contains(&v));
        }
    }

    #[test]
    fn matching_against_itself_is_identity() {
        let content = features(5, 7, 6, 3);
        let matched = patch_match(&content, &content, 3).unwrap();
        assert_eq!(matched, content);
    }

    #[test]
    fn single_pixel_patches_are_cosine_nearest_neighbours() {
        let content = features(3, 4, 4, 4);
        let style = features(3, 4, 4, 5);
        let matched = patch_match(&content, &style, 1).unwrap();

        let cos = |a: &[f32], b: &[f32]| {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            let na: f32 = a.iter().map(|x| x * x).sum();
            let nb: f32 = b.iter().map(|x| x * x).sum();
            dot / (na * nb).sqrt()
        };

        let style_vectors = vectors(&style);
        for (cv, mv) in vectors(&content).iter().zip(vectors(&matched)) {
            let mut best = f32::NEG_INFINITY;
            let mut best_v = &style_vectors[0];
            for sv in &style_vectors {
                let score = cos(cv, sv);
                if score > best {
                    best = score;
                    best_v = sv;
                }
            }
            assert_eq!(&mv, best_v);
        }
    }

    /// Cosine similarity of the patches around `p` in `content` and `q` in
    /// `style`, over the offsets that are inside both maps
    fn truncated_score(
        content: &Array4<f32>,
        style: &Array4<f32>,
        patch_size: usize,
        p: (usize, usize),
        q: (usize, usize),
    ) -> f32 {
        let (_, _, h, w) = content.dim();
        let r = (patch_size / 2) as isize;
        let inside = |y: isize, x: isize| y >= 0 && x >= 0 && (y as usize) < h && (x as usize) < w;

        let (mut dot, mut c_norm, mut s_norm) = (0.0f64, 0.0f64, 0.0f64);
        for dy in -r..=r {
            for dx in -r..=r {
                let (cy, cx) = (p.0 as isize + dy, p.1 as isize + dx);
                let (sy, sx) = (q.0 as isize + dy, q.1 as isize + dx);
                if !inside(cy, cx) || !inside(sy, sx) {
                    continue;
                }

                let c = content.slice(s![0, .., cy as usize, cx as usize]);
                let st = style.slice(s![0, .., sy as usize, sx as usize]);
                for (&a, &b) in c.iter().zip(st.iter()) {
                    dot += f64::from(a) * f64::from(b);
                    c_norm += f64::from(a) * f64::from(a);
                    s_norm += f64::from(b) * f64::from(b);
                }
            }
        }

        let denom = (c_norm * s_norm).sqrt();
        if denom > 0.0 {
            (dot / denom) as f32
        } else {
            0.0
        }
    }

    #[test]
    fn border_patches_are_truncated_not_padded() {
        // small maps, so most locations have part of their patch outside
        for seed in 0..4 {
            let content = features(5, 7, 6, 100 + seed);
            let style = features(5, 7, 6, 200 + seed);
            let (_, _, h, w) = content.dim();
            let locations: Vec<(usize, usize)> =
                (0..h).flat_map(|y| (0..w).map(move |x| (y, x))).collect();

            for &patch_size in &[3, 5] {
                let matched = patch_match(&content, &style, patch_size).unwrap();

                for &p in &locations {
                    let chosen = matched.slice(s![0, .., p.0, p.1]);
                    let q = *locations
                        .iter()
                        .find(|&&(y, x)| style.slice(s![0, .., y, x]) == chosen)
                        .unwrap();

                    let best = locations
                        .iter()
                        .map(|&q| truncated_score(&content, &style, patch_size, p, q))
                        .fold(f32::NEG_INFINITY, f32::max);
                    let score = truncated_score(&content, &style, patch_size, p, q);

                    assert!(
                        score >= best - 1e-5,
                        "P={} at {:?}: picked {:?} scoring {}, best is {}",
                        patch_size,
                        p,
                        q,
                        score,
                        best
                    );
                }
            }
        }
    }

    #[test]
    fn ties_resolve_to_first_location() {
        let content = Array4::ones((1, 2, 3, 3));
        let style = Array4::ones((1, 2, 3, 3)) * 2.0;
        let mut style = style;
        style[[0, 0, 2, 2]] = 5.0;

        let matched = patch_match(&content, &style, 1).unwrap();
        // every uniform style vector scores a perfect 1.0, so (0,0) wins
        for y in 0..3 {
            for x in 0..3 {
                assert_eq!(matched[[0, 0, y, x]], 2.0);
            }
        }
    }

    #[test]
    fn thread_count_does_not_change_result() {
        let content = features(3, 9, 4, 6);
        let style = features(3, 9, 4, 7);

        let serial = PatchMatcher {
            patch_size: 3,
            max_thread_count: 1,
        }
        .match_features(&content, &style)
        .unwrap();
        let parallel = PatchMatcher {
            patch_size: 3,
            max_thread_count: 4,
        }
        .match_features(&content, &style)
        .unwrap();

        assert_eq!(serial, parallel);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let err = patch_match(&features(3, 4, 4, 0), &features(3, 4, 5, 0), 3).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Shape);
    }

    #[test]
    fn even_patch_size_is_rejected() {
        let err = patch_match(&features(3, 4, 4, 0), &features(3, 4, 4, 1), 2).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn matching_improves_similarity() {
        let content = features(4, 6, 6, 8);
        let style = features(4, 6, 6, 9);
        let matched = patch_match(&content, &style, 1).unwrap();

        let before = mean_cosine_similarity(&content, &style).unwrap();
        let after = mean_cosine_similarity(&content, &matched).unwrap();
        assert!(after >= before);
    }
}
