use crate::*;

/// Harmonization session.
///
/// Calling `run()` will optimize a new image and return it, consuming the
/// session in the process. You can provide an `OptimizerProgress`
/// implementation to get an update after every evaluation of the loss, with
/// the image currently being optimized and the current probe scores.
///
/// # Example
/// ```no_run
/// let extractor = deep_harmonization::FeatureExtractor::vgg19(0);
///
/// let session = deep_harmonization::Session::builder()
///     .content(&"imgs/content.png")
///     .style(&"imgs/style.png")
///     .mask(&"imgs/mask.png")
///     .build().expect("failed to build session");
///
/// let harmonized = session.run(&extractor, None).expect("failed to harmonize");
/// harmonized.save("harmonized.png").expect("failed to save image");
/// ```
pub struct Session {
    content: Array4<f32>,
    style: Array4<f32>,
    mask: Array4<f32>,
    params: Parameters,
}

impl Session {
    /// Creates a new session with default parameters.
    pub fn builder<'a>() -> SessionBuilder<'a> {
        SessionBuilder::default()
    }

    /// The size all inputs were loaded at
    pub fn dims(&self) -> Dims {
        let (_, _, height, width) = self.content.dim();
        Dims::new(width as u32, height as u32)
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Runs the optimization and outputs the harmonized image.
    ///
    /// The extractor is only read, so the same extractor can be used by any
    /// number of sessions, even concurrently.
    pub fn run(
        self,
        extractor: &FeatureExtractor,
        progress: Option<Box<dyn OptimizerProgress>>,
    ) -> Result<HarmonizedImage, Error> {
        let synthesis = synthesize(
            extractor,
            &self.content,
            &self.style,
            &self.mask,
            &self.params,
            progress,
        )?;

        Ok(HarmonizedImage {
            tensor: synthesis.image,
            report: synthesis.report,
        })
    }
}

/// Builds a session by setting parameters and adding input images, calling
/// `build` will check all of the provided inputs to verify that a
/// harmonization can be run with them
#[derive(Default)]
pub struct SessionBuilder<'a> {
    content: Option<ImageSource<'a>>,
    style: Option<ImageSource<'a>>,
    mask: Option<ImageSource<'a>>,
    resize_input: Option<Dims>,
    params: Parameters,
}

impl<'a> SessionBuilder<'a> {
    /// Creates a new `SessionBuilder`, can also be created via
    /// `Session::builder()`
    pub fn new() -> Self {
        Self::default()
    }

    /// The image whose structure is kept inside the mask
    pub fn content<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.content = Some(img.into());
        self
    }

    /// The image whose texture is transferred, and which the result is
    /// blended back into outside the mask
    pub fn style<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.style = Some(img.into());
        self
    }

    /// The region to harmonize. Only the first channel is used, white is
    /// harmonized, black keeps the style image.
    pub fn mask<I: Into<ImageSource<'a>>>(mut self, img: I) -> Self {
        self.mask = Some(img.into());
        self
    }

    /// Overwrite incoming images sizes
    pub fn resize_input(mut self, dims: Dims) -> Self {
        self.resize_input = Some(dims);
        self
    }

    /// How strongly the texture of the style image is enforced.
    ///
    /// Default: 100.0
    pub fn style_weight(mut self, weight: f32) -> Self {
        self.params.style_weight = weight;
        self
    }

    /// How strongly the structure of the content image is preserved.
    ///
    /// Default: 5.0
    pub fn content_weight(mut self, weight: f32) -> Self {
        self.params.content_weight = weight;
        self
    }

    /// The maximum number of optimizer iterations.
    ///
    /// Default: 500
    pub fn num_steps(mut self, steps: u32) -> Self {
        self.params.num_steps = steps;
        self
    }

    /// The layers, eg. `relu4_1`, whose features are compared with the
    /// content image.
    ///
    /// Default: `relu4_1`
    pub fn content_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.content_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// The layers whose patch matched features are compared with the style
    /// image.
    ///
    /// Default: `relu3_1`, `relu4_1`, `relu5_1`
    pub fn style_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.style_layers = layers.into_iter().map(Into::into).collect();
        self
    }

    /// Side length of the neighbourhoods compared during patch matching, must
    /// be odd.
    ///
    /// Default: 3
    pub fn patch_size(mut self, size: usize) -> Self {
        self.params.patch_size = size;
        self
    }

    /// How much the mask's edge is feathered when blending the result into
    /// the style image. `0.0` gives a hard edge.
    ///
    /// Default: 3.0
    pub fn soft_mask_sigma(mut self, sigma: f32) -> Self {
        self.params.soft_mask_sigma = sigma;
        self
    }

    /// Controls the maximum number of threads that will be spawned at any one
    /// time in parallel during patch matching.
    ///
    /// The result does not depend on this number.
    ///
    /// Default: The number of logical cores on this system.
    pub fn max_thread_count(mut self, count: usize) -> Self {
        self.params.max_thread_count = Some(count);
        self
    }

    /// Creates a `Session`, or returns an error if invalid parameters or input
    /// images were specified.
    pub fn build(self) -> Result<Session, Error> {
        self.params.check_validity()?;

        let content = self.content.ok_or(Error::MissingInput("content"))?;
        let style = self.style.ok_or(Error::MissingInput("style"))?;
        let mask = self.mask.ok_or(Error::MissingInput("mask"))?;

        let content = utils::load_image(content, self.resize_input)?;
        let style = utils::load_image(style, self.resize_input)?;
        let mask = utils::load_mask(mask, self.resize_input)?;

        synthesis::check_inputs(&content, &style, &mask)?;

        Ok(Session {
            content,
            style,
            mask,
            params: self.params,
        })
    }
}

/// Helper struct for passing progress information to external callers
pub struct ProgressStat {
    /// The current amount of work that has been done
    pub current: usize,
    /// The total amount of work to do
    pub total: usize,
}

/// The current state of the optimizer
pub struct ProgressUpdate<'a> {
    /// The image that was just evaluated
    pub image: &'a Array4<f32>,
    /// Completed optimizer iterations
    pub iteration: ProgressStat,
    /// Loss evaluations, line search trials included
    pub evaluation: ProgressStat,
    pub content_score: f32,
    pub style_score: f32,
}

/// Allows the optimizer to update external callers with the current
/// progress of the harmonization
pub trait OptimizerProgress {
    fn update(&mut self, info: ProgressUpdate<'_>);
}

impl<G> OptimizerProgress for G
where
    G: FnMut(ProgressUpdate<'_>) + Send,
{
    fn update(&mut self, info: ProgressUpdate<'_>) {
        self(info)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn png(width: u32, height: u32, value: u8) -> Vec<u8> {
        utils::encode(
            image::RgbImage::from_pixel(width, height, image::Rgb([value, value / 2, 255 - value])),
            image::ImageFormat::Png,
        )
        .unwrap()
    }

    #[test]
    fn missing_inputs_are_reported() {
        let content = png(4, 4, 10);
        let err = Session::builder()
            .content(ImageSource::Memory(&content))
            .build()
            .err()
            .unwrap();

        assert!(matches!(err, Error::MissingInput("style")));
    }

    #[test]
    fn invalid_parameters_are_reported() {
        let img = png(4, 4, 10);
        let builder = || {
            Session::builder()
                .content(ImageSource::Memory(&img))
                .style(ImageSource::Memory(&img))
                .mask(ImageSource::Memory(&img))
        };

        for builder in vec![
            builder().patch_size(4),
            builder().patch_size(0),
            builder().style_weight(-1.0),
            builder().soft_mask_sigma(f32::NAN),
            builder().max_thread_count(0),
        ] {
            let err = builder.build().err().unwrap();
            assert!(matches!(err, Error::InvalidRange(_)), "{}", err);
        }

        let err = builder()
            .content_layers(Vec::<String>::new())
            .style_layers(Vec::<String>::new())
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoLossLayers));
    }

    #[test]
    fn inputs_must_share_a_size() {
        let content = png(8, 8, 10);
        let style = png(8, 6, 200);

        let err = Session::builder()
            .content(ImageSource::Memory(&content))
            .style(ImageSource::Memory(&style))
            .mask(ImageSource::Memory(&content))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, Error::SizeMismatch(_)));

        let session = Session::builder()
            .content(ImageSource::Memory(&content))
            .style(ImageSource::Memory(&style))
            .mask(ImageSource::Memory(&content))
            .resize_input(Dims::new(12, 10))
            .build()
            .unwrap();
        assert_eq!(session.dims(), Dims::new(12, 10));
    }
}
