use std::fmt;

#[derive(Debug)]
pub struct InvalidRange {
    pub(crate) min: f32,
    pub(crate) max: f32,
    pub(crate) value: f32,
    pub(crate) name: &'static str,
}

impl fmt::Display for InvalidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "parameter '{}' - value '{}' is outside the range of {}-{}",
            self.name, self.value, self.min, self.max
        )
    }
}

#[derive(Debug)]
pub struct SizeMismatch {
    pub(crate) input: &'static str,
    pub(crate) expected: (u32, u32),
    pub(crate) actual: (u32, u32),
}

impl fmt::Display for SizeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the {} image size ({}x{}) must match the content image size ({}x{})",
            self.input, self.actual.0, self.actual.1, self.expected.0, self.expected.1
        )
    }
}

#[derive(Debug)]
pub struct ShapeMismatch {
    pub(crate) context: &'static str,
    pub(crate) expected: Vec<usize>,
    pub(crate) actual: Vec<usize>,
}

impl fmt::Display for ShapeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: expected a tensor of shape {:?}, got {:?}",
            self.context, self.expected, self.actual
        )
    }
}

/// Broad classification of an [`Error`], used to turn a failed request into
/// a user facing message without inspecting every variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The feature extractor or the loss configuration can't be used
    Configuration,
    /// Image, mask or feature dimensions are incompatible
    Shape,
    /// An input couldn't be read or an output couldn't be written
    Decode,
}

#[derive(Debug)]
pub enum Error {
    /// An error in the image library occurred, eg failed to load/save
    Image(image::ImageError),
    /// A base64 payload was malformed
    Base64(base64::DecodeError),
    /// An input parameter had an invalid range specified
    InvalidRange(InvalidRange),
    /// The style image or the mask doesn't have the content image's size
    SizeMismatch(SizeMismatch),
    /// A tensor didn't have the shape an operation requires
    ShapeMismatch(ShapeMismatch),
    /// A tensor couldn't be reshaped
    Tensor(ndarray::ShapeError),
    /// The feature extractor contains a layer the loss graph can't traverse
    UnrecognizedLayer(String),
    /// A content or style layer was requested that the feature extractor
    /// doesn't have
    MissingLayer(String),
    /// Neither content nor style layers were configured
    NoLossLayers,
    /// A pooling layer reduced a feature map to nothing
    InputTooSmall { layer: String, width: usize, height: usize },
    /// One of the content, style or mask images was never provided
    MissingInput(&'static str),
    /// Io is notoriously error free with no problems, but we cover it just in case!
    Io(std::io::Error),
    /// The user specified an image format we don't support as the output
    UnsupportedOutputFormat(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnrecognizedLayer(_)
            | Self::MissingLayer(_)
            | Self::NoLossLayers
            | Self::InvalidRange(_) => ErrorKind::Configuration,
            Self::SizeMismatch(_)
            | Self::ShapeMismatch(_)
            | Self::Tensor(_)
            | Self::InputTooSmall { .. } => ErrorKind::Shape,
            Self::Image(_)
            | Self::Base64(_)
            | Self::MissingInput(_)
            | Self::Io(_)
            | Self::UnsupportedOutputFormat(_) => ErrorKind::Decode,
        }
    }

    pub(crate) fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch(ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Image(err) => Some(err),
            Self::Base64(err) => Some(err),
            Self::Tensor(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image(ie) => write!(f, "{}", ie),
            Self::Base64(de) => write!(f, "malformed base64 payload: {}", de),
            Self::InvalidRange(ir) => write!(f, "{}", ir),
            Self::SizeMismatch(sm) => write!(f, "{}", sm),
            Self::ShapeMismatch(sm) => write!(f, "{}", sm),
            Self::Tensor(se) => write!(f, "{}", se),
            Self::UnrecognizedLayer(name) => write!(f, "unrecognized layer: {}", name),
            Self::MissingLayer(name) => write!(
                f,
                "layer '{}' was requested but the feature extractor has no such layer",
                name
            ),
            Self::NoLossLayers => write!(
                f,
                "at least 1 content or style layer must be specified"
            ),
            Self::InputTooSmall {
                layer,
                width,
                height,
            } => write!(
                f,
                "the input ({}x{} at '{}') is too small to be pooled any further",
                width, height, layer
            ),
            Self::MissingInput(which) => write!(f, "no {} image was provided", which),
            Self::Io(io) => write!(f, "{}", io),
            Self::UnsupportedOutputFormat(fmt) => {
                write!(f, "the output format '{}' is not supported", fmt)
            }
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(ie: image::ImageError) -> Self {
        Self::Image(ie)
    }
}

impl From<base64::DecodeError> for Error {
    fn from(de: base64::DecodeError) -> Self {
        Self::Base64(de)
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(se: ndarray::ShapeError) -> Self {
        Self::Tensor(se)
    }
}

impl From<std::io::Error> for Error {
    fn from(io: std::io::Error) -> Self {
        Self::Io(io)
    }
}
