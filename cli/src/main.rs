use structopt::StructOpt;

use deep_harmonization::{
    image::ImageFormat as ImgFmt, Dims, Error, FeatureExtractor, OptimizerProgress, Session,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod progress_window;
use progress_window::ProgressWindow;

fn parse_size(input: &str) -> Result<(u32, u32), std::num::ParseIntError> {
    let mut i = input.splitn(2, 'x');

    let x: u32 = i.next().unwrap_or("").parse()?;
    let y: u32 = match i.next() {
        Some(num) => num.parse()?,
        None => x,
    };
    Ok((x, y))
}

enum OutFmt {
    Image(ImgFmt),
    DataUrl,
}

fn parse_out_fmt(input: &str) -> Result<OutFmt, String> {
    let fmt = match input {
        "png" => OutFmt::Image(ImgFmt::Png),
        "jpg" => OutFmt::Image(ImgFmt::Jpeg),
        "bmp" => OutFmt::Image(ImgFmt::Bmp),
        "data-url" => OutFmt::DataUrl,
        other => {
            return Err(format!(
                "output format `{}` not one of: 'png', 'jpg', 'bmp', 'data-url'",
                other
            ))
        }
    };

    Ok(fmt)
}

#[derive(StructOpt)]
#[structopt(rename_all = "kebab-case")]
struct Tweaks {
    /// The maximum number of optimizer iterations
    #[structopt(long, default_value = "500")]
    steps: u32,
    /// How strongly the texture of the style image is enforced
    #[structopt(long, default_value = "100")]
    style_weight: f32,
    /// How strongly the structure of the content image is preserved
    #[structopt(long, default_value = "5")]
    content_weight: f32,
    /// Side length of the neighbourhoods compared when matching content features
    /// to style features, must be odd
    #[structopt(long, default_value = "3")]
    patch_size: usize,
    /// Comma separated layers whose features are compared with the content image
    #[structopt(long, use_delimiter = true, default_value = "relu4_1")]
    content_layers: Vec<String>,
    /// Comma separated layers whose patch matched features are compared with the style image
    #[structopt(long, use_delimiter = true, default_value = "relu3_1,relu4_1,relu5_1")]
    style_layers: Vec<String>,
    /// How much the edge of the mask is feathered when blending the result into the
    /// style image, 0 gives a hard edge
    #[structopt(long, default_value = "3")]
    soft_mask_sigma: f32,
    /// Seed of the randomly initialized VGG-19 used as the feature extractor
    #[structopt(long, default_value = "0")]
    seed: u64,
    /// Don't show progress bars
    #[structopt(long)]
    no_progress: bool,
}

#[derive(StructOpt)]
#[structopt(
    name = "deep-harmonization",
    about = "Harmonizes the masked region of a content image into a style image",
    rename_all = "kebab-case"
)]
struct Opt {
    /// The image whose structure is kept inside the mask
    #[structopt(long, parse(from_os_str))]
    content: PathBuf,
    /// The image whose texture is transferred, and which is kept outside the mask
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// The region to harmonize, white is harmonized and black is kept from the style
    /// image. Only the first channel is used.
    #[structopt(long, parse(from_os_str))]
    mask: PathBuf,
    /// Resize all inputs, in `width x height`, or a single number for both dimensions
    #[structopt(long, parse(try_from_str = parse_size))]
    in_size: Option<(u32, u32)>,
    /// The format to write the harmonized image as.
    ///
    /// NOTE: this will only apply when stdout is specified via `-o -`, otherwise the image
    /// format is determined by the file extension of the path provided to `-o`
    #[structopt(
        long,
        default_value = "png",
        parse(try_from_str = parse_out_fmt)
    )]
    out_fmt: OutFmt,
    /// The path to save the harmonized image to, the file extensions of the path determines
    /// the image format used. You may use `-` for stdout.
    #[structopt(long = "out", short, parse(from_os_str))]
    output_path: PathBuf,
    /// The maximum number of worker threads that can be active at any one time
    /// while matching patches. Defaults to the logical core count.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    #[structopt(flatten)]
    tweaks: Tweaks,
}

fn main() {
    if let Err(e) = real_main() {
        if atty::is(atty::Stream::Stderr) {
            eprintln!("\x1b[31merror\x1b[0m: {}", e);
        } else {
            eprintln!("error: {}", e);
        }

        std::process::exit(1);
    }
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    // Logs would tear through the progress bars, so only warnings are shown by
    // default while they are drawn
    let default_filter = if args.tweaks.no_progress {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Check that the extension for the path supplied by the user is one of the ones we support
    {
        match args.output_path.extension().and_then(|ext| ext.to_str()) {
            Some("png") | Some("jpg") | Some("bmp") => {}
            None => {}
            Some(other) => return Err(Error::UnsupportedOutputFormat(other.to_owned())),
        }
    }

    let mut sb = Session::builder()
        .content(&args.content)
        .style(&args.style)
        .mask(&args.mask)
        .num_steps(args.tweaks.steps)
        .style_weight(args.tweaks.style_weight)
        .content_weight(args.tweaks.content_weight)
        .patch_size(args.tweaks.patch_size)
        .content_layers(args.tweaks.content_layers.iter().cloned())
        .style_layers(args.tweaks.style_layers.iter().cloned())
        .soft_mask_sigma(args.tweaks.soft_mask_sigma);

    if let Some(mt) = args.max_threads {
        sb = sb.max_thread_count(mt);
    }

    if let Some(insize) = args.in_size {
        sb = sb.resize_input(Dims::new(insize.0, insize.1));
    }

    let session = sb.build()?;

    tracing::info!(seed = args.tweaks.seed, "building VGG-19 feature extractor");
    let extractor = FeatureExtractor::vgg19(args.tweaks.seed);

    let progress: Option<Box<dyn OptimizerProgress>> = if !args.tweaks.no_progress {
        Some(Box::new(ProgressWindow::new()))
    } else {
        None
    };

    let harmonized = session.run(&extractor, progress)?;

    if args.output_path.to_str() == Some("-") {
        let out = std::io::stdout();
        let mut out = out.lock();

        match args.out_fmt {
            OutFmt::Image(fmt) => harmonized.write(&mut out, fmt)?,
            OutFmt::DataUrl => {
                use std::io::Write;
                writeln!(out, "{}", harmonized.to_data_url()?)?;
            }
        }
    } else {
        // This won't respect the output format specified by the user,
        // only the extension on the path they specify, but that makes
        // more sense, and is probably better than detecting and emitting
        // an error
        harmonized.save(&args.output_path)?;
    }

    Ok(())
}
