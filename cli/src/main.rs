use structopt::StructOpt;

mod progress;

use std::{io::Write, path::PathBuf, sync::Arc};
use style_synthesis::{image::ImageOutputFormat as ImgFmt, Backbone, Dims, Error, Session};
use tracing_subscriber::EnvFilter;

fn parse_size(input: &str) -> Result<(u32, u32), std::num::ParseIntError> {
    let mut i = input.splitn(2, 'x');

    let x: u32 = i.next().unwrap_or("").parse()?;
    let y: u32 = match i.next() {
        Some(num) => num.parse()?,
        None => x,
    };
    Ok((x, y))
}

fn parse_img_fmt(input: &str) -> Result<ImgFmt, String> {
    let fmt = match input {
        "png" => ImgFmt::Png,
        "jpg" => ImgFmt::Jpeg(75),
        "bmp" => ImgFmt::Bmp,
        other => {
            return Err(format!(
                "image format `{}` not one of: 'png', 'jpg', 'bmp'",
                other
            ))
        }
    };

    Ok(fmt)
}

#[derive(StructOpt)]
#[structopt(
    name = "style-synthesis",
    about = "Synthesizes images in the style of an example image",
    rename_all = "kebab-case"
)]
struct Opt {
    /// The image whose style is synthesized. The output has the same size,
    /// unless `--in-size` is given
    #[structopt(long, parse(from_os_str))]
    style: PathBuf,
    /// Path to the weights file of the backbone network
    #[structopt(long, parse(from_os_str))]
    backbone: PathBuf,
    /// The path to save the generated image to, the file extensions of the path determines
    /// the image format used. You may use `-` for stdout.
    #[structopt(long = "out", short, parse(from_os_str))]
    output_path: PathBuf,
    /// The format to save the generated image as.
    ///
    /// NOTE: this will only apply when stdout is specified via `-o -`, otherwise the image
    /// format is determined by the file extension of the path provided to `-o`
    #[structopt(
        long,
        default_value = "png",
        parse(try_from_str = parse_img_fmt)
    )]
    out_fmt: ImgFmt,
    /// Resize the style image, in `width x height`, or a single number for both dimensions
    #[structopt(long, parse(try_from_str = parse_size))]
    in_size: Option<(u32, u32)>,
    /// The number of macro-iterations, the candidate image is clipped after each one
    #[structopt(long, default_value = "10")]
    iterations: u32,
    /// The maximum number of loss evaluations per macro-iteration
    #[structopt(long = "max-evals", default_value = "20")]
    max_evaluations: u32,
    /// Comma separated names of the layers whose style is matched. Defaults to the
    /// first convolution of every block
    #[structopt(long, use_delimiter = true)]
    layers: Vec<String>,
    /// Comma separated weights, one for each of `--layers`
    #[structopt(long, use_delimiter = true)]
    layer_weights: Vec<f64>,
    /// A seed value for the initial noise image
    #[structopt(long)]
    seed: Option<u64>,
    /// The maximum number of worker threads that can be active at any one time
    /// while synthesizing images. Defaults to the logical core count.
    #[structopt(short = "t", long = "threads")]
    max_threads: Option<usize>,
    /// Stop early once a macro-iteration improves the loss by less than this
    /// fraction
    #[structopt(long)]
    tolerance: Option<f64>,
    /// Write the loss of every macro-iteration to this file, one per line
    #[structopt(long, parse(from_os_str))]
    loss_out: Option<PathBuf>,
    /// Don't show progress bars
    #[structopt(long)]
    no_progress: bool,
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

fn init_logging(progress: bool) {
    // keep the progress bars readable unless asked otherwise
    let default = if progress { "warn" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr))
        .try_init();
}

fn real_main() -> Result<(), Error> {
    let args = Opt::from_args();

    init_logging(!args.no_progress);

    // Check that the extension for the path supplied by the user is one of the ones we support
    {
        match args.output_path.extension().and_then(|ext| ext.to_str()) {
            Some("png") | Some("jpg") | Some("bmp") => {}
            None => {}
            Some(other) => return Err(Error::UnsupportedOutputFormat(other.to_owned())),
        }
    }

    let backbone = Arc::new(Backbone::open(&args.backbone)?);

    let mut sb = Session::builder()
        .style_image(&args.style)
        .backbone(backbone)
        .iterations(args.iterations)
        .max_evaluations(args.max_evaluations)
        .seed(args.seed.unwrap_or_default());

    if !args.layers.is_empty() {
        sb = sb.layers(args.layers.iter().cloned());
    }

    if !args.layer_weights.is_empty() {
        sb = sb.layer_weights(args.layer_weights.iter().copied());
    }

    if let Some(mt) = args.max_threads {
        sb = sb.max_thread_count(mt);
    }

    if let Some(tol) = args.tolerance {
        sb = sb.convergence_tolerance(tol);
    }

    if let Some(insize) = args.in_size {
        sb = sb.resize_input(Dims::new(insize.0, insize.1));
    }

    let session = sb.build()?;

    let progress: Option<Box<dyn style_synthesis::GeneratorProgress>> = if !args.no_progress {
        Some(Box::new(progress::ProgressBars::new()))
    } else {
        None
    };

    let generated = session.run(progress)?;

    if let Some(ref path) = args.loss_out {
        let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
        for loss in generated.loss_history() {
            writeln!(out, "{}", loss)?;
        }
        out.flush()?;
    }

    if args.output_path.to_str() == Some("-") {
        let out = std::io::stdout();
        let mut out = out.lock();
        generated.write(&mut out, args.out_fmt)?;
    } else {
        // This won't respect the output format specified by the user,
        // only the extension on the path they specify, but that makes
        // more sense, and is probably better than detecting and emitting
        // an error
        generated.save(&args.output_path)?;
    }

    Ok(())
}
