use std::{path::PathBuf, process::ExitCode, time::Instant};

use clap::Parser;
use platereader::{
    distinct_plates, util::load_image, CrnnNet, DeskewMethod, Detector, PlateReaderBuilder,
};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Finds license plates in photos and prints the plate numbers read.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Detector to run. Repeat to run several; all of them by default.
    #[arg(short, long, value_enum)]
    detector: Vec<Detector>,
    /// How plates are straightened before segmentation.
    #[arg(long, value_enum, default_value_t = DeskewMethod::Text)]
    deskew: DeskewMethod,
    /// ONNX CRNN recognition model.
    #[arg(long)]
    rec_model: PathBuf,
    /// Character dictionary of the recognition model, one key per line.
    #[arg(long)]
    keys: PathBuf,
    #[arg(long, default_value_t = 4)]
    threads: usize,
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let recognizer = match CrnnNet::init(args.rec_model, args.keys, args.threads) {
        Ok(recognizer) => recognizer,
        Err(err) => {
            eprintln!("failed to load recognizer: {err}");
            return ExitCode::FAILURE;
        }
    };
    let mut reader = PlateReaderBuilder::new()
        .detectors(args.detector)
        .deskew_method(args.deskew)
        .build();

    for path in &args.images {
        let image = match load_image(path) {
            Ok(image) => image,
            Err(err) => {
                eprintln!("{}: failed to load: {err}", path.display());
                continue;
            }
        };

        let start = Instant::now();
        let readings = match reader.read(&image, &recognizer) {
            Ok(readings) => readings,
            Err(err) => {
                eprintln!("{}: {err}", path.display());
                continue;
            }
        };
        log::debug!("{} took {:?}", path.display(), start.elapsed());

        let plates = distinct_plates(&readings);
        if plates.is_empty() {
            println!("{}: no plates detected", path.display());
        } else {
            println!("{}: {}", path.display(), plates.join(", "));
        }
    }
    ExitCode::SUCCESS
}
