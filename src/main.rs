use clap::Parser;
use neume_extract::config::{self, ExtractConfig, MeiInput};
use neume_extract::output;
use neume_extract::pipeline::{AbortReason, CancelToken, PipelineController};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn};

/// Annotation file used when neither `--annotations` nor `--mei` is given.
const DEFAULT_ANNOTATIONS: &str = "public/real-annotations.json";

/// Exit status of a run stopped by Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "neume-extract")]
#[command(version)]
#[command(about = "Extract a class-sorted neume image corpus from IIIF annotations")]
#[command(long_about = "\
Extract a class-sorted neume image corpus from IIIF annotations

Reads annotation records (class → region URLs or template boxes), fetches each
region from its IIIF server, and stores the crops as:

  <output-dir>/
  ├── neume_metadata.csv          # provenance ledger, one row per image
  ├── Virga/
  │   ├── page007_000.jpg
  │   └── page007_001.jpg
  └── Punctum_inclinatum/
      └── page012_000.jpg

Re-running over the same input is safe: existing images are never fetched
again. Template boxes (e.g. from MEI) are scaled around their center before
cropping; IIIF region URLs are used as-is.

Run 'neume-extract --print-config' for a documented settings file.")]
struct Cli {
    /// Annotation collection exported by the viewer
    #[arg(long)]
    annotations: Option<PathBuf>,

    /// Extraction root
    #[arg(long, default_value = "public/exported_neumes")]
    output_dir: PathBuf,

    /// Only extract this class
    #[arg(long, value_name = "CLASS")]
    filter_type: Option<String>,

    /// Ledger path [default: <output-dir>/neume_metadata.csv]
    #[arg(long)]
    metadata: Option<PathBuf>,

    /// Horizontal expansion for template boxes
    #[arg(long)]
    width_scale: Option<f64>,

    /// Vertical expansion for template boxes
    #[arg(long)]
    height_scale: Option<f64>,

    /// Concurrent fetch workers
    #[arg(long)]
    workers: Option<usize>,

    /// Report per-class counts without fetching anything
    #[arg(long)]
    analyze_only: bool,

    /// Log every task
    #[arg(long, short)]
    verbose: bool,

    /// Keep the existing ledger and add to it
    #[arg(long)]
    append: bool,

    /// Settings file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print a stock settings file with all options documented
    #[arg(long)]
    print_config: bool,

    /// MEI file whose zones become template boxes
    #[arg(long, requires = "mei_image")]
    mei: Option<PathBuf>,

    /// Page image URL the MEI zones refer to
    #[arg(long, requires = "mei")]
    mei_image: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", config::stock_config_toml());
        return ExitCode::SUCCESS;
    }

    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// `RUST_LOG` wins; otherwise info, or debug with `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose {
        "neume_extract=debug"
    } else {
        "neume_extract=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(cli: &Cli) -> Result<ExtractConfig, config::ConfigError> {
    let mut settings = config::load_settings(cli.config.as_deref())?;
    if let Some(scale) = cli.width_scale {
        settings.scale.width_scale = scale;
    }
    if let Some(scale) = cli.height_scale {
        settings.scale.height_scale = scale;
    }
    if let Some(workers) = cli.workers {
        settings.processing.workers = workers;
    }

    let mei = match (&cli.mei, &cli.mei_image) {
        (Some(path), Some(image_url)) => Some(MeiInput {
            path: path.clone(),
            image_url: image_url.clone(),
        }),
        _ => None,
    };
    let annotations = match (&cli.annotations, &mei) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(_)) => None,
        (None, None) => Some(PathBuf::from(DEFAULT_ANNOTATIONS)),
    };

    let config = ExtractConfig {
        annotations,
        mei,
        output_dir: cli.output_dir.clone(),
        metadata: cli.metadata.clone(),
        filter_class: cli.filter_type.clone(),
        append: cli.append,
        settings,
    };
    config.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = build_config(&cli)?;

    if cli.analyze_only {
        let analysis = PipelineController::http(config)?.analyze()?;
        output::print_analysis(&analysis);
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, letting in-flight tasks finish");
        handler_token.cancel();
    })?;

    let controller = PipelineController::http(config)?.with_cancel(cancel);
    let (tx, rx) = std::sync::mpsc::channel();
    let printer = std::thread::spawn(move || {
        for event in rx {
            for line in output::format_task_event(&event) {
                println!("{}", line);
            }
        }
    });
    // The controller owns the sender; it is dropped when `run` returns, which
    // ends the printer loop.
    let result = controller.with_events(tx).run();
    if printer.join().is_err() {
        warn!("progress printer panicked");
    }
    let summary = result?;

    println!();
    output::print_summary(&summary);

    Ok(match summary.abort {
        None => ExitCode::SUCCESS,
        Some(AbortReason::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Some(AbortReason::WriteFailed(_)) => ExitCode::FAILURE,
    })
}
