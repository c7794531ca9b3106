//! sectionmark - certify numbered section boundaries in an OCR'd gamebook

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use sectionmark_lib::config::{EngineConfig, SectionRange};
use sectionmark_lib::pipeline::completion::{CompletionClient, OllamaClient};
use sectionmark_lib::pipeline::diagnostic::write_bundle;
use sectionmark_lib::pipeline::escalation::RepairCache;
use sectionmark_lib::pipeline::extraction::{DirectoryPageImages, OllamaVisionOcr};
use sectionmark_lib::pipeline::processor::{EngineError, SectionEngine};

#[derive(Parser)]
#[command(name = "sectionmark")]
#[command(
    version,
    about = "Find, repair and certify gamebook section boundaries",
    long_about = None
)]
#[command(after_help = "EXAMPLES:
    sectionmark --units book.jsonl --output spans.jsonl --max 400
    sectionmark --units book.jsonl --output spans.jsonl --regions regions.json \\
        --page-images pages/ --known-missing 17 --allow-missing")]
struct Cli {
    /// Text units, one JSON object per line
    #[arg(long, value_name = "PATH")]
    units: PathBuf,

    /// Certified spans, one JSON object per line
    #[arg(long, value_name = "PATH")]
    output: PathBuf,

    /// Macro regions (front matter / gameplay / end matter)
    #[arg(long, value_name = "PATH")]
    regions: Option<PathBuf>,

    /// Spans from a previous run, trusted first
    #[arg(long, value_name = "PATH")]
    seed_spans: Option<PathBuf>,

    /// Engine configuration JSON
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Report directory [default: <output stem>-report]
    #[arg(long, value_name = "DIR")]
    report_dir: Option<PathBuf>,

    /// First expected section number
    #[arg(long)]
    min: Option<u32>,

    /// Last expected section number
    #[arg(long)]
    max: Option<u32>,

    /// Pass when at least this many sections are found
    #[arg(long)]
    min_coverage: Option<u32>,

    /// Section ids known to be absent from the book
    #[arg(long, value_delimiter = ',')]
    known_missing: Vec<u32>,

    /// Repair attempts before giving up
    #[arg(long)]
    max_retries: Option<u32>,

    /// Also ask the scan model to list headers page by page
    #[arg(long)]
    model_scan: bool,

    /// Ollama base URL
    #[arg(long, value_name = "URL")]
    ollama_url: Option<String>,

    #[arg(long, value_name = "MODEL")]
    scan_model: Option<String>,

    #[arg(long, value_name = "MODEL")]
    repair_model: Option<String>,

    #[arg(long, value_name = "MODEL")]
    vision_model: Option<String>,

    /// Directory of rendered page images for vision repair
    #[arg(long, value_name = "DIR")]
    page_images: Option<PathBuf>,

    /// Persist model and OCR responses here
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Exit 0 even when coverage fails
    #[arg(long)]
    allow_missing: bool,

    /// Tracing filter, overrides RUST_LOG
    #[arg(long, value_name = "FILTER")]
    log_filter: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    sectionmark_lib::init_tracing(cli.log_filter.as_deref());

    match run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "Run failed");
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> Result<u8, EngineError> {
    let config = load_config(cli)?;
    let mut engine = SectionEngine::new(config)?;

    let cache = Arc::new(match &cli.cache_dir {
        Some(dir) => RepairCache::with_dir(dir),
        None => RepairCache::in_memory(),
    });
    engine = engine.with_cache(cache);

    let needs_text_model =
        engine.config().detectors.model_scan || engine.config().escalation.model_repair;
    let needs_vision = engine.config().escalation.vision_repair && cli.page_images.is_some();

    if needs_text_model || needs_vision {
        let models = engine.config().models.clone();
        let client = Arc::new(OllamaClient::from_config(&models)?);
        preflight(client.as_ref(), &models.repair_model);

        if needs_text_model {
            engine = engine.with_completion(client.clone());
        }
        if let (true, Some(dir)) = (needs_vision, &cli.page_images) {
            let images =
                DirectoryPageImages::new(dir, engine.config().page_image_pattern.as_deref());
            engine = engine
                .with_vision(Arc::new(OllamaVisionOcr::new(client, models.vision_model.clone())))
                .with_page_images(Arc::new(images));
        }
    }

    let outcome = engine.run_files(&cli.units, cli.regions.as_deref(), cli.seed_spans.as_deref())?;
    write_bundle(&outcome, &cli.output, cli.report_dir.as_deref())?;

    if !outcome.passed() {
        tracing::warn!(
            missing = ?outcome.coverage.missing,
            allow_missing = cli.allow_missing,
            "Coverage not certified"
        );
    }
    Ok(outcome.exit_code(cli.allow_missing))
}

/// Config file (or defaults), then CLI overrides, then validation.
fn load_config(cli: &Cli) -> Result<EngineConfig, EngineError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    if cli.min.is_some() || cli.max.is_some() {
        config.range = SectionRange {
            min: cli.min.unwrap_or(config.range.min),
            max: cli.max.unwrap_or(config.range.max),
        };
    }
    if cli.min_coverage.is_some() {
        config.min_coverage = cli.min_coverage;
    }
    if !cli.known_missing.is_empty() {
        config.known_missing = cli.known_missing.clone();
    }
    if let Some(retries) = cli.max_retries {
        config.escalation.max_retries = retries;
    }
    if cli.model_scan {
        config.detectors.model_scan = true;
    }
    if let Some(url) = &cli.ollama_url {
        config.models.base_url = url.clone();
    }
    if let Some(model) = &cli.scan_model {
        config.models.scan_model = model.clone();
    }
    if let Some(model) = &cli.repair_model {
        config.models.repair_model = model.clone();
    }
    if let Some(model) = &cli.vision_model {
        config.models.vision_model = model.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Warn early when the server or model is missing; the tiers degrade on
/// their own, so this never fails the run.
fn preflight(client: &dyn CompletionClient, model: &str) {
    match client.is_model_available(model) {
        Ok(true) => tracing::debug!(model, "Repair model available"),
        Ok(false) => tracing::warn!(model, "Repair model not pulled; model repair will fail"),
        Err(e) => tracing::warn!(error = %e, "Ollama unreachable; model tiers will fail"),
    }
}
