use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use mangasr_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use mangasr_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use mangasr_core::model::OnnxModelLoader;
use mangasr_core::tiling::TileGrid;
use mangasr_core::{
    Bitmap, DenoiseLevel, ModelFamily, ScaleFactor, UpscaleSettings, UpscalerService,
};

#[derive(Parser)]
#[command(name = "mangasr", about = "Super-resolution for manga pages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale page images and write PNGs.
    Upscale(UpscaleArgs),
    /// List every settings combination and whether its model file is present.
    Models {
        #[arg(long)]
        json: bool,
    },
    /// Print the tile layout used for an image of the given size.
    Grid { width: u32, height: u32 },
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(required = true, help = "Input images (PNG, JPEG or WebP)")]
    inputs: Vec<PathBuf>,
    #[arg(short = 'o', long, default_value = "upscaled")]
    output_dir: PathBuf,
    #[arg(long, help = "anime, photo or realcugan (defaults to config)")]
    family: Option<String>,
    #[arg(long, help = "2 or 4 (defaults to config)")]
    scale: Option<u32>,
    #[arg(long, allow_hyphen_values = true, help = "-1 to 3 (defaults to config)")]
    noise: Option<i8>,
    #[arg(long, help = "Fail instead of writing the original when upscaling fails")]
    strict: bool,
}

#[derive(Debug, Serialize)]
struct ModelListing {
    stem: String,
    family: ModelFamily,
    scale: u32,
    denoise: i8,
    path: PathBuf,
    present: bool,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );

    if let Err(error) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %error, "Failed to initialize data directory");
    }
    let cfg_path = config_path(&resolved_data_dir);
    let config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(error) => {
            warn!(error = %error, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %cfg_path.display(),
        backend = %config.runtime.backend,
        "Runtime startup metadata"
    );

    match cli.command {
        Commands::Upscale(args) => run_upscale(args, &config, &resolved_data_dir).await,
        Commands::Models { json } => list_models(&config.model_loader(&resolved_data_dir), json),
        Commands::Grid { width, height } => print_grid(width, height, &config),
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let filter = init_plan.filters.effective_filter;

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filter));

    let fallback = match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filter));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
                return;
            }
            None
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
                return;
            }
            Some((attempted_log_dir, reason))
        }
    };

    if let Some((attempted_log_dir, reason)) = fallback {
        warn!(
            attempted_log_dir = ?attempted_log_dir,
            reason = %reason,
            "Persistent file logging unavailable; continuing with console-only logging"
        );
    }
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!("Invalid log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'.");
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// Command-line overrides layered on top of the configured defaults.
fn resolve_settings(args: &UpscaleArgs, config: &AppConfig) -> Result<UpscaleSettings> {
    let mut settings = config.upscale.settings();
    if let Some(family) = args.family.as_deref() {
        settings.model_family = ModelFamily::from_str_lossy(family);
    }
    if let Some(scale) = args.scale {
        settings.scale_factor = ScaleFactor::from_value(scale)
            .with_context(|| format!("unsupported scale factor {scale} (expected 2 or 4)"))?;
    }
    if let Some(noise) = args.noise {
        settings.denoise_level = DenoiseLevel::from_value(noise)
            .with_context(|| format!("unsupported denoise level {noise} (expected -1 to 3)"))?;
    }
    Ok(settings)
}

fn output_path(output_dir: &Path, input: &Path, settings: &UpscaleSettings) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "page".to_string());
    output_dir.join(format!("{stem}.{}.png", settings.model_stem()))
}

async fn run_upscale(args: UpscaleArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let settings = resolve_settings(&args, config)?;
    let loader = config.model_loader(data_dir);
    if !loader.is_present(&settings) {
        warn!(
            model = %loader.model_path(&settings).display(),
            "Model file missing; pages will be written unchanged"
        );
    }

    let service = Arc::new(UpscalerService::new(
        Arc::new(loader),
        config.service_options(),
    )?);

    let mut pages = Vec::with_capacity(args.inputs.len());
    for input in &args.inputs {
        let decoded = image::open(input)
            .with_context(|| format!("failed to decode image: {}", input.display()))?;
        let page = Bitmap::from_dynamic(decoded).with_reference_id(input.display().to_string());
        pages.push((input.clone(), page));
    }

    // Pages warm up in the background; the foreground request joins an in-flight preload.
    let preloads: Vec<_> = pages
        .iter()
        .filter_map(|(_, page)| service.preload(page.clone(), settings))
        .collect();

    std::fs::create_dir_all(&args.output_dir).with_context(|| {
        format!("failed to create output directory: {}", args.output_dir.display())
    })?;

    for (input, page) in &pages {
        let started = Instant::now();
        let output = if args.strict {
            service
                .upscale_now(page, settings)
                .await
                .with_context(|| format!("failed to upscale {}", input.display()))?
        } else {
            service.upscale(page, settings).await
        };

        let target = output_path(&args.output_dir, input, &settings);
        output
            .as_rgba()
            .save(&target)
            .with_context(|| format!("failed to write {}", target.display()))?;
        info!(
            input = %input.display(),
            output = %target.display(),
            width = output.width(),
            height = output.height(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Page written"
        );
    }

    for preload in preloads {
        let _ = preload.await;
    }

    let stats = service.stats();
    info!(
        pages = pages.len(),
        inference_runs = stats.inference_runs,
        cache_hits = stats.cache_hits,
        coalesced = stats.coalesced,
        "Upscale finished"
    );
    Ok(())
}

fn list_models(loader: &OnnxModelLoader, json: bool) -> Result<()> {
    let listings: Vec<ModelListing> = UpscaleSettings::all()
        .map(|settings| ModelListing {
            stem: settings.model_stem(),
            family: settings.model_family,
            scale: settings.scale(),
            denoise: settings.denoise_level.value(),
            path: loader.model_path(&settings),
            present: loader.is_present(&settings),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }

    for listing in &listings {
        let marker = if listing.present { "ok" } else { "--" };
        println!("[{marker}] {:<28} {}", listing.stem, listing.path.display());
    }
    Ok(())
}

fn print_grid(width: u32, height: u32, config: &AppConfig) -> Result<()> {
    if width == 0 || height == 0 {
        bail!("image dimensions must be non-zero");
    }
    let tiling = &config.tiling;
    let pixels = u64::from(width) * u64::from(height);
    if pixels < tiling.pixel_threshold {
        println!(
            "{width}x{height} ({pixels} px) is below the {} px threshold: single pass",
            tiling.pixel_threshold
        );
        return Ok(());
    }

    let grid = TileGrid::for_dimensions(width, height, tiling)?;
    println!(
        "{width}x{height}: {} cols x {} rows = {} tiles (tile {}, overlap {}, step {})",
        grid.cols,
        grid.rows,
        grid.len(),
        grid.tile_size,
        grid.overlap,
        grid.step()
    );
    for tile in grid.tiles(width, height) {
        println!(
            "  r{}c{} x={} y={} {}x{}",
            tile.row, tile.col, tile.x, tile.y, tile.width, tile.height
        );
    }
    Ok(())
}
