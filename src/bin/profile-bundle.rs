//! CLI binary for profile-bundle.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `BundleConfig` and writes one archive per input photo.

use anyhow::{Context, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use profile_bundle::{
    BundleConfig, BundleProgressCallback, BundleStats, Bundler, CommandSegmenter, ErrorResponse,
    HttpSegmenter, MimeType, OutputVariant, Profile, ProgressCallback, SegmentationParams,
    Segmenter, Stage, Upload,
};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Spinner showing the stage the most recent run entered. Runs may overlap
/// with `--jobs`, so only counters are tracked, not per-run state.
struct CliProgressCallback {
    bar: ProgressBar,
    total: usize,
    done: AtomicUsize,
}

impl CliProgressCallback {
    fn new(total: usize) -> Arc<Self> {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  ⏱ {elapsed}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix(format!("0/{total}"));
        bar.set_message("starting…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            total,
            done: AtomicUsize::new(0),
        })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn advance(&self) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        self.bar.set_prefix(format!("{done}/{}", self.total));
    }
}

impl BundleProgressCallback for CliProgressCallback {
    fn on_stage_start(&self, stage: Stage) {
        let msg = match stage {
            Stage::Preprocess => "preparing image…",
            Stage::Admission => "waiting for a segmentation slot…",
            Stage::Segment => "removing background…",
            Stage::Postprocess => "cropping…",
            Stage::Package => "packaging…",
        };
        self.bar.set_message(msg);
    }

    fn on_bundle_complete(&self, _archive_bytes: usize) {
        self.advance();
    }

    fn on_bundle_error(&self, _detail: &str) {
        self.advance();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # One photo → me.zip next to it
  profile-bundle me.jpg

  # Explicit output path
  profile-bundle me.jpg -o avatars/me.zip

  # Many photos, two segmentations at a time
  profile-bundle --admission-limit 2 --jobs 4 --out-dir bundles/ photos/*.jpg

  # Use a running rembg server instead of spawning rembg per photo
  profile-bundle --segmenter-url http://127.0.0.1:7000/api/remove me.jpg

  # Custom variants
  profile-bundle --variant 512:0.10 --variant 256:0.12 --variant 64:0.14 me.png

  # Machine-readable stats
  profile-bundle --json me.webp

PROFILES:
  standard     768 px / 0.9 MP before segmentation; 512 and 92 px outputs
  portrait     square pre-crop; 512 and 96 px outputs, tighter padding
  low-memory   640 px / 0.5 MP, JPEG q80

ENVIRONMENT VARIABLES:
  PROFILE_BUNDLE_SEGMENTER_URL   rembg-compatible server endpoint
  PROFILE_BUNDLE_SEGMENTER_CMD   segmentation command line (default: rembg i -m u2netp)
  PROFILE_BUNDLE_*               every flag below has an env fallback
  RUST_LOG                       overrides the log filter
"#;

/// Turn photos into ZIP bundles of square, background-free profile pictures.
#[derive(Parser, Debug)]
#[command(
    name = "profile-bundle",
    version,
    about = "Turn photos into ZIP bundles of square, background-free profile pictures",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Input photos (JPG, PNG or WEBP).
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Archive path (single input only).
    #[arg(short, long, env = "PROFILE_BUNDLE_OUTPUT", conflicts_with = "out_dir")]
    output: Option<PathBuf>,

    /// Directory for `<stem>.zip` archives. Default: next to each input.
    #[arg(long, env = "PROFILE_BUNDLE_OUT_DIR")]
    out_dir: Option<PathBuf>,

    /// Declared content type; inferred from the extension when omitted.
    #[arg(long, env = "PROFILE_BUNDLE_CONTENT_TYPE")]
    content_type: Option<String>,

    /// Preset to start from.
    #[arg(long, env = "PROFILE_BUNDLE_PROFILE", value_enum, default_value = "standard")]
    profile: ProfileArg,

    /// Largest accepted upload in bytes.
    #[arg(long, env = "PROFILE_BUNDLE_MAX_UPLOAD_BYTES")]
    max_upload_bytes: Option<usize>,

    /// Longest side before segmentation, in pixels.
    #[arg(long, env = "PROFILE_BUNDLE_MAX_SIDE")]
    max_side: Option<u32>,

    /// Pixel-count ceiling before segmentation.
    #[arg(long, env = "PROFILE_BUNDLE_MAX_PIXELS")]
    max_pixels: Option<u64>,

    /// JPEG quality of the segmentation input (1–100).
    #[arg(long, env = "PROFILE_BUNDLE_JPEG_QUALITY",
          value_parser = clap::value_parser!(u8).range(1..=100))]
    jpeg_quality: Option<u8>,

    /// Square pre-crop before segmentation, with this vertical bias (0–0.5).
    #[arg(long, env = "PROFILE_BUNDLE_PRECROP_BIAS")]
    precrop_bias: Option<f32>,

    /// Segmentation calls allowed in flight at once.
    #[arg(long, env = "PROFILE_BUNDLE_ADMISSION_LIMIT")]
    admission_limit: Option<usize>,

    /// Seconds to wait for a segmentation slot (0 = forever).
    #[arg(long, env = "PROFILE_BUNDLE_ADMISSION_TIMEOUT", default_value_t = 30)]
    admission_timeout: u64,

    /// Seconds allowed per segmentation call (0 = unbounded).
    #[arg(long, env = "PROFILE_BUNDLE_SEGMENTATION_TIMEOUT", default_value_t = 60)]
    segmentation_timeout: u64,

    /// Smallest segmentation output treated as valid, in bytes.
    #[arg(long, env = "PROFILE_BUNDLE_MIN_SEGMENTATION_BYTES")]
    min_segmentation_bytes: Option<usize>,

    /// Enable alpha matting in the segmentation backend.
    #[arg(long, env = "PROFILE_BUNDLE_ALPHA_MATTING")]
    alpha_matting: bool,

    /// Alpha-matting foreground threshold.
    #[arg(long, env = "PROFILE_BUNDLE_FOREGROUND_THRESHOLD", default_value_t = 240)]
    foreground_threshold: u8,

    /// Alpha-matting background threshold.
    #[arg(long, env = "PROFILE_BUNDLE_BACKGROUND_THRESHOLD", default_value_t = 10)]
    background_threshold: u8,

    /// Alpha-matting erosion radius.
    #[arg(long, env = "PROFILE_BUNDLE_ERODE_SIZE", default_value_t = 10)]
    erode_size: u32,

    /// Alpha values below this become fully transparent.
    #[arg(long, env = "PROFILE_BUNDLE_ALPHA_CUTOFF")]
    alpha_cutoff: Option<u8>,

    /// Padding around the subject, as a fraction of its longer side.
    #[arg(long, env = "PROFILE_BUNDLE_CROP_PADDING")]
    crop_padding: Option<f32>,

    /// Alpha above which a pixel counts as subject.
    #[arg(long, env = "PROFILE_BUNDLE_CROP_ALPHA_THRESHOLD")]
    crop_alpha_threshold: Option<u8>,

    /// Output variant as SIZE:BIAS (repeatable), e.g. 512:0.10.
    #[arg(long = "variant", env = "PROFILE_BUNDLE_VARIANTS", value_delimiter = ',',
          value_parser = parse_variant)]
    variants: Vec<OutputVariant>,

    /// Segmentation command line (overrides PROFILE_BUNDLE_SEGMENTER_CMD).
    #[arg(long, conflicts_with = "segmenter_url")]
    segmenter_cmd: Option<String>,

    /// Segmentation server endpoint (overrides PROFILE_BUNDLE_SEGMENTER_URL).
    #[arg(long)]
    segmenter_url: Option<String>,

    /// Model name passed to the segmentation backend.
    #[arg(long, env = "PROFILE_BUNDLE_MODEL")]
    model: Option<String>,

    /// Inputs processed concurrently.
    #[arg(short, long, env = "PROFILE_BUNDLE_JOBS", default_value_t = 1)]
    jobs: usize,

    /// Size of the blocking thread pool.
    #[arg(long, env = "PROFILE_BUNDLE_BLOCKING_THREADS", default_value_t = 4)]
    blocking_threads: usize,

    /// Print stats as JSON on stdout.
    #[arg(long, env = "PROFILE_BUNDLE_JSON")]
    json: bool,

    /// Disable the spinner.
    #[arg(long, env = "PROFILE_BUNDLE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PROFILE_BUNDLE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PROFILE_BUNDLE_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ProfileArg {
    Standard,
    Portrait,
    LowMemory,
}

impl From<ProfileArg> for Profile {
    fn from(v: ProfileArg) -> Self {
        match v {
            ProfileArg::Standard => Profile::Standard,
            ProfileArg::Portrait => Profile::Portrait,
            ProfileArg::LowMemory => Profile::LowMemory,
        }
    }
}

/// One line of `--json` output.
#[derive(Serialize)]
struct Report {
    input: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<BundleStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorResponse>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    if cli.output.is_some() && cli.inputs.len() > 1 {
        anyhow::bail!("--output takes a single input; use --out-dir for several");
    }

    // Every decode, encode and segmentation call runs on this pool.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(cli.blocking_threads.max(1))
        .build()
        .context("Failed to build tokio runtime")?;

    let failures = runtime.block_on(run(cli))?;
    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<usize> {
    check_distinct_outputs(&cli)?;
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let progress = show_progress.then(|| CliProgressCallback::new(cli.inputs.len()));

    let config = build_config(
        &cli,
        progress
            .clone()
            .map(|p| p as Arc<dyn BundleProgressCallback>),
    )?;
    let bundler = Arc::new(Bundler::new(config).context("Failed to set up bundler")?);

    let reports: Vec<Report> = stream::iter(cli.inputs.iter().cloned())
        .map(|input| {
            let bundler = Arc::clone(&bundler);
            let output = output_path(&cli, &input);
            let content_type = cli.content_type.clone();
            async move { bundle_one(&bundler, input, output, content_type).await }
        })
        .buffer_unordered(cli.jobs.max(1))
        .collect()
        .await;

    if let Some(ref p) = progress {
        p.finish();
    }

    let mut failures = 0;
    for report in &reports {
        if report.error.is_some() {
            failures += 1;
        }
        if cli.json {
            println!(
                "{}",
                serde_json::to_string(report).context("Failed to serialise report")?
            );
        } else {
            print_report(report, cli.quiet);
        }
    }
    Ok(failures)
}

async fn bundle_one(
    bundler: &Bundler,
    input: PathBuf,
    output: PathBuf,
    content_type: Option<String>,
) -> Report {
    let upload = match read_upload(&input, content_type).await {
        Ok(upload) => upload,
        Err(e) => {
            return Report {
                input,
                output: None,
                stats: None,
                error: Some(ErrorResponse {
                    status: 400,
                    detail: format!("{e:#}"),
                }),
            }
        }
    };

    match bundler.bundle_to_file(upload, &output).await {
        Ok(stats) => Report {
            input,
            output: Some(output),
            stats: Some(stats),
            error: None,
        },
        Err(e) => Report {
            input,
            output: None,
            stats: None,
            error: Some(e.to_response()),
        },
    }
}

fn print_report(report: &Report, quiet: bool) {
    match (&report.stats, &report.error) {
        (Some(stats), _) if !quiet => {
            let output = report
                .output
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            eprintln!(
                "{}  {}  →  {}  {}",
                green("✔"),
                report.input.display(),
                bold(&output),
                dim(&format!(
                    "{} bytes, {}ms ({}ms segmentation)",
                    stats.archive_bytes, stats.total_ms, stats.segment_ms
                )),
            );
        }
        (_, Some(err)) => {
            eprintln!(
                "{}  {}  {}",
                red("✘"),
                report.input.display(),
                red(&format!("{} {}", err.status, err.detail)),
            );
        }
        _ => {}
    }
}

/// Read a photo and attach its declared content type.
async fn read_upload(path: &Path, content_type: Option<String>) -> Result<Upload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let content_type = content_type.or_else(|| {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(MimeType::from_extension)
            .map(|m| m.as_str().to_string())
    });
    Ok(Upload {
        bytes,
        content_type,
    })
}

fn output_path(cli: &Cli, input: &Path) -> PathBuf {
    if let Some(ref out) = cli.output {
        return out.clone();
    }
    let stem = input
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "profile".into());
    let mut name = PathBuf::from(stem);
    name.set_extension("zip");
    match cli.out_dir {
        Some(ref dir) => dir.join(name),
        None => input.with_file_name(name),
    }
}

/// Refuse to run when two inputs would write the same archive.
fn check_distinct_outputs(cli: &Cli) -> Result<()> {
    let mut seen: HashMap<PathBuf, &Path> = HashMap::new();
    for input in &cli.inputs {
        let output = output_path(cli, input);
        if let Some(first) = seen.insert(output.clone(), input) {
            anyhow::bail!(
                "{} and {} would both write {}",
                first.display(),
                input.display(),
                output.display()
            );
        }
    }
    Ok(())
}

/// Map CLI args to `BundleConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<BundleConfig> {
    let seconds = |s: u64| (s > 0).then(|| Duration::from_secs(s));

    let mut builder = BundleConfig::from_profile(cli.profile.into())
        .admission_timeout(seconds(cli.admission_timeout))
        .segmentation_timeout(seconds(cli.segmentation_timeout))
        .segmentation(SegmentationParams {
            alpha_matting: cli.alpha_matting,
            foreground_threshold: cli.foreground_threshold,
            background_threshold: cli.background_threshold,
            erode_size: cli.erode_size,
        });

    if let Some(v) = cli.max_upload_bytes {
        builder = builder.max_upload_bytes(v);
    }
    if let Some(v) = cli.max_side {
        builder = builder.max_side(v);
    }
    if let Some(v) = cli.max_pixels {
        builder = builder.max_pixels(v);
    }
    if let Some(v) = cli.jpeg_quality {
        builder = builder.jpeg_quality(v);
    }
    if cli.precrop_bias.is_some() {
        builder = builder.precrop_bias(cli.precrop_bias);
    }
    if let Some(v) = cli.admission_limit {
        builder = builder.admission_limit(v);
    }
    if let Some(v) = cli.min_segmentation_bytes {
        builder = builder.min_segmentation_bytes(v);
    }
    if let Some(v) = cli.alpha_cutoff {
        builder = builder.alpha_cutoff(v);
    }
    if let Some(v) = cli.crop_padding {
        builder = builder.crop_padding_ratio(v);
    }
    if let Some(v) = cli.crop_alpha_threshold {
        builder = builder.crop_alpha_threshold(v);
    }
    if !cli.variants.is_empty() {
        builder = builder.variants(cli.variants.clone());
    }
    if let Some(segmenter) = explicit_segmenter(cli)? {
        builder = builder.segmenter(segmenter);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Backend chosen on the command line, if any. Otherwise the library
/// resolves one from the environment.
fn explicit_segmenter(cli: &Cli) -> Result<Option<Arc<dyn Segmenter>>> {
    let timeout = (cli.segmentation_timeout > 0)
        .then(|| Duration::from_secs(cli.segmentation_timeout));

    if let Some(ref url) = cli.segmenter_url {
        let mut seg = HttpSegmenter::new(url.as_str(), timeout);
        if let Some(ref model) = cli.model {
            seg = seg.with_model(model.as_str());
        }
        return Ok(Some(Arc::new(seg)));
    }
    if let Some(ref line) = cli.segmenter_cmd {
        let seg = CommandSegmenter::from_command_line(line)
            .with_context(|| format!("Invalid --segmenter-cmd '{line}'"))?;
        return Ok(Some(Arc::new(seg)));
    }
    if let Some(ref model) = cli.model {
        return Ok(Some(Arc::new(CommandSegmenter::rembg(model))));
    }
    Ok(None)
}

/// Parse `--variant SIZE:BIAS` (bias defaults to 0.10).
fn parse_variant(s: &str) -> Result<OutputVariant, String> {
    let (size, bias) = match s.split_once(':') {
        Some((size, bias)) => (size, Some(bias)),
        None => (s, None),
    };
    let size: u32 = size
        .trim()
        .parse()
        .map_err(|_| format!("invalid variant size '{}'", size.trim()))?;
    let bias: f32 = match bias {
        Some(b) => b
            .trim()
            .parse()
            .map_err(|_| format!("invalid variant bias '{}'", b.trim()))?,
        None => 0.10,
    };
    if size == 0 {
        return Err("variant size must be at least 1".to_string());
    }
    Ok(OutputVariant::new(size, bias))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_with_bias() {
        let v = parse_variant("512:0.08").unwrap();
        assert_eq!(v.size, 512);
        assert!((v.vertical_bias - 0.08).abs() < 1e-6);
    }

    #[test]
    fn variant_default_bias() {
        assert_eq!(parse_variant("92").unwrap(), OutputVariant::new(92, 0.10));
    }

    #[test]
    fn variant_rejects_garbage() {
        assert!(parse_variant("big:0.1").is_err());
        assert!(parse_variant("0:0.1").is_err());
        assert!(parse_variant("64:x").is_err());
    }

    #[test]
    fn output_next_to_input() {
        let cli = Cli::parse_from(["profile-bundle", "photos/me.jpg"]);
        assert_eq!(
            output_path(&cli, Path::new("photos/me.jpg")),
            PathBuf::from("photos/me.zip")
        );
    }

    #[test]
    fn same_stem_in_out_dir_is_rejected() {
        let cli = Cli::parse_from(["profile-bundle", "--out-dir", "out", "a/me.jpg", "b/me.png"]);
        let err = check_distinct_outputs(&cli).unwrap_err();
        assert!(err.to_string().contains("out/me.zip"), "{err}");
    }

    #[test]
    fn same_stem_next_to_inputs_is_fine() {
        let cli = Cli::parse_from(["profile-bundle", "a/me.jpg", "b/me.jpg"]);
        assert!(check_distinct_outputs(&cli).is_ok());
    }

    #[test]
    fn output_in_out_dir() {
        let cli = Cli::parse_from(["profile-bundle", "--out-dir", "out", "a.png", "b.png"]);
        assert_eq!(
            output_path(&cli, Path::new("a.png")),
            PathBuf::from("out/a.zip")
        );
    }
}
