//! CLI binary for epub2md.
//!
//! A thin shim over the library crate that maps CLI flags and an optional
//! JSON config file to `ConversionConfig` and reports results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use epub2md::{
    convert_batch, convert_to_file, discover_sources, output_path_for, plan_batch, BatchReport,
    ConversionConfig, ConversionProgressCallback, ConversionResult, DocumentConverter,
    PandocConverter, ProgressCallback,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar for the whole batch, one log line per finished book. Books finish
/// out of order, so start times are keyed by input path.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<PathBuf, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} books  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed_secs(&self, input: &Path) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(input))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ConversionProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.reset_eta();
    }

    fn on_file_start(&self, input: &Path) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(input.to_path_buf(), Instant::now());
        }
        self.bar.set_message(display_name(input));
    }

    fn on_file_complete(&self, input: &Path, output: &Path, images_written: usize) {
        let secs = self.elapsed_secs(input);
        self.bar.println(format!(
            "  {} {}  →  {}  {}  {}",
            green("✓"),
            display_name(input),
            output.display(),
            dim(&format!("{images_written} images")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_file_error(&self, input: &Path, error: &str) {
        let secs = self.elapsed_secs(input);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let first_line = error.lines().next().unwrap_or(error);
        let msg = if first_line.chars().count() > 80 {
            format!("{}\u{2026}", first_line.chars().take(79).collect::<String>())
        } else {
            first_line.to_string()
        };

        self.bar.println(format!(
            "  {} {}  {}  {}",
            red("✗"),
            display_name(input),
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, _total_files: usize, _succeeded: usize) {
        self.bar.finish_and_clear();
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert one book next to the original: books/Dune/Dune.md + books/Dune/images/
  epub2md convert books/Dune.epub

  # Convert into a chosen output directory, or to an exact Markdown file
  epub2md convert books/Dune.epub out/
  epub2md convert books/Dune.epub notes/dune.md

  # Convert every EPUB in the current directory
  epub2md convert --all

  # Convert a whole library, keeping sub-directories, four books at a time
  epub2md batch ~/Books ~/Markdown --recursive --concurrency 4

  # Use a JSON config and shrink large images
  epub2md batch ~/Books ~/Markdown --config epub2md.json --optimize-images

  # Machine-readable results
  epub2md batch ~/Books ~/Markdown --json > report.json

CONFIG FILE (all keys optional):
  {
    "processing":  { "extract_images": true, "concurrency": 4, "fail_fast": false },
    "cleanup":     { "remove_div_blocks": true, "remove_spans": true,
                     "remove_duplicate_images": true, "fix_headers": true,
                     "fix_links": true, "normalize_whitespace": true },
    "frontmatter": { "add": true, "custom_fields": { "source": "epub" } },
    "images":      { "extract_path": "images", "optimize": false,
                     "max_width": 1200, "max_height": 1600 }
  }

REQUIREMENTS:
  pandoc must be installed (https://pandoc.org/installing.html).
  Use --pandoc or EPUB2MD_PANDOC to point at a specific binary.
"#;

/// Convert EPUB e-books to clean Markdown.
#[derive(Parser, Debug)]
#[command(
    name = "epub2md",
    version,
    about = "Convert EPUB e-books to clean Markdown with YAML front-matter",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "EPUB2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "EPUB2MD_QUIET")]
    quiet: bool,

    /// Path to the pandoc executable.
    #[arg(long, global = true, env = "EPUB2MD_PANDOC", default_value = "pandoc")]
    pandoc: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a single EPUB file, or every EPUB in the current directory.
    Convert {
        /// EPUB file to convert.
        #[arg(required_unless_present = "all")]
        input: Option<PathBuf>,

        /// Markdown file to write (`*.md`) or output directory
        /// (default: the input's directory).
        output: Option<PathBuf>,

        /// Convert every *.epub in the current directory, each to
        /// <stem>/<stem>.md.
        #[arg(short, long, conflicts_with_all = ["input", "output"])]
        all: bool,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Convert every EPUB in a directory.
    Batch {
        /// Directory to scan for *.epub files.
        input_dir: PathBuf,

        /// Directory to write converted books into.
        output_dir: PathBuf,

        /// Descend into sub-directories, mirroring them in the output.
        #[arg(short, long)]
        recursive: bool,

        /// Number of books converted at the same time.
        #[arg(short, long, env = "EPUB2MD_CONCURRENCY")]
        concurrency: Option<usize>,

        /// Stop starting new books after the first failure.
        #[arg(long)]
        fail_fast: bool,

        /// Disable the progress bar.
        #[arg(long, env = "EPUB2MD_NO_PROGRESS")]
        no_progress: bool,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// JSON configuration file.
    #[arg(long, env = "EPUB2MD_CONFIG")]
    config: Option<PathBuf>,

    /// Do not extract images.
    #[arg(long)]
    no_images: bool,

    /// Do not prepend YAML front-matter.
    #[arg(long)]
    no_frontmatter: bool,

    /// Resize images larger than the configured maximum.
    #[arg(long)]
    optimize_images: bool,

    /// Print results as JSON on stdout.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs while it is on screen.
    let show_progress = match &cli.command {
        Command::Batch {
            no_progress, common, ..
        } => !cli.quiet && !no_progress && !common.json,
        Command::Convert { all, common, .. } => *all && !cli.quiet && !common.json,
    };
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

    let all_ok = match &cli.command {
        Command::Convert {
            all: true, common, ..
        } => {
            let config = load_config(common, progress_callback(show_progress))?;
            let cwd = std::env::current_dir().context("Cannot read the current directory")?;
            run_batch(&cli, &cwd, &cwd, false, common, &config).await?
        }
        Command::Convert {
            input,
            output,
            common,
            ..
        } => {
            let input = input.as_deref().context("An input file or --all is required")?;
            run_convert(&cli, input, output.as_deref(), common).await?
        }
        Command::Batch {
            input_dir,
            output_dir,
            recursive,
            concurrency,
            fail_fast,
            common,
            ..
        } => {
            let mut builder = load_config(common, progress_callback(show_progress))?.into_builder();
            if let Some(n) = concurrency {
                builder = builder.concurrency(*n);
            }
            if *fail_fast {
                builder = builder.fail_fast(true);
            }
            let config = builder.build().context("Invalid configuration")?;
            run_batch(&cli, input_dir, output_dir, *recursive, common, &config).await?
        }
    };

    if !all_ok {
        std::process::exit(1);
    }
    Ok(())
}

fn progress_callback(show: bool) -> Option<ProgressCallback> {
    show.then(|| CliProgressCallback::new() as Arc<dyn ConversionProgressCallback>)
}

fn pandoc(cli: &Cli, config: &ConversionConfig) -> PandocConverter {
    PandocConverter::new()
        .with_program(&cli.pandoc)
        .with_timeout_secs(config.converter_timeout_secs)
}

/// A `*.md` output is the Markdown file itself; anything else is a
/// directory that receives `<stem>/<stem>.md`.
fn single_output_path(input: &Path, output: Option<&Path>) -> PathBuf {
    match output {
        Some(file)
            if file
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("md")) =>
        {
            file.to_path_buf()
        }
        Some(dir) => output_path_for(input, dir),
        None => output_path_for(input, input.parent().unwrap_or(Path::new(""))),
    }
}

async fn run_convert(
    cli: &Cli,
    input: &Path,
    output: Option<&Path>,
    common: &CommonArgs,
) -> Result<bool> {
    let config = load_config(common, None)?;
    let converter = pandoc(cli, &config);
    converter
        .check_available()
        .await
        .context("Cannot start conversion")?;

    let output = single_output_path(input, output);

    let result = convert_to_file(&converter, input, &output, &config)
        .await
        .with_context(|| format!("Conversion of {} failed", input.display()))?;

    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).context("Failed to serialise result")?
        );
    } else if !cli.quiet {
        print_result(&result);
    }
    Ok(true)
}

async fn run_batch(
    cli: &Cli,
    input_dir: &Path,
    output_dir: &Path,
    recursive: bool,
    common: &CommonArgs,
    config: &ConversionConfig,
) -> Result<bool> {
    let inputs = discover_sources(input_dir, recursive)
        .with_context(|| format!("Cannot scan {}", input_dir.display()))?;
    if inputs.is_empty() {
        if !cli.quiet {
            eprintln!("No EPUB files found in {}", input_dir.display());
        }
        return Ok(true);
    }

    let jobs = plan_batch(&inputs, input_dir, output_dir);
    let converter: Arc<dyn DocumentConverter> = Arc::new(pandoc(cli, config));
    let report = convert_batch(converter, jobs, config)
        .await
        .context("Batch could not start")?;

    if common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !cli.quiet {
        print_report(&report);
    }
    Ok(report.all_succeeded())
}

/// Config file (if any) with CLI overrides applied.
fn load_config(common: &CommonArgs, progress: Option<ProgressCallback>) -> Result<ConversionConfig> {
    let base = match &common.config {
        Some(path) => ConversionConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ConversionConfig::default(),
    };

    let mut builder = base.into_builder();
    if common.no_images {
        builder = builder.extract_images(false);
    }
    if common.no_frontmatter {
        builder = builder.add_frontmatter(false);
    }
    if common.optimize_images {
        builder = builder.optimize_images(true);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }
    builder.build().context("Invalid configuration")
}

fn print_result(result: &ConversionResult) {
    let output = result
        .output
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    eprintln!(
        "{}  {}  →  {}  {}",
        green("✔"),
        result.title.as_deref().unwrap_or("(untitled)"),
        bold(&output),
        dim(&format!(
            "{} images, {}ms",
            result.images_written, result.duration_ms
        )),
    );
    let stats = &result.cleanup;
    eprintln!(
        "   {}",
        dim(&format!(
            "cleanup: {} divs, {} spans, {} repeated images removed; {} headings, {} links fixed",
            stats.divs_removed,
            stats.spans_removed,
            stats.duplicate_images_removed,
            stats.headers_fixed,
            stats.links_fixed
        )),
    );
    for w in &result.warnings {
        eprintln!("   {} {w}", yellow("!"));
    }
}

fn print_report(report: &BatchReport) {
    let mark = if report.all_succeeded() {
        green("✔")
    } else if report.succeeded == 0 {
        red("✘")
    } else {
        yellow("⚠")
    };
    eprintln!(
        "{} {}/{} books converted  ({} failed, {} skipped)  {}",
        mark,
        bold(&report.succeeded.to_string()),
        report.total(),
        report.failed,
        report.skipped,
        dim(&format!("{}ms", report.duration_ms)),
    );

    let warned: usize = report.results.iter().map(|r| r.warnings.len()).sum();
    if warned > 0 {
        eprintln!("   {} {warned} warnings (run with --json for details)", yellow("!"));
    }
    for failure in &report.failures {
        eprintln!("   {} {}: {}", red("✗"), failure.input.display(), failure.error);
    }
}
