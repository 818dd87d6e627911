//! The `splatmesh` command line: argument surface, response files, progress
//! UI and statistics output around the reconstruction pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use splatmesh_core::Registry;
use splatmesh_pipeline::{
    NoProgress, ProgressSink, ReconstructParams,
    config::{AdvancedConfig, FitConfig},
};
use tracing::warn;

#[derive(Parser, Debug)]
#[command(
    name = "splatmesh",
    version,
    about = "Surface reconstruction from oriented splat point clouds"
)]
pub struct Cli {
    /// Input files
    #[arg(value_name = "INPUT", required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output file
    #[arg(short = 'o', long = "output-file", value_name = "PATH")]
    pub output: PathBuf,

    /// Do not show informational messages
    #[arg(short, long)]
    pub quiet: bool,

    /// Show debug messages
    #[arg(long)]
    pub debug: bool,

    /// Read options from file
    #[arg(long = "response-file", value_name = "PATH")]
    pub response_file: Option<PathBuf>,

    /// Print information about internal statistics
    #[arg(long, help_heading = "Statistics options")]
    pub statistics: bool,

    /// Direct statistics to file instead of stdout (implies --statistics)
    #[arg(
        long = "statistics-file",
        value_name = "PATH",
        help_heading = "Statistics options"
    )]
    pub statistics_file: Option<PathBuf>,

    #[clap(flatten)]
    pub fit: FitConfig,

    #[clap(flatten)]
    pub advanced: AdvancedConfig,
}

impl Cli {
    /// The canonical option string stamped into output headers: every
    /// option in name order with its effective value, excluding the input
    /// files and the response file.
    pub fn canonical_options(&self) -> String {
        use std::fmt::Write;
        let mut s = String::new();
        let advanced = &self.advanced;
        let fit = &self.fit;
        write!(s, " --bucket-threads={}", advanced.bucket_threads).unwrap();
        write!(s, " --chunk-cells={}", advanced.chunk_cells).unwrap();
        if self.debug {
            s.push_str(" --debug");
        }
        write!(s, " --device-threads={}", advanced.device_threads).unwrap();
        write!(s, " --fit-boundary-limit={}", fit.boundary_limit).unwrap();
        write!(s, " --fit-grid={}", fit.spacing).unwrap();
        if fit.keep_boundary {
            s.push_str(" --fit-keep-boundary");
        }
        write!(s, " --fit-prune={}", fit.prune).unwrap();
        write!(s, " --fit-smooth={}", fit.smooth).unwrap();
        write!(s, " --levels={}", advanced.levels).unwrap();
        write!(s, " --max-device-splats={}", advanced.max_device_splats).unwrap();
        write!(s, " --max-host-splats={}", advanced.max_host_splats).unwrap();
        write!(s, " --max-split={}", advanced.max_split).unwrap();
        write!(s, " --mesher={}", advanced.mesher).unwrap();
        write!(s, " --mesher-buffer={}", advanced.mesher_buffer).unwrap();
        write!(s, " --mesher-queue={}", advanced.mesher_queue).unwrap();
        write!(s, " --output-file={}", self.output.display()).unwrap();
        if self.quiet {
            s.push_str(" --quiet");
        }
        if self.statistics {
            s.push_str(" --statistics");
        }
        if let Some(path) = &self.statistics_file {
            write!(s, " --statistics-file={}", path.display()).unwrap();
        }
        write!(s, " --subsampling={}", advanced.subsampling).unwrap();
        write!(s, " --writer={}", advanced.writer).unwrap();
        s
    }

    pub fn to_params(&self) -> ReconstructParams {
        let mut comments = vec![
            format!("splatmesh version: {}", env!("CARGO_PKG_VERSION")),
            "splatmesh variant: host".to_owned(),
            format!("splatmesh options:{}", self.canonical_options()),
        ];
        for input in &self.inputs {
            comments.push(format!("splatmesh input: {}", input.display()));
        }
        ReconstructParams {
            fit: self.fit.clone(),
            advanced: self.advanced.clone(),
            inputs: self.inputs.clone(),
            output: self.output.clone(),
            comments,
        }
    }
}

/// Splice response-file tokens into the argument list. A missing or
/// unreadable file is only a warning, reported once logging is up.
pub fn expand_response_file(args: Vec<String>) -> (Vec<String>, Option<String>) {
    let mut path: Option<String> = None;
    for (i, arg) in args.iter().enumerate() {
        if arg == "--response-file" {
            path = args.get(i + 1).cloned();
        } else if let Some(p) = arg.strip_prefix("--response-file=") {
            path = Some(p.to_owned());
        }
    }
    let Some(path) = path else {
        return (args, None);
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => {
            let mut args = args;
            args.extend(text.split_whitespace().map(String::from));
            (args, None)
        }
        Err(_) => (args, Some(format!("could not open `{path}', ignoring"))),
    }
}

fn progress_bar() -> (ProgressBar, Arc<dyn ProgressSink>) {
    let bar = ProgressBar::new(0).with_style(
        ProgressStyle::with_template(
            "[{elapsed}] {bar:40.cyan/blue} {percent:>3}% {msg} ({eta} remaining)",
        )
        .expect("invalid indicatif template"),
    );
    bar.set_message("reconstructing");

    struct BarSink(ProgressBar);
    impl ProgressSink for BarSink {
        fn start(&self, total_cells: u64) {
            self.0.set_length(total_cells);
        }
        fn add(&self, cells: u64) {
            self.0.inc(cells);
        }
    }
    (bar.clone(), Arc::new(BarSink(bar)))
}

/// Run one reconstruction for an already-parsed command line.
pub fn execute(cli: &Cli) -> anyhow::Result<()> {
    let params = cli.to_params();
    let registry = Arc::new(Registry::new());

    let (bar, progress) = if cli.quiet {
        (None, Arc::new(NoProgress) as Arc<dyn ProgressSink>)
    } else {
        let (bar, sink) = progress_bar();
        (Some(bar), sink)
    };

    let summary = splatmesh_pipeline::run(&params, Arc::clone(&registry), progress)?;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    if cli.statistics || cli.statistics_file.is_some() {
        match &cli.statistics_file {
            Some(path) => std::fs::write(path, registry.to_string())?,
            None => print!("{registry}"),
        }
    }

    if summary.files == 0 {
        warn!("every component was pruned; no output was written");
    }
    Ok(())
}

/// Full command-line entry: expand response files, parse, set up logging,
/// run. Exit-code mapping lives in the binary.
pub fn run_cli() -> anyhow::Result<()> {
    let (args, response_warning) = expand_response_file(std::env::args().collect());
    let cli = Cli::parse_from(&args);

    let default_filter = if cli.debug {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
    if let Some(warning) = response_warning {
        warn!("{warning}");
    }

    execute(&cli)
}
