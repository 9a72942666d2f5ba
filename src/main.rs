use clap::Parser;
use culdesac::program::Program;
use culdesac::report::write_ffx;
use culdesac::smt::Z3Factory;
use culdesac::{AnalysisConfig, CuldesacError, analyze};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Infeasible-path analysis over a serialized program.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Program description (JSON): CFGs, loop labels, platform context.
    program: PathBuf,

    /// Write the result as an FFX document to this file.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Analysis configuration (JSON); flags below override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip SMT calls entirely.
    #[arg(long)]
    dry_run: bool,

    /// Cap per-edge state counts at the given threshold.
    #[arg(long, value_name = "N")]
    merge: Option<usize>,

    /// Fall back to unminimized paths when minimization fails validation.
    #[arg(long)]
    unminimized: bool,

    /// Disable dominance pruning and duplicate removal on the results.
    #[arg(long)]
    no_post_processing: bool,

    /// Run independent solver calls on this many cores.
    #[arg(long, value_name = "N")]
    cores: Option<usize>,

    /// Per-solver-call timeout in milliseconds.
    #[arg(long, value_name = "MS")]
    timeout: Option<u32>,

    /// Log per-block progress.
    #[arg(long)]
    progress: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), CuldesacError> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)
            .map_err(|e| CuldesacError::MalformedInput(e.to_string()))?,
        None => AnalysisConfig::default(),
    };
    config.dry_run |= args.dry_run;
    config.unminimized_paths |= args.unminimized;
    config.show_progress |= args.progress;
    if let Some(threshold) = args.merge {
        config.merge = true;
        config.merge_threshold = threshold;
    }
    if let Some(cores) = args.cores {
        config.nb_cores = cores;
    }
    if args.no_post_processing {
        config.post_processing = false;
    }

    let program = Program::from_json(&fs::read_to_string(&args.program)?)?;
    let factory = match args.timeout {
        Some(ms) => Z3Factory::with_timeout(ms),
        None => Z3Factory::new(),
    };

    let start = std::time::Instant::now();
    let result = analyze(&program, &config, &factory)?;
    let elapsed = start.elapsed();

    for path in &result.infeasible_paths {
        let function = path
            .function()
            .map(|f| program.cfg(f).name.as_str())
            .unwrap_or("?");
        println!("    * {function}:[{}]", path.to_text(&program));
    }
    let n = result.infeasible_paths.len();
    println!(
        "{n} infeasible path{} ({} min + {} unmin, implicitly {}). ({:.3}s)",
        if n == 1 { "" } else { "s" },
        result.stats.minimized_count(),
        result.stats.unminimized_count,
        result.stats.ip_count,
        elapsed.as_secs_f32()
    );

    if let Some(output) = &args.output {
        let mut file = fs::File::create(output)?;
        write_ffx(&mut file, &program, &result.infeasible_paths)?;
        println!("output to {}", output.display());
    }
    Ok(())
}
