use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use redub::pipeline::ObserverError;
use redub::workspace::SessionDir;
use redub::{
    AnalyzerChoice, Direction, DubOptions, Engine, Pipeline, PipelineStage, ProviderConfig,
    StageObserver,
};

#[derive(Parser)]
#[command(name = "redub", about = "Dub a short video between English and Russian")]
struct Cli {
    /// Video URL (YouTube, TikTok, Instagram, X, Vimeo).
    url: String,

    /// Where to write the dubbed video (default: <video id>_dubbed.mp4).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Translation direction: auto, en-ru or ru-en.
    #[arg(short, long, default_value = "auto")]
    direction: String,

    /// Dubbing engine.
    #[arg(long, default_value = "segmented")]
    engine: EngineArg,

    /// Timeline analyzer for the segmented engine.
    #[arg(long, default_value = "script")]
    analyzer: AnalyzerArg,

    /// Program run by the script analyzer.
    #[arg(long, default_value = "python3")]
    analyzer_program: String,

    /// Argument passed to the analyzer program before the audio path (repeatable).
    #[arg(long = "analyzer-arg")]
    analyzer_args: Vec<String>,

    /// Seconds before the script analyzer is killed.
    #[arg(long, default_value = "180")]
    analyzer_timeout: u64,

    /// Maximum simultaneous speech synthesis requests.
    #[arg(long, default_value = "4")]
    concurrency: usize,

    /// Strip music and noise before analysing the audio.
    #[arg(long)]
    isolate_voice: bool,

    /// Directory session folders are created in.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Keep intermediate files after the run.
    #[arg(long)]
    keep_work_dir: bool,

    /// Write the stage records as JSON to this file.
    #[arg(long)]
    stages_json: Option<PathBuf>,
}

#[derive(Clone, ValueEnum)]
enum EngineArg {
    Segmented,
    Provider,
}

#[derive(Clone, ValueEnum)]
enum AnalyzerArg {
    Script,
    Hume,
}

/// Shows the current stage on a spinner.
struct SpinnerObserver {
    pb: ProgressBar,
}

impl SpinnerObserver {
    fn new() -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        Self { pb }
    }
}

#[async_trait]
impl StageObserver for SpinnerObserver {
    async fn on_stage(&self, stage: &PipelineStage) -> Result<(), ObserverError> {
        let state = if stage.is_failed() {
            "failed"
        } else if stage.is_running() {
            "running"
        } else {
            "done"
        };
        self.pb.set_message(format!("{} ({state})", stage.name));
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("redub=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Session cleanup runs on drop, so exit only after `run` returns.
    let code = run(cli).await;
    std::process::exit(code);
}

async fn run(cli: Cli) -> i32 {
    let options = match build_options(&cli) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {e}");
            return 1;
        }
    };
    tracing::debug!(?options, "options resolved");

    let mut session = match SessionDir::create(&options.resolve_work_root()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: cannot create work directory: {e}");
            return 1;
        }
    };
    if cli.keep_work_dir {
        session.keep();
        eprintln!("Work directory: {}", session.path().display());
    }

    let pipeline = Pipeline::from_config(Arc::new(ProviderConfig::from_env()), options);
    let observer = SpinnerObserver::new();
    let result = pipeline.run(&cli.url, session.path(), Some(&observer)).await;

    match result {
        Ok(outcome) => {
            observer.pb.finish_and_clear();
            print_stages(&outcome.stages);
            write_stages_json(cli.stages_json.as_deref(), &outcome.stages);

            let output = cli.output.unwrap_or_else(|| {
                PathBuf::from(
                    outcome
                        .video_path
                        .file_name()
                        .unwrap_or_else(|| "dubbed.mp4".as_ref()),
                )
            });
            if let Err(e) = std::fs::copy(&outcome.video_path, &output) {
                eprintln!("Error writing to {}: {e}", output.display());
                return 1;
            }

            if let Some(t) = &outcome.translation {
                eprintln!(
                    "Dubbing complete: {} -> {}, {} characters",
                    t.source,
                    t.target,
                    t.text.chars().count()
                );
            }
            println!("{}", output.display());
            0
        }
        Err(failure) => {
            observer.pb.abandon();
            print_stages(&failure.stages);
            write_stages_json(cli.stages_json.as_deref(), &failure.stages);
            eprintln!("Error: {}", failure.error);
            if let Some(stage) = failure.failed_stage() {
                eprintln!("Failed stage: {stage}");
            }
            1
        }
    }
}

fn build_options(cli: &Cli) -> redub::Result<DubOptions> {
    let analyzer = match cli.analyzer {
        AnalyzerArg::Hume => AnalyzerChoice::Hume,
        AnalyzerArg::Script => {
            let args = if cli.analyzer_args.is_empty() {
                vec!["scripts/analyze_audio.py".to_string()]
            } else {
                cli.analyzer_args.clone()
            };
            AnalyzerChoice::Script {
                program: cli.analyzer_program.clone(),
                args,
                timeout: Duration::from_secs(cli.analyzer_timeout),
            }
        }
    };
    let engine = match cli.engine {
        EngineArg::Segmented => Engine::Segmented,
        EngineArg::Provider => Engine::Provider,
    };

    let mut options = DubOptions::new()
        .direction(Direction::parse(&cli.direction)?)
        .engine(engine)
        .analyzer(analyzer)
        .isolate_voice(cli.isolate_voice)
        .max_concurrency(cli.concurrency)?;
    if let Some(dir) = &cli.work_dir {
        options = options.work_root(dir.clone());
    }
    Ok(options)
}

fn print_stages(stages: &[PipelineStage]) {
    for stage in stages {
        let status = match (&stage.error, stage.elapsed()) {
            (Some(e), _) => format!("failed: {e}"),
            (None, Some(d)) => format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0),
            (None, None) => "running".to_string(),
        };
        eprintln!("  {:<14} {status}", stage.name.label());
    }
}

fn write_stages_json(path: Option<&Path>, stages: &[PipelineStage]) {
    let Some(path) = path else { return };
    let json = match serde_json::to_string_pretty(stages) {
        Ok(j) => j,
        Err(e) => {
            eprintln!("JSON error: {e}");
            return;
        }
    };
    if let Err(e) = std::fs::write(path, json) {
        eprintln!("Error writing to {}: {e}", path.display());
    }
}
