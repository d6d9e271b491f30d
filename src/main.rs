use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use landmark_worker::config::Config;
use landmark_worker::pose::{ModelLoader, Task};
use landmark_worker::protocol::{Framing, Response};
use landmark_worker::worker::{serve, Worker};

/// Landmark worker: reads frames on stdin, writes JSON results on stdout.
#[derive(Parser, Debug)]
#[command(version = env!("GIT_VERSION"), about)]
struct Args {
    /// Which landmark model to serve
    #[arg(long, value_enum)]
    task: Task,

    /// Request framing on stdin
    #[arg(long, value_enum, default_value_t = Framing::Binary)]
    framing: Framing,

    /// TOML config file (defaults are used when it does not exist)
    #[arg(long, default_value = "landmark_worker.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(default_filter: &str) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter));
    builder.target(env_logger::Target::Stderr);
    // Already initialized; nothing to do.
    let _ = builder.try_init();
}

#[cfg(feature = "onnx")]
fn model_loader(task: Task, config: &Config) -> Result<Box<dyn ModelLoader>> {
    Ok(Box::new(landmark_worker::pose::OnnxLoader {
        task,
        model: config.model.clone(),
    }))
}

#[cfg(not(feature = "onnx"))]
fn model_loader(task: Task, _config: &Config) -> Result<Box<dyn ModelLoader>> {
    anyhow::bail!(
        "no {:?} model backend: built without the `onnx` feature (rebuild with --features onnx)",
        task
    )
}

fn start(args: &Args) -> Result<(Config, Worker)> {
    let config = Config::load_or_default(&args.config)?;
    info!("Task: {:?}", args.task);
    info!("Framing: {:?}", args.framing);
    info!("Detector: {:?}", config.detector);

    let loader = model_loader(args.task, &config)?;
    let worker = Worker::new(loader, config.detector.clone())
        .with_context(|| format!("failed to start {:?} worker", args.task))?;
    info!("Model loaded");
    Ok((config, worker))
}

/// stdout に 1 行だけ致命的エラーを書く
fn report_fatal(e: &anyhow::Error) {
    error!("{:#}", e);
    if let Ok(line) = serde_json::to_string(&Response::fatal(e)) {
        println!("{}", line);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);
    info!("Landmark Worker ({})", env!("GIT_VERSION"));

    let (config, mut worker) = match start(&args) {
        Ok(started) => started,
        Err(e) => {
            report_fatal(&e);
            return ExitCode::FAILURE;
        }
    };

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    // serve が致命的エラー行を書き込み済み
    match serve(stdin, stdout, args.framing, config.protocol, &mut worker).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}
