mod cli;
mod error;
mod model_cache;
mod pipeline;
mod run_artifacts;
mod run_context;
mod shm;
mod status;

use anyhow::Result;
use cli::{Args, Command, StatusFormat};
use model_cache::{HttpFetcher, ModelCache};
use pipeline::orchestrator::{execute, InvocationRequest, RunnerBackend};
use run_context::load_request;
use shm::SharedArrayDir;
use status::{JsonLinesSink, LogSink, StatusSink, TextSink};
use tracing_subscriber::EnvFilter;

fn main() {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout carries the status channel
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse_args();
    if let Err(e) = run(args) {
        tracing::error!("Invocation failed: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let invocation = args.command.invocation();
    let request = match &args.command {
        Command::Detect(a) => InvocationRequest::Detect(load_request(&a.request)?),
        Command::RegionProps(a) => InvocationRequest::RegionProps(load_request(&a.request)?),
        Command::PredictLinks(a) => InvocationRequest::PredictLinks(load_request(&a.request)?),
    };

    let shm_root = args.shm_dir.unwrap_or_else(SharedArrayDir::default_root);
    let shm = SharedArrayDir::open(&shm_root)?;
    let cache_root = args.cache_dir.unwrap_or_else(ModelCache::default_root);
    let cache = ModelCache::new(&cache_root, Box::new(HttpFetcher));
    let backend = RunnerBackend::new(
        &invocation.runner,
        invocation.runner_args.clone(),
        &shm_root.join("jobs"),
    )?;
    tracing::info!(
        "Shared arrays in {:?}, model cache in {:?}",
        shm.root(),
        cache.root()
    );

    let sink: Box<dyn StatusSink> = match args.status_format {
        StatusFormat::Json => Box::new(JsonLinesSink),
        StatusFormat::Text => Box::new(TextSink::new()),
        StatusFormat::Log => Box::new(LogSink),
    };

    let result = execute(&request, &shm, &cache, &backend, sink.as_ref())?;
    tracing::info!(
        "Wrote {} output arrays for '{}'",
        result.outputs.len(),
        result.id
    );
    Ok(())
}
