use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Directory holding the shared arrays
    #[arg(long, global = true, env = "LINEAGE_SHM_DIR")]
    pub shm_dir: Option<PathBuf>,

    /// Cache directory for pretrained model weights
    #[arg(long, global = true, env = "LINEAGE_MODEL_CACHE")]
    pub cache_dir: Option<PathBuf>,

    /// How status messages are reported (json on stdout, text as a spinner on stderr, log only)
    #[arg(long, global = true, value_enum, default_value_t = StatusFormat::Json)]
    pub status_format: StatusFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusFormat {
    /// One JSON object per line, for a host process
    Json,
    /// Spinner and plain text, for interactive use
    Text,
    /// Log only, nothing on stdout
    Log,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Segment objects in one volume
    Detect(InvocationArgs),
    /// Measure labelled objects of a frame or a time series
    RegionProps(InvocationArgs),
    /// Link objects across timepoints and write the edge table
    PredictLinks(InvocationArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct InvocationArgs {
    /// Request document (JSON)
    #[arg(long)]
    pub request: PathBuf,

    /// Program serving the detection and tracking models
    #[arg(long, env = "LINEAGE_MODEL_RUNNER", default_value = "lineage-model-runner")]
    pub runner: PathBuf,

    /// Argument passed to the runner before the job file, may be repeated
    #[arg(long = "runner-arg", allow_hyphen_values = true)]
    pub runner_args: Vec<String>,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Command {
    pub fn invocation(&self) -> &InvocationArgs {
        match self {
            Command::Detect(args) | Command::RegionProps(args) | Command::PredictLinks(args) => args,
        }
    }
}
