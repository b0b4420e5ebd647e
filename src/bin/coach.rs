#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use replay_coach::extract::Extraction;
use replay_coach::gateway::{ProviderGateway, TracingUsageSink, VideoReference};
use replay_coach::observer::parse_observer_response;
use replay_coach::pipeline::{CoachingPipeline, PipelineConfig};
use replay_coach::prefilter::prefilter;
use replay_coach::replay::{ReplayDataset, RoundRange};
use replay_coach::timeline::build_timeline;

#[derive(Parser)]
#[command(name = "coach", version, about = "Verified coaching tips from gameplay recordings")]
struct Cli {
    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ReplayArgs {
    /// Replay dataset JSON
    #[arg(long)]
    replay: PathBuf,
    /// First round visible in the video (overrides the dataset's range)
    #[arg(long, requires = "last_round")]
    first_round: Option<u32>,
    /// Last round visible in the video
    #[arg(long, requires = "first_round")]
    last_round: Option<u32>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full observer/validator pipeline (model calls)
    Analyze {
        #[command(flatten)]
        replay: ReplayArgs,
        /// Provider URI of the uploaded video
        #[arg(long)]
        video_uri: String,
        /// Provider identifier of the uploaded video
        #[arg(long)]
        video_id: String,
        #[arg(long)]
        out: PathBuf,
        /// Pipeline configuration JSON
        #[arg(long, env = "COACH_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Build observation windows only (no model calls)
    Timeline {
        #[command(flatten)]
        replay: ReplayArgs,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Apply the timeline filter to previously generated candidate tips
    Prefilter {
        #[command(flatten)]
        replay: ReplayArgs,
        /// Candidate tips JSON (`{"tips": [...]}` or a bare list)
        #[arg(long)]
        candidates: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Analyze {
            replay,
            video_uri,
            video_id,
            out,
            config,
        } => {
            let dataset = load_replay(&replay)?;
            let config = match config {
                Some(path) => PipelineConfig::from_json_file(&path)?,
                None => PipelineConfig::default(),
            }
            .with_env_overrides();
            let gateway = ProviderGateway::from_env(Arc::new(TracingUsageSink))?;
            let pipeline = CoachingPipeline::new(Arc::new(gateway), config)?;

            let result = pipeline
                .analyze(&dataset, &VideoReference::new(video_uri, video_id))
                .await;
            write_json(&out, &result)?;
            info!(
                path = %out.display(),
                tips = result.verified_tips.len(),
                completed = result.is_completed(),
                "result written"
            );
            if !result.is_completed() {
                return Err(format!("analysis failed: {:?}", result.status).into());
            }
        }
        Commands::Timeline { replay, out } => {
            let dataset = load_replay(&replay)?;
            let timeline = build_timeline(&dataset)?;
            match out {
                Some(path) => write_json(&path, &timeline)?,
                None => println!("{}", serde_json::to_string_pretty(&timeline)?),
            }
        }
        Commands::Prefilter {
            replay,
            candidates,
            out,
        } => {
            let dataset = load_replay(&replay)?;
            let timeline = build_timeline(&dataset)?;
            let raw = std::fs::read_to_string(&candidates)?;
            let tips = match parse_observer_response(&raw) {
                Extraction::Parsed((tips, _)) => tips,
                Extraction::Failed { reason } => {
                    return Err(format!("could not read candidates: {reason}").into())
                }
            };
            let outcome = prefilter(tips, &timeline);
            write_json(&out, &outcome)?;
            println!(
                "{} accepted, {} rejected",
                outcome.accepted.len(),
                outcome.rejected.len()
            );
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Read the dataset and apply the visible round range, CLI flags first.
fn load_replay(args: &ReplayArgs) -> Result<ReplayDataset, Box<dyn std::error::Error>> {
    let dataset: ReplayDataset = read_json(&args.replay)?;
    let dataset = match (args.first_round, args.last_round) {
        (Some(first), Some(last)) if first <= last => {
            dataset.restrict_to_rounds(RoundRange { first, last })
        }
        (Some(first), Some(last)) => {
            return Err(format!("--first-round {first} is after --last-round {last}").into())
        }
        _ => dataset.visible_portion(),
    };
    Ok(dataset)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), io::Error> {
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    std::fs::write(path, json)
}
