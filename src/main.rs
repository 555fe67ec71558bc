use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use registry_geocoder::checkpoint::Checkpoint;
use registry_geocoder::{export, ingestion, GeocoderConfig, GeocoderEngine, RunSummary};

#[derive(Parser)]
#[command(version, about = "Batch geocoder for business-registry address records")]
struct Opts {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Geocode one or more CSV exports and write the enriched table
    Geocode {
        /// Input CSV files; several are concatenated
        #[arg(short, long, required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        /// Also write located rows as GeoJSON
        #[arg(long)]
        geojson: Option<PathBuf>,
        /// Where the latest checkpoint is saved when the run ends
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Continue from `--checkpoint` if it exists
        #[arg(long, requires = "checkpoint")]
        resume: bool,
        /// Directory for the cache file and event journal
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Write partial results out of a saved checkpoint
    Export {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        geojson: Option<PathBuf>,
    },
    /// Print the effective configuration and provider chain
    Health {
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    registry_geocoder::init_tracing();
    let opts = Opts::parse();
    if let Err(e) = run(opts).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(opts: Opts) -> anyhow::Result<()> {
    match opts.command {
        Command::Geocode {
            input,
            output,
            geojson,
            checkpoint,
            resume,
            data_dir,
        } => {
            geocode(
                &input,
                &output,
                geojson.as_deref(),
                checkpoint.as_deref(),
                resume,
                data_dir.as_deref(),
            )
            .await
        }
        Command::Export {
            checkpoint,
            output,
            geojson,
        } => {
            let saved = Checkpoint::read_json(&checkpoint)
                .with_context(|| format!("reading checkpoint {}", checkpoint.display()))?;
            write_outputs(&saved.dataset, &output, geojson.as_deref())?;
            println!(
                "Exported {}/{} processed records",
                saved.processed_count(),
                saved.total
            );
            Ok(())
        }
        Command::Health { data_dir } => {
            let engine = GeocoderEngine::initialize(GeocoderConfig::from_env(), data_dir.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&engine.health())?);
            Ok(())
        }
    }
}

async fn geocode(
    input: &[PathBuf],
    output: &Path,
    geojson: Option<&Path>,
    checkpoint_path: Option<&Path>,
    resume: bool,
    data_dir: Option<&Path>,
) -> anyhow::Result<()> {
    let engine = GeocoderEngine::initialize(GeocoderConfig::from_env(), data_dir)?;
    let mut dataset = ingestion::load_csv_paths(input).context("loading input files")?;
    let mut controller = engine.controller();

    let control = controller.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping after the current record");
            if let Err(err) = control.stop() {
                warn!(%err, "stop request ignored");
            }
        }
    });

    let saved = match checkpoint_path {
        Some(path) if resume && path.exists() => Some(
            Checkpoint::read_json(path)
                .with_context(|| format!("reading checkpoint {}", path.display()))?,
        ),
        _ => None,
    };
    let summary = match saved {
        Some(saved) => controller.resume_from(&mut dataset, &saved).await?,
        None => controller.run(&mut dataset).await?,
    };

    if let (Some(path), Some(latest)) = (checkpoint_path, controller.checkpoints().latest()) {
        latest
            .write_json(path)
            .with_context(|| format!("writing checkpoint {}", path.display()))?;
    }
    write_outputs(&dataset, output, geojson)?;
    engine.shutdown();
    print_summary(&summary);
    Ok(())
}

fn write_outputs(
    dataset: &registry_geocoder::Dataset,
    output: &Path,
    geojson: Option<&Path>,
) -> anyhow::Result<()> {
    export::write_csv_path(dataset, output)
        .with_context(|| format!("writing {}", output.display()))?;
    if let Some(path) = geojson {
        export::write_geojson_path(dataset, path)
            .with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let stats = &summary.stats;
    println!("Run {}: {}/{} records", summary.state, summary.cursor, summary.total);
    println!("  address:  {}", stats.success);
    println!("  postal:   {}", stats.postal_fallback);
    println!("  cache:    {}", stats.cache_hits);
    println!("  errors:   {}", stats.errors);
    println!("  success rate: {:.1}%", stats.success_rate());
}
