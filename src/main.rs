//! surveyor CLI - Resumable LLM annotation of survey questionnaires.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use surveyor::client::HealthStatus;
use surveyor::{
    AnnotationPipeline, Config, NetworkBuilder, OllamaClient, PromptTemplates, RunOutcome,
};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG: &str = "surveyor.toml";

#[derive(Parser)]
#[command(name = "surveyor")]
#[command(version)]
#[command(about = "Resumable LLM annotation of survey questionnaires")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file (defaults to ./surveyor.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fill in answers for every prompt in a source table
    Annotate {
        /// Source table (CSV or JSONL)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Snapshot file used to resume interrupted runs
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Write the full source table with answers filled in
        #[arg(long)]
        merged_output: Option<PathBuf>,

        /// Model identifier on the inference server
        #[arg(short, long)]
        model: Option<String>,

        /// Base URL of the inference server
        #[arg(long)]
        base_url: Option<String>,
    },

    /// Build adjacency matrices from a long-format ratings table
    Network {
        /// Ratings table (CSV or JSONL)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Directory receiving the matrix CSVs
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Validate configuration and check the inference endpoint
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = Config::load(path, Path::new(DEFAULT_CONFIG)).with_context(|| {
        format!(
            "Failed to load config from {:?}",
            path.unwrap_or(Path::new(DEFAULT_CONFIG))
        )
    })?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn print_example_config() {
    let example = r#"# surveyor configuration file
# Every key is optional; the values below are the defaults.

[endpoint]
base_url = "http://localhost:11434"
model = "llama3.1:latest"
# timeout_secs = 120

[annotation]
input = "questionnaires.csv"
snapshot = "questionnaires_with_answers.csv"
# merged_output = "questionnaires_completed.csv"
autosave_interval = 10      # save after rows 10, 20, 30, ...
rationale_interval = 5      # ask for a rationale on rows 0, 5, 10, ...
pacing_delay_ms = 1000
retry_empty_answers = false # re-send rows whose checkpointed answer is empty
show_progress = true

[columns]
prompt = "Prompt"
answer = "Risposta numerica"
rationale = "Motivazione"

[extraction]
answer_labels = ["answer:"]
reasoning_labels = ["reasoning:"]

[templates]
answer_only = """{prompt}

Respond with a single integer only. Do not add any other text."""
with_reasoning = """{prompt}

Respond using exactly this format:
Answer: <a single integer>
Reasoning: <a short explanation of the answer>"""

[network]
input = "ratings.csv"
output_dir = "matrices"
threshold = 2.5
binary_networks = ["FR"]

[network.networks]
CC = ["CC_01", "CC_02", "CC_03", "CC_04"]
EC = ["EC_01", "EC_02", "EC_03", "EC_04", "EC_05"]
CM = ["CM_01", "CM_02"]
FR = ["FR_01"]
"#;
    println!("{example}");
}

/// Cancel `token` on Ctrl-C; the run stops at the next row boundary.
///
/// A second Ctrl-C exits immediately, skipping the final flush; the last
/// autosave is what remains on disk.
fn spawn_interrupt_listener(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!(
            "Interrupt received, stopping after the current row \
             (press Ctrl-C again to exit now; set endpoint.timeout_secs to bound slow requests)"
        );
        token.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            error!("Second interrupt, exiting without the final snapshot save");
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;

            info!("Configuration is valid");
            info!("  Input:      {:?}", config.annotation.input);
            info!("  Snapshot:   {:?}", config.annotation.snapshot);
            info!(
                "  Autosave every {} rows, rationale every {} rows",
                config.annotation.autosave_interval, config.annotation.rationale_interval
            );
            info!("  Networks:   {}", config.network.networks.len());

            let client = OllamaClient::new(
                &config.endpoint,
                PromptTemplates::new(&config.templates),
            )?;
            let health = client.health_check().await;
            match health.status {
                HealthStatus::Healthy => info!(
                    endpoint = %health.endpoint,
                    latency_ms = health.latency_ms.unwrap_or_default(),
                    model = %client.model(),
                    "Endpoint is healthy"
                ),
                status => warn!(
                    endpoint = %health.endpoint,
                    %status,
                    error = health.error.as_deref().unwrap_or(""),
                    "Endpoint check failed"
                ),
            }
            return Ok(());
        }

        Commands::Annotate {
            input,
            snapshot,
            merged_output,
            model,
            base_url,
        } => {
            let mut config = load_config(cli.config.as_deref())?;

            // Override config from CLI
            if let Some(input) = input {
                config.annotation.input = input;
            }
            if let Some(snapshot) = snapshot {
                config.annotation.snapshot = snapshot;
            }
            if merged_output.is_some() {
                config.annotation.merged_output = merged_output;
            }
            if let Some(model) = model {
                config.endpoint.model = model;
            }
            if let Some(base_url) = base_url {
                config.endpoint.base_url = base_url;
            }

            let snapshot_path = config.annotation.snapshot.clone();
            let pipeline = AnnotationPipeline::new(config)?;

            let cancel = CancellationToken::new();
            spawn_interrupt_listener(cancel.clone());

            let report = match pipeline.run(cancel).await {
                Ok(report) => report,
                Err(e) => {
                    println!("\n=== Annotation Failed ===");
                    println!("Error:       {e}");
                    println!("Snapshot:    {snapshot_path:?} (last successful save)");
                    return Err(e).context("Annotation run failed");
                }
            };
            let stats = &report.stats;

            match report.outcome {
                RunOutcome::Completed => println!("\n=== Annotation Complete ==="),
                RunOutcome::Interrupted => println!("\n=== Annotation Interrupted ==="),
            }
            println!("Rows:        {}", stats.total_rows);
            println!("Resumed:     {}", stats.resumed);
            println!("Skipped:     {} answered, {} blank", stats.skipped_answered, stats.skipped_blank);
            println!("Sent:        {}", stats.processed);
            println!("Failed:      {}", stats.failed_calls);
            println!("No answer:   {}", stats.empty_answers);
            println!("Rationales:  {}", stats.rationales_requested);
            println!("Autosaves:   {}", stats.autosaves);
            println!("Throughput:  {:.0}/hr", report.throughput_per_hour());
            println!("Started:     {}", report.started_at.format("%Y-%m-%d %H:%M:%S"));
            println!("Runtime:     {:.1}s", report.runtime_secs());
            println!("Snapshot:    {snapshot_path:?} ({} rows)", report.snapshot_rows);
        }

        Commands::Network { input, output_dir } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(input) = input {
                config.network.input = input;
            }
            if let Some(output_dir) = output_dir {
                config.network.output_dir = output_dir;
            }

            let output_dir = config.network.output_dir.clone();
            let outputs = NetworkBuilder::new(config.network)
                .run()
                .context("Failed to build network matrices")?;

            println!("\n=== Network Matrices Written ===");
            for output in &outputs {
                println!("{:<6} {} edges", output.name, output.edges);
            }
            println!("Output:      {output_dir:?}");
        }
    }

    Ok(())
}
