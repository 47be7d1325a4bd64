use std::path::PathBuf;

use anyhow::{Context, Result};
use citytab_pipeline::{Pipeline, PipelineConfig};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "citytab")]
#[command(about = "Build a clean table of the largest US cities from Wikipedia")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape, reconcile and normalize the city table, then write it as CSV.
    Run(RunArgs),
    /// Print the effective reconcile rules as YAML.
    Rules {
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[arg(long)]
    output: Option<PathBuf>,
    /// Also write a markdown column profile here.
    #[arg(long)]
    report: Option<PathBuf>,
    /// Serve pages from saved HTML files instead of the network.
    #[arg(long)]
    fixtures: Option<PathBuf>,
    #[arg(long)]
    rules: Option<PathBuf>,
    #[arg(long)]
    listing_url: Option<String>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(output) = &self.output {
            config.output_path = output.clone();
        }
        if let Some(report) = &self.report {
            config.report_path = Some(report.clone());
        }
        if let Some(fixtures) = &self.fixtures {
            config.fixtures_dir = Some(fixtures.clone());
        }
        if let Some(rules) = &self.rules {
            config.rules_path = Some(rules.clone());
        }
        if let Some(url) = &self.listing_url {
            config.listing_url = url.clone();
        }
        if let Some(secs) = self.timeout_secs {
            config.http_timeout_secs = Some(secs);
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("citytab=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let mut config = PipelineConfig::from_env();
            args.apply(&mut config);
            let summary = Pipeline::new(config)?.run_once().await?;
            if args.json {
                let json = serde_json::to_string_pretty(&summary).context("serializing run summary")?;
                println!("{json}");
            } else {
                println!(
                    "run complete: run_id={} records={} columns={} enriched={} skipped={} output={}",
                    summary.run_id,
                    summary.records,
                    summary.columns,
                    summary.enriched,
                    summary.skipped_details,
                    summary.output_path
                );
            }
        }
        Commands::Rules { rules } => {
            let mut config = PipelineConfig::from_env();
            if rules.is_some() {
                config.rules_path = rules;
            }
            print!("{}", config.load_rules()?.to_yaml()?);
        }
    }

    Ok(())
}
