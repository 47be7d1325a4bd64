//! citytab pipeline: listing → links → enrichment → reconciliation → descriptions →
//! normalization → CSV.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use citytab_core::{Table, Value};
use citytab_extract::{parse_listing, resolve_links};
use citytab_fetch::{Fetcher, FixtureFetcher, HttpClientConfig, HttpFetcher};
use serde::Serialize;
use tracing::{info, info_span, Instrument};
use url::Url;
use uuid::Uuid;

pub mod enrich;
pub mod export;
pub mod normalize;
pub mod reconcile;
pub mod rules;

pub use enrich::{describe, enrich, EnrichStats};
pub use export::{export_csv_bytes, profile_table, render_profile_markdown, ColumnProfile};
pub use normalize::normalize;
pub use reconcile::{reconcile, ReconcileError, ReconcileReport};
pub use rules::{NormalizeRule, ReconcileRules};

pub const CRATE_NAME: &str = "citytab-pipeline";

pub const DEFAULT_LISTING_URL: &str =
    "https://en.wikipedia.org/wiki/List_of_United_States_cities_by_population";
pub const DEFAULT_BASE_URL: &str = "https://en.wikipedia.org";
pub const DEFAULT_OUTPUT: &str = "./TopUSCities.csv";
pub const DEFAULT_USER_AGENT: &str = "citytab/0.1";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub listing_url: String,
    pub base_url: String,
    pub output_path: PathBuf,
    pub report_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: Option<u64>,
    pub rules_path: Option<PathBuf>,
    pub fixtures_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            listing_url: lookup("CITYTAB_LISTING_URL")
                .unwrap_or_else(|| DEFAULT_LISTING_URL.to_string()),
            base_url: lookup("CITYTAB_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            output_path: lookup("CITYTAB_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)),
            report_path: lookup("CITYTAB_REPORT").map(PathBuf::from),
            user_agent: lookup("CITYTAB_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: lookup("CITYTAB_HTTP_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            rules_path: lookup("CITYTAB_RULES").map(PathBuf::from),
            fixtures_dir: lookup("CITYTAB_FIXTURES_DIR").map(PathBuf::from),
        }
    }

    pub fn load_rules(&self) -> Result<ReconcileRules> {
        match &self.rules_path {
            Some(path) => ReconcileRules::from_path(path),
            None => ReconcileRules::builtin(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: usize,
    pub columns: usize,
    pub enriched: usize,
    pub skipped_details: usize,
    pub descriptions: usize,
    pub pruned_columns: Vec<String>,
    pub output_path: String,
    pub report_path: Option<String>,
}

/// The built table plus the counters the run summary reports.
#[derive(Debug, Clone)]
pub struct BuiltTable {
    pub table: Table<Value>,
    pub enrich: EnrichStats,
    pub reconcile: ReconcileReport,
    pub descriptions: usize,
}

pub struct Pipeline {
    config: PipelineConfig,
    rules: ReconcileRules,
    fetcher: Box<dyn Fetcher>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let fetcher: Box<dyn Fetcher> = match &config.fixtures_dir {
            Some(dir) => Box::new(FixtureFetcher::new(dir.clone())),
            None => Box::new(HttpFetcher::new(HttpClientConfig {
                timeout: config.http_timeout_secs.map(Duration::from_secs),
                user_agent: Some(config.user_agent.clone()),
            })?),
        };
        Self::with_fetcher(config, fetcher)
    }

    pub fn with_fetcher(config: PipelineConfig, fetcher: Box<dyn Fetcher>) -> Result<Self> {
        let rules = config.load_rules()?;
        Ok(Self {
            config,
            rules,
            fetcher,
        })
    }

    pub fn with_rules(mut self, rules: ReconcileRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn rules(&self) -> &ReconcileRules {
        &self.rules
    }

    /// Run every stage in order and return the normalized table.
    pub async fn build_table(&self) -> Result<BuiltTable> {
        let listing_url = Url::parse(&self.config.listing_url)
            .with_context(|| format!("invalid listing url {}", self.config.listing_url))?;
        let base_url = Url::parse(&self.config.base_url)
            .with_context(|| format!("invalid base url {}", self.config.base_url))?;

        let html = self
            .fetcher
            .fetch(&listing_url)
            .await
            .with_context(|| format!("fetching listing page {listing_url}"))?;
        let listing = parse_listing(&html).context("parsing listing table")?;
        info!(records = listing.table.len(), "listing parsed");

        let links = resolve_links(&listing.anchors, &listing.table, &base_url);
        info!(
            linked = links.by_city.len(),
            unresolved = links.unresolved.len(),
            "detail links resolved"
        );

        let mut table = listing.table;
        let enrich_stats = enrich(&mut table, &links, self.fetcher.as_ref())
            .await
            .context("merging detail attributes")?;

        let (mut table, reconcile_report) =
            reconcile(table, &self.rules).context("reconciling columns")?;

        let descriptions = describe(&mut table, &links, self.fetcher.as_ref())
            .await
            .context("extracting descriptions")?;

        let table = normalize(table, &self.rules.normalize);
        Ok(BuiltTable {
            table,
            enrich: enrich_stats,
            reconcile: reconcile_report,
            descriptions,
        })
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id);

        async move {
            let built = self.build_table().await?;

            let bytes = export_csv_bytes(&built.table)?;
            export::write_output(&self.config.output_path, &bytes).await?;
            info!(
                path = %self.config.output_path.display(),
                records = built.table.len(),
                columns = built.table.columns().len(),
                "csv written"
            );

            if let Some(report_path) = &self.config.report_path {
                let profiles = profile_table(&built.table);
                let report =
                    render_profile_markdown(&run_id.to_string(), built.table.len(), &profiles);
                export::write_output(report_path, report.as_bytes()).await?;
            }

            Ok(RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                records: built.table.len(),
                columns: built.table.columns().len(),
                enriched: built.enrich.enriched,
                skipped_details: built.enrich.skipped,
                descriptions: built.descriptions,
                pruned_columns: built.reconcile.pruned,
                output_path: self.config.output_path.display().to_string(),
                report_path: self
                    .config
                    .report_path
                    .as_ref()
                    .map(|p| p.display().to_string()),
            })
        }
        .instrument(span)
        .await
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let pipeline = Pipeline::new(PipelineConfig::from_env())?;
    pipeline.run_once().await
}
