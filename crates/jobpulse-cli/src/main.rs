use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use jobpulse_core::MappingRuleSet;
use jobpulse_ingest::{
    ApiRequest, ArtifactStore, BackoffPolicy, PagedApiClient, PageWindow, RawLoader,
    RuleSheetSource,
};
use jobpulse_pipeline::{
    calculate_creation_date, PipelineConfig, RuleSets, RunOutcome, Server, TransformPipeline,
};
use jobpulse_warehouse::PgWarehouse;

#[derive(Debug, Parser)]
#[command(name = "jobpulse")]
#[command(about = "Job postings ingestion and normalization pipeline")]
struct Cli {
    /// Target environment (dev or prod).
    #[arg(long, default_value = "dev")]
    server: Server,

    /// Execution timestamp (RFC 3339); defaults to now.
    #[arg(long)]
    execution_date: Option<DateTime<Utc>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create warehouse schemas and tables.
    Migrate,
    /// Fetch new postings, stage raw payloads and load the warehouse.
    Load,
    /// Normalize staged postings into the analytical tables.
    Transform,
    /// Load, then transform.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env(cli.server);
    let execution_date = cli.execution_date.unwrap_or_else(Utc::now);

    match cli.command {
        Commands::Migrate => {
            open_warehouse(&config).await?;
            println!("migrations applied for server={}", config.server.as_str());
        }
        Commands::Load => {
            let warehouse = open_warehouse(&config).await?;
            load(&config, &warehouse, execution_date).await?;
        }
        Commands::Transform => {
            let warehouse = open_warehouse(&config).await?;
            transform(&config, &warehouse).await?;
        }
        Commands::Run => {
            let warehouse = open_warehouse(&config).await?;
            load(&config, &warehouse, execution_date).await?;
            transform(&config, &warehouse).await?;
        }
    }

    Ok(())
}

async fn open_warehouse(config: &PipelineConfig) -> Result<PgWarehouse> {
    let warehouse = PgWarehouse::connect(
        &config.database_url,
        &config.dataset,
        &config.analytical_dataset,
    )
    .await?;
    warehouse.run_migrations().await?;
    Ok(warehouse)
}

fn api_request(config: &PipelineConfig, date_created: &str) -> ApiRequest {
    let mut headers = Vec::new();
    if let Some(api_key) = &config.api_key {
        headers.push(("x-rapidapi-key".to_string(), api_key.clone()));
        headers.push(("x-rapidapi-host".to_string(), config.api_host.clone()));
    }
    ApiRequest {
        url_template: config.api_url_template.clone(),
        queryparams: vec![
            ("dateCreated".to_string(), date_created.to_string()),
            ("countryCode".to_string(), config.country_code.clone()),
            ("title".to_string(), config.title_filter.clone()),
            ("language".to_string(), config.language.clone()),
            ("locale".to_string(), config.locale.clone()),
        ],
        headers,
    }
}

async fn load(
    config: &PipelineConfig,
    warehouse: &PgWarehouse,
    execution_date: DateTime<Utc>,
) -> Result<()> {
    let created = calculate_creation_date(execution_date, config.date_created_delta_days);
    let request = api_request(config, &created.date_created);
    let file_name = format!("rapidapi/{}/{}_page", created.month_folder, created.date_folder);

    let client = PagedApiClient::new(
        Duration::from_secs(config.http_timeout_secs),
        Duration::from_secs(config.request_delay_secs),
        BackoffPolicy::default(),
    )?;
    let end_page = client
        .resolve_end_page(&request, config.end_page, config.items_per_page)
        .await
        .context("resolving the page window")?;
    let window = PageWindow {
        start_page: config.start_page,
        end_page,
        allow_no_end_page: false,
    };

    let artifacts = ArtifactStore::new(&config.artifacts_dir);
    let loader = RawLoader::new(warehouse, &artifacts);
    let summary = loader
        .run(&client, &request, &window, &config.storage_path, &file_name)
        .await?;
    println!(
        "load complete: load_id={} pages={} rows={} skipped={}",
        summary.load_id, summary.pages, summary.rows, summary.skipped_rows
    );
    Ok(())
}

async fn transform(config: &PipelineConfig, warehouse: &PgWarehouse) -> Result<()> {
    let urls = config.rule_sheets.clone().context(
        "rule sheet urls are not configured; set JOBPULSE_RULES_POSITIONS_URL, \
         JOBPULSE_RULES_CITY_CLUSTERS_URL and JOBPULSE_RULES_SKILLS_URL",
    )?;
    let source = RuleSheetSource::new();
    let rules = RuleSets {
        positions: MappingRuleSet::from_rows("positions", &source.fetch(&urls.positions).await?)?,
        city_clusters: MappingRuleSet::from_rows(
            "city_clusters",
            &source.fetch(&urls.city_clusters).await?,
        )?,
        skills: MappingRuleSet::from_rows("skills", &source.fetch(&urls.skills).await?)?,
    };

    let pipeline = TransformPipeline::new(warehouse, &rules, &config.locale);
    match pipeline.run().await? {
        RunOutcome::NoNewData => println!("transform: no new data"),
        RunOutcome::Completed(summary) => println!(
            "transform complete: run_id={} loads={} rows={} canonical={} inserted={} updated={}",
            summary.run_id,
            summary.loads.len(),
            summary.fetched_rows,
            summary.canonical_rows,
            summary.merged_inserted,
            summary.merged_updated
        ),
    }
    Ok(())
}
