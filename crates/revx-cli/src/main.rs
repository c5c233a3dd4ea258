use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use revx_core::{EnrichedReview, ReviewRecord};
use revx_engine::{Aggregator, EngineConfig, GatewayFeedSource, ProgressFn};
use revx_gateway::{ContentGateway, GatewayConfig};
use revx_upstream::{ReviewQuery, UpstreamClient, UpstreamConfig};

#[derive(Debug, Parser)]
#[command(name = "revx")]
#[command(about = "Storefront review explorer and cross-referencer")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch one enriched review page for a title
    Reviews {
        #[arg(long)]
        app_id: String,
        #[arg(long)]
        filter: Option<String>,
        #[arg(long)]
        language: Option<String>,
        #[arg(long)]
        day_range: Option<u32>,
        #[arg(long)]
        review_type: Option<String>,
        #[arg(long)]
        purchase_type: Option<String>,
        #[arg(long)]
        page_size: Option<u32>,
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Cross-reference the reviewers behind a title's latest review page
    Crossref {
        #[arg(long)]
        app_id: String,
        /// Feed pages fetched per reviewer
        #[arg(long, default_value_t = 3)]
        max_pages: u32,
        /// Reviewer tasks run concurrently
        #[arg(long, default_value_t = 5)]
        concurrency: usize,
        /// Skip the analyzed title in each reviewer's own history
        #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
        exclude_self: bool,
    },
}

fn build_query(
    filter: Option<String>,
    language: Option<String>,
    day_range: Option<u32>,
    review_type: Option<String>,
    purchase_type: Option<String>,
    page_size: Option<u32>,
    cursor: Option<String>,
) -> ReviewQuery {
    let defaults = ReviewQuery::default();
    ReviewQuery {
        filter: filter.unwrap_or(defaults.filter),
        language: language.unwrap_or(defaults.language),
        day_range: day_range.unwrap_or(defaults.day_range),
        review_type: review_type.unwrap_or(defaults.review_type),
        purchase_type: purchase_type.unwrap_or(defaults.purchase_type),
        num_per_page: page_size.unwrap_or(defaults.num_per_page),
        cursor,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Reviews {
            app_id,
            filter,
            language,
            day_range,
            review_type,
            purchase_type,
            page_size,
            cursor,
        } => {
            let query = build_query(
                filter,
                language,
                day_range,
                review_type,
                purchase_type,
                page_size,
                cursor,
            );
            let client = UpstreamClient::new(UpstreamConfig::from_env())?;
            let page = client.get_enriched_review_page(&app_id, &query).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Commands::Crossref {
            app_id,
            max_pages,
            concurrency,
            exclude_self,
        } => {
            let client = UpstreamClient::new(UpstreamConfig::from_env())?;
            let page = client
                .get_enriched_review_page(&app_id, &ReviewQuery::default())
                .await?;
            let seeds: Vec<ReviewRecord> = page
                .reviews
                .iter()
                .map(EnrichedReview::as_seed_record)
                .collect();

            let gateway = Arc::new(ContentGateway::new(GatewayConfig::from_env())?);
            let aggregator = Aggregator::new(
                Arc::new(GatewayFeedSource::new(gateway)),
                EngineConfig {
                    max_pages_per_reviewer: max_pages,
                    exclude_app_id: exclude_self.then(|| app_id.clone()),
                    max_concurrent_reviewers: concurrency,
                },
            );

            let progress: ProgressFn = Arc::new(|done, total| {
                eprintln!("processed {done}/{total} reviewers");
            });
            let result = aggregator.aggregate(&seeds, Some(progress)).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}
