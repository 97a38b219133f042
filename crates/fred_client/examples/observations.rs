//! Fetches several series concurrently under the shared rate limit and logs
//! every observations response through an event handler.
//!
//! Run with `FRED_API_KEY=... cargo run -p fred_client --example observations`.

use std::env;
use std::sync::Arc;

use fred_client::{ApiClient, ApiResponse, Event, FredConfig, params};
use futures::future::join_all;
use tracing::{error, info};

const SERIES: [&str; 5] = ["EFFR", "DFF", "GDP", "UNRATE", "CPIAUCSL"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let default_log_filter = "info,fred_client=debug,api_dispatch=info";
    let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter.to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let config = FredConfig {
        enable_events: true,
        ..FredConfig::from_env()?
    };
    let client = ApiClient::new(config)?;

    client.subscribe("observations", |event: Arc<Event<ApiResponse>>| async move {
        let body: serde_json::Value = event.payload().json()?;
        let count = body["count"].as_u64().unwrap_or(0);
        info!(url = %event.payload().url().path(), count, "Observations received.");
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
    })?;

    let observations = client.endpoint("series")?.child("observations")?;
    info!(docs = %observations.doc_url(), "Requesting {} series.", SERIES.len());

    let requests = SERIES.iter().map(|id| {
        let observations = observations.clone();
        async move {
            let pages = observations.get_all(params([("series_id", *id)])).await;
            (*id, pages)
        }
    });

    for (id, outcome) in join_all(requests).await {
        match outcome {
            Ok(pages) => info!(series = id, pages = pages.len(), "Fetched series."),
            Err(e) => error!(series = id, error = %e, "Failed to fetch series."),
        }
    }

    info!(remaining = client.limiter().remaining(), "Done; closing client.");
    client.close().await;
    Ok(())
}
