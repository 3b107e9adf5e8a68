//! fhir-fetch: fetch one patient's resources and print them as NDJSON.

use std::io::BufWriter;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fhir_client::telemetry::{self, MetricsRegistry};
use fhir_client::{ClientConfig, FhirClient};

const DEFAULT_RESOURCE_TYPES: &str = "Patient,Observation,Condition,Encounter,MedicationRequest";

#[tokio::main]
async fn main() {
    // Logs go to stderr so stdout stays pure NDJSON
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,fhir_client=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let config = ClientConfig::from_env().expect("Invalid client configuration");
    let patient_id = std::env::var("FHIR_PATIENT_ID").expect("FHIR_PATIENT_ID is not set");
    let resource_types: Vec<String> = std::env::var("FHIR_RESOURCE_TYPES")
        .unwrap_or_else(|_| DEFAULT_RESOURCE_TYPES.into())
        .split(',')
        .map(str::trim)
        .filter(|rt| !rt.is_empty())
        .map(String::from)
        .collect();

    if config.token_cache_path.is_none() {
        tracing::warn!("FHIR_TOKEN_CACHE not set, requests cannot be authenticated");
    }
    if let Some(rps) = config.rate_limit_rps {
        tracing::info!("Client-side pacing: {} requests/second", rps);
    }
    let prometheus = telemetry::install_prometheus();

    let page_size = config.page_size;
    let client = FhirClient::builder(config)
        .build()
        .expect("Failed to build FHIR client");

    tracing::info!(
        patient_id = %patient_id,
        resource_types = ?resource_types,
        "Fetching patient resources"
    );
    let result = match client.fetch_many(&patient_id, &resource_types, page_size).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, "Fetch could not start");
            std::process::exit(1);
        }
    };

    let stdout = BufWriter::new(std::io::stdout().lock());
    let lines = result
        .write_ndjson(stdout)
        .expect("Failed to write NDJSON to stdout");

    for (resource_type, error) in &result.errors {
        tracing::warn!(resource_type = %resource_type, error = %error, "Resource type incomplete");
    }
    let snapshot = MetricsRegistry::global().snapshot();
    tracing::info!(resources = lines, metrics = ?snapshot, "Fetch complete");
    tracing::debug!(prometheus = %prometheus.render(), "Metrics exposition");

    if !result.is_complete() {
        std::process::exit(2);
    }
}
