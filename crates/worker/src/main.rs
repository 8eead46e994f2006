use anyhow::Context;
use dive_engine::config::EngineConfig;
use dive_engine::Engine;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dive_worker=debug,dive_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let dataset_ids = dive_worker::parse_dataset_ids(std::env::args().skip(1))?;
    let config = EngineConfig::from_env().context("Invalid configuration")?;

    let engine = Engine::connect(&config)
        .await
        .context("Failed to start engine")?;
    tracing::info!(datasets = dataset_ids.len(), "Reconciling mask indexes");

    let tally = dive_worker::reconcile_datasets(&engine, &dataset_ids).await;
    tracing::info!(
        reconciled = tally.datasets_reconciled,
        encoded = tally.frames_encoded,
        skipped = tally.frames_skipped,
        entries = tally.index_entries,
        failed = tally.failures.len(),
        "Reconciliation finished",
    );

    if !tally.is_clean() {
        anyhow::bail!("{} dataset(s) failed to reconcile", tally.failures.len());
    }
    Ok(())
}
