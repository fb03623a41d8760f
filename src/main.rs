mod cli;
mod coordinator;
mod device;
mod prelude;
mod sensor;
mod solis;

use std::sync::Arc;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::{
    cli::Args,
    coordinator::{Coordinator, Subscriber},
    device::Endpoint,
    prelude::*,
    sensor::MetricSensor,
    solis::SolisClient,
};

#[tokio::main]
async fn main() -> Result {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let endpoint = Endpoint::new(args.address.clone(), args.serial.clone());

    // Validate the configuration before building anything long-lived: a wrong
    // serial should fail setup, not poison the polling loop.
    let client = SolisClient::try_new(endpoint.clone())?;
    client.probe().await.context("failed to validate the configured device")?;

    let device = Arc::new(device::solis_device(&endpoint.serial));
    let coordinator =
        Arc::new(Coordinator::builder().client(Box::new(client)).endpoint(endpoint).build());
    for descriptor in sensor::METRICS {
        let sensor = MetricSensor::new(descriptor, Arc::clone(&device));
        coordinator.subscribe(sensor as Arc<dyn Subscriber>);
    }

    coordinator
        .request_first_refresh()
        .await
        .map_err(|error| anyhow!("initial fetch failed: {error}"))?;
    coordinator.start(args.scan_interval())?;

    tokio::signal::ctrl_c().await.context("failed to listen for the interrupt signal")?;
    coordinator.stop().await;
    Ok(())
}
