use p1_meter_bridge::{
    config::{ConfigProvider, FileConfig},
    health::HealthReporter,
    meter_client::{MeterClient, DEFAULT_TIMEOUT},
    service,
    update_loop::{UpdateLoop, UPDATE_INTERVAL},
    LocalBus, MetricPublisher,
};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Start");
    let config = FileConfig::from_env();
    info!("Using config file {}", config.path().display());

    // Startup problems end the process before anything is published.
    let settings = config.settings().inspect_err(|e| error!("{e}"))?;
    let endpoint = settings.status_url().inspect_err(|e| error!("{e}"))?;
    let meter = MeterClient::new(endpoint, DEFAULT_TIMEOUT)?;
    info!("Reading smart gateway at {}", meter.endpoint());

    let (identity, bus) = service::bootstrap(&settings, &meter, LocalBus::new)
        .await
        .inspect_err(|e| error!("{e}"))?;
    info!(
        "Publishing as {} with {} paths",
        identity.service_name(),
        bus.paths().len()
    );

    bus.on_external_change(Box::new(|path, value| {
        info!("Someone else updated {path} to {value}");
        true
    }));

    let (update_loop, status) = UpdateLoop::new(meter, config, bus.clone(), UPDATE_INTERVAL);
    let health = HealthReporter::new(bus, status, settings.sign_of_life_interval());

    info!("Connected to bus, switching over to the event loop");
    tokio::select! {
        _ = update_loop.run() => {}
        _ = health.run() => {}
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Cannot listen for interrupt: {e}");
            }
            info!("Received interrupt or exit...");
        }
    }
    Ok(())
}
