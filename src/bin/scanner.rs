use btleplug::api::Manager as _;
use btleplug::platform::Manager;
use futures::stream::StreamExt;

use tuyable::Discoverer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter("tuyable=debug,scanner=info")
        .init();

    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or("no bluetooth adapter found")?;

    let discoverer = Discoverer::new(adapter);
    let mut devices = discoverer.discover().await?;

    tracing::info!("Scanning for devices, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            device = devices.next() => {
                let Some(device) = device else { break };
                tracing::info!(
                    local_name = %device.local_name,
                    address = %device.address,
                    is_bound = device.is_bound,
                    protocol_version = device.protocol_version,
                    uuid = %hex::encode(device.uuid),
                    rssi = device.rssi,
                    "Discovered device"
                );
            }
        }
    }

    discoverer.stop().await?;

    Ok(())
}
