use futures::StreamExt;
use le_discovery::device::uuid_from_u16;
use le_discovery::fake::FakeAdapter;
use le_discovery::{AdapterConfig, Backend, DiscoveryOptions, Event};
use log::{info, warn};
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;

// Drives a fake adapter through a short discovery run: two overlapping
// sessions, a handful of scan results and finally a scan failure.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::builder().filter_level(log::LevelFilter::Info) // Default Log Level
                         .parse_default_env()
                         .init();

    let options = DiscoveryOptions { service_uuids: vec![uuid_from_u16(0x1800), uuid_from_u16(0x1802)],
                                     ..Default::default() };

    let fake = FakeAdapter::new();
    let mut config = AdapterConfig::with_options(&options);
    config.set_backend(Backend::Fake(fake.clone()));
    let adapter = config.start().await?;

    info!("Adapter {:?} ({:?}) powered = {}",
          adapter.address(),
          adapter.name(),
          adapter.is_powered());

    let mut events = Box::pin(adapter.events()?);

    let first = adapter.start_discovery_session()?;
    let second = adapter.start_discovery_session()?;
    info!("{} discovery sessions", adapter.discovery_session_count());

    let mut ticks = IntervalStream::new(tokio::time::interval(Duration::from_millis(100))).enumerate()
                                                                                          .take(4);
    while let Some((i, _)) = ticks.next().await {
        match i {
            0 | 1 | 2 => fake.discover_low_energy_device(i as u32 + 1)?,
            _ => {
                drop(first);
                info!("{} discovery sessions", adapter.discovery_session_count());
                fake.fail_scan(3)?;
                break;
            }
        }
    }
    adapter.flush().await?;

    if second.is_active() {
        warn!("Session still active after the scan failed");
    }

    // Drain whatever was queued
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(10), events.next()).await {
        match event {
            Event::DiscoveringChanged { discovering } => info!("Discovering: {}", discovering),
            Event::DeviceAdded { device } => info!("Found {} {:?}", device.address(), device.name()),
            Event::DeviceChanged { device } => {
                info!("Updated {}: services = {:?}", device.address(), device.service_uuids())
            }
            Event::ScanFailed { failure } => warn!("Scan failed: {}", failure),
            _ => {}
        }
    }

    info!("{} device(s) known", adapter.devices().len());
    Ok(())
}
