use tokio::sync::mpsc;

use crate::adapter::BackendAdapter;
use crate::discovery::{Filter, ScanCapability, ScanHandle, ScanMode};
use crate::{Address, BackendEvent, Error, Result};

// Backend for systems without usable Bluetooth support (no platform backend,
// missing permissions or no Low Energy feature). The adapter still works but
// is never present and can't discover anything.
#[derive(Debug)]
pub(crate) struct UnsupportedAdapter {
    backend_bus: mpsc::UnboundedSender<BackendEvent>,
}

impl UnsupportedAdapter {
    pub fn new(backend_bus: mpsc::UnboundedSender<BackendEvent>) -> Self {
        UnsupportedAdapter { backend_bus }
    }
}

impl ScanCapability for UnsupportedAdapter {
    fn is_scan_capable(&self) -> bool {
        false
    }
    fn start_scan(&self, _scan: ScanHandle, _filter: &Filter, _mode: ScanMode) -> Result<()> {
        Err(Error::Unsupported)
    }
    fn stop_scan(&self) -> bool {
        false
    }
}

impl BackendAdapter for UnsupportedAdapter {
    fn has_bluetooth_capability(&self) -> bool {
        false
    }
    fn is_present(&self) -> bool {
        false
    }
    fn is_powered(&self) -> bool {
        false
    }
    fn is_discoverable(&self) -> bool {
        false
    }
    fn address(&self) -> Option<Address> {
        None
    }
    fn name(&self) -> Option<String> {
        None
    }

    fn flush(&self, id: u32) -> Result<()> {
        self.backend_bus
            .send(BackendEvent::Flush(id))
            .map_err(|_| Error::AdapterShutdown)
    }
}
