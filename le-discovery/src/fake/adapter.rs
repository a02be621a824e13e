use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::anyhow;
use log::{trace, warn};
use tokio::sync::mpsc;

use crate::adapter::BackendAdapter;
use crate::device::{uuid_from_u16, Device};
use crate::discovery::{Filter, ScanCapability, ScanHandle, ScanMode};
use crate::{Address, BackendEvent, Error, Result};

pub const FAKE_ADAPTER_ADDRESS: Address = Address::new([0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6]);
pub const FAKE_ADAPTER_NAME: &str = "FakeBluetoothAdapter";
pub const FAKE_DEVICE_ADDRESS: Address = Address::new([0xA1, 0xB2, 0xC3, 0xDD, 0xDD, 0xDD]);
pub const FAKE_DEVICE_NAME: &str = "FakeBluetoothDevice";

/// A fake adapter backend
///
/// Create one, keep a clone for driving it from a test and hand the other to
/// [`AdapterConfig::set_backend`](crate::AdapterConfig::set_backend) via
/// [`Backend::Fake`](crate::Backend::Fake).
///
/// By default the fake is present, powered and allowed to scan, and accepts
/// one scan at a time (a second start is rejected, like a real scanner that
/// doesn't support multiple scans).
#[derive(Clone, Debug, Default)]
pub struct FakeAdapter {
    inner: Arc<Mutex<FakeState>>,
}

#[derive(Debug)]
struct FakeState {
    capable: bool,
    present: bool,
    powered: bool,
    reject_start: bool,

    scan: Option<FakeScan>,
    start_scan_count: u32,
    stop_scan_count: u32,

    // Set once the fake is handed to an adapter
    backend_bus: Option<mpsc::UnboundedSender<BackendEvent>>,
}

#[derive(Debug)]
struct FakeScan {
    handle: ScanHandle,
    filter: Filter,
    mode: ScanMode,
}

impl Default for FakeState {
    fn default() -> Self {
        FakeState {
            capable: true,
            present: true,
            powered: true,
            reject_start: false,
            scan: None,
            start_scan_count: 0,
            stop_scan_count: 0,
            backend_bus: None,
        }
    }
}

impl FakeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn attach(&self, backend_bus: mpsc::UnboundedSender<BackendEvent>) {
        let mut state = self.state();
        if state.backend_bus.is_some() {
            warn!("FakeAdapter attached to a second adapter; events go to the newest one");
        }
        state.backend_bus = Some(backend_bus);
    }

    fn send(&self, event: BackendEvent) -> Result<()> {
        let backend_bus = self.state()
                              .backend_bus
                              .clone()
                              .ok_or_else(|| anyhow!("FakeAdapter isn't attached to an adapter"))?;
        backend_bus.send(event)
                   .map_err(|_| Error::Other(anyhow!("The adapter using this FakeAdapter has been dropped")))
    }

    pub fn set_bluetooth_capability(&self, capable: bool) -> &Self {
        self.state().capable = capable;
        self
    }

    pub fn set_present(&self, present: bool) -> &Self {
        self.state().present = present;
        self
    }

    pub fn set_powered(&self, powered: bool) -> &Self {
        self.state().powered = powered;
        self
    }

    /// Makes every following start request fail as if the platform rejected
    /// its arguments
    pub fn set_reject_start(&self, reject: bool) -> &Self {
        self.state().reject_start = reject;
        self
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scan.is_some()
    }

    /// The mode of the running scan, if any
    pub fn scan_mode(&self) -> Option<ScanMode> {
        self.state().scan.as_ref().map(|scan| scan.mode)
    }

    pub fn start_scan_count(&self) -> u32 {
        self.state().start_scan_count
    }

    pub fn stop_scan_count(&self) -> u32 {
        self.state().stop_scan_count
    }

    /// Kills the running scan and reports `error_code` the way a platform
    /// scan callback would: asynchronously, through the adapter's backend bus.
    ///
    /// It's an error to call this while no scan is running.
    pub fn fail_scan(&self, error_code: i32) -> Result<()> {
        let scan = self.state()
                       .scan
                       .take()
                       .ok_or_else(|| anyhow!("FakeAdapter: no scan in progress"))?;
        trace!("FakeAdapter: failing {:?} with code {}", scan.handle, error_code);
        self.send(BackendEvent::ScanFailed { scan: scan.handle,
                                             error_code })
    }

    /// Reports one of a few canned scan results
    ///
    /// All ordinals describe the same device address:
    ///  1. named "FakeBluetoothDevice", advertising services 0x1800 and 0x1801
    ///  2. named "FakeBluetoothDevice", advertising services 0x1802 and 0x1803
    ///  3. no name and no services
    ///
    /// It's an error to call this while no scan is running. Results that don't
    /// match the running scan's filter are silently dropped.
    pub fn discover_low_energy_device(&self, ordinal: u32) -> Result<()> {
        let (name, uuids) = match ordinal {
            1 => (FAKE_DEVICE_NAME, vec![uuid_from_u16(0x1800), uuid_from_u16(0x1801)]),
            2 => (FAKE_DEVICE_NAME, vec![uuid_from_u16(0x1802), uuid_from_u16(0x1803)]),
            3 => ("", vec![]),
            _ => return Err(Error::Other(anyhow!("No fake device with ordinal {}", ordinal))),
        };
        let device = Device::new(FAKE_DEVICE_ADDRESS).with_name(name)
                                                     .with_service_uuids(&uuids)
                                                     .with_bluetooth_class(0x1F00)
                                                     .with_paired(true)
                                                     .with_rssi(-50);

        let scan = match &self.state().scan {
            Some(scan) if scan.filter.matches(&device) => scan.handle,
            Some(_) => {
                trace!("FakeAdapter: filtered out fake device {}", ordinal);
                return Ok(());
            }
            None => return Err(Error::Other(anyhow!("FakeAdapter: no scan in progress"))),
        };
        self.send(BackendEvent::DeviceDiscovered { scan, device })
    }
}

impl ScanCapability for FakeAdapter {
    fn is_scan_capable(&self) -> bool {
        let state = self.state();
        state.capable && state.present && state.powered
    }

    fn start_scan(&self, scan: ScanHandle, filter: &Filter, mode: ScanMode) -> Result<()> {
        let mut state = self.state();
        state.start_scan_count += 1;
        if state.reject_start {
            return Err(Error::ScanStartRejected("FakeAdapter configured to reject scans".to_string()));
        }
        if state.scan.is_some() {
            return Err(Error::ScanStartRejected("FakeAdapter does not support multiple scans".to_string()));
        }
        state.scan = Some(FakeScan { handle: scan,
                                     filter: filter.clone(),
                                     mode });
        Ok(())
    }

    fn stop_scan(&self) -> bool {
        let mut state = self.state();
        state.stop_scan_count += 1;
        state.scan.take().is_some()
    }
}

impl BackendAdapter for FakeAdapter {
    fn has_bluetooth_capability(&self) -> bool {
        self.state().capable
    }

    fn is_present(&self) -> bool {
        self.state().present
    }

    fn is_powered(&self) -> bool {
        let state = self.state();
        state.present && state.powered
    }

    fn is_discoverable(&self) -> bool {
        false
    }

    fn address(&self) -> Option<Address> {
        if self.is_present() {
            Some(FAKE_ADAPTER_ADDRESS)
        } else {
            None
        }
    }

    fn name(&self) -> Option<String> {
        if self.is_present() {
            Some(FAKE_ADAPTER_NAME.to_string())
        } else {
            None
        }
    }

    fn flush(&self, id: u32) -> Result<()> {
        self.send(BackendEvent::Flush(id))
    }
}
