use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::device::Device;
use crate::{Error, Result, ScanFailure};

/// The platform scanning primitive that a [`DiscoverySessionController`]
/// drives
///
/// Implementations are expected to be non-blocking: `start_scan` and
/// `stop_scan` only issue requests. A scan that fails after being started is
/// reported out of band, and the owner of the controller is expected to
/// deliver that report, tagged with the [`ScanHandle`] the scan was started
/// with, to [`DiscoverySessionController::on_scan_failed`] on the thread that
/// owns the controller.
pub trait ScanCapability {
    /// Whether scanning is currently possible (the adapter is present,
    /// powered and the application is allowed to use it)
    fn is_scan_capable(&self) -> bool;

    /// Requests the platform to start a Low Energy scan
    ///
    /// An `Err` means the platform rejected the request synchronously.
    /// Anything reported later about this scan must carry `scan`.
    fn start_scan(&self, scan: ScanHandle, filter: &Filter, mode: ScanMode) -> Result<()>;

    /// Requests the platform to stop the current scan
    ///
    /// Returns `true` if a scan had been running.
    fn stop_scan(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    LowPower,
    Balanced,

    /// Some Android devices fail scans with `FeatureUnsupported` unless this
    /// mode is used, so it's the default.
    LowLatency,
}

impl Default for ScanMode {
    fn default() -> Self {
        ScanMode::LowLatency
    }
}

/// Limits which devices are reported while scanning
///
/// An empty filter matches every device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    pub(crate) service_uuids: HashSet<Uuid>,
}
impl Filter {
    pub fn new() -> Self {
        Self {
            service_uuids: HashSet::new()
        }
    }

    pub fn add_service(&mut self, uuid: Uuid) -> &mut Self {
        self.service_uuids.insert(uuid);

        self
    }

    pub fn service_uuids(&self) -> impl Iterator<Item = &Uuid> {
        self.service_uuids.iter()
    }

    pub fn matches(&self, device: &Device) -> bool {
        self.service_uuids.is_empty()
            || device.service_uuids().iter().any(|uuid| self.service_uuids.contains(uuid))
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies one physical scan, from the start request until it's stopped
/// or fails
///
/// Reports that arrive for a scan that is no longer the running one are
/// ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ScanHandle(u64);

#[cfg(test)]
impl ScanHandle {
    pub(crate) fn new(id: u64) -> Self {
        ScanHandle(id)
    }
}

/// What happened to the physical scan as a result of a controller operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    Started,
    Stopped,
    Unchanged,
}

/// Tracks how many callers are interested in discovery and keeps a single
/// physical scan running for as long as there is at least one of them.
///
/// The controller isn't synchronized. It is owned by one logical thread
/// (the adapter keeps it behind a mutex) and every call that may touch the
/// scan primitive is passed the [`ScanCapability`] to use.
///
/// Invariant: outside of a call, `is_scan_active() == (session_count() > 0)`.
#[derive(Debug, Default)]
pub struct DiscoverySessionController {
    session_count: u32,
    current_scan: Option<ScanHandle>,
    next_scan_id: u64,

    // Bumped whenever every session is invalidated at once, so that session
    // handles can tell that they are no longer counted.
    generation: u64,

    shut_down: bool,
}

impl DiscoverySessionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> u32 {
        self.session_count
    }

    pub fn is_discovering(&self) -> bool {
        self.session_count > 0
    }

    pub fn is_scan_active(&self) -> bool {
        self.current_scan.is_some()
    }

    pub fn current_scan(&self) -> Option<ScanHandle> {
        self.current_scan
    }

    /// Whether `scan` is the physical scan that's currently running
    pub fn is_current_scan(&self, scan: ScanHandle) -> bool {
        self.current_scan == Some(scan)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    /// Adds a discovery session, starting the physical scan if this is the
    /// first one.
    ///
    /// If the scan can't be started then the session isn't counted.
    pub fn add_session<S>(&mut self, scanner: &S, filter: &Filter, mode: ScanMode)
                          -> Result<Transition>
        where S: ScanCapability + ?Sized
    {
        if self.shut_down {
            return Err(Error::AdapterShutdown);
        }
        if !scanner.is_scan_capable() {
            debug!("add_session: fails, scanning isn't possible (not powered?)");
            return Err(Error::NotPowered);
        }

        self.session_count += 1;
        debug!("add_session: now {} sessions", self.session_count);
        if self.session_count > 1 {
            return Ok(Transition::Unchanged);
        }

        let scan = ScanHandle(self.next_scan_id);
        self.next_scan_id += 1;
        if let Err(err) = scanner.start_scan(scan, filter, mode) {
            warn!("add_session: cannot start scan: {}", err);
            self.session_count -= 1;
            return Err(err);
        }
        self.current_scan = Some(scan);

        Ok(Transition::Started)
    }

    /// Removes a discovery session, stopping the physical scan if this was
    /// the last one.
    ///
    /// Removing the last session reports `Error::ScanNotRunning` if the scan
    /// primitive says there was no scan to stop; the session is still
    /// removed.
    pub fn remove_session<S>(&mut self, scanner: &S) -> Result<Transition>
        where S: ScanCapability + ?Sized
    {
        if self.shut_down {
            return Err(Error::AdapterShutdown);
        }
        if self.session_count == 0 {
            warn!("remove_session: no discovery session in progress");
            return Err(Error::UnbalancedRelease);
        }

        self.session_count -= 1;
        if self.session_count > 0 {
            debug!("remove_session: now {} sessions", self.session_count);
            return Ok(Transition::Unchanged);
        }

        debug!("remove_session: stopping scan");
        self.current_scan = None;
        if scanner.stop_scan() {
            Ok(Transition::Stopped)
        } else {
            Err(Error::ScanNotRunning)
        }
    }

    /// Releases a session that was added while the controller was at
    /// `generation`
    ///
    /// If every session has been dropped since then (by a scan failure) the
    /// session is no longer counted and nothing is released.
    pub fn release_session<S>(&mut self, generation: u64, scanner: &S) -> Result<Transition>
        where S: ScanCapability + ?Sized
    {
        if generation != self.generation {
            trace!("release_session: session was already invalidated");
            return Err(Error::SessionInactive);
        }
        self.remove_session(scanner)
    }

    /// Reconciles state after the platform reported that `scan` died.
    ///
    /// If `scan` is the running scan, every outstanding session is dropped
    /// and callers have to add new sessions if they still want to discover
    /// devices. Returns `false` if the report was for a scan that had already
    /// been stopped (or had failed) and was ignored.
    pub fn on_scan_failed(&mut self, scan: ScanHandle, failure: ScanFailure) -> bool {
        if !self.is_current_scan(scan) {
            debug!("Ignoring failure ({}) of {:?}, not the running scan", failure, scan);
            return false;
        }
        warn!("Scan failed ({}), dropping {} discovery sessions",
              failure, self.session_count);

        self.session_count = 0;
        self.current_scan = None;
        self.generation += 1;
        true
    }

    /// Disables the controller, force-stopping the scan if one is running.
    ///
    /// Returns `true` if a running scan was stopped.
    pub fn shutdown<S>(&mut self, scanner: &S) -> bool
        where S: ScanCapability + ?Sized
    {
        if self.shut_down {
            return false;
        }
        trace!("Shutting down discovery ({} sessions)", self.session_count);
        self.shut_down = true;
        self.session_count = 0;
        self.generation += 1;

        if self.current_scan.take().is_some() {
            scanner.stop_scan()
        } else {
            false
        }
    }
}
