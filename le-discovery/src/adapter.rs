use anyhow::anyhow;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use log::{debug, error, info, trace, warn};
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::device::Device;
use crate::discovery::{DiscoverySessionController, Filter, ScanCapability, ScanHandle, ScanMode,
                       Transition};
use crate::fake::FakeAdapter;
use crate::unsupported::UnsupportedAdapter;
use crate::{Address, BackendEvent, Error, Event, Result, ScanFailure};

#[derive(Clone, Debug)]
pub struct Adapter {
    inner: Arc<AdapterInner>,
}
impl PartialEq for Adapter {
    fn eq(&self, other: &Adapter) -> bool {
        Arc::<AdapterInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Adapter {}
impl Hash for Adapter {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<AdapterInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for Adapter {
    type Target = AdapterInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

// public for the sake of implementing Deref for ergonomics but since
// no members are public and there's no public API for AdapterInner
// we don't really leak anything
#[derive(Debug)]
pub struct AdapterInner {
    // The public-facing event stream
    event_bus: broadcast::Sender<Event>,
    next_flush_index: AtomicU32,

    backend: BackendAdapterImpl,

    // Every discovery session shares one scan with these settings
    filter: Filter,
    scan_mode: ScanMode,

    // A std mutex (not a tokio one) so that session handles can release
    // themselves from Drop. It's never held across an .await.
    discovery: StdMutex<DiscoverySessionController>,

    devices: DashMap<Address, Device>,
}

impl Drop for AdapterInner {
    fn drop(&mut self) {
        let discovery = self.discovery.get_mut().unwrap_or_else(PoisonError::into_inner);
        if discovery.shutdown(self.backend.api()) {
            debug!("Stopped scan while tearing down adapter");
        }
    }
}

/// The platform side of an adapter
///
/// Backends only report things through the backend bus they are given at
/// construction; they never call back into the adapter directly. That keeps
/// every mutation of discovery state on the adapter's own task, whichever
/// thread the platform delivers its callbacks on.
pub(crate) trait BackendAdapter: ScanCapability {
    /// Whether the application is able to use Bluetooth at all
    fn has_bluetooth_capability(&self) -> bool;
    fn is_present(&self) -> bool;
    fn is_powered(&self) -> bool;
    fn is_discoverable(&self) -> bool;
    fn address(&self) -> Option<Address>;
    fn name(&self) -> Option<String>;

    /// Queues a `BackendEvent::Flush(id)` behind any events already sent
    fn flush(&self, id: u32) -> Result<()>;
}

#[derive(Debug)]
enum BackendAdapterImpl {
    Unsupported(UnsupportedAdapter),
    Fake(FakeAdapter),
}
impl BackendAdapterImpl {
    fn api(&self) -> &dyn BackendAdapter {
        match self {
            BackendAdapterImpl::Unsupported(unsupported) => unsupported,
            BackendAdapterImpl::Fake(fake) => fake,
        }
    }
}

#[derive(Debug)]
pub enum Backend {
    /// The platform's own Bluetooth stack
    ///
    /// No platform backend is built into this crate, so this currently gives
    /// an adapter without Bluetooth support.
    SystemDefault,

    /// An adapter that is never present, as on a system without Bluetooth
    /// or without permission to use it
    Unsupported,

    Fake(FakeAdapter),
}

const DEFAULT_EVENT_CAPACITY: usize = 16;

/// Discovery settings that applications may want to keep in their own
/// configuration files
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryOptions {
    pub scan_mode: ScanMode,

    /// Only report devices advertising at least one of these services
    /// (all devices if empty)
    pub service_uuids: Vec<Uuid>,

    /// How many events each `events()` subscriber may fall behind by before
    /// it starts missing events
    pub event_capacity: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            scan_mode: ScanMode::default(),
            service_uuids: vec![],
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

pub struct AdapterConfig {
    backend: Backend,
    filter: Filter,
    scan_mode: ScanMode,
    event_capacity: usize,
}

impl AdapterConfig {
    pub fn new() -> AdapterConfig {
        AdapterConfig {
            backend: Backend::SystemDefault,
            filter: Filter::new(),
            scan_mode: ScanMode::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    pub fn with_options(options: &DiscoveryOptions) -> AdapterConfig {
        let mut config = AdapterConfig::new();
        config.apply_options(options);
        config
    }

    pub fn apply_options(&mut self, options: &DiscoveryOptions) -> &mut Self {
        let mut filter = Filter::new();
        for uuid in options.service_uuids.iter() {
            filter.add_service(*uuid);
        }
        self.filter = filter;
        self.scan_mode = options.scan_mode;
        self.event_capacity = options.event_capacity;
        self
    }

    pub fn set_backend(&mut self, backend: Backend) -> &mut Self {
        self.backend = backend;
        self
    }

    pub fn set_filter(&mut self, filter: Filter) -> &mut Self {
        self.filter = filter;
        self
    }

    pub fn set_scan_mode(&mut self, scan_mode: ScanMode) -> &mut Self {
        self.scan_mode = scan_mode;
        self
    }

    pub fn set_event_capacity(&mut self, capacity: usize) -> &mut Self {
        self.event_capacity = capacity;
        self
    }

    pub async fn start(self) -> Result<Adapter> {
        Adapter::start(self).await
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Adapter {
    // The backend task only holds a Weak reference to the AdapterInner (to
    // avoid a reference cycle) and uses this to re`wrap()` it into an Adapter
    // while it handles one event.
    fn wrap(inner: Arc<AdapterInner>) -> Self {
        Self { inner }
    }

    async fn start(config: AdapterConfig) -> Result<Self> {
        if config.event_capacity == 0 {
            return Err(Error::Other(anyhow!("The event capacity must be at least 1")));
        }
        let (broadcast_sender, _) = broadcast::channel(config.event_capacity);

        // The backend feeds the backend bus and a task spawned below applies
        // those events to the adapter's state and forwards corresponding
        // events to the application.
        let (backend_bus_tx, backend_bus_rx) = mpsc::unbounded_channel();
        let backend = match config.backend {
            Backend::SystemDefault => {
                info!("No platform Bluetooth backend available, adapter has no Bluetooth support");
                BackendAdapterImpl::Unsupported(UnsupportedAdapter::new(backend_bus_tx))
            }
            Backend::Unsupported => {
                info!("Adapter initialized without Bluetooth support");
                BackendAdapterImpl::Unsupported(UnsupportedAdapter::new(backend_bus_tx))
            }
            Backend::Fake(fake) => {
                info!("Adapter initialized with a fake backend");
                fake.attach(backend_bus_tx);
                BackendAdapterImpl::Fake(fake)
            }
        };

        let adapter =
            Adapter { inner: Arc::new(AdapterInner { event_bus: broadcast_sender,
                                                     next_flush_index: AtomicU32::new(0),
                                                     backend,
                                                     filter: config.filter,
                                                     scan_mode: config.scan_mode,
                                                     discovery: StdMutex::new(DiscoverySessionController::new()),
                                                     devices: DashMap::new(),
                                                    }) };

        let weak_adapter = Arc::downgrade(&adapter.inner);
        tokio::spawn(async move { Adapter::run_backend_task(weak_adapter, backend_bus_rx).await });

        Ok(adapter)
    }

    fn backend_api(&self) -> &dyn BackendAdapter {
        self.backend.api()
    }

    fn lock_discovery(&self) -> MutexGuard<'_, DiscoverySessionController> {
        // The controller is just a few counters so it can't be left half updated
        self.discovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_transition(&self, transition: Transition) {
        let discovering = match transition {
            Transition::Started => true,
            Transition::Stopped => false,
            Transition::Unchanged => return,
        };
        trace!("Discovering changed: {}", discovering);
        let _ = self.event_bus.send(Event::DiscoveringChanged { discovering });
    }

    /// Whether this application is able to use Bluetooth at all on this system
    pub fn has_bluetooth_capability(&self) -> bool {
        self.backend_api().has_bluetooth_capability()
    }

    pub fn is_present(&self) -> bool {
        self.backend_api().is_present()
    }

    pub fn is_powered(&self) -> bool {
        self.backend_api().is_powered()
    }

    /// Whether the adapter is visible to other devices
    pub fn is_discoverable(&self) -> bool {
        self.backend_api().is_discoverable()
    }

    pub fn address(&self) -> Option<Address> {
        self.backend_api().address()
    }

    pub fn name(&self) -> Option<String> {
        self.backend_api().name()
    }

    /// Whether there is at least one active discovery session
    pub fn is_discovering(&self) -> bool {
        self.lock_discovery().is_discovering()
    }

    pub fn discovery_session_count(&self) -> u32 {
        self.lock_discovery().session_count()
    }

    fn discovery_generation(&self) -> u64 {
        self.lock_discovery().generation()
    }

    /// Registers interest in discovering devices
    ///
    /// The first session starts scanning; later ones share that scan. Each
    /// successful call must be balanced by a call to
    /// [`remove_discovery_session`](Self::remove_discovery_session), unless
    /// an [`Event::ScanFailed`] drops all sessions first.
    ///
    /// Fails with `Error::NotPowered` if the adapter can't scan right now,
    /// or with the backend's error if scanning couldn't be started. In
    /// either case the session isn't counted.
    pub fn add_discovery_session(&self) -> Result<()> {
        let transition = self.lock_discovery()
                             .add_session(self.backend_api(), &self.filter, self.scan_mode)?;
        self.notify_transition(transition);
        Ok(())
    }

    /// Releases one discovery session, stopping the scan when the last one
    /// is released
    ///
    /// Releasing when there are no sessions is reported as
    /// `Error::UnbalancedRelease` and changes nothing.
    pub fn remove_discovery_session(&self) -> Result<()> {
        let result = self.lock_discovery().remove_session(self.backend_api());
        self.finish_removal(result)
    }

    fn finish_removal(&self, result: Result<Transition>) -> Result<()> {
        match result {
            Ok(transition) => {
                self.notify_transition(transition);
                Ok(())
            }
            Err(Error::ScanNotRunning) => {
                // The session was still released
                self.notify_transition(Transition::Stopped);
                Err(Error::ScanNotRunning)
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`add_discovery_session`](Self::add_discovery_session) but
    /// returns a handle that releases the session when dropped
    pub fn start_discovery_session(&self) -> Result<DiscoverySession> {
        let (transition, generation) = {
            let mut discovery = self.lock_discovery();
            let transition =
                discovery.add_session(self.backend_api(), &self.filter, self.scan_mode)?;
            (transition, discovery.generation())
        };
        self.notify_transition(transition);

        Ok(DiscoverySession { adapter: self.clone(),
                              generation,
                              released: false })
    }

    fn release_discovery_session(&self, generation: u64) -> Result<()> {
        // Checking the generation and releasing happen under one lock so a
        // scan failure can't slip in between and make this release a newer
        // session.
        let result = self.lock_discovery().release_session(generation, self.backend_api());
        self.finish_removal(result)
    }

    /// All devices discovered so far
    pub fn devices(&self) -> Vec<Device> {
        self.devices.iter().map(|item| item.value().clone()).collect()
    }

    pub fn device(&self, address: &Address) -> Option<Device> {
        self.devices.get(address).map(|item| item.value().clone())
    }

    fn on_device_discovered(&self, scan: ScanHandle, device: Device) {
        if !self.lock_discovery().is_current_scan(scan) {
            trace!("Ignoring result for {} from {:?}, not the running scan", device.address(), scan);
            return;
        }

        let address = device.address();
        if let Some(mut known) = self.devices.get_mut(&address) {
            trace!("Updating known device {}", address);
            known.merge(device);
            let device = known.value().clone();
            drop(known);
            let _ = self.event_bus.send(Event::DeviceChanged { device });
            return;
        }

        debug!("Discovered device {} ({:?})", address, device.name());
        self.devices.insert(address, device.clone());
        let _ = self.event_bus.send(Event::DeviceAdded { device });
    }

    fn on_scan_failed(&self, scan: ScanHandle, error_code: i32) {
        let failure = ScanFailure::from_code(error_code);
        if !self.lock_discovery().on_scan_failed(scan, failure) {
            return;
        }
        let _ = self.event_bus.send(Event::ScanFailed { failure });
        self.notify_transition(Transition::Stopped);
    }

    async fn run_backend_task(weak_adapter_inner: Weak<AdapterInner>,
                              backend_bus: mpsc::UnboundedReceiver<BackendEvent>) {
        trace!("Starting task to process backend events from the backend_bus...");

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(backend_bus);
        tokio::pin!(stream);
        while let Some(event) = stream.next().await {
            // We only hold a strong reference back to the Adapter while we're
            // processing a backend event otherwise we would be holding a circular reference...
            let adapter = match weak_adapter_inner.upgrade() {
                Some(strong_inner) => Adapter::wrap(strong_inner),
                None => {
                    trace!("Exiting backend event processor task since Adapter has been dropped");
                    break;
                }
            };

            match event {
                BackendEvent::DeviceDiscovered { scan, device } => {
                    adapter.on_device_discovered(scan, device);
                }
                BackendEvent::ScanFailed { scan, error_code } => {
                    adapter.on_scan_failed(scan, error_code);
                }
                BackendEvent::Flush(id) => {
                    trace!("backend flush {} received", id);
                    let _ = adapter.event_bus.send(Event::Flush(id));
                }
            }
        }

        trace!("Finished task processing backend events from the backend_bus");
    }

    /// Returns a stream of adapter events: discovery state changes, scan
    /// failures and discovered devices.
    ///
    /// Events sent before subscribing aren't delivered.
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        let receiver = self.event_bus.subscribe();
        Ok(BroadcastStream::new(receiver).filter_map(|x| async move {
                                             match x {
                                                 Ok(event) => Some(event),
                                                 Err(err) => {
                                                     warn!("Adapter event subscriber fell behind: {:?}", err);
                                                     None
                                                 }
                                             }
                                         }))
    }

    /// Waits until every backend event queued before this call has been
    /// processed (and any resulting events have been sent)
    pub async fn flush(&self) -> Result<()> {
        let id = self.next_flush_index.fetch_add(1, Ordering::SeqCst);

        // Subscribe before requesting the flush so we can't miss it
        let mut receiver = self.event_bus.subscribe();
        self.backend_api().flush(id)?;

        loop {
            match receiver.recv().await {
                Ok(Event::Flush(flushed)) if flushed == id => return Ok(()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    trace!("flush {}: skipped {} events", id, n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    error!("Adapter event bus closed while waiting for flush {}", id);
                    return Err(Error::AdapterShutdown);
                }
            }
        }
    }
}

/// A handle on one discovery session
///
/// The session is released when the handle is dropped or explicitly
/// [`stop`](Self::stop)ped. A scan failure invalidates every outstanding
/// handle at once; releasing an invalidated handle doesn't affect any other
/// session.
#[derive(Debug)]
pub struct DiscoverySession {
    adapter: Adapter,
    generation: u64,
    released: bool,
}

impl DiscoverySession {
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Whether this session is still counted by the adapter
    pub fn is_active(&self) -> bool {
        !self.released && self.adapter.discovery_generation() == self.generation
    }

    pub fn stop(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.adapter.release_discovery_session(self.generation)
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        match self.release() {
            Ok(()) | Err(Error::SessionInactive) => {}
            Err(err) => warn!("Failed to release discovery session: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::uuid_from_u16;
    use crate::fake::{FAKE_ADAPTER_ADDRESS, FAKE_ADAPTER_NAME, FAKE_DEVICE_ADDRESS,
                      FAKE_DEVICE_NAME};
    use std::time::Duration;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    async fn start_fake(fake: &FakeAdapter) -> Adapter {
        init_logging();
        let mut config = AdapterConfig::new();
        config.set_backend(Backend::Fake(fake.clone()));
        config.start().await.unwrap()
    }

    async fn wait_for<S, F>(events: &mut S, predicate: F) -> Event
        where S: Stream<Item = Event> + Unpin,
              F: Fn(&Event) -> bool
    {
        let wait = async {
            while let Some(event) = events.next().await {
                if predicate(&event) {
                    return event;
                }
            }
            panic!("Event stream ended");
        };
        tokio::time::timeout(Duration::from_secs(5), wait).await
                                                          .expect("Timed out waiting for event")
    }

    #[tokio::test]
    async fn adapter_eq() {
        let fake = FakeAdapter::new();
        let adapter0 = start_fake(&fake).await;
        let adapter1 = AdapterConfig::new().start().await.unwrap();
        assert_ne!(adapter0, adapter1);
        assert_eq!(adapter0, adapter0.clone());
    }

    #[tokio::test]
    async fn fake_adapter_properties() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;

        assert!(adapter.has_bluetooth_capability());
        assert!(adapter.is_present());
        assert!(adapter.is_powered());
        assert!(!adapter.is_discoverable());
        assert!(!adapter.is_discovering());
        assert_eq!(adapter.address(), Some(FAKE_ADAPTER_ADDRESS));
        assert_eq!(adapter.address().unwrap().to_string(), "A1:B2:C3:D4:E5:F6");
        assert_eq!(adapter.name().as_deref(), Some(FAKE_ADAPTER_NAME));
    }

    #[tokio::test]
    async fn adapter_without_bluetooth_support() {
        init_logging();
        for backend in vec![Backend::SystemDefault, Backend::Unsupported] {
            let mut config = AdapterConfig::new();
            config.set_backend(backend);
            let adapter = config.start().await.unwrap();

            assert!(!adapter.has_bluetooth_capability());
            assert!(!adapter.is_present());
            assert!(!adapter.is_powered());
            assert!(!adapter.is_discoverable());
            assert_eq!(adapter.address(), None);
            assert_eq!(adapter.name(), None);

            assert!(matches!(adapter.add_discovery_session(), Err(Error::NotPowered)));
            assert!(!adapter.is_discovering());
            assert!(matches!(adapter.remove_discovery_session(), Err(Error::UnbalancedRelease)));
            adapter.flush().await.unwrap();
        }
    }

    #[tokio::test]
    async fn session_count_trace() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;
        let mut events = Box::pin(adapter.events().unwrap());

        adapter.add_discovery_session().unwrap();
        assert_eq!(adapter.discovery_session_count(), 1);
        assert_eq!(fake.start_scan_count(), 1);
        assert!(fake.is_scanning());
        assert!(adapter.is_discovering());
        assert!(matches!(events.next().await,
                         Some(Event::DiscoveringChanged { discovering: true })));

        adapter.add_discovery_session().unwrap();
        assert_eq!(adapter.discovery_session_count(), 2);
        assert_eq!(fake.start_scan_count(), 1);

        adapter.remove_discovery_session().unwrap();
        assert_eq!(adapter.discovery_session_count(), 1);
        assert_eq!(fake.stop_scan_count(), 0);

        adapter.remove_discovery_session().unwrap();
        assert_eq!(adapter.discovery_session_count(), 0);
        assert_eq!(fake.stop_scan_count(), 1);
        assert!(!fake.is_scanning());
        assert!(!adapter.is_discovering());
        assert!(matches!(events.next().await,
                         Some(Event::DiscoveringChanged { discovering: false })));

        assert!(matches!(adapter.remove_discovery_session(), Err(Error::UnbalancedRelease)));
        assert_eq!(adapter.discovery_session_count(), 0);
        assert_eq!(fake.stop_scan_count(), 1);
    }

    #[tokio::test]
    async fn scan_uses_configured_mode() {
        init_logging();
        let fake = FakeAdapter::new();
        let mut config = AdapterConfig::new();
        config.set_backend(Backend::Fake(fake.clone()))
              .set_scan_mode(ScanMode::Balanced);
        let adapter = config.start().await.unwrap();

        adapter.add_discovery_session().unwrap();
        assert_eq!(fake.scan_mode(), Some(ScanMode::Balanced));
    }

    #[tokio::test]
    async fn unpowered_adapter_rejects_sessions() {
        let fake = FakeAdapter::new();
        fake.set_powered(false);
        let adapter = start_fake(&fake).await;

        assert!(matches!(adapter.add_discovery_session(), Err(Error::NotPowered)));
        assert_eq!(adapter.discovery_session_count(), 0);
        assert_eq!(fake.start_scan_count(), 0);

        fake.set_powered(true);
        adapter.add_discovery_session().unwrap();
        assert_eq!(adapter.discovery_session_count(), 1);
    }

    #[tokio::test]
    async fn rejected_scan_start_is_rolled_back() {
        let fake = FakeAdapter::new();
        fake.set_reject_start(true);
        let adapter = start_fake(&fake).await;

        assert!(matches!(adapter.add_discovery_session(), Err(Error::ScanStartRejected(_))));
        assert_eq!(adapter.discovery_session_count(), 0);
        assert!(!adapter.is_discovering());
        assert_eq!(fake.start_scan_count(), 1);
        assert!(matches!(adapter.start_discovery_session(), Err(Error::ScanStartRejected(_))));
        assert_eq!(adapter.discovery_session_count(), 0);
    }

    #[tokio::test]
    async fn scan_failure_drops_every_session() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;
        for _ in 0..3 {
            adapter.add_discovery_session().unwrap();
        }
        assert_eq!(adapter.discovery_session_count(), 3);

        let mut events = Box::pin(adapter.events().unwrap());
        fake.fail_scan(4).unwrap();

        let event = wait_for(&mut events, |event| matches!(event, Event::ScanFailed { .. })).await;
        match event {
            Event::ScanFailed { failure } => {
                assert_eq!(failure, ScanFailure::FeatureUnsupported);
                assert_eq!(failure.code(), 4);
            }
            _ => unreachable!(),
        }
        assert_eq!(adapter.discovery_session_count(), 0);
        assert!(!adapter.is_discovering());
        assert!(matches!(events.next().await,
                         Some(Event::DiscoveringChanged { discovering: false })));

        // Not retried automatically, but a new session starts a new scan
        assert_eq!(fake.start_scan_count(), 1);
        adapter.add_discovery_session().unwrap();
        assert_eq!(fake.start_scan_count(), 2);
        assert!(fake.is_scanning());
    }

    #[tokio::test]
    async fn session_handles() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;

        let session0 = adapter.start_discovery_session().unwrap();
        let session1 = adapter.start_discovery_session().unwrap();
        assert!(session0.is_active());
        assert_eq!(session0.adapter(), &adapter);
        assert_eq!(adapter.discovery_session_count(), 2);

        drop(session0);
        assert_eq!(adapter.discovery_session_count(), 1);
        assert!(fake.is_scanning());

        session1.stop().unwrap();
        assert_eq!(adapter.discovery_session_count(), 0);
        assert_eq!(fake.stop_scan_count(), 1);
        assert!(!fake.is_scanning());
    }

    #[tokio::test]
    async fn scan_failure_invalidates_session_handles() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;

        let stale0 = adapter.start_discovery_session().unwrap();
        let stale1 = adapter.start_discovery_session().unwrap();

        fake.fail_scan(3).unwrap();
        adapter.flush().await.unwrap();
        assert!(!stale0.is_active());
        assert!(!stale1.is_active());

        let fresh = adapter.start_discovery_session().unwrap();
        assert!(fresh.is_active());
        assert_eq!(adapter.discovery_session_count(), 1);

        // Releasing invalidated handles must not release the fresh session
        assert!(matches!(stale0.stop(), Err(Error::SessionInactive)));
        drop(stale1);
        assert_eq!(adapter.discovery_session_count(), 1);
        assert!(fresh.is_active());
        assert!(fake.is_scanning());
    }

    #[tokio::test]
    async fn late_failure_report_leaves_new_scan_running() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;
        adapter.add_discovery_session().unwrap();

        // The failure is still queued on the backend bus while the session
        // is released and a new one started.
        fake.fail_scan(3).unwrap();
        assert!(matches!(adapter.remove_discovery_session(), Err(Error::ScanNotRunning)));
        adapter.add_discovery_session().unwrap();
        assert!(fake.is_scanning());

        let mut events = Box::pin(adapter.events().unwrap());
        adapter.flush().await.unwrap();
        assert!(matches!(events.next().await, Some(Event::Flush(_))));
        assert_eq!(adapter.discovery_session_count(), 1);
        assert!(adapter.is_discovering());
        assert!(fake.is_scanning());
        assert_eq!(fake.start_scan_count(), 2);

        adapter.remove_discovery_session().unwrap();
        assert!(!fake.is_scanning());
        assert_eq!(fake.stop_scan_count(), 2);
        adapter.add_discovery_session().unwrap();
        assert_eq!(fake.start_scan_count(), 3);
    }

    #[tokio::test]
    async fn late_failure_report_with_session_handles() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;
        let stale = adapter.start_discovery_session().unwrap();

        fake.fail_scan(3).unwrap();
        assert!(matches!(stale.stop(), Err(Error::ScanNotRunning)));
        let fresh = adapter.start_discovery_session().unwrap();

        adapter.flush().await.unwrap();
        assert!(fresh.is_active());
        assert_eq!(adapter.discovery_session_count(), 1);
        assert!(fake.is_scanning());

        drop(fresh);
        assert!(!fake.is_scanning());
        assert_eq!(adapter.discovery_session_count(), 0);
    }

    #[tokio::test]
    async fn release_before_queued_failure_is_applied() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;
        let released_early = adapter.start_discovery_session().unwrap();
        let invalidated = adapter.start_discovery_session().unwrap();

        fake.fail_scan(3).unwrap();
        drop(released_early);
        assert_eq!(adapter.discovery_session_count(), 1);

        adapter.flush().await.unwrap();
        assert_eq!(adapter.discovery_session_count(), 0);
        assert!(!invalidated.is_active());

        let fresh = adapter.start_discovery_session().unwrap();
        drop(invalidated);
        assert_eq!(adapter.discovery_session_count(), 1);
        assert!(fresh.is_active());
        assert!(fake.is_scanning());
        assert_eq!(fake.stop_scan_count(), 0);

        fresh.stop().unwrap();
        assert_eq!(fake.stop_scan_count(), 1);
    }

    #[tokio::test]
    async fn results_from_a_stopped_scan_are_ignored() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;
        adapter.add_discovery_session().unwrap();
        fake.discover_low_energy_device(1).unwrap();
        adapter.remove_discovery_session().unwrap();
        adapter.add_discovery_session().unwrap();

        adapter.flush().await.unwrap();
        assert!(adapter.devices().is_empty());

        fake.discover_low_energy_device(1).unwrap();
        adapter.flush().await.unwrap();
        assert_eq!(adapter.devices().len(), 1);
    }

    #[tokio::test]
    async fn teardown_stops_scan() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;
        adapter.add_discovery_session().unwrap();
        adapter.add_discovery_session().unwrap();
        assert!(fake.is_scanning());

        drop(adapter);
        assert!(!fake.is_scanning());
        assert_eq!(fake.stop_scan_count(), 1);
    }

    #[tokio::test]
    async fn teardown_when_idle_does_not_stop() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;
        drop(adapter);
        assert_eq!(fake.stop_scan_count(), 0);
    }

    #[tokio::test]
    async fn discovered_devices() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;
        let mut events = Box::pin(adapter.events().unwrap());
        adapter.add_discovery_session().unwrap();

        fake.discover_low_energy_device(1).unwrap();
        let device = match wait_for(&mut events, |event| matches!(event, Event::DeviceAdded { .. })).await {
            Event::DeviceAdded { device } => device,
            _ => unreachable!(),
        };
        assert_eq!(device.address(), FAKE_DEVICE_ADDRESS);
        assert_eq!(device.address().to_string(), "A1:B2:C3:DD:DD:DD");
        assert_eq!(device.name(), Some(FAKE_DEVICE_NAME));
        assert_eq!(device.bluetooth_class(), 0x1F00);
        assert!(device.is_paired());
        assert!(device.has_service_id(uuid_from_u16(0x1800)));

        fake.discover_low_energy_device(2).unwrap();
        fake.discover_low_energy_device(3).unwrap();
        for _ in 0..2 {
            wait_for(&mut events, |event| matches!(event, Event::DeviceChanged { .. })).await;
        }

        let devices = adapter.devices();
        assert_eq!(devices.len(), 1);
        let device = adapter.device(&FAKE_DEVICE_ADDRESS).unwrap();
        assert_eq!(device.name(), Some(FAKE_DEVICE_NAME));
        assert_eq!(device.service_uuids(),
                   &[uuid_from_u16(0x1800), uuid_from_u16(0x1801),
                     uuid_from_u16(0x1802), uuid_from_u16(0x1803)][..]);
    }

    #[tokio::test]
    async fn filter_limits_reported_devices() {
        init_logging();
        let fake = FakeAdapter::new();
        let mut filter = Filter::new();
        filter.add_service(uuid_from_u16(0x1803));
        let mut config = AdapterConfig::new();
        config.set_backend(Backend::Fake(fake.clone()))
              .set_filter(filter);
        let adapter = config.start().await.unwrap();
        adapter.add_discovery_session().unwrap();

        fake.discover_low_energy_device(1).unwrap();
        adapter.flush().await.unwrap();
        assert!(adapter.devices().is_empty());

        fake.discover_low_energy_device(2).unwrap();
        adapter.flush().await.unwrap();
        assert_eq!(adapter.devices().len(), 1);
    }

    #[tokio::test]
    async fn late_scan_results_are_ignored() {
        let fake = FakeAdapter::new();
        let adapter = start_fake(&fake).await;
        adapter.add_discovery_session().unwrap();
        fake.discover_low_energy_device(1).unwrap();
        adapter.remove_discovery_session().unwrap();
        adapter.flush().await.unwrap();
        assert!(adapter.devices().is_empty());
    }

    #[tokio::test]
    async fn zero_event_capacity_is_rejected() {
        let mut config = AdapterConfig::new();
        config.set_event_capacity(0);
        assert!(matches!(config.start().await, Err(Error::Other(_))));
    }

    #[test]
    fn options_from_json() {
        let options: DiscoveryOptions = serde_json::from_str(r#"{
            "scan_mode": "low_power",
            "service_uuids": ["0000180d-0000-1000-8000-00805f9b34fb"]
        }"#).unwrap();
        assert_eq!(options.scan_mode, ScanMode::LowPower);
        assert_eq!(options.service_uuids, vec![uuid_from_u16(0x180D)]);
        assert_eq!(options.event_capacity, DEFAULT_EVENT_CAPACITY);

        let config = AdapterConfig::with_options(&options);
        assert_eq!(config.scan_mode, ScanMode::LowPower);
        assert_eq!(config.filter.service_uuids().count(), 1);

        let defaults: DiscoveryOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(defaults, DiscoveryOptions::default());
    }
}
