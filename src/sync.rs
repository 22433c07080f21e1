//! Address/coordinate synchronization for the pickup and dropoff locations.
//!
//! Forward lookups are debounced per address field; a map click writes the
//! dropoff coordinates at once and resolves the address in the background.
//! Every background write re-checks the record epoch and the text it was
//! computed from, so a superseded result never lands.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::geocoding::GeocodingService;
use crate::record::{Coordinates, Section};
use crate::state::{IntakeEvent, SharedIntake};

pub const DEFAULT_CENTER: Coordinates = Coordinates {
    lat: 45.5017,
    lng: -73.5673,
};
const FIX_ZOOM: u8 = 13;
const FALLBACK_ZOOM: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncTarget {
    PickupForward,
    DropoffForward,
    DropoffReverse,
}

/// Cancellable delayed tasks keyed by identity. Scheduling a key aborts
/// whatever was pending under it before the new task is spawned.
pub struct Debouncer<K> {
    pending: Arc<Mutex<HashMap<K, JoinHandle<()>>>>,
}

impl<K> Clone for Debouncer<K> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<K> Default for Debouncer<K> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash> Debouncer<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if let Some(previous) = pending.remove(&key) {
            previous.abort();
        }
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            task.await;
        });
        pending.insert(key, handle);
    }

    pub fn cancel(&self, key: &K) -> bool {
        match self.pending.lock().remove(key) {
            Some(handle) => {
                let was_live = !handle.is_finished();
                handle.abort();
                was_live
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.pending.lock().drain() {
            handle.abort();
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending
            .lock()
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }
}

/// One-shot marker: armed before a reverse-geocoded address write, consumed
/// by the next address observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SuppressionFlag {
    #[default]
    Idle,
    Armed,
}

impl SuppressionFlag {
    pub fn arm(&mut self) {
        *self = SuppressionFlag::Armed;
    }

    /// Returns whether the flag was armed, leaving it idle either way.
    pub fn consume(&mut self) -> bool {
        std::mem::take(self) == SuppressionFlag::Armed
    }

    pub fn is_armed(&self) -> bool {
        *self == SuppressionFlag::Armed
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapFocus {
    pub center: Coordinates,
    pub zoom: u8,
    pub marker: Option<Coordinates>,
}

impl MapFocus {
    pub fn resolve(dropoff: Option<Coordinates>, pickup: Option<Coordinates>) -> Self {
        match dropoff.or(pickup) {
            Some(fix) => Self {
                center: fix,
                zoom: FIX_ZOOM,
                marker: Some(fix),
            },
            None => Self {
                center: DEFAULT_CENTER,
                zoom: FALLBACK_ZOOM,
                marker: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub pickup_delay: Duration,
    pub dropoff_delay: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            pickup_delay: config.pickup_debounce(),
            dropoff_delay: config.dropoff_debounce(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            pickup_delay: Duration::from_millis(500),
            dropoff_delay: Duration::from_millis(700),
        }
    }
}

/// What the dropoff looked like right after a click. The reverse lookup only
/// lands while all of it is unchanged.
struct ClickedPoint {
    epoch: u64,
    point: Coordinates,
    lat: String,
    lng: String,
    address: String,
}

#[derive(Clone)]
pub(crate) struct AddressSynchronizer {
    shared: SharedIntake,
    geocoder: GeocodingService,
    settings: SyncSettings,
    tasks: Debouncer<SyncTarget>,
    suppression: Arc<Mutex<SuppressionFlag>>,
    last_pickup: Arc<Mutex<Option<String>>>,
}

impl AddressSynchronizer {
    pub(crate) fn new(shared: SharedIntake, geocoder: GeocodingService, settings: SyncSettings) -> Self {
        Self {
            shared,
            geocoder,
            settings,
            tasks: Debouncer::new(),
            suppression: Arc::new(Mutex::new(SuppressionFlag::Idle)),
            last_pickup: Arc::new(Mutex::new(None)),
        }
    }

    /// Observes a change to a section's address. Sections without a synced
    /// address are ignored.
    pub(crate) fn address_changed(&self, section: Section) {
        match section {
            Section::PickupLocation => self.pickup_address_changed(),
            Section::DropoffLocation => self.dropoff_address_changed(),
            _ => {}
        }
    }

    /// Starts syncing a freshly installed record. Stored dropoff coordinates
    /// that already agree with a non-empty address are kept.
    pub(crate) fn record_installed(&self) {
        *self.last_pickup.lock() = None;
        self.pickup_address_changed();
        let has_fix = self.shared.read(|state| state.dropoff_coordinates().is_some());
        if !has_fix {
            self.dropoff_address_changed();
        }
    }

    /// Writes a clicked point into the dropoff coordinates and resolves its
    /// address in the background. Returns `false` when there is no record.
    pub(crate) fn map_click(&self, point: Coordinates) -> bool {
        if !point.is_finite() {
            return false;
        }
        let lat = point.lat.to_string();
        let lng = point.lng.to_string();
        let clicked = self.shared.update(|state, events| {
            let address = state.record.as_ref()?.dropoff_location.address.clone();
            state.write_field(Section::DropoffLocation, "lat", &lat, events);
            state.write_field(Section::DropoffLocation, "lng", &lng, events);
            Some(ClickedPoint {
                epoch: state.epoch,
                point,
                lat,
                lng,
                address,
            })
        });
        let Some(clicked) = clicked else {
            return false;
        };

        // The click supersedes any lookup still waiting on typed text.
        self.tasks.cancel(&SyncTarget::DropoffForward);
        let sync = self.clone();
        self.tasks
            .schedule(SyncTarget::DropoffReverse, Duration::ZERO, async move {
                sync.resolve_click(clicked).await;
            });
        true
    }

    pub(crate) fn reset(&self) {
        self.tasks.cancel_all();
        *self.suppression.lock() = SuppressionFlag::Idle;
        *self.last_pickup.lock() = None;
    }

    pub(crate) fn is_pending(&self, target: SyncTarget) -> bool {
        self.tasks.is_pending(&target)
    }

    fn pickup_address_changed(&self) {
        self.tasks.cancel(&SyncTarget::PickupForward);
        let Some((address, epoch, has_fix)) = self.shared.read(|state| {
            state.record.as_ref().map(|record| {
                (
                    record.pickup_location.address.trim().to_string(),
                    state.epoch,
                    state.pickup_fix.is_some(),
                )
            })
        }) else {
            return;
        };
        if address.is_empty() {
            return;
        }
        {
            let mut last = self.last_pickup.lock();
            if has_fix && last.as_deref() == Some(address.as_str()) {
                return;
            }
            *last = Some(address.clone());
        }

        let sync = self.clone();
        self.tasks.schedule(
            SyncTarget::PickupForward,
            self.settings.pickup_delay,
            async move { sync.resolve_pickup(epoch, address).await },
        );
    }

    fn dropoff_address_changed(&self) {
        self.tasks.cancel(&SyncTarget::DropoffForward);
        let Some((address, epoch)) = self.shared.read(|state| {
            state
                .record
                .as_ref()
                .map(|record| (record.dropoff_location.address.clone(), state.epoch))
        }) else {
            return;
        };

        if address.trim().is_empty() {
            self.shared.update(|state, events| {
                let has_text = state
                    .record
                    .as_ref()
                    .is_some_and(|record| record.dropoff_location.has_coordinate_text());
                if has_text {
                    state.write_field(Section::DropoffLocation, "lat", "", events);
                    state.write_field(Section::DropoffLocation, "lng", "", events);
                    debug!(target: "address_sync", "cleared coordinates of empty dropoff address");
                }
            });
            return;
        }

        if self.suppression.lock().consume() {
            debug!(target: "address_sync", "skipping lookup for reverse-geocoded address");
            return;
        }

        let sync = self.clone();
        self.tasks.schedule(
            SyncTarget::DropoffForward,
            self.settings.dropoff_delay,
            async move { sync.resolve_dropoff(epoch, address).await },
        );
    }

    async fn resolve_pickup(&self, epoch: u64, address: String) {
        let Some(point) = self.lookup(&address, "pickup").await else {
            return;
        };
        self.shared.update(|state, events| {
            let current = state
                .record
                .as_ref()
                .map(|record| record.pickup_location.address.trim());
            if state.epoch != epoch || current != Some(address.as_str()) {
                debug!(target: "address_sync", "dropping stale pickup lookup");
                return;
            }
            state.pickup_fix = Some(point);
            events.push(IntakeEvent::PickupLocated(point));
        });
    }

    async fn resolve_dropoff(&self, epoch: u64, address: String) {
        let Some(point) = self.lookup(&address, "dropoff").await else {
            return;
        };
        self.shared.update(|state, events| {
            let current = state
                .record
                .as_ref()
                .map(|record| record.dropoff_location.address.as_str());
            if state.epoch != epoch || current != Some(address.as_str()) {
                debug!(target: "address_sync", "dropping stale dropoff lookup");
                return;
            }
            state.write_field(Section::DropoffLocation, "lat", &point.lat.to_string(), events);
            state.write_field(Section::DropoffLocation, "lng", &point.lng.to_string(), events);
        });
    }

    async fn resolve_click(&self, clicked: ClickedPoint) {
        let point = clicked.point;
        let address = match self.geocoder.reverse(point).await {
            Ok(Some(address)) if !address.trim().is_empty() => address,
            Ok(_) => {
                debug!(target: "address_sync", lat = point.lat, lng = point.lng, "no address for point");
                return;
            }
            Err(err) => {
                warn!(target: "address_sync", ?err, "reverse geocode failed");
                return;
            }
        };

        let written = self.shared.update(|state, events| {
            let Some(dropoff) = state.record.as_ref().map(|record| &record.dropoff_location) else {
                return false;
            };
            if state.epoch != clicked.epoch
                || dropoff.lat != clicked.lat
                || dropoff.lng != clicked.lng
                || dropoff.address != clicked.address
            {
                debug!(target: "address_sync", "dropping stale reverse lookup");
                return false;
            }
            if dropoff.address == address {
                return false;
            }
            self.suppression.lock().arm();
            state.write_field(Section::DropoffLocation, "address", &address, events)
        });
        if written {
            self.address_changed(Section::DropoffLocation);
        }
    }

    async fn lookup(&self, address: &str, endpoint: &'static str) -> Option<Coordinates> {
        match self.geocoder.forward(address).await {
            Ok(Some(point)) => Some(point),
            Ok(None) => {
                debug!(target: "address_sync", endpoint, "no geocode match");
                None
            }
            Err(err) => {
                warn!(target: "address_sync", endpoint, ?err, "forward geocode failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn suppression_grants_exactly_one_cycle() {
        let mut flag = SuppressionFlag::default();
        assert!(!flag.consume());

        flag.arm();
        flag.arm();
        assert!(flag.is_armed());
        assert!(flag.consume());
        assert!(!flag.consume());
        assert_eq!(flag, SuppressionFlag::Idle);
    }

    #[test]
    fn map_focus_prefers_dropoff_then_pickup() {
        let dropoff = Coordinates::new(45.0, -73.0);
        let pickup = Coordinates::new(43.65, -79.38);

        let focus = MapFocus::resolve(Some(dropoff), Some(pickup));
        assert_eq!(focus.center, dropoff);
        assert_eq!(focus.zoom, 13);

        let focus = MapFocus::resolve(None, Some(pickup));
        assert_eq!(focus.marker, Some(pickup));

        let focus = MapFocus::resolve(None, None);
        assert_eq!(focus.center, DEFAULT_CENTER);
        assert_eq!(focus.zoom, 10);
        assert_eq!(focus.marker, None);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_last_schedule_fires() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for value in 1..=3 {
            let fired = Arc::clone(&fired);
            debouncer.schedule("dropoff", Duration::from_millis(700), async move {
                fired.store(value, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert!(debouncer.is_pending(&"dropoff"));

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert!(!debouncer.is_pending(&"dropoff"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_keys_never_fire() {
        let debouncer = Debouncer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for key in ["pickup", "dropoff"] {
            let fired = Arc::clone(&fired);
            debouncer.schedule(key, Duration::from_millis(500), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(debouncer.cancel(&"pickup"));
        assert!(!debouncer.cancel(&"pickup"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&fired);
        debouncer.schedule("dropoff", Duration::from_millis(500), async move {
            late.fetch_add(1, Ordering::SeqCst);
        });
        debouncer.cancel_all();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
