//! Wires one feed snapshot through reconciliation, trails and containment.

use crate::containment::{Containment, ContainmentMonitor, ZoneScope};
use crate::nearby::{NearbyProximityWatcher, OwnerGroup, ProximityEvent};
use crate::reconcile::{DeviceView, FeedUpdate, LiveStateReconciler, PositionSource, Tracker};
use crate::storage::LocalStore;
use crate::trail::PathAccumulator;
use crate::zone::Geofence;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    WentOnline { device_id: String, name: String },
    WentOffline { device_id: String, name: String },
    EnteredZone { device_id: String, name: String, zone: String },
    LeftZone { device_id: String, name: String, zone: String },
}

impl EngineEvent {
    pub fn device_id(&self) -> &str {
        match self {
            EngineEvent::WentOnline { device_id, .. }
            | EngineEvent::WentOffline { device_id, .. }
            | EngineEvent::EnteredZone { device_id, .. }
            | EngineEvent::LeftZone { device_id, .. } => device_id,
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::WentOnline { name, .. } => write!(f, "{} came online", name),
            EngineEvent::WentOffline { name, .. } => write!(f, "{} went offline", name),
            EngineEvent::EnteredZone { name, zone, .. } => write!(f, "{} entered {}", name, zone),
            EngineEvent::LeftZone { name, zone, .. } => write!(f, "{} left {}", name, zone),
        }
    }
}

/// Everything the view needs for one tracker after a pass.
#[derive(Clone, Debug)]
pub struct DeviceReport {
    pub view: DeviceView,
    pub containment: Containment,
    pub trail_len: usize,
}

#[derive(Clone, Debug)]
struct LastVerdict {
    online: bool,
    inside: Option<(String, String)>,
}

pub type Listener = Box<dyn FnMut(&EngineEvent)>;

pub struct Engine {
    reconciler: LiveStateReconciler,
    monitor: ContainmentMonitor,
    trails: PathAccumulator,
    nearby: NearbyProximityWatcher,
    zones: Vec<Geofence>,
    previous: HashMap<String, LastVerdict>,
    listener: Listener,
}

impl Engine {
    pub fn new(
        user_id: &str,
        heartbeat: Duration,
        scope: ZoneScope,
        store: LocalStore,
        listener: Listener,
    ) -> Self {
        Self {
            reconciler: LiveStateReconciler::new(heartbeat),
            monitor: ContainmentMonitor::new(scope),
            trails: PathAccumulator::new(store),
            nearby: NearbyProximityWatcher::new(user_id),
            zones: Vec::new(),
            previous: HashMap::new(),
            listener,
        }
    }

    pub fn zones(&self) -> &[Geofence] {
        &self.zones
    }

    /// Replace the zone set after any zone create/delete/reload.
    pub fn set_zones(&mut self, zones: Vec<Geofence>) {
        log::debug!("Engine now tracking {} zones", zones.len());
        self.zones = zones;
    }

    pub fn set_registry(&mut self, trackers: Vec<Tracker>) {
        self.nearby
            .set_own_devices(trackers.iter().map(|t| t.device_id.clone()));
        self.reconciler.set_registry(trackers);
    }

    pub fn set_visible(&mut self, ids: Option<BTreeSet<String>>) {
        self.reconciler.set_visible(ids);
    }

    /// Full pass for one `devices` snapshot.
    pub fn on_devices(&mut self, feed: &[FeedUpdate], now: DateTime<Utc>) -> Vec<DeviceReport> {
        let views = self.reconciler.apply(feed, now);
        self.reports(views)
    }

    /// Re-derive without new data, so heartbeat timeouts show up between
    /// feed messages.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<DeviceReport> {
        let views = self.reconciler.views(now);
        self.reports(views)
    }

    fn reports(&mut self, views: Vec<DeviceView>) -> Vec<DeviceReport> {
        views.into_iter().map(|view| self.report(view)).collect()
    }

    fn report(&mut self, view: DeviceView) -> DeviceReport {
        if let (Some(position), PositionSource::Live) = (view.position, view.source) {
            if let Err(e) = self.trails.record(&view.device_id, position) {
                log::error!("Could not persist trail for {}: {}", view.device_id, e);
            }
        }

        let containment = self
            .monitor
            .evaluate(&view.device_id, view.position, &self.zones);
        self.emit_transitions(&view, &containment);

        DeviceReport {
            trail_len: self.trails.points(&view.device_id).len(),
            view,
            containment,
        }
    }

    fn emit_transitions(&mut self, view: &DeviceView, containment: &Containment) {
        let inside = match containment {
            Containment::Inside { zone_id, zone_name } => Some((zone_id.clone(), zone_name.clone())),
            _ => None,
        };
        let current = LastVerdict { online: view.online, inside };
        let Some(prev) = self.previous.insert(view.device_id.clone(), current.clone()) else {
            return;
        };

        let id = view.device_id.clone();
        let name = view.name.clone();
        let mut events = Vec::new();

        match (prev.online, current.online) {
            (false, true) => events.push(EngineEvent::WentOnline { device_id: id.clone(), name: name.clone() }),
            (true, false) => events.push(EngineEvent::WentOffline { device_id: id.clone(), name: name.clone() }),
            _ => {}
        }

        let prev_zone = prev.inside.as_ref().map(|(zid, _)| zid);
        let cur_zone = current.inside.as_ref().map(|(zid, _)| zid);
        if prev_zone != cur_zone {
            if let Some((_, zone)) = prev.inside {
                events.push(EngineEvent::LeftZone { device_id: id.clone(), name: name.clone(), zone });
            }
            if let Some((_, zone)) = current.inside {
                events.push(EngineEvent::EnteredZone { device_id: id, name, zone });
            }
        }

        for event in &events {
            (self.listener)(event);
        }
    }

    pub fn on_nearby(&mut self, event: ProximityEvent) -> &[OwnerGroup] {
        self.nearby.handle(event)
    }

    pub fn nearby(&self) -> &[OwnerGroup] {
        self.nearby.latest()
    }

    pub fn clear_all_trails(&mut self) -> crate::error::Result<()> {
        self.trails.clear_all()
    }
}

/// Decode a `devices` payload, skipping entries that aren't objects.
pub fn decode_feed(data: Value) -> Vec<FeedUpdate> {
    let items = match data {
        Value::Array(items) => items,
        Value::Object(_) => vec![data],
        other => {
            log::warn!("Unexpected devices payload: {}", other);
            return Vec::new();
        }
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<FeedUpdate>(item) {
            Ok(update) => Some(update),
            Err(e) => {
                log::warn!("Skipping malformed device update: {}", e);
                None
            }
        })
        .collect()
}
