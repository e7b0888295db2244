//! Merges the live device feed with the last-known cache and the saved
//! tracker registry into one view per visible tracker.
//!
//! Position priority: live fix (while online), then the last-known cache,
//! then the registry's `last_lat`/`last_lng`. Once any valid fix has been
//! seen a tracker never goes back to having no position.

use crate::api::{de, TrackerRecord};
use crate::geometry::LatLng;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};

pub const DEFAULT_HEARTBEAT_MS: i64 = 10_000;

/// One entry of a `devices` feed message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedUpdate {
    #[serde(rename = "deviceId", default, deserialize_with = "de::string")]
    pub device_id: Option<String>,
    #[serde(default, deserialize_with = "de::number")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "de::number")]
    pub lng: Option<f64>,
    #[serde(default, deserialize_with = "de::number")]
    pub battery: Option<f64>,
    #[serde(rename = "lastSeen", default, deserialize_with = "de::timestamp")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl FeedUpdate {
    /// `None` while the tracker is still waiting for its first fix.
    pub fn position(&self) -> Option<LatLng> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)).filter(LatLng::is_valid),
            _ => None,
        }
    }
}

/// Saved tracker from the user's registry. Descriptive fields are read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracker {
    pub device_id: String,
    pub name: String,
    pub pet_type: Option<String>,
    pub breed: Option<String>,
    pub image: Option<String>,
    pub last_position: Option<LatLng>,
    pub last_battery: Option<u8>,
}

impl Tracker {
    pub fn from_record(record: TrackerRecord) -> Option<Self> {
        let device_id = record.device_id.filter(|id| !id.trim().is_empty())?;
        let last_position = match (record.last_lat, record.last_lng) {
            (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)).filter(LatLng::is_valid),
            _ => None,
        };
        Some(Self {
            name: record.pet_name.unwrap_or_else(|| device_id.clone()),
            device_id,
            pet_type: record.pet_type,
            breed: record.pet_breed,
            image: record.pet_image,
            last_position,
            last_battery: record.last_battery.and_then(clamp_battery),
        })
    }
}

fn clamp_battery(raw: f64) -> Option<u8> {
    raw.is_finite().then(|| raw.round().clamp(0.0, 100.0) as u8)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PositionSource {
    Live,
    Cache,
    Registry,
    None,
}

impl PositionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSource::Live => "live",
            PositionSource::Cache => "cached",
            PositionSource::Registry => "saved",
            PositionSource::None => "-",
        }
    }
}

/// Unified per-tracker state handed to the view and the monitors.
#[derive(Debug, Clone)]
pub struct DeviceView {
    pub device_id: String,
    pub name: String,
    pub pet_type: Option<String>,
    pub breed: Option<String>,
    pub position: Option<LatLng>,
    pub source: PositionSource,
    pub battery: Option<u8>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: String,
}

/// Most recent valid fix retained for a device.
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    position: LatLng,
    battery: Option<u8>,
    seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct DeviceState {
    last_seen: Option<DateTime<Utc>>,
    online_since: Option<DateTime<Utc>>,
    live_position: Option<LatLng>,
    live_battery: Option<u8>,
}

pub struct LiveStateReconciler {
    heartbeat: Duration,
    registry: Vec<Tracker>,
    visible: Option<BTreeSet<String>>,
    states: HashMap<String, DeviceState>,
    cache: HashMap<String, Snapshot>,
}

impl LiveStateReconciler {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            heartbeat,
            registry: Vec::new(),
            visible: None,
            states: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    pub fn set_registry(&mut self, trackers: Vec<Tracker>) {
        self.registry = trackers;
    }

    /// Restrict output to these ids. `None` shows every saved tracker.
    pub fn set_visible(&mut self, ids: Option<BTreeSet<String>>) {
        self.visible = ids;
    }

    fn is_online(&self, last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        last_seen.is_some_and(|seen| now - seen <= self.heartbeat)
    }

    /// Fold one feed snapshot into the state, in message order.
    pub fn ingest(&mut self, feed: &[FeedUpdate], now: DateTime<Utc>) {
        for update in feed {
            let Some(device_id) = update.device_id.as_deref() else {
                log::warn!("Feed update without deviceId skipped");
                continue;
            };
            let position = update.position();
            if position.is_none() && update.lat.is_some() {
                log::warn!("Device {} sent invalid coordinates {:?},{:?}", device_id, update.lat, update.lng);
            }
            let battery = update.battery.and_then(clamp_battery);

            let online = self.is_online(update.last_seen, now);
            let state = self.states.entry(device_id.to_string()).or_default();
            // Out-of-order updates never move the live state backwards
            if update.last_seen >= state.last_seen {
                state.last_seen = update.last_seen;
                state.live_position = position;
                state.live_battery = battery;
            }
            if online && state.online_since.is_none() {
                state.online_since = Some(now);
            }

            if let Some(position) = position {
                let stale = self
                    .cache
                    .get(device_id)
                    .is_some_and(|c| c.seen_at.is_some() && c.seen_at > update.last_seen);
                if !stale {
                    self.cache.insert(
                        device_id.to_string(),
                        Snapshot { position, battery, seen_at: update.last_seen },
                    );
                }
            }
        }
    }

    /// Ingest a feed snapshot and derive the views.
    pub fn apply(&mut self, feed: &[FeedUpdate], now: DateTime<Utc>) -> Vec<DeviceView> {
        self.ingest(feed, now);
        self.views(now)
    }

    /// Derive views for visible saved trackers. Also expires devices whose
    /// heartbeat has lapsed, so callers run this on a timer as well.
    pub fn views(&mut self, now: DateTime<Utc>) -> Vec<DeviceView> {
        let heartbeat = self.heartbeat;
        for state in self.states.values_mut() {
            let online = state.last_seen.is_some_and(|seen| now - seen <= heartbeat);
            if !online {
                state.online_since = None;
            }
        }

        self.registry
            .iter()
            .filter(|t| self.visible.as_ref().map_or(true, |v| v.contains(&t.device_id)))
            .map(|tracker| self.view_for(tracker, now))
            .collect()
    }

    fn view_for(&self, tracker: &Tracker, now: DateTime<Utc>) -> DeviceView {
        let state = self.states.get(&tracker.device_id);
        let cached = self.cache.get(&tracker.device_id);
        let last_seen = state.and_then(|s| s.last_seen).or_else(|| cached.and_then(|c| c.seen_at));
        let online = self.is_online(state.and_then(|s| s.last_seen), now);

        let live = state.filter(|_| online);
        let (position, source) = if let Some(p) = live.and_then(|s| s.live_position) {
            (Some(p), PositionSource::Live)
        } else if let Some(c) = cached {
            (Some(c.position), PositionSource::Cache)
        } else if let Some(p) = tracker.last_position {
            (Some(p), PositionSource::Registry)
        } else {
            (None, PositionSource::None)
        };

        let battery = live
            .and_then(|s| s.live_battery)
            .or_else(|| cached.and_then(|c| c.battery))
            .or(tracker.last_battery);

        let status = if online {
            let since = state.and_then(|s| s.online_since).unwrap_or(now);
            format!("Online: {}", format_elapsed(now - since))
        } else {
            match last_seen {
                Some(seen) => format!("Offline: {}", format_elapsed(now - seen)),
                None => "Offline".to_string(),
            }
        };

        DeviceView {
            device_id: tracker.device_id.clone(),
            name: tracker.name.clone(),
            pet_type: tracker.pet_type.clone(),
            breed: tracker.breed.clone(),
            position,
            source,
            battery,
            online,
            last_seen,
            status,
        }
    }
}

/// `Ns`, `Nm`, `Nh` or `Nd`, using the largest unit that is at least 1.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else if secs < 86_400 {
        format!("{}h", secs / 3600)
    } else {
        format!("{}d", secs / 86_400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn tracker(id: &str, last: Option<(f64, f64)>) -> Tracker {
        Tracker {
            device_id: id.into(),
            name: format!("pet {}", id),
            pet_type: Some("Dog".into()),
            breed: None,
            image: None,
            last_position: last.map(|(lat, lng)| LatLng::new(lat, lng)),
            last_battery: Some(40),
        }
    }

    fn update(id: &str, pos: Option<(f64, f64)>, battery: f64, seen: DateTime<Utc>) -> FeedUpdate {
        FeedUpdate {
            device_id: Some(id.into()),
            lat: pos.map(|p| p.0),
            lng: pos.map(|p| p.1),
            battery: Some(battery),
            last_seen: Some(seen),
        }
    }

    fn reconciler(trackers: Vec<Tracker>) -> LiveStateReconciler {
        let mut r = LiveStateReconciler::new(Duration::milliseconds(DEFAULT_HEARTBEAT_MS));
        r.set_registry(trackers);
        r
    }

    #[test]
    fn fresh_update_is_online_with_live_position() {
        let mut r = reconciler(vec![tracker("d1", None)]);
        let views = r.apply(&[update("d1", Some((10.0, 124.0)), 88.0, t0())], t0());

        assert_eq!(views.len(), 1);
        let v = &views[0];
        assert!(v.online);
        assert_eq!(v.source, PositionSource::Live);
        assert_eq!(v.position, Some(LatLng::new(10.0, 124.0)));
        assert_eq!(v.battery, Some(88));
        assert_eq!(v.status, "Online: 0s");
    }

    #[test]
    fn stale_update_is_offline_and_uses_cache() {
        let mut r = reconciler(vec![tracker("d1", Some((1.0, 1.0)))]);
        let first = t0() - Duration::seconds(30);
        r.apply(&[update("d1", Some((10.0, 124.0)), 70.0, first)], first);

        let now = t0();
        let seen = now - Duration::milliseconds(15_000);
        let views = r.apply(&[update("d1", None, 65.0, seen)], now);
        let v = &views[0];

        assert!(!v.online);
        assert_eq!(v.source, PositionSource::Cache);
        assert_eq!(v.position, Some(LatLng::new(10.0, 124.0)));
        assert_eq!(v.battery, Some(70));
        assert_eq!(v.status, "Offline: 15s");
    }

    #[test]
    fn silent_tracker_falls_back_to_registry() {
        let mut r = reconciler(vec![tracker("d1", Some((8.0, 123.0))), tracker("d2", None)]);
        let views = r.views(t0());

        assert_eq!(views[0].source, PositionSource::Registry);
        assert_eq!(views[0].position, Some(LatLng::new(8.0, 123.0)));
        assert_eq!(views[0].battery, Some(40));
        assert!(!views[0].online);
        assert_eq!(views[0].status, "Offline");

        assert_eq!(views[1].source, PositionSource::None);
        assert_eq!(views[1].position, None);
    }

    #[test]
    fn heartbeat_expiry_and_recovery() {
        let mut r = reconciler(vec![tracker("d1", None)]);
        r.apply(&[update("d1", Some((10.0, 124.0)), 50.0, t0())], t0());

        let later = t0() + Duration::seconds(11);
        let v = &r.views(later)[0];
        assert!(!v.online);
        assert_eq!(v.position, Some(LatLng::new(10.0, 124.0)));
        assert_eq!(v.status, "Offline: 11s");

        let views = r.apply(&[update("d1", Some((10.1, 124.0)), 49.0, later)], later);
        assert!(views[0].online);
        assert_eq!(views[0].position, Some(LatLng::new(10.1, 124.0)));
    }

    #[test]
    fn online_duration_counts_from_first_seen() {
        let mut r = reconciler(vec![tracker("d1", None)]);
        r.apply(&[update("d1", Some((10.0, 124.0)), 50.0, t0())], t0());
        let now = t0() + Duration::seconds(125);
        let views = r.apply(&[update("d1", Some((10.0, 124.0)), 50.0, now)], now);
        assert_eq!(views[0].status, "Online: 2m");
    }

    #[test]
    fn unknown_and_hidden_devices_are_not_emitted() {
        let mut r = reconciler(vec![tracker("d1", None), tracker("d2", None)]);
        r.set_visible(Some(BTreeSet::from(["d2".to_string()])));
        let views = r.apply(
            &[
                update("stranger", Some((1.0, 1.0)), 10.0, t0()),
                update("d1", Some((2.0, 2.0)), 10.0, t0()),
            ],
            t0(),
        );
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].device_id, "d2");
    }

    #[test]
    fn older_update_does_not_replace_cache() {
        let mut r = reconciler(vec![tracker("d1", None)]);
        r.ingest(&[update("d1", Some((5.0, 5.0)), 10.0, t0())], t0());
        let old = t0() - Duration::seconds(60);
        r.ingest(&[update("d1", Some((6.0, 6.0)), 10.0, old)], t0() + Duration::seconds(20));

        let v = &r.views(t0() + Duration::seconds(20))[0];
        assert_eq!(v.position, Some(LatLng::new(5.0, 5.0)));
        assert_eq!(v.last_seen, Some(t0()));
    }

    #[test]
    fn invalid_coordinates_never_reach_the_view() {
        let mut r = reconciler(vec![tracker("d1", Some((3.0, 3.0)))]);
        let mut bad = update("d1", None, 10.0, t0());
        bad.lat = Some(f64::NAN);
        bad.lng = Some(124.0);
        let v = &r.apply(&[bad], t0())[0];
        assert!(v.online);
        assert_eq!(v.position, Some(LatLng::new(3.0, 3.0)));
        assert_eq!(v.source, PositionSource::Registry);
    }

    #[test]
    fn feed_update_parses_wire_shape() {
        let u: FeedUpdate = serde_json::from_str(
            r#"{"deviceId": 17, "lat": "10.5", "lng": 124.25, "battery": 99.6, "lastSeen": 1748779200000}"#,
        )
        .unwrap();
        assert_eq!(u.device_id.as_deref(), Some("17"));
        assert_eq!(u.position(), Some(LatLng::new(10.5, 124.25)));
        assert_eq!(u.battery.and_then(clamp_battery), Some(100));
        assert_eq!(u.last_seen, Some(t0()));

        let pending: FeedUpdate =
            serde_json::from_str(r#"{"deviceId": "d9", "lat": "pending", "lng": null}"#).unwrap();
        assert_eq!(pending.position(), None);
    }

    #[test]
    fn tracker_from_record() {
        let t = Tracker::from_record(TrackerRecord {
            device_id: Some("d1".into()),
            pet_name: Some("Rex".into()),
            last_lat: Some(10.0),
            last_lng: Some(124.0),
            last_battery: Some(120.0),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(t.name, "Rex");
        assert_eq!(t.last_position, Some(LatLng::new(10.0, 124.0)));
        assert_eq!(t.last_battery, Some(100));
        assert!(Tracker::from_record(TrackerRecord::default()).is_none());
    }

    #[test]
    fn elapsed_formatting() {
        assert_eq!(format_elapsed(Duration::seconds(0)), "0s");
        assert_eq!(format_elapsed(Duration::seconds(59)), "59s");
        assert_eq!(format_elapsed(Duration::seconds(60)), "1m");
        assert_eq!(format_elapsed(Duration::seconds(3599)), "59m");
        assert_eq!(format_elapsed(Duration::seconds(7200)), "2h");
        assert_eq!(format_elapsed(Duration::days(3)), "3d");
        assert_eq!(format_elapsed(Duration::seconds(-5)), "0s");
    }
}
