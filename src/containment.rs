//! Per-device containment against the active zone set.

use crate::geometry::LatLng;
use crate::zone::Geofence;
use serde::Deserialize;
use std::fmt;

/// Which zones a device is checked against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneScope {
    /// Only zones whose device list includes the device
    #[default]
    Associated,
    /// Every loaded zone
    All,
}

impl ZoneScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "associated" | "bound" => Some(ZoneScope::Associated),
            "all" | "global" => Some(ZoneScope::All),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Containment {
    Inside { zone_id: String, zone_name: String },
    Outside { distance_m: f64, nearest_zone_id: String },
    /// No candidate zones for this device
    NoZones,
    /// Position missing or not a valid coordinate
    NoFix,
}

impl Containment {
    pub fn is_inside(&self) -> bool {
        matches!(self, Containment::Inside { .. })
    }

    pub fn distance_outside(&self) -> Option<f64> {
        match self {
            Containment::Outside { distance_m, .. } => Some(*distance_m),
            _ => None,
        }
    }
}

impl fmt::Display for Containment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Containment::Inside { zone_name, .. } => write!(f, "inside {}", zone_name),
            Containment::Outside { distance_m, .. } => {
                if *distance_m >= 1000.0 {
                    write!(f, "{:.2} km outside", distance_m / 1000.0)
                } else {
                    write!(f, "{:.0} m outside", distance_m)
                }
            }
            Containment::NoZones => f.write_str("no zones"),
            Containment::NoFix => f.write_str("no fix"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ContainmentMonitor {
    scope: ZoneScope,
}

impl ContainmentMonitor {
    pub fn new(scope: ZoneScope) -> Self {
        Self { scope }
    }

    fn candidates<'a>(
        &self,
        device_id: &'a str,
        zones: &'a [Geofence],
    ) -> impl Iterator<Item = &'a Geofence> + 'a {
        let scope = self.scope;
        zones
            .iter()
            .filter(move |z| scope == ZoneScope::All || z.is_bound_to(device_id))
    }

    /// Inside on the first containing zone; otherwise the smallest distance
    /// to any candidate boundary.
    pub fn evaluate(&self, device_id: &str, position: Option<LatLng>, zones: &[Geofence]) -> Containment {
        let Some(position) = position.filter(LatLng::is_valid) else {
            return Containment::NoFix;
        };

        let mut nearest: Option<(f64, &Geofence)> = None;
        for zone in self.candidates(device_id, zones) {
            if zone.shape.contains(position) {
                return Containment::Inside {
                    zone_id: zone.id.clone(),
                    zone_name: zone.name.clone(),
                };
            }
            let d = zone.shape.boundary_distance(position);
            if nearest.map_or(true, |(best, _)| d < best) {
                nearest = Some((d, zone));
            }
        }

        match nearest {
            Some((distance_m, zone)) => Containment::Outside {
                distance_m: distance_m.max(0.0),
                nearest_zone_id: zone.id.clone(),
            },
            None => Containment::NoZones,
        }
    }
}
