//! Geofence set for one user: load with dedup, create, delete.

use crate::api::{Backend, CreateZoneRequest};
use crate::error::{Error, Result};
use crate::geometry::LatLng;
use crate::zone::{encode_poly_rect, Geofence, ZoneDraft, ZoneShape};

/// A shape as drawn on the map. `zone_id` is `None` until the server has
/// accepted it.
#[derive(Clone, Debug)]
pub struct DrawnShape {
    pub zone_id: Option<String>,
    pub shape: ZoneShape,
}

pub struct GeofenceStore<B: Backend> {
    backend: B,
    user_id: String,
    zones: Vec<Geofence>,
    drawn: Vec<DrawnShape>,
}

impl<B: Backend> GeofenceStore<B> {
    pub fn new(backend: B, user_id: &str) -> Self {
        Self {
            backend,
            user_id: user_id.to_string(),
            zones: Vec::new(),
            drawn: Vec::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn active_zones(&self) -> &[Geofence] {
        &self.zones
    }

    pub fn drawn_shapes(&self) -> &[DrawnShape] {
        &self.drawn
    }

    pub fn get(&self, zone_id: &str) -> Result<&Geofence> {
        self.zones
            .iter()
            .find(|z| z.has_record(zone_id))
            .ok_or_else(|| Error::ZoneNotFound(zone_id.to_string()))
    }

    /// Replace the zone set with the server's, dropping invalid records and
    /// merging geometric duplicates.
    pub fn load(&mut self) -> Result<&[Geofence]> {
        let records = self.backend.fetch_zones(&self.user_id)?;
        let total = records.len();

        let mut zones: Vec<Geofence> = Vec::with_capacity(total);
        for record in records {
            let id = record.geofence_id.clone().unwrap_or_default();
            match Geofence::from_record(record) {
                Ok(zone) => accept_zone(&mut zones, zone),
                Err(e) => log::warn!("Discarding geofence {:?}: {}", id, e),
            }
        }
        log::info!("Loaded {} geofences ({} records)", zones.len(), total);

        self.drawn = zones
            .iter()
            .map(|z| DrawnShape { zone_id: Some(z.id.clone()), shape: z.shape.clone() })
            .collect();
        self.zones = zones;
        Ok(&self.zones)
    }

    /// Persist a drawn shape. The shape is shown provisionally while the
    /// request runs and removed again if it fails.
    pub fn create(&mut self, draft: ZoneDraft) -> Result<Geofence> {
        draft.shape.validate()?;
        if draft.device_ids.is_empty() {
            return Err(Error::Validation("select at least one device for the zone".into()));
        }
        if draft.name.trim().is_empty() {
            return Err(Error::Validation("zone name is empty".into()));
        }

        self.drawn.push(DrawnShape { zone_id: None, shape: draft.shape.clone() });
        let slot = self.drawn.len() - 1;

        let request = build_request(&self.user_id, &draft);
        let zone_id = match self.backend.create_zone(&request) {
            Ok(created) => created.geofence_id,
            Err(e) => {
                self.drawn.remove(slot);
                log::error!("Saving geofence {:?} failed: {}", draft.name, e);
                return Err(e);
            }
        };
        let Some(zone_id) = zone_id else {
            self.drawn.remove(slot);
            return Err(Error::Validation("server did not return a geofence id".into()));
        };

        self.drawn[slot].zone_id = Some(zone_id.clone());
        let device_names = if draft.device_names.len() == draft.device_ids.len() {
            draft.device_names
        } else {
            draft.device_ids.clone()
        };
        let zone = Geofence {
            record_ids: vec![zone_id.clone()],
            id: zone_id,
            name: draft.name,
            shape: draft.shape,
            device_ids: draft.device_ids,
            device_names,
        };
        log::info!("Created geofence {} ({})", zone.id, zone.shape.kind());
        accept_zone(&mut self.zones, zone.clone());
        Ok(zone)
    }

    /// Delete zones on the server, then drop them and their drawings locally.
    /// An id of a merged zone deletes every server record behind it. Stops at
    /// the first server failure; records deleted before it stay deleted.
    pub fn delete(&mut self, zone_ids: &[String], device_ids: &[String]) -> Result<()> {
        let mut done: Vec<String> = Vec::new();
        for zone_id in zone_ids {
            if done.contains(zone_id) {
                continue;
            }
            let index = self.zones.iter().position(|z| z.has_record(zone_id));
            let records = match index {
                Some(i) => self.zones[i].record_ids.clone(),
                None => vec![zone_id.clone()],
            };

            for record_id in &records {
                if let Err(e) = self.backend.delete_zone(record_id, device_ids) {
                    if let Some(i) = index {
                        self.forget_records(i, &done);
                    }
                    return Err(e);
                }
                log::info!("Deleted geofence {}", record_id);
                done.push(record_id.clone());
            }

            let removed = index.map(|i| self.zones.remove(i));
            self.remove_drawn(&records, removed.as_ref().map(|z| &z.shape));
        }
        Ok(())
    }

    /// Drop records already deleted on the server from a partly deleted zone.
    fn forget_records(&mut self, index: usize, deleted: &[String]) {
        let zone = &mut self.zones[index];
        zone.record_ids.retain(|id| !deleted.contains(id));
        let Some(primary) = zone.record_ids.first().cloned() else { return };
        zone.id = primary.clone();
        for drawing in &mut self.drawn {
            if drawing.zone_id.as_ref().is_some_and(|id| deleted.contains(id)) {
                drawing.zone_id = Some(primary.clone());
            }
        }
    }

    /// Id match first, then the first drawing with the same geometry.
    fn remove_drawn(&mut self, record_ids: &[String], shape: Option<&ZoneShape>) {
        let before = self.drawn.len();
        self.drawn
            .retain(|d| !d.zone_id.as_ref().is_some_and(|id| record_ids.contains(id)));
        if self.drawn.len() != before {
            return;
        }

        let Some(shape) = shape else { return };
        if let Some(i) = self.drawn.iter().position(|d| d.shape.same_geometry(shape)) {
            log::debug!("Removing drawing for {:?} by geometry match", record_ids);
            self.drawn.remove(i);
        }
    }

    /// Zones bound to the device.
    pub fn zones_for_device<'a>(&'a self, device_id: &'a str) -> impl Iterator<Item = &'a Geofence> {
        self.zones.iter().filter(move |z| z.is_bound_to(device_id))
    }
}

/// Merge into the first geometrically equal zone, or append.
fn accept_zone(zones: &mut Vec<Geofence>, zone: Geofence) {
    match zones.iter_mut().find(|z| z.shape.same_geometry(&zone.shape)) {
        Some(existing) => {
            log::debug!("Merging duplicate geofence {} into {}", zone.id, existing.id);
            existing.absorb(&zone);
        }
        None => zones.push(zone),
    }
}

fn build_request(user_id: &str, draft: &ZoneDraft) -> CreateZoneRequest {
    let mut request = CreateZoneRequest {
        user_id: user_id.to_string(),
        device_ids: draft.device_ids.clone(),
        geofence_name: draft.name.trim().to_string(),
        kind: draft.shape.kind().as_str().to_string(),
        center_lat: None,
        center_lng: None,
        radius: None,
        poly_rect: None,
    };
    match &draft.shape {
        ZoneShape::Circle { center: LatLng { lat, lng }, radius_m } => {
            request.center_lat = Some(*lat);
            request.center_lng = Some(*lng);
            request.radius = Some(*radius_m);
        }
        ZoneShape::Polygon { vertices } | ZoneShape::Rectangle { vertices } => {
            request.poly_rect = Some(encode_poly_rect(vertices));
        }
    }
    request
}
