//! Other users' pets reported within the proximity radius.

use crate::api::de;
use crate::geometry::LatLng;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NearbyPet {
    #[serde(rename = "deviceId", default, deserialize_with = "de::string")]
    pub device_id: Option<String>,
    #[serde(rename = "petName", default, deserialize_with = "de::string")]
    pub pet_name: Option<String>,
    #[serde(default, deserialize_with = "de::number")]
    pub lat: Option<f64>,
    #[serde(default, deserialize_with = "de::number")]
    pub lng: Option<f64>,
    #[serde(rename = "ownerId", default, deserialize_with = "de::string")]
    pub owner_id: Option<String>,
    #[serde(rename = "ownerName", default, deserialize_with = "de::string")]
    pub owner_name: Option<String>,
    /// Meters from the viewer's pet, when the server computed it
    #[serde(default, deserialize_with = "de::number")]
    pub distance: Option<f64>,
}

impl NearbyPet {
    pub fn position(&self) -> Option<LatLng> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(LatLng::new(lat, lng)).filter(LatLng::is_valid),
            _ => None,
        }
    }
}

/// A `nearby-pets` message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProximityEvent {
    Grouped {
        #[serde(rename = "involvedUsers", default, deserialize_with = "de::string_list")]
        involved_users: Vec<String>,
        /// Owner id to that owner's nearby pets
        #[serde(default)]
        owners: BTreeMap<String, Vec<NearbyPet>>,
    },
    Individual {
        #[serde(rename = "involvedUsers", default, deserialize_with = "de::string_list")]
        involved_users: Vec<String>,
        #[serde(default)]
        pets: Vec<NearbyPet>,
    },
}

impl ProximityEvent {
    pub fn involved_users(&self) -> &[String] {
        match self {
            ProximityEvent::Grouped { involved_users, .. }
            | ProximityEvent::Individual { involved_users, .. } => involved_users,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OwnerGroup {
    pub owner_id: String,
    pub owner_name: Option<String>,
    pub pets: Vec<NearbyPet>,
}

/// Keeps only the most recent event, grouped by owner, minus the viewer's
/// own pets.
pub struct NearbyProximityWatcher {
    user_id: String,
    own_devices: BTreeSet<String>,
    latest: Vec<OwnerGroup>,
}

impl NearbyProximityWatcher {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            own_devices: BTreeSet::new(),
            latest: Vec::new(),
        }
    }

    pub fn set_own_devices(&mut self, ids: impl IntoIterator<Item = String>) {
        self.own_devices = ids.into_iter().collect();
    }

    pub fn latest(&self) -> &[OwnerGroup] {
        &self.latest
    }

    fn is_own(&self, owner_id: &str, pet: &NearbyPet) -> bool {
        owner_id == self.user_id
            || pet
                .device_id
                .as_ref()
                .is_some_and(|id| self.own_devices.contains(id))
    }

    pub fn handle(&mut self, event: ProximityEvent) -> &[OwnerGroup] {
        log::debug!("Proximity event involving {} users", event.involved_users().len());
        let pets: Vec<(String, NearbyPet)> = match event {
            ProximityEvent::Grouped { owners, .. } => owners
                .into_iter()
                .flat_map(|(owner, pets)| pets.into_iter().map(move |p| (owner.clone(), p)))
                .collect(),
            ProximityEvent::Individual { pets, .. } => pets
                .into_iter()
                .filter_map(|p| match p.owner_id.clone() {
                    Some(owner) => Some((owner, p)),
                    None => {
                        log::warn!("Nearby pet {:?} has no owner id", p.device_id);
                        None
                    }
                })
                .collect(),
        };

        let mut grouped: BTreeMap<String, OwnerGroup> = BTreeMap::new();
        for (owner_id, pet) in pets {
            if self.is_own(&owner_id, &pet) {
                continue;
            }
            let group = grouped.entry(owner_id.clone()).or_insert_with(|| OwnerGroup {
                owner_id,
                owner_name: None,
                pets: Vec::new(),
            });
            if group.owner_name.is_none() {
                group.owner_name = pet.owner_name.clone();
            }
            group.pets.push(pet);
        }

        self.latest = grouped.into_values().collect();
        log::debug!("{} owners nearby", self.latest.len());
        &self.latest
    }
}
