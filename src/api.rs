//! REST client for the tracker backend.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Zone row as returned by `GET /api/geofences/{userId}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ZoneRecord {
    #[serde(rename = "type", default, deserialize_with = "de::string")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "de::number")]
    pub center_lat: Option<f64>,
    #[serde(default, deserialize_with = "de::number")]
    pub center_lng: Option<f64>,
    #[serde(default, deserialize_with = "de::number")]
    pub radius: Option<f64>,
    #[serde(default, deserialize_with = "de::json_text")]
    pub poly_rect: Option<String>,
    #[serde(rename = "deviceIds", default, deserialize_with = "de::string_list")]
    pub device_ids: Vec<String>,
    #[serde(rename = "deviceNames", default, deserialize_with = "de::string_list")]
    pub device_names: Vec<String>,
    #[serde(default, deserialize_with = "de::string")]
    pub geofence_id: Option<String>,
    #[serde(default, deserialize_with = "de::string")]
    pub geofence_name: Option<String>,
}

/// Saved tracker row from `GET /api/trackers/{userId}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackerRecord {
    #[serde(default, deserialize_with = "de::string")]
    pub device_id: Option<String>,
    #[serde(default, deserialize_with = "de::string")]
    pub pet_name: Option<String>,
    #[serde(default, deserialize_with = "de::string")]
    pub pet_type: Option<String>,
    #[serde(default, deserialize_with = "de::string")]
    pub pet_breed: Option<String>,
    #[serde(default, deserialize_with = "de::string")]
    pub pet_image: Option<String>,
    #[serde(default, deserialize_with = "de::number")]
    pub last_lat: Option<f64>,
    #[serde(default, deserialize_with = "de::number")]
    pub last_lng: Option<f64>,
    #[serde(default, deserialize_with = "de::number")]
    pub last_battery: Option<f64>,
}

/// Body of `POST /api/geofences`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateZoneRequest {
    pub user_id: String,
    pub device_ids: Vec<String>,
    pub geofence_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center_lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub center_lng: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poly_rect: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedZone {
    #[serde(default, deserialize_with = "de::string")]
    pub geofence_id: Option<String>,
}

/// Everything the engine needs from the server.
pub trait Backend {
    fn fetch_zones(&self, user_id: &str) -> Result<Vec<ZoneRecord>>;
    fn create_zone(&self, request: &CreateZoneRequest) -> Result<CreatedZone>;
    fn delete_zone(&self, zone_id: &str, device_ids: &[String]) -> Result<()>;
    fn fetch_trackers(&self, user_id: &str) -> Result<Vec<TrackerRecord>>;
}

pub struct HttpBackend {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch an array endpoint and decode each row on its own, so one bad row
    /// doesn't sink the whole response.
    fn fetch_rows<T: serde::de::DeserializeOwned>(&self, path: &str, what: &str) -> Result<Vec<T>> {
        let url = self.url(path);
        log::debug!("GET {}", url);
        let rows: Vec<Value> = self.agent.get(&url).call()?.into_json()?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match serde_json::from_value::<T>(row) {
                Ok(parsed) => Some(parsed),
                Err(e) => {
                    log::warn!("Skipping malformed {} record: {}", what, e);
                    None
                }
            })
            .collect())
    }
}

impl Backend for HttpBackend {
    fn fetch_zones(&self, user_id: &str) -> Result<Vec<ZoneRecord>> {
        self.fetch_rows(&format!("/api/geofences/{}", urlencoding::encode(user_id)), "geofence")
    }

    fn create_zone(&self, request: &CreateZoneRequest) -> Result<CreatedZone> {
        let url = self.url("/api/geofences");
        log::debug!("POST {} ({} {})", url, request.kind, request.geofence_name);
        let created: CreatedZone = self.agent.post(&url).send_json(request)?.into_json()?;
        Ok(created)
    }

    fn delete_zone(&self, zone_id: &str, device_ids: &[String]) -> Result<()> {
        let ids: Vec<String> = device_ids
            .iter()
            .map(|id| urlencoding::encode(id).into_owned())
            .collect();
        let url = self.url(&format!(
            "/api/geofences/delete/{}?deviceIds={}",
            urlencoding::encode(zone_id),
            ids.join(",")
        ));
        log::debug!("DELETE {}", url);
        self.agent.delete(&url).call()?;
        Ok(())
    }

    fn fetch_trackers(&self, user_id: &str) -> Result<Vec<TrackerRecord>> {
        self.fetch_rows(&format!("/api/trackers/{}", urlencoding::encode(user_id)), "tracker")
    }
}

/// Network failure check used by callers deciding whether to retry later.
pub fn is_transient(err: &Error) -> bool {
    matches!(err, Error::Network(_)) || matches!(err, Error::Http { status, .. } if *status >= 500)
}

/// Lenient field decoders. The backend mixes numbers, numeric strings and
/// nulls for the same columns.
pub(crate) mod de {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(scalar_to_string(Value::deserialize(d)?))
    }

    pub fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => items.into_iter().filter_map(scalar_to_string).collect(),
            Value::String(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        })
    }

    /// Keeps JSON-in-a-string as is and re-encodes a nested array.
    pub fn json_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => Some(s),
            v @ Value::Array(_) => Some(v.to_string()),
            _ => None,
        })
    }

    /// Epoch milliseconds (number or numeric string) or an RFC 3339 string.
    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .and_then(DateTime::from_timestamp_millis),
            Value::String(s) => match s.trim().parse::<i64>() {
                Ok(ms) => DateTime::from_timestamp_millis(ms),
                Err(_) => DateTime::parse_from_rfc3339(s.trim())
                    .ok()
                    .map(|t| t.with_timezone(&Utc)),
            },
            _ => None,
        })
    }

    fn scalar_to_string(v: Value) -> Option<String> {
        match v {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn zone_record_accepts_mixed_types() {
        let record: ZoneRecord = serde_json::from_value(json!({
            "type": "Circle",
            "center_lat": "8.090881",
            "center_lng": 123.488679,
            "radius": "100",
            "poly_rect": null,
            "deviceIds": ["d1", 42],
            "deviceNames": ["Rex"],
            "geofence_id": 7,
            "geofence_name": "Yard"
        }))
        .unwrap();

        assert_eq!(record.kind.as_deref(), Some("Circle"));
        assert_eq!(record.center_lat, Some(8.090881));
        assert_eq!(record.radius, Some(100.0));
        assert_eq!(record.poly_rect, None);
        assert_eq!(record.device_ids, vec!["d1", "42"]);
        assert_eq!(record.geofence_id.as_deref(), Some("7"));
    }

    #[test]
    fn zone_record_keeps_poly_rect_text() {
        let record: ZoneRecord = serde_json::from_value(json!({
            "type": "Polygon",
            "poly_rect": [[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]],
        }))
        .unwrap();
        assert_eq!(record.poly_rect.as_deref(), Some("[[1.0,2.0],[3.0,4.0],[5.0,6.0]]"));
        assert!(record.device_ids.is_empty());
    }

    #[test]
    fn create_request_omits_unused_fields() {
        let request = CreateZoneRequest {
            user_id: "u1".into(),
            device_ids: vec!["d1".into()],
            geofence_name: "Park".into(),
            kind: "Polygon".into(),
            center_lat: None,
            center_lng: None,
            radius: None,
            poly_rect: Some("[[0,0],[0,1],[1,1]]".into()),
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["type"], "Polygon");
        assert!(body.get("radius").is_none());
        assert_eq!(body["poly_rect"], "[[0,0],[0,1],[1,1]]");
    }

    #[test]
    fn transient_errors() {
        assert!(is_transient(&Error::Network("reset".into())));
        assert!(is_transient(&Error::Http { status: 503, body: String::new() }));
        assert!(!is_transient(&Error::Http { status: 404, body: String::new() }));
    }
}
