//! Geofence domain model.
//!
//! Shapes are plain data. Whatever draws them on screen keeps its own handle
//! and refers back to the zone by id, never the other way around.

use crate::api::ZoneRecord;
use crate::error::{Error, Result};
use crate::geometry::{self, LatLng, RADIUS_TOLERANCE_M};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneKind {
    Circle,
    Polygon,
    Rectangle,
}

impl ZoneKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "circle" => Some(ZoneKind::Circle),
            "polygon" => Some(ZoneKind::Polygon),
            "rectangle" | "rect" => Some(ZoneKind::Rectangle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::Circle => "Circle",
            ZoneKind::Polygon => "Polygon",
            ZoneKind::Rectangle => "Rectangle",
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geometry of a zone. Immutable once the zone exists.
#[derive(Clone, Debug, PartialEq)]
pub enum ZoneShape {
    Circle { center: LatLng, radius_m: f64 },
    Polygon { vertices: Vec<LatLng> },
    Rectangle { vertices: Vec<LatLng> },
}

impl ZoneShape {
    pub fn kind(&self) -> ZoneKind {
        match self {
            ZoneShape::Circle { .. } => ZoneKind::Circle,
            ZoneShape::Polygon { .. } => ZoneKind::Polygon,
            ZoneShape::Rectangle { .. } => ZoneKind::Rectangle,
        }
    }

    pub fn vertices(&self) -> Option<&[LatLng]> {
        match self {
            ZoneShape::Circle { .. } => None,
            ZoneShape::Polygon { vertices } | ZoneShape::Rectangle { vertices } => Some(vertices),
        }
    }

    pub fn contains(&self, point: LatLng) -> bool {
        match self {
            ZoneShape::Circle { center, radius_m } => {
                geometry::point_in_circle(point, *center, *radius_m)
            }
            ZoneShape::Polygon { vertices } | ZoneShape::Rectangle { vertices } => {
                geometry::point_in_polygon(point, vertices)
            }
        }
    }

    /// Meters from `point` to the nearest edge of the shape.
    pub fn boundary_distance(&self, point: LatLng) -> f64 {
        match self {
            ZoneShape::Circle { center, radius_m } => {
                geometry::distance_to_circle_boundary(point, *center, *radius_m)
            }
            ZoneShape::Polygon { vertices } | ZoneShape::Rectangle { vertices } => {
                geometry::distance_to_polygon_boundary(point, vertices)
            }
        }
    }

    /// Tolerant geometry match. Polygons and rectangles compare vertex by
    /// vertex in order, so a rotated vertex list is a different zone.
    pub fn same_geometry(&self, other: &ZoneShape) -> bool {
        match (self, other) {
            (
                ZoneShape::Circle { center: c1, radius_m: r1 },
                ZoneShape::Circle { center: c2, radius_m: r2 },
            ) => c1.approx_eq(c2) && (r1 - r2).abs() <= RADIUS_TOLERANCE_M,
            (a, b) if a.kind() != b.kind() => false,
            (a, b) => match (a.vertices(), b.vertices()) {
                (Some(va), Some(vb)) => {
                    va.len() == vb.len() && va.iter().zip(vb).all(|(p, q)| p.approx_eq(q))
                }
                _ => false,
            },
        }
    }

    /// Checks what the server would otherwise reject: finite coordinates,
    /// positive radius, at least three vertices.
    pub fn validate(&self) -> Result<()> {
        match self {
            ZoneShape::Circle { center, radius_m } => {
                if !center.is_valid() {
                    return Err(Error::Validation(format!(
                        "circle center {},{} is not a valid coordinate",
                        center.lat, center.lng
                    )));
                }
                if !radius_m.is_finite() || *radius_m <= 0.0 {
                    return Err(Error::Validation(format!(
                        "circle radius must be positive, got {}",
                        radius_m
                    )));
                }
            }
            ZoneShape::Polygon { vertices } | ZoneShape::Rectangle { vertices } => {
                let valid = vertices.iter().filter(|v| v.is_valid()).count();
                if valid != vertices.len() {
                    return Err(Error::Validation("polygon has invalid vertices".into()));
                }
                if valid < 3 {
                    return Err(Error::Validation(format!(
                        "polygon needs at least 3 vertices, got {}",
                        valid
                    )));
                }
            }
        }
        Ok(())
    }

    /// `LAT,LNG,RADIUS`
    pub fn parse_circle(s: &str) -> Result<Self> {
        let nums = parse_numbers(s, ',')?;
        let [lat, lng, radius_m] = nums[..] else {
            return Err(Error::Validation(format!(
                "circle expects LAT,LNG,RADIUS, got {:?}",
                s
            )));
        };
        let shape = ZoneShape::Circle { center: LatLng::new(lat, lng), radius_m };
        shape.validate()?;
        Ok(shape)
    }

    /// `LAT,LNG;LAT,LNG;...`
    pub fn parse_polygon(s: &str) -> Result<Self> {
        let vertices = s
            .split(';')
            .filter(|pair| !pair.trim().is_empty())
            .map(parse_pair)
            .collect::<Result<Vec<_>>>()?;
        let shape = ZoneShape::Polygon { vertices };
        shape.validate()?;
        Ok(shape)
    }

    /// Two opposite corners `LAT,LNG;LAT,LNG`, expanded to four vertices.
    pub fn parse_rectangle(s: &str) -> Result<Self> {
        let corners = s
            .split(';')
            .filter(|pair| !pair.trim().is_empty())
            .map(parse_pair)
            .collect::<Result<Vec<_>>>()?;
        let [a, b] = corners[..] else {
            return Err(Error::Validation(format!(
                "rectangle expects two corners LAT,LNG;LAT,LNG, got {:?}",
                s
            )));
        };
        let (south, north) = (a.lat.min(b.lat), a.lat.max(b.lat));
        let (west, east) = (a.lng.min(b.lng), a.lng.max(b.lng));
        let shape = ZoneShape::Rectangle {
            vertices: vec![
                LatLng::new(south, west),
                LatLng::new(south, east),
                LatLng::new(north, east),
                LatLng::new(north, west),
            ],
        };
        shape.validate()?;
        Ok(shape)
    }
}

fn parse_numbers(s: &str, sep: char) -> Result<Vec<f64>> {
    s.split(sep)
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| Error::Validation(format!("{:?} is not a number", part.trim())))
        })
        .collect()
}

fn parse_pair(s: &str) -> Result<LatLng> {
    match parse_numbers(s, ',')?[..] {
        [lat, lng] => Ok(LatLng::new(lat, lng)),
        _ => Err(Error::Validation(format!("expected LAT,LNG, got {:?}", s.trim()))),
    }
}

/// A persisted zone and the devices bound to it. Identical server records
/// collapse into one `Geofence`; `record_ids` lists every one of them, with
/// `id` first.
#[derive(Clone, Debug)]
pub struct Geofence {
    pub id: String,
    pub record_ids: Vec<String>,
    pub name: String,
    pub shape: ZoneShape,
    pub device_ids: Vec<String>,
    pub device_names: Vec<String>,
}

impl Geofence {
    pub fn from_record(record: ZoneRecord) -> Result<Self> {
        let kind = record
            .kind
            .as_deref()
            .and_then(ZoneKind::parse)
            .ok_or_else(|| Error::Validation(format!("unknown zone type {:?}", record.kind)))?;

        let shape = match kind {
            ZoneKind::Circle => {
                let (Some(lat), Some(lng), Some(radius_m)) =
                    (record.center_lat, record.center_lng, record.radius)
                else {
                    return Err(Error::Validation("circle is missing center or radius".into()));
                };
                ZoneShape::Circle { center: LatLng::new(lat, lng), radius_m }
            }
            ZoneKind::Polygon | ZoneKind::Rectangle => {
                let raw = record
                    .poly_rect
                    .as_deref()
                    .ok_or_else(|| Error::Validation("polygon is missing poly_rect".into()))?;
                let vertices = parse_poly_rect(raw)?;
                if kind == ZoneKind::Polygon {
                    ZoneShape::Polygon { vertices }
                } else {
                    ZoneShape::Rectangle { vertices }
                }
            }
        };
        shape.validate()?;

        let id = record.geofence_id.unwrap_or_default();
        Ok(Self {
            record_ids: if id.is_empty() { Vec::new() } else { vec![id.clone()] },
            id,
            name: record.geofence_name.unwrap_or_default(),
            shape,
            device_ids: record.device_ids,
            device_names: record.device_names,
        })
    }

    pub fn is_bound_to(&self, device_id: &str) -> bool {
        self.device_ids.iter().any(|id| id == device_id)
    }

    pub fn has_record(&self, record_id: &str) -> bool {
        self.record_ids.iter().any(|id| id == record_id)
    }

    /// Merge an identical zone into this one: its server records and its
    /// device bindings, keeping display names aligned with their ids.
    pub fn absorb(&mut self, other: &Geofence) {
        for record_id in &other.record_ids {
            if !self.has_record(record_id) {
                self.record_ids.push(record_id.clone());
            }
        }
        for (i, id) in other.device_ids.iter().enumerate() {
            if self.is_bound_to(id) {
                continue;
            }
            self.device_ids.push(id.clone());
            let name = other.device_names.get(i).cloned().unwrap_or_else(|| id.clone());
            self.device_names.push(name);
        }
    }
}

/// `poly_rect` is a JSON string holding `[[lat, lng], ...]` or
/// `[{"lat": .., "lng": ..}, ...]`.
pub fn parse_poly_rect(raw: &str) -> Result<Vec<LatLng>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawVertex {
        Pair([f64; 2]),
        Object { lat: f64, lng: f64 },
    }

    let raw: Vec<RawVertex> = serde_json::from_str(raw)?;
    Ok(raw
        .into_iter()
        .map(|v| match v {
            RawVertex::Pair([lat, lng]) => LatLng::new(lat, lng),
            RawVertex::Object { lat, lng } => LatLng::new(lat, lng),
        })
        .collect())
}

/// JSON string form of a vertex list for `poly_rect`.
pub fn encode_poly_rect(vertices: &[LatLng]) -> String {
    let pairs: Vec<[f64; 2]> = vertices.iter().map(|v| [v.lat, v.lng]).collect();
    serde_json::to_string(&pairs).unwrap_or_else(|_| "[]".to_string())
}

/// A user-drawn shape awaiting persistence.
#[derive(Clone, Debug)]
pub struct ZoneDraft {
    pub name: String,
    pub shape: ZoneShape,
    pub device_ids: Vec<String>,
    /// Display names parallel to `device_ids`; ids are used when the
    /// lengths differ.
    pub device_names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circle(lat: f64, lng: f64, r: f64) -> ZoneShape {
        ZoneShape::Circle { center: LatLng::new(lat, lng), radius_m: r }
    }

    #[test]
    fn circles_match_within_tolerance() {
        let a = circle(8.090881, 123.488679, 100.0);
        assert!(a.same_geometry(&circle(8.0908815, 123.4886785, 100.005)));
        assert!(!a.same_geometry(&circle(8.090891, 123.488679, 100.0)));
        assert!(!a.same_geometry(&circle(8.090881, 123.488679, 100.5)));
    }

    #[test]
    fn polygons_match_same_kind_in_order_only() {
        let pts = vec![
            LatLng::new(0.0, 0.0),
            LatLng::new(0.0, 1.0),
            LatLng::new(1.0, 1.0),
        ];
        let mut rotated = pts.clone();
        rotated.rotate_left(1);
        let a = ZoneShape::Polygon { vertices: pts.clone() };
        assert!(a.same_geometry(&ZoneShape::Polygon { vertices: pts.clone() }));
        assert!(!a.same_geometry(&ZoneShape::Rectangle { vertices: pts }));
        assert!(!a.same_geometry(&ZoneShape::Polygon { vertices: rotated }));
        assert!(!a.same_geometry(&circle(0.0, 0.0, 1.0)));
    }

    #[test]
    fn parse_cli_shapes() {
        assert_eq!(
            ZoneShape::parse_circle("10.0, 124.0, 50").unwrap(),
            circle(10.0, 124.0, 50.0)
        );
        assert!(ZoneShape::parse_circle("10.0,124.0,0").is_err());
        assert!(ZoneShape::parse_circle("10.0,124.0").is_err());
        assert!(ZoneShape::parse_polygon("0,0;0,1").is_err());
        assert_eq!(
            ZoneShape::parse_polygon("0,0;0,1;1,1;").unwrap().vertices().map(|v| v.len()),
            Some(3)
        );

        let rect = ZoneShape::parse_rectangle("1,2;0,0").unwrap();
        assert_eq!(rect.kind(), ZoneKind::Rectangle);
        assert_eq!(rect.vertices().unwrap()[0], LatLng::new(0.0, 0.0));
        assert_eq!(rect.vertices().unwrap()[2], LatLng::new(1.0, 2.0));
    }

    #[test]
    fn poly_rect_accepts_pairs_and_objects() {
        let a = parse_poly_rect("[[1.0,2.0],[3.0,4.0]]").unwrap();
        let b = parse_poly_rect(r#"[{"lat":1.0,"lng":2.0},{"lat":3.0,"lng":4.0}]"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(parse_poly_rect(&encode_poly_rect(&a)).unwrap(), a);
        assert!(parse_poly_rect("not json").is_err());
    }

    #[test]
    fn absorb_unions_records_and_devices() {
        let mut a = Geofence {
            id: "1".into(),
            record_ids: vec!["1".into()],
            name: "Yard".into(),
            shape: circle(0.0, 0.0, 10.0),
            device_ids: vec!["d1".into()],
            device_names: vec!["Rex".into()],
        };
        let b = Geofence {
            id: "2".into(),
            record_ids: vec!["2".into()],
            device_ids: vec!["d1".into(), "d2".into()],
            device_names: vec!["Rex".into(), "Milo".into()],
            ..a.clone()
        };
        a.absorb(&b);
        a.absorb(&b);
        assert_eq!(a.id, "1");
        assert_eq!(a.record_ids, vec!["1", "2"]);
        assert!(a.has_record("2"));
        assert_eq!(a.device_ids, vec!["d1", "d2"]);
        assert_eq!(a.device_names, vec!["Rex", "Milo"]);
    }
}
