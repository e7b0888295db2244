//! Full-screen live board for `watch --board`.

use crate::channel::ChannelStatus;
use crate::engine::{DeviceReport, EngineEvent};
use crate::nearby::OwnerGroup;
use crate::terminal::{colors, Terminal};
use crossterm::event::{KeyCode, KeyModifiers};
use crossterm::style::Color;
use std::collections::VecDeque;
use std::io;
use std::time::Duration;

const EVENT_LINES: usize = 6;
const COLUMNS: [(&str, usize); 6] = [
    ("PET", 16),
    ("STATUS", 16),
    ("BATT", 6),
    ("POSITION", 30),
    ("ZONE", 22),
    ("TRAIL", 6),
];

pub enum BoardAction {
    Quit,
    Retry,
    ClearTrails,
}

pub struct Board {
    term: Terminal,
    title: String,
    events: VecDeque<String>,
}

impl Board {
    pub fn new(title: &str) -> io::Result<Self> {
        Ok(Self {
            term: Terminal::new(true)?,
            title: title.to_string(),
            events: VecDeque::with_capacity(EVENT_LINES),
        })
    }

    pub fn push_event(&mut self, event: &EngineEvent) {
        if self.events.len() == EVENT_LINES {
            self.events.pop_front();
        }
        self.events.push_back(format!("{}  {}", chrono::Local::now().format("%H:%M:%S"), event));
    }

    /// Wait up to `timeout` for a key and map it to an action.
    pub fn next_action(&self, timeout: Duration) -> io::Result<Option<BoardAction>> {
        let Some((code, mods)) = self.term.wait_key(timeout)? else {
            return Ok(None);
        };
        Ok(match code {
            KeyCode::Char('q') | KeyCode::Esc => Some(BoardAction::Quit),
            KeyCode::Char('c') if mods.contains(KeyModifiers::CONTROL) => Some(BoardAction::Quit),
            KeyCode::Char('r') => Some(BoardAction::Retry),
            KeyCode::Char('x') => Some(BoardAction::ClearTrails),
            _ => None,
        })
    }

    pub fn draw(
        &mut self,
        status: ChannelStatus,
        zone_count: usize,
        reports: &[DeviceReport],
        nearby: &[OwnerGroup],
    ) -> io::Result<()> {
        self.term.sync_size()?;
        self.term.clear();
        let (_, h) = self.term.size();
        let h = h as i32;

        let header = format!("{}  |  channel: {}  |  {} zones", self.title, status.as_str(), zone_count);
        self.term.set_str(1, 0, &header, Some(colors::TITLE), true);

        let mut x = 1;
        for (label, width) in COLUMNS {
            self.term.set_str(x, 2, label, Some(colors::HEADER), true);
            x += width as i32;
        }

        let mut y = 3;
        if reports.is_empty() {
            self.term.set_str(1, y, "No trackers to show", Some(colors::OFFLINE), false);
            y += 1;
        }
        for report in reports {
            if y >= h - 2 {
                break;
            }
            let mut x = 1;
            for ((text, color), (_, width)) in device_cells(report).into_iter().zip(COLUMNS) {
                self.term.set_str(x, y, &fit(&text, width - 1), color, false);
                x += width as i32;
            }
            y += 1;
        }

        y += 1;
        if !nearby.is_empty() && y < h - 2 {
            self.term.set_str(1, y, "NEARBY", Some(colors::HEADER), true);
            y += 1;
            for line in nearby_lines(nearby) {
                if y >= h - 2 {
                    break;
                }
                self.term.set_str(3, y, &line, Some(colors::NEARBY), false);
                y += 1;
            }
            y += 1;
        }

        for line in &self.events {
            if y >= h - 1 {
                break;
            }
            self.term.set_str(1, y, line, Some(colors::EVENT), false);
            y += 1;
        }

        self.term
            .set_str(1, h - 1, "q quit  r reconnect  x clear trails", Some(colors::HEADER), false);
        self.term.render()
    }
}

fn device_cells(report: &DeviceReport) -> [(String, Option<Color>); 6] {
    let view = &report.view;

    let status_color = if view.online { colors::ONLINE } else { colors::OFFLINE };
    let (battery, battery_color) = match view.battery {
        Some(b) if b <= 20 => (format!("{}%", b), Some(colors::BATTERY_LOW)),
        Some(b) => (format!("{}%", b), None),
        None => ("-".to_string(), None),
    };
    let position = match view.position {
        Some(p) => format!("{:.5}, {:.5} {}", p.lat, p.lng, view.source.as_str()),
        None => "waiting for fix".to_string(),
    };
    let zone_color = if report.containment.is_inside() {
        colors::INSIDE
    } else if report.containment.distance_outside().is_some() {
        colors::OUTSIDE
    } else {
        colors::OFFLINE
    };

    let name = match view.breed.as_deref().or(view.pet_type.as_deref()) {
        Some(kind) => format!("{} ({})", view.name, kind),
        None => view.name.clone(),
    };

    [
        (name, None),
        (view.status.clone(), Some(status_color)),
        (battery, battery_color),
        (position, None),
        (report.containment.to_string(), Some(zone_color)),
        (report.trail_len.to_string(), None),
    ]
}

fn nearby_lines(groups: &[OwnerGroup]) -> Vec<String> {
    groups
        .iter()
        .map(|group| {
            let pets: Vec<String> = group
                .pets
                .iter()
                .map(|pet| {
                    let name = pet.pet_name.as_deref().or(pet.device_id.as_deref()).unwrap_or("?");
                    match (pet.distance, pet.position()) {
                        (Some(d), _) => format!("{} ({:.0} m)", name, d),
                        (None, Some(p)) => format!("{} @ {:.4},{:.4}", name, p.lat, p.lng),
                        (None, None) => name.to_string(),
                    }
                })
                .collect();
            let owner = group.owner_name.as_deref().unwrap_or(&group.owner_id);
            format!("{}: {}", owner, pets.join(", "))
        })
        .collect()
}

fn fit(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(1)).collect();
    cut.push('~');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containment::Containment;
    use crate::geometry::LatLng;
    use crate::nearby::NearbyPet;
    use crate::reconcile::{DeviceView, PositionSource};

    fn report(battery: Option<u8>, containment: Containment) -> DeviceReport {
        DeviceReport {
            view: DeviceView {
                device_id: "d1".into(),
                name: "Rex".into(),
                pet_type: None,
                breed: None,
                position: Some(LatLng::new(10.0, 124.0)),
                source: PositionSource::Live,
                battery,
                online: true,
                last_seen: None,
                status: "Online: 5s".into(),
            },
            containment,
            trail_len: 3,
        }
    }

    #[test]
    fn device_row_text() {
        let cells = device_cells(&report(Some(15), Containment::NoZones));
        let text: Vec<&str> = cells.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            text,
            vec!["Rex", "Online: 5s", "15%", "10.00000, 124.00000 live", "no zones", "3"]
        );
        assert_eq!(cells[2].1, Some(colors::BATTERY_LOW));
    }

    #[test]
    fn nearby_lines_prefer_names() {
        let groups = vec![OwnerGroup {
            owner_id: "u2".into(),
            owner_name: None,
            pets: vec![
                NearbyPet { pet_name: Some("Bolt".into()), distance: Some(42.4), ..Default::default() },
                NearbyPet { device_id: Some("p2".into()), ..Default::default() },
                NearbyPet {
                    pet_name: Some("Luna".into()),
                    lat: Some(1.5),
                    lng: Some(2.25),
                    ..Default::default()
                },
            ],
        }];
        assert_eq!(nearby_lines(&groups), vec!["u2: Bolt (42 m), p2, Luna @ 1.5000,2.2500"]);
    }

    #[test]
    fn long_text_is_cut() {
        assert_eq!(fit("Rex", 5), "Rex");
        assert_eq!(fit("Bartholomew", 6), "Barth~");
    }
}
