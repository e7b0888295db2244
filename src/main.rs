mod api;
mod board;
mod channel;
mod containment;
mod engine;
mod error;
mod geometry;
mod nearby;
mod reconcile;
mod session;
mod settings;
mod storage;
mod store;
mod terminal;
mod trail;
mod zone;

use api::{is_transient, Backend, HttpBackend};
use board::{Board, BoardAction};
use channel::{ChannelStatus, Subscription, Topic};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use containment::{Containment, ContainmentMonitor, ZoneScope};
use engine::{decode_feed, DeviceReport, Engine, EngineEvent};
use error::{Error, Result};
use geometry::LatLng;
use nearby::ProximityEvent;
use reconcile::Tracker;
use session::Session;
use settings::Settings;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};
use storage::LocalStore;
use store::GeofenceStore;
use trail::PathAccumulator;
use zone::{ZoneDraft, ZoneShape};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "petfence")]
#[command(version)]
#[command(about = "Geofences, live positions and trails for your pet trackers", long_about = None)]
struct Cli {
    /// Backend base URL (overrides [server] base_url)
    #[arg(long, global = true)]
    server: Option<String>,

    /// User id (overrides [session] user_id)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Config file (default: <config dir>/petfence/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Warnings and errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List, create or delete geofences
    Zones {
        #[command(subcommand)]
        action: ZoneAction,
    },

    /// List saved trackers
    Trackers,

    /// Check a position against the loaded geofences
    Check {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lng: f64,

        /// Only zones bound to this device (default: all zones)
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Show or clear recorded trails
    Trail {
        #[command(subcommand)]
        action: TrailAction,
    },

    /// Choose which trackers are monitored
    Visible {
        #[command(subcommand)]
        action: VisibleAction,
    },

    /// Follow live positions, zones and nearby pets
    Watch {
        /// Full-screen board instead of line output
        #[arg(short, long)]
        board: bool,

        /// Zones checked per device: associated or all (overrides [monitor] zone_scope)
        #[arg(long, value_parser = parse_scope)]
        scope: Option<ZoneScope>,
    },
}

#[derive(Subcommand)]
enum ZoneAction {
    /// List active geofences
    List {
        /// Only zones bound to this device
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Create a geofence bound to one or more devices
    #[command(group(ArgGroup::new("shape").required(true).args(["circle", "polygon", "rectangle"])))]
    Create {
        #[arg(short, long)]
        name: String,

        /// Device ids, comma separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        devices: Vec<String>,

        /// LAT,LNG,RADIUS_M
        #[arg(long, allow_hyphen_values = true)]
        circle: Option<String>,

        /// "LAT,LNG;LAT,LNG;LAT,LNG[;...]"
        #[arg(long, allow_hyphen_values = true)]
        polygon: Option<String>,

        /// Two opposite corners "LAT,LNG;LAT,LNG"
        #[arg(long, allow_hyphen_values = true)]
        rectangle: Option<String>,
    },

    /// Delete geofences by id
    Delete {
        #[arg(long = "id", required = true)]
        ids: Vec<String>,

        /// Devices to unbind (default: every device bound to the zone)
        #[arg(short, long, value_delimiter = ',')]
        devices: Vec<String>,
    },
}

#[derive(Subcommand)]
enum TrailAction {
    /// Print recorded points
    Show {
        #[arg(short, long)]
        device: Option<String>,
    },

    /// Delete recorded points
    Clear {
        /// Only this device (default: every trail)
        #[arg(short, long)]
        device: Option<String>,
    },
}

#[derive(Subcommand)]
enum VisibleAction {
    /// Monitor only these device ids
    Set {
        #[arg(required = true, value_delimiter = ',')]
        ids: Vec<String>,
    },

    /// Print the current selection
    Show,

    /// Monitor every saved tracker again
    Clear,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if let Err(e) = run(cli) {
        eprintln!("petfence: {}", e);
        std::process::exit(1);
    }
}

fn parse_scope(s: &str) -> std::result::Result<ZoneScope, String> {
    ZoneScope::parse(s).ok_or_else(|| format!("unknown scope {:?} (expected associated or all)", s))
}

fn init_logging(verbose: bool, quiet: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();
}

fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::load(cli.config.as_deref());
    if let Some(server) = cli.server {
        settings.server.base_url = server;
    }

    let local = LocalStore::new(
        settings
            .storage
            .data_dir
            .clone()
            .unwrap_or_else(LocalStore::default_root),
    );
    log::debug!("Local state in {}", local.root().display());

    // Local-only commands don't need a user.
    match cli.command {
        Commands::Trail { action } => return trail_command(action, local),
        Commands::Visible { action } => return visible_command(action, &local),
        _ => {}
    }

    let session = Session::resolve(&settings, cli.user.as_deref())?;
    log::debug!("Signed in as {}", session.label());
    let mut store = GeofenceStore::new(HttpBackend::new(&settings.server.base_url), &session.user_id);

    match cli.command {
        Commands::Zones { action } => zones_command(action, &mut store, &session),
        Commands::Trackers => {
            for tracker in load_trackers(store.backend(), &session)? {
                print_tracker(&tracker);
            }
            Ok(())
        }
        Commands::Check { lat, lng, device } => {
            let point = LatLng::new(lat, lng);
            if !point.is_valid() {
                return Err(Error::Validation(format!("{}, {} is not a valid coordinate", lat, lng)));
            }
            store.load()?;
            let (scope, device_id) = match &device {
                Some(id) => (ZoneScope::Associated, id.as_str()),
                None => (ZoneScope::All, ""),
            };
            let verdict = ContainmentMonitor::new(scope).evaluate(device_id, Some(point), store.active_zones());
            println!("{}", verdict);
            Ok(())
        }
        Commands::Watch { board, scope } => {
            if let Some(scope) = scope {
                settings.monitor.zone_scope = scope;
            }
            watch(&settings, &session, store, local, board)
        }
        Commands::Trail { .. } | Commands::Visible { .. } => Ok(()),
    }
}

fn zones_command<B: Backend>(action: ZoneAction, store: &mut GeofenceStore<B>, session: &Session) -> Result<()> {
    match action {
        ZoneAction::List { device } => {
            store.load()?;
            let zones: Vec<_> = match &device {
                Some(id) => store.zones_for_device(id).collect(),
                None => store.active_zones().iter().collect(),
            };
            if zones.is_empty() {
                println!("No geofences");
            }
            for zone in zones {
                println!(
                    "{:<12} {:<20} {:<9} {}",
                    zone.id,
                    zone.name,
                    zone.shape.kind(),
                    zone.device_names.join(", ")
                );
            }
        }
        ZoneAction::Create { name, devices, circle, polygon, rectangle } => {
            let shape = match (circle, polygon, rectangle) {
                (Some(s), _, _) => ZoneShape::parse_circle(&s)?,
                (_, Some(s), _) => ZoneShape::parse_polygon(&s)?,
                (_, _, Some(s)) => ZoneShape::parse_rectangle(&s)?,
                _ => return Err(Error::Validation("no shape given".into())),
            };

            // Names are cosmetic; fall back to ids when the registry is unreachable.
            let device_names = match load_trackers(store.backend(), session) {
                Ok(trackers) => devices
                    .iter()
                    .map(|id| {
                        trackers
                            .iter()
                            .find(|t| &t.device_id == id)
                            .map_or_else(|| id.clone(), |t| t.name.clone())
                    })
                    .collect(),
                Err(e) => {
                    log::warn!("Could not load tracker names: {}", e);
                    devices.clone()
                }
            };

            store.load()?;
            let zone = store.create(ZoneDraft { name, shape, device_ids: devices, device_names })?;
            log::debug!("{} shapes on the map", store.drawn_shapes().len());
            println!("Created {} ({})", zone.id, zone.name);
        }
        ZoneAction::Delete { ids, devices } => {
            store.load()?;
            let mut handled: Vec<String> = Vec::new();
            for id in &ids {
                if handled.contains(id) {
                    continue;
                }
                let zone = store.get(id)?;
                let unbind = if devices.is_empty() { zone.device_ids.clone() } else { devices.clone() };
                let records = zone.record_ids.clone();
                store.delete(std::slice::from_ref(id), &unbind)?;
                println!("Deleted {}", records.join(", "));
                handled.extend(records);
            }
        }
    }
    Ok(())
}

fn load_trackers<B: Backend>(backend: &B, session: &Session) -> Result<Vec<Tracker>> {
    let records = backend.fetch_trackers(&session.user_id)?;
    Ok(records.into_iter().filter_map(Tracker::from_record).collect())
}

fn print_tracker(tracker: &Tracker) {
    let kind = [tracker.pet_type.as_deref(), tracker.breed.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" / ");
    let position = tracker
        .last_position
        .map_or_else(|| "-".to_string(), |p| format!("{:.5}, {:.5}", p.lat, p.lng));
    let battery = tracker.last_battery.map_or_else(|| "-".to_string(), |b| format!("{}%", b));
    println!("{:<16} {:<16} {:<20} {:<24} {}", tracker.device_id, tracker.name, kind, position, battery);
    if let Some(image) = &tracker.image {
        log::debug!("  image: {}", image);
    }
}

fn trail_command(action: TrailAction, local: LocalStore) -> Result<()> {
    let ids = local.trail_ids();
    let mut trails = PathAccumulator::new(local);
    match action {
        TrailAction::Show { device } => {
            let ids = device.map_or(ids, |id| vec![id]);
            if ids.is_empty() {
                println!("No trails recorded");
            }
            for id in ids {
                let points = trails.points(&id);
                println!("{} ({} points)", id, points.len());
                for [lat, lng] in points {
                    println!("  {:.6}, {:.6}", lat, lng);
                }
            }
        }
        TrailAction::Clear { device: Some(id) } => trails.clear(&id)?,
        TrailAction::Clear { device: None } => trails.clear_all()?,
    }
    Ok(())
}

fn visible_command(action: VisibleAction, local: &LocalStore) -> Result<()> {
    match action {
        VisibleAction::Set { ids } => {
            let ids: BTreeSet<String> = ids
                .into_iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect();
            local.save_visible(&ids)?;
            println!("Monitoring {} trackers", ids.len());
        }
        VisibleAction::Show => match local.load_visible() {
            Some(ids) => ids.iter().for_each(|id| println!("{}", id)),
            None => println!("All trackers"),
        },
        VisibleAction::Clear => local.clear_visible()?,
    }
    Ok(())
}

fn watch<B: Backend>(
    settings: &Settings,
    session: &Session,
    mut store: GeofenceStore<B>,
    local: LocalStore,
    use_board: bool,
) -> Result<()> {
    let pending: Rc<RefCell<Vec<EngineEvent>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&pending);
    let visible = local.load_visible();
    let mut engine = Engine::new(
        &session.user_id,
        settings.heartbeat(),
        settings.monitor.zone_scope,
        local,
        Box::new(move |event| sink.borrow_mut().push(event.clone())),
    );
    engine.set_visible(visible);
    refresh(&mut store, &mut engine, session)?;

    let devices = channel::subscribe(&settings.server.ws_url, &session.user_id, Topic::Devices);
    let nearby = channel::subscribe(&settings.server.ws_url, &session.user_id, Topic::NearbyPets);
    log::info!("Watching {} as {}", settings.server.ws_url, session.label());

    let mut board = if use_board { Some(Board::new(session.label())?) } else { None };
    let refresh_every = Duration::from_secs(settings.monitor.refresh_secs.max(5));
    let mut last_refresh = Instant::now();
    let mut last_status = None;

    loop {
        let (fresh, feed_reports) = pump(&devices, &nearby, &mut engine);
        let reports = if fresh { feed_reports } else { engine.tick(Utc::now()) };

        let status = devices.status();
        if last_status != Some(status) {
            log::info!("Channel {}", status.as_str());
            last_status = Some(status);
        }

        if last_refresh.elapsed() >= refresh_every {
            last_refresh = Instant::now();
            match refresh(&mut store, &mut engine, session) {
                Ok(()) => {}
                Err(e) if is_transient(&e) => log::warn!("Refresh failed, keeping previous data: {}", e),
                Err(e) => return Err(e),
            }
            if status == ChannelStatus::Disconnected && board.is_none() {
                devices.retry_now();
            }
        }

        let events: Vec<EngineEvent> = pending.borrow_mut().drain(..).collect();
        match board.as_mut() {
            Some(board) => {
                for event in &events {
                    board.push_event(event);
                }
                board.draw(status, engine.zones().len(), &reports, engine.nearby())?;
                match board.next_action(POLL_INTERVAL)? {
                    Some(BoardAction::Quit) => break,
                    Some(BoardAction::Retry) => devices.retry_now(),
                    Some(BoardAction::ClearTrails) => engine.clear_all_trails()?,
                    None => {}
                }
            }
            None => {
                for event in &events {
                    println!("{} [{}] {}", chrono::Local::now().format("%H:%M:%S"), event.device_id(), event);
                }
                if fresh {
                    print_reports(&reports);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    Ok(())
}

/// Drain both subscriptions. Returns whether a devices snapshot arrived,
/// with the reports from the last one.
fn pump(devices: &Subscription, nearby: &Subscription, engine: &mut Engine) -> (bool, Vec<DeviceReport>) {
    let mut latest = None;
    for data in devices.poll() {
        let feed = decode_feed(data);
        latest = Some(engine.on_devices(&feed, Utc::now()));
    }

    for data in nearby.poll() {
        match serde_json::from_value::<ProximityEvent>(data) {
            Ok(event) => {
                let groups = engine.on_nearby(event);
                log::debug!("{} owners nearby ({})", groups.len(), nearby.topic().as_str());
            }
            Err(e) => log::warn!("Ignoring malformed nearby-pets message: {}", e),
        }
    }

    match latest {
        Some(reports) => (true, reports),
        None => (false, Vec::new()),
    }
}

fn refresh<B: Backend>(store: &mut GeofenceStore<B>, engine: &mut Engine, session: &Session) -> Result<()> {
    let trackers = load_trackers(store.backend(), session)?;
    log::debug!("Registry has {} trackers", trackers.len());
    engine.set_registry(trackers);
    engine.set_zones(store.load()?.to_vec());
    Ok(())
}

fn print_reports(reports: &[DeviceReport]) {
    for report in reports {
        let view = &report.view;
        let position = view
            .position
            .map_or_else(|| "no fix".to_string(), |p| format!("{:.5},{:.5}", p.lat, p.lng));
        let battery = view.battery.map_or_else(|| "-".to_string(), |b| format!("{}%", b));
        let seen = view.last_seen.map_or_else(
            || "never".to_string(),
            |t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string(),
        );
        let nearest = match &report.containment {
            Containment::Outside { nearest_zone_id, .. } => format!(" nearest={}", nearest_zone_id),
            _ => String::new(),
        };
        println!(
            "{:<16} {:<14} {:<5} {:<24} {:<7} seen={} trail={} {}{}",
            view.name,
            view.status,
            battery,
            position,
            view.source.as_str(),
            seen,
            report.trail_len,
            report.containment,
            nearest
        );
    }
}
