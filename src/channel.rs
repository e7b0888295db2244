//! Real-time channel shared by every subscriber in the process.
//!
//! Frames are JSON envelopes `{"topic": "...", "data": ...}`. The socket is
//! opened on the first poll after the first `subscribe`, and closed when the
//! last `Subscription` is dropped. Reconnects back off exponentially and give
//! up after `MAX_ATTEMPTS` consecutive failures until `retry_now` is called.

use crate::error::Result;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::TcpStream;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tungstenite::{connect, stream::MaybeTlsStream, Message, WebSocket};

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 5;
const QUEUE_LIMIT: usize = 256;

static SHARED: LazyLock<Mutex<Weak<SharedChannel>>> = LazyLock::new(|| Mutex::new(Weak::new()));

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Connecting => "connecting",
            ChannelStatus::Connected => "connected",
            ChannelStatus::Disconnected => "disconnected",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Devices,
    NearbyPets,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Devices => "devices",
            Topic::NearbyPets => "nearby-pets",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "devices" => Some(Topic::Devices),
            "nearby-pets" => Some(Topic::NearbyPets),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    topic: String,
    #[serde(default)]
    data: Value,
}

/// Reconnect schedule: 1s, 2s, 4s ... capped at `MAX_DELAY`.
#[derive(Debug)]
struct Backoff {
    failures: u32,
    next_attempt: Instant,
}

impl Backoff {
    fn new() -> Self {
        Self { failures: 0, next_attempt: Instant::now() }
    }

    fn delay_for(failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        (BASE_DELAY * factor).min(MAX_DELAY)
    }

    fn record_failure(&mut self, now: Instant) {
        self.failures += 1;
        self.next_attempt = now + Self::delay_for(self.failures);
    }

    fn exhausted(&self) -> bool {
        self.failures >= MAX_ATTEMPTS
    }

    fn ready(&self, now: Instant) -> bool {
        !self.exhausted() && now >= self.next_attempt
    }

    fn reset(&mut self) {
        self.failures = 0;
        self.next_attempt = Instant::now();
    }
}

struct Inner {
    url: String,
    socket: Option<WebSocket<MaybeTlsStream<TcpStream>>>,
    status: ChannelStatus,
    backoff: Backoff,
    queues: HashMap<u64, (Topic, VecDeque<Value>)>,
    next_id: u64,
}

impl Inner {
    fn new(url: String) -> Self {
        Self {
            url,
            socket: None,
            status: ChannelStatus::Connecting,
            backoff: Backoff::new(),
            queues: HashMap::new(),
            next_id: 0,
        }
    }

    fn register(&mut self, topic: Topic) -> u64 {
        self.next_id += 1;
        self.queues.insert(self.next_id, (topic, VecDeque::new()));
        self.next_id
    }

    fn connect_if_due(&mut self) {
        if self.socket.is_some() {
            return;
        }
        let now = Instant::now();
        if !self.backoff.ready(now) {
            if self.backoff.exhausted() {
                self.status = ChannelStatus::Disconnected;
            }
            return;
        }

        self.status = ChannelStatus::Connecting;
        match open(&self.url) {
            Ok(ws) => {
                log::info!("Channel connected to {}", self.url);
                self.socket = Some(ws);
                self.status = ChannelStatus::Connected;
                self.backoff.reset();
            }
            Err(e) => {
                self.backoff.record_failure(now);
                log::warn!(
                    "Channel connect failed (attempt {}/{}): {}",
                    self.backoff.failures,
                    MAX_ATTEMPTS,
                    e
                );
                if self.backoff.exhausted() {
                    self.status = ChannelStatus::Disconnected;
                }
            }
        }
    }

    /// Read everything currently buffered on the socket without blocking.
    fn read_available(&mut self) {
        let mut frames = Vec::new();
        let mut lost = false;

        if let Some(ws) = &mut self.socket {
            loop {
                match ws.read() {
                    Ok(Message::Text(text)) => frames.push(text),
                    Ok(Message::Close(_)) => {
                        lost = true;
                        break;
                    }
                    Ok(_) => continue,
                    Err(tungstenite::Error::Io(ref e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("Channel read error: {}", e);
                        lost = true;
                        break;
                    }
                }
            }
        }

        for text in frames {
            self.route(&text);
        }

        if lost {
            self.socket = None;
            self.status = ChannelStatus::Connecting;
            self.backoff.record_failure(Instant::now());
        }
    }

    fn route(&mut self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping malformed channel frame: {}", e);
                return;
            }
        };
        let Some(topic) = Topic::parse(&envelope.topic) else {
            log::debug!("Ignoring topic {:?}", envelope.topic);
            return;
        };

        for (queue_topic, queue) in self.queues.values_mut() {
            if *queue_topic != topic {
                continue;
            }
            if queue.len() >= QUEUE_LIMIT {
                queue.pop_front();
            }
            queue.push_back(envelope.data.clone());
        }
    }
}

fn open(url: &str) -> Result<WebSocket<MaybeTlsStream<TcpStream>>> {
    let (mut ws, _) = connect(url)?;
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => stream.set_nonblocking(true)?,
        MaybeTlsStream::NativeTls(stream) => stream.get_ref().set_nonblocking(true)?,
        _ => {}
    }
    Ok(ws)
}

pub struct SharedChannel {
    inner: Mutex<Inner>,
}

impl SharedChannel {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic mid-poll leaves plain data behind; keep using it
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SharedChannel {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(mut ws) = inner.socket.take() {
            let _ = ws.close(None);
            let _ = ws.flush();
            log::info!("Channel closed");
        }
    }
}

/// `userId` is passed as a query parameter at connect time.
pub fn channel_url(ws_url: &str, user_id: &str) -> String {
    let sep = if ws_url.contains('?') { '&' } else { '?' };
    format!("{}{}userId={}", ws_url, sep, urlencoding::encode(user_id))
}

/// Subscribe to `topic`, joining the process-wide channel if one is open
/// for the same URL.
pub fn subscribe(ws_url: &str, user_id: &str, topic: Topic) -> Subscription {
    let url = channel_url(ws_url, user_id);
    let mut shared = SHARED.lock().unwrap_or_else(|p| p.into_inner());

    let channel = match shared.upgrade() {
        Some(existing) if existing.lock().url == url => existing,
        other => {
            if other.is_some() {
                log::warn!("Replacing shared channel for a different user");
            }
            let created = Arc::new(SharedChannel { inner: Mutex::new(Inner::new(url)) });
            *shared = Arc::downgrade(&created);
            created
        }
    };

    let id = channel.lock().register(topic);
    log::debug!("Subscribed to {} (#{})", topic.as_str(), id);
    Subscription { channel, id, topic }
}

/// Handle for one topic subscription. Dropping it unsubscribes.
pub struct Subscription {
    channel: Arc<SharedChannel>,
    id: u64,
    topic: Topic,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Pump the socket and take this subscriber's pending messages.
    pub fn poll(&self) -> Vec<Value> {
        let mut inner = self.channel.lock();
        inner.connect_if_due();
        inner.read_available();
        inner
            .queues
            .get_mut(&self.id)
            .map(|(_, queue)| queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn status(&self) -> ChannelStatus {
        self.channel.lock().status
    }

    /// Clear the failure count so the next poll reconnects immediately.
    pub fn retry_now(&self) {
        let mut inner = self.channel.lock();
        inner.backoff.reset();
        if inner.socket.is_none() {
            inner.status = ChannelStatus::Connecting;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.channel.lock().queues.remove(&self.id);
        log::debug!("Unsubscribed from {} (#{})", self.topic.as_str(), self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(Backoff::delay_for(1), Duration::from_secs(1));
        assert_eq!(Backoff::delay_for(2), Duration::from_secs(2));
        assert_eq!(Backoff::delay_for(4), Duration::from_secs(8));
        assert_eq!(Backoff::delay_for(10), MAX_DELAY);
    }

    #[test]
    fn backoff_gives_up_after_max_attempts() {
        let mut b = Backoff::new();
        let now = Instant::now();
        for _ in 0..MAX_ATTEMPTS {
            assert!(!b.exhausted());
            b.record_failure(now);
        }
        assert!(b.exhausted());
        assert!(!b.ready(now + MAX_DELAY * 2));
        b.reset();
        assert!(b.ready(Instant::now()));
    }

    #[test]
    fn frames_fan_out_by_topic() {
        let mut inner = Inner::new("ws://unused".into());
        let devices_a = inner.register(Topic::Devices);
        let devices_b = inner.register(Topic::Devices);
        let nearby = inner.register(Topic::NearbyPets);

        inner.route(r#"{"topic": "devices", "data": [{"deviceId": "d1"}]}"#);
        inner.route(r#"{"topic": "nearby-pets", "data": {"type": "grouped"}}"#);
        inner.route(r#"{"topic": "chat", "data": 1}"#);
        inner.route("garbage");

        assert_eq!(inner.queues[&devices_a].1.len(), 1);
        assert_eq!(inner.queues[&devices_b].1.len(), 1);
        assert_eq!(inner.queues[&nearby].1.len(), 1);
        assert_eq!(inner.queues[&devices_a].1[0][0]["deviceId"], "d1");
    }

    #[test]
    fn queue_is_bounded() {
        let mut inner = Inner::new("ws://unused".into());
        let id = inner.register(Topic::Devices);
        for i in 0..QUEUE_LIMIT + 10 {
            inner.route(&format!(r#"{{"topic": "devices", "data": {}}}"#, i));
        }
        let queue = &inner.queues[&id].1;
        assert_eq!(queue.len(), QUEUE_LIMIT);
        assert_eq!(queue[0], 10);
    }

    #[test]
    fn subscribers_share_one_channel_until_last_drops() {
        let url = "ws://127.0.0.1:9/shared-test";
        let a = subscribe(url, "u1", Topic::Devices);
        let b = subscribe(url, "u1", Topic::NearbyPets);
        assert!(Arc::ptr_eq(&a.channel, &b.channel));
        assert_eq!(a.status(), ChannelStatus::Connecting);

        let weak = Arc::downgrade(&a.channel);
        drop(a);
        assert!(weak.upgrade().is_some());
        drop(b);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn url_carries_user_id() {
        assert_eq!(channel_url("ws://h/feed", "u 1"), "ws://h/feed?userId=u%201");
        assert_eq!(channel_url("ws://h/feed?v=2", "u1"), "ws://h/feed?v=2&userId=u1");
    }
}
