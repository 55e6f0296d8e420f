use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ewebsock::{Options, WsEvent, WsMessage, WsReceiver, WsSender};
use hashbrown::HashSet;
use tracing::{debug, error};

use crate::relay::config::RelayConfig;
use crate::relay::RelayStatus;
use crate::Error;

/// Nudges the embedding event loop when socket traffic arrives, so it
/// knows to poll the pool again. Closures work out of the box.
pub trait Wakeup: Send + Sync {
    fn wake(&self);
}

impl<F: Fn() + Send + Sync> Wakeup for F {
    fn wake(&self) {
        self()
    }
}

/// Cap on the backoff counter; reconnect waits stop growing here.
pub const MAX_BACKOFF: u32 = 512;

/// What a connection saw while draining its socket.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    Opened,
    Message(String),
    Closed,
    Error(Error),
}

/// Admission rule for a reconnect attempt. Every declined attempt bumps
/// `skipped` by one, so an attempt goes through once the caller has been
/// turned away `backoff` times.
fn reconnect_admitted(backoff: u32, skipped: u32, force: bool) -> bool {
    backoff > MAX_BACKOFF || backoff == 1 || force || skipped == backoff
}

fn next_backoff(backoff: u32) -> u32 {
    if backoff >= MAX_BACKOFF {
        MAX_BACKOFF
    } else {
        (backoff * 2).max(1)
    }
}

/// A single relay endpoint: one websocket, the subscription ids known to
/// be live on it, an outbound queue replayed on (re)connect, and the
/// backoff bookkeeping that throttles reconnect storms.
pub struct RelayConnection {
    config: RelayConfig,
    status: RelayStatus,
    sender: Option<WsSender>,
    receiver: Option<WsReceiver>,
    active_subscriptions: HashSet<String>,
    outbound: VecDeque<String>,
    backoff: u32,
    skipped: u32,
    last_message_at: Option<Instant>,
    last_ping: Option<Instant>,
    online: bool,
    wakeup: Arc<dyn Wakeup>,
}

impl fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.config.url())
            .field("status", &self.status)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl Hash for RelayConnection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hashes the connection by hashing the URL
        self.config.url().hash(state);
    }
}

impl PartialEq for RelayConnection {
    fn eq(&self, other: &Self) -> bool {
        self.config.url() == other.config.url()
    }
}

impl Eq for RelayConnection {}

impl RelayConnection {
    pub fn new(config: RelayConfig, wakeup: Arc<dyn Wakeup>) -> Self {
        RelayConnection {
            config,
            status: RelayStatus::Disconnected,
            sender: None,
            receiver: None,
            active_subscriptions: HashSet::new(),
            outbound: VecDeque::new(),
            backoff: 0,
            skipped: 0,
            last_message_at: None,
            last_ping: None,
            online: true,
            wakeup,
        }
    }

    pub fn url(&self) -> &str {
        self.config.url()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RelayConfig {
        &mut self.config
    }

    pub fn status(&self) -> RelayStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == RelayStatus::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.status == RelayStatus::Connecting
    }

    /// Current backoff level. Zero until the first connect attempt and
    /// after any clean close; it only grows over consecutive failures.
    pub fn backoff_level(&self) -> u32 {
        self.backoff
    }

    pub fn last_message_received_at(&self) -> Option<Instant> {
        self.last_message_at
    }

    pub fn queued_message_count(&self) -> usize {
        self.outbound.len()
    }

    pub fn has_subscription(&self, sub_id: &str) -> bool {
        self.active_subscriptions.contains(sub_id)
    }

    pub fn register_subscription(&mut self, sub_id: &str) {
        self.active_subscriptions.insert(sub_id.to_string());
    }

    pub fn remove_subscription(&mut self, sub_id: &str) {
        self.active_subscriptions.remove(sub_id);
    }

    pub fn subscription_count(&self) -> usize {
        self.active_subscriptions.len()
    }

    pub(crate) fn set_online(&mut self, online: bool) {
        self.online = online;
    }

    /// Open (or replace) the websocket. `and_send` is queued before the
    /// socket comes up and flushed like any other pending frame.
    ///
    /// Unless `force` is set, attempts are throttled: a declined attempt
    /// only counts the skip and leaves the connection disconnected.
    pub fn connect(&mut self, and_send: Option<String>, force: bool) {
        if !self.online {
            return;
        }
        if self.status == RelayStatus::Connecting {
            return;
        }
        if !force && self.status == RelayStatus::Connected {
            return;
        }

        let replacing_live_socket = self.status == RelayStatus::Connected;
        self.status = RelayStatus::Connecting;

        if !reconnect_admitted(self.backoff, self.skipped, force) {
            self.skipped += 1;
            self.status = RelayStatus::Disconnected;
            return;
        }
        self.skipped = 0;

        // Subscriptions registered while disconnected stay: their REQ
        // frames are still queued and replay once the socket opens. Only
        // a live session dies with its socket.
        if replacing_live_socket {
            self.active_subscriptions.clear();
        }

        if let Some(text) = and_send {
            self.outbound.push_back(text);
        }

        debug!("connecting to {}", self.config.url());
        let wakeup = Arc::clone(&self.wakeup);
        let result = ewebsock::connect_with_wakeup(self.config.url(), Options::default(), move || {
            wakeup.wake()
        });
        self.backoff = next_backoff(self.backoff);

        match result {
            Ok((sender, receiver)) => {
                self.sender = Some(sender);
                self.receiver = Some(receiver);
                self.flush_outbound();
            }
            Err(err) => {
                error!("failed to open websocket to {}: {}", self.config.url(), err);
                self.sender = None;
                self.receiver = None;
                self.status = RelayStatus::Disconnected;
            }
        }
    }

    /// Queue a frame and flush the queue if a socket is up. Frames sent
    /// while the socket is still opening wait in the queue and go out on
    /// open; frames sent while offline are dropped.
    pub fn send(&mut self, text: String) {
        if !self.online {
            return;
        }
        self.outbound.push_back(text);
        if self.sender.is_some() {
            self.flush_outbound();
        }
    }

    fn flush_outbound(&mut self) {
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        while let Some(text) = self.outbound.pop_front() {
            debug!("sending {} to {}", text, self.config.url());
            sender.send(WsMessage::Text(text));
        }
    }

    /// Deliberate teardown: drops the socket and every piece of session
    /// state, including queued frames and the backoff counters.
    pub fn disconnect(&mut self) {
        self.active_subscriptions.clear();
        self.outbound.clear();
        self.last_message_at = None;
        self.backoff = 0;
        self.skipped = 0;
        self.sender = None;
        self.receiver = None;
        self.status = RelayStatus::Disconnected;
    }

    /// No-op when no socket is open.
    pub fn ping(&mut self) {
        let Some(sender) = self.sender.as_mut() else {
            return;
        };
        debug!("pinging {}", self.config.url());
        sender.send(WsMessage::Ping(vec![]));
        self.last_ping = Some(Instant::now());
    }

    pub(crate) fn keepalive_ping(&mut self, ping_rate: Duration) {
        if self.status != RelayStatus::Connected {
            return;
        }
        let due = match self.last_ping {
            Some(at) => at.elapsed() > ping_rate,
            None => true,
        };
        if due {
            self.ping();
        }
    }

    /// Drain the socket until something worth reporting shows up. Pings
    /// are answered and pongs recorded without surfacing them.
    pub(crate) fn poll_event(&mut self) -> Option<ConnEvent> {
        loop {
            let event = self.receiver.as_ref()?.try_recv()?;
            if let Some(out) = self.handle_ws_event(event) {
                return Some(out);
            }
        }
    }

    fn handle_ws_event(&mut self, event: WsEvent) -> Option<ConnEvent> {
        match event {
            WsEvent::Opened => {
                debug!("connected to {}", self.config.url());
                self.backoff = 0;
                self.skipped = 0;
                self.last_message_at = Some(Instant::now());
                self.status = RelayStatus::Connected;
                self.flush_outbound();
                Some(ConnEvent::Opened)
            }
            WsEvent::Message(WsMessage::Text(text)) => {
                self.last_message_at = Some(Instant::now());
                // anything received proves the relay is alive
                self.status = RelayStatus::Connected;
                Some(ConnEvent::Message(text))
            }
            WsEvent::Message(WsMessage::Ping(data)) => {
                self.last_message_at = Some(Instant::now());
                if let Some(sender) = self.sender.as_mut() {
                    debug!("pong {}", self.config.url());
                    sender.send(WsMessage::Pong(data));
                }
                None
            }
            WsEvent::Message(_) => {
                self.last_message_at = Some(Instant::now());
                None
            }
            WsEvent::Closed => {
                debug!("connection to {} closed", self.config.url());
                self.sender = None;
                self.receiver = None;
                self.active_subscriptions.clear();
                self.backoff = 0;
                self.skipped = 0;
                self.last_message_at = Some(Instant::now());
                self.status = RelayStatus::Disconnected;
                Some(ConnEvent::Closed)
            }
            WsEvent::Error(err) => {
                error!("websocket error on {}: {}", self.config.url(), err);
                self.sender = None;
                self.receiver = None;
                self.active_subscriptions.clear();
                self.last_message_at = None;
                self.backoff = next_backoff(self.backoff);
                self.status = RelayStatus::Disconnected;
                Some(ConnEvent::Error(Error::Websocket(err)))
            }
        }
    }
}
