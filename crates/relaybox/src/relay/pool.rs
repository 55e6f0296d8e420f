use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::hash_map::Entry;
use hashbrown::{HashMap, HashSet};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::outbox::{PreferredRelays, RequestPlan, WritePlan};
use crate::relay::config::{normalize_relay_url, RelayConfig};
use crate::relay::connection::{ConnEvent, RelayConnection, Wakeup};
use crate::relay::RelayStatus;
use crate::{ClientMessage, Error, Event, Filter};

/// How often keepalive pings go out on an idle connected relay.
pub const DEFAULT_PING_RATE: Duration = Duration::from_secs(45);

/// Event kinds whose p-tags do not drive outbox fan-out when publishing.
/// Contact lists (kind 3) p-tag every single followee.
fn default_ptag_exclude_kinds() -> BTreeSet<u64> {
    [3].into_iter().collect()
}

/// How the embedding application hears about pool activity. Callbacks
/// fire from [`ConnectionPool::poll`], on whatever thread called it.
pub trait RelayConnectionDelegate {
    fn did_connect(&mut self, url: &str);
    fn did_receive_message(&mut self, url: &str, message: &str);
    fn did_disconnect(&mut self, url: &str);
    fn did_disconnect_with_error(&mut self, url: &str, error: &Error);
}

/// A set of relay connections addressed by normalized url, plus the
/// NIP-65 bookkeeping that routes traffic to relays we never configured
/// ourselves.
///
/// Owned connections come from [`add_connection`](Self::add_connection)
/// and carry the caller's read/write flags. Outbox connections are
/// created on demand while fanning out requests and publishes. None of
/// the operations here return errors; failures surface through the
/// delegate or get logged and skipped.
pub struct ConnectionPool {
    connections: HashMap<String, RelayConnection>,
    outbox_connections: HashMap<String, RelayConnection>,
    delegate: Box<dyn RelayConnectionDelegate + Send>,
    wakeup: Arc<dyn Wakeup>,
    preferred_relays: Option<PreferredRelays>,
    relay_list_events: Vec<Event>,
    max_preferred_relays: usize,
    penalty_box: BTreeSet<String>,
    ping_rate: Duration,
    ptag_fanout_exclude_kinds: BTreeSet<u64>,
    network_online: bool,
}

impl ConnectionPool {
    pub fn new(
        delegate: impl RelayConnectionDelegate + Send + 'static,
        wakeup: impl Wakeup + 'static,
    ) -> Self {
        ConnectionPool {
            connections: HashMap::new(),
            outbox_connections: HashMap::new(),
            delegate: Box::new(delegate),
            wakeup: Arc::new(wakeup),
            preferred_relays: None,
            relay_list_events: Vec::new(),
            max_preferred_relays: 0,
            penalty_box: BTreeSet::new(),
            ping_rate: DEFAULT_PING_RATE,
            ptag_fanout_exclude_kinds: default_ptag_exclude_kinds(),
            network_online: true,
        }
    }

    pub fn set_ping_rate(&mut self, ping_rate: Duration) {
        self.ping_rate = ping_rate;
    }

    pub fn set_ptag_fanout_exclude_kinds(&mut self, kinds: BTreeSet<u64>) {
        self.ptag_fanout_exclude_kinds = kinds;
    }

    /// Fresh random id for a new subscription.
    pub fn new_subscription_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Register a relay the caller picked. Returns the existing
    /// connection untouched when the url is already present.
    pub fn add_connection(&mut self, config: RelayConfig) -> &mut RelayConnection {
        let url = config.url().to_string();
        match self.connections.entry(url) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut conn = RelayConnection::new(config, Arc::clone(&self.wakeup));
                conn.set_online(self.network_online);
                entry.insert(conn)
            }
        }
    }

    /// Register a relay discovered through someone's relay list. Flags
    /// widen on repeat registration and never narrow, since a relay used
    /// to find one author's events may later also deliver ours.
    pub fn add_outbox_connection(&mut self, config: RelayConfig) -> &mut RelayConnection {
        let url = config.url().to_string();
        match self.outbox_connections.entry(url) {
            Entry::Occupied(entry) => {
                let conn = entry.into_mut();
                conn.config_mut().read |= config.read;
                conn.config_mut().write |= config.write;
                conn
            }
            Entry::Vacant(entry) => {
                let mut conn = RelayConnection::new(config, Arc::clone(&self.wakeup));
                conn.set_online(self.network_online);
                entry.insert(conn)
            }
        }
    }

    /// Tear a relay down and forget it, owned or outbox.
    pub fn remove_connection(&mut self, url: &str) {
        let url = normalize_relay_url(url);
        if let Some(mut conn) = self.connections.remove(&url) {
            conn.disconnect();
        } else if let Some(mut conn) = self.outbox_connections.remove(&url) {
            conn.disconnect();
        }
    }

    /// Connect every owned relay that is used for anything and not
    /// already up.
    pub fn connect_all(&mut self) {
        for conn in self.connections.values_mut() {
            if !(conn.config().read || conn.config().write) {
                continue;
            }
            if conn.is_connected() {
                continue;
            }
            conn.connect(None, false);
        }
    }

    pub fn disconnect_all(&mut self) {
        for conn in self
            .connections
            .values_mut()
            .chain(self.outbox_connections.values_mut())
        {
            conn.disconnect();
        }
    }

    pub fn connection(&mut self, url: &str) -> Option<&mut RelayConnection> {
        let url = normalize_relay_url(url);
        self.connections
            .get_mut(&url)
            .or_else(|| self.outbox_connections.get_mut(&url))
    }

    pub fn is_url_connected(&self, url: &str) -> bool {
        let url = normalize_relay_url(url);
        self.connections
            .get(&url)
            .or_else(|| self.outbox_connections.get(&url))
            .map_or(false, |conn| conn.is_connected())
    }

    pub fn urls(&self) -> BTreeSet<String> {
        self.connections.keys().cloned().collect()
    }

    pub fn outbox_urls(&self) -> BTreeSet<String> {
        self.outbox_connections.keys().cloned().collect()
    }

    pub fn connections_mut(&mut self) -> impl Iterator<Item = &mut RelayConnection> {
        self.connections.values_mut()
    }

    pub fn outbox_connections_mut(&mut self) -> impl Iterator<Item = &mut RelayConnection> {
        self.outbox_connections.values_mut()
    }

    pub fn preferred_relays(&self) -> Option<&PreferredRelays> {
        self.preferred_relays.as_ref()
    }

    pub fn penalty_box(&self) -> &BTreeSet<String> {
        &self.penalty_box
    }

    /// Drain pending socket events on every connection and report them
    /// to the delegate. Returns how many events were handled; call until
    /// it returns zero, or whenever the wakeup fires.
    pub fn poll(&mut self) -> usize {
        let mut events: Vec<(String, ConnEvent)> = Vec::new();
        for conn in self
            .connections
            .values_mut()
            .chain(self.outbox_connections.values_mut())
        {
            while let Some(event) = conn.poll_event() {
                events.push((conn.url().to_string(), event));
            }
        }

        let count = events.len();
        for (url, event) in events {
            match event {
                ConnEvent::Opened => self.delegate.did_connect(&url),
                ConnEvent::Message(text) => self.delegate.did_receive_message(&url, &text),
                ConnEvent::Closed => self.delegate.did_disconnect(&url),
                ConnEvent::Error(err) => self.delegate.did_disconnect_with_error(&url, &err),
            }
        }
        count
    }

    /// Periodic tick: throttled reconnects for dropped relays, rate
    /// limited pings on live ones.
    pub fn keepalive(&mut self) {
        let ping_rate = self.ping_rate;
        for conn in self
            .connections
            .values_mut()
            .chain(self.outbox_connections.values_mut())
        {
            if !(conn.config().read || conn.config().write) {
                continue;
            }
            match conn.status() {
                RelayStatus::Disconnected => conn.connect(None, false),
                RelayStatus::Connected => conn.keepalive_ping(ping_rate),
                RelayStatus::Connecting => {}
            }
        }
    }

    /// Feed reachability changes in. Going offline hangs up every used
    /// relay; coming back online force-reconnects them, bypassing the
    /// backoff throttle.
    pub fn set_network_online(&mut self, online: bool) {
        if self.network_online == online {
            return;
        }
        self.network_online = online;
        info!(
            "network {}",
            if online { "restored" } else { "unreachable" }
        );

        for conn in self
            .connections
            .values_mut()
            .chain(self.outbox_connections.values_mut())
        {
            let used = conn.config().read || conn.config().write;
            if online {
                conn.set_online(true);
                if used {
                    conn.connect(None, true);
                }
            } else {
                if used {
                    conn.disconnect();
                }
                conn.set_online(false);
            }
        }
    }

    /// Stop a subscription on every relay that has it, owned and outbox
    /// alike.
    pub fn close_subscription(&mut self, sub_id: &str) {
        let json = match ClientMessage::close(sub_id.to_string()).to_json() {
            Ok(json) => json,
            Err(err) => {
                error!("failed to serialize CLOSE for {}: {}", sub_id, err);
                return;
            }
        };

        for conn in self
            .connections
            .values_mut()
            .chain(self.outbox_connections.values_mut())
        {
            if !conn.is_connected() {
                continue;
            }
            if conn.has_subscription(sub_id) {
                conn.send(json.clone());
                conn.remove_subscription(sub_id);
            }
        }
    }

    /// Swap in a new batch of relay-list events and rebuild the routing
    /// tables. At most `max_preferred_relays` previously unknown relays
    /// get connections seeded up front, best coverage first.
    pub fn set_preferred_relays(&mut self, relay_list_events: Vec<Event>, max_preferred_relays: usize) {
        self.relay_list_events = relay_list_events;
        self.max_preferred_relays = max_preferred_relays;
        self.rebuild_preferred_relays();
    }

    /// Replace the set of relays excluded from outbox routing. Urls are
    /// normalized on the way in.
    pub fn set_penalty_box(&mut self, relays: BTreeSet<String>) {
        self.penalty_box = relays.iter().map(|url| normalize_relay_url(url)).collect();
        if !self.relay_list_events.is_empty() {
            self.rebuild_preferred_relays();
        }
    }

    /// Add one relay to the penalty box, rebuilding the routing tables
    /// if it was not already there.
    pub fn penalize(&mut self, url: &str) {
        let url = normalize_relay_url(url);
        if self.penalty_box.insert(url) && !self.relay_list_events.is_empty() {
            self.rebuild_preferred_relays();
        }
    }

    fn rebuild_preferred_relays(&mut self) {
        let preferred = PreferredRelays::from_events(&self.relay_list_events, &self.penalty_box);

        // Seed read-only connections for the best find-events relays so
        // callers can bring them up before the first request goes out.
        let mut ranked: Vec<(&String, usize)> = preferred
            .find_events_relays
            .iter()
            .map(|(url, pubkeys)| (url, pubkeys.len()))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let seeds: Vec<String> = ranked
            .into_iter()
            .filter(|(url, _)| !self.connections.contains_key(*url))
            .take(self.max_preferred_relays)
            .map(|(url, _)| url.clone())
            .collect();

        info!(
            "preferred relays: {} find-events, {} reach-users, seeding {}",
            preferred.find_events_relays.len(),
            preferred.reach_user_relays.len(),
            seeds.len()
        );

        for url in seeds {
            self.add_outbox_connection(RelayConfig::new(&url, true, false));
        }

        self.preferred_relays = Some(preferred);
    }

    /// Send to every applicable owned relay, then fan out over the
    /// outbox tables when they are loaded. Requests go to read relays,
    /// events to write relays, and CLOSE frames never open sockets.
    pub fn send_message(&mut self, message: &ClientMessage) {
        self.send_message_inner(message, false);
    }

    /// Like [`send_message`](Self::send_message), but connected relays
    /// get a ping ahead of the payload so a silently dead socket fails
    /// fast instead of swallowing the frame.
    pub fn send_message_after_ping(&mut self, message: &ClientMessage) {
        self.send_message_inner(message, true);
    }

    fn send_message_inner(&mut self, message: &ClientMessage, after_ping: bool) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                error!("failed to serialize client message: {}", err);
                return;
            }
        };

        for conn in self.connections.values_mut() {
            if !(conn.config().read || conn.config().write) {
                continue;
            }

            match message {
                ClientMessage::Req { sub_id, .. } => {
                    if !conn.config().read {
                        continue;
                    }
                    if !conn.is_connected() && !conn.is_connecting() {
                        conn.connect(None, false);
                    }
                    if conn.has_subscription(sub_id) {
                        // already streaming on this relay
                        continue;
                    }
                    conn.register_subscription(sub_id);
                    if after_ping && conn.is_connected() {
                        conn.ping();
                    }
                    conn.send(json.clone());
                }
                ClientMessage::Close { .. } => {
                    if !conn.config().read {
                        continue;
                    }
                    if !conn.is_connected() && !conn.is_connecting() {
                        continue;
                    }
                    conn.send(json.clone());
                }
                ClientMessage::Event { .. } => {
                    if !conn.config().write {
                        continue;
                    }
                    if !conn.is_connected() && !conn.is_connecting() {
                        conn.connect(None, false);
                    }
                    if after_ping && conn.is_connected() {
                        conn.ping();
                    }
                    conn.send(json.clone());
                }
            }
        }

        let (has_find, has_reach) = match self.preferred_relays.as_ref() {
            Some(preferred) => (
                !preferred.find_events_relays.is_empty(),
                !preferred.reach_user_relays.is_empty(),
            ),
            None => return,
        };

        match message {
            ClientMessage::Req { sub_id, filters } if has_find => {
                self.send_req_to_preferred(sub_id, filters);
            }
            ClientMessage::Event { event } if has_reach => {
                self.send_event_to_preferred(event, &json);
            }
            _ => {}
        }
    }

    /// Fan a request out to the relays where its authors publish. The
    /// authors of the first filter are the targets; every relay gets the
    /// same subscription id with filters narrowed to the authors it
    /// claimed.
    fn send_req_to_preferred(&mut self, sub_id: &str, filters: &[Filter]) {
        let Some(authors) = filters.first().and_then(|filter| filter.authors.as_ref()) else {
            return;
        };
        if authors.is_empty() {
            return;
        }
        let targets: HashSet<String> = authors.iter().cloned().collect();

        let our_read_relays: BTreeSet<String> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.config().read)
            .map(|(url, _)| url.clone())
            .collect();

        let Some(preferred) = self.preferred_relays.as_ref() else {
            return;
        };
        let plan = RequestPlan::build(&targets, filters, &our_read_relays, preferred, 0);

        let mut requests: Vec<_> = plan.find_events_requests.into_iter().collect();
        requests.sort_by(|a, b| {
            b.1.pubkeys
                .len()
                .cmp(&a.1.pubkeys.len())
                .then_with(|| a.0.cmp(&b.0))
        });
        requests.truncate(self.max_preferred_relays);

        for (url, request) in requests {
            debug!(
                "outbox: requesting {} authors from {}",
                request.pubkeys.len(),
                url
            );
            let json = match ClientMessage::req(sub_id.to_string(), request.filters).to_json() {
                Ok(json) => json,
                Err(err) => {
                    error!("failed to serialize outbox REQ for {}: {}", url, err);
                    continue;
                }
            };

            let conn = self.add_outbox_connection(RelayConfig::new(&url, true, false));
            if !conn.is_connected() && !conn.is_connecting() {
                conn.connect(None, false);
            }
            if conn.has_subscription(sub_id) {
                continue;
            }
            conn.register_subscription(sub_id);
            conn.send(json);
        }
    }

    /// Deliver a published event to the read relays of everyone p-tagged
    /// in it, so replies and mentions land where those people actually
    /// look.
    fn send_event_to_preferred(&mut self, event: &Event, json: &str) {
        if self.ptag_fanout_exclude_kinds.contains(&event.kind) {
            return;
        }

        let targets: HashSet<String> = event.tag_values("p").map(str::to_string).collect();
        if targets.is_empty() {
            return;
        }

        let our_write_relays: BTreeSet<String> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.config().write)
            .map(|(url, _)| url.clone())
            .collect();

        let Some(preferred) = self.preferred_relays.as_ref() else {
            return;
        };
        let plan = WritePlan::build(&targets, &our_write_relays, preferred);

        let mut relays: Vec<_> = plan.relays.into_iter().collect();
        relays.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));

        for (url, claimed) in relays {
            debug!(
                "outbox: delivering event to {} for {} tagged readers",
                url,
                claimed.len()
            );
            let conn = self.add_outbox_connection(RelayConfig::new(&url, false, true));
            if !conn.is_connected() && !conn.is_connecting() {
                conn.connect(None, false);
            }
            conn.send(json.to_string());
        }
    }
}
