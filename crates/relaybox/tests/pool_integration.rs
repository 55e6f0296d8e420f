//! End to end pool behavior against a real relay on localhost.
//!
//! These tests use `nostr-relay-builder::LocalRelay` to exercise the
//! full lifecycle: connect, subscribe, EOSE delivery through the
//! delegate, outbox fan-out to relays the pool never owned, and
//! reconnects after local teardown.

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use nostr_relay_builder::{LocalRelay, RelayBuilder};
use relaybox::{
    normalize_relay_url, ClientMessage, ConnectionPool, Error, Event, Filter, RelayConfig,
    RelayConnectionDelegate,
};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests (only runs once even if called multiple times)
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("relaybox=debug".parse().unwrap()),
            )
            .with_test_writer()
            .init();
    });
}

/// Helper to create a LocalRelay with default settings for tests.
/// Returns the relay handle (must be kept alive) and its normalized URL.
async fn create_test_relay() -> (LocalRelay, String) {
    let relay = LocalRelay::run(RelayBuilder::default())
        .await
        .expect("failed to start relay");

    let url = normalize_relay_url(&relay.url());
    tracing::info!("LocalRelay listening at {}", url);
    (relay, url)
}

/// Delegate that records every callback so tests can assert on them
/// after the pool has been pumped.
#[derive(Default, Clone)]
struct RecordingDelegate {
    state: Arc<Mutex<DelegateState>>,
}

#[derive(Default)]
struct DelegateState {
    connected: Vec<String>,
    disconnected: Vec<String>,
    errors: Vec<String>,
    messages: Vec<(String, String)>,
}

impl RecordingDelegate {
    fn connect_count(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .connected
            .iter()
            .filter(|u| *u == url)
            .count()
    }

    fn is_connected_reported(&self, url: &str) -> bool {
        self.connect_count(url) > 0
    }

    fn eose_count(&self, url: &str, sub_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|(from, msg)| from == url && msg.contains("EOSE") && msg.contains(sub_id))
            .count()
    }

    fn saw_eose(&self, url: &str, sub_id: &str) -> bool {
        self.eose_count(url, sub_id) > 0
    }

    fn message_count(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .messages
            .iter()
            .filter(|(from, _)| from == url)
            .count()
    }

    fn error_count(&self) -> usize {
        self.state.lock().unwrap().errors.len()
    }
}

impl RelayConnectionDelegate for RecordingDelegate {
    fn did_connect(&mut self, url: &str) {
        self.state.lock().unwrap().connected.push(url.to_string());
    }

    fn did_receive_message(&mut self, url: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .messages
            .push((url.to_string(), message.to_string()));
    }

    fn did_disconnect(&mut self, url: &str) {
        self.state.lock().unwrap().disconnected.push(url.to_string());
    }

    fn did_disconnect_with_error(&mut self, _url: &str, error: &Error) {
        self.state.lock().unwrap().errors.push(error.to_string());
    }
}

/// Polls the pool until the predicate returns true or the attempt limit
/// is reached. Returns whether the predicate was ultimately satisfied.
async fn pump_pool_until<F>(
    pool: &mut ConnectionPool,
    max_attempts: usize,
    sleep_duration: Duration,
    mut predicate: F,
) -> bool
where
    F: FnMut(&mut ConnectionPool) -> bool,
{
    for _ in 0..max_attempts {
        pool.poll();
        if predicate(pool) {
            return true;
        }
        tokio::time::sleep(sleep_duration).await;
    }

    pool.poll();
    predicate(pool)
}

async fn default_pool_pump<F>(pool: &mut ConnectionPool, predicate: F) -> bool
where
    F: FnMut(&mut ConnectionPool) -> bool,
{
    pump_pool_until(pool, 200, Duration::from_millis(25), predicate).await
}

fn relay_list_event(pubkey: &str, relay_url: &str, marker: Option<&str>) -> Event {
    let mut tag = vec!["r".to_string(), relay_url.to_string()];
    if let Some(marker) = marker {
        tag.push(marker.to_string());
    }
    Event {
        id: format!("{pubkey}-relay-list"),
        pubkey: pubkey.to_string(),
        created_at: 1700000000,
        kind: 10002,
        tags: vec![tag],
        content: String::new(),
        sig: String::new(),
    }
}

fn text_note(pubkey: &str) -> Event {
    Event {
        id: "5e".repeat(32),
        pubkey: pubkey.to_string(),
        created_at: 1700000000,
        kind: 1,
        tags: Vec::new(),
        content: "hello from the pool".to_string(),
        sig: "00".repeat(64),
    }
}

// ==================== Connection lifecycle ====================

#[tokio::test]
async fn pool_connects_and_reports_through_the_delegate() {
    init_tracing();
    let (_relay, url) = create_test_relay().await;

    let app = RecordingDelegate::default();
    let mut pool = ConnectionPool::new(app.clone(), || {});
    pool.add_connection(RelayConfig::new(&url, true, true));
    pool.connect_all();

    let connected = default_pool_pump(&mut pool, |pool| pool.is_url_connected(&url)).await;
    assert!(connected, "pool never connected to {url}");
    assert!(app.is_connected_reported(&url));
    assert_eq!(app.error_count(), 0);
}

#[tokio::test]
async fn subscription_gets_an_eose_and_close_cleans_up() {
    init_tracing();
    let (_relay, url) = create_test_relay().await;

    let app = RecordingDelegate::default();
    let mut pool = ConnectionPool::new(app.clone(), || {});
    pool.add_connection(RelayConfig::new(&url, true, true));
    pool.connect_all();
    assert!(default_pool_pump(&mut pool, |pool| pool.is_url_connected(&url)).await);

    let sub_id = ConnectionPool::new_subscription_id();
    let req = ClientMessage::req(sub_id.clone(), vec![Filter::new().kinds(vec![1]).limit(1)]);
    pool.send_message_after_ping(&req);

    let got_eose = default_pool_pump(&mut pool, |_| app.saw_eose(&url, &sub_id)).await;
    assert!(got_eose, "no EOSE for {sub_id} from {url}");

    {
        let conn = pool.connection(&url).expect("connection exists");
        assert!(conn.has_subscription(&sub_id));
    }

    pool.close_subscription(&sub_id);
    let conn = pool.connection(&url).expect("connection exists");
    assert!(!conn.has_subscription(&sub_id));
    assert_eq!(conn.subscription_count(), 0);
}

#[tokio::test]
async fn publishing_while_disconnected_connects_and_drains_the_queue() {
    init_tracing();
    let (_relay, url) = create_test_relay().await;

    let app = RecordingDelegate::default();
    let mut pool = ConnectionPool::new(app.clone(), || {});
    pool.add_connection(RelayConfig::new(&url, true, true));

    // no connect_all: sending is what brings the socket up
    let note = ClientMessage::event(text_note(&"ab".repeat(32)));
    pool.send_message(&note);

    let drained = default_pool_pump(&mut pool, |pool| {
        pool.is_url_connected(&url)
            && pool
                .connection(&url)
                .map(|conn| conn.queued_message_count() == 0)
                .unwrap_or(false)
    })
    .await;
    assert!(drained, "queued event never made it onto the socket");
    assert!(app.is_connected_reported(&url));
}

// ==================== Outbox routing ====================

#[tokio::test]
async fn requests_fan_out_to_the_authors_write_relay() {
    init_tracing();
    let (_owned_relay, owned_url) = create_test_relay().await;
    let (_outbox_relay, outbox_url) = create_test_relay().await;

    let alice = "a1".repeat(32);

    let app = RecordingDelegate::default();
    let mut pool = ConnectionPool::new(app.clone(), || {});
    pool.add_connection(RelayConfig::new(&owned_url, true, true));
    pool.set_preferred_relays(
        vec![relay_list_event(&alice, &outbox_url, Some("write"))],
        10,
    );

    // the relay list seeded a read-only connection for the write relay
    assert!(pool.outbox_urls().contains(&outbox_url));
    assert!(!pool.urls().contains(&outbox_url));

    let sub_id = ConnectionPool::new_subscription_id();
    let req = ClientMessage::req(
        sub_id.clone(),
        vec![Filter::new().authors(vec![alice.clone()]).kinds(vec![1])],
    );
    pool.send_message(&req);

    let both_eosed = default_pool_pump(&mut pool, |_| {
        app.saw_eose(&owned_url, &sub_id) && app.saw_eose(&outbox_url, &sub_id)
    })
    .await;
    assert!(both_eosed, "owned and outbox relays must both answer {sub_id}");

    // the plan needed exactly one relay beyond our own
    assert_eq!(pool.outbox_urls().len(), 1);

    {
        let conn = pool.connection(&outbox_url).expect("outbox connection");
        assert!(conn.has_subscription(&sub_id));
        assert!(conn.config().read);
    }

    // closing reaches the outbox connection too
    pool.close_subscription(&sub_id);
    assert!(!pool
        .connection(&outbox_url)
        .expect("outbox connection")
        .has_subscription(&sub_id));
    assert!(!pool
        .connection(&owned_url)
        .expect("owned connection")
        .has_subscription(&sub_id));
}

// ==================== Reconnects ====================

#[tokio::test]
async fn keepalive_brings_a_dropped_connection_back() {
    init_tracing();
    let (_relay, url) = create_test_relay().await;

    let app = RecordingDelegate::default();
    let mut pool = ConnectionPool::new(app.clone(), || {});
    pool.add_connection(RelayConfig::new(&url, true, true));
    pool.connect_all();
    assert!(default_pool_pump(&mut pool, |pool| pool.is_url_connected(&url)).await);

    // local teardown is silent and resets the backoff
    pool.connection(&url).expect("connection").disconnect();
    assert!(!pool.is_url_connected(&url));

    pool.keepalive();
    let reconnected = default_pool_pump(&mut pool, |pool| pool.is_url_connected(&url)).await;
    assert!(reconnected, "keepalive never reconnected {url}");
    assert!(app.connect_count(&url) >= 2);
}

#[tokio::test]
async fn network_flap_forces_a_reconnect() {
    init_tracing();
    let (_relay, url) = create_test_relay().await;

    let app = RecordingDelegate::default();
    let mut pool = ConnectionPool::new(app.clone(), || {});
    pool.add_connection(RelayConfig::new(&url, true, true));
    pool.connect_all();
    assert!(default_pool_pump(&mut pool, |pool| pool.is_url_connected(&url)).await);

    pool.set_network_online(false);
    assert!(!pool.is_url_connected(&url));

    // while offline, nothing reconnects
    pool.keepalive();
    pool.poll();
    assert!(!pool.is_url_connected(&url));

    pool.set_network_online(true);
    let reconnected = default_pool_pump(&mut pool, |pool| pool.is_url_connected(&url)).await;
    assert!(reconnected, "pool did not come back after the network did");
    assert!(app.connect_count(&url) >= 2);
}

#[tokio::test]
async fn repeated_requests_for_a_subscription_are_suppressed() {
    init_tracing();
    let (_relay, url) = create_test_relay().await;

    let app = RecordingDelegate::default();
    let mut pool = ConnectionPool::new(app.clone(), || {});
    pool.add_connection(RelayConfig::new(&url, true, true));

    let sub_id = ConnectionPool::new_subscription_id();
    let req = ClientMessage::req(sub_id.clone(), vec![Filter::new().kinds(vec![1])]);
    pool.send_message(&req);
    assert!(default_pool_pump(&mut pool, |_| app.saw_eose(&url, &sub_id)).await);

    // same subscription id again: the relay must not see a second REQ
    pool.send_message(&req);
    pump_pool_until(&mut pool, 20, Duration::from_millis(25), |_| false).await;

    assert_eq!(app.eose_count(&url, &sub_id), 1);
    assert_eq!(
        pool.connection(&url)
            .expect("connection")
            .subscription_count(),
        1
    );
}

#[tokio::test]
async fn messages_from_the_relay_reach_the_delegate_verbatim() {
    init_tracing();
    let (_relay, url) = create_test_relay().await;

    let app = RecordingDelegate::default();
    let mut pool = ConnectionPool::new(app.clone(), || {});
    pool.add_connection(RelayConfig::new(&url, true, true));

    let sub_id = ConnectionPool::new_subscription_id();
    let req = ClientMessage::req(sub_id.clone(), vec![Filter::new().kinds(vec![1])]);
    // REQ on a disconnected read relay connects it first
    pool.send_message(&req);

    assert!(default_pool_pump(&mut pool, |_| app.saw_eose(&url, &sub_id)).await);
    assert!(app.message_count(&url) >= 1);

    // every recorded frame parses as a relay message
    for (_, raw) in app.state.lock().unwrap().messages.iter() {
        relaybox::RelayMessage::from_json(raw).expect("relay sent a well-formed frame");
    }
}
