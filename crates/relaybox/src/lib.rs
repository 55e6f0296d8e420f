mod client;
mod error;
mod event;
mod filter;
pub mod outbox;
pub mod relay;

pub use client::ClientMessage;
pub use error::Error;
pub use event::Event;
pub use ewebsock;
pub use filter::Filter;
pub use outbox::{FindEventsRequest, PreferredRelays, RequestPlan, WritePlan};
pub use relay::config::{normalize_relay_url, RelayConfig};
pub use relay::connection::{RelayConnection, Wakeup, MAX_BACKOFF};
pub use relay::message::{CommandResult, RelayMessage};
pub use relay::pool::{ConnectionPool, RelayConnectionDelegate, DEFAULT_PING_RATE};
pub use relay::RelayStatus;

pub type Result<T> = std::result::Result<T, error::Error>;
