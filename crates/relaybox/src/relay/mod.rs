pub mod config;
pub mod connection;
pub mod message;
pub mod pool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayStatus {
    Connected,
    Connecting,
    Disconnected,
}
