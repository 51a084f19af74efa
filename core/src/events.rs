//! Lifecycle events published by the engine
//!
//! Events go out on a broadcast channel. Sending never blocks and is a
//! no-op when nobody subscribed.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    User,
    Group,
    RootDse,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::User => write!(f, "user"),
            EntryKind::Group => write!(f, "group"),
            EntryKind::RootDse => write!(f, "root_dse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    Started { port: u16, tls: bool },
    Stopped,
    BindRequest { dn: String, peer: Option<SocketAddr> },
    BindSuccess { dn: String },
    BindFail { dn: String, reason: String },
    BindError { dn: String, error: String },
    NotificationRequest { username: String },
    NotificationResponse { username: String, outcome: String },
    SearchRequest { base: String, filter: String, intent: String },
    SearchResponse { entries: usize, duration: Duration },
    SearchError { filter: String, error: String },
    EntryFound { kind: EntryKind, dn: String },
    ClientError { peer: Option<SocketAddr>, error: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: GatewayEvent) {
        // Err only means there are no receivers
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
