//! Host-driven API: FieldSyncCore receives events from host, returns actions.

use std::time::{Duration, Instant};

use crate::device::Descriptor;
use crate::identity::{Identity, Namespace};
use crate::protocol::Message;
use crate::registry::{ConnectionId, Direction, PeerRegistry, RosterEntry};
use crate::sync::{SyncChannel, DEFAULT_ACK_DURATION};

/// Discovery poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Tunables for a session.
#[derive(Debug, Clone)]
pub struct Settings {
    pub poll_interval: Duration,
    pub ack_duration: Duration,
    pub redial_disconnected: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            ack_duration: DEFAULT_ACK_DURATION,
            redial_disconnected: true,
        }
    }
}

/// Main coordinator. Host passes events; core returns actions.
pub struct FieldSyncCore {
    registry: PeerRegistry,
    sync: SyncChannel,
}

impl FieldSyncCore {
    pub fn new(
        namespace: Namespace,
        identity: Identity,
        descriptor: Descriptor,
        settings: &Settings,
    ) -> Self {
        let mut registry = PeerRegistry::new(namespace, identity, descriptor);
        registry.set_redial_disconnected(settings.redial_disconnected);
        Self {
            registry,
            sync: SyncChannel::new(settings.ack_duration),
        }
    }

    pub fn identity(&self) -> &Identity {
        self.registry.self_id()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn sync(&self) -> &SyncChannel {
        &self.sync
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.registry.roster()
    }

    /// Discovery listing arrived.
    pub fn on_discovery(&mut self, listed: Vec<Identity>) -> Vec<Action> {
        self.registry.on_discovery(listed)
    }

    /// User asked to connect to a known device.
    pub fn connect(&mut self, remote: Identity) -> Vec<Action> {
        self.registry.connect(remote)
    }

    pub fn on_dial_failed(&mut self, remote: &Identity) {
        self.registry.on_dial_failed(remote);
    }

    pub fn on_connection_opened(
        &mut self,
        remote: Identity,
        connection: ConnectionId,
        direction: Direction,
    ) -> Vec<Action> {
        self.registry
            .on_connection_opened(remote, connection, direction)
    }

    pub fn on_connection_closed(&mut self, remote: &Identity, connection: ConnectionId) -> Vec<Action> {
        self.registry.on_connection_closed(remote, connection)
    }

    /// Process a decoded message from `remote`. Unknown message types are dropped.
    pub fn on_message_received(
        &mut self,
        remote: &Identity,
        message: Message,
        now: Instant,
    ) -> Vec<Action> {
        match message {
            Message::DeviceInfo { device } => self.registry.on_descriptor(remote, device),
            Message::InputSync { value } => self.sync.apply_remote_edit(value, now),
            Message::Unknown => {
                tracing::trace!(peer = %remote, "ignoring unknown message type");
                Vec::new()
            }
        }
    }

    /// Local user edited the field.
    pub fn broadcast_local_edit(&mut self, value: impl Into<String>) -> Vec<Action> {
        let connections: Vec<ConnectionId> = self.registry.open_connections().collect();
        self.sync.broadcast_local_edit(value, connections)
    }
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start an outbound connection attempt.
    Dial(Identity),
    /// Send a message on an open connection.
    Send {
        connection: ConnectionId,
        message: Message,
    },
    /// Tear down a connection.
    Close(ConnectionId),
    /// Roster changed; refresh observers.
    RosterChanged,
    /// Shared field now holds this value (remote edit).
    FieldChanged(String),
    /// Show the transient sync acknowledgment for `duration`.
    Acknowledge { duration: Duration },
}
