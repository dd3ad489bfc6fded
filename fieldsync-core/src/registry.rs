//! Peer registry: the roster of known identities and the live connection to each.
//!
//! The registry never performs I/O. Discovery results and connection lifecycle
//! events come in from the host; dials, sends and closes go back out as [`Action`]s.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;

use crate::core::Action;
use crate::device::Descriptor;
use crate::identity::{Identity, Namespace};
use crate::protocol::Message;

/// Host-allocated handle for one open data channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct ConnectionId(pub u64);

/// Which side initiated a connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// One row of the roster.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct RosterEntry {
    pub identity: Identity,
    pub descriptor: Descriptor,
    pub connected: bool,
    pub is_self: bool,
}

struct Peer {
    descriptor: Descriptor,
    connected: bool,
}

#[derive(Clone, Copy)]
struct OpenConnection {
    id: ConnectionId,
    direction: Direction,
}

pub struct PeerRegistry {
    namespace: Namespace,
    self_id: Identity,
    self_descriptor: Descriptor,
    peers: BTreeMap<Identity, Peer>,
    connections: HashMap<Identity, OpenConnection>,
    dialing: HashSet<Identity>,
    redial_disconnected: bool,
}

impl PeerRegistry {
    /// Register this session's own identity. The self entry is always connected.
    pub fn new(namespace: Namespace, self_id: Identity, descriptor: Descriptor) -> Self {
        Self {
            namespace,
            self_id,
            self_descriptor: descriptor,
            peers: BTreeMap::new(),
            connections: HashMap::new(),
            dialing: HashSet::new(),
            redial_disconnected: true,
        }
    }

    /// Whether discovery redials known peers that are currently disconnected.
    pub fn set_redial_disconnected(&mut self, redial: bool) {
        self.redial_disconnected = redial;
    }

    pub fn self_id(&self) -> &Identity {
        &self.self_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn self_descriptor(&self) -> &Descriptor {
        &self.self_descriptor
    }

    /// Reconcile one discovery listing. Unseen identities in our namespace get a
    /// placeholder entry and an outbound dial.
    pub fn on_discovery<I>(&mut self, listed: I) -> Vec<Action>
    where
        I: IntoIterator<Item = Identity>,
    {
        let mut actions = Vec::new();
        let mut added = false;
        for id in listed {
            if id == self.self_id || !id.in_namespace(&self.namespace) {
                continue;
            }
            let known = self.peers.contains_key(&id);
            if !known {
                tracing::debug!(peer = %id, "discovered peer");
                self.peers.insert(
                    id.clone(),
                    Peer {
                        descriptor: Descriptor::placeholder(),
                        connected: false,
                    },
                );
                added = true;
            }
            if !known || self.redial_disconnected {
                actions.extend(self.dial(id));
            }
        }
        if added {
            actions.push(Action::RosterChanged);
        }
        actions
    }

    /// Explicit connect request (e.g. the user picked a nearby device).
    pub fn connect(&mut self, remote: Identity) -> Vec<Action> {
        if remote == self.self_id {
            return Vec::new();
        }
        let mut actions = Vec::new();
        if !self.peers.contains_key(&remote) {
            self.peers.insert(
                remote.clone(),
                Peer {
                    descriptor: Descriptor::placeholder(),
                    connected: false,
                },
            );
            actions.push(Action::RosterChanged);
        }
        actions.extend(self.dial(remote));
        actions
    }

    fn dial(&mut self, remote: Identity) -> Option<Action> {
        if remote == self.self_id
            || self.connections.contains_key(&remote)
            || self.dialing.contains(&remote)
        {
            return None;
        }
        tracing::debug!(peer = %remote, "dialing");
        self.dialing.insert(remote.clone());
        Some(Action::Dial(remote))
    }

    /// An outbound attempt never reached the open state.
    pub fn on_dial_failed(&mut self, remote: &Identity) {
        self.dialing.remove(remote);
    }

    /// A connection to `remote` opened, in either direction.
    pub fn on_connection_opened(
        &mut self,
        remote: Identity,
        connection: ConnectionId,
        direction: Direction,
    ) -> Vec<Action> {
        if remote == self.self_id {
            return vec![Action::Close(connection)];
        }
        if direction == Direction::Outbound {
            self.dialing.remove(&remote);
        }

        let mut actions = Vec::new();
        if let Some(existing) = self.connections.get(&remote).copied() {
            if existing.id != connection {
                // Keep the connection dialed by the smaller identity; both ends agree on it.
                if self.is_canonical(&remote, existing.direction)
                    && !self.is_canonical(&remote, direction)
                {
                    tracing::debug!(peer = %remote, ?connection, "dropping duplicate connection");
                    return vec![Action::Close(connection)];
                }
                tracing::debug!(peer = %remote, old = ?existing.id, new = ?connection, "replacing connection");
                actions.push(Action::Close(existing.id));
            }
        }

        self.connections.insert(
            remote.clone(),
            OpenConnection {
                id: connection,
                direction,
            },
        );
        let peer = self.peers.entry(remote.clone()).or_insert_with(|| Peer {
            descriptor: Descriptor::placeholder(),
            connected: false,
        });
        peer.connected = true;
        tracing::info!(peer = %remote, ?direction, "connection open");

        actions.push(Action::Send {
            connection,
            message: Message::DeviceInfo {
                device: self.self_descriptor.clone(),
            },
        });
        actions.push(Action::RosterChanged);
        actions
    }

    fn is_canonical(&self, remote: &Identity, direction: Direction) -> bool {
        match direction {
            Direction::Outbound => self.self_id < *remote,
            Direction::Inbound => *remote < self.self_id,
        }
    }

    /// `remote` announced its descriptor.
    pub fn on_descriptor(&mut self, remote: &Identity, descriptor: Descriptor) -> Vec<Action> {
        match self.peers.get_mut(remote) {
            Some(peer) => {
                peer.descriptor = descriptor;
                vec![Action::RosterChanged]
            }
            None => Vec::new(),
        }
    }

    /// A connection closed. Closes of connections that were already superseded are ignored.
    pub fn on_connection_closed(
        &mut self,
        remote: &Identity,
        connection: ConnectionId,
    ) -> Vec<Action> {
        match self.connections.get(remote) {
            Some(open) if open.id == connection => {}
            _ => return Vec::new(),
        }
        self.connections.remove(remote);
        if let Some(peer) = self.peers.get_mut(remote) {
            peer.connected = false;
        }
        tracing::info!(peer = %remote, "connection closed");
        vec![Action::RosterChanged]
    }

    /// Live connection for `remote`, if any.
    pub fn connection(&self, remote: &Identity) -> Option<ConnectionId> {
        self.connections.get(remote).map(|c| c.id)
    }

    pub fn open_connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.connections.values().map(|c| c.id)
    }

    pub fn is_dialing(&self, remote: &Identity) -> bool {
        self.dialing.contains(remote)
    }

    /// Number of remote peers with a live connection.
    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }

    /// Roster snapshot: self first, then peers ordered by identity.
    pub fn roster(&self) -> Vec<RosterEntry> {
        let me = RosterEntry {
            identity: self.self_id.clone(),
            descriptor: self.self_descriptor.clone(),
            connected: true,
            is_self: true,
        };
        std::iter::once(me)
            .chain(self.peers.iter().map(|(id, peer)| RosterEntry {
                identity: id.clone(),
                descriptor: peer.descriptor.clone(),
                connected: peer.connected,
                is_self: false,
            }))
            .collect()
    }

    /// Identities seen before but not connected now.
    pub fn known_disconnected(&self) -> Vec<Identity> {
        self.peers
            .iter()
            .filter(|(_, p)| !p.connected)
            .map(|(id, _)| id.clone())
            .collect()
    }
}
