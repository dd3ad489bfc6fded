//! In-memory transport: a shared broker routing duplex streams between sessions in one process.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fieldsync_core::{Direction, Identity};

use super::{spawn_channel, EventSender, EventStream, Transport, TransportError, TransportEvent};

const DUPLEX_BUF_SIZE: usize = 64 * 1024;

#[derive(Default)]
struct Broker {
    registered: HashMap<Identity, EventSender>,
    /// Registered but not yet visible in listings.
    hidden: HashSet<Identity>,
}

/// Shared network; clone it into each transport.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    broker: Arc<Mutex<Broker>>,
    listing_fails: Arc<AtomicBool>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn broker(&self) -> MutexGuard<'_, Broker> {
        self.broker.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            me: Mutex::new(None),
        }
    }

    /// Make every listing call fail until cleared.
    pub fn fail_listing(&self, fail: bool) {
        self.listing_fails.store(fail, Ordering::Relaxed);
    }

    /// Simulate propagation delay: `identity` stays out of listings until revealed.
    pub fn hide(&self, identity: &Identity) {
        self.broker().hidden.insert(identity.clone());
    }

    pub fn reveal(&self, identity: &Identity) {
        self.broker().hidden.remove(identity);
    }

    pub fn registered(&self) -> Vec<Identity> {
        self.broker().registered.keys().cloned().collect()
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    me: Mutex<Option<(Identity, EventSender)>>,
}

impl MemoryTransport {
    fn me(&self) -> Option<(Identity, EventSender)> {
        self.me.lock().ok().and_then(|g| g.clone())
    }
}

impl Transport for MemoryTransport {
    async fn open(&self, identity: Identity) -> Result<EventStream, TransportError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        {
            let mut broker = self.network.broker();
            if broker.registered.contains_key(&identity) {
                return Err(TransportError::IdentityTaken(identity));
            }
            broker.registered.insert(identity.clone(), tx.clone());
        }
        if let Ok(mut me) = self.me.lock() {
            *me = Some((identity, tx));
        }
        Ok(rx)
    }

    fn connect(&self, remote: Identity) {
        let Some((me, my_events)) = self.me() else {
            return;
        };
        let their_events = self.network.broker().registered.get(&remote).cloned();
        tokio::spawn(async move {
            let Some(their_events) = their_events else {
                let _ = my_events.send(TransportEvent::DialFailed {
                    remote: remote.clone(),
                    error: TransportError::UnknownPeer(remote),
                });
                return;
            };
            let (near, far) = tokio::io::duplex(DUPLEX_BUF_SIZE);
            let (far_r, far_w) = tokio::io::split(far);
            spawn_channel(far_r, far_w, me, Direction::Inbound, their_events);
            let (near_r, near_w) = tokio::io::split(near);
            spawn_channel(near_r, near_w, remote, Direction::Outbound, my_events);
        });
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, TransportError> {
        if self.me().is_none() {
            return Err(TransportError::NotOpen);
        }
        if self.network.listing_fails.load(Ordering::Relaxed) {
            return Err(TransportError::Listing("signaling server unavailable".into()));
        }
        let broker = self.network.broker();
        Ok(broker
            .registered
            .keys()
            .filter(|id| !broker.hidden.contains(*id))
            .cloned()
            .collect())
    }

    fn close(&self) {
        let Some((me, _)) = self.me.lock().ok().and_then(|mut g| g.take()) else {
            return;
        };
        self.network.broker().registered.remove(&me);
    }
}
