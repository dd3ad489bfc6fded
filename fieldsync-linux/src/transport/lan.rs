//! LAN transport: UDP multicast beacons for the identity listing, TCP for data channels.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use fieldsync_core::wire::{decode_frame, encode_frame};
use fieldsync_core::{Direction, Identity};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{exchange_hello, spawn_channel, EventSender, EventStream, Transport, TransportError, TransportEvent};
use crate::config::Config;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 60);

/// Presence advertisement carried in each multicast datagram.
#[derive(Debug, Serialize, Deserialize)]
struct Beacon {
    identity: Identity,
    listen_port: u16,
}

struct SeenPeer {
    addr: SocketAddr,
    last_seen: Instant,
}

type SeenPeers = Arc<Mutex<HashMap<Identity, SeenPeer>>>;

struct Opened {
    identity: Identity,
    events: EventSender,
    tasks: Vec<JoinHandle<()>>,
}

pub struct LanTransport {
    discovery_port: u16,
    transport_port: u16,
    beacon_interval: Duration,
    peer_timeout: Duration,
    seen: SeenPeers,
    listening: Arc<AtomicBool>,
    opened: StdMutex<Option<Opened>>,
}

impl LanTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            discovery_port: config.discovery_port,
            transport_port: config.transport_port,
            beacon_interval: Duration::from_millis(config.beacon_interval_ms.max(1)),
            peer_timeout: Duration::from_millis(config.peer_timeout_ms),
            seen: Arc::new(Mutex::new(HashMap::new())),
            listening: Arc::new(AtomicBool::new(false)),
            opened: StdMutex::new(None),
        }
    }

    fn opened_state(&self) -> Option<(Identity, EventSender)> {
        let guard = self.opened.lock().ok()?;
        guard
            .as_ref()
            .map(|o| (o.identity.clone(), o.events.clone()))
    }
}

impl Transport for LanTransport {
    async fn open(&self, identity: Identity) -> Result<EventStream, TransportError> {
        if self.seen.lock().await.contains_key(&identity) {
            return Err(TransportError::IdentityTaken(identity));
        }
        let listener = TcpListener::bind(("0.0.0.0", self.transport_port)).await?;
        let listen_port = listener.local_addr()?.port();
        let socket = Arc::new(make_multicast_socket(self.discovery_port)?);
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

        let beacon = encode_frame(&Beacon {
            identity: identity.clone(),
            listen_port,
        })
        .map_err(|e| TransportError::Io(e.to_string()))?;
        let dest = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, self.discovery_port));

        self.listening.store(true, Ordering::Relaxed);
        let tasks = vec![
            tokio::spawn(beacon_loop(socket.clone(), beacon, dest, self.beacon_interval)),
            tokio::spawn(recv_loop(
                socket,
                self.seen.clone(),
                identity.clone(),
                self.listening.clone(),
                events_tx.clone(),
            )),
            tokio::spawn(accept_loop(listener, identity.clone(), events_tx.clone())),
        ];
        tracing::info!(%identity, listen_port, discovery_port = self.discovery_port, "lan transport open");

        if let Ok(mut guard) = self.opened.lock() {
            *guard = Some(Opened {
                identity,
                events: events_tx,
                tasks,
            });
        }
        Ok(events_rx)
    }

    fn connect(&self, remote: Identity) {
        let Some((me, events)) = self.opened_state() else {
            tracing::warn!(peer = %remote, "connect before open");
            return;
        };
        let seen = self.seen.clone();
        tokio::spawn(async move {
            let addr = seen.lock().await.get(&remote).map(|p| p.addr);
            let result = match addr {
                Some(addr) => dial(addr, &me, &remote).await,
                None => Err(TransportError::UnknownPeer(remote.clone())),
            };
            match result {
                Ok(stream) => {
                    let (r, w) = stream.into_split();
                    spawn_channel(r, w, remote, Direction::Outbound, events);
                }
                Err(error) => {
                    let _ = events.send(TransportEvent::DialFailed { remote, error });
                }
            }
        });
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, TransportError> {
        if self.opened_state().is_none() {
            return Err(TransportError::NotOpen);
        }
        if !self.listening.load(Ordering::Relaxed) {
            return Err(TransportError::Listing("discovery socket closed".into()));
        }
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, p| now.duration_since(p.last_seen) < self.peer_timeout);
        Ok(seen.keys().cloned().collect())
    }

    fn close(&self) {
        let opened = self.opened.lock().ok().and_then(|mut g| g.take());
        if let Some(o) = opened {
            for task in o.tasks {
                task.abort();
            }
            tracing::info!(identity = %o.identity, "lan transport closed");
        }
        self.listening.store(false, Ordering::Relaxed);
    }
}

async fn dial(addr: SocketAddr, me: &Identity, remote: &Identity) -> Result<TcpStream, TransportError> {
    let mut stream = TcpStream::connect(addr).await?;
    let answered = exchange_hello(&mut stream, me).await?;
    if answered != *remote {
        return Err(TransportError::Handshake(format!(
            "expected {remote}, reached {answered}"
        )));
    }
    Ok(stream)
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, discovery_port)).into())?;
    socket.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn beacon_loop(socket: Arc<UdpSocket>, frame: Vec<u8>, dest: SocketAddr, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if let Err(e) = socket.send_to(&frame, dest).await {
            tracing::warn!(error = %e, "beacon send failed");
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    seen: SeenPeers,
    me: Identity,
    listening: Arc<AtomicBool>,
    events: EventSender,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "discovery socket failed");
                listening.store(false, Ordering::Relaxed);
                let _ = events.send(TransportEvent::Error(e.into()));
                return;
            }
        };
        let Ok((beacon, _)) = decode_frame::<Beacon>(&buf[..n]) else {
            tracing::trace!(%from, "ignoring non-beacon datagram");
            continue;
        };
        if beacon.identity == me {
            continue;
        }
        let addr = SocketAddr::new(from.ip(), beacon.listen_port);
        let mut p = seen.lock().await;
        if !p.contains_key(&beacon.identity) {
            tracing::debug!(peer = %beacon.identity, %addr, "beacon from new peer");
        }
        p.insert(
            beacon.identity,
            SeenPeer {
                addr,
                last_seen: Instant::now(),
            },
        );
    }
}

async fn accept_loop(listener: TcpListener, me: Identity, events: EventSender) {
    loop {
        let (mut stream, from) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                let _ = events.send(TransportEvent::Error(e.into()));
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let me = me.clone();
        let events = events.clone();
        tokio::spawn(async move {
            match exchange_hello(&mut stream, &me).await {
                Ok(remote) => {
                    let (r, w) = stream.into_split();
                    spawn_channel(r, w, remote, Direction::Inbound, events);
                }
                Err(e) => tracing::debug!(%from, error = %e, "incoming handshake failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_frame_roundtrip_shape() {
        let frame = encode_frame(&Beacon {
            identity: Identity::new("p2p-sync-public-room-abc"),
            listen_port: 4000,
        })
        .unwrap();
        let (beacon, n) = decode_frame::<Beacon>(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(beacon.listen_port, 4000);
        assert!(decode_frame::<Beacon>(b"\x02\x00\x00\x00{}").is_err());
    }

    #[tokio::test]
    async fn list_requires_open() {
        let lan = LanTransport::new(&Config::default());
        assert!(matches!(
            lan.list_identities().await,
            Err(TransportError::NotOpen)
        ));
    }

    #[tokio::test]
    async fn stale_peers_are_not_listed() {
        let config = Config {
            peer_timeout_ms: 50,
            ..Config::default()
        };
        let lan = LanTransport::new(&config);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        *lan.opened.lock().unwrap() = Some(Opened {
            identity: Identity::new("p2p-sync-x-me"),
            events: tx,
            tasks: Vec::new(),
        });
        lan.listening.store(true, Ordering::Relaxed);
        {
            let mut seen = lan.seen.lock().await;
            let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
            seen.insert(
                Identity::new("p2p-sync-x-fresh"),
                SeenPeer {
                    addr,
                    last_seen: Instant::now(),
                },
            );
            seen.insert(
                Identity::new("p2p-sync-x-stale"),
                SeenPeer {
                    addr,
                    last_seen: Instant::now() - Duration::from_secs(1),
                },
            );
        }
        let listed = lan.list_identities().await.unwrap();
        assert_eq!(listed, vec![Identity::new("p2p-sync-x-fresh")]);
    }
}
