//! Transport collaborator: identity registration, peer listing and data channels.
//!
//! Implementations report everything through a [`TransportEvent`] stream; the
//! session loop is the only consumer.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use fieldsync_core::wire::{self, LEN_SIZE};
use fieldsync_core::{ConnectionId, Direction, Identity, Message};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub mod lan;
#[cfg(test)]
pub mod memory;

pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;
type EventSender = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport not open")]
    NotOpen,
    #[error("identity {0} already registered")]
    IdentityTaken(Identity),
    #[error("peer {0} not reachable")]
    UnknownPeer(Identity),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("listing unavailable: {0}")]
    Listing(String),
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    Opened {
        remote: Identity,
        link: Link,
        direction: Direction,
    },
    Message {
        connection: ConnectionId,
        remote: Identity,
        message: Message,
    },
    Closed {
        connection: ConnectionId,
        remote: Identity,
    },
    DialFailed {
        remote: Identity,
        error: TransportError,
    },
    /// Signaling-level failure; informational.
    Error(TransportError),
}

/// Signaling and data-channel provider.
pub trait Transport: Send + Sync + 'static {
    /// Register `identity` on the network and subscribe to its events.
    fn open(
        &self,
        identity: Identity,
    ) -> impl Future<Output = Result<EventStream, TransportError>> + Send;

    /// Start an outbound connection. The outcome arrives as `Opened` or `DialFailed`.
    fn connect(&self, remote: Identity);

    /// Best-effort listing of registered identities; may lag recent joins.
    fn list_identities(&self) -> impl Future<Output = Result<Vec<Identity>, TransportError>> + Send;

    /// Unregister and stop background work.
    fn close(&self);
}

/// Sending side of one open data channel. Dropping it closes the channel.
#[derive(Debug)]
pub struct Link {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
}

impl Link {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        self.tx.send(message).map_err(|_| TransportError::Closed)
    }
}

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

fn next_connection_id() -> ConnectionId {
    ConnectionId(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
}

/// Run a framed data channel over a byte stream: report `Opened`, then one
/// `Message` per frame, then `Closed` once the stream ends.
pub(crate) fn spawn_channel<R, W>(
    mut reader: R,
    mut writer: W,
    remote: Identity,
    direction: Direction,
    events: EventSender,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let id = next_connection_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    if events
        .send(TransportEvent::Opened {
            remote: remote.clone(),
            link: Link { id, tx },
            direction,
        })
        .is_err()
    {
        return;
    }

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let frame = match wire::encode_frame(&msg) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unencodable message");
                    continue;
                }
            };
            if writer.write_all(&frame).await.is_err() || writer.flush().await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        loop {
            let mut header = [0u8; LEN_SIZE];
            if reader.read_exact(&mut header).await.is_err() {
                break;
            }
            let len = match wire::frame_len(header) {
                Ok(len) => len,
                Err(e) => {
                    tracing::warn!(peer = %remote, error = %e, "bad frame header, closing");
                    break;
                }
            };
            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).await.is_err() {
                break;
            }
            match wire::decode_payload::<Message>(&payload) {
                Ok(message) => {
                    let event = TransportEvent::Message {
                        connection: id,
                        remote: remote.clone(),
                        message,
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(peer = %remote, error = %e, "dropping malformed message"),
            }
        }
        let _ = events.send(TransportEvent::Closed {
            connection: id,
            remote,
        });
    });
}

/// Exchange identities on a fresh stream: each side writes its own hello frame, then reads the peer's.
pub(crate) async fn exchange_hello<S>(stream: &mut S, me: &Identity) -> Result<Identity, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = wire::encode_frame(&Hello {
        identity: me.clone(),
    })
    .map_err(|e| TransportError::Handshake(e.to_string()))?;
    stream.write_all(&frame).await?;
    stream.flush().await?;

    let mut header = [0u8; LEN_SIZE];
    stream.read_exact(&mut header).await?;
    let len = wire::frame_len(header).map_err(|e| TransportError::Handshake(e.to_string()))?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    let hello: Hello =
        wire::decode_payload(&payload).map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(hello.identity)
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Hello {
    identity: Identity,
}
