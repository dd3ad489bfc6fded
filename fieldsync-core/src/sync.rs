//! Shared field: last-writer-wins value mirrored across every open connection.

use std::time::{Duration, Instant};

use crate::core::Action;
use crate::protocol::Message;
use crate::registry::ConnectionId;

/// How long the "synced" acknowledgment stays visible after a remote edit.
pub const DEFAULT_ACK_DURATION: Duration = Duration::from_secs(1);

pub struct SyncChannel {
    value: String,
    ack_duration: Duration,
    ack_until: Option<Instant>,
    acks: u64,
}

impl SyncChannel {
    pub fn new(ack_duration: Duration) -> Self {
        Self {
            value: String::new(),
            ack_duration,
            ack_until: None,
            acks: 0,
        }
    }

    /// Current field value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// A local edit: store it and send the full value on every open connection.
    pub fn broadcast_local_edit<I>(&mut self, value: impl Into<String>, connections: I) -> Vec<Action>
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        self.value = value.into();
        connections
            .into_iter()
            .map(|connection| Action::Send {
                connection,
                message: Message::InputSync {
                    value: self.value.clone(),
                },
            })
            .collect()
    }

    /// A remote edit: overwrite the local value and start one acknowledgment.
    /// Never produces sends, so mirrored edits do not bounce back.
    pub fn apply_remote_edit(&mut self, value: String, now: Instant) -> Vec<Action> {
        self.value = value.clone();
        self.ack_until = Some(now + self.ack_duration);
        self.acks = self.acks.saturating_add(1);
        vec![
            Action::FieldChanged(value),
            Action::Acknowledge {
                duration: self.ack_duration,
            },
        ]
    }

    /// Whether the acknowledgment indicator is showing at `now`.
    pub fn is_acknowledging(&self, now: Instant) -> bool {
        self.ack_until.is_some_and(|until| now < until)
    }

    /// Total acknowledgments triggered this session.
    pub fn ack_count(&self) -> u64 {
        self.acks
    }
}

impl Default for SyncChannel {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_DURATION)
    }
}
