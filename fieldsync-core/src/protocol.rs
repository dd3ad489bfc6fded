//! FieldSync wire messages.

use serde::{Deserialize, Serialize};

use crate::device::Descriptor;

/// Messages exchanged on a data channel. Encoded as JSON with a `type` tag
/// (see the wire module for framing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Self-announcement, sent once right after a connection opens.
    DeviceInfo { device: Descriptor },
    /// Full current value of the shared field.
    InputSync { value: String },
    /// Any other `type`. Never sent; dropped on receipt.
    #[serde(other)]
    Unknown,
}
