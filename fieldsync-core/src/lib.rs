//! FieldSync reference implementation: peer roster and shared-field mirroring.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod core;
pub mod device;
pub mod identity;
pub mod protocol;
pub mod registry;
pub mod sync;
pub mod wire;

pub use crate::core::{Action, FieldSyncCore, Settings};
pub use device::{detect, Descriptor, DeviceSignals};
pub use identity::{Identity, Namespace};
pub use protocol::Message;
pub use registry::{ConnectionId, Direction, PeerRegistry, RosterEntry};
pub use sync::SyncChannel;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
