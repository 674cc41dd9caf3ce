use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A member's address in the group. Rank 0 is the coordinator.
pub type Rank = u32;

/// Logical channels multiplexed over the group transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Control signals, one per message
    Control,
    /// Transfer descriptors and forwarding requests
    Metadata,
    /// File chunks
    Data,
    /// Free-form operator messages (raw UTF-8)
    Text,
}

/// Control vocabulary. Always sent as a single value, never batched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlSignal {
    /// Coordinator -> participant: stop the event loop and exit
    Terminate,
    /// A Metadata message follows (inbound push or pull request)
    Transfer,
    /// The final Data chunk of a transfer has been sent
    Complete,
    /// Coordinator -> participant: a PeerForwardRequest follows
    PeerSend,
    /// A Text message follows (broadcast and directed alike)
    Broadcast,
}

/// Everything a receiver needs to reassemble and verify one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    /// Hex SHA-256 of the full file content
    pub checksum: String,
    pub chunk_count: u32,
    pub last_chunk_size: u32,
}

/// Sent once per transfer on the Metadata category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferMetadata {
    /// An inbound push: chunks from `from` follow on the Data category
    Push { from: Rank, descriptor: FileDescriptor },
    /// A pull request: the receiver should push `filename` back to `to`
    PullRequest { filename: String, to: Rank },
}

/// Coordinator instruction telling a participant to originate a transfer
/// toward another participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerForwardRequest {
    pub to: Rank,
    pub filename: String,
}

macro_rules! wire_codec {
    ($ty:ty) => {
        impl $ty {
            pub fn to_bytes(&self) -> Result<Vec<u8>> {
                Ok(bincode::serialize(self)?)
            }

            pub fn from_bytes(data: &[u8]) -> Result<Self> {
                Ok(bincode::deserialize(data)?)
            }
        }
    };
}

wire_codec!(ControlSignal);
wire_codec!(TransferMetadata);
wire_codec!(PeerForwardRequest);
