use async_trait::async_trait;

use crate::error::{MeshError, Result};
use crate::protocol::{Category, Rank};

pub mod memory;
pub mod mesh;

pub use memory::MemoryMesh;
pub use mesh::TcpMesh;

/// Abstraction over the group-communication substrate: a fixed set of
/// addressable members, each able to send a tagged payload to any other and
/// to test for pending messages without blocking.
///
/// Delivery is exactly-once and ordered within a (sender, category) pair;
/// nothing is guaranteed across pairs or senders.
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// This member's own rank.
    fn rank(&self) -> Rank;

    /// Total number of members, coordinator included.
    fn group_size(&self) -> u32;

    /// Fire-and-forget send to one member. There is no broadcast primitive;
    /// a logical broadcast is N-1 individual sends.
    async fn send(&self, dest: Rank, category: Category, payload: Vec<u8>) -> Result<()>;

    /// Non-blocking: true iff a message of `category` from `source` is
    /// queued and unread.
    fn probe(&self, source: Rank, category: Category) -> bool;

    /// Await the next message of `category` from `source`. Callers guard
    /// with `probe` when they must not block.
    async fn receive(&self, source: Rank, category: Category) -> Result<Vec<u8>>;
}

pub(crate) fn check_member(rank: Rank, group_size: u32) -> Result<()> {
    if rank >= group_size {
        return Err(MeshError::InvalidRank { rank, group_size });
    }
    Ok(())
}
