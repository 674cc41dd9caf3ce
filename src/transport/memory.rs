//! In-process mesh backed by shared per-(source, category) queues. Every
//! member sees the same delivery and ordering contract as the TCP mesh, which
//! makes it the substrate of choice for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{Category, Rank};
use crate::transport::{check_member, GroupTransport};

const RECEIVE_POLL: Duration = Duration::from_millis(2);

type Queues = Mutex<HashMap<(Rank, Category), VecDeque<Vec<u8>>>>;

/// One member's endpoint into an in-process group.
pub struct MemoryMesh {
    rank: Rank,
    mailboxes: Arc<Vec<Queues>>,
}

impl MemoryMesh {
    /// Build a connected group of `group_size` members, returned in rank
    /// order.
    pub fn group(group_size: u32) -> Vec<MemoryMesh> {
        let mailboxes = Arc::new(
            (0..group_size)
                .map(|_| Mutex::new(HashMap::new()))
                .collect::<Vec<_>>(),
        );
        (0..group_size)
            .map(|rank| MemoryMesh {
                rank,
                mailboxes: Arc::clone(&mailboxes),
            })
            .collect()
    }

    fn pop(&self, source: Rank, category: Category) -> Option<Vec<u8>> {
        let mut queues = self.mailboxes[self.rank as usize]
            .lock()
            .expect("mailbox lock poisoned");
        queues.get_mut(&(source, category))?.pop_front()
    }
}

#[async_trait]
impl GroupTransport for MemoryMesh {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn group_size(&self) -> u32 {
        self.mailboxes.len() as u32
    }

    async fn send(&self, dest: Rank, category: Category, payload: Vec<u8>) -> Result<()> {
        check_member(dest, self.group_size())?;
        let mut queues = self.mailboxes[dest as usize]
            .lock()
            .expect("mailbox lock poisoned");
        queues
            .entry((self.rank, category))
            .or_default()
            .push_back(payload);
        Ok(())
    }

    fn probe(&self, source: Rank, category: Category) -> bool {
        let queues = self.mailboxes[self.rank as usize]
            .lock()
            .expect("mailbox lock poisoned");
        queues
            .get(&(source, category))
            .is_some_and(|q| !q.is_empty())
    }

    async fn receive(&self, source: Rank, category: Category) -> Result<Vec<u8>> {
        loop {
            if let Some(payload) = self.pop(source, category) {
                return Ok(payload);
            }
            tokio::time::sleep(RECEIVE_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;

    #[tokio::test]
    async fn test_send_probe_receive() {
        let mut group = MemoryMesh::group(3);
        let c = group.remove(2);
        let b = group.remove(1);
        let a = group.remove(0);

        assert!(!b.probe(0, Category::Text));
        a.send(1, Category::Text, b"hello".to_vec()).await.unwrap();
        assert!(b.probe(0, Category::Text));
        // Wrong source or category stays silent
        assert!(!b.probe(2, Category::Text));
        assert!(!b.probe(0, Category::Data));
        assert!(!c.probe(0, Category::Text));

        assert_eq!(b.receive(0, Category::Text).await.unwrap(), b"hello");
        assert!(!b.probe(0, Category::Text));
    }

    #[tokio::test]
    async fn test_order_preserved_per_pair() {
        let group = MemoryMesh::group(2);
        for i in 0..10u8 {
            group[0]
                .send(1, Category::Data, vec![i])
                .await
                .unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(group[1].receive(0, Category::Data).await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn test_send_out_of_range_rejected() {
        let group = MemoryMesh::group(2);
        let err = group[0]
            .send(5, Category::Text, vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidRank { rank: 5, .. }));
    }
}
