//! TCP mesh substrate. Member i listens on `port_base + i`; each send travels
//! over a cached outbound connection to the destination's listener as a
//! length-prefixed bincode frame. One connection per sender keeps ordering
//! within every (sender, category) pair.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{MeshError, Result};
use crate::protocol::{Category, Rank};
use crate::transport::{check_member, GroupTransport};

const LEN_PREFIX_BYTES: usize = 4;
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const RECEIVE_POLL: Duration = Duration::from_millis(2);

/// One message on the wire.
#[derive(Serialize, Deserialize)]
struct Frame {
    source: Rank,
    category: Category,
    payload: Vec<u8>,
}

type InboundQueues = Arc<Mutex<HashMap<(Rank, Category), VecDeque<Vec<u8>>>>>;

/// One member's endpoint into the TCP mesh.
pub struct TcpMesh {
    rank: Rank,
    group_size: u32,
    host: String,
    port_base: u16,
    inbound: InboundQueues,
    outbound: tokio::sync::Mutex<HashMap<Rank, TcpStream>>,
}

impl TcpMesh {
    /// Bind this member's listener and start filing inbound frames.
    pub async fn join(rank: Rank, group_size: u32, host: &str, port_base: u16) -> Result<Arc<Self>> {
        check_member(rank, group_size)?;
        let addr = format!("{}:{}", host, port_base + rank as u16);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(rank, %addr, "mesh listener up");

        let inbound: InboundQueues = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(accept_loop(listener, Arc::clone(&inbound)));

        Ok(Arc::new(Self {
            rank,
            group_size,
            host: host.to_string(),
            port_base,
            inbound,
            outbound: tokio::sync::Mutex::new(HashMap::new()),
        }))
    }

    fn pop(&self, source: Rank, category: Category) -> Option<Vec<u8>> {
        let mut queues = self.inbound.lock().expect("inbound lock poisoned");
        queues.get_mut(&(source, category))?.pop_front()
    }
}

#[async_trait]
impl GroupTransport for TcpMesh {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn group_size(&self) -> u32 {
        self.group_size
    }

    async fn send(&self, dest: Rank, category: Category, payload: Vec<u8>) -> Result<()> {
        check_member(dest, self.group_size)?;
        let frame = Frame {
            source: self.rank,
            category,
            payload,
        };
        let bytes = bincode::serialize(&frame)?;

        let mut outbound = self.outbound.lock().await;
        if !outbound.contains_key(&dest) {
            let addr = format!("{}:{}", self.host, self.port_base + dest as u16);
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| MeshError::Transport(format!("connect to rank {dest}: {e}")))?;
            outbound.insert(dest, stream);
        }
        let stream = outbound.get_mut(&dest).expect("just inserted");
        if let Err(e) = write_frame(stream, &bytes).await {
            // Drop the broken connection so the next send redials.
            outbound.remove(&dest);
            return Err(MeshError::Transport(format!("send to rank {dest}: {e}")));
        }
        Ok(())
    }

    fn probe(&self, source: Rank, category: Category) -> bool {
        let queues = self.inbound.lock().expect("inbound lock poisoned");
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

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Frame> {
    let mut len_bytes = [0u8; LEN_PREFIX_BYTES];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_BYTES {
        return Err(MeshError::Transport(format!("frame too large: {len} bytes")));
    }

    let mut buffer = vec![0u8; len];
    stream.read_exact(&mut buffer).await?;
    Ok(bincode::deserialize(&buffer)?)
}

async fn accept_loop(listener: TcpListener, inbound: InboundQueues) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        tracing::debug!(%peer, "inbound mesh connection");
        let inbound = Arc::clone(&inbound);
        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                match read_frame(&mut stream).await {
                    Ok(frame) => {
                        let mut queues = inbound.lock().expect("inbound lock poisoned");
                        queues
                            .entry((frame.source, frame.category))
                            .or_default()
                            .push_back(frame.payload);
                    }
                    Err(e) => {
                        // Sender hung up or sent garbage; either way this
                        // connection is done.
                        tracing::debug!(%peer, error = %e, "mesh connection closed");
                        break;
                    }
                }
            }
        });
    }
}
