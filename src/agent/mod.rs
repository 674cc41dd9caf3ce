use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::activity::ActivityLog;
use crate::cli;
use crate::error::{MeshError, Result};
use crate::protocol::{Category, ControlSignal, PeerForwardRequest, Rank, TransferMetadata};
use crate::transfer::{self, TransferOutcome};
use crate::transport::GroupTransport;

/// Most recent messages retained for `inbox` display.
const INBOX_CAPACITY: usize = 50;
const INBOX_DISPLAY: usize = 5;
const INBOX_CHANNEL: usize = 64;

/// Where a participant is in its current transfer. Failures return to Idle;
/// nothing is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Idle,
    AwaitingMetadata,
    Receiving,
    Sending,
    Verifying,
}

/// One participant's event loop (ranks 1..N-1). Each tick it polls control
/// from the coordinator and every peer, drains the text listener's handoff
/// channel, and polls operator input; it sleeps the configured interval only
/// when a tick found no work.
pub struct ParticipantAgent {
    transport: Arc<dyn GroupTransport>,
    log: ActivityLog,
    inbox: VecDeque<(Rank, String)>,
    phase: TransferPhase,
    running: bool,
    poll_interval: Duration,
    /// Files are listed, sent from, and received into this directory.
    work_dir: PathBuf,
}

impl ParticipantAgent {
    pub fn new(
        transport: Arc<dyn GroupTransport>,
        log_dir: &Path,
        work_dir: PathBuf,
        poll_interval: Duration,
    ) -> Result<Self> {
        let log = ActivityLog::create(log_dir, transport.rank())?;
        Ok(Self {
            transport,
            log,
            inbox: VecDeque::new(),
            phase: TransferPhase::Idle,
            running: true,
            poll_interval,
            work_dir,
        })
    }

    pub fn phase(&self) -> TransferPhase {
        self.phase
    }

    pub fn inbox(&self) -> &VecDeque<(Rank, String)> {
        &self.inbox
    }

    pub async fn run(&mut self) -> Result<()> {
        self.print_usage();
        let lines = cli::stdin_lines();
        self.run_with(lines).await
    }

    /// Run the event loop reading operator commands from `lines`. Split out
    /// from `run` so the loop can be driven without a terminal.
    pub async fn run_with(&mut self, mut lines: mpsc::Receiver<String>) -> Result<()> {
        let (inbox_tx, mut inbox_rx) = mpsc::channel(INBOX_CHANNEL);
        let listener = tokio::spawn(text_listener(
            Arc::clone(&self.transport),
            inbox_tx,
            self.poll_interval,
        ));

        while self.running {
            let mut worked = false;

            // Control from the coordinator, then peer-initiated transfers.
            // Transport failures are logged and the loop keeps going.
            for src in 0..self.transport.group_size() {
                if src == self.transport.rank() {
                    continue;
                }
                match self.poll_control(src).await {
                    Ok(w) => worked |= w,
                    Err(e) => self.note(&format!("error: {e}")),
                }
                if !self.running {
                    break;
                }
            }

            // A Terminate ends the tick here: operator commands queued
            // behind it must not send anything anymore.
            if !self.running {
                break;
            }

            while let Ok((src, msg)) = inbox_rx.try_recv() {
                self.note(&format!("message from rank {src}: {msg}"));
                self.push_inbox(src, msg);
                worked = true;
            }

            while self.running {
                let Ok(line) = lines.try_recv() else { break };
                self.handle_command(&line).await;
                worked = true;
            }

            if !worked && self.running {
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        listener.abort();
        // Keep whatever the listener already picked up.
        while let Ok((src, msg)) = inbox_rx.try_recv() {
            self.note(&format!("message from rank {src}: {msg}"));
            self.push_inbox(src, msg);
        }
        self.note("stopped");
        Ok(())
    }

    /// Service one pending control signal from `src`, if any. Returns true
    /// when something was handled.
    async fn poll_control(&mut self, src: Rank) -> Result<bool> {
        if !self.transport.probe(src, Category::Control) {
            return Ok(false);
        }
        let sig =
            ControlSignal::from_bytes(&self.transport.receive(src, Category::Control).await?)?;
        match (src, sig) {
            (0, ControlSignal::Terminate) => {
                self.note("received shutdown signal from master");
                self.running = false;
            }
            (_, ControlSignal::Transfer) => self.handle_transfer(src).await?,
            (0, ControlSignal::PeerSend) => self.handle_peer_send().await?,
            (0, ControlSignal::Broadcast) => {
                let text = String::from_utf8_lossy(
                    &self.transport.receive(0, Category::Text).await?,
                )
                .into_owned();
                self.note(&format!("message from master: {text}"));
                self.push_inbox(0, text);
            }
            (src, other) => {
                tracing::warn!(?other, src, "signal not valid from this source; dropped");
            }
        }
        Ok(true)
    }

    /// A Transfer signal arrived from `src`: the metadata tells us whether we
    /// are receiving a push or serving a pull.
    async fn handle_transfer(&mut self, src: Rank) -> Result<()> {
        self.phase = TransferPhase::AwaitingMetadata;
        let metadata =
            TransferMetadata::from_bytes(&self.transport.receive(src, Category::Metadata).await?)?;
        match metadata {
            TransferMetadata::Push { from, descriptor } => {
                self.phase = TransferPhase::Receiving;
                self.note(&format!(
                    "receiving '{}' from {} ({} bytes)",
                    descriptor.name,
                    origin(from),
                    descriptor.size
                ));
                let dest = self
                    .work_dir
                    .join(transfer::incoming_name(src, &descriptor.name));
                let written = match transfer::receive_data(
                    self.transport.as_ref(),
                    src,
                    &dest,
                    self.poll_interval,
                )
                .await
                {
                    Ok(written) => written,
                    Err(e) => {
                        self.phase = TransferPhase::Idle;
                        return Err(e);
                    }
                };
                self.phase = TransferPhase::Verifying;
                let outcome = match transfer::verify(&dest, &descriptor, written) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        self.phase = TransferPhase::Idle;
                        return Err(e);
                    }
                };
                match outcome {
                    TransferOutcome::Verified => {
                        self.note(&format!("saved: {} (verified)", dest.display()));
                    }
                    outcome @ TransferOutcome::SizeMismatch { .. } => {
                        self.note(&format!("transfer failed: {outcome}; partial file kept"));
                    }
                    outcome @ TransferOutcome::ChecksumMismatch { .. } => {
                        self.note(&format!("saved: {} ({outcome})", dest.display()));
                    }
                }
            }
            TransferMetadata::PullRequest { filename, to } => {
                self.note(&format!("{} requested '{filename}' for rank {to}", origin(src)));
                self.push_file(to, &filename).await;
            }
        }
        self.phase = TransferPhase::Idle;
        Ok(())
    }

    /// Coordinator told us to originate a transfer toward another member.
    async fn handle_peer_send(&mut self) -> Result<()> {
        let request = PeerForwardRequest::from_bytes(
            &self.transport.receive(0, Category::Metadata).await?,
        )?;
        self.note(&format!(
            "master requested forwarding '{}' to rank {}",
            request.filename, request.to
        ));
        self.push_file(request.to, &request.filename).await;
        Ok(())
    }

    /// Push a local file to `dest`. Validation failures are local outcomes:
    /// logged, echoed, and dropped without touching the transport. A pull
    /// requester is never told about a missing file (known protocol gap).
    async fn push_file(&mut self, dest: Rank, filename: &str) {
        let group_size = self.transport.group_size();
        if dest == self.transport.rank() || dest >= group_size {
            self.note(&format!(
                "error: {}",
                MeshError::InvalidRank { rank: dest, group_size }
            ));
            return;
        }
        let path = self.work_dir.join(filename);
        if !path.is_file() {
            self.note(&format!("error: {}", MeshError::FileNotFound(path)));
            return;
        }
        self.phase = TransferPhase::Sending;
        match transfer::send_file(self.transport.as_ref(), dest, &path).await {
            Ok(descriptor) => self.note(&format!(
                "sent '{}' to {} ({} bytes)",
                descriptor.name,
                origin(dest),
                descriptor.size
            )),
            Err(e) => self.note(&format!("error: send failed: {e}")),
        }
        self.phase = TransferPhase::Idle;
    }

    /// Message another participant. Rank 0 is not a valid destination:
    /// participant-originated traffic is peer-to-peer only.
    async fn send_text(&mut self, dest: Rank, text: &str) {
        let group_size = self.transport.group_size();
        if dest == 0 || dest == self.transport.rank() || dest >= group_size {
            self.note(&format!(
                "error: {}",
                MeshError::InvalidRank { rank: dest, group_size }
            ));
            return;
        }
        match self
            .transport
            .send(dest, Category::Text, text.as_bytes().to_vec())
            .await
        {
            Ok(()) => self.note(&format!("message sent to {}", origin(dest))),
            Err(e) => self.note(&format!("error: {e}")),
        }
    }

    /// One line of operator input. Errors are echoed and logged; nothing
    /// here ends the loop except `exit`.
    pub async fn handle_command(&mut self, line: &str) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(action) = parts.first() else { return };

        match (action.to_lowercase().as_str(), parts.len()) {
            ("send", 3) => match parts[1].parse::<Rank>() {
                // Operator sends go to peers only; pushing back to rank 0 is
                // reserved for the pull-serve path.
                Ok(0) => self.note(&format!(
                    "error: {}",
                    MeshError::InvalidRank {
                        rank: 0,
                        group_size: self.transport.group_size()
                    }
                )),
                Ok(rank) => self.push_file(rank, parts[2]).await,
                Err(_) => self.note(&format!("error: invalid rank '{}'", parts[1])),
            },
            ("tell", n) if n > 2 => match parts[1].parse::<Rank>() {
                Ok(rank) => self.send_text(rank, &parts[2..].join(" ")).await,
                Err(_) => self.note(&format!("error: invalid rank '{}'", parts[1])),
            },
            ("inbox", 1) => self.show_inbox(),
            ("files", 1) => self.show_files(),
            ("status", 1) => self.show_status(),
            ("help", 1) => self.print_usage(),
            ("exit", 1) => {
                self.note("exiting on operator request");
                self.running = false;
            }
            _ => println!("Unknown command; type 'help' for commands"),
        }
    }

    fn push_inbox(&mut self, src: Rank, msg: String) {
        self.inbox.push_back((src, msg));
        while self.inbox.len() > INBOX_CAPACITY {
            self.inbox.pop_front();
        }
    }

    fn show_inbox(&self) {
        println!("Recent messages:");
        if self.inbox.is_empty() {
            println!("  (none)");
            return;
        }
        let recent: Vec<_> = self.inbox.iter().rev().take(INBOX_DISPLAY).collect();
        for (src, msg) in recent.into_iter().rev() {
            println!("  [{}] {msg}", origin(*src));
        }
    }

    fn show_files(&self) {
        println!("Files in {}:", self.work_dir.display());
        let Ok(entries) = std::fs::read_dir(&self.work_dir) else {
            println!("  (unreadable)");
            return;
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                println!("  {} ({size} bytes)", entry.file_name().to_string_lossy());
            }
        }
    }

    fn show_status(&self) {
        println!("Rank:        {}", self.transport.rank());
        println!("Group size:  {}", self.transport.group_size());
        println!("Phase:       {:?}", self.phase);
        println!("Inbox:       {} messages", self.inbox.len());
    }

    fn print_usage(&self) {
        println!("Commands:");
        println!("  send <rank> <file>   - Send file to another member");
        println!("  tell <rank> <text>   - Message another member");
        println!("  inbox                - Show recent messages");
        println!("  files                - List local files");
        println!("  status               - Show this member's status");
        println!("  help                 - Show commands");
        println!("  exit                 - Stop this participant only");
    }

    /// Append to the activity log and echo to the operator.
    fn note(&self, message: &str) {
        self.log.append(message);
        println!("[rank {}] {message}", self.transport.rank());
    }
}

fn origin(rank: Rank) -> String {
    if rank == 0 {
        "master".to_string()
    } else {
        format!("rank {rank}")
    }
}

/// Background task: poll the Text category from every other participant and
/// hand findings to the main loop over a bounded channel. The main loop owns
/// the inbox; this task never mutates shared state.
async fn text_listener(
    transport: Arc<dyn GroupTransport>,
    tx: mpsc::Sender<(Rank, String)>,
    poll: Duration,
) {
    let me = transport.rank();
    loop {
        let mut found = false;
        for src in 1..transport.group_size() {
            if src == me {
                continue;
            }
            if transport.probe(src, Category::Text) {
                match transport.receive(src, Category::Text).await {
                    Ok(bytes) => {
                        let msg = String::from_utf8_lossy(&bytes).into_owned();
                        if tx.send((src, msg)).await.is_err() {
                            return;
                        }
                        found = true;
                    }
                    Err(e) => tracing::warn!(src, error = %e, "text poll failed"),
                }
            }
        }
        if !found {
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryMesh;
    use tempfile::{tempdir, TempDir};
    use tokio::task::JoinHandle;

    const TICK: Duration = Duration::from_millis(1);

    struct TestAgent {
        handle: JoinHandle<ParticipantAgent>,
        _dirs: (TempDir, TempDir),
        work_dir: PathBuf,
        log_path: PathBuf,
    }

    fn spawn_agent(transport: Arc<MemoryMesh>) -> TestAgent {
        let log_dir = tempdir().unwrap();
        let work = tempdir().unwrap();
        let work_dir = work.path().to_path_buf();
        let rank = transport.rank();
        let mut agent =
            ParticipantAgent::new(transport, log_dir.path(), work_dir.clone(), TICK).unwrap();
        let log_path = crate::activity::log_path(log_dir.path(), rank);
        let handle = tokio::spawn(async move {
            let (_tx, lines) = mpsc::channel(1);
            agent.run_with(lines).await.unwrap();
            agent
        });
        TestAgent {
            handle,
            _dirs: (log_dir, work),
            work_dir,
            log_path,
        }
    }

    fn mesh(n: u32) -> Vec<Arc<MemoryMesh>> {
        MemoryMesh::group(n).into_iter().map(Arc::new).collect()
    }

    async fn send_signal(from: &MemoryMesh, dest: Rank, sig: ControlSignal) {
        from.send(dest, Category::Control, sig.to_bytes().unwrap())
            .await
            .unwrap();
    }

    fn silent(member: &MemoryMesh, source: Rank) -> bool {
        [
            Category::Control,
            Category::Metadata,
            Category::Data,
            Category::Text,
        ]
        .iter()
        .all(|&c| !member.probe(source, c))
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn test_master_push_ends_idle_with_verified_file() {
        let group = mesh(4);
        let master = &group[0];

        let src_dir = tempdir().unwrap();
        let report = src_dir.path().join("report.txt");
        let data: Vec<u8> = (0..150_000u32).map(|i| (i * 7 % 256) as u8).collect();
        std::fs::write(&report, &data).unwrap();

        // Queue the whole transfer, then termination behind it.
        transfer::send_file(master.as_ref(), 2, &report).await.unwrap();
        send_signal(master, 2, ControlSignal::Terminate).await;

        let agent = spawn_agent(group[2].clone());
        let finished = agent.handle.await.unwrap();

        assert_eq!(finished.phase(), TransferPhase::Idle);
        let received = agent.work_dir.join("from_master_report.txt");
        assert_eq!(std::fs::read(&received).unwrap(), data);
        let log = std::fs::read_to_string(&agent.log_path).unwrap();
        assert!(log.contains("verified"));
    }

    #[tokio::test]
    async fn test_pull_request_pushes_file_back() {
        let group = mesh(3);
        let master = &group[0];

        let agent = spawn_agent(group[1].clone());
        std::fs::write(agent.work_dir.join("data.bin"), b"pull me").unwrap();

        send_signal(master, 1, ControlSignal::Transfer).await;
        let request = TransferMetadata::PullRequest {
            filename: "data.bin".into(),
            to: 0,
        };
        master
            .send(1, Category::Metadata, request.to_bytes().unwrap())
            .await
            .unwrap();

        // The push-back arrives like any inbound transfer.
        let sig = ControlSignal::from_bytes(&master.receive(1, Category::Control).await.unwrap())
            .unwrap();
        assert_eq!(sig, ControlSignal::Transfer);
        let meta =
            TransferMetadata::from_bytes(&master.receive(1, Category::Metadata).await.unwrap())
                .unwrap();
        let descriptor = match meta {
            TransferMetadata::Push { from, descriptor } => {
                assert_eq!(from, 1);
                descriptor
            }
            _ => panic!("expected push metadata"),
        };
        let dir = tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let written = transfer::receive_data(master.as_ref(), 1, &dest, TICK)
            .await
            .unwrap();
        assert_eq!(
            transfer::verify(&dest, &descriptor, written).unwrap(),
            TransferOutcome::Verified
        );
        assert_eq!(std::fs::read(&dest).unwrap(), b"pull me");

        send_signal(master, 1, ControlSignal::Terminate).await;
        agent.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_request_for_missing_file_is_dropped() {
        let group = mesh(3);
        let master = &group[0];

        let agent = spawn_agent(group[1].clone());
        send_signal(master, 1, ControlSignal::Transfer).await;
        let request = TransferMetadata::PullRequest {
            filename: "nope.bin".into(),
            to: 0,
        };
        master
            .send(1, Category::Metadata, request.to_bytes().unwrap())
            .await
            .unwrap();
        send_signal(master, 1, ControlSignal::Terminate).await;
        agent.handle.await.unwrap();

        // No response of any kind reached the requester.
        assert!(silent(master, 1));
        let log = std::fs::read_to_string(&agent.log_path).unwrap();
        assert!(log.contains("file not found"));
    }

    #[tokio::test]
    async fn test_relay_with_missing_file_sends_nothing_to_target() {
        let group = mesh(3);
        let master = &group[0];

        let agent = spawn_agent(group[1].clone());
        send_signal(master, 1, ControlSignal::PeerSend).await;
        let request = PeerForwardRequest {
            to: 2,
            filename: "data.bin".into(),
        };
        master
            .send(1, Category::Metadata, request.to_bytes().unwrap())
            .await
            .unwrap();
        send_signal(master, 1, ControlSignal::Terminate).await;
        agent.handle.await.unwrap();

        assert!(silent(&group[2], 1));
        let log = std::fs::read_to_string(&agent.log_path).unwrap();
        assert!(log.contains("file not found"));
    }

    #[tokio::test]
    async fn test_relay_delivers_peer_to_peer() {
        let group = mesh(3);
        let master = &group[0];

        let source = spawn_agent(group[1].clone());
        let target = spawn_agent(group[2].clone());
        std::fs::write(source.work_dir.join("data.bin"), b"between peers").unwrap();

        send_signal(master, 1, ControlSignal::PeerSend).await;
        let request = PeerForwardRequest {
            to: 2,
            filename: "data.bin".into(),
        };
        master
            .send(1, Category::Metadata, request.to_bytes().unwrap())
            .await
            .unwrap();

        let received = target.work_dir.join("from_rank1_data.bin");
        wait_for(|| received.is_file()).await;
        wait_for(|| std::fs::read(&received).map(|d| d == b"between peers").unwrap_or(false))
            .await;

        send_signal(master, 1, ControlSignal::Terminate).await;
        send_signal(master, 2, ControlSignal::Terminate).await;
        source.handle.await.unwrap();
        let target_agent = target.handle.await.unwrap();
        assert_eq!(target_agent.phase(), TransferPhase::Idle);
    }

    #[tokio::test]
    async fn test_terminate_stops_loop_with_no_further_sends() {
        let group = mesh(3);
        let master = &group[0];

        let agent = spawn_agent(group[1].clone());
        send_signal(master, 1, ControlSignal::Terminate).await;
        let finished = agent.handle.await.unwrap();

        assert!(!finished.running);
        assert!(silent(master, 1));
        assert!(silent(&group[2], 1));
    }

    #[tokio::test]
    async fn test_broadcast_lands_in_inbox_and_log() {
        let group = mesh(2);
        let master = &group[0];

        let agent = spawn_agent(group[1].clone());
        send_signal(master, 1, ControlSignal::Broadcast).await;
        master
            .send(1, Category::Text, b"master: all hands".to_vec())
            .await
            .unwrap();
        send_signal(master, 1, ControlSignal::Terminate).await;
        let finished = agent.handle.await.unwrap();

        assert_eq!(
            finished.inbox().back(),
            Some(&(0, "master: all hands".to_string()))
        );
        let log = std::fs::read_to_string(&agent.log_path).unwrap();
        assert!(log.contains("all hands"));
    }

    #[tokio::test]
    async fn test_peer_text_reaches_inbox_via_listener() {
        let group = mesh(3);
        let master = &group[0];

        let agent = spawn_agent(group[1].clone());
        group[2]
            .send(1, Category::Text, b"hello from 2".to_vec())
            .await
            .unwrap();
        // Give the listener a moment before termination is queued.
        tokio::time::sleep(Duration::from_millis(200)).await;
        send_signal(master, 1, ControlSignal::Terminate).await;
        let finished = agent.handle.await.unwrap();

        assert!(finished
            .inbox()
            .iter()
            .any(|(src, msg)| *src == 2 && msg == "hello from 2"));
    }

    #[tokio::test]
    async fn test_operator_send_to_invalid_rank_sends_nothing() {
        let group = mesh(3);
        let log_dir = tempdir().unwrap();
        let work = tempdir().unwrap();
        let mut agent = ParticipantAgent::new(
            group[1].clone(),
            log_dir.path(),
            work.path().to_path_buf(),
            TICK,
        )
        .unwrap();

        agent.handle_command("send 1 anything.bin").await; // self
        agent.handle_command("send 7 anything.bin").await; // out of range
        agent.handle_command("send 0 anything.bin").await; // coordinator
        agent.handle_command("tell 7 hi").await;
        agent.handle_command("tell 0 hi master").await;

        assert!(silent(&group[0], 1));
        assert!(silent(&group[2], 1));
        let log =
            std::fs::read_to_string(crate::activity::log_path(log_dir.path(), 1)).unwrap();
        assert!(log.contains("invalid rank"));
    }

    #[tokio::test]
    async fn test_commands_queued_behind_terminate_send_nothing() {
        let group = mesh(3);
        let master = &group[0];

        let log_dir = tempdir().unwrap();
        let work = tempdir().unwrap();
        std::fs::write(work.path().join("late.bin"), b"too late").unwrap();
        let mut agent = ParticipantAgent::new(
            group[1].clone(),
            log_dir.path(),
            work.path().to_path_buf(),
            TICK,
        )
        .unwrap();

        // Both the shutdown signal and an operator command are already
        // queued when the loop starts; the command must never run.
        send_signal(master, 1, ControlSignal::Terminate).await;
        let (tx, lines) = mpsc::channel(4);
        tx.send("send 2 late.bin".to_string()).await.unwrap();
        tx.send("tell 2 also late".to_string()).await.unwrap();
        agent.run_with(lines).await.unwrap();

        assert!(!agent.running);
        assert!(silent(&group[2], 1));
        assert!(silent(master, 1));
    }

    #[tokio::test]
    async fn test_failed_verification_returns_to_idle_and_keeps_file() {
        let group = mesh(2);
        let master = &group[0];

        // Hand-build a push whose descriptor lies about the checksum.
        let descriptor = crate::protocol::FileDescriptor {
            name: "bad.bin".into(),
            size: 5,
            checksum: "0".repeat(64),
            chunk_count: 1,
            last_chunk_size: 5,
        };
        send_signal(master, 1, ControlSignal::Transfer).await;
        let meta = TransferMetadata::Push {
            from: 0,
            descriptor,
        };
        master
            .send(1, Category::Metadata, meta.to_bytes().unwrap())
            .await
            .unwrap();
        master
            .send(1, Category::Data, b"hello".to_vec())
            .await
            .unwrap();
        send_signal(master, 1, ControlSignal::Complete).await;
        send_signal(master, 1, ControlSignal::Terminate).await;

        let agent = spawn_agent(group[1].clone());
        let finished = agent.handle.await.unwrap();

        assert_eq!(finished.phase(), TransferPhase::Idle);
        let kept = agent.work_dir.join("from_master_bad.bin");
        assert_eq!(std::fs::read(&kept).unwrap(), b"hello");
        let log = std::fs::read_to_string(&agent.log_path).unwrap();
        assert!(log.contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_inbox_recency_bound() {
        let group = mesh(2);
        let log_dir = tempdir().unwrap();
        let work = tempdir().unwrap();
        let mut agent = ParticipantAgent::new(
            group[1].clone(),
            log_dir.path(),
            work.path().to_path_buf(),
            TICK,
        )
        .unwrap();

        for i in 0..60 {
            agent.push_inbox(0, format!("msg {i}"));
        }
        assert_eq!(agent.inbox().len(), INBOX_CAPACITY);
        assert_eq!(agent.inbox().front().unwrap().1, "msg 10");
    }
}
