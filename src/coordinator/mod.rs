use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::activity::{log_path, tail_line};
use crate::cli;
use crate::error::{MeshError, Result};
use crate::protocol::{Category, ControlSignal, PeerForwardRequest, Rank, TransferMetadata};
use crate::transfer::{self, TransferOutcome, CHUNK_SIZE};
use crate::transport::GroupTransport;

/// How long `get` waits for the participant to start pushing back. Pull
/// requests are fire-and-forget in-protocol: a participant that does not
/// have the file never answers, so the wait has to be bounded here.
const PULL_RESPONSE_WAIT: Duration = Duration::from_secs(5);

/// Rank 0's command loop. Single-threaded: every transfer and message it
/// initiates is issued synchronously from here; inbound text is drained
/// non-blockingly before each prompt so messages never block command entry.
pub struct Coordinator {
    transport: Arc<dyn GroupTransport>,
    log_dir: PathBuf,
    work_dir: PathBuf,
    poll_interval: Duration,
    running: bool,
}

impl Coordinator {
    pub fn new(
        transport: Arc<dyn GroupTransport>,
        log_dir: PathBuf,
        work_dir: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            log_dir,
            work_dir,
            poll_interval,
            running: true,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        self.print_usage();
        let mut lines = cli::stdin_lines();

        while self.running {
            self.drain_inbound().await;
            print!("master> ");
            let _ = std::io::stdout().flush();

            loop {
                tokio::select! {
                    maybe = lines.recv() => {
                        match maybe {
                            Some(line) => {
                                if let Err(e) = self.handle_command(&line).await {
                                    println!("Error: {e}");
                                }
                            }
                            None => self.running = false,
                        }
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {
                        // Keep draining while idle so messages show up
                        // without a keypress; reprint the prompt if any did.
                        if self.drain_inbound().await {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatch one operator command line. Unknown or malformed commands
    /// print usage and change nothing; only `quit` ends the loop.
    pub async fn handle_command(&mut self, line: &str) -> Result<()> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(action) = parts.first() else {
            return Ok(());
        };

        match (action.to_lowercase().as_str(), parts.len()) {
            ("send", 3) => {
                let Some(rank) = Self::parse_rank(parts[2]) else {
                    return Ok(());
                };
                self.cmd_send(Path::new(parts[1]), rank).await
            }
            ("get", 3) => {
                let Some(rank) = Self::parse_rank(parts[1]) else {
                    return Ok(());
                };
                self.cmd_get(rank, parts[2]).await
            }
            ("relay", 4) => {
                let (Some(src), Some(dst)) =
                    (Self::parse_rank(parts[1]), Self::parse_rank(parts[2]))
                else {
                    return Ok(());
                };
                self.cmd_relay(src, dst, parts[3]).await
            }
            ("broadcast", n) if n > 1 => self.cmd_broadcast(&parts[1..].join(" ")).await,
            ("tell", n) if n > 2 => {
                let Some(rank) = Self::parse_rank(parts[1]) else {
                    return Ok(());
                };
                self.cmd_tell(rank, &parts[2..].join(" ")).await
            }
            ("list", 1) => self.cmd_list(),
            ("status", 1) => {
                self.cmd_status();
                Ok(())
            }
            ("peers", 1) => {
                self.cmd_peers();
                Ok(())
            }
            ("quit", 1) => self.cmd_quit().await,
            _ => {
                println!("Unknown or malformed command");
                self.print_usage();
                Ok(())
            }
        }
    }

    /// Malformed rank tokens are a usage problem, not a protocol error:
    /// print and re-prompt without touching any state.
    fn parse_rank(token: &str) -> Option<Rank> {
        match token.parse() {
            Ok(rank) => Some(rank),
            Err(_) => {
                println!("Error: invalid rank '{token}'");
                None
            }
        }
    }

    fn check_participant(&self, rank: Rank) -> Result<()> {
        if rank == 0 || rank >= self.transport.group_size() {
            return Err(MeshError::InvalidRank {
                rank,
                group_size: self.transport.group_size(),
            });
        }
        Ok(())
    }

    async fn cmd_send(&self, file: &Path, rank: Rank) -> Result<()> {
        self.check_participant(rank)?;
        if !file.is_file() {
            return Err(MeshError::FileNotFound(file.to_path_buf()));
        }
        println!("Sending '{}' to rank {rank}", file.display());
        let descriptor = transfer::send_file(self.transport.as_ref(), rank, file).await?;
        println!(
            "Transfer complete: {} bytes in {} chunks",
            descriptor.size, descriptor.chunk_count
        );
        Ok(())
    }

    async fn cmd_get(&self, rank: Rank, filename: &str) -> Result<()> {
        self.check_participant(rank)?;
        println!("Requesting '{filename}' from rank {rank}");
        self.transport
            .send(rank, Category::Control, ControlSignal::Transfer.to_bytes()?)
            .await?;
        let request = TransferMetadata::PullRequest {
            filename: filename.to_string(),
            to: 0,
        };
        self.transport
            .send(rank, Category::Metadata, request.to_bytes()?)
            .await?;

        // The protocol sends no failure response for a missing file, so the
        // wait for the push-back is bounded.
        let deadline = Instant::now() + PULL_RESPONSE_WAIT;
        loop {
            if self.transport.probe(rank, Category::Control) {
                return self.service_control(rank).await;
            }
            if Instant::now() >= deadline {
                println!("No response from rank {rank}; the file may be missing there");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn cmd_relay(&self, src: Rank, dst: Rank, filename: &str) -> Result<()> {
        self.check_participant(src)?;
        self.check_participant(dst)?;
        if src == dst {
            return Err(MeshError::InvalidRank {
                rank: dst,
                group_size: self.transport.group_size(),
            });
        }
        println!("Relaying '{filename}': rank {src} -> rank {dst}");
        self.transport
            .send(src, Category::Control, ControlSignal::PeerSend.to_bytes()?)
            .await?;
        let request = PeerForwardRequest {
            to: dst,
            filename: filename.to_string(),
        };
        self.transport
            .send(src, Category::Metadata, request.to_bytes()?)
            .await?;
        Ok(())
    }

    async fn cmd_broadcast(&self, text: &str) -> Result<()> {
        let payload = format!("master: {text}");
        let mut sent = 0;
        for rank in 1..self.transport.group_size() {
            self.transport
                .send(rank, Category::Control, ControlSignal::Broadcast.to_bytes()?)
                .await?;
            self.transport
                .send(rank, Category::Text, payload.clone().into_bytes())
                .await?;
            sent += 1;
        }
        println!("Broadcast sent to {sent} participants");
        Ok(())
    }

    async fn cmd_tell(&self, rank: Rank, text: &str) -> Result<()> {
        self.check_participant(rank)?;
        self.transport
            .send(rank, Category::Control, ControlSignal::Broadcast.to_bytes()?)
            .await?;
        self.transport
            .send(
                rank,
                Category::Text,
                format!("master (private): {text}").into_bytes(),
            )
            .await?;
        println!("Message sent to rank {rank}");
        Ok(())
    }

    fn cmd_list(&self) -> Result<()> {
        println!("Local files:");
        for entry in std::fs::read_dir(&self.work_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                println!(
                    "  {} ({} bytes)",
                    entry.file_name().to_string_lossy(),
                    entry.metadata()?.len()
                );
            }
        }
        Ok(())
    }

    fn cmd_status(&self) {
        println!("Group size:  {}", self.transport.group_size());
        println!("Participants: {}", self.transport.group_size() - 1);
        println!("Chunk size:  {CHUNK_SIZE} bytes");
        println!("Own rank:    {}", self.transport.rank());
    }

    /// Best-effort view of each participant, inferred from its log tail.
    /// Eventually consistent by construction.
    fn cmd_peers(&self) {
        println!("Rank  Last activity");
        println!("----  -------------");
        for rank in 1..self.transport.group_size() {
            match tail_line(&log_path(&self.log_dir, rank)) {
                Some(line) => println!("{rank:>4}  {line}"),
                None => println!("{rank:>4}  no log file"),
            }
        }
    }

    async fn cmd_quit(&mut self) -> Result<()> {
        println!("Shutting down participants...");
        for rank in 1..self.transport.group_size() {
            if let Err(e) = self
                .transport
                .send(rank, Category::Control, ControlSignal::Terminate.to_bytes()?)
                .await
            {
                println!("Error: could not reach rank {rank}: {e}");
            }
        }
        self.running = false;
        println!("Shutdown complete");
        Ok(())
    }

    /// Non-blocking sweep over every participant: print queued text, and
    /// service any participant-initiated push (a `get` answer arriving late,
    /// or an unsolicited send to rank 0). Returns true if anything printed.
    async fn drain_inbound(&self) -> bool {
        let mut printed = false;
        for src in 1..self.transport.group_size() {
            while self.transport.probe(src, Category::Text) {
                match self.transport.receive(src, Category::Text).await {
                    Ok(bytes) => {
                        println!("\n[rank {src}] {}", String::from_utf8_lossy(&bytes));
                        printed = true;
                    }
                    Err(e) => {
                        tracing::warn!(src, error = %e, "text drain failed");
                        break;
                    }
                }
            }
            if self.transport.probe(src, Category::Control) {
                printed = true;
                if let Err(e) = self.service_control(src).await {
                    println!("Error: {e}");
                }
            }
        }
        printed
    }

    async fn service_control(&self, src: Rank) -> Result<()> {
        let sig =
            ControlSignal::from_bytes(&self.transport.receive(src, Category::Control).await?)?;
        match sig {
            ControlSignal::Transfer => self.receive_push(src).await,
            other => {
                tracing::warn!(?other, src, "unexpected signal at coordinator");
                Ok(())
            }
        }
    }

    async fn receive_push(&self, src: Rank) -> Result<()> {
        let metadata =
            TransferMetadata::from_bytes(&self.transport.receive(src, Category::Metadata).await?)?;
        let TransferMetadata::Push { from, descriptor } = metadata else {
            tracing::warn!(src, "pull request addressed to the coordinator; dropped");
            return Ok(());
        };
        println!("Receiving '{}' from rank {from}", descriptor.name);
        let dest = self.work_dir.join(transfer::incoming_name(src, &descriptor.name));
        let written =
            transfer::receive_data(self.transport.as_ref(), src, &dest, self.poll_interval).await?;
        match transfer::verify(&dest, &descriptor, written)? {
            TransferOutcome::Verified => println!("Saved: {}", dest.display()),
            outcome @ TransferOutcome::SizeMismatch { .. } => {
                println!("Transfer failed ({outcome}); partial file kept: {}", dest.display());
            }
            outcome @ TransferOutcome::ChecksumMismatch { .. } => {
                println!("Saved with warning ({outcome}): {}", dest.display());
            }
        }
        Ok(())
    }

    fn print_usage(&self) {
        println!("Commands:");
        println!("  send <file> <rank>         - Send file to a participant");
        println!("  get <rank> <file>          - Request file from a participant");
        println!("  relay <src> <dst> <file>   - Participant-to-participant transfer");
        println!("  broadcast <text>           - Message every participant");
        println!("  tell <rank> <text>         - Message one participant");
        println!("  list                       - List local files");
        println!("  status                     - Show group status");
        println!("  peers                      - Best-effort participant status");
        println!("  quit                       - Shut the group down");
    }
}
