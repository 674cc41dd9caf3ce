use std::io::BufRead;
use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "meshdrop")]
#[command(about = "Group file transfers and messaging across a fixed rank mesh", long_about = None)]
#[command(version)]
pub struct Cli {
    /// This member's rank; rank 0 runs the coordinator
    #[arg(long)]
    pub rank: u32,

    /// Total number of members, coordinator included
    #[arg(long, short = 'n')]
    pub group_size: u32,

    /// Host the other members resolve to
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// First TCP port; member i listens on port_base + i
    #[arg(long, short = 'p', default_value_t = 7800)]
    pub port_base: u16,

    /// Directory for per-member activity logs
    #[arg(long, default_value = ".")]
    pub log_dir: PathBuf,

    /// Idle pause between event-loop ticks, in milliseconds. Lower is more
    /// responsive, higher is cheaper on CPU.
    #[arg(long, default_value_t = 100)]
    pub poll_interval_ms: u64,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Bridge blocking stdin onto a channel so the event loops can poll operator
/// input without ever blocking a tick.
pub fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}
