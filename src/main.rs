mod activity;
mod agent;
mod cli;
mod coordinator;
mod error;
mod protocol;
mod transfer;
mod transport;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use agent::ParticipantAgent;
use cli::Cli;
use coordinator::Coordinator;
use transport::TcpMesh;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse_args();
    if cli.group_size < 2 {
        anyhow::bail!("need at least 2 members (one coordinator, one participant)");
    }
    if cli.rank >= cli.group_size {
        anyhow::bail!("rank {} outside group of size {}", cli.rank, cli.group_size);
    }

    let transport = TcpMesh::join(cli.rank, cli.group_size, &cli.host, cli.port_base).await?;
    let poll = Duration::from_millis(cli.poll_interval_ms);

    if cli.rank == 0 {
        println!("Meshdrop - Coordinator (rank 0)");
        println!("═══════════════════════════════════════");
        println!("Group size: {} ({} participants)", cli.group_size, cli.group_size - 1);
        println!();
        let mut coordinator = Coordinator::new(transport, cli.log_dir, PathBuf::from("."), poll);
        coordinator.run().await?;
    } else {
        println!("Meshdrop - Participant (rank {})", cli.rank);
        println!("═══════════════════════════════════════");
        println!();
        let mut agent = ParticipantAgent::new(transport, &cli.log_dir, PathBuf::from("."), poll)?;
        agent.run().await?;
    }

    Ok(())
}
