mod config;
mod console;
mod logging;

use anyhow::Context;
use disasternet_chat::{ChatRoom, TranscriptWriter};
use disasternet_network::{MeshNode, NodeIdentity};
use tracing::info;

use crate::config::AppConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    let _log_guard = logging::init_logging_to_dir(&config.log_dir, logging::DEFAULT_FILTER)?;
    info!("Starting DisasterNet v{VERSION}");

    let mut node = MeshNode::new(NodeIdentity::generate(), config.network_config());
    node.start().await.context("Failed to start mesh node")?;

    let room = ChatRoom::new(node.router().clone(), &config.room, &config.nickname);
    room.subscribe();

    let transcript = TranscriptWriter::spawn(&config.transcript)
        .with_context(|| format!("Failed to open transcript {}", config.transcript.display()))?;
    transcript.attach(&room);

    let info = room.info();
    println!(
        "DisasterNet v{VERSION}: {} in '{}' as peer {}",
        info.nickname, info.room, info.peer_id
    );
    for addr in node.listen_addrs() {
        println!("  listening on {addr}");
    }
    println!("Type /help for commands.");

    let result = console::run(&node, &room, &config.transcript).await;

    room.leave();
    node.stop().await;
    transcript.close().await;
    info!("DisasterNet stopped");
    result
}
