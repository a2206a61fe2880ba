//! Line-oriented chat console on stdin/stdout.

use std::path::Path;

use anyhow::Result;
use disasternet_chat::{ChatError, ChatRoom, transcript};
use disasternet_network::MeshNode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    Peers,
    Info,
    History,
    Clear,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Say(line.to_string());
    };
    match rest.split_whitespace().next().unwrap_or("") {
        "peers" => Command::Peers,
        "info" => Command::Info,
        "history" => Command::History,
        "clear" => Command::Clear,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

const HELP: &str = "\
Commands:
  /peers    senders seen in the room and live connections
  /info     room, nickname and peer id
  /history  messages saved in the transcript
  /clear    empty the transcript
  /quit     leave
Anything else is sent to the room.";

/// Run until `/quit`, end of input, or Ctrl-C.
pub async fn run(node: &MeshNode, room: &ChatRoom, transcript_path: &Path) -> Result<()> {
    let own_id = room.info().peer_id;
    let (_observer, mut incoming) = room.message_stream();
    let printer = tokio::spawn(async move {
        while let Some(msg) = incoming.recv().await {
            if msg.sender_id != own_id {
                println!("{}", msg.log_line());
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else { break };

        match parse_command(&line) {
            Command::Empty => {}
            Command::Say(body) => match room.send_message(&body) {
                Ok(_) => {}
                Err(ChatError::Validation(reason)) => println!("! {reason}"),
                Err(e) => {
                    warn!("Send failed: {e}");
                    println!("! could not send: {e}");
                }
            },
            Command::Peers => {
                println!("In room: {}", room.peers_in_room().join(", "));
                println!("Connected peers: {}", node.connected_peers().await.len());
            }
            Command::Info => println!("{}", serde_json::to_string_pretty(&room.info())?),
            Command::History => match transcript::read_entries(transcript_path) {
                Ok(entries) if entries.is_empty() => println!("(transcript is empty)"),
                Ok(entries) => entries.iter().for_each(|e| println!("{e}")),
                Err(e) => println!("! cannot read transcript: {e}"),
            },
            Command::Clear => match transcript::clear(transcript_path) {
                Ok(()) => println!("Transcript cleared"),
                Err(e) => println!("! cannot clear transcript: {e}"),
            },
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
            Command::Unknown(cmd) => println!("! unknown command /{cmd}, try /help"),
        }
    }

    printer.abort();
    Ok(())
}
