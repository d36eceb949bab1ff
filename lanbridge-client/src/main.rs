// LAN Bridge terminal client: prints relayed messages, sends each stdin line as text.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use lanbridge_client::{
    BridgeClient, ClientConfig, ConnectionState, Envelope, EnvelopeKind, FileHandle,
    ReconnectPolicy, DEFAULT_URL,
};
use lanbridge_core::reconnect::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Parser)]
#[command(name = "lanbridge", version, about = "Chat and share files through a LAN Bridge hub")]
struct Cli {
    /// Hub WebSocket address.
    #[arg(long, short, default_value = DEFAULT_URL)]
    url: String,
    /// Reconnect attempts after the connection drops.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
    /// Backoff unit in milliseconds; retry n waits n times this.
    #[arg(long, default_value_t = DEFAULT_BASE_DELAY.as_millis() as u64)]
    base_delay_ms: u64,
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Empty,
    Quit,
    Connect,
    File(&'a str),
    Text(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Command::Empty;
    }
    match line.trim() {
        "/quit" | "/exit" => return Command::Quit,
        "/connect" => return Command::Connect,
        _ => {}
    }
    if let Some(path) = line.strip_prefix("/file ") {
        let path = path.trim();
        if !path.is_empty() {
            return Command::File(path);
        }
    }
    Command::Text(line)
}

fn describe(envelope: &Envelope) -> String {
    let name = envelope.name.as_deref().unwrap_or("?");
    match envelope.kind {
        EnvelopeKind::Text => envelope.payload.clone().unwrap_or_default(),
        EnvelopeKind::File | EnvelopeKind::Image => format!(
            "[{}] {} -> {}",
            envelope.kind,
            name,
            envelope.reference.as_deref().unwrap_or("?")
        ),
        EnvelopeKind::Error => format!(
            "hub error: {}",
            envelope.payload.as_deref().unwrap_or("unknown")
        ),
    }
}

async fn run(client: BridgeClient) -> anyhow::Result<()> {
    for kind in [EnvelopeKind::Text, EnvelopeKind::File, EnvelopeKind::Image] {
        client.on_message(kind, |env| println!("< {}", describe(env)));
    }
    client.on_message(EnvelopeKind::Error, |env| eprintln!("! {}", describe(env)));

    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", client.url()))?;
    eprintln!(
        "connected to {} (/file <path> sends a file, /connect reconnects, /quit exits)",
        client.url()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match parse_command(&line) {
            Command::Empty => continue,
            Command::Quit => break,
            Command::Connect => client.connect().await,
            Command::File(path) => client.send_file(&FileHandle::from_path(path)).await,
            Command::Text(text) => client.send_text(text).await,
        };
        if let Err(e) = result {
            eprintln!("! {e}");
            if client.state() == ConnectionState::Failed {
                eprintln!("! gave up reconnecting; type /connect to try again");
            }
        }
    }
    client.disconnect().await;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::new(cli.url).with_reconnect(ReconnectPolicy::new(
        cli.max_attempts,
        Duration::from_millis(cli.base_delay_ms),
    ));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(BridgeClient::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands() {
        assert_eq!(parse_command(""), Command::Empty);
        assert_eq!(parse_command("   \r\n"), Command::Empty);
        assert_eq!(parse_command("/quit"), Command::Quit);
        assert_eq!(parse_command("/connect"), Command::Connect);
        assert_eq!(parse_command("/file ./pic.png "), Command::File("./pic.png"));
        assert_eq!(parse_command("/file"), Command::Text("/file"));
        assert_eq!(parse_command("hello there\n"), Command::Text("hello there"));
    }

    #[test]
    fn describes_stored_payloads() {
        let env = Envelope::stored(EnvelopeKind::Image, "received_1_pic.png", "/uploads/received_1_pic.png");
        assert_eq!(
            describe(&env),
            "[image] received_1_pic.png -> /uploads/received_1_pic.png"
        );
        assert_eq!(describe(&Envelope::error("Unknown message type")), "hub error: Unknown message type");
    }
}
