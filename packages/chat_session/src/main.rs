use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use chat_session::config::{SessionConfig, load_file_config, render_toml};
use chat_session::conversation::{Delivery, LogEntry};
use chat_session::directory::HttpDirectory;
use chat_session::model::{ConversationKey, Identity, PresenceEntry};
use chat_session::transport::Credentials;
use chat_session::transport::link::WsConnector;
use chat_session::{SessionEvent, SessionHandle};

#[derive(Parser)]
#[command(name = "chat-session")]
#[command(about = "Terminal chat client for a STOMP broadcast/private-queue broker")]
struct Cli {
    /// Your user id (the directory's username)
    #[arg(short, long)]
    user: String,

    /// Display name (defaults to the user id)
    #[arg(short, long)]
    name: Option<String>,

    /// Opaque auth token passed to the broker and the directory
    #[arg(long)]
    token: Option<String>,

    /// Broker WebSocket endpoint (overrides config)
    #[arg(long)]
    endpoint: Option<String>,

    /// Directory base URL (overrides config)
    #[arg(long)]
    directory_url: Option<String>,

    /// Path to a config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Text(String),
    To(String),
    All,
    Who,
    Log,
    Quit,
    Empty,
    Unknown(String),
}

fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Text(line.to_string());
    };
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map(|(n, a)| (n, a.trim()))
        .unwrap_or((command, ""));
    match (name, arg) {
        ("to", id) if !id.is_empty() => Input::To(id.to_string()),
        ("all", "") => Input::All,
        ("who", "") => Input::Who,
        ("log", "") => Input::Log,
        ("quit" | "exit", "") => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    }
}

fn format_entry(entry: &LogEntry) -> String {
    let mut line = String::new();
    if entry.after_gap {
        line.push_str("  ... messages may be missing here ...\n");
    }
    line.push_str(&format!(
        "[{}] {}: {}",
        entry.event.sent_at.format("%H:%M:%S"),
        entry.event.sender,
        entry.event.display_text()
    ));
    match entry.delivery {
        Delivery::Unconfirmed => line.push_str("  (not delivered)"),
        Delivery::Sent => line.push_str("  (sending)"),
        Delivery::Received | Delivery::Confirmed => {}
    }
    if entry.out_of_order {
        line.push_str("  (out of order)");
    }
    line
}

fn format_roster(roster: &[PresenceEntry]) -> String {
    if roster.is_empty() {
        return "* nobody else is online".to_string();
    }
    let names: Vec<String> = roster
        .iter()
        .map(|e| {
            if e.identity.display_name == e.identity.id {
                e.identity.id.clone()
            } else {
                format!("{} ({})", e.identity.id, e.identity.display_name)
            }
        })
        .collect();
    format!("* online: {}", names.join(", "))
}

fn prefix(key: &ConversationKey) -> String {
    match key {
        ConversationKey::Broadcast => String::new(),
        ConversationKey::Direct(id) => format!("<{id}> "),
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::StateChanged(state)) => println!("* {state}"),
            Ok(SessionEvent::Appended { key, entry }) => {
                if entry.delivery == Delivery::Received {
                    println!("{}{}", prefix(&key), format_entry(&entry));
                }
            }
            Ok(SessionEvent::DeliveryChanged { key, entry }) => {
                if entry.delivery == Delivery::Unconfirmed {
                    println!("! {}message #{} was not delivered", prefix(&key), entry.seq);
                }
            }
            Ok(SessionEvent::RosterChanged(roster)) => println!("{}", format_roster(&roster)),
            Ok(SessionEvent::BrokerError(message)) => println!("! broker error: {message}"),
            Ok(SessionEvent::DirectoryFetchFailed(e)) => println!("! could not refresh roster: {e}"),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "display fell behind"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "chat_session=debug,info"
    } else {
        "chat_session=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let file_config = load_file_config(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.print_config {
        print!("{}", render_toml(&file_config)?);
        return Ok(());
    }
    let mut config = SessionConfig::from_file(&file_config);
    if let Some(endpoint) = cli.endpoint {
        config.transport.endpoint = endpoint;
    }
    if let Some(url) = cli.directory_url {
        config.directory.base_url = url;
    }

    let identity = Identity::new(cli.user.clone(), cli.name.unwrap_or_else(|| cli.user.clone()));
    let directory =
        HttpDirectory::new(&config.directory, cli.token.clone()).context("Failed to build directory client")?;
    let credentials = Credentials {
        login: cli.user,
        token: cli.token,
    };

    info!(id = %identity.id, endpoint = %config.transport.endpoint, "connecting");
    let handle = SessionHandle::start(
        config,
        identity,
        credentials,
        Arc::new(WsConnector),
        Arc::new(directory),
    )
    .context("Failed to start session")?;
    tokio::spawn(print_events(handle.subscribe()));

    println!("Type to chat. /to <id> for a private conversation, /all for everyone, /who, /log, /quit.");
    let mut selected = ConversationKey::Broadcast;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
            () = handle.closed() => {
                println!("* session ended");
                return Ok(());
            }
        };
        let Some(line) = line else { break };

        match parse_input(&line) {
            Input::Empty => {}
            Input::Text(text) => {
                let recipient = match &selected {
                    ConversationKey::Broadcast => None,
                    ConversationKey::Direct(id) => Some(id.as_str()),
                };
                match handle.send(&text, recipient).await {
                    Ok(entry) => println!("{}{}", prefix(&selected), format_entry(&entry)),
                    Err(e) => println!("! not delivered: {e}"),
                }
            }
            Input::To(id) => {
                println!("* talking to {id}");
                selected = ConversationKey::Direct(id);
            }
            Input::All => {
                println!("* talking to everyone");
                selected = ConversationKey::Broadcast;
            }
            Input::Who => {
                let roster = match handle.refresh_roster().await {
                    Ok(roster) => roster,
                    Err(e) => {
                        println!("! could not refresh roster: {e}");
                        handle.roster().await?
                    }
                };
                println!("{}", format_roster(&roster));
            }
            Input::Log => {
                println!("* conversation: {selected}");
                for entry in handle.conversation(selected.clone()).await? {
                    println!("{}", format_entry(&entry));
                }
            }
            Input::Quit => break,
            Input::Unknown(text) => println!("! unknown command {text:?}"),
        }
    }

    handle.logout().await?;
    if tokio::time::timeout(Duration::from_secs(5), handle.closed())
        .await
        .is_err()
    {
        warn!("session did not close in time");
    }
    Ok(())
}
