// Interactive chat session
//
// Connects to the relay under one address, wires an endpoint to a TCP
// connector, then reads slash commands from stdin while endpoint events
// are printed as they arrive.

use crate::config::Config;
use crate::ledger::LedgerAnchor;
use anyhow::{Context, Result};
use colored::*;
use parley_core::{
    Endpoint, EndpointEvent, EndpointHandle, Message, RelayLink, SessionState, TcpConnector, Via,
};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

/// One line of user input
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Connect(String),
    Send { peer: String, content: String },
    Close(String),
    Contact(String),
    Sessions,
    Help,
    Quit,
}

/// Parse a line of input. `Ok(None)` for a blank line, `Err` carries a
/// usage hint.
pub fn parse_command(line: &str) -> Result<Option<ChatCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let mut parts = line.splitn(3, ' ');
    let verb = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());
    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());

    let command = match (verb, arg, rest) {
        ("/connect", Some(peer), None) => ChatCommand::Connect(peer.to_string()),
        ("/connect", _, _) => return Err("Usage: /connect <address>".to_string()),
        ("/send", Some(peer), Some(content)) => ChatCommand::Send {
            peer: peer.to_string(),
            content: content.to_string(),
        },
        ("/send", _, _) => return Err("Usage: /send <address> <message>".to_string()),
        ("/close", Some(peer), None) => ChatCommand::Close(peer.to_string()),
        ("/close", _, _) => return Err("Usage: /close <address>".to_string()),
        ("/contact", Some(peer), None) => ChatCommand::Contact(peer.to_string()),
        ("/contact", _, _) => return Err("Usage: /contact <address>".to_string()),
        ("/sessions", None, None) => ChatCommand::Sessions,
        ("/help", _, _) => ChatCommand::Help,
        ("/quit" | "/exit", _, _) => ChatCommand::Quit,
        _ => return Err("Unknown command, try /help".to_string()),
    };

    Ok(Some(command))
}

fn prompt() {
    print!("> ");
    let _ = std::io::Write::flush(&mut std::io::stdout());
}

fn timestamp(millis: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp_millis(millis as i64).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();
    local.format("%H:%M:%S").to_string()
}

fn print_help() {
    println!("{}", "Commands:".bold());
    println!("  {} <address>            ", "/connect".bright_green());
    println!("  {} <address> <message>     ", "/send".bright_green());
    println!("  {} <address>              ", "/close".bright_green());
    println!("  {} <address>            ", "/contact".bright_green());
    println!("  {}                     ", "/sessions".bright_green());
    println!("  {}                         ", "/quit".bright_green());
}

fn via_tag(via: Via) -> ColoredString {
    match via {
        Via::Direct => "direct".green(),
        Via::Relay => "relay".yellow(),
    }
}

fn print_message(arrow: ColoredString, peer: &str, message: &Message, via: Via) {
    println!(
        "\n{} {} [{} {}] {}",
        arrow,
        peer.bright_cyan(),
        timestamp(message.timestamp).dimmed(),
        via_tag(via),
        message.content
    );
    println!("   {}", format!("hash {}", message.hash).dimmed());
}

fn print_event(event: &EndpointEvent) {
    match event {
        EndpointEvent::Registered { address } => {
            println!("\n{} Registered as {}", "✓".green(), address.bright_cyan());
        }
        EndpointEvent::RelayError { message } => {
            println!("\n{} Relay: {}", "✗".red(), message);
        }
        EndpointEvent::ContactRequest { from } => {
            let from = from.as_deref().unwrap_or("(unregistered)");
            println!("\n{} Contact request from {}", "✉".bright_yellow(), from.bright_cyan());
        }
        EndpointEvent::SessionChanged { peer, state } => {
            let state = match state {
                SessionState::Connected => state.to_string().green(),
                SessionState::Closed => state.to_string().red(),
                _ => state.to_string().yellow(),
            };
            println!("\n{} {} is {}", "•".bright_blue(), peer.bright_cyan(), state);
        }
        EndpointEvent::MessageSent { message, via } => {
            print_message("→".bright_green(), &message.to, message, *via);
        }
        EndpointEvent::MessageReceived { message, via } => {
            print_message("←".bright_blue(), &message.from, message, *via);
        }
        EndpointEvent::MessageFailed { peer, reason } => {
            println!("\n{} Message from {} dropped: {}", "✗".red(), peer.bright_cyan(), reason);
        }
        EndpointEvent::CommandFailed { peer, reason } => {
            println!("\n{} {}: {}", "✗".red(), peer.bright_cyan(), reason);
        }
    }
    prompt();
}

/// Returns false once the session should end
async fn dispatch(handle: &EndpointHandle, command: ChatCommand) -> bool {
    match command {
        ChatCommand::Connect(peer) => {
            // Failures surface as CommandFailed events.
            let _ = handle.connect(&peer).await;
        }
        ChatCommand::Send { peer, content } => {
            let _ = handle.send(&peer, &content).await;
        }
        ChatCommand::Close(peer) => match handle.close(&peer).await {
            Ok(true) => println!("{} Closed session with {}", "✓".green(), peer.bright_cyan()),
            Ok(false) => println!("{} No session with {}", "•".dimmed(), peer),
            Err(e) => println!("{} {}", "✗".red(), e),
        },
        ChatCommand::Contact(peer) => match handle.contact_request(&peer).await {
            Ok(()) => println!("{} Contact request sent to {}", "✓".green(), peer.bright_cyan()),
            Err(e) => println!("{} {}", "✗".red(), e),
        },
        ChatCommand::Sessions => match handle.sessions().await {
            Ok(sessions) if sessions.is_empty() => println!("{}", "No sessions.".dimmed()),
            Ok(sessions) => {
                for s in sessions {
                    println!("  • {:<16} {:<10} {}", s.peer.bright_cyan(), s.role, s.state);
                }
            }
            Err(e) => println!("{} {}", "✗".red(), e),
        },
        ChatCommand::Help => print_help(),
        ChatCommand::Quit => return false,
    }
    true
}

pub async fn run(config: &Config, address: String, relay_url: Option<String>) -> Result<()> {
    let ledger_path = config.ledger_file()?;
    let anchor = Arc::new(
        LedgerAnchor::open(&ledger_path)
            .with_context(|| format!("Failed to open ledger {}", ledger_path.display()))?,
    );

    let link_config = config.relay_link(relay_url);
    println!("{}", "Parley — Starting...".bold());
    println!("  Address: {}", address.bright_cyan());
    println!("  Relay:   {}", link_config.url);
    println!("  Ledger:  {} ({} commitments)", ledger_path.display(), anchor.len());
    println!();

    let (relay, relay_events) = RelayLink::spawn(link_config, address.clone());
    let (link_tx, link_rx) = mpsc::unbounded_channel();
    let connector = Arc::new(TcpConnector::new(config.tcp_connector(), link_tx));

    let (endpoint, mut events) = Endpoint::new(&address, connector, relay.requests(), anchor);
    let (handle, endpoint_task) = endpoint.spawn(relay_events, link_rx);

    print_help();
    println!();

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let stdin_handle = handle.clone();
    let stdin_task = tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();

        prompt();
        while let Ok(Some(line)) = lines.next_line().await {
            match parse_command(&line) {
                Ok(Some(command)) => {
                    if !dispatch(&stdin_handle, command).await {
                        println!("Shutting down...");
                        break;
                    }
                }
                Ok(None) => {}
                Err(usage) => println!("{}", usage),
            }
            prompt();
        }
        stdin_handle.shutdown().await;
    });

    tokio::select! {
        _ = endpoint_task => {}
        _ = stdin_task => {}
    }
    event_task.abort();
    drop(handle);

    relay.join().await.context("Relay link failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_keeps_spaces_in_content() {
        assert_eq!(
            parse_command("/send BOB hello there  friend").unwrap(),
            Some(ChatCommand::Send {
                peer: "BOB".to_string(),
                content: "hello there  friend".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(
            parse_command("/connect BOB").unwrap(),
            Some(ChatCommand::Connect("BOB".to_string()))
        );
        assert_eq!(
            parse_command("  /close BOB ").unwrap(),
            Some(ChatCommand::Close("BOB".to_string()))
        );
        assert_eq!(
            parse_command("/contact BOB").unwrap(),
            Some(ChatCommand::Contact("BOB".to_string()))
        );
        assert_eq!(parse_command("/sessions").unwrap(), Some(ChatCommand::Sessions));
        assert_eq!(parse_command("/quit").unwrap(), Some(ChatCommand::Quit));
        assert_eq!(parse_command("/exit").unwrap(), Some(ChatCommand::Quit));
    }

    #[test]
    fn test_parse_blank_line() {
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_usage_errors() {
        assert!(parse_command("/send BOB").is_err());
        assert!(parse_command("/connect").is_err());
        assert!(parse_command("/connect BOB extra").is_err());
        assert!(parse_command("hello").is_err());
    }

    #[test]
    fn test_timestamp_format() {
        let formatted = timestamp(0);
        assert_eq!(formatted.len(), 8);
        assert_eq!(formatted.matches(':').count(), 2);
    }
}
