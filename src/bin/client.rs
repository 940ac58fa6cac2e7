//! Interactive Chat Client - Entry Point
//!
//! Connects to a roomchat server over WebSocket and bridges the terminal:
//! pushed events print as they arrive, while `room [number]`,
//! `send [message]` and `exit` drive the connection.

use std::env;
use std::io::Write;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader, Stdin};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing_subscriber::EnvFilter;

use roomchat::{ChatMessage, ClientMessage, ServerMessage};

/// Default server address
const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Connection attempts before giving up
const MAX_CONNECT_RETRIES: u32 = 5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The terminal is the interface here; logging stays quiet unless
    // RUST_LOG asks for it
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let mut stdin = BufReader::new(tokio::io::stdin());

    let mut args = env::args().skip(1);
    let username = match args.next() {
        Some(name) => name,
        None => prompt(&mut stdin, "Enter your username: ").await?,
    };
    let addr = match args.next() {
        Some(addr) => addr,
        None => {
            let input = prompt(
                &mut stdin,
                &format!("Server address (default {DEFAULT_ADDR}): "),
            )
            .await?;
            if input.is_empty() {
                DEFAULT_ADDR.to_string()
            } else {
                input
            }
        }
    };

    let mut url = url::Url::parse(&format!("ws://{addr}/"))?;
    url.query_pairs_mut().append_pair("username", &username);

    let ws_stream = connect_with_retry(url.as_str()).await?;
    println!("Connected as '{username}'. You start in room 1.");
    println!("Commands:");
    println!("  room [number]  - change room");
    println!("  send [message] - send a message");
    println!("  exit           - quit");
    println!();

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => print_event(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        println!("Connection closed by server.");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        eprintln!("Connection lost: {e}");
                        break;
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("exit") {
                    let _ = ws_sender.close().await;
                    break;
                }
                let msg = if let Some(rest) = command_arg(input, "room ") {
                    match parse_room(rest) {
                        Some(room) => ClientMessage::ChangeRoom { room },
                        None => {
                            println!("Invalid room number. Please enter a positive integer.");
                            continue;
                        }
                    }
                } else if let Some(rest) = command_arg(input, "send ") {
                    if rest.is_empty() {
                        continue;
                    }
                    ClientMessage::SendMessage { text: rest.to_string() }
                } else {
                    println!("Unknown command. Available: room [number], send [message], exit");
                    continue;
                };

                let json = serde_json::to_string(&msg)?;
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    println!("Connection closed by server.");
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Connect to the server, retrying a few times with a growing delay
async fn connect_with_retry(
    url: &str,
) -> Result<WsStream, tokio_tungstenite::tungstenite::Error> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match tokio_tungstenite::connect_async(url).await {
            Ok((stream, _response)) => return Ok(stream),
            Err(e) if attempt < MAX_CONNECT_RETRIES => {
                let delay = Duration::from_secs(u64::from(attempt) * 2);
                eprintln!("Failed to connect: {e}");
                eprintln!("Retrying in {} seconds...", delay.as_secs());
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Print a prompt and read one trimmed line
async fn prompt(stdin: &mut BufReader<Stdin>, text: &str) -> std::io::Result<String> {
    print!("{text}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    stdin.read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

/// Case-insensitive `command` prefix match, returning the trimmed rest
fn command_arg<'a>(input: &'a str, command: &str) -> Option<&'a str> {
    let head = input.get(..command.len())?;
    head.eq_ignore_ascii_case(command)
        .then(|| input[command.len()..].trim())
}

/// Parse a `room` argument. Only positive room numbers leave the client;
/// everything else is rejected before reaching the server.
fn parse_room(arg: &str) -> Option<i64> {
    arg.parse::<i64>().ok().filter(|room| *room > 0)
}

/// Render one pushed server event
fn print_event(json: &str) {
    let event = match serde_json::from_str::<ServerMessage>(json) {
        Ok(event) => event,
        Err(e) => {
            eprintln!("Unreadable server message: {e}");
            return;
        }
    };
    match event {
        ServerMessage::ReceiveMessage { message } => print_chat_message(&message),
        ServerMessage::UserJoined {
            username,
            login_count,
        } => {
            println!("* {username} joined the room (login #{login_count})");
        }
        ServerMessage::UserLeft { username } => {
            println!("* {username} left the room");
        }
        ServerMessage::RoomChanged {
            room,
            recent_messages,
        } => {
            println!("* Moved to room {room}");
            if recent_messages.is_empty() {
                println!("* No messages in this room yet.");
            } else {
                println!("* Last {} messages:", recent_messages.len());
                for message in &recent_messages {
                    print!("  ");
                    print_chat_message(message);
                }
            }
        }
        ServerMessage::Error { message, .. } => {
            println!("Error: {message}");
        }
    }
}

fn print_chat_message(message: &ChatMessage) {
    println!(
        "[{}] {} ({} logins): {}",
        message.timestamp.format("%H:%M:%S"),
        message.username,
        message.login_count,
        message.message
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_room_accepts_positive_numbers() {
        assert_eq!(parse_room("1"), Some(1));
        assert_eq!(parse_room("42"), Some(42));
    }

    #[test]
    fn test_parse_room_rejects_non_positive_and_garbage() {
        assert_eq!(parse_room("0"), None);
        assert_eq!(parse_room("-5"), None);
        assert_eq!(parse_room("two"), None);
        assert_eq!(parse_room(""), None);
    }

    #[test]
    fn test_command_arg_is_case_insensitive_and_trims() {
        assert_eq!(command_arg("ROOM 7", "room "), Some("7"));
        assert_eq!(command_arg("send  hi there ", "send "), Some("hi there"));
        assert_eq!(command_arg("roomy 7", "room "), None);
    }
}
