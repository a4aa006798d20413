use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use client_core::{ChatClient, ClientEvent, ConnectionState, JoinOutcome, SessionStore};
use shared::protocol::{Message, MessageKind, NewRoom};

/// Terminal client: log in, enter one room, print its live timeline and
/// send whatever is typed on stdin.
#[derive(Parser)]
#[command(name = "chat-cli")]
struct Args {
    /// Base URL of the chat server
    #[arg(long, default_value = "http://localhost:8000")]
    server_url: String,

    #[arg(long)]
    username: String,

    #[arg(long)]
    password: String,

    /// Create the account before logging in
    #[arg(long)]
    register: bool,

    /// Room to enter after login
    #[arg(long)]
    room: String,

    /// Create the room if it does not exist
    #[arg(long)]
    create: bool,

    /// Make a newly created room private
    #[arg(long)]
    private: bool,

    /// Password for private rooms
    #[arg(long)]
    room_password: Option<String>,

    /// File the session token is persisted to
    #[arg(long, default_value = "chat-token")]
    token_slot: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let session = SessionStore::with_slot(args.token_slot.clone());
    let client = ChatClient::new(args.server_url.clone(), session);

    if args.register {
        client
            .register(&args.username, &args.password)
            .await
            .context("registration failed")?;
    }
    let user = client
        .login(&args.username, &args.password)
        .await
        .context("login failed")?;
    println!("logged in as {}", user.username);

    let rooms = client.list_rooms().await.context("could not list rooms")?;
    let room = match rooms.into_iter().find(|room| room.name == args.room) {
        Some(room) => room,
        None if args.create => client
            .create_room(NewRoom {
                name: args.room.clone(),
                is_private: args.private,
                password: args.room_password.clone(),
            })
            .await
            .context("could not create room")?,
        None => bail!("no room named {:?}; pass --create to make it", args.room),
    };

    let outcome = client
        .join_room(&room, args.room_password.as_deref())
        .await;
    if let JoinOutcome::Rejected(reason) = &outcome {
        bail!("cannot join {}: {reason}", room.name);
    }

    let mut events = client.subscribe_events();
    let room_session = client.enter_room(room.id).await?;
    println!("entered {} (ctrl-d to leave)", room.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Ok(event) = event else { break };
                match event {
                    ClientEvent::HistoryLoaded { count, .. } => {
                        println!("-- {count} earlier messages --");
                        for message in room_session.snapshot().await.iter().take(count) {
                            print_message(message);
                        }
                    }
                    ClientEvent::MessageAppended { message, .. } => print_message(&message),
                    ClientEvent::ConnectionChanged { state, .. } => match state {
                        ConnectionState::Open => println!("[connected]"),
                        ConnectionState::Closed { reason, .. } => {
                            if reason.is_empty() {
                                println!("[disconnected]");
                            } else {
                                println!("[disconnected: {reason}]");
                            }
                            break;
                        }
                        _ => {}
                    },
                    ClientEvent::RoomAccessRevoked { reason, .. } => {
                        println!("[access revoked: {reason}]");
                        break;
                    }
                    ClientEvent::AuthChanged(_) => {}
                    ClientEvent::Error(message) => warn!("{message}"),
                }
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) if !line.trim().is_empty() => {
                        room_session.send(line.trim()).await;
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }
    Ok(())
}

fn print_message(message: &Message) {
    match message.kind {
        MessageKind::System => println!("-- {} --", message.content),
        MessageKind::User => println!(
            "<{}> {}",
            message.username.as_deref().unwrap_or("?"),
            message.content
        ),
    }
}
