use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ChannelState, ChatClient, ClientEvent, ClientHandle, UploadFile,
};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{Message, RegisterRequest},
};
use storage::SqliteCredentialStore;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides `api_url` from client.toml / API_URL.
    #[arg(long)]
    api_url: Option<String>,
    /// Overrides `token_db_url` from client.toml / APP__TOKEN_DB_URL.
    #[arg(long)]
    token_db: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        username: String,
        password: String,
    },
    Register {
        email: String,
        username: String,
        password: String,
    },
    Logout,
    Whoami,
    Conversations,
    StartConversation {
        partner_id: i64,
    },
    History {
        conversation_id: i64,
        /// Extra backward pages to load after the newest one.
        #[arg(long, default_value_t = 0)]
        older: u32,
    },
    Edit {
        message_id: i64,
        content: String,
    },
    Delete {
        conversation_id: i64,
        message_ids: Vec<i64>,
    },
    Upload {
        #[arg(long)]
        conversation_id: Option<i64>,
        paths: Vec<PathBuf>,
    },
    /// Interactive session: stdin lines are sent, `/older` pages back,
    /// `/quit` leaves.
    Chat {
        conversation_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(api_url) = cli.api_url {
        settings = settings.with_api_url(api_url);
    }
    if let Some(token_db) = cli.token_db {
        settings.token_db_url = token_db;
    }

    let credentials = Arc::new(
        SqliteCredentialStore::open(&settings.token_db_url)
            .await
            .with_context(|| format!("failed to open token store {}", settings.token_db_url))?,
    );
    let _watcher = credentials.spawn_watcher(Duration::from_secs(2));
    let client = ChatClient::new(settings, credentials)?;

    match cli.command {
        Command::Login { username, password } => {
            client.login(&username, &password).await?;
            println!("logged in as {username}");
        }
        Command::Register {
            email,
            username,
            password,
        } => {
            client
                .register(RegisterRequest {
                    email,
                    username: username.clone(),
                    password,
                })
                .await?;
            println!("registered and logged in as {username}");
        }
        Command::Logout => {
            if let Err(err) = client.logout().await {
                warn!("server logout failed, local session cleared anyway: {err}");
            }
            println!("logged out");
        }
        Command::Whoami => {
            let user = client.me().await?;
            println!("{} <{}> id={}", user.username, user.email, user.id);
        }
        Command::Conversations => {
            for conversation in client.list_conversations().await? {
                let peer = conversation
                    .peer_summary
                    .as_ref()
                    .and_then(|peer| peer.username.clone())
                    .unwrap_or_else(|| "?".into());
                println!("#{} with {peer}", conversation.id);
            }
        }
        Command::StartConversation { partner_id } => {
            let conversation = client.create_conversation(UserId(partner_id)).await?;
            println!("conversation #{}", conversation.id);
        }
        Command::History {
            conversation_id,
            older,
        } => {
            let conversation_id = ConversationId(conversation_id);
            client.load_latest(conversation_id).await?;
            for _ in 0..older {
                if client.load_older(conversation_id).await?.reached_end {
                    break;
                }
            }
            print_timeline(&client.timeline(conversation_id).await);
        }
        Command::Edit {
            message_id,
            content,
        } => {
            let message = client.edit_message(MessageId(message_id), &content).await?;
            print_message(&message);
        }
        Command::Delete {
            conversation_id,
            message_ids,
        } => {
            let ids: Vec<MessageId> = message_ids.into_iter().map(MessageId).collect();
            let result = client
                .delete_messages(ConversationId(conversation_id), &ids)
                .await?;
            println!(
                "deleted={:?} forbidden={:?} not_found={:?}",
                result.deleted, result.forbidden, result.not_found
            );
        }
        Command::Upload {
            conversation_id,
            paths,
        } => {
            let mut files = Vec::with_capacity(paths.len());
            for path in paths {
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload.bin".into());
                files.push(UploadFile {
                    file_name,
                    mime_type: None,
                    bytes,
                });
            }
            let metas = client
                .upload_files(conversation_id.map(ConversationId), files)
                .await?;
            for meta in metas {
                println!("{} -> {}", meta.file_name, meta.file_path);
            }
        }
        Command::Chat { conversation_id } => {
            run_chat(&client, ConversationId(conversation_id)).await?;
        }
    }

    Ok(())
}

async fn run_chat(client: &Arc<ChatClient>, conversation_id: ConversationId) -> Result<()> {
    let mut events = client.subscribe_events();
    client.open_conversation(conversation_id).await?;
    print_timeline(&client.timeline(conversation_id).await);
    let mut printed = client
        .timeline(conversation_id)
        .await
        .last()
        .map(|message| message.id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/older" => {
                        let merge = client.load_older(conversation_id).await?;
                        if merge.reached_end {
                            println!("-- start of conversation --");
                        }
                        print_timeline(&client.timeline(conversation_id).await);
                    }
                    text => {
                        if !client.send_message(text, Vec::new()).await {
                            println!("-- offline, message not sent --");
                        }
                    }
                }
            }
            event = events.recv() => match event {
                Ok(ClientEvent::HistoryChanged { conversation_id: changed })
                    if changed == conversation_id =>
                {
                    for message in client.timeline(conversation_id).await {
                        if printed.map_or(true, |last| message.id > last) {
                            print_message(&message);
                            printed = Some(message.id);
                        }
                    }
                }
                Ok(ClientEvent::ChannelStateChanged { state, .. }) => match state {
                    ChannelState::Open => println!("-- connected --"),
                    ChannelState::Closed { retryable: true } => println!("-- reconnecting --"),
                    _ => {}
                },
                Ok(ClientEvent::SessionExpired) => {
                    println!("-- session expired, please log in again --");
                    client.teardown_session().await;
                    return Ok(());
                }
                Ok(_) => {}
                Err(err) => warn!("event stream lagged: {err}"),
            },
        }
    }

    client.close_conversation().await;
    info!(%conversation_id, "chat closed");
    Ok(())
}

fn print_timeline(messages: &[Message]) {
    for message in messages {
        print_message(message);
    }
}

fn print_message(message: &Message) {
    let stamp = message
        .created_at
        .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_default();
    let body = match (&message.content, message.deleted) {
        (_, true) | (None, _) => "<deleted>".to_string(),
        (Some(text), false) => text.clone(),
    };
    let edited = if message.is_edited { " (edited)" } else { "" };
    let attachments = if message.attachments.is_empty() {
        String::new()
    } else {
        format!(" [{} attachment(s)]", message.attachments.len())
    };
    println!(
        "[{stamp}] #{} user {}: {body}{edited}{attachments}",
        message.id, message.sender_id
    );
}
