use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{ClientEvent, CloseReason, HttpBackend, MoriClient};
use shared::{
    domain::{BroadcastTopic, ConversationId, GroupId, LikeKind, LikeTarget, UserId},
    protocol::DirectMessage,
};
use tracing::info;

mod settings;

use settings::{ClientSettings, SettingsOverrides, DEFAULT_SETTINGS_FILE};

#[derive(Parser, Debug)]
#[command(name = "mori", about = "Direct chat and likes from the terminal")]
struct Cli {
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long)]
    backend_url: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    user_id: Option<i64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List conversations with their unread counts.
    Conversations,
    /// Print the visible history of a conversation and mark it read.
    Open { conversation_id: i64 },
    Send {
        conversation_id: i64,
        message: String,
    },
    Leave { conversation_id: i64 },
    FindOrCreate {
        #[arg(long)]
        group_id: i64,
        #[arg(long)]
        host_id: i64,
        #[arg(long)]
        member_id: i64,
    },
    Unread {
        /// Restrict the refresh to these conversations.
        #[arg(long = "conversation", value_delimiter = ',')]
        conversations: Vec<i64>,
    },
    /// Toggle a like on a group post or review.
    Like {
        kind: String,
        target_id: i64,
        #[arg(long)]
        group_id: i64,
    },
    /// Stream realtime activity until interrupted.
    Watch {
        #[arg(long)]
        open: Option<i64>,
        #[arg(long = "group", value_delimiter = ',')]
        groups: Vec<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let settings = ClientSettings::load(
        &cli.config,
        &SettingsOverrides {
            backend_url: cli.backend_url.clone(),
            api_key: cli.api_key.clone(),
            user_id: cli.user_id,
        },
    )?;
    let me = settings.user()?;
    let backend = HttpBackend::new(settings.backend_url.clone(), settings.api_key.clone())?;
    let client = MoriClient::new(
        backend.clone(),
        backend.clone(),
        backend.clone(),
        settings.client_config(),
    );
    client.sign_in(me).await;

    match cli.command {
        Command::Conversations => {
            let conversations = client.chat().refresh_conversations().await?;
            for conversation in conversations {
                let unread = client.unread().count(conversation.id).await;
                let counterpart = conversation
                    .counterpart(me)
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "#{} group={} with={} unread={}",
                    conversation.id, conversation.group_id, counterpart, unread
                );
            }
        }
        Command::Open { conversation_id } => {
            let messages = client
                .chat()
                .open_conversation(ConversationId(conversation_id))
                .await?;
            for message in &messages {
                print_message(message);
            }
        }
        Command::Send {
            conversation_id,
            message,
        } => {
            client
                .chat()
                .open_conversation(ConversationId(conversation_id))
                .await?;
            let sent = client.chat().send_message(&message).await?;
            print_message(&sent);
        }
        Command::Leave { conversation_id } => {
            client
                .chat()
                .leave_conversation(ConversationId(conversation_id))
                .await?;
            println!("left #{conversation_id}");
        }
        Command::FindOrCreate {
            group_id,
            host_id,
            member_id,
        } => {
            let conversation = client
                .chat()
                .find_or_create_conversation(GroupId(group_id), UserId(host_id), UserId(member_id))
                .await?;
            println!("{}", serde_json::to_string_pretty(&conversation)?);
        }
        Command::Unread { conversations } => {
            let subset: Vec<ConversationId> =
                conversations.into_iter().map(ConversationId).collect();
            let counts = client
                .unread()
                .refresh((!subset.is_empty()).then_some(subset.as_slice()))
                .await?;
            let mut counts: Vec<_> = counts.into_iter().collect();
            counts.sort();
            for (conversation_id, unread) in counts {
                println!("#{conversation_id} unread={unread}");
            }
        }
        Command::Like {
            kind,
            target_id,
            group_id,
        } => {
            let kind = LikeKind::parse(&kind)
                .with_context(|| format!("unknown like kind '{kind}', expected group_post or review"))?;
            let target = LikeTarget::new(kind, target_id);
            client.likes().load(target).await?;
            let state = client.likes().toggle(target, GroupId(group_id)).await?;
            println!(
                "{target} liked={} count={}",
                state.liked, state.count
            );
        }
        Command::Watch { open, groups } => watch(&client, &backend, open, groups).await?,
    }

    Ok(())
}

async fn watch(
    client: &Arc<MoriClient>,
    backend: &Arc<HttpBackend>,
    open: Option<i64>,
    groups: Vec<i64>,
) -> Result<()> {
    let push = backend.connect_push().await?;
    let mut events = client.subscribe_events();
    client.start_realtime().await;
    client
        .likes()
        .listen(
            groups
                .into_iter()
                .map(|id| BroadcastTopic::Group { group_id: GroupId(id) }),
        )
        .await;
    client.chat().refresh_conversations().await?;
    if let Some(conversation_id) = open {
        for message in client
            .chat()
            .open_conversation(ConversationId(conversation_id))
            .await?
        {
            print_message(&message);
        }
    }
    info!("watching for realtime activity, press ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    eprintln!("(skipped {skipped} events)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    client.stop_realtime().await;
    push.abort();
    Ok(())
}

fn print_message(message: &DirectMessage) {
    println!(
        "[{}] {}: {}",
        message.created_at.format("%Y-%m-%d %H:%M:%S"),
        message.sender_id,
        message.content
    );
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::MessageRendered { message } => print_message(message),
        ClientEvent::UnreadChanged {
            conversation_id,
            unread,
        } => println!("#{conversation_id} unread={unread}"),
        ClientEvent::ConversationClosed {
            conversation_id,
            reason,
        } => {
            let why = match reason {
                CloseReason::Left => "you left",
                CloseReason::Deleted => "it was deleted",
            };
            println!("#{conversation_id} closed because {why}");
        }
        ClientEvent::ConversationsRefreshed { conversations } => {
            println!("{} conversations", conversations.len());
        }
        ClientEvent::LikeChanged { state } => {
            println!("{} liked={} count={}", state.target, state.liked, state.count);
        }
        ClientEvent::ConversationOpened {
            conversation_id,
            messages,
        } => println!("opened #{conversation_id} with {messages} messages"),
        ClientEvent::Error(message) => eprintln!("error: {message}"),
    }
}
