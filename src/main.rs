//! Marketplace chat CLI
//!
//! Operates on a local message store: post, read and inspect conversations,
//! or run a scripted two-party session against it.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use marketplace_chat::backend::{insert_message, Backend, Mutation};
use marketplace_chat::client::{ChatClient, ChatWindow};
use marketplace_chat::config::Config;
use marketplace_chat::inbox::{badge_label, ConversationSummary};
use marketplace_chat::messages::{AdId, ConversationKey, Message, NewMessage, UserId};
use marketplace_chat::session::{load_history, mark_conversation_read, HistoryState};
use marketplace_chat::store::SqliteBackend;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Realtime chat between buyers and sellers of a listing
#[derive(Parser)]
#[command(name = "marketplace-chat")]
#[command(about = "Inspect and drive marketplace conversations")]
struct Cli {
    /// Database file (defaults to the user data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Identifies one conversation from the local user's side
#[derive(Args)]
struct ConversationArgs {
    /// Listing the conversation is about
    #[arg(long)]
    ad: String,

    /// Local user
    #[arg(long)]
    user: String,

    /// Other participant
    #[arg(long)]
    with: String,
}

impl ConversationArgs {
    fn key(&self) -> marketplace_chat::Result<ConversationKey> {
        ConversationKey::between(
            AdId::new(&self.ad),
            UserId::new(&self.user),
            UserId::new(&self.with),
        )
    }

    fn me(&self) -> UserId {
        UserId::new(&self.user)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Post a message
    Send {
        #[command(flatten)]
        conversation: ConversationArgs,

        /// Message text
        text: String,
    },

    /// Show a conversation, oldest first
    History {
        #[command(flatten)]
        conversation: ConversationArgs,
    },

    /// List conversations, most recent first
    Inbox {
        #[arg(long)]
        user: String,
    },

    /// Show the unread badge
    Unread {
        #[arg(long)]
        user: String,
    },

    /// Mark everything addressed to the user in a conversation as read
    MarkRead {
        #[command(flatten)]
        conversation: ConversationArgs,
    },

    /// Delete a message by id
    Delete {
        id: i64,
    },

    /// Run a scripted exchange between two live sessions
    Simulate {
        #[arg(long, default_value = "demo-ad")]
        ad: String,

        #[arg(long, default_value = "buyer")]
        buyer: String,

        #[arg(long, default_value = "seller")]
        seller: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for command output
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::default();
    if let Some(db) = cli.db {
        config = config.with_database(db);
    }

    let store = Arc::new(
        SqliteBackend::open(&config.database)
            .with_context(|| format!("opening {}", config.database.display()))?,
    );
    let out = Output { json: cli.json };

    match cli.command {
        Commands::Send { conversation, text } => cmd_send(&*store, &out, &conversation, &text).await,
        Commands::History { conversation } => cmd_history(&*store, &config, &out, &conversation).await,
        Commands::Inbox { user } => cmd_inbox(&*store, &config, &out, &UserId::new(user)).await,
        Commands::Unread { user } => cmd_unread(&*store, &out, &UserId::new(user)).await,
        Commands::MarkRead { conversation } => cmd_mark_read(&*store, &out, &conversation).await,
        Commands::Delete { id } => cmd_delete(&*store, &out, id).await,
        Commands::Simulate { ad, buyer, seller } => {
            let key = ConversationKey::between(AdId::new(ad), UserId::new(buyer.clone()), UserId::new(seller.clone()))?;
            cmd_simulate(store, config, &out, key, UserId::new(buyer), UserId::new(seller)).await
        }
    }
}

// ============================================================================
// Output
// ============================================================================

struct Output {
    json: bool,
}

impl Output {
    fn print_json<T: Serialize>(&self, value: &T) -> anyhow::Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    fn messages(&self, messages: &[Message]) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(&messages);
        }
        if messages.is_empty() {
            println!("No messages");
        }
        for m in messages {
            println!("{}", format_message(m));
        }
        Ok(())
    }

    fn inbox(&self, summaries: &[ConversationSummary]) -> anyhow::Result<()> {
        if self.json {
            return self.print_json(&summaries);
        }
        if summaries.is_empty() {
            println!("No conversations");
        }
        for s in summaries {
            let unread = if s.unread_count > 0 {
                format!(" ({} unread)", s.unread_count)
            } else {
                String::new()
            };
            println!(
                "{}  {} with {}{}: {}",
                s.last_message_at.format("%Y-%m-%d %H:%M"),
                s.key.ad_id(),
                s.other_user,
                unread,
                s.last_message
            );
        }
        Ok(())
    }
}

fn format_message(m: &Message) -> String {
    let marker = if m.is_read { ' ' } else { '*' };
    format!(
        "{} #{} {} {} -> {}: {}",
        marker,
        m.id,
        m.created_at.format("%Y-%m-%d %H:%M:%S"),
        m.sender_id,
        m.receiver_id,
        m.content
    )
}

// ============================================================================
// CLI Commands
// ============================================================================

async fn cmd_send(
    store: &dyn Backend,
    out: &Output,
    conversation: &ConversationArgs,
    text: &str,
) -> anyhow::Result<()> {
    let key = conversation.key()?;
    let draft = NewMessage::new(&key, &conversation.me(), text)?;
    let row = insert_message(store, draft).await.context("sending message")?;
    info!("Posted message {} to {}", row.id, key);
    out.messages(&[row])
}

async fn cmd_history(
    store: &dyn Backend,
    config: &Config,
    out: &Output,
    conversation: &ConversationArgs,
) -> anyhow::Result<()> {
    let rows = load_history(store, &conversation.key()?, &config.retry).await?;
    out.messages(&rows)
}

async fn cmd_inbox(
    store: &dyn Backend,
    config: &Config,
    out: &Output,
    user: &UserId,
) -> anyhow::Result<()> {
    let summaries = marketplace_chat::inbox::load_inbox(store, user, &config.retry).await?;
    out.inbox(&summaries)
}

#[derive(Serialize)]
struct UnreadReport {
    count: usize,
    badge: String,
}

async fn cmd_unread(store: &dyn Backend, out: &Output, user: &UserId) -> anyhow::Result<()> {
    let count = marketplace_chat::inbox::unread_count(store, user).await?;
    let report = UnreadReport {
        count,
        badge: badge_label(count),
    };
    if out.json {
        return out.print_json(&report);
    }
    println!("{} unread", report.count);
    if !report.badge.is_empty() {
        println!("Badge: {}", report.badge);
    }
    Ok(())
}

async fn cmd_mark_read(
    store: &dyn Backend,
    out: &Output,
    conversation: &ConversationArgs,
) -> anyhow::Result<()> {
    let rows = mark_conversation_read(store, &conversation.key()?, &conversation.me()).await?;
    if out.json {
        return out.print_json(&rows);
    }
    println!("Marked {} message(s) read", rows.len());
    Ok(())
}

async fn cmd_delete(store: &dyn Backend, out: &Output, id: i64) -> anyhow::Result<()> {
    let rows = store.mutate(Mutation::Delete(id)).await?;
    if out.json {
        return out.print_json(&rows);
    }
    if rows.is_empty() {
        println!("No message with id {}", id);
    } else {
        println!("Deleted message {}", id);
    }
    Ok(())
}

/// Buyer and seller open the same conversation, type, and exchange messages
async fn cmd_simulate(
    store: Arc<SqliteBackend>,
    config: Config,
    out: &Output,
    key: ConversationKey,
    buyer: UserId,
    seller: UserId,
) -> anyhow::Result<()> {
    let backend: Arc<dyn Backend> = store;
    let mut buyer_window = ChatWindow::new(ChatClient::new(backend.clone(), config.clone(), buyer.clone()));
    let mut seller_window = ChatWindow::new(ChatClient::new(backend, config, seller.clone()));

    buyer_window.open(&key).await?;
    seller_window.open(&key).await?;

    for window in [&mut buyer_window, &mut seller_window] {
        if let Some(chat) = window.current_mut() {
            chat.wait_until(|v| v.history != HistoryState::Loading).await?;
        }
    }

    let script = [
        (&buyer, "Hi, is this still available?"),
        (&seller, "Yes it is"),
        (&buyer, "Great, can I pick it up tomorrow?"),
    ];

    for (who, text) in script {
        let (sender, receiver) = if who == &buyer {
            (&mut buyer_window, &mut seller_window)
        } else {
            (&mut seller_window, &mut buyer_window)
        };

        sender.input(text)?;
        if let Some(chat) = receiver.current_mut() {
            let view = chat.wait_until(|v| v.presence.is_typing).await?;
            if let (false, Some(who)) = (out.json, view.presence.who) {
                println!("... {} is typing", who);
            }
        }

        sender.send(text).await?;
        if let Some(chat) = sender.current_mut() {
            let view = chat
                .wait_until(|v| {
                    v.error.is_some() || (!v.sending && v.messages.iter().any(|m| m.content == text))
                })
                .await?;
            if let Some(error) = view.error {
                anyhow::bail!("{} could not send {:?}: {}", who, text, error);
            }
        }
        if let Some(chat) = receiver.current_mut() {
            chat.wait_until(|v| v.messages.iter().any(|m| m.content == text && !m.is_pending()))
                .await?;
        }
    }

    // Let the read receipts land before printing
    tokio::time::sleep(Duration::from_millis(100)).await;
    let log = buyer_window.visible_log();

    buyer_window.close().await?;
    seller_window.close().await?;
    out.messages(&log)
}
