/// chatsync - terminal chat client
///
/// Connects to the chat server's live event stream, keeps a local history
/// mirror and drives a `Synchronizer` from stdin commands. With `--api` the
/// history pages and sends go to the server's REST API; without it the
/// client runs against the local mirror only.
use chatsync_core::http_store::HttpHistoryStore;
use chatsync_core::message_store::{HistoryStore, SledHistoryStore};
use chatsync_core::protocol::InboundEvent;
use chatsync_core::reconciler::PageState;
use chatsync_core::transport::TcpTransport;
use chatsync_core::{
    ActiveView, Config, ConversationKey, LocalUser, MessageId, Session, SyncError, Synchronizer,
};
use colored::*;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let user = LocalUser::new(config.user_id.clone(), config.user_name.clone());
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let mirror = SledHistoryStore::new(&data_dir, user.id.clone())
        .map_err(|e| anyhow::anyhow!("History store error: {}", e))?;

    let history: Arc<dyn HistoryStore> = match &config.api_url {
        Some(url) => {
            let store = HttpHistoryStore::new(url.clone(), config.api_token.clone(), config.request_timeout)
                .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
            info!("   History API: {}", store.base_url());
            Arc::new(store)
        }
        None => {
            warn!("No --api given, messages are stored locally and not sent to the server");
            Arc::new(mirror.clone())
        }
    };

    let (transport, inbound) =
        TcpTransport::connect(config.server_addr.clone(), user.id.clone(), config.reconnect.clone());
    info!("Starting chatsync for {} against {}", user.id, config.server_addr);
    info!("   Data dir: {}", data_dir.display());

    let session = Session::login(user, config, Arc::new(transport), history);
    let sync = session.synchronizer();

    // Mirror live messages into local history before the synchronizer sees them
    let (events_tx, events_rx) = mpsc::channel(256);
    tokio::spawn(mirror_history(inbound, events_tx, mirror));
    let runner = sync.clone();
    tokio::spawn(async move { runner.run(events_rx).await });
    tokio::spawn(render_view(sync.clone()));

    print_help();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !handle_command(&sync, line).await {
            break;
        }
    }

    session.logout(&sync).await;
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_command(sync: &Synchronizer, line: &str) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    let result = match command {
        "/open" => match rest.parse::<ConversationKey>() {
            Ok(key) => sync.open_conversation(key).await,
            Err(e) => Err(e),
        },
        "/more" => sync.load_more_messages().await.map(|started| {
            if !started {
                println!("{}", "Nothing more to load".dimmed());
            }
        }),
        "/close" => {
            sync.close_conversation().await;
            Ok(())
        }
        "/unread" => {
            for (key, count) in sync.unread_counts().await {
                println!("  {} {}", key.to_string().cyan(), count.to_string().yellow().bold());
            }
            Ok(())
        }
        "/help" => {
            print_help();
            Ok(())
        }
        "/quit" => return false,
        _ if command.starts_with('/') => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            Ok(())
        }
        _ => sync.send(line).await.map(|_| ()),
    };

    if let Err(e) = result {
        match &e {
            SyncError::Send { body, .. } => {
                eprintln!("{} {} (unsent: {})", "✗".red().bold(), e, body.yellow())
            }
            _ => eprintln!("{} {}", "✗".red().bold(), e),
        }
    }
    true
}

async fn mirror_history(
    mut inbound: mpsc::Receiver<InboundEvent>,
    events: mpsc::Sender<InboundEvent>,
    history: SledHistoryStore,
) {
    while let Some(event) = inbound.recv().await {
        if let InboundEvent::ReceiveMessage(msg) | InboundEvent::ReceiveGroupMessage(msg) = &event {
            if let Err(e) = history.save(msg) {
                warn!("Failed to store {}: {}", msg.id, e);
            }
        }
        if events.send(event).await.is_err() {
            break;
        }
    }
}

async fn render_view(sync: Synchronizer) {
    let mut view = sync.on_active_view_change();
    let mut typing = sync.on_typing_change();
    let mut screen = Screen::default();

    loop {
        tokio::select! {
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = view.borrow_and_update().clone();
                screen.print(&current, sync.user().id.as_str());
            }
            changed = typing.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(who) = typing.borrow_and_update().who.clone() {
                    println!("{}", format!("{} is typing...", who).dimmed().italic());
                }
            }
        }
    }
}

/// What is currently printed for the open conversation
#[derive(Default)]
struct Screen {
    conversation: Option<ConversationKey>,
    first: Option<MessageId>,
    shown: usize,
}

impl Screen {
    /// Print new messages, or redraw when the conversation changed or older
    /// pages were prepended.
    fn print(&mut self, view: &ActiveView, me: &str) {
        let Some(key) = &view.conversation else {
            *self = Screen::default();
            return;
        };

        let first = view.messages.first().map(|m| m.id.clone());
        let redraw = self.conversation.as_ref() != Some(key)
            || self.first != first
            || self.shown > view.messages.len();
        let start = if redraw {
            let hint = if view.has_more { "(/more for older)" } else { "" };
            println!(
                "{} {} {}",
                "──".bright_black(),
                key.to_string().bright_cyan().bold(),
                hint.dimmed()
            );
            0
        } else {
            self.shown
        };

        for msg in &view.messages[start..] {
            let sender = if msg.sender.as_str() == me {
                "you".green().bold()
            } else {
                msg.sender.as_str().blue().bold()
            };
            println!(
                "{} {}: {}",
                msg.created_at.format("%H:%M").to_string().bright_black(),
                sender,
                msg.body
            );
        }
        if let PageState::Failed { reason, .. } = &view.state {
            eprintln!("{} Failed to load history: {}", "✗".red().bold(), reason);
        }

        self.conversation = Some(key.clone());
        self.first = first;
        self.shown = view.messages.len();
    }
}

fn print_help() {
    println!("{}", "chatsync".bright_cyan().bold());
    println!("  {} <direct_id|group_id>   Open a conversation", "/open".cyan());
    println!("  {}                        Load older messages", "/more".cyan());
    println!("  {}                       Close the conversation", "/close".cyan());
    println!("  {}                      Queued messages per conversation", "/unread".cyan());
    println!("  {}                        Exit", "/quit".cyan());
    println!("  anything else sends a message");
}
