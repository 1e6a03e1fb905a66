use clap::{Args, Parser, Subcommand};
use log::{error, info};
use petid_messenger::api::events::PushEvent;
use petid_messenger::api::models::{ChatId, ConversationRef, MediaUpload, UserId};
use petid_messenger::api::{ApiClient, MessengerApi};
use petid_messenger::app::AppState;
use petid_messenger::storage::ConversationCache;
use petid_messenger::utils::{self, RUNTIME};
use petid_messenger::{ChannelSignal, Credentials, Error, Result, SendOutcome, Session};
use std::path::PathBuf;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "petid-messenger", version, about = "Pet ID messaging client")]
struct Cli {
    /// Config file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store server and credential, after checking them against the server.
    Login {
        #[arg(long)]
        server: String,
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        token: String,
    },
    /// Forget the credential and the cached conversation list.
    Logout,
    /// List conversations.
    Chats,
    /// Stay connected and print unread counts and incoming messages.
    Watch,
    /// Show the conversation with a user, starting one if needed.
    Open {
        #[arg(long)]
        user: UserId,
    },
    Send {
        #[command(flatten)]
        target: Target,
        text: String,
    },
    Attach {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        caption: Option<String>,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Target {
    #[arg(long)]
    user: Option<UserId>,
    #[arg(long)]
    chat: Option<ChatId>,
}

fn main() {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = RUNTIME.block_on(run(cli)) {
        error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut state = match &cli.config {
        Some(path) if path.exists() => AppState::load_from(path)?,
        Some(_) => AppState::new(),
        None => AppState::load(),
    };

    match cli.command {
        Command::Login {
            server,
            user_id,
            token,
        } => {
            let base_url = utils::normalize_url(&server);
            let api = ApiClient::new(&base_url, Credentials::new(Some(token.clone())))?;
            let unread = api.unread_count().await?;
            state.base_url = base_url;
            state.user_id = Some(user_id);
            state.token = Some(token);
            save(&state, &cli.config)?;
            println!("logged in as user {user_id} ({unread} unread)");
        }
        Command::Logout => {
            if state.is_logged_in() {
                Session::from_config(&state).await?.logout();
            } else if let Some(path) = state
                .user_id
                .and_then(ConversationCache::default_location)
            {
                if path.exists() {
                    ConversationCache::open(path)?.clear()?;
                }
            }
            state.token = None;
            save(&state, &cli.config)?;
            println!("logged out");
        }
        Command::Chats => {
            let session = open_session(&state).await?;
            let directory = session.messenger().directory();
            directory.load_all().await?;
            for conversation in directory.entries() {
                let preview = conversation
                    .last_message
                    .as_ref()
                    .map(|m| m.content.as_str())
                    .unwrap_or_default();
                println!(
                    "{:>8}  {:<24} {:>3} unread  {}",
                    conversation.id.chat_id().unwrap_or_default(),
                    conversation.title(),
                    conversation.unread_count,
                    preview
                );
            }
        }
        Command::Watch => {
            let session = open_session(&state).await?;
            watch(&session).await;
        }
        Command::Open { user } => {
            let session = open_session(&state).await?;
            let outcome = session.messenger().open_with_counterpart(user).await?;
            info!("opened {:?}", outcome);
            print_timeline(&session);
        }
        Command::Send { target, text } => {
            let session = open_session(&state).await?;
            select_target(&session, &target).await?;
            session.messenger().set_draft(text);
            let outcome = session.messenger().send().await?;
            report(outcome);
        }
        Command::Attach {
            target,
            caption,
            files,
        } => {
            let session = open_session(&state).await?;
            select_target(&session, &target).await?;
            let mut media = Vec::with_capacity(files.len());
            for path in &files {
                media.push(MediaUpload::from_path(path).await?);
            }
            session.messenger().set_draft(caption.unwrap_or_default());
            let outcome = session.messenger().send_attachments(media).await?;
            report(outcome);
        }
    }
    Ok(())
}

fn save(state: &AppState, path: &Option<PathBuf>) -> Result<()> {
    match path {
        Some(path) => state.save_to(path),
        None => state.save(),
    }
}

async fn open_session(state: &AppState) -> Result<Session> {
    if !state.is_logged_in() {
        return Err(Error::NotAuthenticated);
    }
    Session::from_config(state).await
}

async fn select_target(session: &Session, target: &Target) -> Result<()> {
    let messenger = session.messenger();
    match (target.user, target.chat) {
        (Some(user), _) => {
            messenger.open_with_counterpart(user).await?;
        }
        (None, Some(chat)) => {
            messenger.directory().load_all().await?;
            messenger.select(ConversationRef::Durable(chat)).await?;
        }
        (None, None) => return Err(Error::NoConversationSelected),
    }
    Ok(())
}

fn print_timeline(session: &Session) {
    let me = session.messenger().current_user();
    for entry in session.messenger().messages() {
        let who = if entry.message.sender_id == me { "me" } else { "them" };
        let files = entry.message.attachments.len();
        if files > 0 {
            println!("[{who}] {} (+{files} files)", entry.message.content);
        } else {
            println!("[{who}] {}", entry.message.content);
        }
    }
}

fn report(outcome: SendOutcome) {
    match outcome {
        SendOutcome::Delivered(id) => println!("sent to {id}"),
        SendOutcome::Promoted(id) => println!("sent; conversation is now {id}"),
        SendOutcome::Unreconciled => println!("sent; conversation not listed by the server yet"),
    }
}

async fn watch(session: &Session) {
    let mut signals = session.channel().subscribe();
    let mut unread = session.unread().watch();
    println!("unread: {}", *unread.borrow_and_update());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = unread.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("unread: {}", *unread.borrow_and_update());
            }
            signal = signals.recv() => match signal {
                Ok(ChannelSignal::Connected) => println!("connected"),
                Ok(ChannelSignal::Disconnected) => println!("disconnected"),
                Ok(ChannelSignal::Event(PushEvent::NewMessage(m))) => {
                    println!("chat {} from user {}: {}", m.chat_id, m.sender_id, m.content);
                }
                Ok(ChannelSignal::Event(PushEvent::UnreadCount(_))) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
