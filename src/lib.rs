pub mod api;
pub mod app;
pub mod auth;
pub mod directory;
pub mod error;
pub mod messenger;
pub mod push;
pub mod session;
pub mod storage;
pub mod timeline;
pub mod unread;
pub mod utils;

pub use api::models::{Conversation, ConversationRef, Message, UserSummary};
pub use auth::{CredentialSource, Credentials};
pub use error::{Error, Result};
pub use messenger::{Messenger, SendOutcome};
pub use push::{ChannelSignal, ChannelState, PushChannel};
pub use session::{Session, SessionSettings};
pub use unread::UnreadCounter;
