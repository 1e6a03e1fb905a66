//! In-memory backend and scripted push connector shared by the integration
//! suites.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use petid_messenger::api::MessengerApi;
use petid_messenger::api::models::{
    ChatId, Conversation, ConversationRef, MediaUpload, Message, UserId, UserSummary,
};
use petid_messenger::push::transport::{CloseKind, Inbound, PushConnector, PushSocket};
use petid_messenger::{Error, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use url::Url;

pub const ME: UserId = 1;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Lets spawned tasks run; with paused time this also advances the clock.
pub async fn settle() {
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub fn user(id: UserId, name: &str) -> UserSummary {
    UserSummary {
        id,
        name: name.to_string(),
        last_name: None,
        avatar: None,
    }
}

pub fn message(id: i64, chat_id: ChatId, sender_id: UserId, content: &str, is_read: bool) -> Message {
    Message {
        id,
        chat_id,
        sender_id,
        content: content.to_string(),
        attachments: Vec::new(),
        created_at: None,
        is_read,
    }
}

pub fn conversation(chat_id: ChatId, counterpart: UserSummary, unread: u32) -> Conversation {
    Conversation {
        id: ConversationRef::Durable(chat_id),
        counterpart,
        unread_count: unread,
        last_message: None,
    }
}

#[derive(Default)]
struct BackendState {
    conversations: Vec<Conversation>,
    messages: HashMap<ChatId, Vec<Message>>,
    users: HashMap<UserId, UserSummary>,
    unread: u64,
    failing: HashSet<&'static str>,
    delays: HashMap<&'static str, Duration>,
    chat_delays: HashMap<ChatId, Duration>,
    /// When false, a first send does not make the conversation appear.
    create_on_send: bool,
    next_chat_id: ChatId,
    next_message_id: i64,
    sent: Vec<(UserId, String)>,
    marked_read: Vec<ChatId>,
}

/// A backend that behaves like the real one for the calls the client makes.
pub struct FakeBackend {
    state: Mutex<BackendState>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BackendState {
                create_on_send: true,
                next_chat_id: 100,
                next_message_id: 1000,
                ..BackendState::default()
            }),
            calls: Mutex::new(HashMap::new()),
        })
    }

    pub fn add_user(&self, user: UserSummary) {
        self.state.lock().users.insert(user.id, user);
    }

    pub fn add_conversation(&self, conversation: Conversation, messages: Vec<Message>) {
        let mut state = self.state.lock();
        if let ConversationRef::Durable(chat_id) = conversation.id {
            state.users.insert(conversation.counterpart.id, conversation.counterpart.clone());
            state.messages.insert(chat_id, messages);
        }
        state.conversations.push(conversation);
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.lock().conversations = conversations;
    }

    pub fn set_unread(&self, count: u64) {
        self.state.lock().unread = count;
    }

    pub fn fail(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.state.lock().failing.remove(op);
    }

    pub fn delay(&self, op: &'static str, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    pub fn delay_chat(&self, chat_id: ChatId, delay: Duration) {
        self.state.lock().chat_delays.insert(chat_id, delay);
    }

    pub fn create_on_send(&self, enabled: bool) {
        self.state.lock().create_on_send = enabled;
    }

    /// Id given to the next conversation created by a first send.
    pub fn next_chat_id(&self, id: ChatId) {
        self.state.lock().next_chat_id = id;
    }

    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    pub fn sent(&self) -> Vec<(UserId, String)> {
        self.state.lock().sent.clone()
    }

    pub fn marked_read(&self) -> Vec<ChatId> {
        self.state.lock().marked_read.clone()
    }

    pub fn chat_with(&self, counterpart: UserId) -> Option<ChatId> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|c| c.counterpart.id == counterpart)
            .and_then(|c| c.id.chat_id())
    }

    async fn enter(&self, op: &'static str) -> Result<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let (delay, failing) = {
            let state = self.state.lock();
            (state.delays.get(op).copied(), state.failing.contains(op))
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(Error::Status {
                status: 500,
                message: format!("{op} unavailable"),
            });
        }
        Ok(())
    }

    fn record_send(&self, receiver: UserId, content: &str) {
        let mut state = self.state.lock();
        state.sent.push((receiver, content.to_string()));
        let existing = state
            .conversations
            .iter()
            .find(|c| c.counterpart.id == receiver)
            .and_then(|c| c.id.chat_id());
        let chat_id = match existing {
            Some(id) => id,
            None if state.create_on_send => {
                let id = state.next_chat_id;
                state.next_chat_id += 1;
                let counterpart = state
                    .users
                    .get(&receiver)
                    .cloned()
                    .unwrap_or_else(|| user(receiver, "Someone"));
                state.conversations.insert(0, conversation(id, counterpart, 0));
                id
            }
            None => return,
        };
        let id = state.next_message_id;
        state.next_message_id += 1;
        let msg = message(id, chat_id, ME, content, true);
        state.messages.entry(chat_id).or_default().push(msg.clone());
        if let Some(pos) = state
            .conversations
            .iter()
            .position(|c| c.id == ConversationRef::Durable(chat_id))
        {
            let mut entry = state.conversations.remove(pos);
            entry.last_message = Some(msg);
            state.conversations.insert(0, entry);
        }
    }
}

#[async_trait]
impl MessengerApi for FakeBackend {
    async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.enter("conversations").await?;
        Ok(self.state.lock().conversations.clone())
    }

    async fn messages(&self, chat_id: ChatId) -> Result<Vec<Message>> {
        let delay = self.state.lock().chat_delays.get(&chat_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.enter("messages").await?;
        Ok(self
            .state
            .lock()
            .messages
            .get(&chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_read(&self, chat_id: ChatId) -> Result<()> {
        self.enter("mark_read").await?;
        let mut state = self.state.lock();
        state.marked_read.push(chat_id);
        if let Some(messages) = state.messages.get_mut(&chat_id) {
            for m in messages.iter_mut() {
                m.is_read = true;
            }
        }
        Ok(())
    }

    async fn send_message(&self, receiver_id: UserId, content: &str) -> Result<()> {
        self.enter("send").await?;
        self.record_send(receiver_id, content);
        Ok(())
    }

    async fn send_media(
        &self,
        receiver_id: UserId,
        content: Option<&str>,
        media: Vec<MediaUpload>,
    ) -> Result<()> {
        self.enter("send_media").await?;
        let names: Vec<String> = media.into_iter().map(|m| m.file_name).collect();
        let text = content.map(str::to_string).unwrap_or_else(|| names.join(","));
        self.record_send(receiver_id, &text);
        Ok(())
    }

    async fn unread_count(&self) -> Result<u64> {
        self.enter("unread").await?;
        Ok(self.state.lock().unread)
    }

    async fn user(&self, user_id: UserId) -> Result<UserSummary> {
        self.enter("user").await?;
        self.state
            .lock()
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| Error::Status {
                status: 404,
                message: "no such user".into(),
            })
    }
}

/// What the next connection attempt does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Refuse,
    Accept,
}

/// Server side of one accepted fake socket.
#[derive(Clone)]
pub struct RemoteSocket {
    frames: mpsc::UnboundedSender<Inbound>,
    closed_by_client: Arc<Mutex<Option<String>>>,
}

impl RemoteSocket {
    pub fn push_text(&self, text: &str) {
        let _ = self.frames.send(Inbound::Text(text.to_string()));
    }

    pub fn push_unread(&self, count: u64) {
        self.push_text(&format!(r#"{{"type":"unread_count","data":{{"count":{count}}}}}"#));
    }

    pub fn push_message(&self, message: &Message) {
        let frame = serde_json::json!({ "type": "new_message", "data": message });
        self.push_text(&frame.to_string());
    }

    pub fn close(&self, kind: CloseKind) {
        let _ = self.frames.send(Inbound::Closed(kind));
    }

    pub fn client_close_reason(&self) -> Option<String> {
        self.closed_by_client.lock().clone()
    }
}

/// Connector whose attempts follow a script; once the script runs out every
/// attempt is refused.
#[derive(Default)]
pub struct FakeConnector {
    script: Mutex<VecDeque<Attempt>>,
    attempts: Mutex<Vec<Instant>>,
    urls: Mutex<Vec<Url>>,
    sockets: Mutex<Vec<RemoteSocket>>,
}

impl FakeConnector {
    pub fn new(script: impl IntoIterator<Item = Attempt>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn refusing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn accepting() -> Arc<Self> {
        Self::new([Attempt::Accept])
    }

    pub fn then(&self, attempt: Attempt) {
        self.script.lock().push_back(attempt);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }

    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().clone()
    }

    pub fn socket(&self, index: usize) -> Option<RemoteSocket> {
        self.sockets.lock().get(index).cloned()
    }

    pub fn last_socket(&self) -> Option<RemoteSocket> {
        self.sockets.lock().last().cloned()
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len()
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn PushSocket>> {
        self.attempts.lock().push(Instant::now());
        self.urls.lock().push(url.clone());
        let attempt = self.script.lock().pop_front().unwrap_or(Attempt::Refuse);
        match attempt {
            Attempt::Refuse => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
            Attempt::Accept => {
                let (tx, rx) = mpsc::unbounded_channel();
                let closed_by_client = Arc::new(Mutex::new(None));
                self.sockets.lock().push(RemoteSocket {
                    frames: tx,
                    closed_by_client: closed_by_client.clone(),
                });
                Ok(Box::new(FakeSocket {
                    frames: rx,
                    closed_by_client,
                }))
            }
        }
    }
}

struct FakeSocket {
    frames: mpsc::UnboundedReceiver<Inbound>,
    closed_by_client: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl PushSocket for FakeSocket {
    async fn next_frame(&mut self) -> Result<Inbound> {
        match self.frames.recv().await {
            Some(frame) => Ok(frame),
            // The remote handle is kept in the connector, so this only
            // happens once the connector itself is gone.
            None => Ok(Inbound::Closed(CloseKind::Abnormal(None))),
        }
    }

    async fn close(&mut self, reason: &str) {
        *self.closed_by_client.lock() = Some(reason.to_string());
    }
}
