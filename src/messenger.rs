use crate::api::MessengerApi;
use crate::api::events::PushEvent;
use crate::api::models::{Attachment, Conversation, ConversationRef, MediaUpload, Message, UserId};
use crate::directory::{ConversationDirectory, OpenOutcome};
use crate::error::{Error, Result};
use crate::push::{ChannelSignal, PushChannel};
use crate::storage::ConversationCache;
use crate::timeline::{MessageTimeline, TimelineEntry};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered(ConversationRef),
    /// First message; the placeholder was replaced by this conversation.
    Promoted(ConversationRef),
    /// Sent, but the server does not list the conversation yet.
    Unreconciled,
}

enum Outgoing {
    Text(String),
    Media {
        content: Option<String>,
        media: Vec<MediaUpload>,
    },
}

impl Outgoing {
    fn fingerprint(&self) -> String {
        match self {
            Outgoing::Text(text) => text.clone(),
            Outgoing::Media { content, media } => {
                let names: Vec<&str> = media.iter().map(|m| m.file_name.as_str()).collect();
                format!("{}\u{0}{}", content.as_deref().unwrap_or_default(), names.join("\u{0}"))
            }
        }
    }

    fn content(&self) -> Option<&str> {
        match self {
            Outgoing::Text(text) => Some(text),
            Outgoing::Media { content, .. } => content.as_deref(),
        }
    }

    fn preview_attachments(&self) -> Vec<Attachment> {
        match self {
            Outgoing::Text(_) => Vec::new(),
            Outgoing::Media { media, .. } => media
                .iter()
                .map(|m| Attachment {
                    url: String::new(),
                    content_type: m.content_type.clone(),
                    file_name: Some(m.file_name.clone()),
                })
                .collect(),
        }
    }
}

type SendKey = (ConversationRef, String);

/// Removes its key from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<SendKey>>,
    key: Option<SendKey>,
}

impl<'a> InFlight<'a> {
    fn begin(set: &'a Mutex<HashSet<SendKey>>, key: SendKey) -> Result<Self> {
        if !set.lock().insert(key.clone()) {
            return Err(Error::DuplicateSend);
        }
        Ok(Self { set, key: Some(key) })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.set.lock().remove(&key);
        }
    }
}

pub struct Messenger {
    api: Arc<dyn MessengerApi>,
    me: UserId,
    directory: ConversationDirectory,
    timeline: MessageTimeline,
    draft: Mutex<String>,
    in_flight: Mutex<HashSet<SendKey>>,
    seen_connect: AtomicBool,
    cancel: CancellationToken,
}

impl Messenger {
    pub fn new(
        api: Arc<dyn MessengerApi>,
        me: UserId,
        cache: Option<ConversationCache>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            directory: ConversationDirectory::new(api.clone(), cache, cancel.child_token()),
            timeline: MessageTimeline::new(api.clone(), me, cancel.child_token()),
            api,
            me,
            draft: Mutex::new(String::new()),
            in_flight: Mutex::new(HashSet::new()),
            seen_connect: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn current_user(&self) -> UserId {
        self.me
    }

    pub fn directory(&self) -> &ConversationDirectory {
        &self.directory
    }

    pub fn timeline(&self) -> &MessageTimeline {
        &self.timeline
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.directory.entries()
    }

    pub fn selected(&self) -> Option<Conversation> {
        self.directory.selected()
    }

    pub fn messages(&self) -> Vec<TimelineEntry> {
        self.timeline.entries()
    }

    pub async fn start(&self) -> Result<()> {
        self.directory.restore_cached();
        self.directory.load_all().await
    }

    pub async fn open_with_counterpart(&self, counterpart: UserId) -> Result<OpenOutcome> {
        if counterpart <= 0 || counterpart == self.me {
            return Err(Error::NoRecipient);
        }
        if let Err(e) = self.directory.load_all().await {
            warn!("conversation list unavailable, opening anyway: {e}");
        }
        if self.cancel.is_cancelled() {
            return Err(Error::SessionClosed);
        }
        let outcome = self
            .directory
            .open_with_counterpart(counterpart)
            .ok_or(Error::SessionClosed)?;
        self.show(outcome.conversation()).await?;
        Ok(outcome)
    }

    pub async fn select(&self, id: ConversationRef) -> Result<()> {
        if !self.directory.select(id) {
            return Err(Error::NoConversationSelected);
        }
        if self.timeline.current() == Some(id) {
            return Ok(());
        }
        self.show(id).await
    }

    /// Loads `id` into the timeline. Loading marks it read on the server, so
    /// the list badge is cleared too.
    async fn show(&self, id: ConversationRef) -> Result<()> {
        self.timeline.load(id).await?;
        if !id.is_pending() && self.timeline.current() == Some(id) {
            self.directory.clear_unread(id);
        }
        Ok(())
    }

    pub fn close_conversation(&self) {
        self.directory.deselect();
        self.timeline.clear();
    }

    pub fn set_draft(&self, text: impl Into<String>) {
        *self.draft.lock() = text.into();
    }

    pub fn draft(&self) -> String {
        self.draft.lock().clone()
    }

    pub async fn send(&self) -> Result<SendOutcome> {
        let content = self.draft().trim().to_string();
        if content.is_empty() {
            return Err(Error::EmptyMessage);
        }
        self.deliver(Outgoing::Text(content)).await
    }

    /// Sends files, with the compose buffer as caption when it is not blank.
    pub async fn send_attachments(&self, media: Vec<MediaUpload>) -> Result<SendOutcome> {
        if media.is_empty() {
            return Err(Error::EmptyMessage);
        }
        let caption = self.draft().trim().to_string();
        let content = (!caption.is_empty()).then_some(caption);
        self.deliver(Outgoing::Media { content, media }).await
    }

    async fn deliver(&self, outgoing: Outgoing) -> Result<SendOutcome> {
        let target = self.directory.selected().ok_or(Error::NoConversationSelected)?;
        let receiver = target.counterpart.id;
        if receiver <= 0 {
            return Err(Error::NoRecipient);
        }
        let _guard = InFlight::begin(&self.in_flight, (target.id, outgoing.fingerprint()))?;

        let sent_text = outgoing.content().map(str::to_string);
        let local = self.timeline.insert_optimistic(
            target.id,
            sent_text.as_deref().unwrap_or_default(),
            outgoing.preview_attachments(),
        );

        let result = match outgoing {
            Outgoing::Text(text) => self.api.send_message(receiver, &text).await,
            Outgoing::Media { content, media } => {
                self.api.send_media(receiver, content.as_deref(), media).await
            }
        };
        if let Err(e) = result {
            if let Some(local) = local {
                self.timeline.discard(local);
            }
            error!("sending to {} failed: {e}", target.id);
            return Err(e);
        }
        if let Some(local) = local {
            self.timeline.acknowledge(local);
        }
        self.clear_draft_if(sent_text.as_deref().unwrap_or_default());

        if self.cancel.is_cancelled() {
            return Ok(SendOutcome::Unreconciled);
        }
        let outcome = match target.id {
            ConversationRef::Pending(counterpart) => self.promote(counterpart).await,
            durable @ ConversationRef::Durable(_) => {
                self.refresh_after_send(durable).await;
                SendOutcome::Delivered(durable)
            }
        };
        Ok(outcome)
    }

    fn clear_draft_if(&self, sent: &str) {
        let mut draft = self.draft.lock();
        if draft.trim() == sent.trim() {
            draft.clear();
        }
    }

    async fn promote(&self, counterpart: UserId) -> SendOutcome {
        let placeholder = ConversationRef::Pending(counterpart);
        match self.directory.promote(counterpart).await {
            Ok(Some(durable)) => {
                let showing_placeholder = self.timeline.current() == Some(placeholder);
                if showing_placeholder && self.directory.selected_ref() == Some(durable) {
                    self.load_quietly(durable).await;
                }
                SendOutcome::Promoted(durable)
            }
            Ok(None) => {
                if self.timeline.current() == Some(placeholder) {
                    self.timeline.clear();
                }
                SendOutcome::Unreconciled
            }
            Err(e) => {
                warn!("message sent but refreshing conversations failed: {e}");
                SendOutcome::Unreconciled
            }
        }
    }

    async fn refresh_after_send(&self, id: ConversationRef) {
        if self.timeline.current() == Some(id) {
            self.load_quietly(id).await;
        }
        if let Err(e) = self.directory.refresh().await {
            warn!("message sent but refreshing conversations failed: {e}");
        }
        self.follow_selection().await;
    }

    async fn load_quietly(&self, id: ConversationRef) {
        if let Err(e) = self.show(id).await {
            warn!("could not load messages for {id}: {e}");
        }
    }

    // A refresh may have swapped or dropped the selection.
    async fn follow_selection(&self) {
        let selected = self.directory.selected_ref();
        if selected == self.timeline.current() {
            return;
        }
        match selected {
            Some(id) => self.load_quietly(id).await,
            None => self.timeline.clear(),
        }
    }

    pub async fn handle_signal(&self, signal: ChannelSignal) {
        if self.cancel.is_cancelled() {
            return;
        }
        match signal {
            ChannelSignal::Event(PushEvent::NewMessage(message)) => self.handle_incoming(message).await,
            ChannelSignal::Connected => {
                if self.seen_connect.swap(true, Ordering::AcqRel) {
                    self.resync().await;
                }
            }
            ChannelSignal::Disconnected | ChannelSignal::Event(PushEvent::UnreadCount(_)) => {}
        }
    }

    async fn handle_incoming(&self, message: Message) {
        let chat = ConversationRef::Durable(message.chat_id);
        let viewing = self.timeline.current() == Some(chat);
        if viewing && self.timeline.apply_incoming(message.clone()) {
            debug!("new message {} in open {chat}", message.id);
            if message.is_unread_from_others(self.me) {
                self.timeline.spawn_mark_read(message.chat_id);
            }
        }
        if !self.directory.note_incoming(&message, self.me, viewing) {
            info!("message for unknown {chat}; refreshing conversations");
            if let Err(e) = self.directory.refresh().await {
                warn!("could not refresh conversations: {e}");
                return;
            }
            self.follow_selection().await;
        }
    }

    async fn resync(&self) {
        info!("push channel reconnected; resyncing conversations");
        if let Err(e) = self.directory.refresh().await {
            warn!("resync failed: {e}");
            return;
        }
        match self.directory.selected_ref() {
            Some(id @ ConversationRef::Durable(_)) if self.timeline.current() == Some(id) => {
                self.load_quietly(id).await;
            }
            _ => self.follow_selection().await,
        }
    }

    pub fn listen(self: &Arc<Self>, channel: &PushChannel) {
        let mut signals = channel.subscribe();
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    biased;
                    _ = this.cancel.cancelled() => break,
                    signal = signals.recv() => signal,
                };
                match signal {
                    Ok(signal) => this.handle_signal(signal).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("messenger missed {skipped} push signals; resyncing");
                        this.resync().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("messenger stopped listening");
        });
    }

    pub fn teardown(&self) {
        self.cancel.cancel();
        self.timeline.shutdown();
        self.directory.clear();
        self.draft.lock().clear();
        self.in_flight.lock().clear();
    }
}
