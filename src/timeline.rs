use crate::api::MessengerApi;
use crate::api::models::{Attachment, ChatId, ConversationRef, Message, UserId};
use crate::error::Result;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Confirmed,
    /// Optimistic entry whose send is still in flight.
    Sending(u64),
    /// Optimistic entry the server acknowledged; replaced on the next load.
    Sent(u64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub message: Message,
    pub delivery: Delivery,
}

impl TimelineEntry {
    pub fn is_optimistic(&self) -> bool {
        self.delivery != Delivery::Confirmed
    }
}

/// Messages of the selected conversation, oldest first, in server order.
#[derive(Clone)]
pub struct MessageTimeline {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn MessengerApi>,
    me: UserId,
    state: Mutex<TimelineState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TimelineState {
    current: Option<ConversationRef>,
    entries: Vec<TimelineEntry>,
    /// Bumped on every load so a slow response cannot overwrite a newer one.
    generation: u64,
    next_local: u64,
}

impl MessageTimeline {
    pub fn new(api: Arc<dyn MessengerApi>, me: UserId, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                me,
                state: Mutex::new(TimelineState::default()),
                cancel,
            }),
        }
    }

    /// Loads `target`, replacing the timeline wholesale.
    ///
    /// Placeholders have nothing on the server and load as empty without a
    /// request. After a durable load, unread messages from others trigger a
    /// best-effort mark-read.
    pub async fn load(&self, target: ConversationRef) -> Result<()> {
        let generation = {
            let mut state = self.inner.state.lock();
            if self.inner.cancel.is_cancelled() {
                return Ok(());
            }
            if state.current != Some(target) {
                state.entries.clear();
            }
            state.current = Some(target);
            state.generation += 1;
            state.generation
        };
        let ConversationRef::Durable(chat_id) = target else {
            return Ok(());
        };

        let fetched = match self.inner.api.messages(chat_id).await {
            Ok(messages) => messages,
            Err(e) => {
                let mut state = self.inner.state.lock();
                if state.generation == generation {
                    state.entries.retain(TimelineEntry::is_optimistic);
                }
                return Err(e);
            }
        };

        let unread = {
            let mut state = self.inner.state.lock();
            if self.inner.cancel.is_cancelled() || state.generation != generation {
                debug!("discarding stale messages for chat {chat_id}");
                return Ok(());
            }
            let unread = fetched
                .iter()
                .filter(|m| m.is_unread_from_others(self.inner.me))
                .count();
            let in_flight: Vec<TimelineEntry> = state
                .entries
                .drain(..)
                .filter(|e| matches!(e.delivery, Delivery::Sending(_)))
                .collect();
            state.entries = fetched
                .into_iter()
                .map(|message| TimelineEntry {
                    message,
                    delivery: Delivery::Confirmed,
                })
                .collect();
            state.entries.extend(in_flight);
            unread
        };

        if unread > 0 {
            info!("marking {unread} messages as read in chat {chat_id}");
            self.spawn_mark_read(chat_id);
        }
        Ok(())
    }

    /// Fire-and-forget; failures are logged and never retried here.
    pub fn spawn_mark_read(&self, chat_id: ChatId) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => return,
                res = inner.api.mark_read(chat_id) => res,
            };
            if let Err(e) = result {
                warn!("failed to mark chat {chat_id} as read: {e}");
            }
        });
    }

    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.current = None;
        state.entries.clear();
        state.generation += 1;
    }

    pub fn current(&self) -> Option<ConversationRef> {
        self.inner.state.lock().current
    }

    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.inner.state.lock().entries.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Shows an outgoing message immediately. Returns its local id, or `None`
    /// if `target` is not the conversation on screen.
    pub fn insert_optimistic(
        &self,
        target: ConversationRef,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Option<u64> {
        let mut state = self.inner.state.lock();
        if state.current != Some(target) || self.inner.cancel.is_cancelled() {
            return None;
        }
        state.next_local += 1;
        let local = state.next_local;
        let message = Message {
            id: 0,
            chat_id: target.chat_id().unwrap_or(0),
            sender_id: self.inner.me,
            content: content.to_string(),
            attachments,
            created_at: None,
            is_read: true,
        };
        state.entries.push(TimelineEntry {
            message,
            delivery: Delivery::Sending(local),
        });
        Some(local)
    }

    pub fn acknowledge(&self, local: u64) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state
            .entries
            .iter_mut()
            .find(|e| e.delivery == Delivery::Sending(local))
        {
            entry.delivery = Delivery::Sent(local);
        }
    }

    pub fn discard(&self, local: u64) {
        self.inner
            .state
            .lock()
            .entries
            .retain(|e| e.delivery != Delivery::Sending(local));
    }

    /// Appends a pushed message if it belongs to the conversation on screen
    /// and is not already present. Returns whether it was appended.
    pub fn apply_incoming(&self, message: Message) -> bool {
        let mut state = self.inner.state.lock();
        if self.inner.cancel.is_cancelled()
            || state.current != Some(ConversationRef::Durable(message.chat_id))
        {
            return false;
        }
        if state
            .entries
            .iter()
            .any(|e| e.delivery == Delivery::Confirmed && e.message.id == message.id)
        {
            return false;
        }
        // Confirmed messages go before our own optimistic tail.
        let at = state
            .entries
            .iter()
            .position(TimelineEntry::is_optimistic)
            .unwrap_or(state.entries.len());
        state.entries.insert(
            at,
            TimelineEntry {
                message,
                delivery: Delivery::Confirmed,
            },
        );
        true
    }

    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.clear();
    }
}
