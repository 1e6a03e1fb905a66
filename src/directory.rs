use crate::api::MessengerApi;
use crate::api::models::{Conversation, ConversationRef, Message, UserId};
use crate::error::Result;
use crate::storage::ConversationCache;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

// At most one entry per durable id and one placeholder per counterpart; never a
// placeholder for a counterpart that already has a durable conversation.
#[derive(Clone)]
pub struct ConversationDirectory {
    inner: Arc<Inner>,
}

struct Inner {
    api: Arc<dyn MessengerApi>,
    cache: Option<ConversationCache>,
    state: Mutex<DirectoryState>,
    fetch_gate: tokio::sync::Mutex<()>,
    loaded: AtomicBool,
    cancel: CancellationToken,
}

#[derive(Default)]
struct DirectoryState {
    entries: Vec<Conversation>,
    selected: Option<ConversationRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Existing(ConversationRef),
    ExistingPlaceholder(ConversationRef),
    Created(ConversationRef),
}

impl OpenOutcome {
    pub fn conversation(&self) -> ConversationRef {
        match *self {
            OpenOutcome::Existing(r) | OpenOutcome::ExistingPlaceholder(r) | OpenOutcome::Created(r) => r,
        }
    }
}

impl ConversationDirectory {
    pub fn new(
        api: Arc<dyn MessengerApi>,
        cache: Option<ConversationCache>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                cache,
                state: Mutex::new(DirectoryState::default()),
                fetch_gate: tokio::sync::Mutex::new(()),
                loaded: AtomicBool::new(false),
                cancel,
            }),
        }
    }

    /// Does not count as loaded.
    pub fn restore_cached(&self) -> usize {
        let Some(cache) = &self.inner.cache else {
            return 0;
        };
        let cached = match cache.load(None) {
            Ok(list) => list,
            Err(e) => {
                warn!("could not read conversation cache: {e}");
                return 0;
            }
        };
        let mut state = self.inner.state.lock();
        if !state.entries.is_empty() || self.inner.cancel.is_cancelled() {
            return 0;
        }
        state.merge_durable(cached);
        debug!("restored {} conversations from cache", state.entries.len());
        state.entries.len()
    }

    /// Fetches the durable list once. Concurrent callers wait for the fetch
    /// already in flight instead of issuing their own.
    pub async fn load_all(&self) -> Result<()> {
        let _gate = self.inner.fetch_gate.lock().await;
        if self.is_loaded() {
            return Ok(());
        }
        self.inner.fetch_and_apply().await
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.inner.loaded.store(false, Ordering::Release);
    }

    pub async fn refresh(&self) -> Result<()> {
        let _gate = self.inner.fetch_gate.lock().await;
        self.inner.fetch_and_apply().await
    }

    /// Selects the conversation with `counterpart`, creating a placeholder
    /// when none exists. `None` once torn down.
    pub fn open_with_counterpart(&self, counterpart: UserId) -> Option<OpenOutcome> {
        let mut state = self.inner.state.lock();
        if self.inner.cancel.is_cancelled() {
            return None;
        }
        if let Some(existing) = state
            .entries
            .iter()
            .find(|c| !c.id.is_pending() && c.counterpart.id == counterpart)
        {
            let id = existing.id;
            state.selected = Some(id);
            return Some(OpenOutcome::Existing(id));
        }
        let placeholder_id = ConversationRef::Pending(counterpart);
        if state.entries.iter().any(|c| c.id == placeholder_id) {
            state.selected = Some(placeholder_id);
            return Some(OpenOutcome::ExistingPlaceholder(placeholder_id));
        }

        info!("creating placeholder conversation for user {counterpart}");
        state.entries.insert(0, Conversation::placeholder(counterpart));
        state.selected = Some(placeholder_id);
        drop(state);

        tokio::spawn(self.clone().hydrate(counterpart));
        Some(OpenOutcome::Created(placeholder_id))
    }

    async fn hydrate(self, counterpart: UserId) {
        let user = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => return,
            res = self.inner.api.user(counterpart) => res,
        };
        let user = match user {
            Ok(user) => user,
            Err(e) => {
                warn!("could not load profile of user {counterpart}: {e}");
                return;
            }
        };
        let mut state = self.inner.state.lock();
        if self.inner.cancel.is_cancelled() {
            return;
        }
        let placeholder_id = ConversationRef::Pending(counterpart);
        if let Some(entry) = state.entries.iter_mut().find(|c| c.id == placeholder_id) {
            entry.counterpart = user;
            entry.counterpart.id = counterpart;
        }
    }

    /// Called after the first send to `counterpart` succeeded. The durable
    /// conversation is selected only if the placeholder still was.
    pub async fn promote(&self, counterpart: UserId) -> Result<Option<ConversationRef>> {
        let _gate = self.inner.fetch_gate.lock().await;
        let fetched = self.inner.api.conversations().await?;
        if self.inner.cancel.is_cancelled() {
            return Ok(None);
        }
        self.inner.loaded.store(true, Ordering::Release);

        let placeholder_id = ConversationRef::Pending(counterpart);
        let mut state = self.inner.state.lock();
        let was_selected = state.selected == Some(placeholder_id);
        state.entries.retain(|c| c.id != placeholder_id);
        state.merge_durable(fetched);

        let durable = state
            .entries
            .iter()
            .find(|c| !c.id.is_pending() && c.counterpart.id == counterpart)
            .map(|c| c.id);
        match durable {
            Some(id) => {
                if was_selected || state.selected == Some(id) {
                    state.selected = Some(id);
                }
                info!("promoted placeholder for user {counterpart} to {id}");
            }
            None => {
                if was_selected {
                    state.selected = None;
                }
                warn!("no conversation with user {counterpart} after sending; server not consistent yet");
            }
        }
        let snapshot = state.durable_entries();
        drop(state);
        self.inner.write_cache(&snapshot);
        Ok(durable)
    }

    pub fn select(&self, id: ConversationRef) -> bool {
        let mut state = self.inner.state.lock();
        if state.entries.iter().any(|c| c.id == id) {
            state.selected = Some(id);
            true
        } else {
            false
        }
    }

    pub fn deselect(&self) {
        self.inner.state.lock().selected = None;
    }

    pub fn selected_ref(&self) -> Option<ConversationRef> {
        self.inner.state.lock().selected
    }

    pub fn selected(&self) -> Option<Conversation> {
        let state = self.inner.state.lock();
        let id = state.selected?;
        state.entries.iter().find(|c| c.id == id).cloned()
    }

    pub fn get(&self, id: ConversationRef) -> Option<Conversation> {
        self.inner.state.lock().entries.iter().find(|c| c.id == id).cloned()
    }

    pub fn entries(&self) -> Vec<Conversation> {
        self.inner.state.lock().entries.clone()
    }

    /// `false` if the conversation is unknown.
    pub fn note_incoming(&self, message: &Message, me: UserId, viewing: bool) -> bool {
        let mut state = self.inner.state.lock();
        if self.inner.cancel.is_cancelled() {
            return true;
        }
        let id = ConversationRef::Durable(message.chat_id);
        let Some(pos) = state.entries.iter().position(|c| c.id == id) else {
            return false;
        };
        let mut entry = state.entries.remove(pos);
        if message.sender_id != me && !viewing {
            entry.unread_count = entry.unread_count.saturating_add(1);
        }
        entry.last_message = Some(message.clone());
        state.entries.insert(0, entry);
        true
    }

    pub fn clear_unread(&self, id: ConversationRef) {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.entries.iter_mut().find(|c| c.id == id) {
            entry.unread_count = 0;
        }
    }

    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.entries.clear();
        state.selected = None;
        drop(state);
        self.invalidate();
    }

    pub fn forget_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            if let Err(e) = cache.clear() {
                warn!("could not clear conversation cache: {e}");
            }
        }
    }
}

impl Inner {
    async fn fetch_and_apply(&self) -> Result<()> {
        let fetched = self.api.conversations().await?;
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        self.apply_fetched(fetched);
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    fn apply_fetched(&self, fetched: Vec<Conversation>) {
        let mut state = self.state.lock();
        state.merge_durable(fetched);
        let snapshot = state.durable_entries();
        drop(state);
        self.write_cache(&snapshot);
    }

    fn write_cache(&self, durable: &[Conversation]) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(durable) {
                warn!("could not write conversation cache: {e}");
            }
        }
    }
}

impl DirectoryState {
    // Server order, first occurrence wins. Placeholders without a durable match
    // stay in front.
    fn merge_durable(&mut self, fetched: Vec<Conversation>) {
        let mut seen = HashSet::new();
        let durable: Vec<Conversation> = fetched
            .into_iter()
            .filter(|c| !c.id.is_pending() && seen.insert(c.id))
            .collect();

        let mut placeholders = Vec::new();
        for entry in self.entries.drain(..) {
            if !entry.id.is_pending() {
                continue;
            }
            match durable.iter().find(|d| d.counterpart.id == entry.counterpart.id) {
                Some(d) => {
                    if self.selected == Some(entry.id) {
                        self.selected = Some(d.id);
                    }
                    debug!("placeholder {} superseded by {}", entry.id, d.id);
                }
                None => placeholders.push(entry),
            }
        }

        if let Some(ConversationRef::Durable(_)) = self.selected {
            if !durable.iter().any(|d| Some(d.id) == self.selected) {
                warn!("selected conversation vanished from the server list");
                self.selected = None;
            }
        }

        self.entries = placeholders;
        self.entries.extend(durable);
    }

    fn durable_entries(&self) -> Vec<Conversation> {
        self.entries.iter().filter(|c| !c.id.is_pending()).cloned().collect()
    }
}
