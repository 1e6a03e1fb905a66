//! One authenticated session: the push channel, the unread counter and the
//! messaging view, created together and torn down together.

use crate::api::models::UserId;
use crate::api::{ApiClient, MessengerApi};
use crate::app::AppState;
use crate::auth::Credentials;
use crate::error::{Error, Result};
use crate::messenger::Messenger;
use crate::push::backoff::ReconnectPolicy;
use crate::push::transport::{PushConnector, WsConnector};
use crate::push::{ConnectionHandle, PushChannel};
use crate::storage::ConversationCache;
use crate::unread::UnreadCounter;
use crate::utils;
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub user_id: UserId,
    pub push_endpoint: Url,
    pub policy: ReconnectPolicy,
}

pub struct Session {
    credentials: Credentials,
    channel: PushChannel,
    unread: UnreadCounter,
    messenger: Arc<Messenger>,
    cancel: CancellationToken,
}

impl Session {
    /// Wires the components, connects the push channel and loads the
    /// conversation list. A failed list load is logged; the session is still
    /// usable and the next `load_all` retries.
    pub async fn open(
        api: Arc<dyn MessengerApi>,
        connector: Arc<dyn PushConnector>,
        credentials: Credentials,
        settings: SessionSettings,
        cache: Option<ConversationCache>,
    ) -> Result<Self> {
        if !credentials.is_authenticated() {
            return Err(Error::NotAuthenticated);
        }
        let cancel = CancellationToken::new();
        let channel = PushChannel::new(
            settings.push_endpoint,
            connector,
            Arc::new(credentials.clone()),
            settings.policy,
        );
        let unread = UnreadCounter::start(
            &channel,
            api.clone(),
            Arc::new(credentials.clone()),
            cancel.child_token(),
        );
        let messenger = Arc::new(Messenger::new(
            api,
            settings.user_id,
            cache,
            cancel.child_token(),
        ));
        messenger.listen(&channel);
        channel.connect();

        if let Err(e) = messenger.start().await {
            warn!("could not load conversations: {e}");
        }
        info!("session open for user {}", settings.user_id);
        Ok(Self {
            credentials,
            channel,
            unread,
            messenger,
            cancel,
        })
    }

    pub async fn from_config(state: &AppState) -> Result<Self> {
        let user_id = state.user_id.ok_or(Error::NotAuthenticated)?;
        let credentials = Credentials::new(state.token.clone());
        let api = ApiClient::new(&state.base_url, credentials.clone())?;
        let push_endpoint = match &state.push_url {
            Some(url) => Url::parse(url)?,
            None => utils::push_endpoint(&state.base_url)?,
        };
        let cache = if state.cache_conversations {
            open_default_cache(user_id)
        } else {
            None
        };
        let settings = SessionSettings {
            user_id,
            push_endpoint,
            policy: state.reconnect,
        };
        Self::open(
            Arc::new(api),
            Arc::new(WsConnector),
            credentials,
            settings,
            cache,
        )
        .await
    }

    /// Installs a fresh token and restarts the push channel if it gave up.
    pub fn reauthenticate(&self, token: impl Into<String>) -> Option<ConnectionHandle> {
        self.credentials.set(token);
        self.channel.connect()
    }

    /// Ends the session: closes the channel, zeroes the unread count, drops
    /// view state, wipes the conversation cache and forgets the token.
    pub fn logout(&self) {
        self.shutdown();
        self.messenger.directory().forget_cache();
        self.credentials.clear();
        info!("logged out");
    }

    fn shutdown(&self) {
        self.channel.teardown();
        self.unread.shutdown();
        self.messenger.teardown();
        self.cancel.cancel();
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    pub fn unread(&self) -> &UnreadCounter {
        &self.unread
    }

    pub fn channel(&self) -> &PushChannel {
        &self.channel
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_open()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_default_cache(user_id: UserId) -> Option<ConversationCache> {
    let path = ConversationCache::default_location(user_id)?;
    match ConversationCache::open(path) {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!("conversation cache disabled: {e}");
            None
        }
    }
}
