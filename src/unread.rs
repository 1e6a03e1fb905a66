use crate::api::MessengerApi;
use crate::api::events::PushEvent;
use crate::auth::CredentialSource;
use crate::push::{ChannelSignal, PushChannel};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Total unread messages for the signed-in user.
///
/// The push channel is authoritative while it is open. While it is not, a
/// single REST fetch provides a value; its result is discarded if the channel
/// connects before it lands.
#[derive(Clone)]
pub struct UnreadCounter {
    inner: Arc<Inner>,
}

struct Inner {
    value: watch::Sender<u64>,
    sync: Mutex<SyncState>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct SyncState {
    /// Bumped on every `connected` signal and push value.
    epoch: u64,
    connected: bool,
}

impl UnreadCounter {
    pub fn start(
        channel: &PushChannel,
        api: Arc<dyn MessengerApi>,
        credentials: Arc<dyn CredentialSource>,
        cancel: CancellationToken,
    ) -> Self {
        // Subscribe before looking at the state so a `connected` in between is not lost.
        let signals = channel.subscribe();
        let (value, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            value,
            sync: Mutex::new(SyncState {
                epoch: 0,
                connected: channel.is_open(),
            }),
            cancel,
        });

        if !channel.is_open() {
            inner.clone().spawn_fallback(api.clone(), credentials.clone());
        }
        tokio::spawn(listen(inner.clone(), signals, api, credentials));
        Self { inner }
    }

    pub fn current(&self) -> u64 {
        *self.inner.value.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<u64> {
        self.inner.value.subscribe()
    }

    /// Logout: stop listening and drop back to zero.
    pub fn shutdown(&self) {
        let _sync = self.inner.sync.lock();
        self.inner.cancel.cancel();
        self.inner.value.send_replace(0);
    }
}

impl Inner {
    fn apply_push(&self, count: u64) {
        let mut sync = self.sync.lock();
        if self.cancel.is_cancelled() {
            return;
        }
        sync.epoch += 1;
        self.value.send_replace(count);
    }

    fn spawn_fallback(self: Arc<Self>, api: Arc<dyn MessengerApi>, credentials: Arc<dyn CredentialSource>) {
        if credentials.bearer_token().is_none() {
            return;
        }
        let started_at = self.sync.lock().epoch;
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                res = api.unread_count() => res,
            };
            match result {
                Ok(count) => {
                    let sync = self.sync.lock();
                    if self.cancel.is_cancelled() || sync.connected || sync.epoch != started_at {
                        debug!("discarding unread fallback; push channel took over");
                        return;
                    }
                    self.value.send_replace(count);
                    debug!("unread count from fallback: {count}");
                }
                Err(e) => warn!("unread count fallback failed: {e}"),
            }
        });
    }
}

async fn listen(
    inner: Arc<Inner>,
    mut signals: broadcast::Receiver<ChannelSignal>,
    api: Arc<dyn MessengerApi>,
    credentials: Arc<dyn CredentialSource>,
) {
    loop {
        let signal = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            signal = signals.recv() => signal,
        };
        match signal {
            Ok(ChannelSignal::Event(PushEvent::UnreadCount(count))) => {
                info!("unread count updated via push: {count}");
                inner.apply_push(count);
            }
            Ok(ChannelSignal::Connected) => {
                let mut sync = inner.sync.lock();
                sync.connected = true;
                sync.epoch += 1;
            }
            Ok(ChannelSignal::Disconnected) => {
                // Failed retries also report `Disconnected`; poll once per outage.
                let was_connected = std::mem::replace(&mut inner.sync.lock().connected, false);
                if was_connected && !inner.cancel.is_cancelled() {
                    inner.clone().spawn_fallback(api.clone(), credentials.clone());
                }
            }
            Ok(ChannelSignal::Event(_)) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("unread counter lagged behind push channel by {skipped} signals");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("unread counter stopped");
}
