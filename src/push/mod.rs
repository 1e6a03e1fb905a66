pub mod backoff;
pub mod transport;

use crate::api::events::PushEvent;
use crate::auth::CredentialSource;
use backoff::{Backoff, ReconnectPolicy};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use transport::{CloseKind, Inbound, PushConnector, PushSocket};
use url::Url;

const SIGNAL_CAPACITY: usize = 256;
const CLOSE_REASON: &str = "client closing";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Open,
    WaitingToRetry { attempt: u32, delay: Duration },
    /// Terminal.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Connected,
    Disconnected,
    Event(PushEvent),
}

/// Cancelling closes the socket normally and stops pending reconnects.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Clone)]
pub struct PushChannel {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: Url,
    connector: Arc<dyn PushConnector>,
    credentials: Arc<dyn CredentialSource>,
    policy: ReconnectPolicy,
    state: watch::Sender<ChannelState>,
    signals: broadcast::Sender<ChannelSignal>,
    lifecycle: Mutex<Lifecycle>,
    next_id: AtomicU64,
}

#[derive(Default)]
struct Lifecycle {
    active: Option<ConnectionHandle>,
    closed: bool,
}

enum SessionEnd {
    Cancelled,
    Closed(CloseKind),
}

impl PushChannel {
    pub fn new(
        endpoint: Url,
        connector: Arc<dyn PushConnector>,
        credentials: Arc<dyn CredentialSource>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                endpoint,
                connector,
                credentials,
                policy,
                state,
                signals,
                lifecycle: Mutex::new(Lifecycle::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// `None` when a driver is already active, no credential is available,
    /// or after teardown.
    pub fn connect(&self) -> Option<ConnectionHandle> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.closed {
            debug!("push channel torn down; ignoring connect");
            return None;
        }
        if lifecycle.active.is_some() {
            debug!("push channel already active; ignoring connect");
            return None;
        }
        if self.inner.credentials.bearer_token().is_none() {
            warn!("no credential available; push channel stays disconnected");
            self.inner.state.send_replace(ChannelState::Disconnected);
            return None;
        }

        let handle = ConnectionHandle {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
        };
        lifecycle.active = Some(handle.clone());
        self.inner.state.send_replace(ChannelState::Connecting);
        drop(lifecycle);

        tokio::spawn(drive(self.inner.clone(), handle.clone()));
        Some(handle)
    }

    pub fn teardown(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.closed {
            return;
        }
        lifecycle.closed = true;
        if let Some(active) = lifecycle.active.take() {
            active.cancel();
        }
        self.inner.state.send_replace(ChannelState::Closed);
        info!("push channel torn down");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelSignal> {
        self.inner.signals.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }
}

impl Inner {
    // Shares the lifecycle lock with `teardown`: nothing is published after it returns.
    fn set_state(&self, handle: &ConnectionHandle, state: ChannelState) {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.closed || !is_current(&lifecycle, handle) {
            return;
        }
        self.state.send_replace(state);
    }

    fn emit(&self, handle: &ConnectionHandle, signal: ChannelSignal) {
        let lifecycle = self.lifecycle.lock();
        if lifecycle.closed || !is_current(&lifecycle, handle) {
            return;
        }
        // No receivers is fine.
        let _ = self.signals.send(signal);
    }

    fn finish(&self, handle: &ConnectionHandle) {
        let mut lifecycle = self.lifecycle.lock();
        if !is_current(&lifecycle, handle) {
            return;
        }
        lifecycle.active = None;
        if !lifecycle.closed {
            self.state.send_replace(ChannelState::Disconnected);
        }
    }

    fn url_with_token(&self, token: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("token", token);
        url
    }

    async fn pump(&self, handle: &ConnectionHandle, socket: &mut dyn PushSocket) -> SessionEnd {
        loop {
            let frame = tokio::select! {
                biased;
                _ = handle.cancel.cancelled() => return SessionEnd::Cancelled,
                frame = socket.next_frame() => frame,
            };
            match frame {
                Ok(Inbound::Text(text)) => match PushEvent::parse(&text) {
                    Ok(Some(event)) => {
                        debug!("push event: {}", event.kind());
                        self.emit(handle, ChannelSignal::Event(event));
                    }
                    Ok(None) => debug!("ignoring push frame of unknown type"),
                    Err(e) => warn!("dropping malformed push frame: {e}"),
                },
                Ok(Inbound::Closed(kind)) => return SessionEnd::Closed(kind),
                Err(e) => {
                    warn!("push channel read failed: {e}");
                    return SessionEnd::Closed(CloseKind::Abnormal(None));
                }
            }
        }
    }
}

fn is_current(lifecycle: &Lifecycle, handle: &ConnectionHandle) -> bool {
    lifecycle.active.as_ref().is_some_and(|a| a.id == handle.id)
}

async fn drive(inner: Arc<Inner>, handle: ConnectionHandle) {
    let mut backoff = Backoff::new(inner.policy);
    loop {
        let Some(token) = inner.credentials.bearer_token() else {
            info!("credential gone; push channel stops");
            break;
        };
        inner.set_state(&handle, ChannelState::Connecting);
        debug!("connecting push channel to {}", inner.endpoint);

        let url = inner.url_with_token(&token);
        let connected = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => break,
            res = inner.connector.connect(&url) => res,
        };

        match connected {
            Ok(mut socket) => {
                backoff.reset();
                inner.set_state(&handle, ChannelState::Open);
                inner.emit(&handle, ChannelSignal::Connected);
                info!("push channel open");

                match inner.pump(&handle, socket.as_mut()).await {
                    SessionEnd::Cancelled => {
                        socket.close(CLOSE_REASON).await;
                        inner.emit(&handle, ChannelSignal::Disconnected);
                        info!("push channel closed by client");
                        break;
                    }
                    SessionEnd::Closed(CloseKind::Normal) => {
                        inner.emit(&handle, ChannelSignal::Disconnected);
                        info!("push channel closed normally by server");
                        break;
                    }
                    SessionEnd::Closed(CloseKind::Abnormal(code)) => {
                        inner.emit(&handle, ChannelSignal::Disconnected);
                        warn!("push channel dropped (close code {code:?})");
                    }
                }
            }
            Err(e) => {
                inner.emit(&handle, ChannelSignal::Disconnected);
                warn!("push channel connect failed: {e}");
            }
        }

        if handle.is_cancelled() {
            break;
        }
        if inner.credentials.bearer_token().is_none() {
            info!("session ended; not reconnecting push channel");
            break;
        }
        let Some(delay) = backoff.next_delay() else {
            error!(
                "push channel: gave up after {} reconnect attempts",
                inner.policy.max_attempts
            );
            break;
        };
        let attempt = backoff.attempt();
        info!(
            "reconnecting push channel in {}ms (attempt {}/{})",
            delay.as_millis(),
            attempt,
            inner.policy.max_attempts
        );
        inner.set_state(&handle, ChannelState::WaitingToRetry { attempt, delay });
        tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    inner.finish(&handle);
}
