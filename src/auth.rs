use parking_lot::RwLock;
use std::sync::Arc;

/// Anything that can hand out the current bearer token.
///
/// Returning `None` means the session is no longer authenticated; the push
/// channel will neither connect nor schedule reconnects in that state.
pub trait CredentialSource: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Shared, mutable bearer token for one session.
///
/// Cloning shares the same slot, so the HTTP client and the push channel see
/// a logout or re-authentication at the same time.
#[derive(Clone, Default)]
pub struct Credentials {
    token: Arc<RwLock<Option<String>>>,
}

impl Credentials {
    pub fn new(token: Option<String>) -> Self {
        let token = token.filter(|t| !t.trim().is_empty());
        Self {
            token: Arc::new(RwLock::new(token)),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        let token = token.into();
        *self.token.write() = if token.trim().is_empty() { None } else { Some(token) };
    }

    pub fn clear(&self) {
        *self.token.write() = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.read().is_some()
    }
}

impl CredentialSource for Credentials {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().clone()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}
