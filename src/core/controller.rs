use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// Composite identity of one in-flight model request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub session_id: String,
    pub message_id: String,
}

impl RequestKey {
    pub fn new(session_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
        }
    }
}

/// Registry of cancellation handles for in-flight requests, keyed by
/// (session id, message id). Multiple sessions may stream concurrently;
/// each entry can be cancelled individually or all at once.
#[derive(Default)]
pub struct ControllerPool {
    inner: Mutex<HashMap<RequestKey, CancellationToken>>,
}

impl ControllerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and hand back its cancellation token. A second
    /// registration under the same key replaces (and cancels) the first.
    pub fn register(&self, key: RequestKey) -> CancellationToken {
        let token = CancellationToken::new();
        let mut inner = self.inner.lock().expect("controller pool poisoned");
        if let Some(previous) = inner.insert(key, token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Cancel one request. Returns true if it was registered.
    pub fn stop(&self, key: &RequestKey) -> bool {
        let inner = self.inner.lock().expect("controller pool poisoned");
        match inner.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered request.
    pub fn stop_all(&self) {
        let inner = self.inner.lock().expect("controller pool poisoned");
        for token in inner.values() {
            token.cancel();
        }
    }

    /// Deregister a request; happens exactly once per lifecycle, on finish
    /// or error.
    pub fn remove(&self, key: &RequestKey) {
        let mut inner = self.inner.lock().expect("controller pool poisoned");
        inner.remove(key);
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        let inner = self.inner.lock().expect("controller pool poisoned");
        inner.contains_key(key)
    }

    pub fn has_pending(&self) -> bool {
        let inner = self.inner.lock().expect("controller pool poisoned");
        !inner.is_empty()
    }
}
