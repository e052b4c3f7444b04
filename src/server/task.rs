//! Registry of in-flight `display` requests, keyed by request id.
//!
//! Lets a `cancel` line reach the token of a request that is still queued or
//! running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Thread-safe map from request id to its cancellation token.
#[derive(Clone, Default)]
pub struct RequestRegistry {
    inner: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. Returns `None` if the id is already in use.
    pub fn register(&self, key: &str) -> Option<CancellationToken> {
        let mut entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(key) {
            return None;
        }
        let token = CancellationToken::new();
        entries.insert(key.to_string(), token.clone());
        Some(token)
    }

    /// Forget a request once its reply has been produced.
    pub fn finish(&self, key: &str) {
        let mut entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Fire the token of a registered request. Returns `false` if the id is
    /// unknown or already finished.
    pub fn cancel(&self, key: &str) -> bool {
        let entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything, e.g. when the input stream closes.
    pub fn cancel_all(&self) -> usize {
        let entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for token in entries.values() {
            token.cancel();
        }
        entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::RequestRegistry;

    #[test]
    fn register_and_finish() {
        let registry = RequestRegistry::new();
        let token = registry.register("1").expect("first registration");
        assert!(!token.is_cancelled());
        assert_eq!(registry.len(), 1);

        // Same id while in flight is refused.
        assert!(registry.register("1").is_none());

        registry.finish("1");
        assert!(registry.is_empty());
        assert!(registry.register("1").is_some());
    }

    #[test]
    fn cancel_fires_token() {
        let registry = RequestRegistry::new();
        let token = registry.register("\"hover-3\"").expect("registration");
        assert!(registry.cancel("\"hover-3\""));
        assert!(token.is_cancelled());

        registry.finish("\"hover-3\"");
        assert!(!registry.cancel("\"hover-3\""));
    }

    #[test]
    fn cancel_all_tokens() {
        let registry = RequestRegistry::new();
        let a = registry.register("a").expect("a");
        let b = registry.register("b").expect("b");
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.is_cancelled() && b.is_cancelled());
    }
}
