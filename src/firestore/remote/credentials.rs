use std::sync::{Arc, Mutex};

use crate::firestore::local::kv_store::lock_unpoisoned;
use crate::firestore::model::User;

/// What a stream presents to the backend when it opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamCredentials {
    pub user: User,
    pub token: Option<String>,
}

impl StreamCredentials {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self { user, token }
    }
}

/// Source of the credentials attached to each stream.
pub trait CredentialsProvider: Send + Sync + 'static {
    fn current(&self) -> StreamCredentials;

    /// Drops any cached token so the next stream refreshes it.
    fn invalidate_token(&self);
}

#[derive(Debug, Default)]
struct CredentialsState {
    user: Option<User>,
    token: Option<String>,
    invalidations: u32,
}

/// Provider holding a user and token supplied by the embedder.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentialsProvider {
    state: Arc<Mutex<CredentialsState>>,
}

impl StaticCredentialsProvider {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CredentialsState {
                user: Some(user),
                token,
                invalidations: 0,
            })),
        }
    }

    pub fn set(&self, user: User, token: Option<String>) {
        let mut state = lock_unpoisoned(&self.state);
        state.user = Some(user);
        state.token = token;
    }

    /// Number of times a stream asked for a fresh token.
    pub fn invalidation_count(&self) -> u32 {
        lock_unpoisoned(&self.state).invalidations
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn current(&self) -> StreamCredentials {
        let state = lock_unpoisoned(&self.state);
        StreamCredentials::new(
            state.user.clone().unwrap_or_else(User::unauthenticated),
            state.token.clone(),
        )
    }

    fn invalidate_token(&self) {
        lock_unpoisoned(&self.state).invalidations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_provider_is_unauthenticated() {
        let provider = StaticCredentialsProvider::default();
        assert_eq!(provider.current().user, User::unauthenticated());
        assert!(provider.current().token.is_none());
    }

    #[test]
    fn tracks_user_switches_and_invalidations() {
        let provider = StaticCredentialsProvider::new(User::authenticated("alice"), Some("t1".into()));
        provider.invalidate_token();
        provider.set(User::authenticated("bob"), Some("t2".into()));
        let current = provider.current();
        assert_eq!(current.user, User::authenticated("bob"));
        assert_eq!(current.token.as_deref(), Some("t2"));
        assert_eq!(provider.invalidation_count(), 1);
    }
}
