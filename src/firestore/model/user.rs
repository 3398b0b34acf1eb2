use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identity that owns a mutation queue. Unauthenticated writes share the anonymous queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct User {
    pub uid: Option<String>,
}

impl User {
    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn authenticated(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Key used to partition per-user tables.
    pub fn storage_key(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "User({uid})"),
            None => write!(f, "User(anonymous)"),
        }
    }
}
