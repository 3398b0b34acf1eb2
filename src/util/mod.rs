pub mod assert;
pub mod backoff;
pub mod sha1;
pub mod subscribe;

pub use assert::{fail, hard_assert, internal_assertion_message};
pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use self::sha1::{sha1_digest, sha1_u64_pair};
pub use subscribe::PartialObserver;
