use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// Version of a document or of the whole remote view, as assigned by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn min() -> Self {
        Self(Timestamp::new(0, 0))
    }

    pub fn max() -> Self {
        Self(Timestamp::new(253_402_300_799, 999_999_999))
    }

    pub fn from_micros(micros: i64) -> Self {
        Self(Timestamp::new(
            micros.div_euclid(1_000_000),
            (micros.rem_euclid(1_000_000) * 1000) as i32,
        ))
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }

    pub fn successor(&self) -> Self {
        Self(self.0.successor())
    }
}

impl Default for SnapshotVersion {
    fn default() -> Self {
        Self::min()
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_sorts_before_everything() {
        let version = SnapshotVersion::from_micros(1);
        assert!(SnapshotVersion::min() < version);
        assert!(version < SnapshotVersion::max());
        assert!(SnapshotVersion::default().is_min());
    }
}
