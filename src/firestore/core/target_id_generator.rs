use crate::firestore::model::TargetId;

const RESERVED_BITS: TargetId = 2;

/// Hands out target ids from one of two disjoint sequences: even ids for
/// targets persisted in the target cache, odd ids for in-memory limbo targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// Even ids greater than `highest_target_id`. Id 0 is never issued.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        Self {
            last_id: highest_target_id,
        }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += RESERVED_BITS;
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_cache_ids_are_even_and_continue_after_seed() {
        let mut generator = TargetIdGenerator::for_target_cache(0);
        assert_eq!(generator.next(), 2);
        assert_eq!(generator.next(), 4);

        let mut resumed = TargetIdGenerator::for_target_cache(10);
        assert_eq!(resumed.next(), 12);
    }

    #[test]
    fn sync_engine_ids_are_odd() {
        let mut generator = TargetIdGenerator::for_sync_engine();
        assert_eq!(generator.next(), 1);
        assert_eq!(generator.next(), 3);
    }
}
