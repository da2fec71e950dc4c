//! Sync id generation.

use std::sync::atomic::{AtomicU32, Ordering};

/// Shift of the user bits within a sync id.
pub const USER_SHIFT: u32 = 32;

/// Mask selecting the user bits of a sync id.
pub const USER_MASK: u64 = 0xFFFF_FFFF_0000_0000;

/// Hands out sync ids: the owning user in the high 32 bits, a counter in the
/// low 32 bits.
#[derive(Debug, Default)]
pub struct SyncIdGenerator {
    counter: AtomicU32,
}

impl SyncIdGenerator {
    /// Creates a generator starting at counter 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh sync id owned by `user`.
    pub fn generate(&self, user: i32) -> u64 {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        Self::user_bits(user) | u64::from(seq)
    }

    /// Returns true if `sync_id` was generated for `user`.
    pub fn belongs_to(sync_id: u64, user: i32) -> bool {
        sync_id & USER_MASK == Self::user_bits(user)
    }

    /// Returns the user encoded in `sync_id`.
    pub fn user_of(sync_id: u64) -> i32 {
        (sync_id >> USER_SHIFT) as u32 as i32
    }

    fn user_bits(user: i32) -> u64 {
        u64::from(user as u32) << USER_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn layout() {
        let ids = SyncIdGenerator::new();
        assert_eq!(ids.generate(5), 0x0000_0005_0000_0001);
        assert_eq!(ids.generate(5), 0x0000_0005_0000_0002);
        assert_eq!(ids.generate(-1), 0xFFFF_FFFF_0000_0003);
        assert_eq!(SyncIdGenerator::user_of(0xFFFF_FFFF_0000_0003), -1);
        assert!(!SyncIdGenerator::belongs_to(0x0000_0005_0000_0001, 6));
    }

    proptest! {
        #[test]
        fn ids_decode_to_their_user(user in any::<i32>(), calls in 1usize..20) {
            let ids = SyncIdGenerator::new();
            let mut last = None;
            for _ in 0..calls {
                let id = ids.generate(user);
                prop_assert!(SyncIdGenerator::belongs_to(id, user));
                prop_assert_eq!(SyncIdGenerator::user_of(id), user);
                if let Some(prev) = last {
                    prop_assert!(id > prev);
                }
                last = Some(id);
            }
        }

        #[test]
        fn other_users_never_match(a in any::<i32>(), b in any::<i32>()) {
            prop_assume!(a != b);
            let id = SyncIdGenerator::new().generate(a);
            prop_assert!(!SyncIdGenerator::belongs_to(id, b));
        }
    }
}
