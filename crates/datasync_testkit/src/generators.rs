//! Property-based test generators using proptest.
//!
//! Provides strategies for peers, users, masks and sync modes.

use datasync_runtime::SyncMode;
use proptest::prelude::*;

/// Strategy for generating peer device ids.
pub fn device_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("dev-[a-f0-9]{4,12}").expect("Invalid regex")
}

/// Strategy for generating a set of distinct device ids.
pub fn device_set_strategy(max: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(device_id_strategy(), 1..=max.max(1))
        .prop_map(|set| set.into_iter().collect())
}

/// Strategy for generating user ids in the range real accounts use.
pub fn user_strategy() -> impl Strategy<Value = i32> {
    prop_oneof![Just(0), Just(100), 100i32..10_000, any::<i32>()]
}

/// Strategy for generating store masks with at most `labels + 1` bits.
pub fn mask_strategy(labels: usize) -> impl Strategy<Value = u16> {
    let bits = (labels + 1).min(16) as u32;
    let upper = if bits >= 16 { u16::MAX } else { (1u16 << bits) - 1 };
    (0..=upper).prop_map(move |mask| mask & upper)
}

/// Strategy for generating a subset of `labels`.
pub fn label_subset_strategy(labels: Vec<String>) -> impl Strategy<Value = Vec<String>> {
    let len = labels.len();
    prop::sample::subsequence(labels, 0..=len)
}

/// Strategy for generating any sync mode.
pub fn sync_mode_strategy() -> impl Strategy<Value = SyncMode> {
    prop_oneof![
        Just(SyncMode::Push),
        Just(SyncMode::Pull),
        Just(SyncMode::PushPull),
        Just(SyncMode::CloudTimeFirst),
        Just(SyncMode::CloudNativeFirst),
        Just(SyncMode::CloudClientFirst),
    ]
}

/// Strategy for generating cloud sync modes only.
pub fn cloud_mode_strategy() -> impl Strategy<Value = SyncMode> {
    sync_mode_strategy().prop_filter("cloud mode", |mode| mode.is_cloud())
}
