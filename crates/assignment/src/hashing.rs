//! Stable hash bucketing.
//!
//! A user's bucket depends only on the experiment id and user id, so every
//! replica computes the same assignment without coordination.

use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const BUCKET_COUNT: u64 = 100;

/// SHA-256 of the key, first 8 bytes read big-endian, modulo 100.
fn bucket(key: &str) -> u8 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % BUCKET_COUNT) as u8
}

/// Bucket used to pick a variant.
pub fn traffic_bucket(experiment_id: &Uuid, user_id: &str) -> u8 {
    bucket(&format!("{experiment_id}:{user_id}"))
}

/// Bucket used for the audience percentage gate, independent of
/// [`traffic_bucket`].
pub fn audience_bucket(experiment_id: &Uuid, user_id: &str) -> u8 {
    bucket(&format!("audience:{experiment_id}:{user_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bucket_matches_digest_prefix() {
        let digest = Sha256::digest(b"exp:user");
        let expected = u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) % 100;
        assert_eq!(bucket("exp:user") as u64, expected);
    }

    #[test]
    fn test_buckets_cover_full_range() {
        let experiment_id = Uuid::new_v4();
        let mut seen = [false; 100];
        for i in 0..10_000 {
            seen[traffic_bucket(&experiment_id, &format!("user-{i}")) as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_audience_bucket_is_independent() {
        let experiment_id = Uuid::new_v4();
        let differing = (0..1_000)
            .map(|i| format!("user-{i}"))
            .filter(|u| traffic_bucket(&experiment_id, u) != audience_bucket(&experiment_id, u))
            .count();
        assert!(differing > 900);
    }

    proptest! {
        #[test]
        fn prop_bucket_is_deterministic(user in "[a-zA-Z0-9_-]{1,40}", raw in any::<u128>()) {
            let experiment_id = Uuid::from_u128(raw);
            let first = traffic_bucket(&experiment_id, &user);
            prop_assert_eq!(first, traffic_bucket(&experiment_id, &user));
            prop_assert!((first as u64) < BUCKET_COUNT);
        }
    }
}
