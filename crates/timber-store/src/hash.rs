//! Content fingerprint for entry deduplication.

use std::hash::Hasher;

use fnv::FnvHasher;

/// Computes the 64-bit FNV-1a deduplication fingerprint of an entry.
///
/// The hash covers `(timestamp, namespace, pod, container, message)`:
/// the timestamp as a little-endian 64-bit integer, then the string
/// fields separated by single NUL bytes. The trailing field carries no
/// separator (the field count is fixed). Interior separators keep e.g.
/// `ns="ab", pod="c"` and `ns="a", pod="bc"` distinct.
///
/// The result is cast to `i64` for SQLite INTEGER compatibility.
#[must_use]
pub fn dedup_hash(
    timestamp_nanos: i64,
    namespace: &str,
    pod: &str,
    container: &str,
    message: &str,
) -> i64 {
    let mut h = FnvHasher::default();
    h.write(&timestamp_nanos.to_le_bytes());
    h.write(namespace.as_bytes());
    h.write(&[0]);
    h.write(pod.as_bytes());
    h.write(&[0]);
    h.write(container.as_bytes());
    h.write(&[0]);
    h.write(message.as_bytes());
    h.finish() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let a = dedup_hash(1000, "default", "api-0", "app", "hello");
        let b = dedup_hash(1000, "default", "api-0", "app", "hello");
        assert_eq!(a, b);
    }

    #[test]
    fn field_boundaries_are_distinct() {
        // Shifting a byte across a field boundary must change the hash.
        let hashes = [
            dedup_hash(1000, "ab", "c", "d", "msg"),
            dedup_hash(1000, "a", "bc", "d", "msg"),
            dedup_hash(1000, "a", "b", "cd", "msg"),
            dedup_hash(1000, "a", "b", "c", "dmsg"),
        ];
        for i in 0..hashes.len() {
            for j in (i + 1)..hashes.len() {
                assert_ne!(hashes[i], hashes[j], "hashes {i} and {j} collide");
            }
        }
    }

    #[test]
    fn each_field_contributes() {
        let base = dedup_hash(1000, "ns", "pod", "c", "msg");
        assert_ne!(base, dedup_hash(1001, "ns", "pod", "c", "msg"));
        assert_ne!(base, dedup_hash(1000, "ns2", "pod", "c", "msg"));
        assert_ne!(base, dedup_hash(1000, "ns", "pod2", "c", "msg"));
        assert_ne!(base, dedup_hash(1000, "ns", "pod", "c2", "msg"));
        assert_ne!(base, dedup_hash(1000, "ns", "pod", "c", "msg2"));
    }

    #[test]
    fn negative_timestamps_hash() {
        // Pre-epoch timestamps are legal inputs.
        let a = dedup_hash(-1, "ns", "pod", "c", "msg");
        let b = dedup_hash(1, "ns", "pod", "c", "msg");
        assert_ne!(a, b);
    }

    #[test]
    fn empty_fields_hash() {
        let a = dedup_hash(0, "", "", "", "");
        let b = dedup_hash(0, "", "", "", "x");
        assert_ne!(a, b);
    }
}
