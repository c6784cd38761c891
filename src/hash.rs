//! Deterministic hashing for the advisory-lock key.
//!
//! The lock key must be identical across process restarts and across
//! different Rust versions/platforms, so it cannot use `std`'s
//! `RandomState`-seeded `Hash` impls. FNV-1a is simple, dependency-free, and
//! stable.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Computes the advisory-lock key for a `schema.table` pair.
///
/// Masked to 31 bits so every instance targeting the same table — whatever
/// language or library it's written in — arrives at the same key from the
/// same schema/table names; this is a cross-instance wire contract, not an
/// implementation detail, so the mask width must not change independently
/// of the two sides agreeing on it.
pub fn lock_key(schema: &str, table: &str) -> i64 {
    let mut buf = String::with_capacity(schema.len() + table.len() + 1);
    buf.push_str(schema);
    buf.push('.');
    buf.push_str(table);
    (fnv1a_64(buf.as_bytes()) & 0x7FFF_FFFF) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_is_deterministic() {
        assert_eq!(
            lock_key("public", "glacial_cache"),
            lock_key("public", "glacial_cache")
        );
    }

    #[test]
    fn lock_key_differs_for_different_tables() {
        assert_ne!(
            lock_key("public", "glacial_cache"),
            lock_key("public", "other_cache")
        );
    }

    #[test]
    fn lock_key_is_non_negative() {
        for table in ["a", "glacial_cache", "z_z_z_z", "123_table"] {
            assert!(lock_key("public", table) >= 0);
        }
    }
}
