//! 32-bit key-element hashing.
//!
//! Every event's `hash_code` is derived from the string form of its key
//! element (see `spec.md` §3, invariant 4: the same string always yields the
//! same hash). The hash must be language-neutral so that a Rust writer and a
//! non-Rust reader agree on shard placement; CRC-32 (IEEE polynomial) is a
//! well-known, trivially reproducible choice across runtimes, unlike
//! `std::hash::Hash` whose output is explicitly unspecified and randomized
//! per-process.

/// Computes the 32-bit signed hash code for a key element's string form.
///
/// The underlying CRC-32 checksum is unsigned; it is reinterpreted as a
/// signed `i32` (two's complement) to match the wire/storage representation
/// used throughout the event log (`hash_code: i32`).
pub fn hash32(key_element: &str) -> i32 {
    crc32fast::hash(key_element.as_bytes()) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_string_yields_same_hash() {
        assert_eq!(hash32("alice"), hash32("alice"));
    }

    #[test]
    fn different_strings_usually_differ() {
        assert_ne!(hash32("alice"), hash32("bob"));
    }

    #[test]
    fn empty_string_is_stable() {
        assert_eq!(hash32(""), hash32(""));
    }
}
