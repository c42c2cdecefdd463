//! The deterministic hash behind sampling and variation choice.
//!
//! Every Flagger SDK, in every language, must produce bit-identical hashes
//! so that the same entity receives the same decision everywhere. The
//! derivation keys concatenate their parts byte-for-byte with no separator
//! and must never change.

use md5;

/// Map a string onto `[0, 1]`: the MD5 digest interpreted as a 128-bit
/// big-endian integer, divided by `2^128 - 1`.
pub fn unit_interval_hash(key: &str) -> f64 {
    let digest = md5::compute(key.as_bytes());
    let value = u128::from_be_bytes(digest.0);
    value as f64 / u128::MAX as f64
}

/// Hash deciding whether an entity falls into a flag's sampled
/// subpopulation.
pub fn sampling_hash(config_hash_key: &str, flag_hash_key: &str, id: &str, entity_type: &str) -> f64 {
    // never change this key
    unit_interval_hash(&format!("{config_hash_key}{flag_hash_key}{id}{entity_type}"))
}

/// Hash deciding which variation a sampled entity receives.
pub fn variation_hash(codename: &str, id: &str, entity_type: &str) -> f64 {
    // never change this key
    unit_interval_hash(&format!("{codename}{id}{entity_type}"))
}
