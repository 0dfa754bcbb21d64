//! Shared proptest strategies for property-based testing.
//!
//! This module provides reusable strategies for generating:
//! - Accumulator windows `(front, rear, elems_num)`
//! - Challenge seeds and proof hashes
//! - Service proof σ values

use proptest::prelude::*;

/// Elements per accumulator group, kept small so windows span several groups.
pub fn elems_num_strategy() -> impl Strategy<Value = i64> {
    1i64..=64
}

/// A committed window with `0 <= front <= rear`, plus its group size.
pub fn window_strategy() -> impl Strategy<Value = (i64, i64, i64)> {
    (elems_num_strategy(), 0i64..2_000, 0i64..2_000).prop_map(|(elems, a, b)| {
        let (front, rear) = if a <= b { (a, b) } else { (b, a) };
        (front, rear, elems)
    })
}

/// Space challenge seeds as the chain publishes them.
pub fn seeds_strategy() -> impl Strategy<Value = Vec<i64>> {
    prop::collection::vec(0i64..i64::MAX, common::SPACE_CHALLENGE_PARAM_LEN)
}

/// A 32-byte proof hash.
pub fn hash_strategy() -> impl Strategy<Value = [u8; 32]> {
    prop::array::uniform32(any::<u8>())
}

/// A σ value in decimal, as `gen_proof` renders it.
pub fn sigma_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(any::<u8>(), 1..48)
        .prop_map(|bytes| num_bigint::BigUint::from_bytes_be(&bytes).to_str_radix(10))
}
