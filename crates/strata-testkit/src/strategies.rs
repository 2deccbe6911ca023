//! Property test strategies for naming types
//!
//! Generated values stick to the JSON-representable subset (no floats, no
//! raw bytes) so they survive a trip through the naming service unchanged.

use proptest::prelude::*;
use std::collections::BTreeMap;
use strata_core::{Path, Value};

// Re-export proptest for convenience
pub use proptest;

/// One path segment
pub fn arb_segment() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_-]{0,7}"
}

/// Path with between `min` and `max` segments
pub fn arb_path(min: usize, max: usize) -> impl Strategy<Value = Path> {
    prop::collection::vec(arb_segment(), min..=max).prop_map(Path::from)
}

/// Leaf values
pub fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::null()),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[ -~]{0,16}".prop_map(Value::from),
    ]
}

/// Nested values up to three levels deep
pub fn arb_value() -> impl Strategy<Value = Value> {
    arb_scalar().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|map: BTreeMap<String, Value>| Value::from(map)),
        ]
    })
}
