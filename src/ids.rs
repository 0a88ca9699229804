//! Identifier generation.

use uuid::Uuid;

pub const INSTANCE_ID_PREFIX: &str = "wfi_";

/// Hex characters kept from the v4 uuid; the version nibble leaves 60 random bits.
const INSTANCE_ID_RANDOM_HEX: usize = 16;

/// Generate a globally unique workflow instance id, e.g. `wfi_3f2a9c0d1e4b5a67`.
pub fn generate_instance_id() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{}{}", INSTANCE_ID_PREFIX, &simple[..INSTANCE_ID_RANDOM_HEX])
}

/// Correlation id linking log lines of one engine operation.
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
