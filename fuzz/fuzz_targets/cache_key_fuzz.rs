//! Fuzz test for cache key parsing
//!
//! Any string either fails to parse or splits into a model name and key part
//! that rebuild the same key.
//!
//! Run with: cargo +nightly fuzz run cache_key_fuzz -- -max_total_time=60

#![no_main]

use cachet_core::{CacheKey, PrimaryKey};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(key) = CacheKey::parse(raw) {
        assert_eq!(key.as_str(), raw);
        let rebuilt = CacheKey::build(
            key.model_name(),
            &PrimaryKey::String(key.key_part().to_string()),
        );
        assert_eq!(rebuilt, key);
    }
});
