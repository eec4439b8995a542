//! Fuzz target for configuration parsing.
//!
//! Arbitrary JSON must either fail to parse or yield a config whose
//! duration helpers and validation never panic.

#![no_main]

use index_sync::IndexSyncConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(config) = serde_json::from_slice::<IndexSyncConfig>(data) {
        let _ = config.connect_timeout_duration();
        let _ = config.retry_delay_duration();
        let _ = config.state_throttle_duration();
        let _ = config.validate();
    }
});
