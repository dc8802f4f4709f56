#![no_main]

use fzsync::PairConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing and validation must reject bad input without panicking
        if let Ok(config) = PairConfig::from_toml_str(input) {
            if config.validate().is_ok() {
                assert!(config.avg_alpha > 0.0 && config.avg_alpha <= 1.0);
                assert!(config.exec_loops >= 20);
            }
        }
    }
});
