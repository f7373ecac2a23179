//! Logger initialisation. `RUST_LOG` overrides the default `info` level.

use env_logger::Builder;
use log::LevelFilter;
pub use log::{debug, info, warn};

/// Init the logger once, later calls are no-ops
pub fn init() {
    let _ = Builder::new()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .try_init();
}

/// Init a logger whose output is captured by the test harness
pub fn init_for_tests() {
    let _ = Builder::new()
        .filter_level(LevelFilter::Debug)
        .parse_default_env()
        .is_test(true)
        .try_init();
}
