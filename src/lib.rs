pub mod api;
pub mod core;
pub mod frame_extractor;
pub mod orchestrator;

use std::sync::Once;

pub use crate::core::{SfotConfig, SfotError};

static LOGGER: Once = Once::new();

/// Install the process logger once. `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str) {
    LOGGER.call_once(|| {
        let env = env_logger::Env::default().default_filter_or(level.to_string());
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .try_init();
    });
}
