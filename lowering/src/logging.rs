//! Logging configuration
//!
//! Passes report through the `log` facade; binaries and tests pick a backend
//! here. The graph builder additionally emits `tracing` events at trace level.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lowering::logging;
//!
//! // Warn level
//! logging::init();
//!
//! // From RUST_LOG
//! logging::init_from_env();
//!
//! logging::init_with_level(log::LevelFilter::Debug);
//! ```
//!
//! # Log Levels
//!
//! - `info!` - pipeline start and finish
//! - `debug!` - per-pass summaries, exit statuses of If/Loop nodes
//! - `trace!` - individual rewrites and graph dumps between passes
//!
//! Filter by module with `RUST_LOG`:
//!
//! ```bash
//! RUST_LOG=debug lower_demo
//! RUST_LOG=lowering::passes::exits=trace lower_demo
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging at Warn level. Subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level. Subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.module_path().unwrap_or("unknown"),
                    record.args()
                )
            })
            .init();
    });
}

/// Initialize logging from `RUST_LOG`, defaulting to Warn.
pub fn init_from_env() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    });
}

/// Initialize logging for tests. Safe to call from every test.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .parse_default_env()
        .is_test(true)
        .try_init();
}

/// Whether `init`, `init_with_level` or `init_from_env` has run
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        log::debug!("debug output from lowering tests");
    }
}
