//! Logging setup shared by the forgeloop binaries.
//!
//! Output is either human-readable or one JSON object per line. `RUST_LOG`
//! always wins over the configured level.

pub mod logging;

pub use logging::{init_logging, init_logging_json, LogOutput};
