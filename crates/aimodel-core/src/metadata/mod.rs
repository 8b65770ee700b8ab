//! Crash-safe persistence for small files (sidecars, previews, settings).

mod atomic;

pub use atomic::{atomic_read_json, atomic_write_bytes, atomic_write_json};
