//! # trench-settings
//!
//! Configuration for the Trench chat daemon, loaded from three layers
//! (in priority order):
//! 1. **Compiled defaults** — [`TrenchSettings::default()`]
//! 2. **Settings file** — `~/.trench/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables** — `TRENCH_*` overrides (highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
