//! # commentary-settings
//!
//! Configuration for the commentary client, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`CommentarySettings::default()`]
//! 2. **User file**: `~/.commentary/settings.json` or `$COMMENTARY_SETTINGS`
//! 3. **Environment variables**: `COMMENTARY_*` overrides
//!
//! Settings are loaded once by the binary and handed to the connection; there
//! is no global instance.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
