//! Configuration for the voice-agent widget.
//!
//! Provides `WidgetConfig` (top-level settings), sub-configs for each
//! subsystem, `AppPaths` for cross-platform data directories, and TOML
//! persistence via `WidgetConfig::load` / `WidgetConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{AudioSettings, ReconnectSettings, SessionSettings, WidgetConfig};
