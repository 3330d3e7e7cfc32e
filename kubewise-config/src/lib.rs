//! Configuration loading for KubeWise.
//!
//! Values are layered, later layers winning: an optional `.env` file, a TOML
//! file, then process environment variables. The binary applies its own CLI
//! flags on top of the resulting [`Config`].

pub mod constants;
pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{Config, ConfigMetadata, HandlerKind, KubeSettings, SlackSettings};
pub use validation::{ConfigWarning, ConfigWarnings};
