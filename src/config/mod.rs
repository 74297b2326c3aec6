// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model.rs`: TOML-backed raw model and the validated `ConfigFile`.
//! - `loader.rs`: read a file from disk.
//! - `validate.rs`: `RawConfigFile` -> `ConfigFile`.
//! - `settings.rs`: `ConfigFile` -> builder / executor settings.

pub mod duration;
pub mod loader;
pub mod model;
pub mod settings;
pub mod validate;

pub use duration::parse_duration;
pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{ConfigFile, RawConfigFile, VolumeConfig};
