// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::spec::{BuildMeta, EnvVar};

/// Command-line arguments for `gangway`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "gangway",
    version,
    about = "Run one build worker as a cluster pod or a local podman container.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Gangway.toml` in the current working directory; built-in
    /// defaults apply when that file does not exist.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Name of the build configuration.
    #[arg(long, value_name = "NAME")]
    pub build_config: String,

    /// Sequence number of the build.
    #[arg(long, value_name = "N")]
    pub build_number: String,

    /// Worker index within the build.
    #[arg(long, value_name = "I", default_value_t = 0)]
    pub index: u32,

    /// Container image the worker runs.
    #[arg(long, value_name = "REF")]
    pub image: String,

    /// Extra environment for the worker; repeatable.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<EnvVar>,

    /// Service account the pod runs under.
    #[arg(long, value_name = "NAME")]
    pub service_account: Option<String>,

    /// Label attached to the pod or container; repeatable.
    #[arg(long = "label", value_name = "KEY=VALUE")]
    pub labels: Vec<EnvVar>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `GANGWAY_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Print the unit and the selected backend; create nothing.
    #[arg(long)]
    pub dry_run: bool,
}

impl CliArgs {
    pub fn build_meta(&self) -> BuildMeta {
        BuildMeta {
            build_config: self.build_config.clone(),
            build_number: self.build_number.clone(),
            image: self.image.clone(),
            service_account: self.service_account.clone(),
            labels: self
                .labels
                .iter()
                .map(|l| (l.name.clone(), l.value.clone()))
                .collect(),
        }
    }
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
