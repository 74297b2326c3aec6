// src/errors.rs

//! Crate-wide error aliases and helpers.
//!
//! `GangwayError` covers setup and collaborator failures (config, metadata,
//! backend clients). The outcome of a worker run is modelled separately as
//! [`crate::engine::ExecutionResult`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GangwayError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid build metadata: {0}")]
    InvalidMetadata(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Cluster API error: {0}")]
    ClusterApi(String),

    #[error("Container runtime error: {0}")]
    RuntimeApi(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<kube::Error> for GangwayError {
    fn from(err: kube::Error) -> Self {
        GangwayError::ClusterApi(err.to_string())
    }
}

impl From<bollard::errors::Error> for GangwayError {
    fn from(err: bollard::errors::Error) -> Self {
        GangwayError::RuntimeApi(err.to_string())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, GangwayError>;
