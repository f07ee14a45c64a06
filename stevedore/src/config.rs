//! Top-level configuration parsing. The core consumes already-decoded
//! structs; this module is the YAML front door used by the binary.

use serde::Deserialize;

use crate::{receiver, sender};

/// Errors produced by [`Config`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading the config file.
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

/// Main configuration struct for this program.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The server endpoints to host.
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub receiver: Vec<receiver::Config>,
    /// The client endpoints to open.
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub sender: Vec<sender::Config>,
    /// Pid of a parent process to signal once serving begins.
    #[serde(default)]
    pub notify_pid: Option<i32>,
}

impl Config {
    pub fn from_str(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    pub fn from_path(path: &std::path::Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_str(&contents)
    }
}
