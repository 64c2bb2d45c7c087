// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Json(err)
    }
}

/// How partitions are driven.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One worker thread per partition.
    #[default]
    Threads,
    /// Work runs when the caller polls.
    Inline,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct NetbackConfig {
    /// Partition count; 0 picks one per two CPUs.
    pub groups: usize,
    pub mode: ExecutionMode,
    /// Backlog bound for a stopped receive queue.
    pub queue_length: usize,
    /// Shuffle transmit responses. Only useful for testing frontends.
    pub permute_returns: bool,
    /// Copy transmit pages the stack holds on to.
    pub copy_skb: bool,
}

impl Default for NetbackConfig {
    fn default() -> Self {
        NetbackConfig {
            groups: 0,
            mode: ExecutionMode::Threads,
            queue_length: 32,
            permute_returns: false,
            copy_skb: true,
        }
    }
}

impl NetbackConfig {
    /// Loads a JSON config; missing fields keep their defaults and an empty
    /// file is the default config.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut contents = String::new();
        File::open(path)?.read_to_string(&mut contents)?;
        if contents.trim().is_empty() {
            return Ok(NetbackConfig::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn partition_count(&self) -> usize {
        if self.groups > 0 {
            return self.groups;
        }
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        cpus.div_ceil(2).max(1)
    }
}
