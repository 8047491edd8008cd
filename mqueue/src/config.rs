use std::env;
use std::path::PathBuf;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{MqError, Result};

pub const DEFAULT_DATA_DIR: &str = "/tmp/mqueue";
pub const DATA_DIR_ENV: &str = "MQUEUE_DIR";

pub const DEFAULT_MAX_MESSAGES: usize = 10;
pub const DEFAULT_MAX_MSG_SIZE: usize = 1024;
pub const LIMIT_MESSAGES: usize = 65536;
pub const LIMIT_MSG_SIZE: usize = 1_048_576;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory holding one link file per queue. Every process that wants
    /// to reach a queue by name must use the same directory.
    pub data_dir: String,
    /// Capacity used when a queue is created without attributes.
    pub max_messages: usize,
    /// Message size used when a queue is created without attributes.
    pub max_msg_size: usize,
    pub limit_messages: usize,
    pub limit_msg_size: usize,
    /// How long an opener waits for a concurrent creator to finish
    /// initialising the segment.
    pub init_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            data_dir: DEFAULT_DATA_DIR.to_string(),
            max_messages: DEFAULT_MAX_MESSAGES,
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            limit_messages: LIMIT_MESSAGES,
            limit_msg_size: LIMIT_MSG_SIZE,
            init_timeout_ms: 1000,
        }
    }
}

impl QueueConfig {
    pub fn with_data_dir<S: Into<String>>(data_dir: S) -> Self {
        QueueConfig { data_dir: data_dir.into(), ..Default::default() }
    }

    /// Defaults, with `data_dir` taken from `MQUEUE_DIR` when set.
    pub fn from_env() -> Self {
        match env::var(DATA_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => QueueConfig::with_data_dir(dir),
            _ => QueueConfig::default(),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.is_empty() {
            return Err(MqError::Logic("data_dir must not be empty".to_string()));
        }
        if self.max_messages == 0 || self.max_messages > self.limit_messages {
            return Err(MqError::InvalidAttributes(format!(
                "max_messages {} not in 1..={}",
                self.max_messages, self.limit_messages
            )));
        }
        if self.max_msg_size == 0 || self.max_msg_size > self.limit_msg_size {
            return Err(MqError::InvalidAttributes(format!(
                "max_msg_size {} not in 1..={}",
                self.max_msg_size, self.limit_msg_size
            )));
        }
        Ok(())
    }
}
