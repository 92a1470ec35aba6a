use crate::error::Result;
use crate::network::types::param::{validate_queue_length, validate_queue_size, validate_queue_time};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Driver queue tuning applied right after a handle opens.
///
/// Unset fields keep the driver's defaults.
#[derive(Args, Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Maximum number of packets the driver queues (32-16384)
    #[arg(long = "queue-length", id = "queue-length")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,

    /// Maximum time a packet stays queued, in milliseconds (100-16000)
    #[arg(long = "queue-time", id = "queue-time", value_name = "MS")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ms: Option<u64>,

    /// Maximum number of bytes the driver queues (65536-33554432)
    #[arg(long = "queue-size", id = "queue-size", value_name = "BYTES")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

impl QueueOptions {
    pub fn is_empty(&self) -> bool {
        self.length.is_none() && self.time_ms.is_none() && self.size.is_none()
    }

    pub fn time(&self) -> Option<Duration> {
        self.time_ms.map(Duration::from_millis)
    }

    /// Checks every set field against the driver's limits.
    pub fn validate(&self) -> Result<()> {
        if let Some(length) = self.length {
            validate_queue_length(length)?;
        }
        if let Some(time) = self.time() {
            validate_queue_time(time)?;
        }
        if let Some(size) = self.size {
            validate_queue_size(size)?;
        }
        Ok(())
    }
}
