use crate::error::{DivertError, Result};
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Handle priority bounds. Higher values see packets first.
pub const PRIORITY_HIGHEST: i16 = 3000;
pub const PRIORITY_LOWEST: i16 = -PRIORITY_HIGHEST;

pub const QUEUE_LENGTH_DEFAULT: u32 = 4096;
pub const QUEUE_LENGTH_MIN: u32 = 32;
pub const QUEUE_LENGTH_MAX: u32 = 16384;

/// Queue time bounds in milliseconds.
pub const QUEUE_TIME_DEFAULT: u64 = 2000;
pub const QUEUE_TIME_MIN: u64 = 100;
pub const QUEUE_TIME_MAX: u64 = 16000;

/// Queue size bounds in bytes.
pub const QUEUE_SIZE_DEFAULT: u32 = 4 * 1024 * 1024;
pub const QUEUE_SIZE_MIN: u32 = 64 * 1024;
pub const QUEUE_SIZE_MAX: u32 = 32 * 1024 * 1024;

/// Maximum number of packets moved by a single receive or send.
pub const MAX_BATCH_SIZE: usize = 0xFF;

/// Tunable and read-only handle parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Param {
    QueueLength = 0,
    QueueTime = 1,
    QueueSize = 2,
    VersionMajor = 3,
    VersionMinor = 4,
}

impl Param {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::QueueLength,
            1 => Self::QueueTime,
            2 => Self::QueueSize,
            3 => Self::VersionMajor,
            4 => Self::VersionMinor,
            _ => return None,
        })
    }
}

/// Driver version as reported by an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn check_range<T>(name: &'static str, value: T, range: RangeInclusive<T>) -> Result<T>
where
    T: PartialOrd + fmt::Display,
{
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(DivertError::invalid_argument(
            name,
            format!(
                "{} is outside {}..={}",
                value,
                range.start(),
                range.end()
            ),
        ))
    }
}

pub fn validate_priority(priority: i16) -> Result<i16> {
    check_range("priority", priority, PRIORITY_LOWEST..=PRIORITY_HIGHEST)
}

pub fn validate_queue_length(length: u32) -> Result<u32> {
    check_range("queue_length", length, QUEUE_LENGTH_MIN..=QUEUE_LENGTH_MAX)
}

/// Validates a queue time and returns it in whole milliseconds.
pub fn validate_queue_time(time: Duration) -> Result<u64> {
    let millis = u64::try_from(time.as_millis()).unwrap_or(u64::MAX);
    check_range("queue_time", millis, QUEUE_TIME_MIN..=QUEUE_TIME_MAX)
}

pub fn validate_queue_size(size: u32) -> Result<u32> {
    check_range("queue_size", size, QUEUE_SIZE_MIN..=QUEUE_SIZE_MAX)
}
