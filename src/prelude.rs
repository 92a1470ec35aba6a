//! Prelude module for convenient imports.
//!
//! ```rust,ignore
//! use divert::prelude::*;
//! ```

// Error handling
pub use crate::error::{CancelReason, DivertError, InvalidState, Result};

// Address model
pub use crate::network::core::address::{
    Address, EndpointData, LayerData, NetworkData, ReflectData,
};

// Handles and the service
pub use crate::network::core::handle::HandleConfig;
pub use crate::network::io::slot::Buffers;
pub use crate::network::service::{BufResult, DivertService, ReceiveResult};

// Filters
pub use crate::network::filter::{Field, Filter, Value};

// Helpers
pub use crate::network::helper::{calculate_checksums, decrement_ttl};

// Value types
pub use crate::network::types::{
    ChecksumFlags, Event, Layer, OpenFlags, Protocol, Shutdown, Version, MAX_BATCH_SIZE,
};

// Settings
pub use crate::settings::{QueueOptions, ServiceOptions};

// Cancellation
pub use tokio_util::sync::CancellationToken;
