//! # divert - Asynchronous access to the WinDivert driver
//!
//! divert lets a process capture, inspect, modify and reinject network
//! packets, and receive flow, socket and reflect events, through the
//! WinDivert packet interception driver.
//!
//! ## Features
//!
//! * Async receive and send - Operations complete from driver worker threads
//!   and resume the awaiting task
//! * Race-free cancellation - Tokens can fire before, during or after the
//!   native call without leaking into the next operation
//! * Pooled operations - Steady-state I/O reuses one engine per concurrent call
//! * Typed address records - Layer-specific views that refuse mismatched layers
//! * Filter algebra - Build filter text with `&`, `|` and `!`
//! * Packet helpers - Checksums and TTL handling in pure Rust
//!
//! ## Architecture
//!
//! Everything driver-specific sits behind the [`sys::Driver`] trait. The
//! Windows backend talks to WinDivert.dll and the system thread pool; tests
//! run the whole stack against an in-process driver.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use divert::prelude::*;
//! use divert::sys::windows::WinDivert;
//!
//! let filter = Field::TCP & Field::OUTBOUND;
//! let service = DivertService::open(WinDivert, &filter, HandleConfig::default())?;
//! let token = CancellationToken::new();
//! let (result, buffers) = service
//!     .receive(vec![0; 65535], vec![Address::default(); 16], &token)
//!     .await;
//! ```

/// Centralized error handling
pub mod error;
/// Address records, filters, the I/O engine and the service
pub mod network;
/// Prelude for convenient imports
pub mod prelude;
/// Service configuration
pub mod settings;
/// Native driver seam
pub mod sys;

// Re-export commonly used types
pub use error::{DivertError, Result};
