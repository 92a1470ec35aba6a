//! Core network functionality.
//!
//! Address records as the driver writes them, and ownership of driver handles.

pub mod address;
pub mod handle;

// Re-export commonly used types
pub use address::Address;
pub use handle::{DivertHandle, HandleConfig};
