//! Service configuration.
//!
//! Options can come from the command line through `clap` or from a TOML file.
//!
//! # Example
//!
//! ```rust,ignore
//! use divert::settings::ServiceOptions;
//!
//! let options = ServiceOptions::from_toml_str("layer = \"flow\"\nsniff = true")?;
//! assert!(options.flags().contains(divert::network::types::OpenFlags::SNIFF));
//! ```

pub mod queue;
pub mod service;

pub use queue::QueueOptions;
pub use service::ServiceOptions;
