//! Network module for packet interception.
//!
//! This module contains the address model, the filter algebra, the
//! completion-based I/O engine and the service built on top of them.

pub mod core;
pub mod filter;
pub mod helper;
pub mod io;
pub mod service;
pub mod types;
