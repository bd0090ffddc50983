//! Tessera Common Library
//!
//! Shared utilities for the Tessera ingest workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and its result alias
//! - **Checksums**: digest helpers used for object keys and synthetic payloads
//! - **Logging**: one place to configure `tracing` output for every binary
//!
//! # Example
//!
//! ```no_run
//! use tessera_common::checksum::md5_hex;
//!
//! let prefix = md5_hex(b"1&2&3&0&0&0&0&0");
//! assert_eq!(prefix.len(), 32);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
