//! # tidelog Testkit
//!
//! Test utilities for tidelog.
//!
//! This crate provides:
//! - Temporary channels and archive readers
//! - Property-based generators for records and channel names
//! - Helpers that damage archive files in controlled ways
//! - Concurrent writer harnesses
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidelog_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_channel() {
//!     let temp = TempChannel::sync("app");
//!     temp.write(b"hello").unwrap();
//!     assert_eq!(temp.drain(None), vec![b"hello".to_vec()]);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod corruption;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::corruption::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use crate::init_tracing;
}

pub use corruption::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;

use tracing_subscriber::EnvFilter;

/// Routes `tracing` output to the test harness, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
