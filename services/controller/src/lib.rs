//! xrm controller library.
//!
//! The crate ships the `xrm-controller` binary; the library surface exists
//! for integration tests and for embedding the scheduler elsewhere.

pub mod backoff;
pub mod config;
pub mod manifest;
pub mod registry;
pub mod scheduler;
pub mod store;
