//! # xrm-id
//!
//! Stable ID types, parsing, and validation for the xrm control plane.
//!
//! ## Design Principles
//!
//! - IDs are stable and system-generated; resource names are user-controlled labels
//! - All IDs have a canonical string representation with strict parsing
//! - IDs are typed so a resource uid can never be confused with a pass id
//!
//! ## ID Format
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`
//!
//! Examples:
//! - `res_01HV4Z2WQXKJNM8GPQY6VBKC3D` (managed resource uid)
//! - `pass_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (one reconciliation pass)
//!
//! External identities (ARNs, provider ids) are NOT modelled here: they are
//! opaque strings owned by the external system.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
