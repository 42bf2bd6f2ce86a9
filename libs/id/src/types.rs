//! Typed ID definitions.
//!
//! Each ID type has a unique prefix that identifies what it names.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// Managed Resources
// =============================================================================

define_id!(ResourceUid, "res");

// =============================================================================
// Reconciliation
// =============================================================================

define_id!(PassId, "pass");

// =============================================================================
// Tests
// =============================================================================
