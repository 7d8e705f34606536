//! Shared types for the shipyard workspace.
//!
//! Keep wire-format types here so the reconciler and any client agree on the intent schema.

#![warn(missing_docs)]

/// Intent and applied-state DTOs.
pub mod api;
