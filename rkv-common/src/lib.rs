// rkv-common - Shared types and protocol definitions for the region-routed KV store
//
// This crate defines the vocabulary client and partition servers exchange:
// table/server identities, partition descriptors, locations, and batch payloads.

pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use types::*;
