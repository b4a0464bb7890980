//! # hdcfg-id
//!
//! Typed identifiers for the resources the controller hands to the agent.
//!
//! ## Design Principles
//!
//! - IDs are issued by the controller; the agent never invents them outside tests
//! - All IDs have a canonical string representation with strict parsing
//! - IDs support roundtrip serialization (parse → format → parse)
//! - IDs are typed so a port id can never be passed where a router id is expected
//!
//! ## ID Format
//!
//! Controller IDs are bare hyphenated UUIDs, e.g.
//! `5c7f1d3e-2a4b-4c8d-9e0f-1a2b3c4d5e6f`. Parsing accepts any UUID form the
//! `uuid` crate understands and always formats back to the lowercase
//! hyphenated form.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
