//! State shared across the pipeline
//!
//! - Asset identity, priorities and derivative kinds (data.rs)
//! - Edit parameters and their fingerprints (edit.rs)

pub mod data;
pub mod edit;

pub use data::{AssetId, DerivativeKind, Priority};
pub use edit::{EditFingerprint, EditParams};
