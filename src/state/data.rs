//! Shared data structures for the derivative pipeline
//!
//! These types flow between the caller, the scheduler and the caches.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable identity of a source asset in the catalog
///
/// Typically the catalog row id or the source path. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetId(Arc<str>);

impl AssetId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AssetId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

impl From<i64> for AssetId {
    /// Catalog row ids
    fn from(id: i64) -> Self {
        Self::from(id.to_string())
    }
}

/// Scheduling class of a request
///
/// Ordered so that `Visible < NearVisible < Preload < Background`;
/// the lowest value is dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// On screen right now
    Visible,
    /// Just outside the viewport (one scroll away)
    NearVisible,
    /// Rest of the folder, rendered ahead of need
    Preload,
    /// Regeneration after an edit or source change
    Background,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Visible,
        Priority::NearVisible,
        Priority::Preload,
        Priority::Background,
    ];
}

/// Target size class of a derivative
///
/// Mirrors the catalog's cache tiers:
/// - `Thumb`: 256px grid thumbnail
/// - `Instant`: 384px quick preview
/// - `Working`: 1280px editing preview
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivativeKind {
    #[default]
    Thumb,
    Instant,
    Working,
}

impl DerivativeKind {
    /// Longest edge of the derivative in pixels
    pub fn max_dimension(self) -> u32 {
        match self {
            DerivativeKind::Thumb => 256,
            DerivativeKind::Instant => 384,
            DerivativeKind::Working => 1280,
        }
    }

    /// Directory / table name used by the durable stores
    pub fn tier_name(self) -> &'static str {
        match self {
            DerivativeKind::Thumb => "thumb",
            DerivativeKind::Instant => "instant",
            DerivativeKind::Working => "working",
        }
    }
}

impl std::str::FromStr for DerivativeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thumb" => Ok(DerivativeKind::Thumb),
            "instant" => Ok(DerivativeKind::Instant),
            "working" => Ok(DerivativeKind::Working),
            other => Err(format!("unknown derivative kind `{other}`")),
        }
    }
}
