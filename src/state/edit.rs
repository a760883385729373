//! Non-destructive edit parameters for RAW images
//!
//! Edits are stored as JSON by the catalog. The pipeline only needs an identity
//! for them: two requests render the same derivative iff their fingerprints match.

use serde::{Deserialize, Serialize};
use std::fmt;

/// All edit parameters for a RAW image
///
/// These values represent adjustments applied when rendering a derivative.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(default)]
pub struct EditParams {
    /// Exposure adjustment in stops (-5.0 to +5.0)
    pub exposure: f32,

    /// Contrast adjustment (-100.0 to +100.0)
    pub contrast: f32,

    /// Highlights adjustment (-100.0 to +100.0)
    /// - Negative values recover blown highlights
    pub highlights: f32,

    /// Shadows adjustment (-100.0 to +100.0)
    /// - Positive values lift shadows
    pub shadows: f32,

    /// Whites adjustment (-100.0 to +100.0)
    pub whites: f32,

    /// Blacks adjustment (-100.0 to +100.0)
    pub blacks: f32,

    /// Vibrance adjustment (-100.0 to +100.0)
    pub vibrance: f32,

    /// Saturation adjustment (-100.0 to +100.0)
    /// - -100.0 = grayscale, 0.0 = original
    pub saturation: f32,

    /// Temperature offset (-100 to +100), positive is warmer
    pub temperature: i32,

    /// Tint offset (-100 to +100), positive is more magenta
    pub tint: i32,
}

impl EditParams {
    /// Convert to JSON string for database storage
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from JSON string (from database)
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Check if this represents an unedited image (all values at default)
    pub fn is_unedited(&self) -> bool {
        *self == Self::default()
    }

    /// Stable identity of these parameters
    ///
    /// Hashes the JSON form, which has a fixed field order, so the value is
    /// stable across runs and can be persisted next to a derivative.
    pub fn fingerprint(&self) -> EditFingerprint {
        // Serializing plain numbers cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        let hash = blake3::hash(&json);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash.as_bytes()[..16]);
        EditFingerprint(bytes)
    }
}

/// Identity of a set of edit parameters
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EditFingerprint([u8; 16]);

impl EditFingerprint {
    pub const LEN: usize = 16;

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for EditFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EditFingerprint({self})")
    }
}

impl fmt::Display for EditFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..6] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Fingerprint of optional edits; `None` is the original derivative
pub fn fingerprint_of(edit: Option<&EditParams>) -> Option<EditFingerprint> {
    edit.map(EditParams::fingerprint)
}
