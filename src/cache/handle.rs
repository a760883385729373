//! Display handles for cached derivatives.
//!
//! A handle stands for an externally-owned display resource (a GPU texture, an
//! image widget handle, an object URL). The cache that minted a handle is its
//! sole owner while it is resident; clones handed out to observers are views
//! that must not outlive the release notification.

use crate::state::AssetId;
use std::fmt;
use std::sync::Arc;

/// Unique id of a minted handle, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// A derivative ready for display.
#[derive(Clone)]
pub struct DisplayHandle {
    id: HandleId,
    asset: AssetId,
    bytes: Arc<[u8]>,
}

impl DisplayHandle {
    pub(crate) fn new(id: HandleId, asset: AssetId, bytes: Arc<[u8]>) -> Self {
        Self { id, asset, bytes }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn asset(&self) -> &AssetId {
        &self.asset
    }

    /// Encoded derivative bytes backing this handle
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl PartialEq for DisplayHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DisplayHandle {}

impl fmt::Debug for DisplayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayHandle")
            .field("id", &self.id)
            .field("asset", &self.asset)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Owner of the external resources behind display handles.
///
/// `release` is called exactly once per handle, when the cache gives it up
/// (eviction, invalidation, clear). Implementations must not call back into
/// the cache or the pipeline.
pub trait HandleReleaser: Send + Sync {
    fn release(&self, handle: DisplayHandle);
}

/// Releaser for handles that own nothing beyond their bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DropReleaser;

impl HandleReleaser for DropReleaser {
    fn release(&self, handle: DisplayHandle) {
        drop(handle);
    }
}

impl<F> HandleReleaser for F
where
    F: Fn(DisplayHandle) + Send + Sync,
{
    fn release(&self, handle: DisplayHandle) {
        self(handle)
    }
}
