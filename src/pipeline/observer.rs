//! Completion callbacks.

use crate::cache::DisplayHandle;
use crate::error::ThumbnailError;
use crate::state::AssetId;
use tokio::sync::mpsc;
use tracing::trace;

/// Receives the outcome of every request that is still current when it resolves.
///
/// Called from the pipeline's commit point with its lock held: implementations
/// must return quickly and must not call back into the pipeline. Forwarding to
/// a channel (see [`ChannelObserver`]) is the usual shape.
pub trait PipelineObserver: Send + Sync {
    fn on_ready(&self, asset: &AssetId, handle: &DisplayHandle);

    fn on_error(&self, asset: &AssetId, error: &ThumbnailError);
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {
    fn on_ready(&self, asset: &AssetId, handle: &DisplayHandle) {
        trace!(asset = %asset, handle = %handle.id(), "derivative ready (unobserved)");
    }

    fn on_error(&self, asset: &AssetId, error: &ThumbnailError) {
        trace!(asset = %asset, error = %error, "derivative failed (unobserved)");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    Ready {
        asset: AssetId,
        handle: DisplayHandle,
    },
    Failed {
        asset: AssetId,
        error: ThumbnailError,
    },
}

impl PipelineEvent {
    pub fn asset(&self) -> &AssetId {
        match self {
            PipelineEvent::Ready { asset, .. } | PipelineEvent::Failed { asset, .. } => asset,
        }
    }
}

/// Forwards callbacks into an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PipelineObserver for ChannelObserver {
    fn on_ready(&self, asset: &AssetId, handle: &DisplayHandle) {
        // A dropped receiver means nobody is displaying anything anymore
        let _ = self.tx.send(PipelineEvent::Ready {
            asset: asset.clone(),
            handle: handle.clone(),
        });
    }

    fn on_error(&self, asset: &AssetId, error: &ThumbnailError) {
        let _ = self.tx.send(PipelineEvent::Failed {
            asset: asset.clone(),
            error: error.clone(),
        });
    }
}
