//! Prioritized, cancellable derivative generation for RAW photo libraries.
//!
//! Thumbnails and previews are requested with a [`Priority`], rendered by a
//! small worker pool through a [`Codec`], and kept in a two-tier cache (a
//! bounded in-memory LRU of display handles over a durable store). Every
//! asset carries a generation counter so results that were superseded by an
//! edit, a source change or a cancellation are never shown.
//!
//! ```no_run
//! use raw_thumbnailer::{ChannelObserver, FileSource, Priority, RawCodec, ThumbnailPipelineService};
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (observer, mut events) = ChannelObserver::channel();
//! let pipeline = ThumbnailPipelineService::builder(Arc::new(RawCodec::new()))
//!     .observer(Arc::new(observer))
//!     .start()?;
//!
//! pipeline.request("IMG_0001", Arc::new(FileSource::new("IMG_0001.CR2")), Priority::Visible, None);
//! let event = events.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod raw;
pub mod state;

pub use cache::{DerivativeCache, DisplayHandle, DurableStore, HandleReleaser};
pub use config::{PipelineConfig, StoreConfig};
pub use error::{CodecError, ConfigError, SourceError, StorageError, ThumbnailError};
pub use pipeline::{
    ByteProvider, ChannelObserver, Codec, PipelineEvent, PipelineObserver, RequestStatus,
    ThumbnailPipelineService,
};
pub use raw::{FileSource, RawCodec};
pub use state::{AssetId, DerivativeKind, EditParams, Priority};
