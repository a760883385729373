//! Request scheduling and derivative generation.
//!
//! [`ThumbnailPipelineService`] is the entry point: callers submit requests
//! with a priority, workers resolve them through the cache and the codec,
//! and a [`PipelineObserver`] hears about every outcome that is still wanted.

pub mod codec;
pub mod generation;
pub mod observer;
pub mod queue;
pub mod service;
pub mod source;
mod worker;

pub use codec::Codec;
pub use generation::GenerationRegistry;
pub use observer::{ChannelObserver, NoopObserver, PipelineEvent, PipelineObserver};
pub use queue::{Enqueued, PriorityQueue, QueueFull, QueueItem};
pub use service::{
    PendingInfo, PipelineBuilder, PipelineStats, RequestStatus, ThumbnailPipelineService,
};
pub use source::ByteProvider;
