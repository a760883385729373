//! Codec boundary.

use crate::error::CodecError;
use crate::state::{DerivativeKind, EditParams};
use async_trait::async_trait;

/// Turns source bytes into encoded derivative bytes.
///
/// The pipeline never runs more concurrent calls than it has workers, and it
/// cannot abort a call: a hung call occupies its worker until it returns.
/// Callers needing bounded latency wrap their codec with a timeout.
#[async_trait]
pub trait Codec: Send + Sync {
    async fn generate(
        &self,
        source: Vec<u8>,
        edit: Option<EditParams>,
        kind: DerivativeKind,
    ) -> Result<Vec<u8>, CodecError>;
}
