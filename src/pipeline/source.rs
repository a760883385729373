//! Byte providers: where a request's source bytes come from.

use crate::error::SourceError;
use async_trait::async_trait;
use std::future::Future;

/// Zero-argument async source of an asset's current bytes.
///
/// Called once per processing attempt, so it should re-read the source
/// rather than return a snapshot taken at request time. Any async closure
/// returning `Result<Vec<u8>, SourceError>` is a provider.
#[async_trait]
pub trait ByteProvider: Send + Sync {
    async fn read(&self) -> Result<Vec<u8>, SourceError>;
}

#[async_trait]
impl<F, Fut> ByteProvider for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<u8>, SourceError>> + Send,
{
    async fn read(&self) -> Result<Vec<u8>, SourceError> {
        self().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closure_provider() {
        let provider = || async { Ok::<_, SourceError>(vec![1, 2, 3]) };
        assert_eq!(provider.read().await.unwrap(), vec![1, 2, 3]);
    }
}
