//! Search index sink.
//!
//! The search index is an external collaborator: the pipeline only tells it
//! which contracts changed at the end of each flush.

use async_trait::async_trait;

use wasmindex_core::error::IngestError;

/// Opaque search index interface.
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    async fn reindex(&self, contracts: &[String]) -> Result<(), IngestError>;
}

/// Discards reindex requests.
#[derive(Debug, Default)]
pub struct NoopSearchIndexer;

#[async_trait]
impl SearchIndexer for NoopSearchIndexer {
    async fn reindex(&self, _contracts: &[String]) -> Result<(), IngestError> {
        Ok(())
    }
}

/// Records reindex requests for assertions in tests.
#[derive(Debug, Default)]
pub struct RecordingSearchIndexer {
    calls: std::sync::Mutex<Vec<Vec<String>>>,
}

impl RecordingSearchIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchIndexer for RecordingSearchIndexer {
    async fn reindex(&self, contracts: &[String]) -> Result<(), IngestError> {
        self.calls.lock().unwrap().push(contracts.to_vec());
        Ok(())
    }
}
