//! Ingestion driver.
//!
//! Reads one JSON record per line, buffers them, and flushes on block
//! boundaries: a flush fires when the buffer has reached the batch
//! threshold *and* the incoming record starts a new block, so a block's
//! events are never split across flushes. Each flush is one atomic advance
//! of the pipeline: dedup → normalize → contract/event upsert →
//! transformations → cache invalidation → webhook enqueue → checkpoint →
//! search reindex.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use wasmindex_core::config::IndexerConfig;
use wasmindex_core::dependency::Change;
use wasmindex_core::error::IngestError;
use wasmindex_core::store::Storage;
use wasmindex_core::transform::TransformerRegistry;
use wasmindex_core::types::{RawWasmEvent, WasmEvent};
use wasmindex_webhooks::WebhookDispatcher;

use crate::cache::ComputationCache;
use crate::search::SearchIndexer;

/// Counters accumulated over one driver run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub lines: u64,
    pub parsed: u64,
    pub skipped: u64,
    pub malformed: u64,
    pub flushes: u64,
    pub events_exported: u64,
    pub transformations: u64,
    pub webhooks_enqueued: u64,
}

/// Single-writer ingestion driver for one event stream.
pub struct IngestDriver {
    storage: Arc<dyn Storage>,
    transformer: TransformerRegistry,
    cache: ComputationCache,
    dispatcher: Option<WebhookDispatcher>,
    search: Arc<dyn SearchIndexer>,

    batch: usize,
    cache_updates: bool,
    initial_block_override: Option<u64>,

    pending: Vec<RawWasmEvent>,
    last_block_seen: Option<u64>,
    initial_block: u64,
    caught_up: bool,
    stats: IngestStats,
}

impl IngestDriver {
    pub fn new(
        storage: Arc<dyn Storage>,
        transformer: TransformerRegistry,
        cache: ComputationCache,
        dispatcher: Option<WebhookDispatcher>,
        search: Arc<dyn SearchIndexer>,
        config: &IndexerConfig,
    ) -> Self {
        Self {
            storage,
            transformer,
            cache,
            dispatcher,
            search,
            batch: config.batch.max(1),
            cache_updates: config.cache_updates,
            initial_block_override: config.initial_block_height,
            pending: Vec::new(),
            last_block_seen: None,
            initial_block: 0,
            caught_up: false,
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Number of buffered, not-yet-flushed records.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Consume the stream until EOF or shutdown, then flush.
    ///
    /// On shutdown the current line is finished before the final flush, so
    /// the run always ends on a record boundary.
    pub async fn run<R>(
        &mut self,
        reader: R,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<IngestStats, IngestError>
    where
        R: AsyncBufRead + Unpin,
    {
        self.initial_block = match self.initial_block_override {
            Some(height) => height,
            None => self.storage.state().await?.last_wasm_block_height_exported + 1,
        };
        info!(initial_block = self.initial_block, "ingestion starting");

        let mut lines = reader.lines();
        loop {
            if *shutdown.borrow() {
                info!("shutdown requested, flushing");
                break;
            }
            let line = tokio::select! {
                biased;
                line = lines.next_line() => line?,
                _ = shutdown.changed() => continue,
            };
            let Some(line) = line else {
                debug!("stream ended");
                break;
            };
            self.handle_line(&line).await?;
        }

        self.flush().await?;
        info!(
            lines = self.stats.lines,
            exported = self.stats.events_exported,
            skipped = self.stats.skipped,
            malformed = self.stats.malformed,
            flushes = self.stats.flushes,
            "ingestion finished"
        );
        Ok(self.stats)
    }

    /// Process one stream line: parse, filter, maybe flush, buffer.
    pub async fn handle_line(&mut self, line: &str) -> Result<(), IngestError> {
        self.stats.lines += 1;
        if line.trim().is_empty() {
            return Ok(());
        }

        let raw: RawWasmEvent = match serde_json::from_str(line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "malformed stream record, skipping");
                self.stats.malformed += 1;
                return Ok(());
            }
        };

        if raw.block_height < self.initial_block {
            self.stats.skipped += 1;
            return Ok(());
        }
        if !self.caught_up {
            info!(
                height = raw.block_height,
                "caught up to initial block, entering live mode"
            );
            self.caught_up = true;
        }

        // Flush on the first event of a new block once the batch threshold
        // is reached — never mid-block.
        let new_block = self
            .last_block_seen
            .is_some_and(|last| raw.block_height > last);
        if self.pending.len() >= self.batch && new_block {
            self.flush().await?;
        }

        self.last_block_seen = Some(
            self.last_block_seen
                .map_or(raw.block_height, |last| last.max(raw.block_height)),
        );
        self.pending.push(raw);
        self.stats.parsed += 1;
        Ok(())
    }

    /// Flush the pending buffer as one atomic pipeline advance. A no-op on
    /// an empty buffer.
    pub async fn flush(&mut self) -> Result<(), IngestError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        // 1. Within-batch dedup: keep the last record per
        //    (block, contract, key).
        let mut kept: Vec<RawWasmEvent> = Vec::with_capacity(self.pending.len());
        let mut index: HashMap<(u64, String, String), usize> = HashMap::new();
        for raw in &self.pending {
            let slot = (
                raw.block_height,
                raw.contract_address.clone(),
                raw.key.clone(),
            );
            match index.get(&slot) {
                Some(&i) => kept[i] = raw.clone(),
                None => {
                    index.insert(slot, kept.len());
                    kept.push(raw.clone());
                }
            }
        }

        // 2. Normalize; per-record decode failures are reported and skipped.
        let mut events: Vec<WasmEvent> = Vec::with_capacity(kept.len());
        for raw in &kept {
            match WasmEvent::from_raw(raw) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(
                        contract = %raw.contract_address,
                        height = raw.block_height,
                        error = %e,
                        "undecodable record, skipping"
                    );
                    self.stats.malformed += 1;
                }
            }
        }
        if events.is_empty() {
            self.pending.clear();
            return Ok(());
        }

        // 3. Persist contracts and events.
        self.storage.upsert_contracts(&events).await?;
        let stored = self.storage.upsert_events(&events).await?;
        self.stats.events_exported += stored.len() as u64;

        // 4. Derived transformations.
        let transformations = self.transformer.apply_batch(&events);
        if !transformations.is_empty() {
            self.storage.upsert_transformations(&transformations).await?;
            self.stats.transformations += transformations.len() as u64;
        }

        // 5. Cache invalidation over events ∪ transformations.
        if self.cache_updates {
            let changes: Vec<Change> = events
                .iter()
                .map(Change::from_event)
                .chain(transformations.iter().map(Change::from_transformation))
                .collect();
            let stats = self.cache.invalidate(&changes).await?;
            if stats.updated > 0 || stats.destroyed > 0 {
                debug!(
                    updated = stats.updated,
                    destroyed = stats.destroyed,
                    "computations invalidated by flush"
                );
            }
        }

        // 6. Webhooks.
        if let Some(dispatcher) = &self.dispatcher {
            match dispatcher.enqueue(&stored).await {
                Ok(enqueued) => self.stats.webhooks_enqueued += enqueued,
                Err(e) => warn!(error = %e, "webhook enqueue failed"),
            }
        }

        // 7. Advance the checkpoint (monotonic max).
        let max_height = events.iter().map(|e| e.block_height).max().unwrap_or(0);
        let max_time = events
            .iter()
            .map(|e| e.block_time_unix_ms)
            .max()
            .unwrap_or(0);
        self.storage
            .advance_state(Some(max_height), Some((max_height, max_time)))
            .await?;

        // 8. Tell the search index which contracts changed. Failures here
        //    don't halt ingestion.
        let mut contracts: Vec<String> = Vec::new();
        for event in &events {
            if !contracts.contains(&event.contract_address) {
                contracts.push(event.contract_address.clone());
            }
        }
        if let Err(e) = self.search.reindex(&contracts).await {
            warn!(error = %e, "search reindex failed");
        }

        // 9. Clear the buffer.
        self.pending.clear();
        self.stats.flushes += 1;
        debug!(
            events = events.len(),
            through_block = max_height,
            "flush complete"
        );
        Ok(())
    }
}
