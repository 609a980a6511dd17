//! The delta-update engine.
//!
//! [`DeltaUpdater`] drives the per-currency state machine: PLANNING reads
//! the status row and picks the next block range below `tip − margin`,
//! PROJECTING loads raw bundles and runs the ledger projector,
//! AGGREGATING folds deltas and resolves ids, WRITING applies the grouped
//! row set with retry, and STATUS_UPDATE commits the batch. A crash before
//! the commit rows are written replays the batch on restart; every row is
//! an idempotent upsert, so the replay converges to the same state.

pub mod account;
pub mod aggregator;
pub mod ids;
pub mod lock;
pub mod rates;
pub mod status;
pub mod utxo;
pub mod validator;

use std::collections::HashMap;

use chaingraph_common::{
    models::{delta::DbDelta, transformed::ConfigurationRow, SchemaType},
    storage::{RawGateway, StorageError, TransformedGateway},
    Address, BlockId, TxId,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::updater::{
    aggregator::Aggregator,
    ids::IdAllocator,
    rates::RateAttacher,
    status::StatusTracker,
};

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Gap in raw keyspace at block {0}")]
    GapInRaw(BlockId),
    #[error("No exchange rate at or before block {0}")]
    RateMissing(BlockId),
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    #[error("Validator divergence: {0}")]
    Divergence(String),
    #[error("Update cancelled")]
    Cancelled,
    #[error("Another updater holds the lock {0}")]
    LockHeld(String),
    #[error("Setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for UpdateError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Gap(block) => UpdateError::GapInRaw(block),
            other => UpdateError::Storage(other),
        }
    }
}

impl UpdateError {
    /// Process exit code per error class: 0 for benign contention, 2 for
    /// invariant violations, 1 for everything fatal.
    pub fn exit_code(&self) -> i32 {
        match self {
            UpdateError::LockHeld(_) => 0,
            UpdateError::InvariantViolation(_) | UpdateError::Divergence(_) => 2,
            _ => 1,
        }
    }
}

/// Output of one ledger projector run.
pub struct ProjectionOutput {
    /// One delta per transaction, in `(block, within-block)` order.
    pub per_tx: Vec<DbDelta<Address>>,
    /// Unique addresses in id-assignment order.
    pub address_order: Vec<Address>,
    /// Input-address groups of multi-input transactions (UTXO only).
    pub cluster_inputs: Vec<Vec<Address>>,
    /// Transaction hashes in block order (account only).
    pub tx_hashes_in_order: Vec<Vec<u8>>,
    /// Dense tx ids per block.
    pub block_txs: Vec<(BlockId, Vec<TxId>)>,
    pub tx_count: u64,
}

/// Engine knobs; everything else comes from the keyspace configuration.
#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    pub schema_type: SchemaType,
    pub native_ticker: String,
    pub batch_size: i64,
    pub safety_margin: i64,
    pub end_block: Option<BlockId>,
    pub forward_fill_rates: bool,
    pub pedantic: bool,
}

/// What a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Transformed is caught up with `tip − margin`; nothing written.
    Idle,
    Advanced { last_block: BlockId, rows_written: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub batches: u64,
    pub last_block: Option<BlockId>,
}

pub struct DeltaUpdater<'a> {
    raw: &'a dyn RawGateway,
    transformed: &'a dyn TransformedGateway,
    config: ConfigurationRow,
    settings: UpdaterSettings,
    cancel: watch::Receiver<bool>,
}

impl<'a> DeltaUpdater<'a> {
    pub async fn new(
        raw: &'a dyn RawGateway,
        transformed: &'a dyn TransformedGateway,
        settings: UpdaterSettings,
        cancel: watch::Receiver<bool>,
    ) -> Result<DeltaUpdater<'a>, UpdateError> {
        let config = transformed
            .get_configuration()
            .await?
            .ok_or_else(|| {
                UpdateError::Setup(format!(
                    "transformed keyspace {} has no configuration row",
                    transformed.keyspace()
                ))
            })?;
        Ok(DeltaUpdater { raw, transformed, config, settings, cancel })
    }

    fn check_cancelled(&self) -> Result<(), UpdateError> {
        if *self.cancel.borrow() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }

    /// Next unprocessed block: one past the status row, or the full
    /// transform's high-water mark for keyspaces without delta history.
    async fn last_synced_block(&self) -> Result<BlockId, UpdateError> {
        if let Some(status) = self.transformed.get_updater_status().await? {
            return Ok(status.last_synced_block);
        }
        Ok(self
            .transformed
            .get_summary_statistics()
            .await?
            .map(|s| s.no_blocks - 1)
            .unwrap_or(-1))
    }

    /// Runs batches until the transformed keyspace is caught up (or the
    /// configured end block is reached), committing status after each.
    #[instrument(skip(self), fields(keyspace = self.transformed.keyspace()))]
    pub async fn run(&mut self) -> Result<RunSummary, UpdateError> {
        let mut allocator = IdAllocator::new(
            self.transformed.get_highest_address_id().await?,
            self.transformed.get_highest_cluster_id().await?,
            self.transformed.get_highest_transaction_id().await?,
        );
        let mut tracker = StatusTracker::new(
            self.transformed.keyspace(),
            self.transformed.get_summary_statistics().await?,
            self.settings.end_block.is_some(),
        );

        let mut summary = RunSummary::default();
        loop {
            match self.tick(&mut allocator, &mut tracker).await? {
                TickOutcome::Idle => {
                    if summary.batches == 0 {
                        info!("Nothing to do, data is up to date");
                    }
                    return Ok(summary);
                }
                TickOutcome::Advanced { last_block, rows_written } => {
                    summary.batches += 1;
                    summary.last_block = Some(last_block);
                    info!(last_block, rows_written, batches = summary.batches, "Committed batch");
                }
            }
        }
    }

    /// One pass through the state machine. Cancellation is checked at
    /// every transition; a cancelled batch leaves no trace.
    pub async fn tick(
        &mut self,
        allocator: &mut IdAllocator,
        tracker: &mut StatusTracker,
    ) -> Result<TickOutcome, UpdateError> {
        // PLANNING
        self.check_cancelled()?;
        let batch_start = std::time::Instant::now();
        let last_synced = self.last_synced_block().await?;
        let mut target = self
            .raw
            .tip_with_margin(self.settings.safety_margin)
            .await?;
        if let Some(end_block) = self.settings.end_block {
            target = target.min(end_block);
        }
        let start = last_synced + 1;
        let end = target.min(start + self.settings.batch_size - 1);
        if end < start {
            return Ok(TickOutcome::Idle);
        }
        debug!(start, end, target, "Planned batch");

        // PROJECTING
        self.check_cancelled()?;
        let bundles = self.raw.block_bundles(start, end).await?;
        let attacher = RateAttacher::new(
            self.config.fiat_currencies.clone(),
            self.settings.forward_fill_rates,
        );
        let rate_slice = attacher.build_slice(self.raw, &bundles).await?;

        let mut new_tx_assignments: Vec<(Vec<u8>, TxId)> = Vec::new();
        let projection = match self.settings.schema_type {
            SchemaType::Utxo => utxo::project(&bundles, &rate_slice)?,
            SchemaType::Account => {
                let hashes = account::tx_hashes_in_order(&bundles)?;
                let mut unique = hashes.clone();
                unique.sort_unstable();
                unique.dedup();
                let existing = self.transformed.get_transaction_ids(&unique).await?;
                let tx_ids = allocator.assign_transaction_ids(&hashes, &existing);
                new_tx_assignments = tx_ids
                    .iter()
                    .filter(|(hash, _)| !existing.contains_key(*hash))
                    .map(|(hash, id)| (hash.clone(), *id))
                    .collect();
                new_tx_assignments.sort_by_key(|(_, id)| *id);
                let tokens = self.token_map().await?;
                account::project(
                    &bundles,
                    &rate_slice,
                    &tokens,
                    &tx_ids,
                    &self.settings.native_ticker,
                    &self.config.fiat_currencies,
                )?
            }
        };

        // AGGREGATING
        self.check_cancelled()?;
        let aggregator = Aggregator::new(
            self.transformed,
            &self.config,
            self.settings.schema_type,
            &self.settings.native_ticker,
        );
        let result = aggregator
            .aggregate(&projection, allocator, &new_tx_assignments)
            .await?;

        let mut ops = rate_slice.to_row_ops();
        ops.extend(result.ops);

        if self.settings.pedantic {
            validator::validate_changes(self.transformed, &ops).await?;
        }

        // WRITING
        self.check_cancelled()?;
        let rows_written = ops.len();
        self.transformed.batch_write(ops).await?;

        // STATUS_UPDATE: the commit point; only after every data row is
        // acknowledged does the status row advance
        self.check_cancelled()?;
        let last_bundle = bundles
            .last()
            .ok_or(UpdateError::GapInRaw(start))?;
        let commit_ops = tracker.commit_ops(
            end,
            last_bundle.block.timestamp,
            &result.stats,
            allocator.highest_address_id(),
            batch_start.elapsed().as_secs() as i32,
        );
        self.transformed.batch_write(commit_ops).await?;

        Ok(TickOutcome::Advanced { last_block: end, rows_written })
    }

    async fn token_map(
        &self,
    ) -> Result<HashMap<Address, chaingraph_common::models::transformed::TokenConfigurationRow>, UpdateError>
    {
        Ok(self
            .transformed
            .get_token_configurations()
            .await?
            .into_iter()
            .map(|t| (t.token_address.clone(), t))
            .collect())
    }
}
