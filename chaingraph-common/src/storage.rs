//! Gateway traits separating the update engine from the store.
//!
//! `chaingraph-storage` provides the Scylla/Cassandra implementations; the
//! engine tests run against mocks and in-memory implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use mockall::automock;
use num_bigint::BigInt;
use thiserror::Error;

use crate::{
    models::{
        raw::{BlockBundle, RawExchangeRate},
        rows::RowOp,
        transformed::{
            AddressRelationRow, AddressRow, ClusterRelationRow, ClusterRow, ConfigurationRow,
            ExchangeRateRow, SummaryStatisticsRow, TokenConfigurationRow, UpdaterHistoryRow,
            UpdaterStatusRow,
        },
    },
    Address, AddressId, BlockId, ClusterId, TxId,
};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Missing block {0} in raw keyspace")]
    Gap(BlockId),
    #[error("Schema mismatch: {0}")]
    Corrupt(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Write timed out: {0}")]
    WriteTimeout(String),
    #[error("Write rejected: {0}")]
    WriteRejected(String),
    #[error("Unexpected storage error: {0}")]
    Unexpected(String),
}

impl StorageError {
    /// Transient errors are worth retrying with backoff; everything else
    /// aborts the run.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_) | StorageError::WriteTimeout(_))
    }
}

/// Read access to the immutable raw keyspace.
#[automock]
#[async_trait]
pub trait RawGateway: Send + Sync {
    /// Highest contiguous block height present in raw.
    async fn tip(&self) -> Result<BlockId, StorageError>;

    /// Tip lowered by the re-org safety margin; everything at or below is
    /// treated as final.
    async fn tip_with_margin(&self, margin: BlockId) -> Result<BlockId, StorageError> {
        Ok(self.tip().await? - margin)
    }

    /// All bundles for `start..=end` in strict height-ascending order.
    /// A missing height fails with [`StorageError::Gap`].
    async fn block_bundles(
        &self,
        start: BlockId,
        end: BlockId,
    ) -> Result<Vec<BlockBundle>, StorageError>;

    /// Raw exchange-rate rows for the UTC date range, ascending.
    async fn exchange_rates(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RawExchangeRate>, StorageError>;
}

/// Read/write access to the derived keyspace.
///
/// All reads used during aggregation are batched; `batch_write` is the only
/// write path and must not report success before the store acknowledged
/// every chunk.
#[automock]
#[async_trait]
pub trait TransformedGateway: Send + Sync {
    fn keyspace(&self) -> &str;

    async fn get_configuration(&self) -> Result<Option<ConfigurationRow>, StorageError>;

    async fn get_updater_status(&self) -> Result<Option<UpdaterStatusRow>, StorageError>;

    async fn get_updater_history(&self) -> Result<Vec<UpdaterHistoryRow>, StorageError>;

    async fn get_highest_address_id(&self) -> Result<Option<AddressId>, StorageError>;

    async fn get_highest_cluster_id(&self) -> Result<Option<ClusterId>, StorageError>;

    async fn get_highest_transaction_id(&self) -> Result<Option<TxId>, StorageError>;

    async fn get_address_ids(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, AddressId>, StorageError>;

    async fn get_addresses_by_id(
        &self,
        ids: &[AddressId],
    ) -> Result<HashMap<AddressId, AddressRow>, StorageError>;

    async fn get_clusters(
        &self,
        ids: &[ClusterId],
    ) -> Result<HashMap<ClusterId, ClusterRow>, StorageError>;

    /// Existing outgoing-relation rows for `(src, dst)` pairs.
    async fn get_outgoing_relations(
        &self,
        pairs: &[(AddressId, AddressId)],
    ) -> Result<HashMap<(AddressId, AddressId), AddressRelationRow>, StorageError>;

    /// Existing incoming-relation rows, keyed `(src, dst)` like outgoing.
    async fn get_incoming_relations(
        &self,
        pairs: &[(AddressId, AddressId)],
    ) -> Result<HashMap<(AddressId, AddressId), AddressRelationRow>, StorageError>;

    /// All outgoing relations of one address; used by the validator's
    /// symmetry spot-checks.
    async fn list_outgoing_relations(
        &self,
        src: AddressId,
    ) -> Result<Vec<AddressRelationRow>, StorageError>;

    async fn get_cluster_outgoing_relations(
        &self,
        pairs: &[(ClusterId, ClusterId)],
    ) -> Result<HashMap<(ClusterId, ClusterId), ClusterRelationRow>, StorageError>;

    async fn get_cluster_incoming_relations(
        &self,
        pairs: &[(ClusterId, ClusterId)],
    ) -> Result<HashMap<(ClusterId, ClusterId), ClusterRelationRow>, StorageError>;

    async fn get_balances(
        &self,
        ids: &[AddressId],
    ) -> Result<HashMap<(AddressId, String), BigInt>, StorageError>;

    async fn get_transaction_ids(
        &self,
        hashes: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, TxId>, StorageError>;

    async fn get_exchange_rate(
        &self,
        block_id: BlockId,
    ) -> Result<Option<ExchangeRateRow>, StorageError>;

    async fn get_summary_statistics(&self) -> Result<Option<SummaryStatisticsRow>, StorageError>;

    async fn get_token_configurations(&self) -> Result<Vec<TokenConfigurationRow>, StorageError>;

    /// Upserts the whole group; chunking and retry are the implementation's
    /// concern. Success means every row is acknowledged.
    async fn batch_write(&self, ops: Vec<RowOp>) -> Result<(), StorageError>;
}
