//! In-memory gateway implementations for engine tests.
//!
//! [`InMemoryTransformedStore`] applies `RowOp`s with the same upsert
//! semantics as the real store, so idempotency and crash-replay behavior
//! can be asserted without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chaingraph_common::{
    models::{
        raw::{BlockBundle, RawExchangeRate},
        rows::RowOp,
        transformed::{
            AddressRelationRow, AddressRow, AddressTransactionRow, ClusterRelationRow, ClusterRow,
            ConfigurationRow, ExchangeRateRow, SummaryStatisticsRow, TokenConfigurationRow,
            UpdaterHistoryRow, UpdaterStatusRow,
        },
    },
    storage::{RawGateway, StorageError, TransformedGateway},
    Address, AddressId, BlockId, ClusterId, TxId,
};
use chrono::NaiveDate;
use num_bigint::BigInt;

/// Raw store backed by vectors.
#[derive(Default)]
pub struct InMemoryRawStore {
    pub bundles: Vec<BlockBundle>,
    pub rates: Vec<RawExchangeRate>,
}

impl InMemoryRawStore {
    pub fn new(mut bundles: Vec<BlockBundle>, mut rates: Vec<RawExchangeRate>) -> Self {
        bundles.sort_by_key(|b| b.block_id());
        rates.sort_by_key(|r| r.date);
        Self { bundles, rates }
    }
}

#[async_trait]
impl RawGateway for InMemoryRawStore {
    async fn tip(&self) -> Result<BlockId, StorageError> {
        self.bundles
            .last()
            .map(|b| b.block_id())
            .ok_or_else(|| StorageError::NotFound("empty raw store".into()))
    }

    async fn block_bundles(
        &self,
        start: BlockId,
        end: BlockId,
    ) -> Result<Vec<BlockBundle>, StorageError> {
        let mut result = Vec::new();
        for expected in start..=end {
            match self
                .bundles
                .iter()
                .find(|b| b.block_id() == expected)
            {
                Some(bundle) => result.push(bundle.clone()),
                None => return Err(StorageError::Gap(expected)),
            }
        }
        Ok(result)
    }

    async fn exchange_rates(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RawExchangeRate>, StorageError> {
        Ok(self
            .rates
            .iter()
            .filter(|r| r.date >= from && r.date <= to)
            .cloned()
            .collect())
    }
}

type TxListKey = (AddressId, String, bool, TxId, (Option<i32>, Option<i32>));

/// Everything the in-memory transformed store holds, minus the write
/// journal; comparable across runs for replay tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub address_ids: BTreeMap<Address, AddressId>,
    pub addresses: BTreeMap<AddressId, AddressRow>,
    pub clusters: BTreeMap<ClusterId, ClusterRow>,
    pub outgoing_relations: BTreeMap<(AddressId, AddressId), AddressRelationRow>,
    pub incoming_relations: BTreeMap<(AddressId, AddressId), AddressRelationRow>,
    pub cluster_outgoing_relations: BTreeMap<(ClusterId, ClusterId), ClusterRelationRow>,
    pub cluster_incoming_relations: BTreeMap<(ClusterId, ClusterId), ClusterRelationRow>,
    pub address_transactions: BTreeMap<TxListKey, AddressTransactionRow>,
    pub balances: BTreeMap<(AddressId, String), BigInt>,
    pub transaction_ids: BTreeMap<Vec<u8>, TxId>,
    pub exchange_rates: BTreeMap<BlockId, Vec<f32>>,
    pub summary: Option<SummaryStatisticsRow>,
    pub status: Option<UpdaterStatusRow>,
    pub history: BTreeMap<BlockId, UpdaterHistoryRow>,
}

#[derive(Default)]
struct State {
    snapshot: StoreSnapshot,
    journal: Vec<RowOp>,
}

/// Transformed store with real upsert semantics.
pub struct InMemoryTransformedStore {
    keyspace: String,
    config: ConfigurationRow,
    tokens: Vec<TokenConfigurationRow>,
    state: Mutex<State>,
    /// When set, any write containing commit rows fails — simulates a
    /// crash after WRITING but before STATUS_UPDATE.
    pub fail_commit: AtomicBool,
}

pub fn test_configuration(keyspace: &str) -> ConfigurationRow {
    ConfigurationRow {
        keyspace_name: keyspace.to_string(),
        bucket_size: 10_000,
        tx_bucket_size: 25_000,
        block_bucket_size: 100_000,
        relation_secondary_shards: 1,
        address_prefix_length: 5,
        tx_prefix_length: 5,
        fiat_currencies: vec!["USD".into(), "EUR".into()],
    }
}

impl InMemoryTransformedStore {
    pub fn new(keyspace: &str) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            config: test_configuration(keyspace),
            tokens: Vec::new(),
            state: Mutex::new(State::default()),
            fail_commit: AtomicBool::new(false),
        }
    }

    pub fn with_tokens(mut self, tokens: Vec<TokenConfigurationRow>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.lock().unwrap().snapshot.clone()
    }

    pub fn journal(&self) -> Vec<RowOp> {
        self.state.lock().unwrap().journal.clone()
    }

    fn apply(snapshot: &mut StoreSnapshot, op: RowOp) {
        match op {
            RowOp::ExchangeRate(r) => {
                snapshot.exchange_rates.insert(r.block_id, r.fiat_values);
            }
            RowOp::AddressIdByPrefix(r) => {
                snapshot.address_ids.insert(r.address, r.address_id);
            }
            RowOp::AddressIdByGroup(_) => {}
            RowOp::Address(r) => {
                snapshot.addresses.insert(r.address_id, r);
            }
            RowOp::AddressTransaction(r) => {
                let key = (
                    r.address_id,
                    r.currency.clone(),
                    r.is_outgoing,
                    r.transaction_id,
                    (r.tx_reference.trace_index, r.tx_reference.log_index),
                );
                snapshot.address_transactions.insert(key, r);
            }
            RowOp::AddressTransactionsSecondaryIds(_) |
            RowOp::AddressIncomingRelationsSecondaryIds(_) |
            RowOp::AddressOutgoingRelationsSecondaryIds(_) => {}
            RowOp::AddressIncomingRelation(r) => {
                snapshot
                    .incoming_relations
                    .insert((r.src_address_id, r.dst_address_id), r);
            }
            RowOp::AddressOutgoingRelation(r) => {
                snapshot
                    .outgoing_relations
                    .insert((r.src_address_id, r.dst_address_id), r);
            }
            RowOp::Balance(r) => {
                snapshot
                    .balances
                    .insert((r.address_id, r.currency.clone()), r.balance);
            }
            RowOp::TxIdByPrefix(r) => {
                snapshot
                    .transaction_ids
                    .insert(r.transaction, r.transaction_id);
            }
            RowOp::TxIdByGroup(_) => {}
            RowOp::BlockTransactions(_) => {}
            RowOp::Cluster(r) => {
                snapshot.clusters.insert(r.cluster_id, r);
            }
            RowOp::ClusterAddress(_) => {}
            RowOp::ClusterIncomingRelation(r) => {
                snapshot
                    .cluster_incoming_relations
                    .insert((r.src_cluster_id, r.dst_cluster_id), r);
            }
            RowOp::ClusterOutgoingRelation(r) => {
                snapshot
                    .cluster_outgoing_relations
                    .insert((r.src_cluster_id, r.dst_cluster_id), r);
            }
            RowOp::ClusterTransaction(_) => {}
            RowOp::SummaryStatistics(r) => {
                snapshot.summary = Some(r);
            }
            RowOp::UpdaterStatus(r) => {
                snapshot.status = Some(r);
            }
            RowOp::UpdaterHistory(r) => {
                snapshot.history.insert(r.last_synced_block, r);
            }
        }
    }
}

#[async_trait]
impl TransformedGateway for InMemoryTransformedStore {
    fn keyspace(&self) -> &str {
        &self.keyspace
    }

    async fn get_configuration(&self) -> Result<Option<ConfigurationRow>, StorageError> {
        Ok(Some(self.config.clone()))
    }

    async fn get_updater_status(&self) -> Result<Option<UpdaterStatusRow>, StorageError> {
        Ok(self.state.lock().unwrap().snapshot.status.clone())
    }

    async fn get_updater_history(&self) -> Result<Vec<UpdaterHistoryRow>, StorageError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .snapshot
            .history
            .values()
            .cloned()
            .collect())
    }

    async fn get_highest_address_id(&self) -> Result<Option<AddressId>, StorageError> {
        let state = self.state.lock().unwrap();
        if let Some(status) = &state.snapshot.status {
            return Ok(Some(status.highest_address_id));
        }
        Ok(state
            .snapshot
            .summary
            .as_ref()
            .filter(|s| s.no_addresses > 0)
            .map(|s| (s.no_addresses - 1) as AddressId))
    }

    async fn get_highest_cluster_id(&self) -> Result<Option<ClusterId>, StorageError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .snapshot
            .summary
            .as_ref()
            .filter(|s| s.no_clusters > 0)
            .map(|s| (s.no_clusters - 1) as ClusterId))
    }

    async fn get_highest_transaction_id(&self) -> Result<Option<TxId>, StorageError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .snapshot
            .summary
            .as_ref()
            .filter(|s| s.no_transactions > 0)
            .map(|s| s.no_transactions - 1))
    }

    async fn get_address_ids(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, AddressId>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(addresses
            .iter()
            .filter_map(|a| {
                state
                    .snapshot
                    .address_ids
                    .get(a)
                    .map(|id| (a.clone(), *id))
            })
            .collect())
    }

    async fn get_addresses_by_id(
        &self,
        ids: &[AddressId],
    ) -> Result<HashMap<AddressId, AddressRow>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .snapshot
                    .addresses
                    .get(id)
                    .map(|row| (*id, row.clone()))
            })
            .collect())
    }

    async fn get_clusters(
        &self,
        ids: &[ClusterId],
    ) -> Result<HashMap<ClusterId, ClusterRow>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .snapshot
                    .clusters
                    .get(id)
                    .map(|row| (*id, row.clone()))
            })
            .collect())
    }

    async fn get_outgoing_relations(
        &self,
        pairs: &[(AddressId, AddressId)],
    ) -> Result<HashMap<(AddressId, AddressId), AddressRelationRow>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(pairs
            .iter()
            .filter_map(|key| {
                state
                    .snapshot
                    .outgoing_relations
                    .get(key)
                    .map(|row| (*key, row.clone()))
            })
            .collect())
    }

    async fn get_incoming_relations(
        &self,
        pairs: &[(AddressId, AddressId)],
    ) -> Result<HashMap<(AddressId, AddressId), AddressRelationRow>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(pairs
            .iter()
            .filter_map(|key| {
                state
                    .snapshot
                    .incoming_relations
                    .get(key)
                    .map(|row| (*key, row.clone()))
            })
            .collect())
    }

    async fn list_outgoing_relations(
        &self,
        src: AddressId,
    ) -> Result<Vec<AddressRelationRow>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshot
            .outgoing_relations
            .iter()
            .filter(|((s, _), _)| *s == src)
            .map(|(_, row)| row.clone())
            .collect())
    }

    async fn get_cluster_outgoing_relations(
        &self,
        pairs: &[(ClusterId, ClusterId)],
    ) -> Result<HashMap<(ClusterId, ClusterId), ClusterRelationRow>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(pairs
            .iter()
            .filter_map(|key| {
                state
                    .snapshot
                    .cluster_outgoing_relations
                    .get(key)
                    .map(|row| (*key, row.clone()))
            })
            .collect())
    }

    async fn get_cluster_incoming_relations(
        &self,
        pairs: &[(ClusterId, ClusterId)],
    ) -> Result<HashMap<(ClusterId, ClusterId), ClusterRelationRow>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(pairs
            .iter()
            .filter_map(|key| {
                state
                    .snapshot
                    .cluster_incoming_relations
                    .get(key)
                    .map(|row| (*key, row.clone()))
            })
            .collect())
    }

    async fn get_balances(
        &self,
        ids: &[AddressId],
    ) -> Result<HashMap<(AddressId, String), BigInt>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshot
            .balances
            .iter()
            .filter(|((id, _), _)| ids.contains(id))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn get_transaction_ids(
        &self,
        hashes: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, TxId>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(hashes
            .iter()
            .filter_map(|h| {
                state
                    .snapshot
                    .transaction_ids
                    .get(h)
                    .map(|id| (h.clone(), *id))
            })
            .collect())
    }

    async fn get_exchange_rate(
        &self,
        block_id: BlockId,
    ) -> Result<Option<ExchangeRateRow>, StorageError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshot
            .exchange_rates
            .get(&block_id)
            .map(|fiat_values| ExchangeRateRow { block_id, fiat_values: fiat_values.clone() }))
    }

    async fn get_summary_statistics(&self) -> Result<Option<SummaryStatisticsRow>, StorageError> {
        Ok(self.state.lock().unwrap().snapshot.summary.clone())
    }

    async fn get_token_configurations(&self) -> Result<Vec<TokenConfigurationRow>, StorageError> {
        Ok(self.tokens.clone())
    }

    async fn batch_write(&self, ops: Vec<RowOp>) -> Result<(), StorageError> {
        if self.fail_commit.load(Ordering::SeqCst) && ops.iter().any(RowOp::is_commit_marker) {
            return Err(StorageError::WriteTimeout("injected commit failure".into()));
        }
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        for op in ops {
            state.journal.push(op.clone());
            Self::apply(&mut state.snapshot, op);
        }
        Ok(())
    }
}
