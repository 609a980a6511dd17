//! Read/write adapter for the transformed keyspace.
//!
//! Reads used during aggregation are issued concurrently per key; the only
//! write path is [`ScyllaTransformedStore::batch_write`], which chunks the
//! row group into prepared batches and retries transient failures with
//! exponential backoff. Success is only reported once every chunk has been
//! acknowledged at the session's consistency level.

use std::collections::HashMap;

use async_trait::async_trait;
use chaingraph_common::{
    models::{
        encode_address,
        rows::{change_summary, RowOp},
        transformed::{
            AddressRelationRow, AddressRow, ClusterRelationRow, ClusterRow, ConfigurationRow,
            ExchangeRateRow, SummaryStatisticsRow, TokenConfigurationRow, UpdaterHistoryRow,
            UpdaterStatusRow,
        },
        SchemaType,
    },
    storage::{StorageError, TransformedGateway},
    Address, AddressId, BlockId, ClusterId, TxId,
};
use futures::future::try_join_all;
use num_bigint::BigInt;
use scylla::batch::Batch;
use scylla::frame::value::{CqlTimestamp, ValueList};
use tracing::{debug, instrument};

use crate::{
    map_parse_error, map_query_error,
    retry::{with_retry, RetryPolicy},
    session::StoreSession,
    values::{
        cql_to_ts, ts_to_cql, AddressRelationRowDb, AddressRowDb, ClusterRelationRowDb,
        ClusterRowDb, TxReferenceUdt,
    },
};

const INSERT_ADDRESS: &str = "INSERT INTO address (address_id_group, address_id, address, \
    cluster_id, total_received, total_spent, total_tokens_received, total_tokens_spent, \
    first_tx_id, last_tx_id, no_incoming_txs, no_outgoing_txs, no_incoming_txs_zero_value, \
    no_outgoing_txs_zero_value, in_degree, out_degree, in_degree_zero_value, \
    out_degree_zero_value, is_contract) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);";

const SELECT_ADDRESS: &str = "SELECT address_id_group, address_id, address, cluster_id, \
    total_received, total_spent, total_tokens_received, total_tokens_spent, first_tx_id, \
    last_tx_id, no_incoming_txs, no_outgoing_txs, no_incoming_txs_zero_value, \
    no_outgoing_txs_zero_value, in_degree, out_degree, in_degree_zero_value, \
    out_degree_zero_value, is_contract \
    FROM address WHERE address_id_group = ? AND address_id = ?;";

const INSERT_CLUSTER: &str = "INSERT INTO cluster (cluster_id_group, cluster_id, no_addresses, \
    total_received, total_spent, first_tx_id, last_tx_id, no_incoming_txs, no_outgoing_txs, \
    no_incoming_txs_zero_value, no_outgoing_txs_zero_value, in_degree, out_degree, \
    in_degree_zero_value, out_degree_zero_value) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);";

const SELECT_CLUSTER: &str = "SELECT cluster_id_group, cluster_id, no_addresses, \
    total_received, total_spent, first_tx_id, last_tx_id, no_incoming_txs, no_outgoing_txs, \
    no_incoming_txs_zero_value, no_outgoing_txs_zero_value, in_degree, out_degree, \
    in_degree_zero_value, out_degree_zero_value \
    FROM cluster WHERE cluster_id_group = ? AND cluster_id = ?;";

const INSERT_OUTGOING_RELATION: &str = "INSERT INTO address_outgoing_relations \
    (src_address_id_group, src_address_id_secondary_group, src_address_id, dst_address_id, \
    no_transactions, value, token_values) VALUES (?, ?, ?, ?, ?, ?, ?);";

const INSERT_INCOMING_RELATION: &str = "INSERT INTO address_incoming_relations \
    (dst_address_id_group, dst_address_id_secondary_group, src_address_id, dst_address_id, \
    no_transactions, value, token_values) VALUES (?, ?, ?, ?, ?, ?, ?);";

/// Store adapter for one transformed keyspace.
pub struct ScyllaTransformedStore {
    session: StoreSession,
    config: ConfigurationRow,
    schema_type: SchemaType,
    write_batch_size: usize,
    retry: RetryPolicy,
}

impl ScyllaTransformedStore {
    pub fn new(
        session: StoreSession,
        config: ConfigurationRow,
        schema_type: SchemaType,
        write_batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self { session, config, schema_type, write_batch_size, retry }
    }

    /// Reads the `configuration` row before the store itself can exist;
    /// everything else on this adapter depends on it.
    pub async fn load_configuration(
        session: &StoreSession,
    ) -> Result<Option<ConfigurationRow>, StorageError> {
        let result = session
            .session
            .query(
                "SELECT keyspace_name, bucket_size, tx_bucket_size, block_bucket_size, \
                 relation_secondary_shards, address_prefix_length, tx_prefix_length, \
                 fiat_currencies FROM configuration WHERE keyspace_name = ?;",
                (session.keyspace(),),
            )
            .await
            .map_err(map_query_error)?;
        let Some(row) = result.rows.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };
        let (
            keyspace_name,
            bucket_size,
            tx_bucket_size,
            block_bucket_size,
            relation_secondary_shards,
            address_prefix_length,
            tx_prefix_length,
            fiat_currencies,
        ) = row
            .into_typed::<(String, i32, i64, i64, i32, i32, i32, Option<Vec<String>>)>()
            .map_err(map_parse_error)?;
        Ok(Some(ConfigurationRow {
            keyspace_name,
            bucket_size,
            tx_bucket_size,
            block_bucket_size,
            relation_secondary_shards,
            address_prefix_length,
            tx_prefix_length,
            fiat_currencies: fiat_currencies.unwrap_or_default(),
        }))
    }

    /// Writes the `configuration` row; used by schema creation.
    pub async fn write_configuration(
        session: &StoreSession,
        config: &ConfigurationRow,
    ) -> Result<(), StorageError> {
        session
            .session
            .query(
                "INSERT INTO configuration (keyspace_name, bucket_size, tx_bucket_size, \
                 block_bucket_size, relation_secondary_shards, address_prefix_length, \
                 tx_prefix_length, fiat_currencies) VALUES (?, ?, ?, ?, ?, ?, ?, ?);",
                (
                    config.keyspace_name.clone(),
                    config.bucket_size,
                    config.tx_bucket_size,
                    config.block_bucket_size,
                    config.relation_secondary_shards,
                    config.address_prefix_length,
                    config.tx_prefix_length,
                    config.fiat_currencies.clone(),
                ),
            )
            .await
            .map_err(map_query_error)?;
        Ok(())
    }

    pub fn configuration(&self) -> &ConfigurationRow {
        &self.config
    }

    fn fiat_count(&self) -> usize {
        self.config.fiat_currencies.len()
    }

    fn schema_type(&self) -> SchemaType {
        self.schema_type
    }

    fn address_group(&self, id: AddressId) -> i32 {
        chaingraph_common::id_group(id as i64, self.config.bucket_size as i64) as i32
    }

    async fn write_rows<V: ValueList>(
        &self,
        statement: &str,
        rows: Vec<V>,
    ) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut batch = Batch::default();
        for _ in 0..rows.len() {
            batch.append_statement(statement);
        }
        let prepared = self
            .session
            .session
            .prepare_batch(&batch)
            .await
            .map_err(map_query_error)?;
        let rows: Vec<_> = rows
            .into_iter()
            .map(scylla::serialize::row::ValueListAdapter)
            .collect();
        self.session
            .session
            .batch(&prepared, rows)
            .await
            .map_err(map_query_error)?;
        Ok(())
    }

    /// Applies one chunk, grouped into homogeneous prepared batches per
    /// table. Status/history rows are always written last within a chunk.
    async fn write_chunk(&self, ops: &[RowOp]) -> Result<(), StorageError> {
        let mut exchange_rates = Vec::new();
        let mut id_by_prefix = Vec::new();
        let mut id_by_group = Vec::new();
        let mut addresses = Vec::new();
        let mut address_txs = Vec::new();
        let mut address_txs_secondary = Vec::new();
        let mut incoming_relations = Vec::new();
        let mut incoming_secondary = Vec::new();
        let mut outgoing_relations = Vec::new();
        let mut outgoing_secondary = Vec::new();
        let mut balances = Vec::new();
        let mut tx_by_prefix = Vec::new();
        let mut tx_by_group = Vec::new();
        let mut block_txs = Vec::new();
        let mut clusters = Vec::new();
        let mut cluster_addresses = Vec::new();
        let mut cluster_in_rel = Vec::new();
        let mut cluster_out_rel = Vec::new();
        let mut cluster_txs = Vec::new();
        let mut summary = Vec::new();
        let mut status = Vec::new();
        let mut history = Vec::new();

        for op in ops {
            match op {
                RowOp::ExchangeRate(r) => {
                    exchange_rates.push((r.block_id, r.fiat_values.clone()));
                }
                RowOp::AddressIdByPrefix(r) => {
                    id_by_prefix.push((r.address_prefix.clone(), r.address.clone(), r.address_id));
                }
                RowOp::AddressIdByGroup(r) => {
                    id_by_group.push((r.address_id_group, r.address_id, r.address.clone()));
                }
                RowOp::Address(r) => addresses.push(AddressRowDb::from_model(r)),
                RowOp::AddressTransaction(r) => {
                    address_txs.push((
                        r.address_id_group,
                        r.address_id_secondary_group,
                        r.address_id,
                        r.currency.clone(),
                        r.is_outgoing,
                        r.transaction_id,
                        TxReferenceUdt::from(r.tx_reference),
                        r.value.clone(),
                    ));
                }
                RowOp::AddressTransactionsSecondaryIds(r) => {
                    address_txs_secondary.push((r.id_group, r.max_secondary_id));
                }
                RowOp::AddressIncomingRelation(r) => {
                    incoming_relations.push(AddressRelationRowDb::from_model(r));
                }
                RowOp::AddressIncomingRelationsSecondaryIds(r) => {
                    incoming_secondary.push((r.id_group, r.max_secondary_id));
                }
                RowOp::AddressOutgoingRelation(r) => {
                    outgoing_relations.push(AddressRelationRowDb::from_model(r));
                }
                RowOp::AddressOutgoingRelationsSecondaryIds(r) => {
                    outgoing_secondary.push((r.id_group, r.max_secondary_id));
                }
                RowOp::Balance(r) => {
                    balances.push((
                        r.address_id_group,
                        r.address_id,
                        r.currency.clone(),
                        r.balance.clone(),
                    ));
                }
                RowOp::TxIdByPrefix(r) => {
                    tx_by_prefix.push((
                        r.transaction_prefix.clone(),
                        r.transaction.clone(),
                        r.transaction_id,
                    ));
                }
                RowOp::TxIdByGroup(r) => {
                    tx_by_group.push((r.transaction_id_group, r.transaction_id, r.transaction.clone()));
                }
                RowOp::BlockTransactions(r) => {
                    block_txs.push((r.block_id_group, r.block_id, r.txs.clone()));
                }
                RowOp::Cluster(r) => clusters.push(ClusterRowDb::from_model(r)),
                RowOp::ClusterAddress(r) => {
                    cluster_addresses.push((r.cluster_id_group, r.cluster_id, r.address_id));
                }
                RowOp::ClusterIncomingRelation(r) => {
                    cluster_in_rel.push(ClusterRelationRowDb::from_model(r));
                }
                RowOp::ClusterOutgoingRelation(r) => {
                    cluster_out_rel.push(ClusterRelationRowDb::from_model(r));
                }
                RowOp::ClusterTransaction(r) => {
                    cluster_txs.push((
                        r.cluster_id_group,
                        r.cluster_id,
                        r.transaction_id,
                        r.is_outgoing,
                        r.value.clone(),
                    ));
                }
                RowOp::SummaryStatistics(r) => {
                    summary.push((
                        r.id,
                        r.timestamp,
                        r.no_blocks,
                        r.no_transactions,
                        r.no_addresses,
                        r.no_address_relations,
                        r.no_clusters,
                        r.no_cluster_relations,
                    ));
                }
                RowOp::UpdaterStatus(r) => {
                    status.push((
                        r.keyspace_name.clone(),
                        r.last_synced_block,
                        ts_to_cql(r.last_synced_block_timestamp),
                        r.highest_address_id,
                        ts_to_cql(r.timestamp),
                        r.write_new,
                        r.write_dirty,
                        r.runtime_seconds,
                    ));
                }
                RowOp::UpdaterHistory(r) => {
                    history.push((
                        r.last_synced_block,
                        ts_to_cql(r.last_synced_block_timestamp),
                        r.highest_address_id,
                        ts_to_cql(r.timestamp),
                        r.write_new,
                        r.write_dirty,
                        r.runtime_seconds,
                    ));
                }
            }
        }

        self.write_rows(
            "INSERT INTO exchange_rates (block_id, fiat_values) VALUES (?, ?);",
            exchange_rates,
        )
        .await?;
        self.write_rows(
            "INSERT INTO address_ids_by_address_prefix (address_prefix, address, address_id) \
             VALUES (?, ?, ?);",
            id_by_prefix,
        )
        .await?;
        self.write_rows(
            "INSERT INTO address_ids_by_address_id_group (address_id_group, address_id, address) \
             VALUES (?, ?, ?);",
            id_by_group,
        )
        .await?;
        self.write_rows(INSERT_ADDRESS, addresses).await?;
        self.write_rows(
            "INSERT INTO address_transactions (address_id_group, address_id_secondary_group, \
             address_id, currency, is_outgoing, transaction_id, tx_reference, value) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?);",
            address_txs,
        )
        .await?;
        self.write_rows(
            "INSERT INTO address_transactions_secondary_ids (address_id_group, max_secondary_id) \
             VALUES (?, ?);",
            address_txs_secondary,
        )
        .await?;
        self.write_rows(INSERT_INCOMING_RELATION, incoming_relations)
            .await?;
        self.write_rows(
            "INSERT INTO address_incoming_relations_secondary_ids (dst_address_id_group, \
             max_secondary_id) VALUES (?, ?);",
            incoming_secondary,
        )
        .await?;
        self.write_rows(INSERT_OUTGOING_RELATION, outgoing_relations)
            .await?;
        self.write_rows(
            "INSERT INTO address_outgoing_relations_secondary_ids (src_address_id_group, \
             max_secondary_id) VALUES (?, ?);",
            outgoing_secondary,
        )
        .await?;
        self.write_rows(
            "INSERT INTO balance (address_id_group, address_id, currency, balance) \
             VALUES (?, ?, ?, ?);",
            balances,
        )
        .await?;
        self.write_rows(
            "INSERT INTO transaction_ids_by_transaction_prefix (transaction_prefix, transaction, \
             transaction_id) VALUES (?, ?, ?);",
            tx_by_prefix,
        )
        .await?;
        self.write_rows(
            "INSERT INTO transaction_ids_by_transaction_id_group (transaction_id_group, \
             transaction_id, transaction) VALUES (?, ?, ?);",
            tx_by_group,
        )
        .await?;
        self.write_rows(
            "INSERT INTO block_transactions (block_id_group, block_id, txs) VALUES (?, ?, ?);",
            block_txs,
        )
        .await?;
        self.write_rows(INSERT_CLUSTER, clusters).await?;
        self.write_rows(
            "INSERT INTO cluster_addresses (cluster_id_group, cluster_id, address_id) \
             VALUES (?, ?, ?);",
            cluster_addresses,
        )
        .await?;
        self.write_rows(
            "INSERT INTO cluster_incoming_relations (dst_cluster_id_group, dst_cluster_id, \
             src_cluster_id, no_transactions, value) VALUES (?, ?, ?, ?, ?);",
            cluster_in_rel
                .into_iter()
                .map(|r| {
                    (r.partition_id_group, r.dst_cluster_id, r.src_cluster_id, r.no_transactions, r.value)
                })
                .collect::<Vec<_>>(),
        )
        .await?;
        self.write_rows(
            "INSERT INTO cluster_outgoing_relations (src_cluster_id_group, src_cluster_id, \
             dst_cluster_id, no_transactions, value) VALUES (?, ?, ?, ?, ?);",
            cluster_out_rel
                .into_iter()
                .map(|r| {
                    (r.partition_id_group, r.src_cluster_id, r.dst_cluster_id, r.no_transactions, r.value)
                })
                .collect::<Vec<_>>(),
        )
        .await?;
        self.write_rows(
            "INSERT INTO cluster_transactions (cluster_id_group, cluster_id, transaction_id, \
             is_outgoing, value) VALUES (?, ?, ?, ?, ?);",
            cluster_txs,
        )
        .await?;
        self.write_rows(
            "INSERT INTO summary_statistics (id, timestamp, no_blocks, no_transactions, \
             no_addresses, no_address_relations, no_clusters, no_cluster_relations) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?);",
            summary,
        )
        .await?;
        self.write_rows(
            "INSERT INTO delta_updater_status (keyspace_name, last_synced_block, \
             last_synced_block_timestamp, highest_address_id, timestamp, write_new, write_dirty, \
             runtime_seconds) VALUES (?, ?, ?, ?, ?, ?, ?, ?);",
            status,
        )
        .await?;
        self.write_rows(
            "INSERT INTO delta_updater_history (last_synced_block, last_synced_block_timestamp, \
             highest_address_id, timestamp, write_new, write_dirty, runtime_seconds) \
             VALUES (?, ?, ?, ?, ?, ?, ?);",
            history,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TransformedGateway for ScyllaTransformedStore {
    fn keyspace(&self) -> &str {
        self.session.keyspace()
    }

    async fn get_configuration(&self) -> Result<Option<ConfigurationRow>, StorageError> {
        Ok(Some(self.config.clone()))
    }

    #[instrument(skip(self))]
    async fn get_updater_status(&self) -> Result<Option<UpdaterStatusRow>, StorageError> {
        let result = self
            .session
            .session
            .query(
                "SELECT keyspace_name, last_synced_block, last_synced_block_timestamp, \
                 highest_address_id, timestamp, write_new, write_dirty, runtime_seconds \
                 FROM delta_updater_status WHERE keyspace_name = ?;",
                (self.session.keyspace(),),
            )
            .await
            .map_err(map_query_error)?;
        let Some(row) = result.rows.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };
        let (ks, block, block_ts, highest, ts, write_new, write_dirty, runtime) = row
            .into_typed::<(
                String,
                i64,
                CqlTimestamp,
                i32,
                CqlTimestamp,
                Option<bool>,
                Option<bool>,
                Option<i32>,
            )>()
            .map_err(map_parse_error)?;
        Ok(Some(UpdaterStatusRow {
            keyspace_name: ks,
            last_synced_block: block,
            last_synced_block_timestamp: cql_to_ts(block_ts),
            highest_address_id: highest,
            timestamp: cql_to_ts(ts),
            write_new: write_new.unwrap_or(false),
            write_dirty: write_dirty.unwrap_or(false),
            runtime_seconds: runtime.unwrap_or(0),
        }))
    }

    #[instrument(skip(self))]
    async fn get_updater_history(&self) -> Result<Vec<UpdaterHistoryRow>, StorageError> {
        let result = self
            .session
            .session
            .query(
                "SELECT last_synced_block, last_synced_block_timestamp, highest_address_id, \
                 timestamp, write_new, write_dirty, runtime_seconds FROM delta_updater_history;",
                &[],
            )
            .await
            .map_err(map_query_error)?;
        let mut rows = Vec::new();
        for row in result.rows.unwrap_or_default() {
            let (block, block_ts, highest, ts, write_new, write_dirty, runtime) = row
                .into_typed::<(
                    i64,
                    CqlTimestamp,
                    i32,
                    CqlTimestamp,
                    Option<bool>,
                    Option<bool>,
                    Option<i32>,
                )>()
                .map_err(map_parse_error)?;
            rows.push(UpdaterHistoryRow {
                last_synced_block: block,
                last_synced_block_timestamp: cql_to_ts(block_ts),
                highest_address_id: highest,
                timestamp: cql_to_ts(ts),
                write_new: write_new.unwrap_or(false),
                write_dirty: write_dirty.unwrap_or(false),
                runtime_seconds: runtime.unwrap_or(0),
            });
        }
        rows.sort_by_key(|r| r.last_synced_block);
        Ok(rows)
    }

    async fn get_highest_address_id(&self) -> Result<Option<AddressId>, StorageError> {
        if let Some(status) = self.get_updater_status().await? {
            return Ok(Some(status.highest_address_id));
        }
        // ids are dense, so the full-transform count determines the highest
        Ok(self
            .get_summary_statistics()
            .await?
            .filter(|s| s.no_addresses > 0)
            .map(|s| (s.no_addresses - 1) as AddressId))
    }

    async fn get_highest_cluster_id(&self) -> Result<Option<ClusterId>, StorageError> {
        Ok(self
            .get_summary_statistics()
            .await?
            .filter(|s| s.no_clusters > 0)
            .map(|s| (s.no_clusters - 1) as ClusterId))
    }

    async fn get_highest_transaction_id(&self) -> Result<Option<TxId>, StorageError> {
        Ok(self
            .get_summary_statistics()
            .await?
            .filter(|s| s.no_transactions > 0)
            .map(|s| s.no_transactions - 1))
    }

    #[instrument(skip_all, fields(n = addresses.len()))]
    async fn get_address_ids(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, AddressId>, StorageError> {
        let schema_type = self.schema_type();
        let prefix_len = self.config.address_prefix_length as usize;
        let queries = addresses.iter().map(|address| {
            let session = self.session.session.clone();
            let prefix = chaingraph_common::address_prefix(
                &encode_address(schema_type, address),
                prefix_len,
            );
            let address = address.clone();
            async move {
                let result = session
                    .query(
                        "SELECT address_id FROM address_ids_by_address_prefix \
                         WHERE address_prefix = ? AND address = ?;",
                        (prefix, address.clone()),
                    )
                    .await
                    .map_err(map_query_error)?;
                let id = match result.rows.unwrap_or_default().into_iter().next() {
                    Some(row) => Some(
                        row.into_typed::<(i32,)>()
                            .map_err(map_parse_error)?
                            .0,
                    ),
                    None => None,
                };
                Ok::<_, StorageError>((address, id))
            }
        });
        Ok(try_join_all(queries)
            .await?
            .into_iter()
            .filter_map(|(address, id)| id.map(|id| (address, id)))
            .collect())
    }

    #[instrument(skip_all, fields(n = ids.len()))]
    async fn get_addresses_by_id(
        &self,
        ids: &[AddressId],
    ) -> Result<HashMap<AddressId, AddressRow>, StorageError> {
        let fiat_count = self.fiat_count();
        let queries = ids.iter().map(|id| {
            let session = self.session.session.clone();
            let group = self.address_group(*id);
            let id = *id;
            async move {
                let result = session
                    .query(SELECT_ADDRESS, (group, id))
                    .await
                    .map_err(map_query_error)?;
                let row = match result.rows.unwrap_or_default().into_iter().next() {
                    Some(row) => Some(
                        row.into_typed::<AddressRowDb>()
                            .map_err(map_parse_error)?,
                    ),
                    None => None,
                };
                Ok::<_, StorageError>((id, row))
            }
        });
        Ok(try_join_all(queries)
            .await?
            .into_iter()
            .filter_map(|(id, row)| row.map(|r| (id, r.into_model(fiat_count))))
            .collect())
    }

    #[instrument(skip_all, fields(n = ids.len()))]
    async fn get_clusters(
        &self,
        ids: &[ClusterId],
    ) -> Result<HashMap<ClusterId, ClusterRow>, StorageError> {
        let fiat_count = self.fiat_count();
        let queries = ids.iter().map(|id| {
            let session = self.session.session.clone();
            let group = self.address_group(*id);
            let id = *id;
            async move {
                let result = session
                    .query(SELECT_CLUSTER, (group, id))
                    .await
                    .map_err(map_query_error)?;
                let row = match result.rows.unwrap_or_default().into_iter().next() {
                    Some(row) => Some(
                        row.into_typed::<ClusterRowDb>()
                            .map_err(map_parse_error)?,
                    ),
                    None => None,
                };
                Ok::<_, StorageError>((id, row))
            }
        });
        Ok(try_join_all(queries)
            .await?
            .into_iter()
            .filter_map(|(id, row)| row.map(|r| (id, r.into_model(fiat_count))))
            .collect())
    }

    #[instrument(skip_all, fields(n = pairs.len()))]
    async fn get_outgoing_relations(
        &self,
        pairs: &[(AddressId, AddressId)],
    ) -> Result<HashMap<(AddressId, AddressId), AddressRelationRow>, StorageError> {
        let fiat_count = self.fiat_count();
        let shards = self.config.relation_secondary_shards;
        let queries = pairs.iter().map(|(src, dst)| {
            let session = self.session.session.clone();
            let group = self.address_group(*src);
            let secondary = chaingraph_common::secondary_group(*src as i64, shards);
            let (src, dst) = (*src, *dst);
            async move {
                let result = session
                    .query(
                        "SELECT src_address_id_group, src_address_id_secondary_group, \
                         src_address_id, dst_address_id, no_transactions, value, token_values \
                         FROM address_outgoing_relations WHERE src_address_id_group = ? AND \
                         src_address_id_secondary_group = ? AND src_address_id = ? AND \
                         dst_address_id = ?;",
                        (group, secondary, src, dst),
                    )
                    .await
                    .map_err(map_query_error)?;
                let row = match result.rows.unwrap_or_default().into_iter().next() {
                    Some(row) => Some(
                        row.into_typed::<AddressRelationRowDb>()
                            .map_err(map_parse_error)?,
                    ),
                    None => None,
                };
                Ok::<_, StorageError>(((src, dst), row))
            }
        });
        Ok(try_join_all(queries)
            .await?
            .into_iter()
            .filter_map(|(key, row)| row.map(|r| (key, r.into_model(fiat_count))))
            .collect())
    }

    #[instrument(skip_all, fields(n = pairs.len()))]
    async fn get_incoming_relations(
        &self,
        pairs: &[(AddressId, AddressId)],
    ) -> Result<HashMap<(AddressId, AddressId), AddressRelationRow>, StorageError> {
        let fiat_count = self.fiat_count();
        let shards = self.config.relation_secondary_shards;
        let queries = pairs.iter().map(|(src, dst)| {
            let session = self.session.session.clone();
            let group = self.address_group(*dst);
            let secondary = chaingraph_common::secondary_group(*dst as i64, shards);
            let (src, dst) = (*src, *dst);
            async move {
                let result = session
                    .query(
                        "SELECT dst_address_id_group, dst_address_id_secondary_group, \
                         src_address_id, dst_address_id, no_transactions, value, token_values \
                         FROM address_incoming_relations WHERE dst_address_id_group = ? AND \
                         dst_address_id_secondary_group = ? AND dst_address_id = ? AND \
                         src_address_id = ?;",
                        (group, secondary, dst, src),
                    )
                    .await
                    .map_err(map_query_error)?;
                let row = match result.rows.unwrap_or_default().into_iter().next() {
                    Some(row) => Some(
                        row.into_typed::<AddressRelationRowDb>()
                            .map_err(map_parse_error)?,
                    ),
                    None => None,
                };
                Ok::<_, StorageError>(((src, dst), row))
            }
        });
        Ok(try_join_all(queries)
            .await?
            .into_iter()
            .filter_map(|(key, row)| row.map(|r| (key, r.into_model(fiat_count))))
            .collect())
    }

    #[instrument(skip(self))]
    async fn list_outgoing_relations(
        &self,
        src: AddressId,
    ) -> Result<Vec<AddressRelationRow>, StorageError> {
        let fiat_count = self.fiat_count();
        let group = self.address_group(src);
        let secondary = chaingraph_common::secondary_group(src as i64, self.config.relation_secondary_shards);
        let result = self
            .session
            .session
            .query(
                "SELECT src_address_id_group, src_address_id_secondary_group, src_address_id, \
                 dst_address_id, no_transactions, value, token_values \
                 FROM address_outgoing_relations WHERE src_address_id_group = ? AND \
                 src_address_id_secondary_group = ? AND src_address_id = ?;",
                (group, secondary, src),
            )
            .await
            .map_err(map_query_error)?;
        let mut rows = Vec::new();
        for row in result.rows.unwrap_or_default() {
            rows.push(
                row.into_typed::<AddressRelationRowDb>()
                    .map_err(map_parse_error)?
                    .into_model(fiat_count),
            );
        }
        Ok(rows)
    }

    #[instrument(skip_all, fields(n = pairs.len()))]
    async fn get_cluster_outgoing_relations(
        &self,
        pairs: &[(ClusterId, ClusterId)],
    ) -> Result<HashMap<(ClusterId, ClusterId), ClusterRelationRow>, StorageError> {
        let fiat_count = self.fiat_count();
        let queries = pairs.iter().map(|(src, dst)| {
            let session = self.session.session.clone();
            let group = self.address_group(*src);
            let (src, dst) = (*src, *dst);
            async move {
                let result = session
                    .query(
                        "SELECT src_cluster_id_group, src_cluster_id, dst_cluster_id, \
                         no_transactions, value FROM cluster_outgoing_relations \
                         WHERE src_cluster_id_group = ? AND src_cluster_id = ? AND \
                         dst_cluster_id = ?;",
                        (group, src, dst),
                    )
                    .await
                    .map_err(map_query_error)?;
                let row = match result.rows.unwrap_or_default().into_iter().next() {
                    Some(row) => Some(
                        row.into_typed::<ClusterRelationRowDb>()
                            .map_err(map_parse_error)?,
                    ),
                    None => None,
                };
                Ok::<_, StorageError>(((src, dst), row))
            }
        });
        Ok(try_join_all(queries)
            .await?
            .into_iter()
            .filter_map(|(key, row)| row.map(|r| (key, r.into_model(fiat_count))))
            .collect())
    }

    #[instrument(skip_all, fields(n = pairs.len()))]
    async fn get_cluster_incoming_relations(
        &self,
        pairs: &[(ClusterId, ClusterId)],
    ) -> Result<HashMap<(ClusterId, ClusterId), ClusterRelationRow>, StorageError> {
        let fiat_count = self.fiat_count();
        let queries = pairs.iter().map(|(src, dst)| {
            let session = self.session.session.clone();
            let group = self.address_group(*dst);
            let (src, dst) = (*src, *dst);
            async move {
                let result = session
                    .query(
                        "SELECT dst_cluster_id_group, src_cluster_id, dst_cluster_id, \
                         no_transactions, value FROM cluster_incoming_relations \
                         WHERE dst_cluster_id_group = ? AND dst_cluster_id = ? AND \
                         src_cluster_id = ?;",
                        (group, dst, src),
                    )
                    .await
                    .map_err(map_query_error)?;
                let row = match result.rows.unwrap_or_default().into_iter().next() {
                    Some(row) => Some(
                        row.into_typed::<ClusterRelationRowDb>()
                            .map_err(map_parse_error)?,
                    ),
                    None => None,
                };
                Ok::<_, StorageError>(((src, dst), row))
            }
        });
        Ok(try_join_all(queries)
            .await?
            .into_iter()
            .filter_map(|(key, row)| row.map(|r| (key, r.into_model(fiat_count))))
            .collect())
    }

    #[instrument(skip_all, fields(n = ids.len()))]
    async fn get_balances(
        &self,
        ids: &[AddressId],
    ) -> Result<HashMap<(AddressId, String), BigInt>, StorageError> {
        let queries = ids.iter().map(|id| {
            let session = self.session.session.clone();
            let group = self.address_group(*id);
            let id = *id;
            async move {
                let result = session
                    .query(
                        "SELECT currency, balance FROM balance \
                         WHERE address_id_group = ? AND address_id = ?;",
                        (group, id),
                    )
                    .await
                    .map_err(map_query_error)?;
                let mut balances = Vec::new();
                for row in result.rows.unwrap_or_default() {
                    let (currency, balance) = row
                        .into_typed::<(String, Option<BigInt>)>()
                        .map_err(map_parse_error)?;
                    balances.push(((id, currency), balance.unwrap_or_default()));
                }
                Ok::<_, StorageError>(balances)
            }
        });
        Ok(try_join_all(queries)
            .await?
            .into_iter()
            .flatten()
            .collect())
    }

    #[instrument(skip_all, fields(n = hashes.len()))]
    async fn get_transaction_ids(
        &self,
        hashes: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, TxId>, StorageError> {
        let prefix_len = self.config.tx_prefix_length as usize;
        let queries = hashes.iter().map(|hash| {
            let session = self.session.session.clone();
            let prefix = chaingraph_common::address_prefix(&hex::encode(hash), prefix_len);
            let hash = hash.clone();
            async move {
                let result = session
                    .query(
                        "SELECT transaction_id FROM transaction_ids_by_transaction_prefix \
                         WHERE transaction_prefix = ? AND transaction = ?;",
                        (prefix, hash.clone()),
                    )
                    .await
                    .map_err(map_query_error)?;
                let id = match result.rows.unwrap_or_default().into_iter().next() {
                    Some(row) => Some(
                        row.into_typed::<(i64,)>()
                            .map_err(map_parse_error)?
                            .0,
                    ),
                    None => None,
                };
                Ok::<_, StorageError>((hash, id))
            }
        });
        Ok(try_join_all(queries)
            .await?
            .into_iter()
            .filter_map(|(hash, id)| id.map(|id| (hash, id)))
            .collect())
    }

    async fn get_exchange_rate(
        &self,
        block_id: BlockId,
    ) -> Result<Option<ExchangeRateRow>, StorageError> {
        let result = self
            .session
            .session
            .query("SELECT fiat_values FROM exchange_rates WHERE block_id = ?;", (block_id,))
            .await
            .map_err(map_query_error)?;
        let Some(row) = result.rows.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };
        let (fiat_values,) = row
            .into_typed::<(Option<Vec<f32>>,)>()
            .map_err(map_parse_error)?;
        Ok(Some(ExchangeRateRow { block_id, fiat_values: fiat_values.unwrap_or_default() }))
    }

    async fn get_summary_statistics(&self) -> Result<Option<SummaryStatisticsRow>, StorageError> {
        let result = self
            .session
            .session
            .query(
                "SELECT id, timestamp, no_blocks, no_transactions, no_addresses, \
                 no_address_relations, no_clusters, no_cluster_relations \
                 FROM summary_statistics WHERE id = 0;",
                &[],
            )
            .await
            .map_err(map_query_error)?;
        let Some(row) = result.rows.unwrap_or_default().into_iter().next() else {
            return Ok(None);
        };
        let (id, timestamp, blocks, txs, addresses, relations, clusters, cluster_relations) = row
            .into_typed::<(
                i32,
                Option<i64>,
                Option<i64>,
                Option<i64>,
                Option<i64>,
                Option<i64>,
                Option<i64>,
                Option<i64>,
            )>()
            .map_err(map_parse_error)?;
        Ok(Some(SummaryStatisticsRow {
            id,
            timestamp: timestamp.unwrap_or(0),
            no_blocks: blocks.unwrap_or(0),
            no_transactions: txs.unwrap_or(0),
            no_addresses: addresses.unwrap_or(0),
            no_address_relations: relations.unwrap_or(0),
            no_clusters: clusters.unwrap_or(0),
            no_cluster_relations: cluster_relations.unwrap_or(0),
        }))
    }

    #[instrument(skip(self))]
    async fn get_token_configurations(&self) -> Result<Vec<TokenConfigurationRow>, StorageError> {
        if self.schema_type() != SchemaType::Account {
            return Ok(Vec::new());
        }
        let result = self
            .session
            .session
            .query(
                "SELECT currency_ticker, token_address, peg_currency, decimals \
                 FROM token_configuration;",
                &[],
            )
            .await
            .map_err(map_query_error)?;
        let mut tokens = Vec::new();
        for row in result.rows.unwrap_or_default() {
            let (ticker, address, peg, decimals) = row
                .into_typed::<(String, Vec<u8>, Option<String>, Option<i32>)>()
                .map_err(map_parse_error)?;
            tokens.push(TokenConfigurationRow {
                currency_ticker: ticker,
                token_address: address,
                peg_currency: peg.unwrap_or_default(),
                decimals: decimals.unwrap_or(0),
            });
        }
        Ok(tokens)
    }

    #[instrument(skip_all, fields(rows = ops.len()))]
    async fn batch_write(&self, ops: Vec<RowOp>) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }
        debug!(summary = change_summary(&ops), "Applying change set");
        for chunk in ops.chunks(self.write_batch_size.max(1)) {
            with_retry(&self.retry, "batch_write", || self.write_chunk(chunk)).await?;
        }
        Ok(())
    }
}
