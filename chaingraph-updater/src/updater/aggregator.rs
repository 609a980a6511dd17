//! Folds projected deltas into the final row group of one batch.
//!
//! The aggregator compresses per-transaction deltas, resolves ids through
//! the allocator, reads the current rows of every touched address, cluster,
//! relation and balance in batched store calls, applies the deltas (all
//! increments, no subtraction) and emits the complete `Vec<RowOp>` in a
//! deterministic order, so a retried batch writes identical rows.
//!
//! Replay safety: a crash after the data write but before the status row
//! leaves rows that already contain this batch. Such rows are recognized
//! by their tx watermark (`last_tx_id` at or past the delta's) and are
//! re-emitted unchanged instead of merged again, which keeps the replayed
//! write byte-identical to the first one.

use std::collections::{HashMap, HashSet};

use chaingraph_common::{
    id_group,
    models::{
        delta::{CurrencyValue, DbDelta, EntityDelta, NO_TX_ID},
        encode_address,
        rows::RowOp,
        transformed::{
            AddressIdByGroupRow, AddressIdByPrefixRow, AddressRelationRow, AddressRow,
            AddressTransactionRow, BalanceRow, BlockTransactionsRow, ClusterAddressRow,
            ClusterRelationRow, ClusterRow, ClusterTransactionRow, ConfigurationRow,
            SecondaryGroupRow, TxIdByGroupRow, TxIdByPrefixRow,
        },
        SchemaType,
    },
    secondary_group,
    storage::TransformedGateway,
    Address, AddressId, ClusterId, TxId,
};
use num_bigint::BigInt;
use num_traits::Zero;
use tracing::{debug, instrument, warn};

use crate::updater::{ids::IdAllocator, utxo::UnionFind, ProjectionOutput, UpdateError};

/// Row-count deltas of one batch, feeding the summary statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub new_addresses: u64,
    pub new_clusters: u64,
    pub new_address_relations: u64,
    pub new_cluster_relations: u64,
    pub transactions: u64,
}

pub struct AggregationResult {
    pub ops: Vec<RowOp>,
    pub stats: BatchStats,
}

pub struct Aggregator<'a> {
    transformed: &'a dyn TransformedGateway,
    config: &'a ConfigurationRow,
    schema_type: SchemaType,
    native_ticker: String,
}

impl<'a> Aggregator<'a> {
    pub fn new(
        transformed: &'a dyn TransformedGateway,
        config: &'a ConfigurationRow,
        schema_type: SchemaType,
        native_ticker: &str,
    ) -> Self {
        Self { transformed, config, schema_type, native_ticker: native_ticker.to_string() }
    }

    fn group(&self, id: i64) -> i32 {
        id_group(id, self.config.bucket_size as i64) as i32
    }

    fn secondary(&self, id: i64) -> i32 {
        secondary_group(id, self.config.relation_secondary_shards)
    }

    fn fiat_count(&self) -> usize {
        self.config.fiat_currencies.len()
    }

    fn max_secondary(&self) -> i32 {
        self.config.relation_secondary_shards.max(1) - 1
    }

    /// Produces the complete, ordered row group of one batch (everything
    /// except exchange-rate and bookkeeping rows, which the coordinator
    /// attaches).
    #[instrument(skip_all, fields(txs = projection.tx_count))]
    pub async fn aggregate(
        &self,
        projection: &ProjectionOutput,
        allocator: &mut IdAllocator,
        new_tx_assignments: &[(Vec<u8>, TxId)],
    ) -> Result<AggregationResult, UpdateError> {
        let delta = DbDelta::merge(projection.per_tx.clone());
        let mut stats = BatchStats { transactions: projection.tx_count, ..Default::default() };
        let initial_highest_address_id = allocator.highest_address_id();

        // every address the batch touches, in assignment order
        let address_order = self.complete_address_order(projection, &delta);
        let existing_ids = self
            .transformed
            .get_address_ids(&address_order)
            .await?;
        let assigned = allocator.assign_address_ids(&address_order, &existing_ids)?;

        let resolve = |address: &Address| -> Result<AddressId, UpdateError> {
            assigned.get(address).copied().ok_or_else(|| {
                UpdateError::InvariantViolation(format!(
                    "address without id after assignment: {}",
                    hex::encode(address)
                ))
            })
        };

        // current state of every touched address row
        let all_ids: Vec<AddressId> = {
            let mut ids: Vec<AddressId> = assigned.values().copied().collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        };
        let current_rows = self
            .transformed
            .get_addresses_by_id(&all_ids)
            .await?;

        // ids drawn past the pre-batch high-water mark are new; the rule
        // holds on replay, where the index rows already exist. Pinned
        // pseudo-address ids are never counted.
        stats.new_addresses = assigned
            .values()
            .filter(|id| **id > initial_highest_address_id)
            .count() as u64;

        // addresses whose stored row already includes this batch's txs
        let folded: HashSet<AddressId> = delta
            .entity_updates
            .iter()
            .filter_map(|update| {
                let id = *assigned.get(&update.identifier)?;
                let row = current_rows.get(&id)?;
                (update.last_tx_id != NO_TX_ID && row.last_tx_id >= update.last_tx_id)
                    .then_some(id)
            })
            .collect();
        if !folded.is_empty() {
            warn!(
                addresses = folded.len(),
                "Stored rows already cover this batch, replaying idempotently"
            );
        }

        let mut ops: Vec<RowOp> = Vec::new();

        // index rows for newly assigned ids (pinned pseudo-addresses get
        // theirs on first sighting)
        let mut new_id_rows: Vec<(AddressId, &Address)> = Vec::new();
        for address in &address_order {
            let id = resolve(address)?;
            if id > initial_highest_address_id ||
                (id == 0 && !existing_ids.contains_key(address))
            {
                new_id_rows.push((id, address));
            }
        }
        new_id_rows.sort_by_key(|(id, _)| *id);
        for (address_id, address) in &new_id_rows {
            let encoded = encode_address(self.schema_type, address);
            ops.push(RowOp::AddressIdByPrefix(AddressIdByPrefixRow {
                address_prefix: chaingraph_common::address_prefix(
                    &encoded,
                    self.config.address_prefix_length as usize,
                ),
                address: (*address).clone(),
                address_id: *address_id,
            }));
            ops.push(RowOp::AddressIdByGroup(AddressIdByGroupRow {
                address_id_group: self.group(*address_id as i64),
                address_id: *address_id,
                address: (*address).clone(),
            }));
        }

        // dense tx-id index rows (account ledgers)
        let mut tx_assignments = new_tx_assignments.to_vec();
        tx_assignments.sort_by_key(|(_, id)| *id);
        for (hash, tx_id) in &tx_assignments {
            ops.push(RowOp::TxIdByPrefix(TxIdByPrefixRow {
                transaction_prefix: chaingraph_common::address_prefix(
                    &hex::encode(hash),
                    self.config.tx_prefix_length as usize,
                ),
                transaction: hash.clone(),
                transaction_id: *tx_id,
            }));
            ops.push(RowOp::TxIdByGroup(TxIdByGroupRow {
                transaction_id_group: id_group(*tx_id, self.config.tx_bucket_size),
                transaction_id: *tx_id,
                transaction: hash.clone(),
            }));
        }

        // relations: read both directions, repair missing twins, count new
        // pairs toward degrees
        let mut relation_pairs: Vec<(AddressId, AddressId)> = Vec::new();
        for update in &delta.relation_updates {
            relation_pairs
                .push((resolve(&update.src_identifier)?, resolve(&update.dst_identifier)?));
        }
        let outgoing = self
            .transformed
            .get_outgoing_relations(&relation_pairs)
            .await?;
        let incoming = self
            .transformed
            .get_incoming_relations(&relation_pairs)
            .await?;

        let mut new_rel_out: HashMap<AddressId, i32> = HashMap::new();
        let mut new_rel_in: HashMap<AddressId, i32> = HashMap::new();
        let mut new_rel_out_zero: HashMap<AddressId, i32> = HashMap::new();
        let mut new_rel_in_zero: HashMap<AddressId, i32> = HashMap::new();
        let mut relation_rows: Vec<(AddressId, AddressId, AddressRelationRow)> = Vec::new();

        for (update, (src, dst)) in delta.relation_updates.iter().zip(&relation_pairs) {
            let out_row = outgoing.get(&(*src, *dst));
            let in_row = incoming.get(&(*src, *dst));
            if out_row.is_some() != in_row.is_some() {
                warn!(src, dst, "Asymmetric address relation found, rewriting both directions");
            }
            let current = out_row.or(in_row);
            // both endpoints folded ⇒ the stored relation row already
            // contains this batch (rows of one batch are written together)
            let replayed =
                current.is_some() && folded.contains(src) && folded.contains(dst);

            let merged = match current {
                Some(row) if replayed => row.clone(),
                Some(row) => {
                    let mut merged = row.clone();
                    merged.no_transactions += update.no_transactions;
                    merged.value.merge(&update.value);
                    for (asset, value) in &update.token_values {
                        match merged.token_values.get_mut(asset) {
                            Some(existing) => existing.merge(value),
                            None => {
                                merged.token_values.insert(asset.clone(), value.clone());
                            }
                        }
                    }
                    merged
                }
                None => AddressRelationRow {
                    partition_id_group: 0,
                    partition_secondary_group: 0,
                    src_address_id: *src,
                    dst_address_id: *dst,
                    no_transactions: update.no_transactions,
                    value: update.value.clone(),
                    token_values: update.token_values.clone(),
                },
            };

            let created_this_batch = current.is_none() ||
                (replayed && current.map(|c| c.no_transactions) == Some(update.no_transactions));
            if created_this_batch {
                stats.new_address_relations += 2;
                if current.is_none() {
                    *new_rel_out.entry(*src).or_default() += 1;
                    *new_rel_in.entry(*dst).or_default() += 1;
                    if update.value.value.is_zero() {
                        *new_rel_out_zero.entry(*src).or_default() += 1;
                        *new_rel_in_zero.entry(*dst).or_default() += 1;
                    }
                }
            }
            relation_rows.push((*src, *dst, merged));
        }

        relation_rows.sort_by_key(|(src, dst, _)| (self.group(*src as i64), *src, *dst));
        let mut touched_out_groups: HashSet<i32> = HashSet::new();
        let mut touched_in_groups: HashSet<i32> = HashSet::new();
        for (src, dst, row) in &relation_rows {
            let mut out_row = row.clone();
            out_row.partition_id_group = self.group(*src as i64);
            out_row.partition_secondary_group = self.secondary(*src as i64);
            touched_out_groups.insert(out_row.partition_id_group);
            ops.push(RowOp::AddressOutgoingRelation(out_row));

            let mut in_row = row.clone();
            in_row.partition_id_group = self.group(*dst as i64);
            in_row.partition_secondary_group = self.secondary(*dst as i64);
            touched_in_groups.insert(in_row.partition_id_group);
            ops.push(RowOp::AddressIncomingRelation(in_row));
        }
        let mut out_groups: Vec<i32> = touched_out_groups.into_iter().collect();
        out_groups.sort_unstable();
        for group in out_groups {
            ops.push(RowOp::AddressOutgoingRelationsSecondaryIds(SecondaryGroupRow {
                id_group: group,
                max_secondary_id: self.max_secondary(),
            }));
        }
        let mut in_groups: Vec<i32> = touched_in_groups.into_iter().collect();
        in_groups.sort_unstable();
        for group in in_groups {
            ops.push(RowOp::AddressIncomingRelationsSecondaryIds(SecondaryGroupRow {
                id_group: group,
                max_secondary_id: self.max_secondary(),
            }));
        }

        // per-address transaction list (pure upserts, replay-safe as-is)
        let mut tx_rows: Vec<AddressTransactionRow> = Vec::new();
        let mut touched_tx_groups: HashSet<i32> = HashSet::new();
        for entity_tx in &delta.new_entity_txs {
            if entity_tx.tx_id == NO_TX_ID {
                continue;
            }
            let address_id = resolve(&entity_tx.identifier)?;
            let group = self.group(address_id as i64);
            touched_tx_groups.insert(group);
            let base = AddressTransactionRow {
                address_id_group: group,
                address_id_secondary_group: self.secondary(address_id as i64),
                address_id,
                currency: self.native_ticker.clone(),
                is_outgoing: entity_tx.is_outgoing,
                transaction_id: entity_tx.tx_id,
                tx_reference: entity_tx.tx_reference,
                value: entity_tx.value.clone(),
            };
            if entity_tx.token_values.is_empty() {
                tx_rows.push(base);
            } else {
                let mut assets: Vec<(&String, &BigInt)> =
                    entity_tx.token_values.iter().collect();
                assets.sort_by_key(|(asset, _)| (*asset).clone());
                for (asset, value) in assets {
                    let mut row = base.clone();
                    row.currency = asset.clone();
                    row.value = value.clone();
                    tx_rows.push(row);
                }
            }
        }
        tx_rows.sort_by(|a, b| {
            (a.address_id_group, a.address_id, a.is_outgoing, &a.currency, a.transaction_id)
                .cmp(&(
                    b.address_id_group,
                    b.address_id,
                    b.is_outgoing,
                    &b.currency,
                    b.transaction_id,
                ))
        });
        for row in tx_rows {
            ops.push(RowOp::AddressTransaction(row));
        }
        let mut tx_groups: Vec<i32> = touched_tx_groups.into_iter().collect();
        tx_groups.sort_unstable();
        for group in tx_groups {
            ops.push(RowOp::AddressTransactionsSecondaryIds(SecondaryGroupRow {
                id_group: group,
                max_secondary_id: self.max_secondary(),
            }));
        }

        // clusters before addresses: new addresses need their cluster id
        let cluster_context = if self.schema_type == SchemaType::Utxo {
            Some(
                self.aggregate_clusters(ClusterInputs {
                    projection,
                    delta: &delta,
                    address_order: &address_order,
                    existing_ids: &existing_ids,
                    assigned: &assigned,
                    folded: &folded,
                    allocator,
                    stats: &mut stats,
                    ops: &mut ops,
                })
                .await?,
            )
        } else {
            None
        };

        // address rows: apply deltas absolute, or re-emit folded rows
        let mut address_rows: Vec<AddressRow> = Vec::new();
        for update in &delta.entity_updates {
            let address_id = resolve(&update.identifier)?;
            if folded.contains(&address_id) {
                if let Some(row) = current_rows.get(&address_id) {
                    address_rows.push(row.clone());
                    continue;
                }
            }
            let row = self.merge_address_row(
                update,
                address_id,
                current_rows.get(&address_id),
                cluster_context
                    .as_ref()
                    .and_then(|c| c.cluster_of.get(&address_id).copied()),
                &new_rel_in,
                &new_rel_out,
                &new_rel_in_zero,
                &new_rel_out_zero,
            );
            address_rows.push(row);
        }
        address_rows.sort_by_key(|r| (r.address_id_group, r.address_id));
        for row in address_rows {
            ops.push(RowOp::Address(row));
        }

        // balances (account ledgers)
        if self.schema_type == SchemaType::Account {
            let mut balance_ids: Vec<AddressId> = delta
                .balance_updates
                .iter()
                .map(|b| resolve(&b.identifier))
                .collect::<Result<_, _>>()?;
            balance_ids.sort_unstable();
            balance_ids.dedup();
            let current = self.transformed.get_balances(&balance_ids).await?;

            let mut balance_rows: Vec<BalanceRow> = Vec::new();
            for update in &delta.balance_updates {
                let address_id = resolve(&update.identifier)?;
                let replayed = folded.contains(&address_id);
                let mut assets: Vec<(&String, &BigInt)> = update.asset_balances.iter().collect();
                assets.sort_by_key(|(asset, _)| (*asset).clone());
                for (asset, change) in assets {
                    let stored = current
                        .get(&(address_id, asset.clone()))
                        .cloned()
                        .unwrap_or_default();
                    let balance = if replayed { stored } else { stored + change };
                    balance_rows.push(BalanceRow {
                        address_id_group: self.group(address_id as i64),
                        address_id,
                        currency: asset.clone(),
                        balance,
                    });
                }
            }
            balance_rows.sort_by(|a, b| {
                (a.address_id_group, a.address_id, &a.currency)
                    .cmp(&(b.address_id_group, b.address_id, &b.currency))
            });
            for row in balance_rows {
                ops.push(RowOp::Balance(row));
            }
        }

        // block → tx list
        for (block_id, txs) in &projection.block_txs {
            ops.push(RowOp::BlockTransactions(BlockTransactionsRow {
                block_id_group: id_group(*block_id, self.config.block_bucket_size),
                block_id: *block_id,
                txs: txs.clone(),
            }));
        }

        debug!(
            rows = ops.len(),
            new_addresses = stats.new_addresses,
            new_clusters = stats.new_clusters,
            "Aggregated batch"
        );
        Ok(AggregationResult { ops, stats })
    }

    /// Assignment order plus any address that only shows up in relation or
    /// balance deltas (e.g. a fee-paying miner without own transfers).
    fn complete_address_order(
        &self,
        projection: &ProjectionOutput,
        delta: &DbDelta<Address>,
    ) -> Vec<Address> {
        let mut order = projection.address_order.clone();
        let mut seen: HashSet<Address> = order.iter().cloned().collect();
        let mut stragglers: Vec<Address> = Vec::new();
        {
            let mut add = |address: &Address| {
                if seen.insert(address.clone()) {
                    stragglers.push(address.clone());
                }
            };
            for update in &delta.entity_updates {
                add(&update.identifier);
            }
            for update in &delta.relation_updates {
                add(&update.src_identifier);
                add(&update.dst_identifier);
            }
            for update in &delta.balance_updates {
                add(&update.identifier);
            }
            for tx in &delta.new_entity_txs {
                add(&tx.identifier);
            }
        }
        stragglers.sort_unstable();
        order.extend(stragglers);
        order
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_address_row(
        &self,
        update: &EntityDelta<Address>,
        address_id: AddressId,
        current: Option<&AddressRow>,
        cluster_id: Option<ClusterId>,
        new_rel_in: &HashMap<AddressId, i32>,
        new_rel_out: &HashMap<AddressId, i32>,
        new_rel_in_zero: &HashMap<AddressId, i32>,
        new_rel_out_zero: &HashMap<AddressId, i32>,
    ) -> AddressRow {
        let mut merged = update.clone();
        if let Some(row) = current {
            merged.merge(&EntityDelta {
                identifier: update.identifier.clone(),
                total_received: row.total_received.clone(),
                total_spent: row.total_spent.clone(),
                total_tokens_received: row.total_tokens_received.clone(),
                total_tokens_spent: row.total_tokens_spent.clone(),
                first_tx_id: row.first_tx_id,
                last_tx_id: row.last_tx_id,
                no_incoming_txs: row.no_incoming_txs,
                no_outgoing_txs: row.no_outgoing_txs,
                no_incoming_txs_zero_value: row.no_incoming_txs_zero_value,
                no_outgoing_txs_zero_value: row.no_outgoing_txs_zero_value,
                is_contract: row.is_contract,
            });
        }

        AddressRow {
            address_id_group: self.group(address_id as i64),
            address_id,
            address: update.identifier.clone(),
            cluster_id: current.and_then(|r| r.cluster_id).or(cluster_id),
            total_received: merged.total_received,
            total_spent: merged.total_spent,
            total_tokens_received: merged.total_tokens_received,
            total_tokens_spent: merged.total_tokens_spent,
            first_tx_id: merged.first_tx_id,
            last_tx_id: merged.last_tx_id,
            no_incoming_txs: merged.no_incoming_txs,
            no_outgoing_txs: merged.no_outgoing_txs,
            no_incoming_txs_zero_value: merged.no_incoming_txs_zero_value,
            no_outgoing_txs_zero_value: merged.no_outgoing_txs_zero_value,
            in_degree: current.map(|r| r.in_degree).unwrap_or(0) +
                new_rel_in.get(&address_id).copied().unwrap_or(0),
            out_degree: current.map(|r| r.out_degree).unwrap_or(0) +
                new_rel_out.get(&address_id).copied().unwrap_or(0),
            in_degree_zero_value: current.map(|r| r.in_degree_zero_value).unwrap_or(0) +
                new_rel_in_zero.get(&address_id).copied().unwrap_or(0),
            out_degree_zero_value: current.map(|r| r.out_degree_zero_value).unwrap_or(0) +
                new_rel_out_zero.get(&address_id).copied().unwrap_or(0),
            is_contract: merged.is_contract,
        }
    }

    async fn aggregate_clusters(
        &self,
        inputs: ClusterInputs<'_>,
    ) -> Result<ClusterContext, UpdateError> {
        let ClusterInputs {
            projection,
            delta,
            address_order,
            existing_ids,
            assigned,
            folded,
            allocator,
            stats,
            ops,
        } = inputs;
        let initial_highest_cluster_id = allocator.highest_cluster_id();

        // union all input addresses of each multi-input transaction over
        // batch-local compacted indices
        let mut index_of: HashMap<&Address, usize> = HashMap::new();
        for (i, address) in address_order.iter().enumerate() {
            index_of.insert(address, i);
        }
        let mut uf = UnionFind::new(address_order.len());
        for group in &projection.cluster_inputs {
            let mut indices = group.iter().filter_map(|a| index_of.get(a).copied());
            let Some(first) = indices.next() else { continue };
            for next in indices {
                uf.union(first, next);
            }
        }

        // existing cluster assignments of already-known member addresses
        let known_ids: Vec<AddressId> = address_order
            .iter()
            .filter_map(|a| existing_ids.get(a).copied())
            .collect();
        let known_rows = self
            .transformed
            .get_addresses_by_id(&known_ids)
            .await?;
        let cluster_of_existing: HashMap<AddressId, ClusterId> = known_rows
            .iter()
            .filter_map(|(id, row)| row.cluster_id.map(|c| (*id, c)))
            .collect();
        for cluster_id in cluster_of_existing.values() {
            allocator.observe_cluster_id(*cluster_id);
        }

        // pick the cluster of each component: lowest existing member
        // cluster wins, otherwise a fresh id in component-first-seen order
        let mut component_cluster: HashMap<usize, ClusterId> = HashMap::new();
        for address in address_order {
            let root = uf.find(index_of[address]);
            if let Some(existing_cluster) = existing_ids
                .get(address)
                .and_then(|id| cluster_of_existing.get(id))
            {
                match component_cluster.get_mut(&root) {
                    None => {
                        component_cluster.insert(root, *existing_cluster);
                    }
                    Some(chosen) if chosen != existing_cluster => {
                        // ids are never reassigned; the candidate merge is
                        // only reported
                        warn!(
                            cluster_a = *chosen,
                            cluster_b = *existing_cluster,
                            "Transaction joins two existing clusters, keeping both"
                        );
                        *chosen = (*chosen).min(*existing_cluster);
                    }
                    Some(_) => {}
                }
            }
        }
        let mut new_cluster_members: HashMap<ClusterId, Vec<AddressId>> = HashMap::new();
        let mut cluster_of: HashMap<AddressId, ClusterId> = cluster_of_existing.clone();
        for address in address_order {
            let Some(address_id) = assigned.get(address).copied() else { continue };
            if cluster_of.contains_key(&address_id) {
                continue;
            }
            let root = uf.find(index_of[address]);
            let cluster = match component_cluster.get(&root) {
                Some(cluster) => *cluster,
                None => {
                    let fresh = allocator.consume_cluster_id();
                    component_cluster.insert(root, fresh);
                    fresh
                }
            };
            cluster_of.insert(address_id, cluster);
            new_cluster_members
                .entry(cluster)
                .or_default()
                .push(address_id);
        }
        stats.new_clusters = cluster_of
            .values()
            .filter(|c| **c > initial_highest_cluster_id)
            .collect::<HashSet<_>>()
            .len() as u64;

        // project the address delta onto clusters and merge with stored
        // cluster rows
        let cluster_delta = delta.map_identifiers(|a| {
            assigned
                .get(a)
                .and_then(|id| cluster_of.get(id))
                .copied()
                .unwrap_or_default()
        });
        // a cluster is covered by a replayed batch when every touched
        // member address is
        let folded_clusters: HashSet<ClusterId> = cluster_delta
            .entity_updates
            .iter()
            .filter_map(|update| {
                let members: Vec<AddressId> = cluster_of
                    .iter()
                    .filter(|(_, c)| **c == update.identifier)
                    .map(|(a, _)| *a)
                    .collect();
                (!members.is_empty() && members.iter().all(|m| folded.contains(m)))
                    .then_some(update.identifier)
            })
            .collect();

        let touched: Vec<ClusterId> = cluster_delta
            .entity_updates
            .iter()
            .map(|u| u.identifier)
            .collect();
        let current_clusters = self.transformed.get_clusters(&touched).await?;

        // cluster relations, twin-written like address relations
        let out_pairs: Vec<(ClusterId, ClusterId)> = cluster_delta
            .relation_updates
            .iter()
            .map(|u| (u.src_identifier, u.dst_identifier))
            .collect();
        let out_rows = self
            .transformed
            .get_cluster_outgoing_relations(&out_pairs)
            .await?;
        let in_rows = self
            .transformed
            .get_cluster_incoming_relations(&out_pairs)
            .await?;

        let mut new_rel_out: HashMap<ClusterId, i32> = HashMap::new();
        let mut new_rel_in: HashMap<ClusterId, i32> = HashMap::new();
        let mut new_rel_out_zero: HashMap<ClusterId, i32> = HashMap::new();
        let mut new_rel_in_zero: HashMap<ClusterId, i32> = HashMap::new();

        let mut relation_rows: Vec<(ClusterId, ClusterId, ClusterRelationRow)> = Vec::new();
        for update in &cluster_delta.relation_updates {
            let key = (update.src_identifier, update.dst_identifier);
            let current = out_rows.get(&key).or_else(|| in_rows.get(&key));
            let replayed = current.is_some() &&
                folded_clusters.contains(&key.0) &&
                folded_clusters.contains(&key.1);
            let merged = match current {
                Some(row) if replayed => row.clone(),
                Some(row) => {
                    let mut merged = row.clone();
                    merged.no_transactions += update.no_transactions;
                    merged.value.merge(&update.value);
                    merged
                }
                None => ClusterRelationRow {
                    partition_id_group: 0,
                    src_cluster_id: key.0,
                    dst_cluster_id: key.1,
                    no_transactions: update.no_transactions,
                    value: update.value.clone(),
                },
            };
            let created_this_batch = current.is_none() ||
                (replayed && current.map(|c| c.no_transactions) == Some(update.no_transactions));
            if created_this_batch {
                stats.new_cluster_relations += 2;
                if current.is_none() {
                    *new_rel_out.entry(key.0).or_default() += 1;
                    *new_rel_in.entry(key.1).or_default() += 1;
                    if update.value.value.is_zero() {
                        *new_rel_out_zero.entry(key.0).or_default() += 1;
                        *new_rel_in_zero.entry(key.1).or_default() += 1;
                    }
                }
            }
            relation_rows.push((key.0, key.1, merged));
        }
        relation_rows.sort_by_key(|(src, dst, _)| (self.group(*src as i64), *src, *dst));
        for (src, dst, row) in &relation_rows {
            let mut out_row = row.clone();
            out_row.partition_id_group = self.group(*src as i64);
            ops.push(RowOp::ClusterOutgoingRelation(out_row));
            let mut in_row = row.clone();
            in_row.partition_id_group = self.group(*dst as i64);
            ops.push(RowOp::ClusterIncomingRelation(in_row));
        }

        // cluster transaction list: member flows folded per cluster
        let mut cluster_tx_values: HashMap<(ClusterId, TxId), BigInt> = HashMap::new();
        for entity_tx in &cluster_delta.new_entity_txs {
            if entity_tx.tx_id == NO_TX_ID {
                continue;
            }
            *cluster_tx_values
                .entry((entity_tx.identifier, entity_tx.tx_id))
                .or_default() += &entity_tx.value;
        }
        let mut cluster_tx_rows: Vec<((ClusterId, TxId), BigInt)> =
            cluster_tx_values.into_iter().collect();
        cluster_tx_rows.sort_by_key(|((cluster, tx), _)| (*cluster, *tx));
        for ((cluster_id, tx_id), value) in cluster_tx_rows {
            ops.push(RowOp::ClusterTransaction(ClusterTransactionRow {
                cluster_id_group: self.group(cluster_id as i64),
                cluster_id,
                transaction_id: tx_id,
                is_outgoing: value < BigInt::zero(),
                value,
            }));
        }

        // cluster summary rows
        let mut cluster_rows: Vec<ClusterRow> = Vec::new();
        for update in &cluster_delta.entity_updates {
            let cluster_id = update.identifier;
            let current = current_clusters.get(&cluster_id);
            if folded_clusters.contains(&cluster_id) {
                if let Some(row) = current {
                    cluster_rows.push(row.clone());
                    continue;
                }
            }
            let mut merged = update.clone();
            if let Some(row) = current {
                merged.merge(&EntityDelta {
                    identifier: cluster_id,
                    total_received: row.total_received.clone(),
                    total_spent: row.total_spent.clone(),
                    total_tokens_received: HashMap::new(),
                    total_tokens_spent: HashMap::new(),
                    first_tx_id: row.first_tx_id,
                    last_tx_id: row.last_tx_id,
                    no_incoming_txs: row.no_incoming_txs,
                    no_outgoing_txs: row.no_outgoing_txs,
                    no_incoming_txs_zero_value: row.no_incoming_txs_zero_value,
                    no_outgoing_txs_zero_value: row.no_outgoing_txs_zero_value,
                    is_contract: false,
                });
            }
            let new_members = new_cluster_members
                .get(&cluster_id)
                .map(|m| m.len() as i32)
                .unwrap_or(0);
            cluster_rows.push(ClusterRow {
                cluster_id_group: self.group(cluster_id as i64),
                cluster_id,
                no_addresses: current.map(|r| r.no_addresses).unwrap_or(0) + new_members,
                total_received: merged.total_received,
                total_spent: merged.total_spent,
                first_tx_id: merged.first_tx_id,
                last_tx_id: merged.last_tx_id,
                no_incoming_txs: merged.no_incoming_txs,
                no_outgoing_txs: merged.no_outgoing_txs,
                no_incoming_txs_zero_value: merged.no_incoming_txs_zero_value,
                no_outgoing_txs_zero_value: merged.no_outgoing_txs_zero_value,
                in_degree: current.map(|r| r.in_degree).unwrap_or(0) +
                    new_rel_in.get(&cluster_id).copied().unwrap_or(0),
                out_degree: current.map(|r| r.out_degree).unwrap_or(0) +
                    new_rel_out.get(&cluster_id).copied().unwrap_or(0),
                in_degree_zero_value: current.map(|r| r.in_degree_zero_value).unwrap_or(0) +
                    new_rel_in_zero.get(&cluster_id).copied().unwrap_or(0),
                out_degree_zero_value: current.map(|r| r.out_degree_zero_value).unwrap_or(0) +
                    new_rel_out_zero.get(&cluster_id).copied().unwrap_or(0),
            });
        }
        cluster_rows.sort_by_key(|r| (r.cluster_id_group, r.cluster_id));
        for row in cluster_rows {
            ops.push(RowOp::Cluster(row));
        }

        // membership rows for new addresses
        let mut membership: Vec<(ClusterId, AddressId)> = new_cluster_members
            .iter()
            .flat_map(|(cluster, members)| members.iter().map(move |m| (*cluster, *m)))
            .collect();
        membership.sort_unstable();
        for (cluster_id, address_id) in membership {
            ops.push(RowOp::ClusterAddress(ClusterAddressRow {
                cluster_id_group: self.group(cluster_id as i64),
                cluster_id,
                address_id,
            }));
        }

        Ok(ClusterContext { cluster_of })
    }
}

struct ClusterInputs<'b> {
    projection: &'b ProjectionOutput,
    delta: &'b DbDelta<Address>,
    address_order: &'b [Address],
    existing_ids: &'b HashMap<Address, AddressId>,
    assigned: &'b HashMap<Address, AddressId>,
    folded: &'b HashSet<AddressId>,
    allocator: &'b mut IdAllocator,
    stats: &'b mut BatchStats,
    ops: &'b mut Vec<RowOp>,
}

struct ClusterContext {
    cluster_of: HashMap<AddressId, ClusterId>,
}

#[cfg(test)]
mod tests {
    use chaingraph_common::models::delta::EntityTx;

    use super::*;
    use crate::testing::{test_configuration, InMemoryTransformedStore};

    fn entity(update: &str, spent: i64, received: i64, tx_id: TxId) -> EntityDelta<Address> {
        EntityDelta {
            identifier: update.as_bytes().to_vec(),
            total_received: CurrencyValue::convert(received, &[1.0, 1.0], 0),
            total_spent: CurrencyValue::convert(spent, &[1.0, 1.0], 0),
            total_tokens_received: HashMap::new(),
            total_tokens_spent: HashMap::new(),
            first_tx_id: tx_id,
            last_tx_id: tx_id,
            no_incoming_txs: i32::from(received > 0),
            no_outgoing_txs: i32::from(spent > 0),
            no_incoming_txs_zero_value: 0,
            no_outgoing_txs_zero_value: 0,
            is_contract: false,
        }
    }

    fn address_row(id: AddressId, address: &str) -> AddressRow {
        AddressRow {
            address_id_group: 0,
            address_id: id,
            address: address.as_bytes().to_vec(),
            cluster_id: None,
            total_received: CurrencyValue::convert(10, &[1.0, 1.0], 0),
            total_spent: CurrencyValue::convert(10, &[1.0, 1.0], 0),
            total_tokens_received: HashMap::new(),
            total_tokens_spent: HashMap::new(),
            first_tx_id: 1,
            last_tx_id: 1,
            no_incoming_txs: 1,
            no_outgoing_txs: 1,
            no_incoming_txs_zero_value: 0,
            no_outgoing_txs_zero_value: 0,
            in_degree: 1,
            out_degree: 1,
            in_degree_zero_value: 0,
            out_degree_zero_value: 0,
            is_contract: false,
        }
    }

    /// A stored outgoing row without its incoming twin is a repairable
    /// divergence: the present side seeds the merge and both directions
    /// are rewritten with identical aggregates.
    #[tokio::test]
    async fn missing_relation_twin_is_repaired() {
        let store = InMemoryTransformedStore::new("eth_transformed");
        store
            .batch_write(vec![
                RowOp::AddressIdByPrefix(AddressIdByPrefixRow {
                    address_prefix: "a".into(),
                    address: b"a".to_vec(),
                    address_id: 1,
                }),
                RowOp::AddressIdByPrefix(AddressIdByPrefixRow {
                    address_prefix: "b".into(),
                    address: b"b".to_vec(),
                    address_id: 2,
                }),
                RowOp::Address(address_row(1, "a")),
                RowOp::Address(address_row(2, "b")),
                RowOp::AddressOutgoingRelation(AddressRelationRow {
                    partition_id_group: 0,
                    partition_secondary_group: 0,
                    src_address_id: 1,
                    dst_address_id: 2,
                    no_transactions: 1,
                    value: CurrencyValue::convert(10, &[1.0, 1.0], 0),
                    token_values: HashMap::new(),
                }),
            ])
            .await
            .unwrap();

        let projection = ProjectionOutput {
            per_tx: vec![DbDelta {
                entity_updates: vec![entity("a", 5, 0, 9), entity("b", 0, 5, 9)],
                new_entity_txs: vec![
                    EntityTx {
                        identifier: b"a".to_vec(),
                        tx_id: 9,
                        is_outgoing: true,
                        value: BigInt::from(-5),
                        token_values: HashMap::new(),
                        tx_reference: Default::default(),
                    },
                ],
                relation_updates: vec![
                    chaingraph_common::models::delta::RelationDelta {
                        src_identifier: b"a".to_vec(),
                        dst_identifier: b"b".to_vec(),
                        no_transactions: 1,
                        value: CurrencyValue::convert(5, &[1.0, 1.0], 0),
                        token_values: HashMap::new(),
                    },
                ],
                balance_updates: vec![],
            }],
            address_order: vec![b"a".to_vec(), b"b".to_vec()],
            cluster_inputs: vec![],
            tx_hashes_in_order: vec![],
            block_txs: vec![],
            tx_count: 1,
        };

        let config = test_configuration("eth_transformed");
        let aggregator = Aggregator::new(&store, &config, SchemaType::Account, "ETH");
        let mut allocator = IdAllocator::new(Some(2), None, Some(8));
        let result = aggregator
            .aggregate(&projection, &mut allocator, &[])
            .await
            .unwrap();

        let out = result
            .ops
            .iter()
            .find_map(|op| match op {
                RowOp::AddressOutgoingRelation(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        let inc = result
            .ops
            .iter()
            .find_map(|op| match op {
                RowOp::AddressIncomingRelation(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();

        assert_eq!(out.no_transactions, 2);
        assert_eq!(out.value.value, BigInt::from(15));
        assert_eq!(inc.no_transactions, out.no_transactions);
        assert_eq!(inc.value, out.value);
        // the pair already existed, so no degree is added
        assert_eq!(result.stats.new_address_relations, 0);
    }
}
