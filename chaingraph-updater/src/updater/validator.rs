//! Cross-checks: pedantic pre-write validation and sampled re-derivation.

use std::collections::{HashMap, HashSet};

use chaingraph_common::{
    models::{
        delta::{DbDelta, EntityDelta},
        rows::RowOp,
        transformed::ConfigurationRow,
        SchemaType,
    },
    storage::{RawGateway, TransformedGateway},
    Address, AddressId, TxId,
};
use rand::Rng;
use tracing::{info, instrument, warn};

use crate::updater::{account, rates::RateSlice, utxo, UpdateError};

/// One mismatch between stored and re-derived state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub address_id: AddressId,
    pub field: &'static str,
    pub expected: String,
    pub got: String,
}

impl std::fmt::Display for Divergence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "address {}: {} expected {}, got {}",
            self.address_id, self.field, self.expected, self.got
        )
    }
}

/// Pre-write sanity checks of one batch's row group against the store.
/// Mirrors the aggregation invariants: one row per address/cluster, new
/// ids unused, aggregates never shrink, relation twins symmetric.
#[instrument(skip_all, fields(rows = ops.len()))]
pub async fn validate_changes(
    transformed: &dyn TransformedGateway,
    ops: &[RowOp],
) -> Result<(), UpdateError> {
    let mut seen_addresses: HashSet<AddressId> = HashSet::new();
    let mut seen_clusters: HashSet<i32> = HashSet::new();
    let mut outgoing: HashMap<(AddressId, AddressId), (i32, num_bigint::BigInt)> = HashMap::new();
    let mut incoming: HashMap<(AddressId, AddressId), (i32, num_bigint::BigInt)> = HashMap::new();

    let address_ids: Vec<AddressId> = ops
        .iter()
        .filter_map(|op| match op {
            RowOp::Address(r) => Some(r.address_id),
            _ => None,
        })
        .collect();
    let current = transformed.get_addresses_by_id(&address_ids).await?;

    let index_rows: Vec<(Address, AddressId)> = ops
        .iter()
        .filter_map(|op| match op {
            RowOp::AddressIdByPrefix(r) => Some((r.address.clone(), r.address_id)),
            _ => None,
        })
        .collect();
    let indexed_addresses: Vec<Address> =
        index_rows.iter().map(|(a, _)| a.clone()).collect();
    let already_known = transformed
        .get_address_ids(&indexed_addresses)
        .await?;
    // ids assigned to addresses the store has never seen must be unused;
    // replayed batches re-emit their index rows and are exempt
    let new_ids: Vec<AddressId> = index_rows
        .iter()
        .filter(|(address, _)| !already_known.contains_key(address))
        .map(|(_, id)| *id)
        .collect();

    for op in ops {
        match op {
            RowOp::Address(row) => {
                if !seen_addresses.insert(row.address_id) {
                    return Err(UpdateError::InvariantViolation(format!(
                        "two address rows for id {} in one batch",
                        row.address_id
                    )));
                }
                if let Some(stored) = current.get(&row.address_id) {
                    let shrank = stored.no_incoming_txs > row.no_incoming_txs ||
                        stored.no_outgoing_txs > row.no_outgoing_txs ||
                        stored.total_received.value > row.total_received.value ||
                        stored.total_spent.value > row.total_spent.value ||
                        stored.in_degree > row.in_degree ||
                        stored.out_degree > row.out_degree;
                    if shrank {
                        return Err(UpdateError::InvariantViolation(format!(
                            "aggregates of address {} would shrink",
                            row.address_id
                        )));
                    }
                }
            }
            RowOp::Cluster(row) => {
                if !seen_clusters.insert(row.cluster_id) {
                    return Err(UpdateError::InvariantViolation(format!(
                        "two cluster rows for id {} in one batch",
                        row.cluster_id
                    )));
                }
            }
            RowOp::AddressIdByPrefix(row) => {
                if let Some(known) = already_known.get(&row.address) {
                    if *known != row.address_id {
                        return Err(UpdateError::InvariantViolation(format!(
                            "address already has id {known}, batch assigns {}",
                            row.address_id
                        )));
                    }
                }
            }
            RowOp::AddressOutgoingRelation(row) => {
                outgoing.insert(
                    (row.src_address_id, row.dst_address_id),
                    (row.no_transactions, row.value.value.clone()),
                );
            }
            RowOp::AddressIncomingRelation(row) => {
                incoming.insert(
                    (row.src_address_id, row.dst_address_id),
                    (row.no_transactions, row.value.value.clone()),
                );
            }
            _ => {}
        }
    }

    if outgoing != incoming {
        return Err(UpdateError::InvariantViolation(
            "asymmetric relation rows within one batch".into(),
        ));
    }
    // a freshly assigned id must not collide with stored aggregates
    let collisions = transformed.get_addresses_by_id(&new_ids).await?;
    if let Some(id) = collisions.keys().next() {
        return Err(UpdateError::InvariantViolation(format!(
            "newly assigned address id {id} already has an address row"
        )));
    }
    Ok(())
}

pub struct Validator<'a> {
    raw: &'a dyn RawGateway,
    transformed: &'a dyn TransformedGateway,
    config: &'a ConfigurationRow,
    schema_type: SchemaType,
    native_ticker: String,
}

impl<'a> Validator<'a> {
    pub fn new(
        raw: &'a dyn RawGateway,
        transformed: &'a dyn TransformedGateway,
        config: &'a ConfigurationRow,
        schema_type: SchemaType,
        native_ticker: &str,
    ) -> Self {
        Self { raw, transformed, config, schema_type, native_ticker: native_ticker.to_string() }
    }

    /// Re-derives the aggregates of a random address sample from the raw
    /// range `[0, H]` and compares them (native values and counters; fiat
    /// values are rate-dependent and checked by the rate-join tests).
    #[instrument(skip(self))]
    pub async fn validate_sample(
        &self,
        sample_size: usize,
        chunk_blocks: i64,
    ) -> Result<Vec<Divergence>, UpdateError> {
        let Some(status) = self.transformed.get_updater_status().await? else {
            info!("No updater status, nothing to validate");
            return Ok(Vec::new());
        };
        let last_block = status.last_synced_block;
        let highest = status.highest_address_id;
        if highest < 1 {
            return Ok(Vec::new());
        }

        let mut rng = rand::thread_rng();
        let mut sample: HashSet<AddressId> = HashSet::new();
        while sample.len() < sample_size.min(highest as usize) {
            sample.insert(rng.gen_range(1..=highest));
        }
        let sample: Vec<AddressId> = sample.into_iter().collect();
        let stored = self.transformed.get_addresses_by_id(&sample).await?;

        let targets: HashMap<Address, AddressId> = stored
            .iter()
            .map(|(id, row)| (row.address.clone(), *id))
            .collect();

        // stream the whole transformed range and fold only target deltas
        let mut derived: HashMap<AddressId, EntityDelta<Address>> = HashMap::new();
        let mut start = 0i64;
        while start <= last_block {
            let end = (start + chunk_blocks - 1).min(last_block);
            let bundles = self.raw.block_bundles(start, end).await?;
            let empty_rates = RateSlice::default();
            let projection = match self.schema_type {
                SchemaType::Utxo => utxo::project(&bundles, &empty_rates)?,
                SchemaType::Account => {
                    let hashes = account::tx_hashes_in_order(&bundles)?;
                    let mut unique = hashes.clone();
                    unique.sort_unstable();
                    unique.dedup();
                    let tx_ids: HashMap<Vec<u8>, TxId> =
                        self.transformed.get_transaction_ids(&unique).await?;
                    account::project(
                        &bundles,
                        &empty_rates,
                        &self.token_map().await?,
                        &tx_ids,
                        &self.native_ticker,
                        &self.config.fiat_currencies,
                    )?
                }
            };
            let delta = DbDelta::merge(projection.per_tx);
            for update in delta.entity_updates {
                let Some(address_id) = targets.get(&update.identifier) else { continue };
                match derived.get_mut(address_id) {
                    Some(acc) => acc.merge(&update),
                    None => {
                        derived.insert(*address_id, update);
                    }
                }
            }
            start = end + 1;
        }

        let mut divergences = Vec::new();
        for (address_id, row) in &stored {
            let check = |field: &'static str,
                         expected: String,
                         got: String,
                         divergences: &mut Vec<Divergence>| {
                if expected != got {
                    divergences.push(Divergence {
                        address_id: *address_id,
                        field,
                        expected,
                        got,
                    });
                }
            };
            match derived.get(address_id) {
                Some(delta) => {
                    check(
                        "total_received",
                        delta.total_received.value.to_string(),
                        row.total_received.value.to_string(),
                        &mut divergences,
                    );
                    check(
                        "total_spent",
                        delta.total_spent.value.to_string(),
                        row.total_spent.value.to_string(),
                        &mut divergences,
                    );
                    check(
                        "no_incoming_txs",
                        delta.no_incoming_txs.to_string(),
                        row.no_incoming_txs.to_string(),
                        &mut divergences,
                    );
                    check(
                        "no_outgoing_txs",
                        delta.no_outgoing_txs.to_string(),
                        row.no_outgoing_txs.to_string(),
                        &mut divergences,
                    );
                    check(
                        "first_tx_id",
                        delta.first_tx_id.to_string(),
                        row.first_tx_id.to_string(),
                        &mut divergences,
                    );
                    check(
                        "last_tx_id",
                        delta.last_tx_id.to_string(),
                        row.last_tx_id.to_string(),
                        &mut divergences,
                    );
                }
                None => divergences.push(Divergence {
                    address_id: *address_id,
                    field: "presence",
                    expected: "no raw activity".into(),
                    got: "stored aggregates".into(),
                }),
            }
        }

        // relation symmetry spot-check: every outgoing row of a sampled
        // address must have a matching incoming twin
        for address_id in stored.keys() {
            let outgoing = self
                .transformed
                .list_outgoing_relations(*address_id)
                .await?;
            let pairs: Vec<(AddressId, AddressId)> = outgoing
                .iter()
                .map(|r| (r.src_address_id, r.dst_address_id))
                .collect();
            let incoming = self.transformed.get_incoming_relations(&pairs).await?;
            for row in outgoing {
                let key = (row.src_address_id, row.dst_address_id);
                match incoming.get(&key) {
                    Some(twin)
                        if twin.no_transactions == row.no_transactions &&
                            twin.value.value == row.value.value => {}
                    Some(twin) => divergences.push(Divergence {
                        address_id: *address_id,
                        field: "relation_aggregates",
                        expected: format!("{}×{}", row.no_transactions, row.value.value),
                        got: format!("{}×{}", twin.no_transactions, twin.value.value),
                    }),
                    None => divergences.push(Divergence {
                        address_id: *address_id,
                        field: "relation_twin",
                        expected: format!("incoming row for ({}, {})", key.0, key.1),
                        got: "missing".into(),
                    }),
                }
            }
        }

        for divergence in &divergences {
            warn!(%divergence, "Validator found divergence");
        }
        Ok(divergences)
    }

    async fn token_map(
        &self,
    ) -> Result<
        HashMap<Address, chaingraph_common::models::transformed::TokenConfigurationRow>,
        UpdateError,
    > {
        Ok(self
            .transformed
            .get_token_configurations()
            .await?
            .into_iter()
            .map(|t| (t.token_address.clone(), t))
            .collect())
    }
}
