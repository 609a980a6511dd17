//! Batch-scoped delta algebra.
//!
//! Projectors emit one [`DbDelta`] per transaction; the aggregator folds
//! them with [`DbDelta::merge`] before any store read happens. All merge
//! operations on additive fields are associative and commutative;
//! `first_tx_id`/`last_tx_id` take min/max with a `-1` sentinel for flows
//! that belong to no transaction (block-reward traces).

use std::collections::HashMap;
use std::hash::Hash;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::TxId;

/// Placeholder tx id for flows without a transaction.
pub const NO_TX_ID: TxId = -1;

/// A monetary amount in native units plus its fiat equivalents.
///
/// The fiat vector is ordered like the keyspace's configured fiat currency
/// list; all values in one batch carry vectors of the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrencyValue {
    pub value: BigInt,
    pub fiat_values: Vec<f32>,
}

impl CurrencyValue {
    pub fn zero(fiat_count: usize) -> Self {
        Self { value: BigInt::from(0), fiat_values: vec![0.0; fiat_count] }
    }

    /// Builds a value with fiat equivalents `value × rate / 10^decimals`.
    pub fn convert(value: impl Into<BigInt>, rates: &[f32], decimals: u32) -> Self {
        let value = value.into();
        let fiat_values = convert_to_fiat(&value, rates, decimals);
        Self { value, fiat_values }
    }

    pub fn merge(&mut self, other: &CurrencyValue) {
        debug_assert_eq!(self.fiat_values.len(), other.fiat_values.len());
        self.value += &other.value;
        for (acc, v) in self.fiat_values.iter_mut().zip(other.fiat_values.iter()) {
            *acc += v;
        }
    }
}

/// Fiat equivalents of a native amount, one entry per configured currency.
pub fn convert_to_fiat(value: &BigInt, rates: &[f32], decimals: u32) -> Vec<f32> {
    let coins = value.to_f64().unwrap_or(f64::MAX) / 10f64.powi(decimals as i32);
    rates
        .iter()
        .map(|rate| (coins * *rate as f64) as f32)
        .collect()
}

fn merge_asset_maps(
    into: &mut HashMap<String, CurrencyValue>,
    other: &HashMap<String, CurrencyValue>,
) {
    for (asset, value) in other {
        match into.get_mut(asset) {
            Some(existing) => existing.merge(value),
            None => {
                into.insert(asset.clone(), value.clone());
            }
        }
    }
}

fn sentinel_min(a: TxId, b: TxId) -> TxId {
    match (a, b) {
        (NO_TX_ID, NO_TX_ID) => NO_TX_ID,
        (NO_TX_ID, y) => y,
        (x, NO_TX_ID) => x,
        (x, y) => x.min(y),
    }
}

fn sentinel_max(a: TxId, b: TxId) -> TxId {
    match (a, b) {
        (NO_TX_ID, NO_TX_ID) => NO_TX_ID,
        (NO_TX_ID, y) => y,
        (x, NO_TX_ID) => x,
        (x, y) => x.max(y),
    }
}

/// Per-entity (address or cluster) aggregate change.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDelta<K> {
    pub identifier: K,
    pub total_received: CurrencyValue,
    pub total_spent: CurrencyValue,
    pub total_tokens_received: HashMap<String, CurrencyValue>,
    pub total_tokens_spent: HashMap<String, CurrencyValue>,
    pub first_tx_id: TxId,
    pub last_tx_id: TxId,
    pub no_incoming_txs: i32,
    pub no_outgoing_txs: i32,
    pub no_incoming_txs_zero_value: i32,
    pub no_outgoing_txs_zero_value: i32,
    pub is_contract: bool,
}

impl<K: Clone> EntityDelta<K> {
    pub fn merge(&mut self, other: &EntityDelta<K>) {
        self.total_received.merge(&other.total_received);
        self.total_spent.merge(&other.total_spent);
        merge_asset_maps(&mut self.total_tokens_received, &other.total_tokens_received);
        merge_asset_maps(&mut self.total_tokens_spent, &other.total_tokens_spent);
        self.first_tx_id = sentinel_min(self.first_tx_id, other.first_tx_id);
        self.last_tx_id = sentinel_max(self.last_tx_id, other.last_tx_id);
        self.no_incoming_txs += other.no_incoming_txs;
        self.no_outgoing_txs += other.no_outgoing_txs;
        self.no_incoming_txs_zero_value += other.no_incoming_txs_zero_value;
        self.no_outgoing_txs_zero_value += other.no_outgoing_txs_zero_value;
        self.is_contract |= other.is_contract;
    }

    pub fn map_identifier<T>(&self, f: impl FnOnce(&K) -> T) -> EntityDelta<T> {
        EntityDelta {
            identifier: f(&self.identifier),
            total_received: self.total_received.clone(),
            total_spent: self.total_spent.clone(),
            total_tokens_received: self.total_tokens_received.clone(),
            total_tokens_spent: self.total_tokens_spent.clone(),
            first_tx_id: self.first_tx_id,
            last_tx_id: self.last_tx_id,
            no_incoming_txs: self.no_incoming_txs,
            no_outgoing_txs: self.no_outgoing_txs,
            no_incoming_txs_zero_value: self.no_incoming_txs_zero_value,
            no_outgoing_txs_zero_value: self.no_outgoing_txs_zero_value,
            is_contract: self.is_contract,
        }
    }
}

/// Reference into the raw structure a per-address transaction row came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxReference {
    pub trace_index: Option<i32>,
    pub log_index: Option<i32>,
}

impl TxReference {
    pub fn is_empty(&self) -> bool {
        self.trace_index.is_none() && self.log_index.is_none()
    }
}

/// One row of the per-entity transaction list.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTx<K> {
    pub identifier: K,
    pub tx_id: TxId,
    pub is_outgoing: bool,
    pub value: BigInt,
    /// Token movements of this entity within the transaction, native units.
    pub token_values: HashMap<String, BigInt>,
    pub tx_reference: TxReference,
}

impl<K> EntityTx<K> {
    pub fn map_identifier<T>(&self, f: impl FnOnce(&K) -> T) -> EntityTx<T>
    where
        K: Clone,
    {
        EntityTx {
            identifier: f(&self.identifier),
            tx_id: self.tx_id,
            is_outgoing: self.is_outgoing,
            value: self.value.clone(),
            token_values: self.token_values.clone(),
            tx_reference: self.tx_reference,
        }
    }
}

/// Directed aggregate change between two entities.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDelta<K> {
    pub src_identifier: K,
    pub dst_identifier: K,
    pub no_transactions: i32,
    pub value: CurrencyValue,
    pub token_values: HashMap<String, CurrencyValue>,
}

impl<K: Clone> RelationDelta<K> {
    pub fn merge(&mut self, other: &RelationDelta<K>) {
        self.no_transactions += other.no_transactions;
        self.value.merge(&other.value);
        merge_asset_maps(&mut self.token_values, &other.token_values);
    }

    pub fn map_identifiers<T>(&self, mut f: impl FnMut(&K) -> T) -> RelationDelta<T> {
        RelationDelta {
            src_identifier: f(&self.src_identifier),
            dst_identifier: f(&self.dst_identifier),
            no_transactions: self.no_transactions,
            value: self.value.clone(),
            token_values: self.token_values.clone(),
        }
    }
}

/// Signed per-asset balance change (account ledgers).
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDelta<K> {
    pub identifier: K,
    pub asset_balances: HashMap<String, BigInt>,
}

impl<K: Clone> BalanceDelta<K> {
    pub fn merge(&mut self, other: &BalanceDelta<K>) {
        for (asset, delta) in &other.asset_balances {
            *self
                .asset_balances
                .entry(asset.clone())
                .or_insert_with(|| BigInt::from(0)) += delta;
        }
    }
}

/// All changes of one projection unit (a transaction, or a whole batch once
/// compressed).
#[derive(Debug, Clone, PartialEq)]
pub struct DbDelta<K> {
    pub entity_updates: Vec<EntityDelta<K>>,
    pub new_entity_txs: Vec<EntityTx<K>>,
    pub relation_updates: Vec<RelationDelta<K>>,
    pub balance_updates: Vec<BalanceDelta<K>>,
}

impl<K> Default for DbDelta<K> {
    fn default() -> Self {
        Self {
            entity_updates: Vec::new(),
            new_entity_txs: Vec::new(),
            relation_updates: Vec::new(),
            balance_updates: Vec::new(),
        }
    }
}

impl<K: Clone + Eq + Hash + Ord> DbDelta<K> {
    pub fn concat(&mut self, other: DbDelta<K>) {
        self.entity_updates.extend(other.entity_updates);
        self.new_entity_txs.extend(other.new_entity_txs);
        self.relation_updates.extend(other.relation_updates);
        self.balance_updates.extend(other.balance_updates);
    }

    /// Folds a list of per-transaction deltas into one compressed delta.
    pub fn merge(change_sets: impl IntoIterator<Item = DbDelta<K>>) -> DbDelta<K> {
        let mut acc = DbDelta::default();
        for cs in change_sets {
            acc.concat(cs);
        }
        acc.compress()
    }

    /// Merges updates that share an identity and fixes the emit order so
    /// retried batches produce identical writes.
    pub fn compress(self) -> DbDelta<K> {
        let mut entities: HashMap<K, EntityDelta<K>> = HashMap::new();
        for update in self.entity_updates {
            match entities.get_mut(&update.identifier) {
                Some(acc) => acc.merge(&update),
                None => {
                    entities.insert(update.identifier.clone(), update);
                }
            }
        }
        let mut entity_updates: Vec<_> = entities.into_values().collect();
        entity_updates.sort_by(|a, b| {
            (a.first_tx_id, a.last_tx_id, &a.identifier)
                .cmp(&(b.first_tx_id, b.last_tx_id, &b.identifier))
        });

        let mut relations: HashMap<(K, K), RelationDelta<K>> = HashMap::new();
        for update in self.relation_updates {
            let key = (update.src_identifier.clone(), update.dst_identifier.clone());
            match relations.get_mut(&key) {
                Some(acc) => acc.merge(&update),
                None => {
                    relations.insert(key, update);
                }
            }
        }
        let mut relation_updates: Vec<_> = relations.into_values().collect();
        relation_updates.sort_by(|a, b| {
            (&a.src_identifier, &a.dst_identifier).cmp(&(&b.src_identifier, &b.dst_identifier))
        });

        let mut balances: HashMap<K, BalanceDelta<K>> = HashMap::new();
        for update in self.balance_updates {
            match balances.get_mut(&update.identifier) {
                Some(acc) => acc.merge(&update),
                None => {
                    balances.insert(update.identifier.clone(), update);
                }
            }
        }
        let mut balance_updates: Vec<_> = balances.into_values().collect();
        balance_updates.sort_by(|a, b| a.identifier.cmp(&b.identifier));

        DbDelta {
            entity_updates,
            new_entity_txs: self.new_entity_txs,
            relation_updates,
            balance_updates,
        }
    }

    /// Re-keys the delta (address → cluster id) and re-compresses, since
    /// several source keys may collapse onto one target key.
    pub fn map_identifiers<T: Clone + Eq + Hash + Ord>(
        &self,
        mut f: impl FnMut(&K) -> T,
    ) -> DbDelta<T> {
        DbDelta {
            entity_updates: self
                .entity_updates
                .iter()
                .map(|e| e.map_identifier(&mut f))
                .collect(),
            new_entity_txs: self
                .new_entity_txs
                .iter()
                .map(|t| t.map_identifier(&mut f))
                .collect(),
            relation_updates: self
                .relation_updates
                .iter()
                .map(|r| r.map_identifiers(&mut f))
                .collect(),
            balance_updates: self
                .balance_updates
                .iter()
                .map(|b| BalanceDelta {
                    identifier: f(&b.identifier),
                    asset_balances: b.asset_balances.clone(),
                })
                .collect(),
        }
        .compress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn delta(id: &str, received: i64, spent: i64, first: TxId, last: TxId) -> EntityDelta<Vec<u8>> {
        EntityDelta {
            identifier: id.as_bytes().to_vec(),
            total_received: CurrencyValue::convert(received, &[2.0, 1.0], 0),
            total_spent: CurrencyValue::convert(spent, &[2.0, 1.0], 0),
            total_tokens_received: HashMap::new(),
            total_tokens_spent: HashMap::new(),
            first_tx_id: first,
            last_tx_id: last,
            no_incoming_txs: i32::from(received > 0),
            no_outgoing_txs: i32::from(spent > 0),
            no_incoming_txs_zero_value: 0,
            no_outgoing_txs_zero_value: 0,
            is_contract: false,
        }
    }

    #[test]
    fn currency_value_merge_adds_elementwise() {
        let mut a = CurrencyValue::convert(100, &[2.0, 1.0], 0);
        let b = CurrencyValue::convert(50, &[2.0, 1.0], 0);
        a.merge(&b);
        assert_eq!(a.value, BigInt::from(150));
        assert_eq!(a.fiat_values, vec![300.0, 150.0]);
    }

    #[test]
    fn convert_respects_decimals() {
        let fiat = convert_to_fiat(&BigInt::from(150_000_000i64), &[100.0], 8);
        assert_eq!(fiat, vec![150.0]);
    }

    #[test]
    fn entity_merge_is_commutative_on_additive_fields() {
        let a = delta("x", 10, 0, 5, 5);
        let b = delta("x", 0, 7, 3, 9);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab, ba);
        assert_eq!(ab.first_tx_id, 3);
        assert_eq!(ab.last_tx_id, 9);
        assert_eq!(ab.no_incoming_txs, 1);
        assert_eq!(ab.no_outgoing_txs, 1);
    }

    #[test]
    fn reward_sentinel_does_not_poison_tx_ids() {
        let mut a = delta("x", 10, 0, NO_TX_ID, NO_TX_ID);
        let b = delta("x", 5, 0, 42, 42);
        a.merge(&b);
        assert_eq!(a.first_tx_id, 42);
        assert_eq!(a.last_tx_id, 42);

        let mut only_rewards = delta("x", 1, 0, NO_TX_ID, NO_TX_ID);
        only_rewards.merge(&delta("x", 1, 0, NO_TX_ID, NO_TX_ID));
        assert_eq!(only_rewards.first_tx_id, NO_TX_ID);
    }

    #[test]
    fn compress_groups_by_identifier_and_orders_deterministically() {
        let changes = DbDelta {
            entity_updates: vec![
                delta("b", 0, 4, 7, 7),
                delta("a", 10, 0, 5, 5),
                delta("b", 3, 0, 6, 6),
            ],
            new_entity_txs: vec![],
            relation_updates: vec![],
            balance_updates: vec![],
        };
        let compressed = changes.compress();
        assert_eq!(compressed.entity_updates.len(), 2);
        assert_eq!(compressed.entity_updates[0].identifier, b"a".to_vec());
        let b = &compressed.entity_updates[1];
        assert_eq!(b.first_tx_id, 6);
        assert_eq!(b.last_tx_id, 7);
        assert_eq!(b.no_incoming_txs, 1);
        assert_eq!(b.no_outgoing_txs, 1);
    }

    #[test]
    fn relation_compress_merges_pairs() {
        let rel = |src: &str, dst: &str, v: i64| RelationDelta {
            src_identifier: src.as_bytes().to_vec(),
            dst_identifier: dst.as_bytes().to_vec(),
            no_transactions: 1,
            value: CurrencyValue::convert(v, &[1.0], 0),
            token_values: HashMap::new(),
        };
        let compressed = DbDelta {
            entity_updates: vec![],
            new_entity_txs: vec![],
            relation_updates: vec![rel("a", "b", 5), rel("a", "c", 1), rel("a", "b", 2)],
            balance_updates: vec![],
        }
        .compress();
        assert_eq!(compressed.relation_updates.len(), 2);
        let ab = &compressed.relation_updates[0];
        assert_eq!(ab.no_transactions, 2);
        assert_eq!(ab.value.value, BigInt::from(7));
    }

    #[test]
    fn map_identifiers_collapses_onto_clusters() {
        let changes = DbDelta {
            entity_updates: vec![delta("a", 10, 0, 1, 1), delta("b", 20, 0, 2, 2)],
            new_entity_txs: vec![],
            relation_updates: vec![],
            balance_updates: vec![],
        };
        // both addresses belong to cluster 7
        let clustered = changes.map_identifiers(|_| 7i32);
        assert_eq!(clustered.entity_updates.len(), 1);
        let c = &clustered.entity_updates[0];
        assert_eq!(c.total_received.value, BigInt::from(30));
        assert_eq!(c.first_tx_id, 1);
        assert_eq!(c.last_tx_id, 2);
    }
}
