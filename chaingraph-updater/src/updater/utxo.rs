//! Projection of raw UTXO blocks into per-transaction deltas.
//!
//! Mirrors the regularization rules of the full transform: only the first
//! address of an in/output takes part in flows, outputs without any address
//! are booked on the "nonstandard" sentinel, and coinbase transactions get
//! a synthetic input from the "coinbase" pseudo-address so fee and flow
//! arithmetic stays uniform.

use std::collections::{HashMap, HashSet};

use chaingraph_common::{
    models::{
        delta::{CurrencyValue, DbDelta, EntityDelta, EntityTx, RelationDelta, TxReference},
        raw::{BlockBundle, BlockData, TxInputOutput, UtxoTransaction},
    },
    Address, TxId,
};
use num_bigint::BigInt;

use crate::updater::{
    ids::{COINBASE_PSEUDO_ADDRESS, NONSTANDARD_PSEUDO_ADDRESS},
    rates::RateSlice,
    ProjectionOutput, UpdateError,
};

/// Native-unit decimals of UTXO ledgers (satoshi-style).
pub const UTXO_DECIMALS: u32 = 8;

/// Address an in/output entry is attributed to.
fn entry_address(entry: &TxInputOutput) -> Address {
    match entry.addresses.first() {
        // multi-address scripts (bare multisig) are booked on the first
        // address, matching the full transform
        Some(first) => first.as_bytes().to_vec(),
        None => NONSTANDARD_PSEUDO_ADDRESS.to_vec(),
    }
}

/// Sums entries per address, preserving first-appearance order.
fn regularize(entries: &[TxInputOutput]) -> Vec<(Address, i64)> {
    let mut order: Vec<Address> = Vec::new();
    let mut sums: HashMap<Address, i64> = HashMap::new();
    for entry in entries {
        let address = entry_address(entry);
        if !sums.contains_key(&address) {
            order.push(address.clone());
        }
        *sums.entry(address).or_insert(0) += entry.value;
    }
    order
        .into_iter()
        .map(|address| {
            let value = sums[&address];
            (address, value)
        })
        .collect()
}

/// Net flow of one address in a transaction: positive for inflow.
fn flow(reg_in: &HashMap<Address, i64>, reg_out: &HashMap<Address, i64>, address: &[u8]) -> i64 {
    reg_out.get(address).copied().unwrap_or(0) - reg_in.get(address).copied().unwrap_or(0)
}

/// Delta of a single transaction, with fiat values attached.
pub fn dbdelta_from_transaction(tx: &UtxoTransaction, rates: &[f32]) -> DbDelta<Address> {
    let reg_in = regularize(&tx.inputs);
    let reg_out = regularize(&tx.outputs);
    let in_map: HashMap<Address, i64> = reg_in.iter().cloned().collect();
    let out_map: HashMap<Address, i64> = reg_out.iter().cloned().collect();

    let fiat_count = rates.len();
    let mut delta = DbDelta::default();

    for (address, value) in &reg_in {
        delta.entity_updates.push(EntityDelta {
            identifier: address.clone(),
            total_received: CurrencyValue::zero(fiat_count),
            total_spent: CurrencyValue::convert(*value, rates, UTXO_DECIMALS),
            total_tokens_received: HashMap::new(),
            total_tokens_spent: HashMap::new(),
            first_tx_id: tx.tx_id,
            last_tx_id: tx.tx_id,
            no_incoming_txs: 0,
            no_outgoing_txs: 1,
            no_incoming_txs_zero_value: 0,
            no_outgoing_txs_zero_value: i32::from(*value == 0),
            is_contract: false,
        });
    }

    for (address, value) in &reg_out {
        delta.entity_updates.push(EntityDelta {
            identifier: address.clone(),
            total_received: CurrencyValue::convert(*value, rates, UTXO_DECIMALS),
            total_spent: CurrencyValue::zero(fiat_count),
            total_tokens_received: HashMap::new(),
            total_tokens_spent: HashMap::new(),
            first_tx_id: tx.tx_id,
            last_tx_id: tx.tx_id,
            no_incoming_txs: 1,
            no_outgoing_txs: 0,
            no_incoming_txs_zero_value: i32::from(*value == 0),
            no_outgoing_txs_zero_value: 0,
            is_contract: false,
        });
    }

    // one transaction-list row per touched address, valued by net flow
    let mut seen: HashSet<Address> = HashSet::new();
    for (address, _) in reg_in.iter().chain(reg_out.iter()) {
        if !seen.insert(address.clone()) {
            continue;
        }
        let net = flow(&in_map, &out_map, address);
        delta.new_entity_txs.push(EntityTx {
            identifier: address.clone(),
            tx_id: tx.tx_id,
            is_outgoing: net < 0,
            value: BigInt::from(net),
            token_values: HashMap::new(),
            tx_reference: TxReference::default(),
        });
    }

    // the value of src→dst is dst's output scaled by src's share of the
    // net input sum; an address appearing on both sides reduces that sum
    let reginput_sum: i64 = reg_in.iter().map(|(_, v)| *v).sum();
    let input_flows_sum: i64 = in_map
        .keys()
        .map(|a| flow(&in_map, &out_map, a))
        .filter(|f| *f <= 0)
        .sum();
    let total_input: i64 = tx.inputs.iter().map(|i| i.value).sum();
    let reduced_input_sum = total_input - (reginput_sum + input_flows_sum);

    for (iadr, _) in &reg_in {
        // coinbase payouts have no paying counterparty
        if iadr.as_slice() == COINBASE_PSEUDO_ADDRESS {
            continue;
        }
        for (oadr, _) in &reg_out {
            if iadr == oadr {
                continue;
            }
            let iflow = flow(&in_map, &out_map, iadr);
            let oflow = flow(&in_map, &out_map, oadr);
            let value = if reduced_input_sum == 0 {
                // zero-value zero-fee transactions exist in the wild
                0
            } else {
                ((iflow as f64 / reduced_input_sum as f64) * oflow as f64)
                    .round()
                    .abs() as i64
            };
            delta.relation_updates.push(RelationDelta {
                src_identifier: iadr.clone(),
                dst_identifier: oadr.clone(),
                no_transactions: 1,
                value: CurrencyValue::convert(value, rates, UTXO_DECIMALS),
                token_values: HashMap::new(),
            });
        }
    }

    delta
}

/// Replaces coinbase inputs with the pseudo-address input worth the output
/// sum, so downstream flow logic needs no special case.
fn with_coinbase_input(tx: &UtxoTransaction) -> UtxoTransaction {
    if !tx.coinbase {
        return tx.clone();
    }
    let outputsum: i64 = tx.outputs.iter().map(|o| o.value).sum();
    let mut tx = tx.clone();
    tx.inputs = vec![TxInputOutput {
        addresses: vec![String::from_utf8_lossy(COINBASE_PSEUDO_ADDRESS).into_owned()],
        value: outputsum,
        address_type: None,
    }];
    tx
}

/// Projects a range of block bundles into the batch's delta set.
pub fn project(bundles: &[BlockBundle], rates: &RateSlice) -> Result<ProjectionOutput, UpdateError> {
    let mut txs: Vec<UtxoTransaction> = Vec::new();
    let mut block_txs: Vec<(i64, Vec<TxId>)> = Vec::new();
    for bundle in bundles {
        let BlockData::Utxo { txs: block } = &bundle.data else {
            return Err(UpdateError::Setup(
                "account bundle handed to the utxo projector".into(),
            ));
        };
        block_txs.push((bundle.block_id(), block.iter().map(|tx| tx.tx_id).collect()));
        txs.extend(block.iter().map(with_coinbase_input));
    }
    txs.sort_by_key(|tx| (tx.block_id, tx.tx_id));

    let mut per_tx = Vec::with_capacity(txs.len());
    let mut cluster_inputs = Vec::new();
    for tx in &txs {
        per_tx.push(dbdelta_from_transaction(tx, rates.get(tx.block_id)));

        if !tx.coinbase {
            let inputs: Vec<Address> = regularize(&tx.inputs)
                .into_iter()
                .map(|(address, _)| address)
                .collect();
            if inputs.len() > 1 {
                cluster_inputs.push(inputs);
            }
        }
    }

    // id assignment order: unique output addresses first, then inputs not
    // yet seen as outputs, both in appearance order
    let mut address_order: Vec<Address> = Vec::new();
    let mut seen: HashSet<Address> = HashSet::new();
    for tx in &txs {
        for (address, _) in regularize(&tx.outputs) {
            if seen.insert(address.clone()) {
                address_order.push(address);
            }
        }
    }
    for tx in &txs {
        for (address, _) in regularize(&tx.inputs) {
            if seen.insert(address.clone()) {
                address_order.push(address);
            }
        }
    }

    let tx_count = txs.len() as u64;
    Ok(ProjectionOutput {
        per_tx,
        address_order,
        cluster_inputs,
        tx_hashes_in_order: Vec::new(),
        block_txs,
        tx_count,
    })
}

/// Flat union-find over batch-local indices; translated to cluster ids on
/// emit.
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(size: usize) -> Self {
        Self { parent: (0..size).collect(), rank: vec![0; size] }
    }

    pub fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        // path compression
        let mut cursor = x;
        while self.parent[cursor] != root {
            let next = self.parent[cursor];
            self.parent[cursor] = root;
            cursor = next;
        }
        root
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chaingraph_common::models::raw::RawBlock;
    use num_bigint::BigInt;
    use pretty_assertions::assert_eq;

    use super::*;

    fn io(addr: &str, value: i64) -> TxInputOutput {
        TxInputOutput { addresses: vec![addr.to_string()], value, address_type: Some(0) }
    }

    fn utxo_tx(tx_id: TxId, inputs: Vec<TxInputOutput>, outputs: Vec<TxInputOutput>) -> UtxoTransaction {
        UtxoTransaction {
            tx_id,
            block_id: 100,
            coinbase: inputs.is_empty(),
            total_input: inputs.iter().map(|i| i.value).sum(),
            total_output: outputs.iter().map(|o| o.value).sum(),
            inputs,
            outputs,
            ..Default::default()
        }
    }

    fn bundle(block_id: i64, txs: Vec<UtxoTransaction>) -> BlockBundle {
        BlockBundle {
            block: RawBlock { block_id, ..Default::default() },
            data: BlockData::Utxo { txs },
        }
    }

    fn rates() -> RateSlice {
        RateSlice::from_map(HashMap::from([(100, vec![1.0, 1.0]), (101, vec![1.0, 1.0])]))
    }

    #[test]
    fn coinbase_credits_recipient_without_relations() {
        let tx = utxo_tx(0, vec![], vec![io("A", 50_0000_0000)]);
        let output = project(&[bundle(100, vec![tx])], &rates()).unwrap();
        let delta = DbDelta::merge(output.per_tx.clone());

        let a = delta
            .entity_updates
            .iter()
            .find(|e| e.identifier == b"A".to_vec())
            .unwrap();
        assert_eq!(a.total_received.value, BigInt::from(50_0000_0000i64));
        assert_eq!(a.no_incoming_txs, 1);
        assert!(delta.relation_updates.is_empty());
        assert!(output.cluster_inputs.is_empty());
    }

    #[test]
    fn proportional_split_follows_input_contribution() {
        // inputs A=50, B=10; outputs C=55, D=4; fee 1
        let tx = utxo_tx(
            7,
            vec![io("A", 50), io("B", 10)],
            vec![io("C", 55), io("D", 4)],
        );
        let output = project(&[bundle(100, vec![tx])], &rates()).unwrap();
        let delta = DbDelta::merge(output.per_tx.clone());

        let rel = |src: &str, dst: &str| {
            delta
                .relation_updates
                .iter()
                .find(|r| {
                    r.src_identifier == src.as_bytes().to_vec() &&
                        r.dst_identifier == dst.as_bytes().to_vec()
                })
                .unwrap()
                .value
                .value
                .clone()
        };
        // A contributes 50/60, B 10/60 of each output
        assert_eq!(rel("A", "C"), BigInt::from(46)); // round(50/60*55)
        assert_eq!(rel("A", "D"), BigInt::from(3));
        assert_eq!(rel("B", "C"), BigInt::from(9));
        assert_eq!(rel("B", "D"), BigInt::from(1));

        // both inputs form one cluster candidate
        assert_eq!(output.cluster_inputs, vec![vec![b"A".to_vec(), b"B".to_vec()]]);

        let c = delta
            .entity_updates
            .iter()
            .find(|e| e.identifier == b"C".to_vec())
            .unwrap();
        assert_eq!(c.first_tx_id, 7);
        assert_eq!(c.last_tx_id, 7);
    }

    #[test]
    fn zero_value_transactions_count_only_zero_value_fields() {
        let tx = utxo_tx(9, vec![io("A", 0)], vec![io("B", 0)]);
        let output = project(&[bundle(100, vec![tx])], &rates()).unwrap();
        let delta = DbDelta::merge(output.per_tx.clone());

        let a = delta
            .entity_updates
            .iter()
            .find(|e| e.identifier == b"A".to_vec())
            .unwrap();
        assert_eq!(a.no_outgoing_txs, 1);
        assert_eq!(a.no_outgoing_txs_zero_value, 1);

        let rel = &delta.relation_updates[0];
        assert_eq!(rel.no_transactions, 1);
        assert_eq!(rel.value.value, BigInt::from(0));
    }

    #[test]
    fn nonstandard_outputs_use_the_sentinel() {
        let mut out = io("X", 5);
        out.addresses.clear();
        let tx = utxo_tx(3, vec![io("A", 5)], vec![out]);
        let output = project(&[bundle(100, vec![tx])], &rates()).unwrap();
        let delta = DbDelta::merge(output.per_tx.clone());
        assert!(delta
            .entity_updates
            .iter()
            .any(|e| e.identifier == NONSTANDARD_PSEUDO_ADDRESS.to_vec()));
    }

    #[test]
    fn output_addresses_get_ids_before_input_addresses() {
        let tx1 = utxo_tx(1, vec![io("in1", 10)], vec![io("out1", 9)]);
        let tx2 = utxo_tx(2, vec![io("in2", 9)], vec![io("out2", 8)]);
        let output = project(&[bundle(100, vec![tx1, tx2])], &rates()).unwrap();
        assert_eq!(
            output.address_order,
            vec![
                b"out1".to_vec(),
                b"out2".to_vec(),
                b"in1".to_vec(),
                b"in2".to_vec(),
            ]
        );
    }

    #[test]
    fn union_find_merges_transitively() {
        let mut uf = UnionFind::new(5);
        uf.union(0, 1);
        uf.union(3, 4);
        assert_ne!(uf.find(1), uf.find(3));
        uf.union(1, 3);
        assert_eq!(uf.find(0), uf.find(4));
        assert_ne!(uf.find(2), uf.find(0));
    }

    #[test]
    fn input_address_reappearing_as_output_reduces_the_split_base() {
        // A sends 10, gets 4 back as change; B receives 5; fee 1
        let tx = utxo_tx(5, vec![io("A", 10)], vec![io("A", 4), io("B", 5)]);
        let output = project(&[bundle(100, vec![tx])], &rates()).unwrap();
        let delta = DbDelta::merge(output.per_tx.clone());

        let ab = delta
            .relation_updates
            .iter()
            .find(|r| r.dst_identifier == b"B".to_vec())
            .unwrap();
        // A's net outflow is 6, the reduced input sum is 6, B's inflow 5
        assert_eq!(ab.value.value, BigInt::from(5));
        // no self relation A→A
        assert_eq!(delta.relation_updates.len(), 1);
    }
}
