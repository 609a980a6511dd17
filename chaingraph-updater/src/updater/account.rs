//! Projection of raw account-model blocks (transactions, traces, logs)
//! into per-transaction deltas.
//!
//! Transactions carry the external transfer and the tx counters; traces
//! carry internal transfers; logs matching the ERC-20 transfer signature
//! become token transfers for configured tokens. Failed transactions keep
//! their degree and zero-value statistics but contribute no value.

use std::collections::HashMap;

use chaingraph_common::{
    models::{
        delta::{
            convert_to_fiat, BalanceDelta, CurrencyValue, DbDelta, EntityDelta, EntityTx,
            RelationDelta, TxReference, NO_TX_ID,
        },
        raw::{AccountTransaction, BlockBundle, BlockData, Log, Trace},
        transformed::TokenConfigurationRow,
    },
    Address, BlockId, TxId,
};
use num_bigint::{BigInt, Sign};
use num_traits::Zero;
use tracing::warn;

use crate::updater::{rates::RateSlice, ProjectionOutput, UpdateError};

/// Native-unit decimals of account ledgers (wei-style).
pub const ACCOUNT_DECIMALS: u32 = 18;

/// `keccak256("Transfer(address,address,uint256)")` — the ERC-20 transfer
/// event signature.
pub const TOKEN_TRANSFER_TOPIC: [u8; 32] = [
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d,
    0xaa, 0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x5a, 0x4d, 0xf5, 0x23,
    0xb3, 0xef,
];

/// A decoded ERC-20-style transfer of a configured token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenTransfer {
    pub from_address: Address,
    pub to_address: Address,
    pub value: BigInt,
    pub asset: String,
    pub decimals: u32,
    pub peg_currency: String,
    pub block_id: BlockId,
    pub tx_hash: Vec<u8>,
    pub log_index: i32,
}

/// Decodes a raw log into a token transfer if it matches the transfer
/// signature and belongs to a configured token.
pub fn decode_token_transfer(
    log: &Log,
    tokens: &HashMap<Address, TokenConfigurationRow>,
) -> Option<TokenTransfer> {
    let token = tokens.get(&log.address)?;
    if log.topics.len() < 3 || log.topics[0].as_slice() != TOKEN_TRANSFER_TOPIC {
        return None;
    }
    let from = address_from_topic(&log.topics[1])?;
    let to = address_from_topic(&log.topics[2])?;
    let value = BigInt::from_bytes_be(Sign::Plus, &log.data);
    Some(TokenTransfer {
        from_address: from,
        to_address: to,
        value,
        asset: token.currency_ticker.clone(),
        decimals: token.decimals as u32,
        peg_currency: token.peg_currency.clone(),
        block_id: log.block_id,
        tx_hash: log.tx_hash.clone(),
        log_index: log.log_index,
    })
}

fn address_from_topic(topic: &[u8]) -> Option<Address> {
    if topic.len() != 32 {
        return None;
    }
    Some(topic[12..].to_vec())
}

/// Fiat vector of a token amount. Coin-pegged tokens convert through the
/// native rate; fiat-pegged tokens convert through the peg's cross rate.
fn token_fiat(
    transfer: &TokenTransfer,
    fiat_currencies: &[String],
    rates: &[f32],
    native_ticker: &str,
) -> Vec<f32> {
    if transfer.peg_currency.eq_ignore_ascii_case(native_ticker) {
        return convert_to_fiat(&transfer.value, rates, transfer.decimals);
    }
    if let Some(peg_idx) = fiat_currencies
        .iter()
        .position(|c| c.eq_ignore_ascii_case(&transfer.peg_currency))
    {
        let peg_rate = rates.get(peg_idx).copied().unwrap_or(0.0);
        if peg_rate == 0.0 {
            return vec![0.0; rates.len()];
        }
        let amount = convert_to_fiat(&transfer.value, &[1.0], transfer.decimals)[0];
        return rates
            .iter()
            .map(|r| amount * r / peg_rate)
            .collect();
    }
    warn!(asset = transfer.asset, peg = transfer.peg_currency, "Unknown token peg");
    vec![0.0; rates.len()]
}

/// Hashes of all transactions in block order; drives dense tx-id
/// assignment before projection runs.
pub fn tx_hashes_in_order(bundles: &[BlockBundle]) -> Result<Vec<Vec<u8>>, UpdateError> {
    let mut hashes = Vec::new();
    for bundle in bundles {
        let BlockData::Account { txs, .. } = &bundle.data else {
            return Err(UpdateError::Setup("utxo bundle handed to the account projector".into()));
        };
        hashes.extend(txs.iter().map(|tx| tx.tx_hash.clone()));
    }
    Ok(hashes)
}

struct TxDeltaInput<'a> {
    tx: &'a AccountTransaction,
    tx_id: TxId,
    rates: &'a [f32],
}

fn entity_delta_from_tx(input: &TxDeltaInput<'_>, is_outgoing: bool) -> Option<EntityDelta<Address>> {
    let tx = input.tx;
    let identifier = if is_outgoing { tx.from_address.clone() } else { effective_to(tx) }?;
    let successful = tx.is_successful();
    let counted_value = if successful { tx.value.clone() } else { BigInt::zero() };
    let value = CurrencyValue {
        fiat_values: convert_to_fiat(&counted_value, input.rates, ACCOUNT_DECIMALS),
        value: counted_value.clone(),
    };
    let zero = i32::from(counted_value.is_zero());
    let is_contract =
        !is_outgoing && successful && tx.receipt_contract_address.is_some();
    Some(EntityDelta {
        identifier,
        total_received: if is_outgoing {
            CurrencyValue::zero(input.rates.len())
        } else {
            value.clone()
        },
        total_spent: if is_outgoing { value } else { CurrencyValue::zero(input.rates.len()) },
        total_tokens_received: HashMap::new(),
        total_tokens_spent: HashMap::new(),
        first_tx_id: input.tx_id,
        last_tx_id: input.tx_id,
        no_incoming_txs: i32::from(!is_outgoing),
        no_outgoing_txs: i32::from(is_outgoing),
        no_incoming_txs_zero_value: if is_outgoing { 0 } else { zero },
        no_outgoing_txs_zero_value: if is_outgoing { zero } else { 0 },
        is_contract,
    })
}

/// Contract creations have no `to`; the created contract takes its place.
fn effective_to(tx: &AccountTransaction) -> Option<Address> {
    tx.to_address
        .clone()
        .or_else(|| tx.receipt_contract_address.clone())
}

fn entity_delta_from_trace(
    trace: &Trace,
    is_outgoing: bool,
    tx_id: TxId,
    rates: &[f32],
) -> Option<EntityDelta<Address>> {
    let identifier =
        if is_outgoing { trace.from_address.clone() } else { trace.to_address.clone() }?;
    let value = CurrencyValue {
        fiat_values: convert_to_fiat(&trace.value, rates, ACCOUNT_DECIMALS),
        value: trace.value.clone(),
    };
    let zero = i32::from(trace.value.is_zero());
    let reward = trace.is_reward();
    Some(EntityDelta {
        identifier,
        total_received: if is_outgoing { CurrencyValue::zero(rates.len()) } else { value.clone() },
        total_spent: if is_outgoing { value } else { CurrencyValue::zero(rates.len()) },
        total_tokens_received: HashMap::new(),
        total_tokens_spent: HashMap::new(),
        first_tx_id: tx_id,
        last_tx_id: tx_id,
        // reward traces do not belong to a transaction and leave counters
        // untouched
        no_incoming_txs: i32::from(!is_outgoing && !reward),
        no_outgoing_txs: i32::from(is_outgoing && !reward),
        no_incoming_txs_zero_value: if is_outgoing || reward { 0 } else { zero },
        no_outgoing_txs_zero_value: if is_outgoing && !reward { zero } else { 0 },
        is_contract: !is_outgoing && trace.is_contract_creation(),
    })
}

fn entity_delta_from_token(
    transfer: &TokenTransfer,
    is_outgoing: bool,
    tx_id: TxId,
    fiat: &[f32],
    fiat_count: usize,
) -> EntityDelta<Address> {
    let identifier =
        if is_outgoing { transfer.from_address.clone() } else { transfer.to_address.clone() };
    let value = CurrencyValue { value: transfer.value.clone(), fiat_values: fiat.to_vec() };
    let tokens = HashMap::from([(transfer.asset.clone(), value)]);
    EntityDelta {
        identifier,
        total_received: CurrencyValue::zero(fiat_count),
        total_spent: CurrencyValue::zero(fiat_count),
        total_tokens_received: if is_outgoing { HashMap::new() } else { tokens.clone() },
        total_tokens_spent: if is_outgoing { tokens } else { HashMap::new() },
        first_tx_id: tx_id,
        last_tx_id: tx_id,
        no_incoming_txs: i32::from(!is_outgoing),
        no_outgoing_txs: i32::from(is_outgoing),
        no_incoming_txs_zero_value: 0,
        no_outgoing_txs_zero_value: 0,
        is_contract: false,
    }
}

/// Projects account bundles. `tx_ids` must already cover every transaction
/// hash of the batch (dense ids assigned by the allocator).
pub fn project(
    bundles: &[BlockBundle],
    rates: &RateSlice,
    tokens: &HashMap<Address, TokenConfigurationRow>,
    tx_ids: &HashMap<Vec<u8>, TxId>,
    native_ticker: &str,
    fiat_currencies: &[String],
) -> Result<ProjectionOutput, UpdateError> {
    let mut per_tx: Vec<DbDelta<Address>> = Vec::new();
    let mut block_txs: Vec<(BlockId, Vec<TxId>)> = Vec::new();
    let mut order_entries: Vec<(BlockId, bool, i64, bool, Address)> = Vec::new();
    let mut tx_hashes: Vec<Vec<u8>> = Vec::new();
    let mut tx_count = 0u64;

    let resolve_tx_id = |hash: &[u8]| -> Result<TxId, UpdateError> {
        tx_ids
            .get(hash)
            .copied()
            .ok_or_else(|| {
                UpdateError::InvariantViolation(format!(
                    "transaction hash without id: {}",
                    hex::encode(hash)
                ))
            })
    };

    for bundle in bundles {
        let BlockData::Account { txs, traces, logs } = &bundle.data else {
            return Err(UpdateError::Setup("utxo bundle handed to the account projector".into()));
        };
        let block = &bundle.block;
        let block_rates = rates.get(block.block_id);
        let fiat_count = block_rates.len();

        let mut delta = DbDelta::default();
        let mut ids_of_block = Vec::new();

        for tx in txs {
            let tx_id = resolve_tx_id(&tx.tx_hash)?;
            ids_of_block.push(tx_id);
            tx_hashes.push(tx.tx_hash.clone());
            tx_count += 1;
            let input = TxDeltaInput { tx, tx_id, rates: block_rates };

            // tx counters and (for successful txs) the external value
            for is_outgoing in [true, false] {
                if let Some(update) = entity_delta_from_tx(&input, is_outgoing) {
                    delta.entity_updates.push(update);
                }
                let identifier =
                    if is_outgoing { tx.from_address.clone() } else { effective_to(tx) };
                if let Some(identifier) = identifier {
                    let value =
                        if tx.is_successful() { tx.value.clone() } else { BigInt::zero() };
                    delta.new_entity_txs.push(EntityTx {
                        identifier,
                        tx_id,
                        is_outgoing,
                        value,
                        token_values: HashMap::new(),
                        tx_reference: TxReference::default(),
                    });
                }
            }

            if tx.is_successful() {
                if let (Some(from), Some(to)) = (tx.from_address.clone(), effective_to(tx)) {
                    delta.relation_updates.push(RelationDelta {
                        src_identifier: from.clone(),
                        dst_identifier: to.clone(),
                        no_transactions: 1,
                        value: CurrencyValue {
                            fiat_values: convert_to_fiat(&tx.value, block_rates, ACCOUNT_DECIMALS),
                            value: tx.value.clone(),
                        },
                        token_values: HashMap::new(),
                    });
                    // value moves regardless of how the call tree looks
                    delta.balance_updates.push(BalanceDelta {
                        identifier: from,
                        asset_balances: HashMap::from([(
                            native_ticker.to_string(),
                            -tx.value.clone(),
                        )]),
                    });
                    delta.balance_updates.push(BalanceDelta {
                        identifier: to,
                        asset_balances: HashMap::from([(
                            native_ticker.to_string(),
                            tx.value.clone(),
                        )]),
                    });
                }
            }

            // fees are paid even by failed transactions
            if let Some(from) = tx.from_address.clone() {
                delta.balance_updates.push(BalanceDelta {
                    identifier: from,
                    asset_balances: HashMap::from([(native_ticker.to_string(), -tx.fee())]),
                });
                if let Some(miner) = block.miner.clone() {
                    delta.balance_updates.push(BalanceDelta {
                        identifier: miner,
                        asset_balances: HashMap::from([(native_ticker.to_string(), tx.fee())]),
                    });
                }
            }

            for (is_from, address) in
                [(true, tx.from_address.clone()), (false, effective_to(tx))]
            {
                if let Some(address) = address {
                    order_entries.push((
                        block.block_id,
                        false,
                        tx.transaction_index as i64 - 1_000_000,
                        is_from,
                        address,
                    ));
                }
            }
        }

        for trace in traces {
            if !trace.is_successful() {
                continue;
            }
            if trace.is_reward() {
                // block rewards credit the producer outside any transaction
                if let Some(update) = entity_delta_from_trace(trace, false, NO_TX_ID, block_rates)
                {
                    delta.entity_updates.push(update);
                }
                if let Some(to) = trace.to_address.clone() {
                    delta.balance_updates.push(BalanceDelta {
                        identifier: to.clone(),
                        asset_balances: HashMap::from([(
                            native_ticker.to_string(),
                            trace.value.clone(),
                        )]),
                    });
                    order_entries.push((
                        block.block_id,
                        false,
                        trace.trace_index as i64,
                        false,
                        to,
                    ));
                }
                continue;
            }
            if !(trace.is_call() || trace.is_contract_creation()) {
                continue;
            }
            let Some(tx_hash) = trace.tx_hash.as_deref() else { continue };
            let tx_id = resolve_tx_id(tx_hash)?;

            for is_outgoing in [true, false] {
                if let Some(update) =
                    entity_delta_from_trace(trace, is_outgoing, tx_id, block_rates)
                {
                    delta.entity_updates.push(update);
                }
                let identifier = if is_outgoing {
                    trace.from_address.clone()
                } else {
                    trace.to_address.clone()
                };
                if let Some(identifier) = identifier {
                    delta.new_entity_txs.push(EntityTx {
                        identifier: identifier.clone(),
                        tx_id,
                        is_outgoing,
                        value: trace.value.clone(),
                        token_values: HashMap::new(),
                        tx_reference: TxReference {
                            trace_index: Some(trace.trace_index),
                            log_index: None,
                        },
                    });
                    order_entries.push((
                        block.block_id,
                        false,
                        trace.trace_index as i64,
                        is_outgoing,
                        identifier,
                    ));
                }
            }

            if let (Some(from), Some(to)) =
                (trace.from_address.clone(), trace.to_address.clone())
            {
                delta.relation_updates.push(RelationDelta {
                    src_identifier: from.clone(),
                    dst_identifier: to.clone(),
                    no_transactions: 1,
                    value: CurrencyValue {
                        fiat_values: convert_to_fiat(&trace.value, block_rates, ACCOUNT_DECIMALS),
                        value: trace.value.clone(),
                    },
                    token_values: HashMap::new(),
                });
                delta.balance_updates.push(BalanceDelta {
                    identifier: from,
                    asset_balances: HashMap::from([(
                        native_ticker.to_string(),
                        -trace.value.clone(),
                    )]),
                });
                delta.balance_updates.push(BalanceDelta {
                    identifier: to,
                    asset_balances: HashMap::from([(
                        native_ticker.to_string(),
                        trace.value.clone(),
                    )]),
                });
            }
        }

        for log in logs {
            let Some(transfer) = decode_token_transfer(log, tokens) else { continue };
            let tx_id = resolve_tx_id(&transfer.tx_hash)?;
            let fiat = token_fiat(&transfer, fiat_currencies, block_rates, native_ticker);

            for is_outgoing in [true, false] {
                delta.entity_updates.push(entity_delta_from_token(
                    &transfer,
                    is_outgoing,
                    tx_id,
                    &fiat,
                    fiat_count,
                ));
                let identifier = if is_outgoing {
                    transfer.from_address.clone()
                } else {
                    transfer.to_address.clone()
                };
                delta.new_entity_txs.push(EntityTx {
                    identifier: identifier.clone(),
                    tx_id,
                    is_outgoing,
                    value: BigInt::zero(),
                    token_values: HashMap::from([(
                        transfer.asset.clone(),
                        transfer.value.clone(),
                    )]),
                    tx_reference: TxReference {
                        trace_index: None,
                        log_index: Some(transfer.log_index),
                    },
                });
                order_entries.push((
                    block.block_id,
                    true,
                    transfer.log_index as i64,
                    is_outgoing,
                    identifier,
                ));
            }

            let token_value =
                CurrencyValue { value: transfer.value.clone(), fiat_values: fiat.clone() };
            delta.relation_updates.push(RelationDelta {
                src_identifier: transfer.from_address.clone(),
                dst_identifier: transfer.to_address.clone(),
                no_transactions: 1,
                value: CurrencyValue::zero(fiat_count),
                token_values: HashMap::from([(transfer.asset.clone(), token_value)]),
            });
            delta.balance_updates.push(BalanceDelta {
                identifier: transfer.from_address.clone(),
                asset_balances: HashMap::from([(transfer.asset.clone(), -transfer.value.clone())]),
            });
            delta.balance_updates.push(BalanceDelta {
                identifier: transfer.to_address.clone(),
                asset_balances: HashMap::from([(transfer.asset.clone(), transfer.value.clone())]),
            });
        }

        // EIP-1559 burn debits the producer's fee credit
        if let (Some(miner), Some(base_fee), Some(gas_used)) =
            (block.miner.clone(), block.base_fee_per_gas, block.gas_used)
        {
            let burnt = BigInt::from(base_fee) * BigInt::from(gas_used);
            if !burnt.is_zero() {
                delta.balance_updates.push(BalanceDelta {
                    identifier: miner.clone(),
                    asset_balances: HashMap::from([(native_ticker.to_string(), -burnt)]),
                });
            }
            order_entries.push((block.block_id, false, 1_000_000_000, false, miner));
        }

        block_txs.push((block.block_id, ids_of_block));
        per_tx.push(delta);
    }

    // first-sighting order decides id assignment: txs before traces before
    // logs within a block, receivers before senders on equal keys
    order_entries.sort_by(|a, b| {
        (a.0, a.1, a.2, a.3).cmp(&(b.0, b.1, b.2, b.3))
    });
    let mut address_order = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for (_, _, _, _, address) in order_entries {
        if seen.insert(address.clone()) {
            address_order.push(address);
        }
    }

    Ok(ProjectionOutput {
        per_tx,
        address_order,
        cluster_inputs: Vec::new(),
        tx_hashes_in_order: tx_hashes,
        block_txs,
        tx_count,
    })
}

#[cfg(test)]
mod tests {
    use chaingraph_common::models::raw::RawBlock;
    use pretty_assertions::assert_eq;

    use super::*;

    const ETH: u32 = ACCOUNT_DECIMALS;

    fn addr(tag: u8) -> Address {
        vec![tag; 20]
    }

    fn eth(whole: i64) -> BigInt {
        BigInt::from(whole) * BigInt::from(10u64).pow(ETH)
    }

    fn tx(hash: u8, index: i32, from: u8, to: u8, value: BigInt, status: i16) -> AccountTransaction {
        AccountTransaction {
            tx_hash: vec![hash; 32],
            block_id: 200,
            transaction_index: index,
            from_address: Some(addr(from)),
            to_address: Some(addr(to)),
            value,
            gas_price: 10,
            receipt_gas_used: 21_000,
            receipt_contract_address: None,
            receipt_status: status,
        }
    }

    fn bundle(txs: Vec<AccountTransaction>, traces: Vec<Trace>, logs: Vec<Log>) -> BlockBundle {
        BlockBundle {
            block: RawBlock {
                block_id: 200,
                miner: Some(addr(0xee)),
                base_fee_per_gas: Some(5),
                gas_used: Some(42_000),
                ..Default::default()
            },
            data: BlockData::Account { txs, traces, logs },
        }
    }

    fn rates() -> RateSlice {
        RateSlice::from_map(HashMap::from([(200, vec![2000.0, 1800.0])]))
    }

    fn fiats() -> Vec<String> {
        vec!["USD".into(), "EUR".into()]
    }

    fn project_simple(bundles: &[BlockBundle]) -> ProjectionOutput {
        let hashes = tx_hashes_in_order(bundles).unwrap();
        let tx_ids: HashMap<Vec<u8>, TxId> = hashes
            .iter()
            .enumerate()
            .map(|(i, h)| (h.clone(), i as TxId))
            .collect();
        project(bundles, &rates(), &HashMap::new(), &tx_ids, "ETH", &fiats()).unwrap()
    }

    #[test]
    fn failed_transactions_count_but_move_no_value() {
        // T1 succeeds (1 ETH X→Y), T2 fails (X→Z)
        let bundles = vec![bundle(
            vec![
                tx(0xa1, 0, 0x01, 0x02, eth(1), 1),
                tx(0xa2, 1, 0x01, 0x03, eth(2), 0),
            ],
            vec![],
            vec![],
        )];
        let output = project_simple(&bundles);
        let delta = DbDelta::merge(output.per_tx.clone());

        let x = delta
            .entity_updates
            .iter()
            .find(|e| e.identifier == addr(0x01))
            .unwrap();
        assert_eq!(x.no_outgoing_txs, 2);
        assert_eq!(x.no_outgoing_txs_zero_value, 1);
        assert_eq!(x.total_spent.value, eth(1));

        // the failed transfer creates no relation
        assert_eq!(delta.relation_updates.len(), 1);
        assert_eq!(delta.relation_updates[0].dst_identifier, addr(0x02));
        assert_eq!(delta.relation_updates[0].value.value, eth(1));

        // fees are paid for both transactions
        let x_balance = delta
            .balance_updates
            .iter()
            .find(|b| b.identifier == addr(0x01))
            .unwrap();
        let expected = -eth(1) - BigInt::from(2) * BigInt::from(210_000);
        assert_eq!(x_balance.asset_balances["ETH"], expected);
    }

    #[test]
    fn fiat_values_follow_the_block_rate() {
        let bundles =
            vec![bundle(vec![tx(0xa1, 0, 0x01, 0x02, eth(1), 1)], vec![], vec![])];
        let output = project_simple(&bundles);
        let delta = DbDelta::merge(output.per_tx.clone());
        let y = delta
            .entity_updates
            .iter()
            .find(|e| e.identifier == addr(0x02))
            .unwrap();
        assert_eq!(y.total_received.fiat_values, vec![2000.0, 1800.0]);
    }

    #[test]
    fn internal_transfers_carry_their_trace_reference() {
        let trace = Trace {
            block_id: 200,
            trace_index: 3,
            tx_hash: Some(vec![0xa1; 32]),
            from_address: Some(addr(0x02)),
            to_address: Some(addr(0x04)),
            value: eth(1) / BigInt::from(2),
            call_type: Some("call".into()),
            trace_type: "call".into(),
            status: 1,
        };
        let bundles =
            vec![bundle(vec![tx(0xa1, 0, 0x01, 0x02, eth(1), 1)], vec![trace], vec![])];
        let output = project_simple(&bundles);
        let delta = DbDelta::merge(output.per_tx.clone());

        let row = delta
            .new_entity_txs
            .iter()
            .find(|t| t.identifier == addr(0x04))
            .unwrap();
        assert_eq!(row.tx_reference.trace_index, Some(3));
        assert!(!row.is_outgoing);
    }

    #[test]
    fn reward_traces_use_the_sentinel_and_skip_counters() {
        let reward = Trace {
            block_id: 200,
            trace_index: 0,
            tx_hash: None,
            from_address: None,
            to_address: Some(addr(0xee)),
            value: eth(2),
            call_type: None,
            trace_type: "reward".into(),
            status: 1,
        };
        let output = project_simple(&[bundle(vec![], vec![reward], vec![])]);
        let delta = DbDelta::merge(output.per_tx.clone());

        let miner = delta
            .entity_updates
            .iter()
            .find(|e| e.identifier == addr(0xee))
            .unwrap();
        assert_eq!(miner.first_tx_id, NO_TX_ID);
        assert_eq!(miner.no_incoming_txs, 0);
        assert_eq!(miner.total_received.value, eth(2));
    }

    #[test]
    fn token_transfers_decode_only_configured_tokens() {
        let token_address = addr(0x77);
        let tokens = HashMap::from([(
            token_address.clone(),
            TokenConfigurationRow {
                currency_ticker: "USDT".into(),
                token_address: token_address.clone(),
                peg_currency: "USD".into(),
                decimals: 6,
            },
        )]);

        let mut topics = vec![TOKEN_TRANSFER_TOPIC.to_vec()];
        for tag in [0x01u8, 0x02] {
            let mut topic = vec![0u8; 12];
            topic.extend(addr(tag));
            topics.push(topic);
        }
        let log = Log {
            block_id: 200,
            tx_hash: vec![0xa1; 32],
            log_index: 0,
            address: token_address,
            topics,
            data: BigInt::from(5_000_000).to_bytes_be().1,
        };

        let transfer = decode_token_transfer(&log, &tokens).unwrap();
        assert_eq!(transfer.value, BigInt::from(5_000_000));
        assert_eq!(transfer.asset, "USDT");

        // 5 USDT pegged to USD at rates [USD=2000, EUR=1800] per ETH
        let fiat = token_fiat(&transfer, &fiats(), &[2000.0, 1800.0], "ETH");
        assert_eq!(fiat, vec![5.0, 4.5]);

        // unknown token contract → not decoded
        let mut foreign = log.clone();
        foreign.address = addr(0x99);
        assert!(decode_token_transfer(&foreign, &HashMap::new()).is_none());
    }

    #[test]
    fn contract_creation_marks_the_created_address() {
        let mut creation = tx(0xa1, 0, 0x01, 0x00, BigInt::zero(), 1);
        creation.to_address = None;
        creation.receipt_contract_address = Some(addr(0x0c));
        let output = project_simple(&[bundle(vec![creation], vec![], vec![])]);
        let delta = DbDelta::merge(output.per_tx.clone());

        let contract = delta
            .entity_updates
            .iter()
            .find(|e| e.identifier == addr(0x0c))
            .unwrap();
        assert!(contract.is_contract);
    }
}

