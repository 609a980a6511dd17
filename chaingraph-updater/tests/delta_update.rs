//! End-to-end engine tests against the in-memory gateways, covering the
//! catch-up, projection, forward-fill and crash-replay behaviors.

use std::collections::HashMap;

use chaingraph_common::models::{
    raw::{
        AccountTransaction, BlockBundle, BlockData, RawBlock, RawExchangeRate, TxInputOutput,
        UtxoTransaction,
    },
    SchemaType,
};
use chaingraph_updater::testing::{InMemoryRawStore, InMemoryTransformedStore, StoreSnapshot};
use chaingraph_updater::updater::{DeltaUpdater, UpdateError, UpdaterSettings};
use chrono::{NaiveDate, NaiveDateTime};
use num_bigint::BigInt;
use pretty_assertions::assert_eq;
use tokio::sync::watch;

fn ts(day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 1, day)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

fn rate_row(day: u32, usd: f32, eur: f32) -> RawExchangeRate {
    RawExchangeRate {
        date: NaiveDate::from_ymd_opt(2021, 1, day).unwrap(),
        rates: HashMap::from([("USD".to_string(), usd), ("EUR".to_string(), eur)]),
    }
}

fn io(addr: &str, value: i64) -> TxInputOutput {
    TxInputOutput { addresses: vec![addr.to_string()], value, address_type: Some(0) }
}

fn utxo_block(block_id: i64, day: u32, txs: Vec<UtxoTransaction>) -> BlockBundle {
    BlockBundle {
        block: RawBlock {
            block_id,
            block_hash: vec![block_id as u8; 4],
            timestamp: ts(day),
            no_transactions: txs.len() as i32,
            ..Default::default()
        },
        data: BlockData::Utxo { txs },
    }
}

fn utxo_tx(
    tx_id: i64,
    block_id: i64,
    day: u32,
    coinbase: bool,
    inputs: Vec<TxInputOutput>,
    outputs: Vec<TxInputOutput>,
) -> UtxoTransaction {
    UtxoTransaction {
        tx_id,
        tx_hash: vec![tx_id as u8; 8],
        block_id,
        timestamp: ts(day),
        coinbase,
        total_input: inputs.iter().map(|i| i.value).sum(),
        total_output: outputs.iter().map(|o| o.value).sum(),
        inputs,
        outputs,
    }
}

fn settings(schema_type: SchemaType, ticker: &str) -> UpdaterSettings {
    UpdaterSettings {
        schema_type,
        native_ticker: ticker.to_string(),
        batch_size: 10,
        safety_margin: 1,
        end_block: None,
        forward_fill_rates: false,
        pedantic: true,
    }
}

async fn run(
    raw: &InMemoryRawStore,
    transformed: &InMemoryTransformedStore,
    settings: UpdaterSettings,
) -> Result<chaingraph_updater::updater::RunSummary, UpdateError> {
    let (_tx, cancel) = watch::channel(false);
    let mut updater = DeltaUpdater::new(raw, transformed, settings, cancel).await?;
    updater.run().await
}

/// Blocks 0–3: an empty block, a coinbase paying A and B, a two-input
/// two-output spend, and the safety-margin block.
fn utxo_fixture() -> InMemoryRawStore {
    let coinbase = utxo_tx(1, 1, 1, true, vec![], vec![io("A", 50), io("B", 10)]);
    let spend = utxo_tx(
        2,
        2,
        2,
        false,
        vec![io("A", 50), io("B", 10)],
        vec![io("C", 55), io("D", 4)],
    );
    InMemoryRawStore::new(
        vec![
            utxo_block(0, 1, vec![]),
            utxo_block(1, 1, vec![coinbase]),
            utxo_block(2, 2, vec![spend]),
            utxo_block(3, 2, vec![]),
        ],
        vec![rate_row(1, 2.0, 1.0), rate_row(2, 2.0, 1.0)],
    )
}

#[tokio::test]
async fn empty_catch_up_writes_nothing() {
    let raw = InMemoryRawStore::new(
        vec![utxo_block(0, 1, vec![]), utxo_block(1, 1, vec![])],
        vec![rate_row(1, 2.0, 1.0)],
    );
    let transformed = InMemoryTransformedStore::new("btc_transformed");
    let mut cfg = settings(SchemaType::Utxo, "BTC");
    cfg.safety_margin = 3;

    let summary = run(&raw, &transformed, cfg).await.unwrap();
    assert_eq!(summary.batches, 0);
    assert!(transformed.journal().is_empty());
    assert!(transformed.snapshot().status.is_none());
}

#[tokio::test]
async fn utxo_coinbase_and_spend_build_the_full_view() {
    let raw = utxo_fixture();
    let transformed = InMemoryTransformedStore::new("btc_transformed");

    let summary = run(&raw, &transformed, settings(SchemaType::Utxo, "BTC"))
        .await
        .unwrap();
    assert_eq!(summary.last_block, Some(2));

    let snapshot = transformed.snapshot();

    // ids: coinbase pinned to 0, outputs before inputs in sighting order
    let id = |name: &str| snapshot.address_ids[&name.as_bytes().to_vec()];
    assert_eq!(id("coinbase"), 0);
    assert_eq!(id("A"), 1);
    assert_eq!(id("B"), 2);
    assert_eq!(id("C"), 3);
    assert_eq!(id("D"), 4);

    let a = &snapshot.addresses[&1];
    assert_eq!(a.total_received.value, BigInt::from(50));
    assert_eq!(a.total_spent.value, BigInt::from(50));
    assert_eq!(a.no_incoming_txs, 1);
    assert_eq!(a.no_outgoing_txs, 1);
    assert_eq!(a.first_tx_id, 1);
    assert_eq!(a.last_tx_id, 2);

    let c = &snapshot.addresses[&3];
    assert_eq!(c.total_received.value, BigInt::from(55));
    assert_eq!(c.first_tx_id, 2);
    assert_eq!(c.last_tx_id, 2);

    // proportional split: A carries 50/60, B 10/60 of each output
    let rel = |src: i32, dst: i32| snapshot.outgoing_relations[&(src, dst)].value.value.clone();
    assert_eq!(rel(1, 3), BigInt::from(46));
    assert_eq!(rel(1, 4), BigInt::from(3));
    assert_eq!(rel(2, 3), BigInt::from(9));
    assert_eq!(rel(2, 4), BigInt::from(1));

    // twin rows carry identical aggregates
    for (pair, out_row) in &snapshot.outgoing_relations {
        let in_row = &snapshot.incoming_relations[pair];
        assert_eq!(out_row.no_transactions, in_row.no_transactions);
        assert_eq!(out_row.value, in_row.value);
    }
    // the coinbase payout creates no relations
    assert!(!snapshot.outgoing_relations.keys().any(|(src, _)| *src == 0));

    // multi-input heuristic: A and B share a cluster, C and D do not
    let cluster = |address_id: i32| snapshot.addresses[&address_id].cluster_id.unwrap();
    assert_eq!(cluster(1), cluster(2));
    assert_ne!(cluster(3), cluster(4));
    assert_ne!(cluster(1), cluster(3));
    let ab = &snapshot.clusters[&cluster(1)];
    assert_eq!(ab.no_addresses, 2);
    assert_eq!(ab.total_received.value, BigInt::from(60));

    // per-block fiat vectors were materialized
    assert_eq!(snapshot.exchange_rates[&2], vec![2.0, 1.0]);

    let status = snapshot.status.unwrap();
    assert_eq!(status.last_synced_block, 2);
    assert_eq!(status.highest_address_id, 4);
    let summary_row = snapshot.summary.unwrap();
    assert_eq!(summary_row.no_blocks, 3);
    assert_eq!(summary_row.no_transactions, 2);
    assert_eq!(summary_row.no_addresses, 4);
}

#[tokio::test]
async fn single_block_batches_produce_the_same_address_state() {
    let raw = utxo_fixture();

    let big = InMemoryTransformedStore::new("btc_transformed");
    run(&raw, &big, settings(SchemaType::Utxo, "BTC"))
        .await
        .unwrap();

    let small = InMemoryTransformedStore::new("btc_transformed");
    let mut cfg = settings(SchemaType::Utxo, "BTC");
    cfg.batch_size = 1;
    let summary = run(&raw, &small, cfg).await.unwrap();
    assert_eq!(summary.batches, 3);

    // clustering is the one batch-dependent projection: a multi-input tx
    // can only union addresses created within its own batch, existing
    // clusters are never merged retroactively
    assert_eq!(
        without_clusters(normalized(big.snapshot())),
        without_clusters(normalized(small.snapshot())),
        "batch size must not influence the derived address state"
    );
    let small_snapshot = small.snapshot();
    let cluster =
        |id: i32| small_snapshot.addresses[&id].cluster_id.unwrap();
    // A and B were created as singletons in the first batch and keep
    // their clusters when later spent together
    assert_ne!(cluster(1), cluster(2));

    // history is strictly monotone, one row per batch
    let history: Vec<i64> = small_snapshot.history.keys().copied().collect();
    assert_eq!(history, vec![0, 1, 2]);
}

#[tokio::test]
async fn rerunning_a_caught_up_keyspace_changes_nothing() {
    let raw = utxo_fixture();
    let transformed = InMemoryTransformedStore::new("btc_transformed");
    run(&raw, &transformed, settings(SchemaType::Utxo, "BTC"))
        .await
        .unwrap();
    let before = transformed.snapshot();

    let summary = run(&raw, &transformed, settings(SchemaType::Utxo, "BTC"))
        .await
        .unwrap();
    assert_eq!(summary.batches, 0);
    assert_eq!(normalized(before), normalized(transformed.snapshot()));
}

/// Scenario: the process dies after WRITING but before STATUS_UPDATE. The
/// restart replays the batch; the final state must match a run that never
/// crashed.
#[tokio::test]
async fn crash_before_status_update_replays_identically() {
    let raw = utxo_fixture();

    let reference = InMemoryTransformedStore::new("btc_transformed");
    run(&raw, &reference, settings(SchemaType::Utxo, "BTC"))
        .await
        .unwrap();

    let crashing = InMemoryTransformedStore::new("btc_transformed");
    crashing
        .fail_commit
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let err = run(&raw, &crashing, settings(SchemaType::Utxo, "BTC"))
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::Storage(_)));

    // data rows of the first batch are in, but no commit happened
    let partial = crashing.snapshot();
    assert!(partial.status.is_none());
    assert!(!partial.addresses.is_empty());

    crashing
        .fail_commit
        .store(false, std::sync::atomic::Ordering::SeqCst);
    run(&raw, &crashing, settings(SchemaType::Utxo, "BTC"))
        .await
        .unwrap();

    assert_eq!(normalized(reference.snapshot()), normalized(crashing.snapshot()));
}

#[tokio::test]
async fn missing_rates_abort_unless_forward_filled() {
    // rates exist for Jan 1 only, the batch's blocks are on Jan 2
    let raw = InMemoryRawStore::new(
        vec![
            utxo_block(0, 2, vec![utxo_tx(0, 0, 2, true, vec![], vec![io("A", 5)])]),
            utxo_block(1, 2, vec![]),
        ],
        vec![rate_row(1, 2.0, 1.0)],
    );

    let strict = InMemoryTransformedStore::new("btc_transformed");
    let err = run(&raw, &strict, settings(SchemaType::Utxo, "BTC"))
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::RateMissing(0)));
    assert!(strict.journal().is_empty());

    let filled = InMemoryTransformedStore::new("btc_transformed");
    let mut cfg = settings(SchemaType::Utxo, "BTC");
    cfg.forward_fill_rates = true;
    run(&raw, &filled, cfg).await.unwrap();
    assert_eq!(filled.snapshot().exchange_rates[&0], vec![2.0, 1.0]);
}

#[tokio::test]
async fn account_success_and_failure_follow_the_projection_rules() {
    let eth = |whole: i64| BigInt::from(whole) * BigInt::from(10u64).pow(18);
    let addr = |tag: u8| vec![tag; 20];
    let (x, y, z, miner) = (addr(0x01), addr(0x02), addr(0x03), addr(0xee));

    let tx = |hash: u8, index: i32, to: &Vec<u8>, value: BigInt, status: i16| AccountTransaction {
        tx_hash: vec![hash; 32],
        block_id: 1,
        transaction_index: index,
        from_address: Some(x.clone()),
        to_address: Some(to.clone()),
        value,
        gas_price: 10,
        receipt_gas_used: 21_000,
        receipt_contract_address: None,
        receipt_status: status,
    };

    let block = |block_id: i64, txs: Vec<AccountTransaction>, with_miner: bool| BlockBundle {
        block: RawBlock {
            block_id,
            block_hash: vec![block_id as u8; 4],
            timestamp: ts(1),
            no_transactions: txs.len() as i32,
            miner: with_miner.then(|| miner.clone()),
            base_fee_per_gas: with_miner.then_some(5),
            gas_used: with_miner.then_some(42_000),
            ..Default::default()
        },
        data: BlockData::Account { txs, traces: vec![], logs: vec![] },
    };

    let raw = InMemoryRawStore::new(
        vec![
            block(0, vec![], false),
            block(
                1,
                vec![tx(0xa1, 0, &y, eth(1), 1), tx(0xa2, 1, &z, eth(2), 0)],
                true,
            ),
            block(2, vec![], false),
        ],
        vec![rate_row(1, 2000.0, 1800.0)],
    );
    let transformed = InMemoryTransformedStore::new("eth_transformed");

    run(&raw, &transformed, settings(SchemaType::Account, "ETH"))
        .await
        .unwrap();
    let snapshot = transformed.snapshot();

    let x_id = snapshot.address_ids[&x];
    let x_row = &snapshot.addresses[&x_id];
    assert_eq!(x_row.no_outgoing_txs, 2);
    assert_eq!(x_row.no_outgoing_txs_zero_value, 1);
    assert_eq!(x_row.total_spent.value, eth(1));
    assert_eq!(x_row.total_spent.fiat_values, vec![2000.0, 1800.0]);

    let y_id = snapshot.address_ids[&y];
    let z_id = snapshot.address_ids[&z];
    assert!(snapshot.outgoing_relations.contains_key(&(x_id, y_id)));
    assert!(!snapshot.outgoing_relations.contains_key(&(x_id, z_id)));
    assert_eq!(x_row.out_degree, 1);

    // dense tx ids in block order, both transactions indexed
    assert_eq!(snapshot.transaction_ids[&vec![0xa1; 32]], 0);
    assert_eq!(snapshot.transaction_ids[&vec![0xa2; 32]], 1);

    // fees for both txs, transfer value only for the successful one
    let fee = BigInt::from(210_000);
    assert_eq!(
        snapshot.balances[&(x_id, "ETH".to_string())],
        -eth(1) - BigInt::from(2) * &fee
    );
    assert_eq!(snapshot.balances[&(y_id, "ETH".to_string())], eth(1));
    let miner_id = snapshot.address_ids[&miner];
    let burnt = BigInt::from(5i64 * 42_000);
    assert_eq!(
        snapshot.balances[&(miner_id, "ETH".to_string())],
        BigInt::from(2) * &fee - burnt
    );
}

/// Strips cluster-derived state, which depends on how blocks were cut
/// into batches.
fn without_clusters(mut snapshot: StoreSnapshot) -> StoreSnapshot {
    snapshot.clusters.clear();
    snapshot.cluster_outgoing_relations.clear();
    snapshot.cluster_incoming_relations.clear();
    for row in snapshot.addresses.values_mut() {
        row.cluster_id = None;
    }
    if let Some(summary) = snapshot.summary.as_mut() {
        summary.no_clusters = 0;
        summary.no_cluster_relations = 0;
    }
    snapshot
}

/// Strips wall-clock fields and the per-batch run journal, which
/// legitimately differ between runs of different batch layouts.
fn normalized(mut snapshot: StoreSnapshot) -> StoreSnapshot {
    let zero = NaiveDate::from_ymd_opt(1970, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    if let Some(status) = snapshot.status.as_mut() {
        status.timestamp = zero;
        status.runtime_seconds = 0;
    }
    snapshot.history.clear();
    snapshot
}
