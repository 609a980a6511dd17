//! Row shapes of the transformed (analytics) keyspace.
//!
//! Every struct maps 1:1 onto a table; partition-key fields (`*_group`,
//! `*_secondary_group`) are stored explicitly so a row fully describes its
//! own placement and writes stay idempotent.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use num_bigint::BigInt;

use crate::{
    models::delta::{CurrencyValue, TxReference},
    Address, AddressId, BlockId, ClusterId, TxId,
};

/// Per-block fiat vector, ordered like the configured fiat currency list.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRateRow {
    pub block_id: BlockId,
    pub fiat_values: Vec<f32>,
}

/// Lookup index: textual prefix → canonical address → id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressIdByPrefixRow {
    pub address_prefix: String,
    pub address: Address,
    pub address_id: AddressId,
}

/// Reverse index: id bucket → id → canonical address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressIdByGroupRow {
    pub address_id_group: i32,
    pub address_id: AddressId,
    pub address: Address,
}

/// Per-address summary row.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressRow {
    pub address_id_group: i32,
    pub address_id: AddressId,
    pub address: Address,
    /// UTXO ledgers only.
    pub cluster_id: Option<ClusterId>,
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
    pub in_degree: i32,
    pub out_degree: i32,
    pub in_degree_zero_value: i32,
    pub out_degree_zero_value: i32,
    pub is_contract: bool,
}

/// One entry of an address's transaction list.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressTransactionRow {
    pub address_id_group: i32,
    pub address_id_secondary_group: i32,
    pub address_id: AddressId,
    pub currency: String,
    pub is_outgoing: bool,
    pub transaction_id: TxId,
    pub tx_reference: TxReference,
    pub value: BigInt,
}

/// Directed relation aggregates; the same shape backs the incoming and the
/// outgoing table (partitioned by dst resp. src).
#[derive(Debug, Clone, PartialEq)]
pub struct AddressRelationRow {
    pub partition_id_group: i32,
    pub partition_secondary_group: i32,
    pub src_address_id: AddressId,
    pub dst_address_id: AddressId,
    pub no_transactions: i32,
    pub value: CurrencyValue,
    pub token_values: HashMap<String, CurrencyValue>,
}

/// Highest secondary shard in use for one id bucket of a widened table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondaryGroupRow {
    pub id_group: i32,
    pub max_secondary_id: i32,
}

/// Signed per-asset balance (account ledgers).
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceRow {
    pub address_id_group: i32,
    pub address_id: AddressId,
    pub currency: String,
    pub balance: BigInt,
}

/// Lookup index: transaction-hash prefix → hash → dense id (account only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIdByPrefixRow {
    pub transaction_prefix: String,
    pub transaction: Vec<u8>,
    pub transaction_id: TxId,
}

/// Reverse index: tx id bucket → id → hash (account only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIdByGroupRow {
    pub transaction_id_group: i64,
    pub transaction_id: TxId,
    pub transaction: Vec<u8>,
}

/// Dense tx ids contained in one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTransactionsRow {
    pub block_id_group: i64,
    pub block_id: BlockId,
    pub txs: Vec<TxId>,
}

/// Per-cluster summary row (UTXO ledgers).
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRow {
    pub cluster_id_group: i32,
    pub cluster_id: ClusterId,
    pub no_addresses: i32,
    pub total_received: CurrencyValue,
    pub total_spent: CurrencyValue,
    pub first_tx_id: TxId,
    pub last_tx_id: TxId,
    pub no_incoming_txs: i32,
    pub no_outgoing_txs: i32,
    pub no_incoming_txs_zero_value: i32,
    pub no_outgoing_txs_zero_value: i32,
    pub in_degree: i32,
    pub out_degree: i32,
    pub in_degree_zero_value: i32,
    pub out_degree_zero_value: i32,
}

/// Cluster membership row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAddressRow {
    pub cluster_id_group: i32,
    pub cluster_id: ClusterId,
    pub address_id: AddressId,
}

/// Cluster-level relation aggregates, twin-written like address relations.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRelationRow {
    pub partition_id_group: i32,
    pub src_cluster_id: ClusterId,
    pub dst_cluster_id: ClusterId,
    pub no_transactions: i32,
    pub value: CurrencyValue,
}

/// One entry of a cluster's transaction list (UTXO ledgers).
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterTransactionRow {
    pub cluster_id_group: i32,
    pub cluster_id: ClusterId,
    pub transaction_id: TxId,
    pub is_outgoing: bool,
    pub value: BigInt,
}

/// Keyspace-wide totals, carried forward absolute on every committed batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryStatisticsRow {
    pub id: i32,
    pub timestamp: i64,
    pub no_blocks: i64,
    pub no_transactions: i64,
    pub no_addresses: i64,
    pub no_address_relations: i64,
    pub no_clusters: i64,
    pub no_cluster_relations: i64,
}

/// Static keyspace parameters readers must honour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationRow {
    pub keyspace_name: String,
    pub bucket_size: i32,
    pub tx_bucket_size: i64,
    pub block_bucket_size: i64,
    pub relation_secondary_shards: i32,
    pub address_prefix_length: i32,
    pub tx_prefix_length: i32,
    pub fiat_currencies: Vec<String>,
}

/// Token the account projector decodes transfers for.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenConfigurationRow {
    pub currency_ticker: String,
    pub token_address: Address,
    pub peg_currency: String,
    pub decimals: i32,
}

/// Single status row per keyspace: where the updater stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdaterStatusRow {
    pub keyspace_name: String,
    pub last_synced_block: BlockId,
    pub last_synced_block_timestamp: NaiveDateTime,
    pub highest_address_id: AddressId,
    pub timestamp: NaiveDateTime,
    pub write_new: bool,
    pub write_dirty: bool,
    pub runtime_seconds: i32,
}

/// Append-only run journal, keyed by `last_synced_block`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdaterHistoryRow {
    pub last_synced_block: BlockId,
    pub last_synced_block_timestamp: NaiveDateTime,
    pub highest_address_id: AddressId,
    pub timestamp: NaiveDateTime,
    pub write_new: bool,
    pub write_dirty: bool,
    pub runtime_seconds: i32,
}
