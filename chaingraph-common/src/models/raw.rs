//! Row shapes of the raw (ledger-faithful, append-only) keyspace.

use chrono::NaiveDateTime;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};

use crate::{Address, BlockId, TxId};

/// Block header as stored in the raw keyspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub block_id: BlockId,
    pub block_hash: Vec<u8>,
    pub timestamp: NaiveDateTime,
    pub no_transactions: i32,
    /// Account ledgers only: block producer credited with fees and rewards.
    pub miner: Option<Address>,
    /// Account ledgers only (EIP-1559): burnt base fee input.
    pub base_fee_per_gas: Option<i64>,
    pub gas_used: Option<i64>,
}

/// One entry of a UTXO transaction's input or output list.
///
/// `addresses` carries zero entries for non-standard scripts and more than
/// one for bare multisig; only single-address entries take part in flow
/// regularization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxInputOutput {
    pub addresses: Vec<String>,
    pub value: i64,
    pub address_type: Option<i16>,
}

/// UTXO transaction with its dense id already assigned at ingest time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtxoTransaction {
    pub tx_id: TxId,
    pub tx_hash: Vec<u8>,
    pub block_id: BlockId,
    pub timestamp: NaiveDateTime,
    pub coinbase: bool,
    pub total_input: i64,
    pub total_output: i64,
    pub inputs: Vec<TxInputOutput>,
    pub outputs: Vec<TxInputOutput>,
}

/// Account-model transaction (external message).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountTransaction {
    pub tx_hash: Vec<u8>,
    pub block_id: BlockId,
    pub transaction_index: i32,
    pub from_address: Option<Address>,
    pub to_address: Option<Address>,
    pub value: BigInt,
    pub gas_price: i64,
    pub receipt_gas_used: i64,
    /// Created contract, if this was a deployment.
    pub receipt_contract_address: Option<Address>,
    pub receipt_status: i16,
}

impl AccountTransaction {
    pub fn is_successful(&self) -> bool {
        self.receipt_status == 1
    }

    /// Fee paid by the sender, attributed as spent value.
    pub fn fee(&self) -> BigInt {
        BigInt::from(self.receipt_gas_used) * BigInt::from(self.gas_price)
    }
}

/// Internal call produced by execution of an account-model transaction.
///
/// Reward traces carry no transaction hash; they credit the block producer
/// outside of any transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub block_id: BlockId,
    pub trace_index: i32,
    pub tx_hash: Option<Vec<u8>>,
    pub from_address: Option<Address>,
    pub to_address: Option<Address>,
    pub value: BigInt,
    pub call_type: Option<String>,
    pub trace_type: String,
    pub status: i16,
}

impl Trace {
    pub fn is_successful(&self) -> bool {
        self.status == 1
    }

    pub fn is_call(&self) -> bool {
        self.call_type.as_deref() == Some("call")
    }

    pub fn is_reward(&self) -> bool {
        self.tx_hash.is_none()
    }

    pub fn is_contract_creation(&self) -> bool {
        self.trace_type == "create"
    }
}

/// Raw event log; token transfers are decoded from these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub block_id: BlockId,
    pub tx_hash: Vec<u8>,
    pub log_index: i32,
    pub address: Address,
    pub topics: Vec<Vec<u8>>,
    pub data: Vec<u8>,
}

/// Ledger-specific payload of a [`BlockBundle`].
#[derive(Debug, Clone, PartialEq)]
pub enum BlockData {
    Utxo { txs: Vec<UtxoTransaction> },
    Account { txs: Vec<AccountTransaction>, traces: Vec<Trace>, logs: Vec<Log> },
}

/// Everything the projector needs about one raw block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockBundle {
    pub block: RawBlock,
    pub data: BlockData,
}

impl BlockBundle {
    pub fn block_id(&self) -> BlockId {
        self.block.block_id
    }
}

/// Raw exchange-rate row: one per UTC date, fiat rates keyed by ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExchangeRate {
    pub date: chrono::NaiveDate,
    pub rates: std::collections::HashMap<String, f32>,
}
