//! Read adapter for the raw keyspace.

use std::collections::HashMap;

use async_trait::async_trait;
use chaingraph_common::{
    models::{
        raw::{
            AccountTransaction, BlockBundle, BlockData, Log, RawBlock, RawExchangeRate, Trace,
            TxInputOutput, UtxoTransaction,
        },
        SchemaType,
    },
    storage::{RawGateway, StorageError},
    BlockId,
};
use chrono::NaiveDate;
use futures::future::try_join_all;
use num_bigint::BigInt;
use scylla::frame::value::CqlTimestamp;
use tracing::instrument;

use crate::{
    map_parse_error, map_query_error,
    session::StoreSession,
    values::{cql_to_date, cql_to_ts, date_to_cql, TxInputOutputUdt},
};

/// Raw store reader for one keyspace.
pub struct ScyllaRawStore {
    session: StoreSession,
    schema_type: SchemaType,
    block_bucket_size: i64,
}

impl ScyllaRawStore {
    pub fn new(session: StoreSession, schema_type: SchemaType, block_bucket_size: i64) -> Self {
        Self { session, schema_type, block_bucket_size }
    }

    fn groups(&self, start: BlockId, end: BlockId) -> Vec<i64> {
        (start / self.block_bucket_size..=end / self.block_bucket_size).collect()
    }

    async fn fetch_blocks(
        &self,
        start: BlockId,
        end: BlockId,
    ) -> Result<Vec<RawBlock>, StorageError> {
        let queries = self.groups(start, end).into_iter().map(|group| {
            let session = self.session.session.clone();
            async move {
                session
                    .query(
                        "SELECT block_id, block_hash, timestamp, no_transactions, miner, \
                         base_fee_per_gas, gas_used FROM block \
                         WHERE block_id_group = ? AND block_id >= ? AND block_id <= ?;",
                        (group, start, end),
                    )
                    .await
                    .map_err(map_query_error)
            }
        });

        let mut blocks = Vec::new();
        for result in try_join_all(queries).await? {
            for row in result.rows.unwrap_or_default() {
                let (block_id, block_hash, timestamp, no_transactions, miner, base_fee, gas_used) =
                    row.into_typed::<(
                        i64,
                        Vec<u8>,
                        CqlTimestamp,
                        Option<i32>,
                        Option<Vec<u8>>,
                        Option<i64>,
                        Option<i64>,
                    )>()
                    .map_err(map_parse_error)?;
                blocks.push(RawBlock {
                    block_id,
                    block_hash,
                    timestamp: cql_to_ts(timestamp),
                    no_transactions: no_transactions.unwrap_or(0),
                    miner,
                    base_fee_per_gas: base_fee,
                    gas_used,
                });
            }
        }
        blocks.sort_by_key(|b| b.block_id);
        Ok(blocks)
    }

    async fn fetch_utxo_txs(
        &self,
        start: BlockId,
        end: BlockId,
    ) -> Result<HashMap<BlockId, Vec<UtxoTransaction>>, StorageError> {
        let queries = self.groups(start, end).into_iter().map(|group| {
            let session = self.session.session.clone();
            async move {
                session
                    .query(
                        "SELECT block_id, tx_id, tx_hash, timestamp, coinbase, total_input, \
                         total_output, inputs, outputs FROM transaction \
                         WHERE block_id_group = ? AND block_id >= ? AND block_id <= ?;",
                        (group, start, end),
                    )
                    .await
                    .map_err(map_query_error)
            }
        });

        let mut by_block: HashMap<BlockId, Vec<UtxoTransaction>> = HashMap::new();
        for result in try_join_all(queries).await? {
            for row in result.rows.unwrap_or_default() {
                let (
                    block_id,
                    tx_id,
                    tx_hash,
                    timestamp,
                    coinbase,
                    total_input,
                    total_output,
                    inputs,
                    outputs,
                ) = row
                    .into_typed::<(
                        i64,
                        i64,
                        Vec<u8>,
                        CqlTimestamp,
                        Option<bool>,
                        Option<i64>,
                        Option<i64>,
                        Option<Vec<TxInputOutputUdt>>,
                        Option<Vec<TxInputOutputUdt>>,
                    )>()
                    .map_err(map_parse_error)?;
                by_block
                    .entry(block_id)
                    .or_default()
                    .push(UtxoTransaction {
                        tx_id,
                        tx_hash,
                        block_id,
                        timestamp: cql_to_ts(timestamp),
                        coinbase: coinbase.unwrap_or(false),
                        total_input: total_input.unwrap_or(0),
                        total_output: total_output.unwrap_or(0),
                        inputs: convert_inoutputs(inputs),
                        outputs: convert_inoutputs(outputs),
                    });
            }
        }
        for txs in by_block.values_mut() {
            txs.sort_by_key(|tx| tx.tx_id);
        }
        Ok(by_block)
    }

    async fn fetch_account_txs(
        &self,
        start: BlockId,
        end: BlockId,
    ) -> Result<HashMap<BlockId, Vec<AccountTransaction>>, StorageError> {
        let queries = self.groups(start, end).into_iter().map(|group| {
            let session = self.session.session.clone();
            async move {
                session
                    .query(
                        "SELECT block_id, transaction_index, tx_hash, from_address, to_address, \
                         value, gas_price, receipt_gas_used, receipt_contract_address, \
                         receipt_status FROM transaction \
                         WHERE block_id_group = ? AND block_id >= ? AND block_id <= ?;",
                        (group, start, end),
                    )
                    .await
                    .map_err(map_query_error)
            }
        });

        let mut by_block: HashMap<BlockId, Vec<AccountTransaction>> = HashMap::new();
        for result in try_join_all(queries).await? {
            for row in result.rows.unwrap_or_default() {
                let (
                    block_id,
                    transaction_index,
                    tx_hash,
                    from_address,
                    to_address,
                    value,
                    gas_price,
                    receipt_gas_used,
                    receipt_contract_address,
                    receipt_status,
                ) = row
                    .into_typed::<(
                        i64,
                        i32,
                        Vec<u8>,
                        Option<Vec<u8>>,
                        Option<Vec<u8>>,
                        Option<BigInt>,
                        Option<i64>,
                        Option<i64>,
                        Option<Vec<u8>>,
                        Option<i16>,
                    )>()
                    .map_err(map_parse_error)?;
                by_block
                    .entry(block_id)
                    .or_default()
                    .push(AccountTransaction {
                        tx_hash,
                        block_id,
                        transaction_index,
                        from_address,
                        to_address,
                        value: value.unwrap_or_default(),
                        gas_price: gas_price.unwrap_or(0),
                        receipt_gas_used: receipt_gas_used.unwrap_or(0),
                        receipt_contract_address,
                        receipt_status: receipt_status.unwrap_or(0),
                    });
            }
        }
        for txs in by_block.values_mut() {
            txs.sort_by_key(|tx| tx.transaction_index);
        }
        Ok(by_block)
    }

    async fn fetch_traces(
        &self,
        start: BlockId,
        end: BlockId,
    ) -> Result<HashMap<BlockId, Vec<Trace>>, StorageError> {
        let queries = self.groups(start, end).into_iter().map(|group| {
            let session = self.session.session.clone();
            async move {
                session
                    .query(
                        "SELECT block_id, trace_index, tx_hash, from_address, to_address, value, \
                         call_type, trace_type, status FROM trace \
                         WHERE block_id_group = ? AND block_id >= ? AND block_id <= ?;",
                        (group, start, end),
                    )
                    .await
                    .map_err(map_query_error)
            }
        });

        let mut by_block: HashMap<BlockId, Vec<Trace>> = HashMap::new();
        for result in try_join_all(queries).await? {
            for row in result.rows.unwrap_or_default() {
                let (
                    block_id,
                    trace_index,
                    tx_hash,
                    from_address,
                    to_address,
                    value,
                    call_type,
                    trace_type,
                    status,
                ) = row
                    .into_typed::<(
                        i64,
                        i32,
                        Option<Vec<u8>>,
                        Option<Vec<u8>>,
                        Option<Vec<u8>>,
                        Option<BigInt>,
                        Option<String>,
                        Option<String>,
                        Option<i16>,
                    )>()
                    .map_err(map_parse_error)?;
                by_block.entry(block_id).or_default().push(Trace {
                    block_id,
                    trace_index,
                    tx_hash,
                    from_address,
                    to_address,
                    value: value.unwrap_or_default(),
                    call_type,
                    trace_type: trace_type.unwrap_or_default(),
                    status: status.unwrap_or(0),
                });
            }
        }
        for traces in by_block.values_mut() {
            traces.sort_by_key(|t| t.trace_index);
        }
        Ok(by_block)
    }

    async fn fetch_logs(
        &self,
        start: BlockId,
        end: BlockId,
    ) -> Result<HashMap<BlockId, Vec<Log>>, StorageError> {
        let queries = self.groups(start, end).into_iter().map(|group| {
            let session = self.session.session.clone();
            async move {
                session
                    .query(
                        "SELECT block_id, log_index, tx_hash, address, topics, data FROM log \
                         WHERE block_id_group = ? AND block_id >= ? AND block_id <= ?;",
                        (group, start, end),
                    )
                    .await
                    .map_err(map_query_error)
            }
        });

        let mut by_block: HashMap<BlockId, Vec<Log>> = HashMap::new();
        for result in try_join_all(queries).await? {
            for row in result.rows.unwrap_or_default() {
                let (block_id, log_index, tx_hash, address, topics, data) = row
                    .into_typed::<(
                        i64,
                        i32,
                        Option<Vec<u8>>,
                        Option<Vec<u8>>,
                        Option<Vec<Vec<u8>>>,
                        Option<Vec<u8>>,
                    )>()
                    .map_err(map_parse_error)?;
                by_block.entry(block_id).or_default().push(Log {
                    block_id,
                    log_index,
                    tx_hash: tx_hash.unwrap_or_default(),
                    address: address.unwrap_or_default(),
                    topics: topics.unwrap_or_default(),
                    data: data.unwrap_or_default(),
                });
            }
        }
        for logs in by_block.values_mut() {
            logs.sort_by_key(|l| l.log_index);
        }
        Ok(by_block)
    }
}

fn convert_inoutputs(list: Option<Vec<TxInputOutputUdt>>) -> Vec<TxInputOutput> {
    list.unwrap_or_default()
        .into_iter()
        .map(|io| TxInputOutput {
            addresses: io.address.unwrap_or_default(),
            value: io.value,
            address_type: io.address_type,
        })
        .collect()
}

#[async_trait]
impl RawGateway for ScyllaRawStore {
    #[instrument(skip(self))]
    async fn tip(&self) -> Result<BlockId, StorageError> {
        let result = self
            .session
            .session
            .query("SELECT no_blocks FROM summary_statistics WHERE id = 0;", &[])
            .await
            .map_err(map_query_error)?;
        let row = result
            .rows
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| {
                StorageError::NotFound("summary_statistics row of raw keyspace".into())
            })?;
        let (no_blocks,) = row
            .into_typed::<(i64,)>()
            .map_err(map_parse_error)?;
        Ok(no_blocks - 1)
    }

    #[instrument(skip(self))]
    async fn block_bundles(
        &self,
        start: BlockId,
        end: BlockId,
    ) -> Result<Vec<BlockBundle>, StorageError> {
        if end < start {
            return Ok(Vec::new());
        }

        let blocks = self.fetch_blocks(start, end).await?;
        for (offset, block) in blocks.iter().enumerate() {
            let expected = start + offset as i64;
            if block.block_id != expected {
                return Err(StorageError::Gap(expected));
            }
        }
        if blocks.len() as i64 != end - start + 1 {
            return Err(StorageError::Gap(start + blocks.len() as i64));
        }

        match self.schema_type {
            SchemaType::Utxo => {
                let mut txs = self.fetch_utxo_txs(start, end).await?;
                Ok(blocks
                    .into_iter()
                    .map(|block| {
                        let data = BlockData::Utxo {
                            txs: txs.remove(&block.block_id).unwrap_or_default(),
                        };
                        BlockBundle { block, data }
                    })
                    .collect())
            }
            SchemaType::Account => {
                let (mut txs, mut traces, mut logs) = futures::try_join!(
                    self.fetch_account_txs(start, end),
                    self.fetch_traces(start, end),
                    self.fetch_logs(start, end)
                )?;
                Ok(blocks
                    .into_iter()
                    .map(|block| {
                        let data = BlockData::Account {
                            txs: txs.remove(&block.block_id).unwrap_or_default(),
                            traces: traces.remove(&block.block_id).unwrap_or_default(),
                            logs: logs.remove(&block.block_id).unwrap_or_default(),
                        };
                        BlockBundle { block, data }
                    })
                    .collect())
            }
        }
    }

    #[instrument(skip(self))]
    async fn exchange_rates(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<RawExchangeRate>, StorageError> {
        let mut dates = Vec::new();
        let mut d = from;
        while d <= to {
            dates.push(d);
            d = d.succ_opt().unwrap_or(d);
        }

        let queries = dates.into_iter().map(|date| {
            let session = self.session.session.clone();
            async move {
                session
                    .query(
                        "SELECT date, rates FROM exchange_rates WHERE date = ?;",
                        (date_to_cql(date),),
                    )
                    .await
                    .map_err(map_query_error)
            }
        });

        let mut rates = Vec::new();
        for result in try_join_all(queries).await? {
            for row in result.rows.unwrap_or_default() {
                let (date, tickers) = row
                    .into_typed::<(
                        scylla::frame::value::CqlDate,
                        Option<HashMap<String, f32>>,
                    )>()
                    .map_err(map_parse_error)?;
                rates.push(RawExchangeRate {
                    date: cql_to_date(date),
                    rates: tickers.unwrap_or_default(),
                });
            }
        }
        rates.sort_by_key(|r| r.date);
        Ok(rates)
    }
}
