//! The write unit of the transformed store.
//!
//! A [`RowOp`] is an idempotent upsert of one row, tagged with its table.
//! The aggregator emits the full batch as one `Vec<RowOp>`; the store
//! adapter chunks and retries it without inspecting the payload. Replaying
//! a batch therefore yields the same final state as writing it once.

use crate::models::transformed::*;

/// One table row to upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    ExchangeRate(ExchangeRateRow),
    AddressIdByPrefix(AddressIdByPrefixRow),
    AddressIdByGroup(AddressIdByGroupRow),
    Address(AddressRow),
    AddressTransaction(AddressTransactionRow),
    AddressTransactionsSecondaryIds(SecondaryGroupRow),
    AddressIncomingRelation(AddressRelationRow),
    AddressIncomingRelationsSecondaryIds(SecondaryGroupRow),
    AddressOutgoingRelation(AddressRelationRow),
    AddressOutgoingRelationsSecondaryIds(SecondaryGroupRow),
    Balance(BalanceRow),
    TxIdByPrefix(TxIdByPrefixRow),
    TxIdByGroup(TxIdByGroupRow),
    BlockTransactions(BlockTransactionsRow),
    Cluster(ClusterRow),
    ClusterAddress(ClusterAddressRow),
    ClusterIncomingRelation(ClusterRelationRow),
    ClusterOutgoingRelation(ClusterRelationRow),
    ClusterTransaction(ClusterTransactionRow),
    SummaryStatistics(SummaryStatisticsRow),
    UpdaterStatus(UpdaterStatusRow),
    UpdaterHistory(UpdaterHistoryRow),
}

impl RowOp {
    /// Table name, used for logging and write summaries.
    pub fn table(&self) -> &'static str {
        match self {
            RowOp::ExchangeRate(_) => "exchange_rates",
            RowOp::AddressIdByPrefix(_) => "address_ids_by_address_prefix",
            RowOp::AddressIdByGroup(_) => "address_ids_by_address_id_group",
            RowOp::Address(_) => "address",
            RowOp::AddressTransaction(_) => "address_transactions",
            RowOp::AddressTransactionsSecondaryIds(_) => "address_transactions_secondary_ids",
            RowOp::AddressIncomingRelation(_) => "address_incoming_relations",
            RowOp::AddressIncomingRelationsSecondaryIds(_) => {
                "address_incoming_relations_secondary_ids"
            }
            RowOp::AddressOutgoingRelation(_) => "address_outgoing_relations",
            RowOp::AddressOutgoingRelationsSecondaryIds(_) => {
                "address_outgoing_relations_secondary_ids"
            }
            RowOp::Balance(_) => "balance",
            RowOp::TxIdByPrefix(_) => "transaction_ids_by_transaction_prefix",
            RowOp::TxIdByGroup(_) => "transaction_ids_by_transaction_id_group",
            RowOp::BlockTransactions(_) => "block_transactions",
            RowOp::Cluster(_) => "cluster",
            RowOp::ClusterAddress(_) => "cluster_addresses",
            RowOp::ClusterIncomingRelation(_) => "cluster_incoming_relations",
            RowOp::ClusterOutgoingRelation(_) => "cluster_outgoing_relations",
            RowOp::ClusterTransaction(_) => "cluster_transactions",
            RowOp::SummaryStatistics(_) => "summary_statistics",
            RowOp::UpdaterStatus(_) => "delta_updater_status",
            RowOp::UpdaterHistory(_) => "delta_updater_history",
        }
    }

    /// True for the bookkeeping rows that commit a batch. These must be
    /// written strictly after everything else in the batch.
    pub fn is_commit_marker(&self) -> bool {
        matches!(self, RowOp::UpdaterStatus(_) | RowOp::UpdaterHistory(_))
    }
}

/// Per-table counts of a change set, for one-line write summaries.
pub fn change_summary(ops: &[RowOp]) -> String {
    let mut counts: std::collections::BTreeMap<&'static str, usize> = Default::default();
    for op in ops {
        *counts.entry(op.table()).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(table, n)| format!("{table}: {n}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_per_table() {
        let ops = vec![
            RowOp::ExchangeRate(ExchangeRateRow { block_id: 1, fiat_values: vec![] }),
            RowOp::ExchangeRate(ExchangeRateRow { block_id: 2, fiat_values: vec![] }),
            RowOp::BlockTransactions(BlockTransactionsRow {
                block_id_group: 0,
                block_id: 1,
                txs: vec![],
            }),
        ];
        assert_eq!(change_summary(&ops), "block_transactions: 1; exchange_rates: 2");
    }
}
