//! Status and history bookkeeping.
//!
//! One status row per keyspace answers "where did we stop?"; the history
//! table keeps one row per committed batch. Both are written strictly
//! after the batch's data rows — they are the commit point.

use chaingraph_common::{
    models::{
        rows::RowOp,
        transformed::{SummaryStatisticsRow, UpdaterHistoryRow, UpdaterStatusRow},
    },
    AddressId, BlockId,
};
use chrono::NaiveDateTime;

use crate::updater::{aggregator::BatchStats, UpdateError};

pub struct StatusTracker {
    keyspace: String,
    statistics: SummaryStatisticsRow,
    /// With a user-supplied end block the block count is not advanced, so
    /// a later full catch-up run still sees the true high-water mark.
    patch_mode: bool,
}

impl StatusTracker {
    pub fn new(
        keyspace: &str,
        current: Option<SummaryStatisticsRow>,
        patch_mode: bool,
    ) -> Self {
        Self {
            keyspace: keyspace.to_string(),
            statistics: current.unwrap_or_default(),
            patch_mode,
        }
    }

    /// Bookkeeping rows committing one batch: summary statistics plus the
    /// status and history rows.
    pub fn commit_ops(
        &mut self,
        last_block: BlockId,
        last_block_timestamp: NaiveDateTime,
        stats: &BatchStats,
        highest_address_id: AddressId,
        runtime_seconds: i32,
    ) -> Vec<RowOp> {
        if !self.patch_mode {
            self.statistics.no_blocks = last_block + 1;
        }
        self.statistics.timestamp = last_block_timestamp.and_utc().timestamp();
        self.statistics.no_transactions += stats.transactions as i64;
        self.statistics.no_addresses += stats.new_addresses as i64;
        self.statistics.no_address_relations += stats.new_address_relations as i64;
        self.statistics.no_clusters += stats.new_clusters as i64;
        self.statistics.no_cluster_relations += stats.new_cluster_relations as i64;

        let now = chrono::Utc::now().naive_utc();
        vec![
            RowOp::SummaryStatistics(self.statistics.clone()),
            RowOp::UpdaterHistory(UpdaterHistoryRow {
                last_synced_block: last_block,
                last_synced_block_timestamp: last_block_timestamp,
                highest_address_id,
                timestamp: now,
                write_new: false,
                write_dirty: false,
                runtime_seconds,
            }),
            RowOp::UpdaterStatus(UpdaterStatusRow {
                keyspace_name: self.keyspace.clone(),
                last_synced_block: last_block,
                last_synced_block_timestamp: last_block_timestamp,
                highest_address_id,
                timestamp: now,
                write_new: false,
                write_dirty: false,
                runtime_seconds,
            }),
        ]
    }
}

/// Verifies the run journal: blocks strictly increase, wall-clock weakly
/// increases, no batch is recorded twice.
pub fn validate_history(
    rows: &[UpdaterHistoryRow],
    tolerate_missing: bool,
) -> Result<(), UpdateError> {
    if rows.is_empty() {
        if tolerate_missing {
            return Ok(());
        }
        return Err(UpdateError::InvariantViolation(
            "no delta updater history; pass --tolerate-missing-history for pre-existing keyspaces"
                .into(),
        ));
    }
    let mut sorted = rows.to_vec();
    sorted.sort_by_key(|r| r.last_synced_block);
    for pair in sorted.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.last_synced_block == b.last_synced_block {
            return Err(UpdateError::InvariantViolation(format!(
                "duplicate history row for block {}",
                a.last_synced_block
            )));
        }
        if a.timestamp > b.timestamp {
            return Err(UpdateError::InvariantViolation(format!(
                "history timestamps go backwards between blocks {} and {}",
                a.last_synced_block, b.last_synced_block
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    fn history(block: BlockId, ts_seconds: i64) -> UpdaterHistoryRow {
        UpdaterHistoryRow {
            last_synced_block: block,
            last_synced_block_timestamp: DateTime::from_timestamp(ts_seconds, 0)
                .unwrap()
                .naive_utc(),
            highest_address_id: 10,
            timestamp: DateTime::from_timestamp(ts_seconds, 0).unwrap().naive_utc(),
            write_new: false,
            write_dirty: false,
            runtime_seconds: 1,
        }
    }

    #[test]
    fn valid_history_passes() {
        let rows = vec![history(10, 100), history(20, 200), history(30, 200)];
        assert!(validate_history(&rows, false).is_ok());
    }

    #[test]
    fn duplicate_blocks_are_rejected() {
        let rows = vec![history(10, 100), history(10, 200)];
        assert!(matches!(
            validate_history(&rows, false),
            Err(UpdateError::InvariantViolation(_))
        ));
    }

    #[test]
    fn backwards_timestamps_are_rejected() {
        let rows = vec![history(10, 200), history(20, 100)];
        assert!(validate_history(&rows, false).is_err());
    }

    #[test]
    fn missing_history_is_tolerable_only_on_request() {
        assert!(validate_history(&[], false).is_err());
        assert!(validate_history(&[], true).is_ok());
    }

    #[test]
    fn commit_ops_carry_counts_forward_absolute() {
        let mut tracker = StatusTracker::new(
            "btc_transformed",
            Some(SummaryStatisticsRow {
                no_blocks: 100,
                no_transactions: 500,
                no_addresses: 50,
                ..Default::default()
            }),
            false,
        );
        let stats = BatchStats {
            new_addresses: 5,
            new_clusters: 2,
            new_address_relations: 8,
            new_cluster_relations: 4,
            transactions: 20,
        };
        let ops = tracker.commit_ops(
            109,
            DateTime::from_timestamp(1_000, 0).unwrap().naive_utc(),
            &stats,
            54,
            3,
        );
        assert_eq!(ops.len(), 3);
        let RowOp::SummaryStatistics(summary) = &ops[0] else {
            panic!("expected summary row first");
        };
        assert_eq!(summary.no_blocks, 110);
        assert_eq!(summary.no_transactions, 520);
        assert_eq!(summary.no_addresses, 55);
        let RowOp::UpdaterStatus(status) = &ops[2] else {
            panic!("expected status row last");
        };
        assert_eq!(status.last_synced_block, 109);
        assert_eq!(status.highest_address_id, 54);
        assert!(ops[1].is_commit_marker() && ops[2].is_commit_marker());
    }
}
