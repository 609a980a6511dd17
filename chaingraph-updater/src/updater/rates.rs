//! Per-batch exchange-rate attachment.
//!
//! The attacher materializes a dense `block → fiat vector` slice from the
//! raw per-date rate table before projection starts. Mid-batch rate
//! updates are invisible: the slice is a pure function of the rate table
//! snapshot at batch start.

use std::collections::HashMap;

use chaingraph_common::{
    models::{
        raw::{BlockBundle, RawExchangeRate},
        rows::RowOp,
        transformed::ExchangeRateRow,
    },
    storage::RawGateway,
    BlockId,
};
use chrono::{Duration, NaiveDate};
use tracing::warn;

use crate::updater::UpdateError;

/// How far back the first fetch reaches to serve forward-fill lookups.
const FORWARD_FILL_LOOKBACK_DAYS: i64 = 30;
/// Widened second fetch before giving up on a gap.
const FORWARD_FILL_MAX_LOOKBACK_DAYS: i64 = 365;

/// Dense per-block fiat vectors for one batch.
#[derive(Debug, Clone, Default)]
pub struct RateSlice {
    by_block: HashMap<BlockId, Vec<f32>>,
}

impl RateSlice {
    pub fn get(&self, block_id: BlockId) -> &[f32] {
        self.by_block
            .get(&block_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Upserts for the transformed `exchange_rates` table, block-ascending.
    pub fn to_row_ops(&self) -> Vec<RowOp> {
        let mut blocks: Vec<_> = self.by_block.iter().collect();
        blocks.sort_by_key(|(block_id, _)| **block_id);
        blocks
            .into_iter()
            .map(|(block_id, fiat_values)| {
                RowOp::ExchangeRate(ExchangeRateRow {
                    block_id: *block_id,
                    fiat_values: fiat_values.clone(),
                })
            })
            .collect()
    }

    #[cfg(test)]
    pub fn from_map(by_block: HashMap<BlockId, Vec<f32>>) -> Self {
        Self { by_block }
    }
}

pub struct RateAttacher {
    fiat_currencies: Vec<String>,
    forward_fill: bool,
}

impl RateAttacher {
    pub fn new(fiat_currencies: Vec<String>, forward_fill: bool) -> Self {
        Self { fiat_currencies, forward_fill }
    }

    /// Builds the batch's rate slice. In strict mode any block without a
    /// complete rate row for its date fails the batch with `RateMissing`;
    /// with forward-fill the most recent prior row is used and each gap is
    /// logged once.
    pub async fn build_slice(
        &self,
        raw: &dyn RawGateway,
        bundles: &[BlockBundle],
    ) -> Result<RateSlice, UpdateError> {
        if bundles.is_empty() {
            return Ok(RateSlice::default());
        }

        let dates: Vec<(BlockId, NaiveDate)> = bundles
            .iter()
            .map(|b| (b.block_id(), b.block.timestamp.date()))
            .collect();
        let min_date = dates.iter().map(|(_, d)| *d).min().unwrap();
        let max_date = dates.iter().map(|(_, d)| *d).max().unwrap();

        let fetch_from = if self.forward_fill {
            min_date - Duration::days(FORWARD_FILL_LOOKBACK_DAYS)
        } else {
            min_date
        };
        let mut rows = raw.exchange_rates(fetch_from, max_date).await?;

        let mut slice = RateSlice::default();
        let mut gap_logged: Option<NaiveDate> = None;
        for (block_id, date) in &dates {
            match self.vector_at(&rows, *date) {
                Some(vector) => {
                    slice.by_block.insert(*block_id, vector);
                }
                None if self.forward_fill => {
                    // widen the window once before declaring the gap fatal
                    let widened_from = min_date - Duration::days(FORWARD_FILL_MAX_LOOKBACK_DAYS);
                    let mut widened = raw.exchange_rates(widened_from, fetch_from).await?;
                    widened.append(&mut rows);
                    rows = widened;
                    let vector = self
                        .vector_at(&rows, *date)
                        .ok_or(UpdateError::RateMissing(*block_id))?;
                    if gap_logged != Some(*date) {
                        warn!(block_id, %date, "No exchange rate for date, forward-filling");
                        gap_logged = Some(*date);
                    }
                    slice.by_block.insert(*block_id, vector);
                }
                None => return Err(UpdateError::RateMissing(*block_id)),
            }
        }
        Ok(slice)
    }

    /// The fiat vector effective at `date`: the exact row, or with
    /// forward-fill the latest complete row at an earlier date.
    fn vector_at(&self, rows: &[RawExchangeRate], date: NaiveDate) -> Option<Vec<f32>> {
        // rows are date-ascending; binary search for the partition point
        let idx = rows.partition_point(|r| r.date <= date);
        if self.forward_fill {
            rows[..idx]
                .iter()
                .rev()
                .find_map(|r| self.complete_vector(r))
        } else {
            rows[..idx]
                .iter()
                .rev()
                .find(|r| r.date == date)
                .and_then(|r| self.complete_vector(r))
        }
    }

    fn complete_vector(&self, row: &RawExchangeRate) -> Option<Vec<f32>> {
        self.fiat_currencies
            .iter()
            .map(|ticker| row.rates.get(ticker).copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chaingraph_common::storage::MockRawGateway;
    use chrono::NaiveDate;
    use rstest::rstest;

    use super::*;

    fn rate_row(date: &str, usd: f32, eur: f32) -> RawExchangeRate {
        RawExchangeRate {
            date: date.parse().unwrap(),
            rates: HashMap::from([("USD".to_string(), usd), ("EUR".to_string(), eur)]),
        }
    }

    fn attacher(forward_fill: bool) -> RateAttacher {
        RateAttacher::new(vec!["USD".into(), "EUR".into()], forward_fill)
    }

    #[rstest]
    #[case(false, "2021-01-02", Some(vec![110.0, 90.0]))] // exact match
    #[case(false, "2021-01-03", None)] // strict mode: no carry-over
    #[case(true, "2021-01-05", Some(vec![110.0, 90.0]))] // latest prior row
    #[case(true, "2020-12-31", None)] // nothing before the first row
    fn rate_lookup_honours_the_mode(
        #[case] forward_fill: bool,
        #[case] date: &str,
        #[case] expected: Option<Vec<f32>>,
    ) {
        let rows =
            vec![rate_row("2021-01-01", 100.0, 80.0), rate_row("2021-01-02", 110.0, 90.0)];
        let date: NaiveDate = date.parse().unwrap();
        assert_eq!(attacher(forward_fill).vector_at(&rows, date), expected);
    }

    #[test]
    fn incomplete_rows_do_not_satisfy_the_ticker_list() {
        let mut row = rate_row("2021-01-01", 100.0, 80.0);
        row.rates.remove("EUR");
        let a = attacher(false);
        assert_eq!(a.vector_at(&[row], NaiveDate::from_ymd_opt(2021, 1, 1).unwrap()), None);
    }

    #[tokio::test]
    async fn strict_mode_fails_the_batch_on_missing_rates() {
        use chaingraph_common::models::raw::{BlockData, RawBlock};

        let mut raw = MockRawGateway::new();
        raw.expect_exchange_rates()
            .returning(|_, _| Ok(vec![rate_row("2021-01-01", 100.0, 80.0)]));

        let bundle = BlockBundle {
            block: RawBlock {
                block_id: 300,
                timestamp: NaiveDate::from_ymd_opt(2021, 1, 4)
                    .unwrap()
                    .and_hms_opt(12, 0, 0)
                    .unwrap(),
                ..Default::default()
            },
            data: BlockData::Utxo { txs: vec![] },
        };

        let err = attacher(false)
            .build_slice(&raw, std::slice::from_ref(&bundle))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::RateMissing(300)));

        let slice = attacher(true)
            .build_slice(&raw, std::slice::from_ref(&bundle))
            .await
            .unwrap();
        assert_eq!(slice.get(300), &[100.0, 80.0]);
    }
}
