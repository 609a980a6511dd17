//! Driver-facing value types: UDTs, row mirrors and timestamp helpers.
//!
//! The engine models stay driver-free; everything here converts between
//! them and the CQL shapes (user-defined types, `varint`, `timestamp`).

use std::collections::HashMap;

use chaingraph_common::models::{
    delta::{CurrencyValue, TxReference},
    transformed::{AddressRelationRow, AddressRow, ClusterRelationRow, ClusterRow},
};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use num_bigint::BigInt;
use scylla::frame::value::{CqlDate, CqlTimestamp};
use scylla::macros::{FromRow, FromUserType, IntoUserType, ValueList};

/// CQL `currency` UDT: `(value varint, fiat_values list<float>)`.
#[derive(Debug, Clone, Default, IntoUserType, FromUserType)]
pub(crate) struct CurrencyUdt {
    pub value: BigInt,
    pub fiat_values: Option<Vec<f32>>,
}

impl From<&CurrencyValue> for CurrencyUdt {
    fn from(v: &CurrencyValue) -> Self {
        Self { value: v.value.clone(), fiat_values: Some(v.fiat_values.clone()) }
    }
}

impl CurrencyUdt {
    pub fn into_model(self, fiat_count: usize) -> CurrencyValue {
        CurrencyValue {
            value: self.value,
            fiat_values: self
                .fiat_values
                .unwrap_or_else(|| vec![0.0; fiat_count]),
        }
    }
}

pub(crate) fn token_map_to_udt(
    map: &HashMap<String, CurrencyValue>,
) -> Option<HashMap<String, CurrencyUdt>> {
    if map.is_empty() {
        // empty maps are stored as null
        return None;
    }
    Some(
        map.iter()
            .map(|(k, v)| (k.clone(), CurrencyUdt::from(v)))
            .collect(),
    )
}

pub(crate) fn token_map_from_udt(
    map: Option<HashMap<String, CurrencyUdt>>,
    fiat_count: usize,
) -> HashMap<String, CurrencyValue> {
    map.unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, v.into_model(fiat_count)))
        .collect()
}

/// CQL `tx_reference` UDT: `(trace_index int, log_index int)`.
#[derive(Debug, Clone, Copy, Default, IntoUserType, FromUserType)]
pub(crate) struct TxReferenceUdt {
    pub trace_index: Option<i32>,
    pub log_index: Option<i32>,
}

impl From<TxReference> for TxReferenceUdt {
    fn from(r: TxReference) -> Self {
        Self { trace_index: r.trace_index, log_index: r.log_index }
    }
}

impl From<TxReferenceUdt> for TxReference {
    fn from(r: TxReferenceUdt) -> Self {
        Self { trace_index: r.trace_index, log_index: r.log_index }
    }
}

pub(crate) fn ts_to_cql(ts: NaiveDateTime) -> CqlTimestamp {
    CqlTimestamp(ts.and_utc().timestamp_millis())
}

pub(crate) fn cql_to_ts(ts: CqlTimestamp) -> NaiveDateTime {
    DateTime::from_timestamp_millis(ts.0)
        .map(|dt| dt.naive_utc())
        .unwrap_or_default()
}

const CQL_DATE_EPOCH_OFFSET: i64 = 1 << 31;

pub(crate) fn date_to_cql(date: NaiveDate) -> CqlDate {
    let days = date
        .signed_duration_since(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap())
        .num_days();
    CqlDate((CQL_DATE_EPOCH_OFFSET + days) as u32)
}

pub(crate) fn cql_to_date(date: CqlDate) -> NaiveDate {
    let days = date.0 as i64 - CQL_DATE_EPOCH_OFFSET;
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap() + chrono::Duration::days(days)
}

/// CQL `tx_input_output` UDT of the raw UTXO schema.
#[derive(Debug, Clone, Default, IntoUserType, FromUserType)]
pub(crate) struct TxInputOutputUdt {
    pub address: Option<Vec<String>>,
    pub value: i64,
    pub address_type: Option<i16>,
}

/// Mirror of the `address` table; column order matches the SELECT/INSERT
/// statements in `transformed.rs`.
#[derive(Debug, Clone, FromRow, ValueList)]
pub(crate) struct AddressRowDb {
    pub address_id_group: i32,
    pub address_id: i32,
    pub address: Vec<u8>,
    pub cluster_id: Option<i32>,
    pub total_received: Option<CurrencyUdt>,
    pub total_spent: Option<CurrencyUdt>,
    pub total_tokens_received: Option<HashMap<String, CurrencyUdt>>,
    pub total_tokens_spent: Option<HashMap<String, CurrencyUdt>>,
    pub first_tx_id: i64,
    pub last_tx_id: i64,
    pub no_incoming_txs: i32,
    pub no_outgoing_txs: i32,
    pub no_incoming_txs_zero_value: i32,
    pub no_outgoing_txs_zero_value: i32,
    pub in_degree: i32,
    pub out_degree: i32,
    pub in_degree_zero_value: i32,
    pub out_degree_zero_value: i32,
    pub is_contract: Option<bool>,
}

impl AddressRowDb {
    pub fn from_model(row: &AddressRow) -> Self {
        Self {
            address_id_group: row.address_id_group,
            address_id: row.address_id,
            address: row.address.clone(),
            cluster_id: row.cluster_id,
            total_received: Some(CurrencyUdt::from(&row.total_received)),
            total_spent: Some(CurrencyUdt::from(&row.total_spent)),
            total_tokens_received: token_map_to_udt(&row.total_tokens_received),
            total_tokens_spent: token_map_to_udt(&row.total_tokens_spent),
            first_tx_id: row.first_tx_id,
            last_tx_id: row.last_tx_id,
            no_incoming_txs: row.no_incoming_txs,
            no_outgoing_txs: row.no_outgoing_txs,
            no_incoming_txs_zero_value: row.no_incoming_txs_zero_value,
            no_outgoing_txs_zero_value: row.no_outgoing_txs_zero_value,
            in_degree: row.in_degree,
            out_degree: row.out_degree,
            in_degree_zero_value: row.in_degree_zero_value,
            out_degree_zero_value: row.out_degree_zero_value,
            is_contract: Some(row.is_contract),
        }
    }

    pub fn into_model(self, fiat_count: usize) -> AddressRow {
        AddressRow {
            address_id_group: self.address_id_group,
            address_id: self.address_id,
            address: self.address,
            cluster_id: self.cluster_id,
            total_received: self
                .total_received
                .unwrap_or_default()
                .into_model(fiat_count),
            total_spent: self
                .total_spent
                .unwrap_or_default()
                .into_model(fiat_count),
            total_tokens_received: token_map_from_udt(self.total_tokens_received, fiat_count),
            total_tokens_spent: token_map_from_udt(self.total_tokens_spent, fiat_count),
            first_tx_id: self.first_tx_id,
            last_tx_id: self.last_tx_id,
            no_incoming_txs: self.no_incoming_txs,
            no_outgoing_txs: self.no_outgoing_txs,
            no_incoming_txs_zero_value: self.no_incoming_txs_zero_value,
            no_outgoing_txs_zero_value: self.no_outgoing_txs_zero_value,
            in_degree: self.in_degree,
            out_degree: self.out_degree,
            in_degree_zero_value: self.in_degree_zero_value,
            out_degree_zero_value: self.out_degree_zero_value,
            is_contract: self.is_contract.unwrap_or(false),
        }
    }
}

/// Mirror of the `cluster` table.
#[derive(Debug, Clone, FromRow, ValueList)]
pub(crate) struct ClusterRowDb {
    pub cluster_id_group: i32,
    pub cluster_id: i32,
    pub no_addresses: i32,
    pub total_received: Option<CurrencyUdt>,
    pub total_spent: Option<CurrencyUdt>,
    pub first_tx_id: i64,
    pub last_tx_id: i64,
    pub no_incoming_txs: i32,
    pub no_outgoing_txs: i32,
    pub no_incoming_txs_zero_value: i32,
    pub no_outgoing_txs_zero_value: i32,
    pub in_degree: i32,
    pub out_degree: i32,
    pub in_degree_zero_value: i32,
    pub out_degree_zero_value: i32,
}

impl ClusterRowDb {
    pub fn from_model(row: &ClusterRow) -> Self {
        Self {
            cluster_id_group: row.cluster_id_group,
            cluster_id: row.cluster_id,
            no_addresses: row.no_addresses,
            total_received: Some(CurrencyUdt::from(&row.total_received)),
            total_spent: Some(CurrencyUdt::from(&row.total_spent)),
            first_tx_id: row.first_tx_id,
            last_tx_id: row.last_tx_id,
            no_incoming_txs: row.no_incoming_txs,
            no_outgoing_txs: row.no_outgoing_txs,
            no_incoming_txs_zero_value: row.no_incoming_txs_zero_value,
            no_outgoing_txs_zero_value: row.no_outgoing_txs_zero_value,
            in_degree: row.in_degree,
            out_degree: row.out_degree,
            in_degree_zero_value: row.in_degree_zero_value,
            out_degree_zero_value: row.out_degree_zero_value,
        }
    }

    pub fn into_model(self, fiat_count: usize) -> ClusterRow {
        ClusterRow {
            cluster_id_group: self.cluster_id_group,
            cluster_id: self.cluster_id,
            no_addresses: self.no_addresses,
            total_received: self
                .total_received
                .unwrap_or_default()
                .into_model(fiat_count),
            total_spent: self
                .total_spent
                .unwrap_or_default()
                .into_model(fiat_count),
            first_tx_id: self.first_tx_id,
            last_tx_id: self.last_tx_id,
            no_incoming_txs: self.no_incoming_txs,
            no_outgoing_txs: self.no_outgoing_txs,
            no_incoming_txs_zero_value: self.no_incoming_txs_zero_value,
            no_outgoing_txs_zero_value: self.no_outgoing_txs_zero_value,
            in_degree: self.in_degree,
            out_degree: self.out_degree,
            in_degree_zero_value: self.in_degree_zero_value,
            out_degree_zero_value: self.out_degree_zero_value,
        }
    }
}

/// Mirror of both address relation tables. `partition_*` refers to dst for
/// incoming rows and src for outgoing rows.
#[derive(Debug, Clone, FromRow, ValueList)]
pub(crate) struct AddressRelationRowDb {
    pub partition_id_group: i32,
    pub partition_secondary_group: i32,
    pub src_address_id: i32,
    pub dst_address_id: i32,
    pub no_transactions: i32,
    pub value: Option<CurrencyUdt>,
    pub token_values: Option<HashMap<String, CurrencyUdt>>,
}

impl AddressRelationRowDb {
    pub fn from_model(row: &AddressRelationRow) -> Self {
        Self {
            partition_id_group: row.partition_id_group,
            partition_secondary_group: row.partition_secondary_group,
            src_address_id: row.src_address_id,
            dst_address_id: row.dst_address_id,
            no_transactions: row.no_transactions,
            value: Some(CurrencyUdt::from(&row.value)),
            token_values: token_map_to_udt(&row.token_values),
        }
    }

    pub fn into_model(self, fiat_count: usize) -> AddressRelationRow {
        AddressRelationRow {
            partition_id_group: self.partition_id_group,
            partition_secondary_group: self.partition_secondary_group,
            src_address_id: self.src_address_id,
            dst_address_id: self.dst_address_id,
            no_transactions: self.no_transactions,
            value: self.value.unwrap_or_default().into_model(fiat_count),
            token_values: token_map_from_udt(self.token_values, fiat_count),
        }
    }
}

/// Mirror of both cluster relation tables.
#[derive(Debug, Clone, FromRow, ValueList)]
pub(crate) struct ClusterRelationRowDb {
    pub partition_id_group: i32,
    pub src_cluster_id: i32,
    pub dst_cluster_id: i32,
    pub no_transactions: i32,
    pub value: Option<CurrencyUdt>,
}

impl ClusterRelationRowDb {
    pub fn from_model(row: &ClusterRelationRow) -> Self {
        Self {
            partition_id_group: row.partition_id_group,
            src_cluster_id: row.src_cluster_id,
            dst_cluster_id: row.dst_cluster_id,
            no_transactions: row.no_transactions,
            value: Some(CurrencyUdt::from(&row.value)),
        }
    }

    pub fn into_model(self, fiat_count: usize) -> ClusterRelationRow {
        ClusterRelationRow {
            partition_id_group: self.partition_id_group,
            src_cluster_id: self.src_cluster_id,
            dst_cluster_id: self.dst_cluster_id,
            no_transactions: self.no_transactions,
            value: self.value.unwrap_or_default().into_model(fiat_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cql_dates_round_trip() {
        let date = NaiveDate::from_ymd_opt(2021, 3, 14).unwrap();
        assert_eq!(cql_to_date(date_to_cql(date)), date);
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(date_to_cql(epoch).0, 1u32 << 31);
    }

    #[test]
    fn timestamps_round_trip_at_millisecond_precision() {
        let ts = DateTime::from_timestamp(1_650_000_000, 0).unwrap().naive_utc();
        assert_eq!(cql_to_ts(ts_to_cql(ts)), ts);
    }

    #[test]
    fn empty_token_maps_are_stored_as_null() {
        assert!(token_map_to_udt(&HashMap::new()).is_none());
        let mut map = HashMap::new();
        map.insert("USDT".to_string(), CurrencyValue::zero(2));
        assert_eq!(token_map_to_udt(&map).unwrap().len(), 1);
    }
}
