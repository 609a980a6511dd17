//! Table and type DDL for both keyspaces.
//!
//! Executed by `update --create-schema`; every statement is idempotent
//! (`IF NOT EXISTS`) so re-running against an existing keyspace is safe.

use chaingraph_common::{models::SchemaType, storage::StorageError};
use tracing::info;

use crate::{map_query_error, session::StoreSession};

const DEFAULT_REPLICATION: &str = "{'class': 'SimpleStrategy', 'replication_factor': 1}";

pub async fn create_keyspace(
    session: &StoreSession,
    keyspace: &str,
    replication: Option<&str>,
) -> Result<(), StorageError> {
    let replication = replication.unwrap_or(DEFAULT_REPLICATION);
    let stmt = format!(
        "CREATE KEYSPACE IF NOT EXISTS {keyspace} \
         WITH replication = {replication} AND durable_writes = true;"
    );
    session
        .session
        .query(stmt, &[])
        .await
        .map_err(map_query_error)?;
    info!(keyspace, "Ensured keyspace exists");
    Ok(())
}

async fn run_all(session: &StoreSession, statements: &[&str]) -> Result<(), StorageError> {
    for stmt in statements {
        session
            .session
            .query(*stmt, &[])
            .await
            .map_err(map_query_error)?;
    }
    Ok(())
}

/// Raw keyspace tables the updater reads. Blocks, transactions, traces and
/// logs are partitioned by block bucket so height-range scans stay local to
/// a handful of partitions.
pub async fn create_raw_tables(
    session: &StoreSession,
    schema_type: SchemaType,
) -> Result<(), StorageError> {
    let mut statements: Vec<&str> = vec![
        "CREATE TABLE IF NOT EXISTS block (
            block_id_group bigint,
            block_id bigint,
            block_hash blob,
            timestamp timestamp,
            no_transactions int,
            miner blob,
            base_fee_per_gas bigint,
            gas_used bigint,
            PRIMARY KEY (block_id_group, block_id)
        );",
        "CREATE TABLE IF NOT EXISTS exchange_rates (
            date date PRIMARY KEY,
            rates map<text, float>
        );",
        "CREATE TABLE IF NOT EXISTS summary_statistics (
            id int PRIMARY KEY,
            no_blocks bigint,
            no_transactions bigint,
            timestamp bigint
        );",
    ];

    match schema_type {
        SchemaType::Utxo => {
            statements.push(
                "CREATE TYPE IF NOT EXISTS tx_input_output (
                    address list<text>,
                    value bigint,
                    address_type smallint
                );",
            );
            statements.push(
                "CREATE TABLE IF NOT EXISTS transaction (
                    block_id_group bigint,
                    block_id bigint,
                    tx_id bigint,
                    tx_hash blob,
                    timestamp timestamp,
                    coinbase boolean,
                    total_input bigint,
                    total_output bigint,
                    inputs list<frozen<tx_input_output>>,
                    outputs list<frozen<tx_input_output>>,
                    PRIMARY KEY (block_id_group, block_id, tx_id)
                );",
            );
        }
        SchemaType::Account => {
            statements.push(
                "CREATE TABLE IF NOT EXISTS transaction (
                    block_id_group bigint,
                    block_id bigint,
                    transaction_index int,
                    tx_hash blob,
                    from_address blob,
                    to_address blob,
                    value varint,
                    gas_price bigint,
                    receipt_gas_used bigint,
                    receipt_contract_address blob,
                    receipt_status smallint,
                    PRIMARY KEY (block_id_group, block_id, transaction_index)
                );",
            );
            statements.push(
                "CREATE TABLE IF NOT EXISTS trace (
                    block_id_group bigint,
                    block_id bigint,
                    trace_index int,
                    tx_hash blob,
                    from_address blob,
                    to_address blob,
                    value varint,
                    call_type text,
                    trace_type text,
                    status smallint,
                    PRIMARY KEY (block_id_group, block_id, trace_index)
                );",
            );
            statements.push(
                "CREATE TABLE IF NOT EXISTS log (
                    block_id_group bigint,
                    block_id bigint,
                    log_index int,
                    tx_hash blob,
                    address blob,
                    topics list<blob>,
                    data blob,
                    PRIMARY KEY (block_id_group, block_id, log_index)
                );",
            );
        }
    }

    run_all(session, &statements).await?;
    info!(keyspace = session.keyspace(), %schema_type, "Ensured raw tables exist");
    Ok(())
}

/// Transformed keyspace tables the updater writes.
pub async fn create_transformed_tables(
    session: &StoreSession,
    schema_type: SchemaType,
) -> Result<(), StorageError> {
    let mut statements: Vec<&str> = vec![
        "CREATE TYPE IF NOT EXISTS currency (
            value varint,
            fiat_values list<float>
        );",
        "CREATE TYPE IF NOT EXISTS tx_reference (
            trace_index int,
            log_index int
        );",
        "CREATE TABLE IF NOT EXISTS exchange_rates (
            block_id bigint PRIMARY KEY,
            fiat_values list<float>
        );",
        "CREATE TABLE IF NOT EXISTS address_ids_by_address_prefix (
            address_prefix text,
            address blob,
            address_id int,
            PRIMARY KEY (address_prefix, address)
        );",
        "CREATE TABLE IF NOT EXISTS address_ids_by_address_id_group (
            address_id_group int,
            address_id int,
            address blob,
            PRIMARY KEY (address_id_group, address_id)
        );",
        "CREATE TABLE IF NOT EXISTS address (
            address_id_group int,
            address_id int,
            address blob,
            cluster_id int,
            total_received frozen<currency>,
            total_spent frozen<currency>,
            total_tokens_received map<text, frozen<currency>>,
            total_tokens_spent map<text, frozen<currency>>,
            first_tx_id bigint,
            last_tx_id bigint,
            no_incoming_txs int,
            no_outgoing_txs int,
            no_incoming_txs_zero_value int,
            no_outgoing_txs_zero_value int,
            in_degree int,
            out_degree int,
            in_degree_zero_value int,
            out_degree_zero_value int,
            is_contract boolean,
            PRIMARY KEY (address_id_group, address_id)
        );",
        "CREATE TABLE IF NOT EXISTS address_transactions (
            address_id_group int,
            address_id_secondary_group int,
            address_id int,
            currency text,
            is_outgoing boolean,
            transaction_id bigint,
            tx_reference frozen<tx_reference>,
            value varint,
            PRIMARY KEY ((address_id_group, address_id_secondary_group),
                address_id, is_outgoing, currency, transaction_id, tx_reference)
        ) WITH CLUSTERING ORDER BY
            (address_id DESC, is_outgoing DESC, currency DESC, transaction_id DESC);",
        "CREATE TABLE IF NOT EXISTS address_transactions_secondary_ids (
            address_id_group int PRIMARY KEY,
            max_secondary_id int
        );",
        "CREATE TABLE IF NOT EXISTS address_incoming_relations (
            dst_address_id_group int,
            dst_address_id_secondary_group int,
            dst_address_id int,
            src_address_id int,
            no_transactions int,
            value frozen<currency>,
            token_values map<text, frozen<currency>>,
            PRIMARY KEY ((dst_address_id_group, dst_address_id_secondary_group),
                dst_address_id, src_address_id)
        );",
        "CREATE TABLE IF NOT EXISTS address_incoming_relations_secondary_ids (
            dst_address_id_group int PRIMARY KEY,
            max_secondary_id int
        );",
        "CREATE TABLE IF NOT EXISTS address_outgoing_relations (
            src_address_id_group int,
            src_address_id_secondary_group int,
            src_address_id int,
            dst_address_id int,
            no_transactions int,
            value frozen<currency>,
            token_values map<text, frozen<currency>>,
            PRIMARY KEY ((src_address_id_group, src_address_id_secondary_group),
                src_address_id, dst_address_id)
        );",
        "CREATE TABLE IF NOT EXISTS address_outgoing_relations_secondary_ids (
            src_address_id_group int PRIMARY KEY,
            max_secondary_id int
        );",
        "CREATE TABLE IF NOT EXISTS summary_statistics (
            id int PRIMARY KEY,
            timestamp bigint,
            no_blocks bigint,
            no_transactions bigint,
            no_addresses bigint,
            no_address_relations bigint,
            no_clusters bigint,
            no_cluster_relations bigint
        );",
        "CREATE TABLE IF NOT EXISTS configuration (
            keyspace_name text PRIMARY KEY,
            bucket_size int,
            tx_bucket_size bigint,
            block_bucket_size bigint,
            relation_secondary_shards int,
            address_prefix_length int,
            tx_prefix_length int,
            fiat_currencies list<text>
        );",
        "CREATE TABLE IF NOT EXISTS delta_updater_status (
            keyspace_name text PRIMARY KEY,
            last_synced_block bigint,
            last_synced_block_timestamp timestamp,
            highest_address_id int,
            timestamp timestamp,
            write_new boolean,
            write_dirty boolean,
            runtime_seconds int
        );",
        "CREATE TABLE IF NOT EXISTS delta_updater_history (
            last_synced_block bigint PRIMARY KEY,
            last_synced_block_timestamp timestamp,
            highest_address_id int,
            timestamp timestamp,
            write_new boolean,
            write_dirty boolean,
            runtime_seconds int
        );",
        "CREATE TABLE IF NOT EXISTS block_transactions (
            block_id_group bigint,
            block_id bigint,
            txs list<bigint>,
            PRIMARY KEY (block_id_group, block_id)
        );",
    ];

    match schema_type {
        SchemaType::Utxo => {
            statements.extend([
                "CREATE TABLE IF NOT EXISTS cluster (
                    cluster_id_group int,
                    cluster_id int,
                    no_addresses int,
                    total_received frozen<currency>,
                    total_spent frozen<currency>,
                    first_tx_id bigint,
                    last_tx_id bigint,
                    no_incoming_txs int,
                    no_outgoing_txs int,
                    no_incoming_txs_zero_value int,
                    no_outgoing_txs_zero_value int,
                    in_degree int,
                    out_degree int,
                    in_degree_zero_value int,
                    out_degree_zero_value int,
                    PRIMARY KEY (cluster_id_group, cluster_id)
                );",
                "CREATE TABLE IF NOT EXISTS cluster_addresses (
                    cluster_id_group int,
                    cluster_id int,
                    address_id int,
                    PRIMARY KEY (cluster_id_group, cluster_id, address_id)
                );",
                "CREATE TABLE IF NOT EXISTS cluster_incoming_relations (
                    dst_cluster_id_group int,
                    dst_cluster_id int,
                    src_cluster_id int,
                    no_transactions int,
                    value frozen<currency>,
                    PRIMARY KEY (dst_cluster_id_group, dst_cluster_id, src_cluster_id)
                );",
                "CREATE TABLE IF NOT EXISTS cluster_outgoing_relations (
                    src_cluster_id_group int,
                    src_cluster_id int,
                    dst_cluster_id int,
                    no_transactions int,
                    value frozen<currency>,
                    PRIMARY KEY (src_cluster_id_group, src_cluster_id, dst_cluster_id)
                );",
                "CREATE TABLE IF NOT EXISTS cluster_transactions (
                    cluster_id_group int,
                    cluster_id int,
                    transaction_id bigint,
                    is_outgoing boolean,
                    value varint,
                    PRIMARY KEY (cluster_id_group, cluster_id, transaction_id, is_outgoing)
                );",
            ]);
        }
        SchemaType::Account => {
            statements.extend([
                "CREATE TABLE IF NOT EXISTS transaction_ids_by_transaction_prefix (
                    transaction_prefix text,
                    transaction blob,
                    transaction_id bigint,
                    PRIMARY KEY (transaction_prefix, transaction)
                );",
                "CREATE TABLE IF NOT EXISTS transaction_ids_by_transaction_id_group (
                    transaction_id_group bigint,
                    transaction_id bigint,
                    transaction blob,
                    PRIMARY KEY (transaction_id_group, transaction_id)
                );",
                "CREATE TABLE IF NOT EXISTS balance (
                    address_id_group int,
                    address_id int,
                    currency text,
                    balance varint,
                    PRIMARY KEY (address_id_group, address_id, currency)
                );",
                "CREATE TABLE IF NOT EXISTS token_configuration (
                    currency_ticker text PRIMARY KEY,
                    token_address blob,
                    peg_currency text,
                    decimals int
                );",
            ]);
        }
    }

    run_all(session, &statements).await?;
    info!(keyspace = session.keyspace(), %schema_type, "Ensured transformed tables exist");
    Ok(())
}
