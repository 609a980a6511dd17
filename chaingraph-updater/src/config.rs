//! Environment configuration.
//!
//! One YAML file enumerates the environments and, per currency, the raw
//! and transformed keyspace pair with its layout parameters. The engine
//! needs no secrets.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use chaingraph_common::models::{transformed::ConfigurationRow, SchemaType};
use serde::Deserialize;

use crate::updater::UpdateError;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub environments: HashMap<String, EnvironmentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    pub cassandra_nodes: Vec<String>,
    #[serde(default = "default_lock_directory")]
    pub lock_directory: PathBuf,
    pub keyspaces: HashMap<String, KeyspaceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyspaceConfig {
    pub raw_keyspace_name: String,
    pub transformed_keyspace_name: String,
    pub schema_type: SchemaType,
    #[serde(default)]
    pub disable_delta_updates: bool,
    /// Blocks per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    /// Blocks below the raw tip considered not yet final.
    #[serde(default = "default_safety_margin")]
    pub safety_margin: i64,
    #[serde(default = "default_fiat_currencies")]
    pub fiat_currencies: Vec<String>,
    #[serde(default = "default_bucket_size")]
    pub bucket_size: i32,
    #[serde(default = "default_tx_bucket_size")]
    pub tx_bucket_size: i64,
    #[serde(default = "default_block_bucket_size")]
    pub block_bucket_size: i64,
    #[serde(default = "default_relation_secondary_shards")]
    pub relation_secondary_shards: i32,
    #[serde(default = "default_address_prefix_length")]
    pub address_prefix_length: i32,
    #[serde(default = "default_tx_prefix_length")]
    pub tx_prefix_length: i32,
}

fn default_lock_directory() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_batch_size() -> i64 {
    10
}

fn default_safety_margin() -> i64 {
    10
}

fn default_fiat_currencies() -> Vec<String> {
    vec!["USD".to_string(), "EUR".to_string()]
}

fn default_bucket_size() -> i32 {
    25_000
}

fn default_tx_bucket_size() -> i64 {
    25_000
}

fn default_block_bucket_size() -> i64 {
    100_000
}

fn default_relation_secondary_shards() -> i32 {
    7
}

fn default_address_prefix_length() -> i32 {
    5
}

fn default_tx_prefix_length() -> i32 {
    5
}

impl AppConfig {
    pub fn from_yaml(path: &str) -> Result<Self, UpdateError> {
        let mut file = File::open(path)
            .map_err(|e| UpdateError::Setup(format!("cannot open config {path}: {e}")))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| UpdateError::Setup(format!("cannot read config {path}: {e}")))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| UpdateError::Setup(format!("invalid config {path}: {e}")))
    }

    pub fn keyspace(
        &self,
        env: &str,
        currency: &str,
    ) -> Result<(&EnvironmentConfig, &KeyspaceConfig), UpdateError> {
        let environment = self
            .environments
            .get(env)
            .ok_or_else(|| UpdateError::Setup(format!("unknown environment {env}")))?;
        let keyspace = environment
            .keyspaces
            .get(currency)
            .ok_or_else(|| {
                UpdateError::Setup(format!("currency {currency} not configured in {env}"))
            })?;
        Ok((environment, keyspace))
    }
}

impl KeyspaceConfig {
    /// The per-keyspace `configuration` row written at schema creation.
    pub fn configuration_row(&self) -> ConfigurationRow {
        ConfigurationRow {
            keyspace_name: self.transformed_keyspace_name.clone(),
            bucket_size: self.bucket_size,
            tx_bucket_size: self.tx_bucket_size,
            block_bucket_size: self.block_bucket_size,
            relation_secondary_shards: self.relation_secondary_shards,
            address_prefix_length: self.address_prefix_length,
            tx_prefix_length: self.tx_prefix_length,
            fiat_currencies: self.fiat_currencies.clone(),
        }
    }

    pub fn native_ticker(&self, currency: &str) -> String {
        currency.to_ascii_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
environments:
  dev:
    cassandra_nodes: ["localhost:9042"]
    keyspaces:
      btc:
        raw_keyspace_name: btc_raw
        transformed_keyspace_name: btc_transformed
        schema_type: utxo
        safety_margin: 3
      eth:
        raw_keyspace_name: eth_raw
        transformed_keyspace_name: eth_transformed
        schema_type: account
        batch_size: 50
        fiat_currencies: [USD, EUR]
"#;

    #[test]
    fn parses_environments_with_defaults() {
        let config: AppConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        let (env, btc) = config.keyspace("dev", "btc").unwrap();
        assert_eq!(env.cassandra_nodes, vec!["localhost:9042"]);
        assert_eq!(env.lock_directory, PathBuf::from("/tmp"));
        assert_eq!(btc.schema_type, SchemaType::Utxo);
        assert_eq!(btc.safety_margin, 3);
        assert_eq!(btc.batch_size, 10);
        assert!(!btc.disable_delta_updates);

        let (_, eth) = config.keyspace("dev", "eth").unwrap();
        assert_eq!(eth.schema_type, SchemaType::Account);
        assert_eq!(eth.batch_size, 50);
        assert_eq!(eth.native_ticker("eth"), "ETH");
    }

    #[test]
    fn unknown_environment_or_currency_fail() {
        let config: AppConfig = serde_yaml::from_str(EXAMPLE).unwrap();
        assert!(config.keyspace("prod", "btc").is_err());
        assert!(config.keyspace("dev", "ltc").is_err());
    }
}
