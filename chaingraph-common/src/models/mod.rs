pub mod delta;
pub mod raw;
pub mod rows;
pub mod transformed;

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Ledger family a keyspace belongs to. Decides which projector runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    Utxo,
    Account,
}

impl Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaType::Utxo => write!(f, "utxo"),
            SchemaType::Account => write!(f, "account"),
        }
    }
}

impl std::str::FromStr for SchemaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utxo" => Ok(SchemaType::Utxo),
            "account" => Ok(SchemaType::Account),
            other => Err(format!("unknown schema type: {other}")),
        }
    }
}

/// Direction of a value flow relative to an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    In,
    Out,
}

/// Textual form of a canonical address, used for prefix partitioning.
///
/// UTXO ledgers store the textual address itself as the canonical bytes;
/// account ledgers store the raw 20-byte hash, rendered as hex.
pub fn encode_address(schema_type: SchemaType, address: &[u8]) -> String {
    match schema_type {
        SchemaType::Utxo => String::from_utf8_lossy(address).into_owned(),
        SchemaType::Account => hex::encode(address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_type_round_trips() {
        assert_eq!("utxo".parse::<SchemaType>().unwrap(), SchemaType::Utxo);
        assert_eq!("Account".parse::<SchemaType>().unwrap(), SchemaType::Account);
        assert!("evm".parse::<SchemaType>().is_err());
        assert_eq!(SchemaType::Utxo.to_string(), "utxo");
    }
}
