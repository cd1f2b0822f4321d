//! Address classification: destination address string → address-type tag.

use std::fmt;
use std::str::FromStr;

use bitcoin::address::{Address, AddressType, NetworkUnchecked};
use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// The chain a node serves, as named by `getblockchaininfo.chain`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainNetwork {
    Main,
    Test,
    Signet,
    Regtest,
}

impl ChainNetwork {
    /// Parse the node's chain name (`"main"`, `"test"`, `"signet"`, `"regtest"`).
    pub fn from_chain_name(name: &str) -> Result<Self, IndexerError> {
        match name {
            "main" => Ok(Self::Main),
            "test" | "testnet4" => Ok(Self::Test),
            "signet" => Ok(Self::Signet),
            "regtest" => Ok(Self::Regtest),
            other => Err(IndexerError::Config(format!("unsupported chain `{other}`"))),
        }
    }

    fn bitcoin_network(self) -> Network {
        match self {
            Self::Main => Network::Bitcoin,
            Self::Test => Network::Testnet,
            Self::Signet => Network::Signet,
            Self::Regtest => Network::Regtest,
        }
    }
}

impl fmt::Display for ChainNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Test => write!(f, "test"),
            Self::Signet => write!(f, "signet"),
            Self::Regtest => write!(f, "regtest"),
        }
    }
}

/// Address-type tag stored on each output/address linkage row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressKind {
    /// Base58 pay-to-pubkey-hash.
    Legacy,
    /// Base58 pay-to-script-hash (usually wrapped segwit).
    P2shSegwit,
    /// Native segwit, any witness version.
    Bech32,
}

impl AddressKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::P2shSegwit => "p2sh-segwit",
            Self::Bech32 => "bech32",
        }
    }
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressKind {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(Self::Legacy),
            "p2sh-segwit" => Ok(Self::P2shSegwit),
            "bech32" => Ok(Self::Bech32),
            other => Err(IndexerError::Store(format!("unknown address kind `{other}`"))),
        }
    }
}

/// Stateless classifier bound to one network.
#[derive(Debug, Clone, Copy)]
pub struct AddressClassifier {
    network: ChainNetwork,
}

impl AddressClassifier {
    pub fn new(network: ChainNetwork) -> Self {
        Self { network }
    }

    pub fn network(&self) -> ChainNetwork {
        self.network
    }

    /// Validate `address` for this network and tag its type.
    pub fn classify(&self, address: &str) -> Result<AddressKind, IndexerError> {
        let invalid = |reason: String| IndexerError::InvalidAddress {
            address: address.to_string(),
            network: self.network.to_string(),
            reason,
        };

        let checked = Address::<NetworkUnchecked>::from_str(address)
            .map_err(|e| invalid(e.to_string()))?
            .require_network(self.network.bitcoin_network())
            .map_err(|e| invalid(e.to_string()))?;

        // Base58 payloads always report a type; anything else is a witness
        // program, including versions the library has no name for yet.
        Ok(match checked.address_type() {
            Some(AddressType::P2pkh) => AddressKind::Legacy,
            Some(AddressType::P2sh) => AddressKind::P2shSegwit,
            _ => AddressKind::Bech32,
        })
    }
}
