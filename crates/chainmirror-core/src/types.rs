//! Block, transaction, input and output shapes as returned by the node
//! (`getblock <hash> 2`).

use serde::{Deserialize, Serialize};

// ─── ChainBlock ───────────────────────────────────────────────────────────────

/// A block with full transaction detail, as the node reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub hash: String,
    pub height: u64,
    /// Absent for the genesis block.
    #[serde(rename = "previousblockhash", default)]
    pub previous_block_hash: Option<String>,
    pub size: u64,
    #[serde(rename = "strippedsize", default)]
    pub stripped_size: u64,
    #[serde(default)]
    pub weight: u64,
    pub version: i32,
    #[serde(rename = "versionHex", default)]
    pub version_hex: String,
    #[serde(rename = "merkleroot")]
    pub merkle_root: String,
    pub time: i64,
    #[serde(rename = "mediantime", default)]
    pub median_time: i64,
    pub nonce: u64,
    pub bits: String,
    pub difficulty: f64,
    #[serde(default)]
    pub chainwork: String,
    #[serde(rename = "nTx", default)]
    pub tx_count: u32,
    #[serde(rename = "tx")]
    pub transactions: Vec<ChainTransaction>,
}

// ─── ChainTransaction ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub txid: String,
    pub hash: String,
    pub version: i32,
    pub size: u64,
    #[serde(default)]
    pub vsize: u64,
    #[serde(default)]
    pub weight: u64,
    pub locktime: u32,
    #[serde(default)]
    pub hex: String,
    pub vin: Vec<ChainInput>,
    pub vout: Vec<ChainOutput>,
}

impl ChainTransaction {
    /// A coinbase transaction has exactly one input, and that input is a coinbase marker.
    pub fn is_coinbase(&self) -> bool {
        matches!(self.vin.as_slice(), [ChainInput::Coinbase { .. }])
    }
}

// ─── ChainInput ───────────────────────────────────────────────────────────────

/// A transaction input: either the coinbase marker or a spend of an earlier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChainInput {
    Coinbase {
        /// Hex-encoded coinbase script.
        coinbase: String,
        sequence: u32,
        #[serde(rename = "txinwitness", default)]
        witness: Vec<String>,
    },
    Spend {
        txid: String,
        vout: u32,
        #[serde(rename = "scriptSig", default)]
        script_sig: Option<ScriptSig>,
        #[serde(rename = "txinwitness", default)]
        witness: Vec<String>,
        sequence: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSig {
    pub asm: String,
    pub hex: String,
}

// ─── ChainOutput ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainOutput {
    /// Amount in BTC, as a decimal.
    pub value: f64,
    /// Index of this output within its transaction.
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPubKey {
    pub asm: String,
    pub hex: String,
    #[serde(rename = "reqSigs", default)]
    pub req_sigs: Option<u32>,
    #[serde(rename = "type")]
    pub script_type: String,
    /// Older nodes (< 22.0) list every destination here.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Newer nodes report a single destination.
    #[serde(default)]
    pub address: Option<String>,
}

impl ScriptPubKey {
    /// The addresses this script pays to, whichever field the node used.
    /// Empty for non-standard and data-carrier scripts.
    pub fn destinations(&self) -> Vec<&str> {
        if !self.addresses.is_empty() {
            return self.addresses.iter().map(String::as_str).collect();
        }
        self.address.as_deref().into_iter().collect()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn block_json() -> serde_json::Value {
        json!({
            "hash": "0000000000000000000b",
            "confirmations": 3,
            "height": 101,
            "version": 536870912,
            "versionHex": "20000000",
            "merkleroot": "4a5e",
            "time": 1700000000,
            "mediantime": 1699999000,
            "nonce": 2083236893u64,
            "bits": "1d00ffff",
            "difficulty": 1.0,
            "chainwork": "0000000000000000000000000000000000000000000000000000000000000ca",
            "nTx": 2,
            "previousblockhash": "0000000000000000000a",
            "strippedsize": 400,
            "size": 500,
            "weight": 1700,
            "tx": [
                {
                    "txid": "cb01", "hash": "cb01", "version": 2, "size": 100, "vsize": 100,
                    "weight": 400, "locktime": 0, "hex": "02000000",
                    "vin": [{ "coinbase": "0165", "sequence": 4294967295u32 }],
                    "vout": [{
                        "value": 50.0, "n": 0,
                        "scriptPubKey": {
                            "asm": "OP_DUP", "hex": "76a9", "type": "pubkeyhash",
                            "address": "mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn"
                        }
                    }]
                },
                {
                    "txid": "aa02", "hash": "aa02w", "version": 2, "size": 200, "vsize": 150,
                    "weight": 600, "locktime": 100, "hex": "02000000",
                    "vin": [{
                        "txid": "cb00", "vout": 0,
                        "scriptSig": { "asm": "", "hex": "" },
                        "txinwitness": ["3044", "02ab"],
                        "sequence": 4294967294u32
                    }],
                    "vout": [{
                        "value": 0.00012345, "n": 0,
                        "scriptPubKey": {
                            "asm": "OP_RETURN", "hex": "6a", "type": "nulldata"
                        }
                    }]
                }
            ]
        })
    }

    #[test]
    fn deserializes_verbose_block() {
        let block: ChainBlock = serde_json::from_value(block_json()).unwrap();
        assert_eq!(block.height, 101);
        assert_eq!(block.tx_count, 2);
        assert_eq!(block.previous_block_hash.as_deref(), Some("0000000000000000000a"));
        assert!(block.transactions[0].is_coinbase());
        assert!(!block.transactions[1].is_coinbase());

        match &block.transactions[1].vin[0] {
            ChainInput::Spend { txid, vout, witness, sequence, .. } => {
                assert_eq!(txid, "cb00");
                assert_eq!(*vout, 0);
                assert_eq!(witness.len(), 2);
                assert_eq!(*sequence, 4294967294);
            }
            other => panic!("expected a spend, got {other:?}"),
        }
    }

    #[test]
    fn genesis_has_no_previous_hash() {
        let mut v = block_json();
        v.as_object_mut().unwrap().remove("previousblockhash");
        let block: ChainBlock = serde_json::from_value(v).unwrap();
        assert!(block.previous_block_hash.is_none());
    }

    #[test]
    fn destinations_prefer_address_list() {
        let legacy = ScriptPubKey {
            asm: String::new(),
            hex: String::new(),
            req_sigs: Some(1),
            script_type: "multisig".into(),
            addresses: vec!["a".into(), "b".into()],
            address: None,
        };
        assert_eq!(legacy.destinations(), vec!["a", "b"]);

        let modern = ScriptPubKey {
            addresses: vec![],
            address: Some("c".into()),
            ..legacy.clone()
        };
        assert_eq!(modern.destinations(), vec!["c"]);

        let none = ScriptPubKey {
            addresses: vec![],
            address: None,
            ..legacy
        };
        assert!(none.destinations().is_empty());
    }
}
