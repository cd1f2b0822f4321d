//! Chain builders shared by the scenario suites.

#![allow(dead_code)]

use chainmirror_core::types::{ChainInput, ChainOutput, ChainTransaction, ScriptPubKey};
use chainmirror_core::{ChainBlock, InMemoryChain};
use chainmirror_storage::LedgerSnapshot;

pub const MINER: &str = "mipcBbFg9gMiCh81Kj8tqqdgoZub1ZJRfn";
pub const PAYEE: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

pub fn block_hash(height: u64, fork: &str) -> String {
    format!("{fork}{height:062x}")
}

pub fn output(n: u32, value: f64, address: Option<&str>) -> ChainOutput {
    ChainOutput {
        value,
        n,
        script_pub_key: ScriptPubKey {
            asm: String::new(),
            hex: String::new(),
            req_sigs: address.map(|_| 1),
            script_type: if address.is_some() { "pubkeyhash" } else { "nonstandard" }.into(),
            addresses: vec![],
            address: address.map(str::to_string),
        },
    }
}

pub fn transaction(txid: &str, vin: Vec<ChainInput>, vout: Vec<ChainOutput>) -> ChainTransaction {
    ChainTransaction {
        txid: txid.into(),
        hash: txid.into(),
        version: 2,
        size: 200,
        vsize: 150,
        weight: 600,
        locktime: 0,
        hex: "02000000".into(),
        vin,
        vout,
    }
}

pub fn coinbase_txid(height: u64, fork: &str) -> String {
    format!("cb-{height}-{fork}")
}

pub fn coinbase(height: u64, fork: &str) -> ChainTransaction {
    transaction(
        &coinbase_txid(height, fork),
        vec![ChainInput::Coinbase {
            coinbase: format!("03{height:06x}"),
            sequence: u32::MAX,
            witness: vec![],
        }],
        vec![output(0, 50.0, Some(MINER))],
    )
}

/// A transaction spending each `(txid, vout)` into the given outputs.
pub fn spend(txid: &str, prevouts: &[(&str, u32)], vout: Vec<ChainOutput>) -> ChainTransaction {
    let vin = prevouts
        .iter()
        .map(|(prev, n)| ChainInput::Spend {
            txid: prev.to_string(),
            vout: *n,
            script_sig: None,
            witness: vec!["3044".into(), "02ab".into()],
            sequence: u32::MAX - 1,
        })
        .collect();
    transaction(txid, vin, vout)
}

/// A block on `fork` whose first transaction is its coinbase.
pub fn block(height: u64, fork: &str, extra: Vec<ChainTransaction>) -> ChainBlock {
    let mut transactions = vec![coinbase(height, fork)];
    transactions.extend(extra);
    ChainBlock {
        hash: block_hash(height, fork),
        height,
        previous_block_hash: height.checked_sub(1).map(|h| block_hash(h, fork)),
        size: 285,
        stripped_size: 285,
        weight: 1140,
        version: 0x2000_0000,
        version_hex: "20000000".into(),
        merkle_root: "4a5e".into(),
        time: 1_700_000_000 + height as i64 * 600,
        median_time: 1_700_000_000,
        nonce: height,
        bits: "207fffff".into(),
        difficulty: 4.6e-10,
        chainwork: format!("{:064x}", height + 1),
        tx_count: transactions.len() as u32,
        transactions,
    }
}

/// A chain of coinbase-only blocks `0..=tip` on fork `"a"`.
pub fn simple_chain(tip: u64) -> InMemoryChain {
    let chain = InMemoryChain::new("test");
    for height in 0..=tip {
        chain.push(block(height, "a", vec![]));
    }
    chain
}

/// Relink `block` onto the block of `parent_fork` one height below.
pub fn on_parent(mut block: ChainBlock, parent_fork: &str) -> ChainBlock {
    block.previous_block_hash = block.height.checked_sub(1).map(|h| block_hash(h, parent_fork));
    block
}

/// Replace the live chain from `height` upward with fork `"b"`, branching
/// off fork `"a"`.
pub fn fork_from(chain: &InMemoryChain, height: u64, tip: u64) {
    chain.truncate(height);
    for h in height..=tip {
        let forked = block(h, "b", vec![]);
        chain.push(if h == height { on_parent(forked, "a") } else { forked });
    }
}

pub fn assert_one_valid_block_per_height(ledger: &LedgerSnapshot) {
    let max = ledger.blocks.iter().map(|b| b.record.height).max().unwrap_or(0);
    for height in 0..=max {
        assert!(
            ledger.valid_blocks_at(height).len() <= 1,
            "more than one valid block at height {height}"
        );
    }
}
