//! End-to-end sync scenarios.
//!
//! Each test scripts a chain in an [`InMemoryChain`], mirrors it into a
//! [`MemoryLedger`] through the [`SyncEngine`] and inspects the resulting
//! ledger rows.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chainmirror_core::ledger::{LedgerStore, LedgerTx};
use chainmirror_core::{
    AddressKind, ChainBlock, ChainNetwork, ChainSource, IndexerError, InMemoryChain,
    ReorgResolver, SyncConfig, SyncEngine,
};
use chainmirror_storage::{LedgerSnapshot, MemoryLedger};

use common::*;

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn engine(chain: InMemoryChain, config: SyncConfig) -> SyncEngine<InMemoryChain, MemoryLedger> {
    SyncEngine::new(chain, MemoryLedger::new(), config, ChainNetwork::Test)
}

fn snapshot(engine: &SyncEngine<InMemoryChain, MemoryLedger>) -> LedgerSnapshot {
    engine.store().snapshot().unwrap()
}

// ─── Forward sync ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn imports_chain_from_genesis() {
    let mut engine = engine(simple_chain(3), SyncConfig::default());

    let report = engine.sync_once(None).await.unwrap();
    assert_eq!(report.imported, 4);
    assert_eq!(report.transactions, 4);
    assert_eq!(report.limit, Some(3));
    assert!(report.reorgs.is_empty());

    let ledger = snapshot(&engine);
    for height in 0..=3 {
        let blocks = ledger.valid_blocks_at(height);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].record.hash, block_hash(height, "a"));
        assert_eq!(blocks[0].record.branch_id, 1);
        assert_eq!(blocks[0].coinbase_sequence, Some(u32::MAX));
    }
    assert_eq!(ledger.valid_blocks_at(0)[0].record.previous_hash, None);
    assert_eq!(engine.branches().tip(), Some(1));
}

#[tokio::test]
async fn genesis_only_chain() {
    let mut engine = engine(simple_chain(0), SyncConfig::default());
    let report = engine.sync_once(None).await.unwrap();
    assert_eq!(report.imported, 1);

    let ledger = snapshot(&engine);
    assert_eq!(ledger.blocks.len(), 1);
    let coinbase = ledger.valid_transaction(&coinbase_txid(0, "a")).unwrap();
    assert!(coinbase.record.is_coinbase);
    assert_eq!(coinbase.fee, None);
}

#[tokio::test]
async fn resync_imports_nothing_new() {
    let mut engine = engine(simple_chain(3), SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    let again = engine.sync_once(None).await.unwrap();
    assert_eq!(again.imported, 0);
    // the pass re-checks the stored tip
    assert_eq!(again.skipped, 1);
    assert_eq!(snapshot(&engine).blocks.len(), 4);
}

#[tokio::test]
async fn picks_up_new_blocks_on_next_pass() {
    let mut engine = engine(simple_chain(2), SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    engine.chain().push(block(3, "a", vec![]));
    engine.chain().push(block(4, "a", vec![]));
    let report = engine.sync_once(None).await.unwrap();
    assert_eq!(report.imported, 2);
    assert_eq!(snapshot(&engine).valid_blocks_at(4).len(), 1);
}

#[tokio::test]
async fn start_height_overrides_empty_store() {
    let mut engine = engine(simple_chain(4), SyncConfig::default());
    let report = engine.sync_once(Some(2)).await.unwrap();
    assert_eq!(report.imported, 3);

    let ledger = snapshot(&engine);
    assert!(ledger.valid_blocks_at(0).is_empty());
    assert!(ledger.valid_blocks_at(1).is_empty());
    assert_eq!(ledger.valid_blocks_at(2).len(), 1);
}

#[tokio::test]
async fn confirmation_depth_holds_back_tip() {
    let config = SyncConfig {
        min_confirmations: 2,
        ..SyncConfig::default()
    };
    let mut engine = engine(simple_chain(5), config);
    let report = engine.sync_once(None).await.unwrap();
    assert_eq!(report.limit, Some(3));
    assert_eq!(report.imported, 4);
    assert!(snapshot(&engine).valid_blocks_at(4).is_empty());
}

#[tokio::test]
async fn confirmation_depth_beyond_tip_still_imports_genesis() {
    let config = SyncConfig {
        min_confirmations: 10,
        ..SyncConfig::default()
    };
    let mut engine = engine(simple_chain(3), config);
    let report = engine.sync_once(None).await.unwrap();
    assert_eq!(report.limit, Some(0));
    // an empty store counts as height 0, which is still within the limit
    assert_eq!(report.imported, 1);
}

// ─── Transactions, fees and spends ────────────────────────────────────────────

#[tokio::test]
async fn records_fee_and_marks_spent_output() {
    let chain = simple_chain(1);
    let cb1 = coinbase_txid(1, "a");
    chain.push(block(
        2,
        "a",
        vec![spend(
            "pay-1",
            &[(cb1.as_str(), 0)],
            vec![output(0, 30.0, Some(PAYEE)), output(1, 19.9, Some(MINER))],
        )],
    ));
    let mut engine = engine(chain, SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    let ledger = snapshot(&engine);
    let payment = ledger.valid_transaction("pay-1").unwrap();
    assert_eq!(payment.fee, Some(10_000_000));
    assert!(!payment.record.is_coinbase);

    let funding = ledger.valid_transaction(&cb1).unwrap();
    let spent = ledger
        .outputs
        .iter()
        .find(|o| o.tx_id == funding.id && o.vout == 0)
        .unwrap();
    assert!(spent.is_spent);

    let input = ledger.inputs.iter().find(|i| i.record.tx_id == payment.id).unwrap();
    assert_eq!(spent.spent_by_input_id, Some(input.id));
    assert_eq!(input.record.spent_value, 5_000_000_000);
    assert_eq!(input.record.witness.len(), 2);

    let created: Vec<_> = ledger.outputs.iter().filter(|o| o.tx_id == payment.id).collect();
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(|o| !o.is_spent));
}

#[tokio::test]
async fn classifies_output_addresses() {
    let chain = simple_chain(0);
    let cb0 = coinbase_txid(0, "a");
    chain.push(block(
        1,
        "a",
        vec![spend(
            "pay-1",
            &[(cb0.as_str(), 0)],
            vec![output(0, 49.0, Some(PAYEE)), output(1, 0.5, None)],
        )],
    ));
    let mut engine = engine(chain, SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    let ledger = snapshot(&engine);
    let miner = ledger.addresses.iter().find(|a| a.address == MINER).unwrap();
    assert_eq!(miner.kind, AddressKind::Legacy);
    let payee = ledger.addresses.iter().find(|a| a.address == PAYEE).unwrap();
    assert_eq!(payee.kind, AddressKind::Bech32);
    // two coinbases plus one paying output; the bare output has no address row
    assert_eq!(ledger.addresses.len(), 3);
}

#[tokio::test]
async fn spends_output_created_earlier_in_same_block() {
    let chain = simple_chain(0);
    let cb0 = coinbase_txid(0, "a");
    chain.push(block(
        1,
        "a",
        vec![
            spend("parent", &[(cb0.as_str(), 0)], vec![output(0, 49.0, Some(PAYEE))]),
            spend("child", &[("parent", 0)], vec![output(0, 48.5, Some(MINER))]),
        ],
    ));
    let mut engine = engine(chain, SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    let ledger = snapshot(&engine);
    assert_eq!(ledger.valid_transaction("parent").unwrap().fee, Some(100_000_000));
    assert_eq!(ledger.valid_transaction("child").unwrap().fee, Some(50_000_000));
}

#[tokio::test]
async fn double_spend_across_blocks_is_rejected() {
    let chain = simple_chain(1);
    let cb1 = coinbase_txid(1, "a");
    let first = spend("first", &[(cb1.as_str(), 0)], vec![output(0, 49.0, None)]);
    let second = spend("second", &[(cb1.as_str(), 0)], vec![output(0, 49.0, None)]);
    chain.push(block(2, "a", vec![first]));
    chain.push(block(3, "a", vec![second]));
    let mut engine = engine(chain, SyncConfig::default());

    let err = engine.sync_once(None).await.unwrap_err();
    assert!(matches!(err, IndexerError::RowCount { expected: 1, affected: 0, .. }));
    assert!(err.is_consistency_fault());
    assert!(!err.is_transient());

    let ledger = snapshot(&engine);
    assert_eq!(ledger.valid_blocks_at(2).len(), 1);
    assert!(ledger.valid_blocks_at(3).is_empty());
    assert!(ledger.valid_transaction("second").is_none());
    assert!(ledger.valid_transaction(&coinbase_txid(3, "a")).is_none());
}

#[tokio::test]
async fn dangling_spend_rolls_back_whole_block() {
    let chain = simple_chain(1);
    let orphan = spend("orphan", &[("nowhere", 7)], vec![output(0, 1.0, None)]);
    chain.push(block(2, "a", vec![orphan]));
    let mut engine = engine(chain, SyncConfig::default());

    let err = engine.sync_once(None).await.unwrap_err();
    match &err {
        IndexerError::DanglingSpend { txid, vin, prev_txid, prev_vout } => {
            assert_eq!(txid, "orphan");
            assert_eq!(*vin, 0);
            assert_eq!(prev_txid, "nowhere");
            assert_eq!(*prev_vout, 7);
        }
        other => panic!("expected a dangling spend, got {other:?}"),
    }

    let ledger = snapshot(&engine);
    assert!(ledger.valid_blocks_at(2).is_empty());
    assert!(ledger.valid_transaction(&coinbase_txid(2, "a")).is_none());
    assert_eq!(ledger.blocks.len(), 2);
    assert_eq!(ledger.transactions.len(), 2);
}

#[tokio::test]
async fn block_without_leading_coinbase_is_malformed() {
    let chain = simple_chain(0);
    let mut bad = block(1, "a", vec![]);
    let cb0 = coinbase_txid(0, "a");
    bad.transactions = vec![spend("not-coinbase", &[(cb0.as_str(), 0)], vec![])];
    chain.push(bad);
    let mut engine = engine(chain, SyncConfig::default());

    let err = engine.sync_once(None).await.unwrap_err();
    assert!(matches!(err, IndexerError::MalformedBlock { height: 1, .. }));
    assert!(snapshot(&engine).valid_blocks_at(1).is_empty());
}

#[tokio::test]
async fn address_from_wrong_network_aborts_block() {
    let chain = simple_chain(0);
    chain.push(block(
        1,
        "a",
        vec![spend(
            "to-mainnet",
            &[(coinbase_txid(0, "a").as_str(), 0)],
            vec![output(0, 49.0, Some("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"))],
        )],
    ));
    let mut engine = engine(chain, SyncConfig::default());

    let err = engine.sync_once(None).await.unwrap_err();
    assert!(matches!(err, IndexerError::InvalidAddress { .. }));
    assert!(snapshot(&engine).valid_blocks_at(1).is_empty());
}

// ─── Reorgs ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reorg_opens_branch_at_common_ancestor() {
    let mut engine = engine(simple_chain(6), SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    fork_from(engine.chain(), 5, 7);
    let report = engine.sync_once(None).await.unwrap();

    assert_eq!(report.reorgs.len(), 1);
    let event = &report.reorgs[0];
    assert_eq!(event.detected_at, 6);
    assert_eq!(event.ancestor, 4);
    assert_eq!(event.depth(), 2);
    assert_eq!(event.parent_branch, 1);
    assert_eq!(event.branch, 2);
    assert_eq!(event.invalidated, 2);
    assert_eq!(report.imported, 3);
    assert_eq!(engine.branches().tip(), Some(2));

    let ledger = snapshot(&engine);
    let branch = ledger.branches.iter().find(|b| b.id == 2).unwrap();
    assert_eq!(branch.fork_height, 4);
    assert_eq!(branch.parent_id, Some(1));

    for height in 5..=6 {
        let stale = ledger
            .blocks
            .iter()
            .find(|b| b.record.hash == block_hash(height, "a"))
            .unwrap();
        assert!(!stale.is_valid);
        assert!(ledger.valid_transaction(&coinbase_txid(height, "a")).is_none());
    }
    for height in 5..=7 {
        let live = ledger.valid_blocks_at(height);
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].record.hash, block_hash(height, "b"));
        assert_eq!(live[0].record.branch_id, 2);
    }
    assert_eq!(ledger.valid_blocks_at(4)[0].record.branch_id, 1);
    assert_one_valid_block_per_height(&ledger);
}

#[tokio::test]
async fn reorg_reopens_outputs_spent_on_stale_branch() {
    let chain = simple_chain(4);
    let cb4 = coinbase_txid(4, "a");
    let stale_pay = spend("stale-pay", &[(cb4.as_str(), 0)], vec![output(0, 49.0, None)]);
    chain.push(block(5, "a", vec![stale_pay]));
    let mut engine = engine(chain, SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    engine.chain().truncate(5);
    let live_pay = spend("live-pay", &[(cb4.as_str(), 0)], vec![output(0, 48.0, None)]);
    engine.chain().push(on_parent(block(5, "b", vec![live_pay]), "a"));
    let report = engine.sync_once(None).await.unwrap();
    assert_eq!(report.reorgs.len(), 1);

    let ledger = snapshot(&engine);
    assert!(ledger.valid_transaction("stale-pay").is_none());
    let live = ledger.valid_transaction("live-pay").unwrap();
    assert_eq!(live.fee, Some(200_000_000));

    let funding = ledger.valid_transaction(&cb4).unwrap();
    let output = ledger
        .outputs
        .iter()
        .find(|o| o.tx_id == funding.id && o.vout == 0)
        .unwrap();
    let live_input = ledger
        .inputs
        .iter()
        .find(|i| i.is_valid && i.record.tx_id == live.id)
        .unwrap();
    assert!(output.is_spent);
    assert_eq!(output.spent_by_input_id, Some(live_input.id));
    assert!(ledger.inputs.iter().filter(|i| !i.is_valid).count() == 1);
}

#[tokio::test]
async fn consecutive_reorgs_chain_branches() {
    let mut engine = engine(simple_chain(4), SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    fork_from(engine.chain(), 3, 4);
    engine.sync_once(None).await.unwrap();

    engine.chain().truncate(4);
    engine.chain().push(on_parent(block(4, "c", vec![]), "b"));
    let report = engine.sync_once(None).await.unwrap();
    let event = &report.reorgs[0];
    assert_eq!(event.ancestor, 3);
    assert_eq!(event.parent_branch, 2);
    assert_eq!(event.branch, 3);

    let ledger = snapshot(&engine);
    assert_eq!(ledger.valid_blocks_at(3)[0].record.branch_id, 2);
    assert_eq!(ledger.valid_blocks_at(4)[0].record.branch_id, 3);
    assert_one_valid_block_per_height(&ledger);
}

#[tokio::test]
async fn ancestor_search_starts_at_live_tip() {
    let mut engine = engine(simple_chain(6), SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    // the live chain is now shorter than the stored one
    fork_from(engine.chain(), 5, 5);
    let resolver = ReorgResolver::new();
    let mut tx = engine.store().begin().await.unwrap();
    let ancestor = resolver.find_common_ancestor(engine.chain(), &mut tx).await.unwrap();
    tx.rollback().await.unwrap();
    assert_eq!(ancestor, 4);
}

#[tokio::test]
async fn ancestor_is_highest_matching_height() {
    let mut engine = engine(simple_chain(9), SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    for k in [8, 5, 1] {
        fork_from(engine.chain(), k + 1, 9);
        let mut tx = engine.store().begin().await.unwrap();
        let ancestor = ReorgResolver::new()
            .find_common_ancestor(engine.chain(), &mut tx)
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(ancestor, k);
        engine.chain().truncate(0);
        for h in 0..=9 {
            engine.chain().push(block(h, "a", vec![]));
        }
    }
}

#[tokio::test]
async fn diverged_genesis_is_refused() {
    let mut engine = engine(simple_chain(2), SyncConfig::default());
    engine.sync_once(None).await.unwrap();

    fork_from(engine.chain(), 0, 2);
    let err = engine.sync_once(None).await.unwrap_err();
    match &err {
        IndexerError::GenesisMismatch { stored, live } => {
            assert_eq!(stored, &block_hash(0, "a"));
            assert_eq!(live, &block_hash(0, "b"));
        }
        other => panic!("expected a genesis mismatch, got {other:?}"),
    }
    assert!(err.is_consistency_fault());

    // the suffix above genesis was already invalidated by the resolver
    let ledger = snapshot(&engine);
    assert_eq!(ledger.valid_blocks_at(0)[0].record.hash, block_hash(0, "a"));
    assert!(ledger.valid_blocks_at(1).is_empty());
    assert!(ledger.valid_blocks_at(2).is_empty());
}

/// Serves `inner`, but the first request for height 4 finds the node has
/// replaced blocks 3 and 4 with fork `"b"`.
struct ReorgsUnderneath {
    inner: InMemoryChain,
    reorged: AtomicBool,
}

#[async_trait]
impl ChainSource for ReorgsUnderneath {
    async fn chain_name(&self) -> Result<String, IndexerError> {
        self.inner.chain_name().await
    }

    async fn block_count(&self) -> Result<u64, IndexerError> {
        self.inner.block_count().await
    }

    async fn block_hash(&self, height: u64) -> Result<String, IndexerError> {
        if height == 4 && !self.reorged.swap(true, Ordering::SeqCst) {
            fork_from(&self.inner, 3, 4);
        }
        self.inner.block_hash(height).await
    }

    async fn block(&self, hash: &str) -> Result<ChainBlock, IndexerError> {
        self.inner.block(hash).await
    }
}

#[tokio::test]
async fn reorg_below_next_height_is_caught_by_parent_link() {
    let chain = ReorgsUnderneath {
        inner: simple_chain(3),
        reorged: AtomicBool::new(false),
    };
    let mut engine = SyncEngine::new(
        chain,
        MemoryLedger::new(),
        SyncConfig::default(),
        ChainNetwork::Test,
    );
    engine.sync_once(None).await.unwrap();

    // 3a is still live when the pass re-checks it, then 3b replaces it
    engine.chain().inner.push(block(4, "a", vec![]));
    let report = engine.sync_once(None).await.unwrap();

    assert_eq!(report.reorgs.len(), 1);
    let event = &report.reorgs[0];
    assert_eq!(event.detected_at, 3);
    assert_eq!(event.ancestor, 2);
    assert_eq!(event.invalidated, 1);
    assert_eq!(report.imported, 2);

    let ledger = engine.store().snapshot().unwrap();
    let stale = ledger
        .blocks
        .iter()
        .find(|b| b.record.hash == block_hash(3, "a"))
        .unwrap();
    assert!(!stale.is_valid);
    assert_eq!(ledger.valid_blocks_at(3)[0].record.hash, block_hash(3, "b"));
    let tip = ledger.valid_blocks_at(4)[0];
    assert_eq!(tip.record.hash, block_hash(4, "b"));
    assert_eq!(tip.record.previous_hash, Some(block_hash(3, "b")));
    assert!(ledger.blocks.iter().all(|b| b.record.hash != block_hash(4, "a")));
    assert_one_valid_block_per_height(&ledger);
}

// ─── Faults and the outer loop ────────────────────────────────────────────────

#[tokio::test]
async fn offline_node_is_a_transient_fault() {
    let mut engine = engine(simple_chain(2), SyncConfig::default());
    engine.chain().set_offline(true);

    let err = engine.sync_once(None).await.unwrap_err();
    assert!(err.is_transient());
    assert!(matches!(
        err,
        IndexerError::Transport { ref method, .. } if method == "getblockcount"
    ));
    assert!(snapshot(&engine).blocks.is_empty());

    engine.chain().set_offline(false);
    assert_eq!(engine.sync_once(None).await.unwrap().imported, 3);
}

#[tokio::test]
async fn detect_reads_network_from_node() {
    let engine = SyncEngine::detect(simple_chain(0), MemoryLedger::new(), SyncConfig::default())
        .await
        .unwrap();
    assert_eq!(engine.network(), ChainNetwork::Test);

    let liquid = InMemoryChain::new("liquid");
    let unknown = SyncEngine::detect(liquid, MemoryLedger::new(), SyncConfig::default()).await;
    assert!(matches!(unknown, Err(IndexerError::Config(_))));
}

#[tokio::test]
async fn run_loop_stops_on_shutdown() {
    let config = SyncConfig {
        poll_interval_ms: 10,
        ..SyncConfig::default()
    };
    let mut engine = engine(simple_chain(3), config);

    tokio::time::timeout(
        Duration::from_secs(5),
        engine.run(tokio::time::sleep(Duration::from_millis(50))),
    )
    .await
    .expect("run loop did not stop after shutdown");

    assert_eq!(snapshot(&engine).blocks.len(), 4);
    assert_eq!(engine.state(), chainmirror_core::SyncState::Idle);
}
