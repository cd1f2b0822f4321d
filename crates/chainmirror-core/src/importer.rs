//! Block import: decompose one node block into ledger rows.

use crate::address::AddressClassifier;
use crate::amount::btc_to_sats;
use crate::branch::BranchManager;
use crate::error::IndexerError;
use crate::ledger::{
    AddressRecord, BlockRecord, BranchId, InputRecord, LedgerTx, OutputRecord, RowId,
    TransactionRecord,
};
use crate::types::{ChainBlock, ChainInput, ChainOutput, ChainTransaction};

/// Counters for one imported block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub block_id: RowId,
    pub transactions: u64,
    pub outputs: u64,
    pub inputs: u64,
    pub addresses: u64,
    /// Sum of all non-coinbase fees in the block, in satoshis.
    pub fees: i64,
}

/// Writes blocks, transactions, outputs and inputs through an open
/// [`LedgerTx`].
///
/// The caller owns the transaction boundary: on any error the transaction
/// must be rolled back, which discards everything written for the block.
#[derive(Debug, Clone)]
pub struct BlockImporter {
    classifier: AddressClassifier,
}

impl BlockImporter {
    pub fn new(classifier: AddressClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &AddressClassifier {
        &self.classifier
    }

    /// Import `block` on the current tip branch.
    pub async fn import<T: LedgerTx>(
        &self,
        tx: &mut T,
        branches: &mut BranchManager,
        block: &ChainBlock,
    ) -> Result<ImportStats, IndexerError> {
        let height = block.height;
        match block.transactions.first() {
            Some(first) if first.is_coinbase() => {}
            Some(first) => {
                return Err(malformed(
                    height,
                    format!("first transaction {} is not a single-input coinbase", first.txid),
                ))
            }
            None => return Err(malformed(height, "block has no transactions")),
        }

        let branch_id = branches.best_branch(tx).await?;
        let block_id = tx.insert_block(&block_record(branch_id, block)).await?;
        let mut stats = ImportStats {
            block_id,
            ..Default::default()
        };

        for (index, chain_tx) in block.transactions.iter().enumerate() {
            let is_coinbase = index == 0;
            let has_coinbase_input = chain_tx
                .vin
                .iter()
                .any(|i| matches!(i, ChainInput::Coinbase { .. }));
            if !is_coinbase && has_coinbase_input {
                return Err(malformed(
                    height,
                    format!("coinbase input in non-leading transaction {}", chain_tx.txid),
                ));
            }

            let tx_id = tx
                .insert_transaction(&transaction_record(block_id, chain_tx, is_coinbase))
                .await?;
            stats.transactions += 1;

            let mut total_out: i64 = 0;
            for output in &chain_tx.vout {
                let record = self.output_record(tx_id, height, output)?;
                total_out += record.value;
                stats.addresses += record.addresses.len() as u64;
                tx.insert_output(&record).await?;
                stats.outputs += 1;
            }

            if is_coinbase {
                if let Some(ChainInput::Coinbase {
                    coinbase, sequence, ..
                }) = chain_tx.vin.first()
                {
                    tx.set_block_coinbase(block_id, *sequence, coinbase).await?;
                }
                continue;
            }

            let mut total_in: i64 = 0;
            for (vin, input) in chain_tx.vin.iter().enumerate() {
                let ChainInput::Spend {
                    txid: prev_txid,
                    vout: prev_vout,
                    script_sig,
                    witness,
                    sequence,
                } = input
                else {
                    continue;
                };
                let vin = vin as u32;

                let spent = tx
                    .find_output(prev_txid, *prev_vout)
                    .await?
                    .ok_or_else(|| IndexerError::DanglingSpend {
                        txid: chain_tx.txid.clone(),
                        vin,
                        prev_txid: prev_txid.clone(),
                        prev_vout: *prev_vout,
                    })?;
                if spent.is_spent {
                    return Err(IndexerError::row_count(
                        format!(
                            "mark output {prev_txid}:{prev_vout} spent by {}:{vin}",
                            chain_tx.txid
                        ),
                        1,
                        0,
                    ));
                }

                tx.insert_input(&InputRecord {
                    tx_id,
                    vin,
                    output_id: spent.id,
                    spent_value: spent.value,
                    sequence: *sequence,
                    script_asm: script_sig.as_ref().map(|s| s.asm.clone()),
                    script_hex: script_sig.as_ref().map(|s| s.hex.clone()),
                    witness: witness.clone(),
                })
                .await?;
                total_in += spent.value;
                stats.inputs += 1;
            }

            let fee = total_in - total_out;
            tx.set_transaction_fee(tx_id, fee).await?;
            stats.fees += fee;
            tracing::debug!(txid = %chain_tx.txid, fee, "Imported transaction");
        }

        Ok(stats)
    }

    fn output_record(
        &self,
        tx_id: RowId,
        height: u64,
        output: &ChainOutput,
    ) -> Result<OutputRecord, IndexerError> {
        let value = btc_to_sats(output.value).ok_or_else(|| {
            malformed(height, format!("output value {} is not a valid amount", output.value))
        })?;
        let addresses = output
            .script_pub_key
            .destinations()
            .into_iter()
            .map(|address| {
                Ok(AddressRecord {
                    kind: self.classifier.classify(address)?,
                    address: address.to_string(),
                })
            })
            .collect::<Result<Vec<_>, IndexerError>>()?;

        let script = &output.script_pub_key;
        Ok(OutputRecord {
            tx_id,
            vout: output.n,
            value,
            addresses,
            req_sigs: script.req_sigs,
            script_asm: script.asm.clone(),
            script_hex: script.hex.clone(),
            script_type: script.script_type.clone(),
        })
    }
}

fn malformed(height: u64, reason: impl Into<String>) -> IndexerError {
    IndexerError::MalformedBlock {
        height,
        reason: reason.into(),
    }
}

fn block_record(branch_id: BranchId, block: &ChainBlock) -> BlockRecord {
    BlockRecord {
        branch_id,
        hash: block.hash.clone(),
        height: block.height,
        size: block.size,
        stripped_size: block.stripped_size,
        weight: block.weight,
        version: block.version,
        version_hex: block.version_hex.clone(),
        merkle_root: block.merkle_root.clone(),
        time: block.time,
        median_time: block.median_time,
        nonce: block.nonce,
        bits: block.bits.clone(),
        difficulty: block.difficulty,
        chainwork: block.chainwork.clone(),
        tx_count: block.tx_count,
        previous_hash: block.previous_block_hash.clone(),
    }
}

fn transaction_record(
    block_id: RowId,
    tx: &ChainTransaction,
    is_coinbase: bool,
) -> TransactionRecord {
    TransactionRecord {
        block_id,
        txid: tx.txid.clone(),
        hash: tx.hash.clone(),
        size: tx.size,
        vsize: tx.vsize,
        weight: tx.weight,
        version: tx.version,
        locktime: tx.locktime,
        hex: tx.hex.clone(),
        is_coinbase,
    }
}
