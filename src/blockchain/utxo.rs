use log::info;
use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use super::block::Block;
use super::chain::{Blockchain, BlockchainError};
use super::crypto::Address;
use super::storage::{StorageError, UnspentChange};
use super::transaction::{Transaction, TxOutput};

/// An unspent output together with its position in the creating transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    pub index: i32,
    pub output: TxOutput,
}

/// The still-unspent outputs of one transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutputs {
    pub outputs: Vec<UnspentOutput>,
}

impl UnspentOutputs {
    /// Every output of `tx`, all unspent
    pub fn from_transaction(tx: &Transaction) -> Self {
        let outputs = tx
            .outputs
            .iter()
            .enumerate()
            .map(|(index, output)| UnspentOutput {
                index: index as i32,
                output: output.clone(),
            })
            .collect();

        UnspentOutputs { outputs }
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn contains(&self, index: i32) -> bool {
        self.outputs.iter().any(|unspent| unspent.index == index)
    }

    pub fn total_value(&self) -> i64 {
        self.outputs.iter().map(|unspent| unspent.output.value).sum()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serialize(self).map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, StorageError> {
        bincode::deserialize(data).map_err(|e| StorageError::DeserializationError(e.to_string()))
    }
}

/// Index of unspent outputs derived from the chain.
///
/// Rebuilds and incremental updates take the write side of the lock, so a
/// reader never sees a half-applied change.
#[derive(Debug)]
pub struct UtxoSet {
    chain: Arc<Blockchain>,
    lock: RwLock<()>,
}

impl UtxoSet {
    pub fn new(chain: Arc<Blockchain>) -> Self {
        UtxoSet {
            chain,
            lock: RwLock::new(()),
        }
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    /// Replaces the whole index with a fresh scan of the chain and returns the
    /// number of indexed transactions.
    pub fn reindex(&self) -> Result<usize, BlockchainError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        let unspent = self.chain.find_utxo()?;
        let count = unspent.len();
        let total: i64 = unspent.values().map(UnspentOutputs::total_value).sum();
        let changes = unspent
            .into_iter()
            .map(|(tx_id, outputs)| (tx_id, Some(outputs)))
            .collect();

        self.chain.storage().write_unspent(changes, true)?;

        info!(
            "Reindexed UTXO set: {} transactions with unspent outputs worth {}",
            count, total
        );
        Ok(count)
    }

    /// Applies one newly accepted block: removes the outputs its inputs spend
    /// and adds every output it creates.
    pub fn update(&self, block: &Block) -> Result<(), BlockchainError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        self.apply_block(block)
    }

    /// Checks `transactions` against the index, mines them and indexes the
    /// new block, all under one write lock. A concurrent spend of the same
    /// output fails with `DoubleSpend` instead of reaching the chain.
    pub fn mine_checked(&self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        self.check_unspent(&transactions)?;
        let block = self.chain.mine_block(transactions)?;
        self.apply_block(&block)?;

        Ok(block)
    }

    // Caller holds the write lock
    fn apply_block(&self, block: &Block) -> Result<(), BlockchainError> {
        let storage = self.chain.storage();

        // Pending state per transaction id; `None` marks a deleted entry
        let mut pending: HashMap<Vec<u8>, Option<UnspentOutputs>> = HashMap::new();

        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let current = match pending.get(&input.prev_tx_id) {
                        Some(entry) => entry.clone(),
                        None => storage.get_unspent(&input.prev_tx_id)?,
                    };

                    let mut outputs = current
                        .filter(|outputs| outputs.contains(input.output_index))
                        .ok_or_else(|| {
                            BlockchainError::IntegrityError(format!(
                                "block {} spends {}:{} which is not in the UTXO set",
                                hex::encode(&block.hash),
                                hex::encode(&input.prev_tx_id),
                                input.output_index
                            ))
                        })?;

                    outputs.outputs.retain(|unspent| unspent.index != input.output_index);
                    let next = if outputs.is_empty() { None } else { Some(outputs) };
                    pending.insert(input.prev_tx_id.clone(), next);
                }
            }

            pending.insert(tx.id.clone(), Some(UnspentOutputs::from_transaction(tx)));
        }

        let changes: Vec<UnspentChange> = pending.into_iter().collect();
        storage.write_unspent(changes, false)?;

        info!(
            "Updated UTXO set with block {} at height {}",
            hex::encode(&block.hash),
            block.height
        );
        Ok(())
    }

    /// Every unspent output locked to `pub_key_hash`
    pub fn find_unspent_for(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, BlockchainError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);

        let outputs = self
            .chain
            .storage()
            .unspent_entries()?
            .into_iter()
            .flat_map(|(_, entry)| entry.outputs)
            .map(|unspent| unspent.output)
            .filter(|output| output.is_locked_with_key(pub_key_hash))
            .collect();

        Ok(outputs)
    }

    /// Walks the index in transaction id order, collecting outputs locked to
    /// `pub_key_hash` until at least `amount` is accumulated. First fit, not
    /// best fit.
    pub fn find_spendable(
        &self,
        pub_key_hash: &[u8],
        amount: i64,
    ) -> Result<(i64, BTreeMap<Vec<u8>, Vec<i32>>), BlockchainError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);

        let mut accumulated = 0i64;
        let mut spendable: BTreeMap<Vec<u8>, Vec<i32>> = BTreeMap::new();

        'entries: for (tx_id, entry) in self.chain.storage().unspent_entries()? {
            for unspent in entry.outputs {
                if accumulated >= amount {
                    break 'entries;
                }
                if unspent.output.is_locked_with_key(pub_key_hash) {
                    accumulated += unspent.output.value;
                    spendable.entry(tx_id.clone()).or_default().push(unspent.index);
                }
            }
        }

        Ok((accumulated, spendable))
    }

    /// Sum of every unspent output locked to `address`
    pub fn balance(&self, address: &Address) -> Result<i64, BlockchainError> {
        let pub_key_hash = address.pub_key_hash()?;
        Ok(self
            .find_unspent_for(&pub_key_hash)?
            .iter()
            .map(|output| output.value)
            .sum())
    }

    /// Number of transactions that still have unspent outputs
    pub fn count_entries(&self) -> usize {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        self.chain.storage().count_unspent()
    }

    /// Rejects a batch in which an input spends an output missing from the
    /// index, or two inputs spend the same output.
    pub fn ensure_unspent(&self, txs: &[Transaction]) -> Result<(), BlockchainError> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        self.check_unspent(txs)
    }

    // Caller holds either side of the lock
    fn check_unspent(&self, txs: &[Transaction]) -> Result<(), BlockchainError> {
        let storage = self.chain.storage();
        let mut claimed: HashSet<(Vec<u8>, i32)> = HashSet::new();

        for tx in txs.iter().filter(|tx| !tx.is_coinbase()) {
            for input in &tx.inputs {
                let outpoint = format!("{}:{}", hex::encode(&input.prev_tx_id), input.output_index);

                let available = storage
                    .get_unspent(&input.prev_tx_id)?
                    .map(|outputs| outputs.contains(input.output_index))
                    .unwrap_or(false);
                if !available {
                    return Err(BlockchainError::DoubleSpend(format!(
                        "transaction {} spends {} which is already spent or unknown",
                        hex::encode(&tx.id),
                        outpoint
                    )));
                }

                if !claimed.insert((input.prev_tx_id.clone(), input.output_index)) {
                    return Err(BlockchainError::DoubleSpend(format!(
                        "{} is spent twice in one batch",
                        outpoint
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::KeyPair;
    use crate::blockchain::storage::BlockchainStorage;
    use crate::blockchain::transaction::{TransactionError, TxInput, REWARD};

    fn setup() -> (KeyPair, UtxoSet) {
        let miner = KeyPair::new();
        let storage = BlockchainStorage::temporary().unwrap();
        let chain = Blockchain::init_with(storage, &miner.address()).unwrap();
        let utxo = UtxoSet::new(Arc::new(chain));
        utxo.reindex().unwrap();
        (miner, utxo)
    }

    fn total_unspent(utxo: &UtxoSet) -> i64 {
        utxo.chain()
            .storage()
            .unspent_entries()
            .unwrap()
            .iter()
            .map(|(_, entry)| entry.total_value())
            .sum()
    }

    #[test]
    fn test_genesis_balance() {
        let (miner, utxo) = setup();

        assert_eq!(utxo.balance(&miner.address()).unwrap(), REWARD);
        assert_eq!(utxo.count_entries(), 1);
        assert_eq!(utxo.balance(&KeyPair::new().address()).unwrap(), 0);
    }

    #[test]
    fn test_rewards_are_conserved() {
        let (miner, utxo) = setup();

        for _ in 0..3 {
            let coinbase = Transaction::new_coinbase(&miner.address(), "").unwrap();
            let block = utxo.chain().mine_block(vec![coinbase]).unwrap();
            utxo.update(&block).unwrap();
        }

        assert_eq!(total_unspent(&utxo), 4 * REWARD);
        assert_eq!(utxo.balance(&miner.address()).unwrap(), 4 * REWARD);
        assert_eq!(utxo.count_entries(), 4);
    }

    #[test]
    fn test_send_and_mine_scenario() {
        let (alice, utxo) = setup();
        let bob = KeyPair::new();

        let transfer = Transaction::new_transfer(&alice, &bob.address(), 4, &utxo).unwrap();
        assert_eq!(transfer.outputs.len(), 2);
        assert_eq!(transfer.outputs[0].value, 4);
        assert_eq!(transfer.outputs[1].value, 6);

        let coinbase = Transaction::new_coinbase(&alice.address(), "").unwrap();
        let block = utxo.chain().mine_block(vec![coinbase, transfer]).unwrap();
        utxo.update(&block).unwrap();

        assert_eq!(utxo.balance(&alice.address()).unwrap(), 16);
        assert_eq!(utxo.balance(&bob.address()).unwrap(), 4);
        assert_eq!(utxo.count_entries(), 2);
        assert_eq!(total_unspent(&utxo), 20);
    }

    #[test]
    fn test_update_matches_reindex() {
        let (alice, utxo) = setup();
        let bob = KeyPair::new();

        let coinbase = Transaction::new_coinbase(&alice.address(), "").unwrap();
        let block = utxo.chain().mine_block(vec![coinbase]).unwrap();
        utxo.update(&block).unwrap();

        let transfer = Transaction::new_transfer(&alice, &bob.address(), 13, &utxo).unwrap();
        let block = utxo.chain().mine_block(vec![transfer]).unwrap();
        utxo.update(&block).unwrap();

        let incremental = utxo.chain().storage().unspent_entries().unwrap();
        utxo.reindex().unwrap();
        let rebuilt = utxo.chain().storage().unspent_entries().unwrap();

        assert_eq!(incremental, rebuilt);
        assert_eq!(utxo.balance(&alice.address()).unwrap(), 7);
        assert_eq!(utxo.balance(&bob.address()).unwrap(), 13);
    }

    #[test]
    fn test_partial_spend_keeps_output_indices() {
        let (alice, utxo) = setup();
        let bob = KeyPair::new();

        // 4 to bob at index 0, 6 change to alice at index 1
        let first = Transaction::new_transfer(&alice, &bob.address(), 4, &utxo).unwrap();
        let block = utxo.chain().mine_block(vec![first.clone()]).unwrap();
        utxo.update(&block).unwrap();

        // bob spends index 0, leaving only index 1 of `first`
        let second = Transaction::new_transfer(&bob, &alice.address(), 4, &utxo).unwrap();
        let block = utxo.chain().mine_block(vec![second]).unwrap();
        utxo.update(&block).unwrap();

        let remaining = utxo.chain().storage().get_unspent(&first.id).unwrap().unwrap();
        assert_eq!(remaining.outputs.len(), 1);
        assert_eq!(remaining.outputs[0].index, 1);

        // alice now spends index 1 of `first` plus the new 4
        let third = Transaction::new_transfer(&alice, &bob.address(), 10, &utxo).unwrap();
        let block = utxo.chain().mine_block(vec![third]).unwrap();
        utxo.update(&block).unwrap();

        assert!(utxo.chain().storage().get_unspent(&first.id).unwrap().is_none());
        assert_eq!(utxo.balance(&alice.address()).unwrap(), 0);
        assert_eq!(utxo.balance(&bob.address()).unwrap(), 10);
    }

    #[test]
    fn test_find_spendable_is_first_fit() {
        let (miner, utxo) = setup();
        for _ in 0..3 {
            let coinbase = Transaction::new_coinbase(&miner.address(), "").unwrap();
            let block = utxo.chain().mine_block(vec![coinbase]).unwrap();
            utxo.update(&block).unwrap();
        }

        let (accumulated, spendable) = utxo.find_spendable(&miner.pub_key_hash(), 15).unwrap();
        assert_eq!(accumulated, 20);
        assert_eq!(spendable.values().map(Vec::len).sum::<usize>(), 2);

        let all_ids: Vec<Vec<u8>> = utxo
            .chain()
            .storage()
            .unspent_entries()
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        let chosen: Vec<Vec<u8>> = spendable.keys().cloned().collect();
        assert_eq!(chosen, all_ids[..2].to_vec());

        let (accumulated, _) = utxo.find_spendable(&miner.pub_key_hash(), 1_000).unwrap();
        assert_eq!(accumulated, 4 * REWARD);
    }

    #[test]
    fn test_insufficient_funds() {
        let (alice, utxo) = setup();
        let result = Transaction::new_transfer(&alice, &KeyPair::new().address(), REWARD + 1, &utxo);

        assert!(matches!(
            result,
            Err(BlockchainError::TransactionError(TransactionError::InsufficientFunds {
                required: 11,
                available: 10
            }))
        ));
    }

    #[test]
    fn test_double_spend_rejected() {
        let (alice, utxo) = setup();
        let bob = KeyPair::new();
        let carol = KeyPair::new();

        let to_bob = Transaction::new_transfer(&alice, &bob.address(), 5, &utxo).unwrap();
        let to_carol = Transaction::new_transfer(&alice, &carol.address(), 5, &utxo).unwrap();
        assert_eq!(to_bob.inputs[0].prev_tx_id, to_carol.inputs[0].prev_tx_id);

        assert!(matches!(
            utxo.ensure_unspent(&[to_bob.clone(), to_carol.clone()]),
            Err(BlockchainError::DoubleSpend(_))
        ));

        utxo.ensure_unspent(&[to_bob.clone()]).unwrap();
        let block = utxo.chain().mine_block(vec![to_bob]).unwrap();
        utxo.update(&block).unwrap();

        assert!(matches!(
            utxo.ensure_unspent(&[to_carol]),
            Err(BlockchainError::DoubleSpend(_))
        ));
        let (accumulated, spendable) = utxo.find_spendable(&alice.pub_key_hash(), 10).unwrap();
        assert_eq!(accumulated, 5);
        assert!(!spendable.contains_key(&block.transactions[0].inputs[0].prev_tx_id));
    }

    #[test]
    fn test_mine_checked_rejects_interleaved_spend() {
        let (alice, utxo) = setup();
        let bob = KeyPair::new();
        let carol = KeyPair::new();

        let to_bob = Transaction::new_transfer(&alice, &bob.address(), REWARD, &utxo).unwrap();
        let to_carol = Transaction::new_transfer(&alice, &carol.address(), REWARD, &utxo).unwrap();

        // Both pass the check before either is mined
        utxo.ensure_unspent(&[to_bob.clone()]).unwrap();
        utxo.ensure_unspent(&[to_carol.clone()]).unwrap();

        let block = utxo.mine_checked(vec![to_bob]).unwrap();
        assert_eq!(block.height, 1);
        assert!(matches!(
            utxo.mine_checked(vec![to_carol]),
            Err(BlockchainError::DoubleSpend(_))
        ));

        assert_eq!(utxo.chain().get_best_height(), 1);
        utxo.reindex().unwrap();
        assert_eq!(utxo.balance(&bob.address()).unwrap(), REWARD);
        assert_eq!(utxo.balance(&carol.address()).unwrap(), 0);
        assert_eq!(total_unspent(&utxo), REWARD);
    }

    #[test]
    fn test_concurrent_spends_mine_once() {
        let (alice, utxo) = setup();
        let spends: Vec<Transaction> = (0..2)
            .map(|_| Transaction::new_transfer(&alice, &KeyPair::new().address(), REWARD, &utxo).unwrap())
            .collect();

        let results: Vec<Result<Block, BlockchainError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = spends
                .into_iter()
                .map(|tx| {
                    let utxo = &utxo;
                    scope.spawn(move || utxo.mine_checked(vec![tx]))
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|result| matches!(result, Err(BlockchainError::DoubleSpend(_)))));
        assert_eq!(utxo.chain().get_best_height(), 1);
        assert_eq!(total_unspent(&utxo), REWARD);
    }

    #[test]
    fn test_repeated_input_is_not_mined() {
        let (alice, utxo) = setup();
        let genesis_tx = utxo.chain().find_utxo().unwrap().into_keys().next().unwrap();

        let input = TxInput {
            prev_tx_id: genesis_tx,
            output_index: 0,
            signature: Vec::new(),
            public_key: alice.public_key().to_vec(),
        };
        let mut tx = Transaction {
            id: Vec::new(),
            inputs: vec![input.clone(), input],
            outputs: vec![TxOutput::new(2 * REWARD, &alice.address()).unwrap()],
        };
        utxo.chain().sign_transaction(&mut tx, &alice).unwrap();

        assert!(!utxo.chain().verify_transaction(&tx).unwrap());
        assert!(matches!(
            utxo.chain().mine_block(vec![tx]),
            Err(BlockchainError::InvalidTransaction(_))
        ));

        utxo.reindex().unwrap();
        assert_eq!(total_unspent(&utxo), REWARD);
    }

    #[test]
    fn test_update_with_unknown_spend_is_integrity_error() {
        let (alice, utxo) = setup();
        let transfer = Transaction::new_transfer(&alice, &KeyPair::new().address(), 3, &utxo).unwrap();
        let block = utxo.chain().mine_block(vec![transfer]).unwrap();

        utxo.update(&block).unwrap();
        assert!(matches!(utxo.update(&block), Err(BlockchainError::IntegrityError(_))));
    }
}
