use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use log::{debug, info};
use thiserror::Error;

use super::block::Block;
use super::crypto::{Address, CryptoError, KeyPair};
use super::proof::ProofError;
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{Transaction, TransactionError};
use super::utxo::UnspentOutputs;

/// Memo carried by the coinbase of every genesis block
pub const GENESIS_DATA: &str = "First Transaction from Genesis";

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Proof of work error: {0}")]
    ProofError(#[from] ProofError),

    #[error("Blockchain already exists at {0}")]
    AlreadyExists(String),

    #[error("No existing blockchain found at {0}")]
    NotInitialized(String),

    #[error("Block {0} not found")]
    BlockNotFound(String),

    #[error("Transaction {0} not found")]
    TransactionNotFound(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Invalid proof of work for block {0}")]
    InvalidProofOfWork(String),

    #[error("Double spend: {0}")]
    DoubleSpend(String),

    #[error("Integrity error: {0}")]
    IntegrityError(String),
}

/// Hash and height of the block the chain currently points at
#[derive(Debug, Clone)]
struct Tip {
    hash: Vec<u8>,
    height: u64,
}

/// Append-only block store with a height-gated tip
#[derive(Debug)]
pub struct Blockchain {
    storage: BlockchainStorage,

    /// Serializes every "read tip, decide whether to advance" step
    tip: Mutex<Tip>,
}

impl Blockchain {
    /// Creates a new chain at `path` whose genesis coinbase pays `address`
    ///
    /// # Arguments
    ///
    /// * `path` - The storage directory, which must not hold a chain yet
    /// * `address` - The address receiving the genesis reward
    pub fn init<P: AsRef<Path>>(path: P, address: &Address) -> Result<Self, BlockchainError> {
        let storage = BlockchainStorage::open(&path)?;
        if storage.has_chain()? {
            return Err(BlockchainError::AlreadyExists(path.as_ref().display().to_string()));
        }

        Self::init_with(storage, address)
    }

    /// Writes a genesis block into empty `storage`
    pub fn init_with(storage: BlockchainStorage, address: &Address) -> Result<Self, BlockchainError> {
        if storage.has_chain()? {
            return Err(BlockchainError::AlreadyExists("storage".to_string()));
        }

        let coinbase = Transaction::new_coinbase(address, GENESIS_DATA)?;
        let genesis = Block::genesis(coinbase)?;
        storage.append_block(&genesis, true)?;

        info!("Created genesis block {}", hex::encode(&genesis.hash));

        Ok(Blockchain {
            storage,
            tip: Mutex::new(Tip {
                hash: genesis.hash,
                height: genesis.height,
            }),
        })
    }

    /// Opens the chain previously created at `path`
    pub fn continue_existing<P: AsRef<Path>>(path: P) -> Result<Self, BlockchainError> {
        let location = path.as_ref().display().to_string();
        if !path.as_ref().exists() {
            return Err(BlockchainError::NotInitialized(location));
        }

        let storage = BlockchainStorage::open(&path)?;
        if !storage.has_chain()? {
            return Err(BlockchainError::NotInitialized(location));
        }

        Self::continue_with(storage)
    }

    /// Loads the tip recorded in `storage`
    pub fn continue_with(storage: BlockchainStorage) -> Result<Self, BlockchainError> {
        let hash = match storage.get_last_hash() {
            Ok(hash) => hash,
            Err(StorageError::NotFound(_)) => {
                return Err(BlockchainError::NotInitialized("storage".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let height = storage.get_block(&hash)?.height;

        info!("Loaded blockchain with tip {} at height {}", hex::encode(&hash), height);

        Ok(Blockchain {
            storage,
            tip: Mutex::new(Tip { hash, height }),
        })
    }

    pub fn storage(&self) -> &BlockchainStorage {
        &self.storage
    }

    fn current_tip(&self) -> Tip {
        self.tip.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_tip_hash(&self) -> Vec<u8> {
        self.current_tip().hash
    }

    pub fn get_best_height(&self) -> u64 {
        self.current_tip().height
    }

    /// Verifies `transactions`, mines them on top of the current tip and
    /// stores the result.
    ///
    /// # Returns
    ///
    /// The newly mined block
    pub fn mine_block(&self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        for tx in &transactions {
            if !self.verify_transaction(tx)? {
                return Err(BlockchainError::InvalidTransaction(hex::encode(&tx.id)));
            }
        }

        let tip = self.current_tip();
        let block = Block::create(transactions, tip.hash, tip.height + 1)?;
        self.store_block(&block)?;

        Ok(block)
    }

    /// Accepts a block received from a peer. Already-known blocks are ignored,
    /// and a non-genesis block must extend a stored parent.
    pub fn add_block(&self, block: &Block) -> Result<(), BlockchainError> {
        if self.storage.contains_block(&block.hash)? {
            debug!("Block {} already stored", hex::encode(&block.hash));
            return Ok(());
        }

        if !block.validate() {
            return Err(BlockchainError::InvalidProofOfWork(hex::encode(&block.hash)));
        }

        if !block.is_genesis() && !self.storage.contains_block(&block.prev_hash)? {
            return Err(BlockchainError::IntegrityError(format!(
                "parent {} of block {} is not stored",
                hex::encode(&block.prev_hash),
                hex::encode(&block.hash)
            )));
        }

        self.store_block(block)
    }

    /// Persists `block`, advancing the tip only if it is strictly higher.
    /// Equal heights keep the current tip.
    fn store_block(&self, block: &Block) -> Result<(), BlockchainError> {
        let mut tip = self.tip.lock().unwrap_or_else(PoisonError::into_inner);

        if self.storage.contains_block(&block.hash)? {
            return Ok(());
        }

        let advance = block.height > tip.height;
        self.storage.append_block(block, advance)?;

        if advance {
            tip.hash = block.hash.clone();
            tip.height = block.height;
            info!("Tip advanced to block {} at height {}", hex::encode(&block.hash), block.height);
        } else {
            info!(
                "Stored block {} at height {} without moving tip (height {})",
                hex::encode(&block.hash),
                block.height,
                tip.height
            );
        }

        Ok(())
    }

    /// Gets a block by its hash
    pub fn get_block(&self, hash: &[u8]) -> Result<Option<Block>, BlockchainError> {
        match self.storage.get_block(hash) {
            Ok(block) => Ok(Some(block)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Hashes of every block from tip to genesis
    pub fn get_block_hashes(&self) -> Result<Vec<Vec<u8>>, BlockchainError> {
        self.iter().map(|block| block.map(|block| block.hash)).collect()
    }

    /// Walks from the current tip back to genesis
    pub fn iter(&self) -> ChainIterator<'_> {
        ChainIterator {
            storage: &self.storage,
            current_hash: Some(self.get_tip_hash()),
        }
    }

    /// Finds a transaction by id with a scan from the tip
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, BlockchainError> {
        for block in self.iter() {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id == id) {
                return Ok(tx);
            }
        }

        Err(BlockchainError::TransactionNotFound(hex::encode(id)))
    }

    /// Every transaction referenced by an input of `tx`
    fn previous_transactions(
        &self,
        tx: &Transaction,
    ) -> Result<HashMap<Vec<u8>, Transaction>, BlockchainError> {
        let mut prev_txs = HashMap::new();
        for input in &tx.inputs {
            if !prev_txs.contains_key(&input.prev_tx_id) {
                let prev = self.find_transaction(&input.prev_tx_id)?;
                prev_txs.insert(prev.id.clone(), prev);
            }
        }
        Ok(prev_txs)
    }

    pub fn sign_transaction(&self, tx: &mut Transaction, key: &KeyPair) -> Result<(), BlockchainError> {
        let prev_txs = self.previous_transactions(tx)?;
        tx.sign(key, &prev_txs)?;
        Ok(())
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, BlockchainError> {
        if tx.is_coinbase() {
            return Ok(true);
        }

        let prev_txs = self.previous_transactions(tx)?;
        Ok(tx.verify(&prev_txs)?)
    }

    /// Scans the whole chain for outputs no later input spends
    pub fn find_utxo(&self) -> Result<HashMap<Vec<u8>, UnspentOutputs>, BlockchainError> {
        let mut unspent: HashMap<Vec<u8>, UnspentOutputs> = HashMap::new();
        let mut spent: HashSet<(Vec<u8>, i32)> = HashSet::new();

        for block in self.iter() {
            let block = block?;

            // Inputs first: a transaction may spend an earlier one in the same block
            for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
                for input in &tx.inputs {
                    spent.insert((input.prev_tx_id.clone(), input.output_index));
                }
            }

            for tx in &block.transactions {
                let mut outputs = UnspentOutputs::from_transaction(tx);
                outputs
                    .outputs
                    .retain(|unspent| !spent.contains(&(tx.id.clone(), unspent.index)));

                if !outputs.is_empty() {
                    unspent.insert(tx.id.clone(), outputs);
                }
            }
        }

        Ok(unspent)
    }

    /// Human readable dump of every block from tip to genesis
    pub fn print_chain(&self) -> Result<String, BlockchainError> {
        let mut out = String::new();
        for block in self.iter() {
            let block = block?;
            // writing into a String cannot fail
            let _ = writeln!(out, "{}", block);
        }
        Ok(out)
    }
}

/// Single-pass iterator from a fixed tip back to genesis
pub struct ChainIterator<'a> {
    storage: &'a BlockchainStorage,
    current_hash: Option<Vec<u8>>,
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block, BlockchainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.current_hash.take()?;

        match self.storage.get_block(&hash) {
            Ok(block) => {
                if !block.is_genesis() {
                    self.current_hash = Some(block.prev_hash.clone());
                }
                Some(Ok(block))
            }
            Err(StorageError::NotFound(_)) => {
                Some(Err(BlockchainError::BlockNotFound(hex::encode(&hash))))
            }
            Err(e) => Some(Err(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::REWARD;
    use std::path::PathBuf;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("utxo-chain-{}", uuid::Uuid::new_v4()))
    }

    fn new_chain(miner: &KeyPair) -> Blockchain {
        Blockchain::init_with(BlockchainStorage::temporary().unwrap(), &miner.address()).unwrap()
    }

    fn coinbase(miner: &KeyPair) -> Transaction {
        Transaction::new_coinbase(&miner.address(), "").unwrap()
    }

    #[test]
    fn test_genesis_invariant() {
        let miner = KeyPair::new();
        let chain = new_chain(&miner);

        assert_eq!(chain.get_best_height(), 0);

        let genesis = chain.get_block(&chain.get_tip_hash()).unwrap().unwrap();
        assert!(genesis.prev_hash.is_empty());
        assert_eq!(genesis.transactions.len(), 1);
        assert!(genesis.transactions[0].is_coinbase());
        assert_eq!(genesis.transactions[0].inputs[0].signature, GENESIS_DATA.as_bytes());
        assert_eq!(genesis.transactions[0].outputs[0].value, REWARD);
        assert!(genesis.validate());
    }

    #[test]
    fn test_init_twice_fails() {
        let dir = temp_dir();
        let miner = KeyPair::new();

        let chain = Blockchain::init(&dir, &miner.address()).unwrap();
        let tip = chain.get_tip_hash();
        drop(chain);

        assert!(matches!(
            Blockchain::init(&dir, &miner.address()),
            Err(BlockchainError::AlreadyExists(_))
        ));

        let reopened = Blockchain::continue_existing(&dir).unwrap();
        assert_eq!(reopened.get_tip_hash(), tip);
        assert_eq!(reopened.get_best_height(), 0);
        drop(reopened);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_continue_without_chain_fails() {
        let dir = temp_dir();
        assert!(matches!(
            Blockchain::continue_existing(&dir),
            Err(BlockchainError::NotInitialized(_))
        ));
        assert!(!dir.exists());

        assert!(matches!(
            Blockchain::continue_with(BlockchainStorage::temporary().unwrap()),
            Err(BlockchainError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_mine_block_extends_tip() {
        let miner = KeyPair::new();
        let chain = new_chain(&miner);
        let genesis_hash = chain.get_tip_hash();

        let block = chain.mine_block(vec![coinbase(&miner)]).unwrap();

        assert_eq!(block.height, 1);
        assert_eq!(block.prev_hash, genesis_hash);
        assert_eq!(chain.get_best_height(), 1);
        assert_eq!(chain.get_tip_hash(), block.hash);
        assert_eq!(chain.storage().get_last_hash().unwrap(), block.hash);
    }

    #[test]
    fn test_mine_block_rejects_invalid_transaction() {
        let miner = KeyPair::new();
        let chain = new_chain(&miner);
        let genesis = chain.get_block(&chain.get_tip_hash()).unwrap().unwrap();
        let funding = &genesis.transactions[0];

        let thief = KeyPair::new();
        let mut tx = Transaction {
            id: Vec::new(),
            inputs: vec![crate::blockchain::transaction::TxInput {
                prev_tx_id: funding.id.clone(),
                output_index: 0,
                signature: Vec::new(),
                public_key: thief.public_key().to_vec(),
            }],
            outputs: vec![crate::blockchain::transaction::TxOutput::new(REWARD, &thief.address()).unwrap()],
        };
        chain.sign_transaction(&mut tx, &thief).unwrap();

        assert!(!chain.verify_transaction(&tx).unwrap());
        assert!(matches!(
            chain.mine_block(vec![tx]),
            Err(BlockchainError::InvalidTransaction(_))
        ));
        assert_eq!(chain.get_best_height(), 0);
    }

    #[test]
    fn test_fork_choice_prefers_height() {
        let miner = KeyPair::new();

        for higher_first in [false, true] {
            let chain = new_chain(&miner);
            let tip = chain.get_tip_hash();

            let lower = Block::create(vec![coinbase(&miner)], tip.clone(), 1).unwrap();
            let higher = Block::create(vec![coinbase(&miner)], tip.clone(), 2).unwrap();

            if higher_first {
                chain.add_block(&higher).unwrap();
                chain.add_block(&lower).unwrap();
            } else {
                chain.add_block(&lower).unwrap();
                chain.add_block(&higher).unwrap();
            }

            assert_eq!(chain.get_tip_hash(), higher.hash);
            assert_eq!(chain.get_best_height(), 2);
            assert!(chain.get_block(&lower.hash).unwrap().is_some());
        }
    }

    #[test]
    fn test_equal_height_keeps_tip() {
        let miner = KeyPair::new();
        let chain = new_chain(&miner);
        let tip = chain.get_tip_hash();

        let first = Block::create(vec![coinbase(&miner)], tip.clone(), 1).unwrap();
        let second = Block::create(vec![coinbase(&miner)], tip, 1).unwrap();

        chain.add_block(&first).unwrap();
        chain.add_block(&second).unwrap();

        assert_eq!(chain.get_tip_hash(), first.hash);
    }

    #[test]
    fn test_add_block_is_idempotent() {
        let miner = KeyPair::new();
        let chain = new_chain(&miner);
        let block = Block::create(vec![coinbase(&miner)], chain.get_tip_hash(), 1).unwrap();

        chain.add_block(&block).unwrap();
        chain.add_block(&block).unwrap();

        assert_eq!(chain.get_best_height(), 1);
        assert_eq!(chain.get_block_hashes().unwrap().len(), 2);
    }

    #[test]
    fn test_add_block_rejects_bad_proof() {
        let miner = KeyPair::new();
        let chain = new_chain(&miner);
        let mut block = Block::create(vec![coinbase(&miner)], chain.get_tip_hash(), 1).unwrap();
        block.nonce += 1;

        assert!(matches!(
            chain.add_block(&block),
            Err(BlockchainError::InvalidProofOfWork(_))
        ));
        assert!(chain.get_block(&block.hash).unwrap().is_none());
        assert_eq!(chain.get_best_height(), 0);
    }

    #[test]
    fn test_add_block_rejects_orphan() {
        let miner = KeyPair::new();
        let chain = new_chain(&miner);
        let orphan = Block::create(vec![coinbase(&miner)], vec![0xAB; 32], 5).unwrap();

        assert!(matches!(
            chain.add_block(&orphan),
            Err(BlockchainError::IntegrityError(_))
        ));
        assert!(chain.get_block(&orphan.hash).unwrap().is_none());
        assert_eq!(chain.get_best_height(), 0);
        assert_eq!(chain.get_block_hashes().unwrap().len(), 1);
    }

    #[test]
    fn test_iteration_ends_at_genesis() {
        let miner = KeyPair::new();
        let chain = new_chain(&miner);
        let first = chain.mine_block(vec![coinbase(&miner)]).unwrap();
        let second = chain.mine_block(vec![coinbase(&miner)]).unwrap();

        let blocks: Vec<Block> = chain.iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], second);
        assert_eq!(blocks[1], first);
        assert!(blocks[2].is_genesis());
        assert!(blocks.iter().all(Block::validate));

        let mut iter = chain.iter();
        assert_eq!(iter.by_ref().count(), 3);
        assert!(iter.next().is_none());

        let hashes = chain.get_block_hashes().unwrap();
        assert_eq!(hashes, blocks.iter().map(|b| b.hash.clone()).collect::<Vec<_>>());
    }

    #[test]
    fn test_find_transaction() {
        let miner = KeyPair::new();
        let chain = new_chain(&miner);
        let tx = coinbase(&miner);
        chain.mine_block(vec![tx.clone()]).unwrap();

        assert_eq!(chain.find_transaction(&tx.id).unwrap(), tx);
        assert!(matches!(
            chain.find_transaction(&[9u8; 32]),
            Err(BlockchainError::TransactionNotFound(_))
        ));
    }

    #[test]
    fn test_find_utxo_excludes_spent_outputs() {
        let alice = KeyPair::new();
        let bob = KeyPair::new();
        let chain = new_chain(&alice);
        let genesis = chain.get_block(&chain.get_tip_hash()).unwrap().unwrap();
        let funding = genesis.transactions[0].clone();

        let mut tx = Transaction {
            id: Vec::new(),
            inputs: vec![crate::blockchain::transaction::TxInput {
                prev_tx_id: funding.id.clone(),
                output_index: 0,
                signature: Vec::new(),
                public_key: alice.public_key().to_vec(),
            }],
            outputs: vec![
                crate::blockchain::transaction::TxOutput::new(3, &bob.address()).unwrap(),
                crate::blockchain::transaction::TxOutput::new(7, &alice.address()).unwrap(),
            ],
        };
        chain.sign_transaction(&mut tx, &alice).unwrap();
        chain.mine_block(vec![tx.clone()]).unwrap();

        let unspent = chain.find_utxo().unwrap();
        assert!(!unspent.contains_key(&funding.id));
        assert_eq!(unspent[&tx.id].outputs.len(), 2);
        assert_eq!(unspent[&tx.id].total_value(), REWARD);
    }

    #[test]
    fn test_print_chain() {
        let miner = KeyPair::new();
        let chain = new_chain(&miner);
        let block = chain.mine_block(vec![coinbase(&miner)]).unwrap();

        let printed = chain.print_chain().unwrap();
        assert!(printed.contains(&hex::encode(&block.hash)));
        assert!(printed.contains("Height: 0"));
        assert!(printed.contains("PoW: true"));
    }
}
