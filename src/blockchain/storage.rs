use std::path::Path;

use log::debug;
use sled::{Batch, Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::utxo::UnspentOutputs;

/// Reserved key in the chain tree pointing at the tip block
pub const LAST_HASH_KEY: &[u8] = b"lastHash";

/// Prefix of every key in the UTXO tree
pub const UTXO_PREFIX: &[u8] = b"utxo-";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),
}

/// One pending change to the UTXO tree: new outputs, or `None` to delete the entry
pub type UnspentChange = (Vec<u8>, Option<UnspentOutputs>);

/// Storage for blockchain data
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Blocks keyed by hash, plus the tip pointer
    chain: Tree,

    /// Unspent outputs keyed by `utxo-` + transaction id
    utxo: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage").finish()
    }
}

fn utxo_key(tx_id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(UTXO_PREFIX.len() + tx_id.len());
    key.extend_from_slice(UTXO_PREFIX);
    key.extend_from_slice(tx_id);
    key
}

impl BlockchainStorage {
    /// Opens (or creates) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Opens a throwaway database that is removed when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let chain = db.open_tree("chain")?;
        let utxo = db.open_tree("utxo")?;

        Ok(Self { db, chain, utxo })
    }

    /// Returns true once a tip has been recorded
    pub fn has_chain(&self) -> Result<bool, StorageError> {
        Ok(self.chain.contains_key(LAST_HASH_KEY)?)
    }

    pub fn contains_block(&self, hash: &[u8]) -> Result<bool, StorageError> {
        Ok(self.chain.contains_key(hash)?)
    }

    /// Writes a block and, if `advance_tip` is set, points the tip at it in
    /// the same atomic batch.
    pub fn append_block(&self, block: &Block, advance_tip: bool) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        batch.insert(block.hash.as_slice(), block.serialize()?);
        if advance_tip {
            batch.insert(LAST_HASH_KEY, block.hash.as_slice());
        }

        self.chain.apply_batch(batch)?;
        self.chain.flush()?;

        debug!("Stored block {} (tip advanced: {})", hex::encode(&block.hash), advance_tip);
        Ok(())
    }

    /// Gets a block by its hash
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        match self.chain.get(hash)? {
            Some(value) => Block::deserialize(&value),
            None => Err(StorageError::NotFound(format!(
                "Block with hash {} not found",
                hex::encode(hash)
            ))),
        }
    }

    /// Gets the hash of the current tip
    pub fn get_last_hash(&self) -> Result<Vec<u8>, StorageError> {
        match self.chain.get(LAST_HASH_KEY)? {
            Some(value) => Ok(value.to_vec()),
            None => Err(StorageError::NotFound("Last hash not found".to_string())),
        }
    }

    /// Gets the unspent outputs recorded for one transaction
    pub fn get_unspent(&self, tx_id: &[u8]) -> Result<Option<UnspentOutputs>, StorageError> {
        self.utxo
            .get(utxo_key(tx_id))?
            .map(|value| UnspentOutputs::deserialize(&value))
            .transpose()
    }

    /// All UTXO entries in key order, i.e. sorted by transaction id
    pub fn unspent_entries(&self) -> Result<Vec<(Vec<u8>, UnspentOutputs)>, StorageError> {
        self.utxo
            .scan_prefix(UTXO_PREFIX)
            .map(|entry| {
                let (key, value) = entry?;
                Ok((key[UTXO_PREFIX.len()..].to_vec(), UnspentOutputs::deserialize(&value)?))
            })
            .collect()
    }

    pub fn count_unspent(&self) -> usize {
        self.utxo.scan_prefix(UTXO_PREFIX).count()
    }

    /// Applies UTXO changes as a single atomic batch. With `clear_first`, every
    /// existing entry is deleted in the same batch.
    pub fn write_unspent(
        &self,
        changes: Vec<UnspentChange>,
        clear_first: bool,
    ) -> Result<(), StorageError> {
        let mut batch = Batch::default();

        if clear_first {
            for key in self.utxo.scan_prefix(UTXO_PREFIX).keys() {
                batch.remove(key?);
            }
        }

        for (tx_id, outputs) in changes {
            match outputs {
                Some(outputs) => batch.insert(utxo_key(&tx_id), outputs.serialize()?),
                None => batch.remove(utxo_key(&tx_id)),
            }
        }

        self.utxo.apply_batch(batch)?;
        self.utxo.flush()?;
        Ok(())
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::KeyPair;
    use crate::blockchain::transaction::Transaction;
    use crate::blockchain::utxo::UnspentOutput;

    fn genesis() -> Block {
        let coinbase = Transaction::new_coinbase(&KeyPair::new().address(), "").unwrap();
        Block::genesis(coinbase).unwrap()
    }

    #[test]
    fn test_append_and_get_block() {
        let storage = BlockchainStorage::temporary().unwrap();
        let block = genesis();

        assert!(!storage.has_chain().unwrap());
        storage.append_block(&block, true).unwrap();

        assert!(storage.has_chain().unwrap());
        assert!(storage.contains_block(&block.hash).unwrap());
        assert_eq!(storage.get_block(&block.hash).unwrap(), block);
        assert_eq!(storage.get_last_hash().unwrap(), block.hash);
    }

    #[test]
    fn test_append_without_tip() {
        let storage = BlockchainStorage::temporary().unwrap();
        let block = genesis();

        storage.append_block(&block, false).unwrap();
        assert!(storage.contains_block(&block.hash).unwrap());
        assert!(matches!(storage.get_last_hash(), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_missing_block() {
        let storage = BlockchainStorage::temporary().unwrap();
        assert!(matches!(storage.get_block(&[0u8; 32]), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_unspent_writes() {
        let storage = BlockchainStorage::temporary().unwrap();
        let output = Transaction::new_coinbase(&KeyPair::new().address(), "")
            .unwrap()
            .outputs[0]
            .clone();
        let entry = UnspentOutputs {
            outputs: vec![UnspentOutput { index: 0, output }],
        };

        storage
            .write_unspent(vec![(vec![2], Some(entry.clone())), (vec![1], Some(entry.clone()))], false)
            .unwrap();
        assert_eq!(storage.count_unspent(), 2);

        let ids: Vec<Vec<u8>> = storage.unspent_entries().unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![vec![1], vec![2]]);
        assert_eq!(storage.get_unspent(&[1]).unwrap(), Some(entry.clone()));

        storage.write_unspent(vec![(vec![1], None)], false).unwrap();
        assert_eq!(storage.get_unspent(&[1]).unwrap(), None);

        storage.write_unspent(vec![(vec![3], Some(entry))], true).unwrap();
        assert_eq!(storage.count_unspent(), 1);
        assert!(storage.get_unspent(&[3]).unwrap().is_some());
    }
}
