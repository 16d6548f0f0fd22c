use chrono::Utc;
use serde::{Deserialize, Serialize};

use std::fmt;

use super::crypto::sha256;
use super::proof::{ProofError, ProofOfWork};
use super::storage::StorageError;
use super::transaction::Transaction;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Unix timestamp (seconds) when the block was mined
    pub timestamp: i64,

    /// Distance from genesis along the chain this block extends
    pub height: u64,

    /// Proof of work nonce
    pub nonce: u64,

    /// Hash of the previous block, empty for genesis
    pub prev_hash: Vec<u8>,

    /// Proof of work hash of this block
    pub hash: Vec<u8>,

    /// Transactions included in this block
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Creates a block on top of `prev_hash` and mines it
    ///
    /// # Arguments
    ///
    /// * `transactions` - The transactions to include in the block
    /// * `prev_hash` - The hash of the previous block
    /// * `height` - The height of the new block
    pub fn create(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        height: u64,
    ) -> Result<Self, ProofError> {
        let mut block = Block {
            timestamp: Utc::now().timestamp(),
            height,
            nonce: 0,
            prev_hash,
            hash: Vec::new(),
            transactions,
        };

        let (nonce, hash) = ProofOfWork::new(&block).run()?;
        block.nonce = nonce;
        block.hash = hash;

        Ok(block)
    }

    /// Mines the genesis block around a single coinbase transaction
    pub fn genesis(coinbase: Transaction) -> Result<Self, ProofError> {
        Self::create(vec![coinbase], Vec::new(), 0)
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Merkle root over the transaction ids.
    ///
    /// Leaves are the ids themselves; parents are `SHA256(left || right)` with
    /// an odd node paired with itself. No transactions hash to all zeros.
    pub fn hash_transactions(&self) -> Vec<u8> {
        if self.transactions.is_empty() {
            return vec![0u8; 32];
        }

        let mut level: Vec<Vec<u8>> = self.transactions.iter().map(|tx| tx.id.clone()).collect();

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).unwrap_or(&pair[0]);
                    let mut combined = Vec::with_capacity(pair[0].len() + right.len());
                    combined.extend_from_slice(&pair[0]);
                    combined.extend_from_slice(right);
                    sha256(&combined).to_vec()
                })
                .collect();
        }

        sha256(&level[0]).to_vec()
    }

    pub fn validate(&self) -> bool {
        ProofOfWork::new(self).validate()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serialize(self).map_err(|e| StorageError::SerializationError(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, StorageError> {
        bincode::deserialize(data).map_err(|e| StorageError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "============ Block {} ============", hex::encode(&self.hash))?;
        writeln!(f, "Height: {}", self.height)?;
        writeln!(f, "Prev. hash: {}", hex::encode(&self.prev_hash))?;
        writeln!(f, "Timestamp: {}", self.timestamp)?;
        writeln!(f, "Nonce: {}", self.nonce)?;
        writeln!(f, "PoW: {}", self.validate())?;
        for tx in &self.transactions {
            write!(f, "{}", tx)?;
        }
        Ok(())
    }
}
