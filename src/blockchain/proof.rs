use log::debug;
use thiserror::Error;

use super::block::Block;
use super::crypto::sha256;

/// Number of leading zero bits a block hash must have
pub const DIFFICULTY: u64 = 12;

#[derive(Debug, Error)]
pub enum ProofError {
    #[error("Nonce space exhausted without meeting the target")]
    Exhausted,
}

/// Big-endian 256-bit target equal to `2^(256 - difficulty)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target([u8; 32]);

impl Target {
    pub fn from_difficulty(difficulty: u64) -> Self {
        let mut bytes = [0u8; 32];
        let difficulty = difficulty.clamp(1, 256) as usize;
        // bit index counted from the most significant bit
        let bit = difficulty - 1;
        bytes[bit / 8] = 0x80 >> (bit % 8);
        Target(bytes)
    }

    /// True if `hash`, read as a big-endian integer, is strictly below the target
    pub fn is_met_by(&self, hash: &[u8]) -> bool {
        if hash.len() != self.0.len() {
            return false;
        }
        hash < &self.0[..]
    }
}

/// Proof of work over a block's linkage and transaction content
#[derive(Debug)]
pub struct ProofOfWork<'a> {
    block: &'a Block,
    target: Target,
}

impl<'a> ProofOfWork<'a> {
    pub fn new(block: &'a Block) -> Self {
        ProofOfWork {
            block,
            target: Target::from_difficulty(DIFFICULTY),
        }
    }

    /// `prev_hash || merkle_root || nonce (8 bytes BE) || difficulty (8 bytes BE)`
    fn init_data(&self, merkle_root: &[u8], nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.block.prev_hash.len() + merkle_root.len() + 16);
        data.extend_from_slice(&self.block.prev_hash);
        data.extend_from_slice(merkle_root);
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(&DIFFICULTY.to_be_bytes());
        data
    }

    /// Searches nonces upward from zero and returns the first `(nonce, hash)`
    /// whose hash meets the target.
    pub fn run(&self) -> Result<(u64, Vec<u8>), ProofError> {
        let merkle_root = self.block.hash_transactions();

        for nonce in 0..u64::MAX {
            let hash = sha256(&self.init_data(&merkle_root, nonce));
            if self.target.is_met_by(&hash) {
                debug!("Found nonce {} for block at height {}", nonce, self.block.height);
                return Ok((nonce, hash.to_vec()));
            }
        }

        Err(ProofError::Exhausted)
    }

    /// Recomputes the hash for the stored nonce and checks it against the target
    /// and against the block's recorded hash. Transaction ids must also match
    /// their content, otherwise edited transactions would hide behind stale ids.
    pub fn validate(&self) -> bool {
        let ids_match = self
            .block
            .transactions
            .iter()
            .all(|tx| tx.hash().map(|hash| hash == tx.id).unwrap_or(false));
        if !ids_match {
            return false;
        }

        let merkle_root = self.block.hash_transactions();
        let hash = sha256(&self.init_data(&merkle_root, self.block.nonce));

        self.target.is_met_by(&hash) && hash[..] == self.block.hash[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::KeyPair;
    use crate::blockchain::transaction::Transaction;

    fn coinbase() -> Transaction {
        Transaction::new_coinbase(&KeyPair::new().address(), "").unwrap()
    }

    #[test]
    fn test_target_from_difficulty() {
        let target = Target::from_difficulty(12);
        assert_eq!(target.0[0], 0x00);
        assert_eq!(target.0[1], 0x10);
        assert!(target.0[2..].iter().all(|b| *b == 0));

        assert!(target.is_met_by(&[0x00, 0x0F, 0xFF, 0xFF].repeat(8)));
        assert!(!target.is_met_by(&[0x00, 0x10].iter().copied().chain([0u8; 30]).collect::<Vec<_>>()));
        assert!(!target.is_met_by(&[0u8; 31]));
    }

    #[test]
    fn test_mined_block_validates() {
        let block = Block::create(vec![coinbase()], Vec::new(), 0).unwrap();
        assert!(ProofOfWork::new(&block).validate());
        assert!(Target::from_difficulty(DIFFICULTY).is_met_by(&block.hash));
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let mut block = Block::create(vec![coinbase()], Vec::new(), 0).unwrap();
        block.nonce += 1;
        assert!(!ProofOfWork::new(&block).validate());
    }

    #[test]
    fn test_tampered_transactions_fail() {
        let mut block = Block::create(vec![coinbase()], Vec::new(), 0).unwrap();
        block.transactions[0].outputs[0].value = 1_000;
        assert!(!ProofOfWork::new(&block).validate());

        block.transactions[0].id = block.transactions[0].hash().unwrap();
        assert!(!ProofOfWork::new(&block).validate());

        let mut block = Block::create(vec![coinbase()], Vec::new(), 0).unwrap();
        block.transactions.push(coinbase());
        assert!(!ProofOfWork::new(&block).validate());
    }
}
