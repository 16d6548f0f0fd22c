// Blockchain module
//
// This module contains the core blockchain implementation including:
// - Block structure and proof of work
// - Transactions and the UTXO index
// - The persistent chain store
// - Keys, addresses and the wallet file

pub mod block;
pub mod chain;
pub mod crypto;
pub mod proof;
pub mod storage;
pub mod transaction;
pub mod utxo;
pub mod wallet;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, BlockchainError};
pub use crypto::{Address, KeyPair};
pub use transaction::Transaction;
pub use utxo::UtxoSet;
pub use wallet::Wallet;
