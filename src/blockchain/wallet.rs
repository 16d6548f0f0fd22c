use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{Address, CryptoError, KeyPair, StoredKey};

/// Errors that can occur while managing the wallet file
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Stored key does not belong to address {0}")]
    AddressMismatch(String),
}

/// On-disk layout, keyed by address so the file is deterministic
#[derive(Debug, Default, Serialize, Deserialize)]
struct WalletFile {
    accounts: BTreeMap<String, StoredKey>,
}

/// A set of key pairs owned by one node, keyed by address
#[derive(Debug, Default)]
pub struct Wallet {
    accounts: HashMap<Address, KeyPair>,
}

impl Wallet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the wallet file at `path`. A missing file yields an empty wallet.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No wallet file at {}, starting empty", path.display());
            return Ok(Self::new());
        }

        let data = fs::read(path)?;
        let file: WalletFile =
            bincode::deserialize(&data).map_err(|e| WalletError::SerializationError(e.to_string()))?;

        let mut accounts = HashMap::with_capacity(file.accounts.len());
        for (address, stored) in file.accounts {
            let pair = KeyPair::from_stored(&stored)?;
            if pair.address().0 != address {
                return Err(WalletError::AddressMismatch(address));
            }
            accounts.insert(pair.address(), pair);
        }

        info!("Loaded {} wallet accounts from {}", accounts.len(), path.display());
        Ok(Wallet { accounts })
    }

    /// Writes every account to `path`, creating parent directories as needed
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WalletError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = WalletFile {
            accounts: self
                .accounts
                .iter()
                .map(|(address, pair)| (address.0.clone(), pair.to_stored()))
                .collect(),
        };
        let data = bincode::serialize(&file).map_err(|e| WalletError::SerializationError(e.to_string()))?;
        fs::write(path, data)?;

        debug!("Saved {} wallet accounts to {}", self.accounts.len(), path.display());
        Ok(())
    }

    /// Generates a new key pair and returns its address
    pub fn create_account(&mut self) -> Address {
        let pair = KeyPair::new();
        let address = pair.address();
        self.accounts.insert(address.clone(), pair);
        address
    }

    /// All addresses, sorted
    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self.accounts.keys().cloned().collect();
        addresses.sort_by(|a, b| a.0.cmp(&b.0));
        addresses
    }

    pub fn get(&self, address: &Address) -> Option<&KeyPair> {
        self.accounts.get(address)
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
