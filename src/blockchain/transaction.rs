use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::chain::BlockchainError;
use super::crypto::{hash_pub_key, sha256, verify_digest, Address, CryptoError, KeyPair};
use super::utxo::UtxoSet;

/// Value of the output created by every coinbase transaction
pub const REWARD: i64 = 10;

/// Length of the random memo generated for coinbase transactions without one
const COINBASE_MEMO_BYTES: usize = 24;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Previous transaction {0} is missing")]
    MissingPreviousTransaction(String),

    #[error("Transaction {tx_id} has no output {index}")]
    InvalidOutputReference { tx_id: String, index: i32 },

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Reference to an output of an earlier transaction, with the proof of ownership
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Id of the transaction holding the spent output (empty for coinbase)
    pub prev_tx_id: Vec<u8>,

    /// Index of the spent output (-1 for coinbase)
    pub output_index: i32,

    /// `r || s`, or the memo for a coinbase input
    pub signature: Vec<u8>,

    /// `x || y` of the spender's key
    pub public_key: Vec<u8>,
}

impl TxInput {
    /// Returns true if this input was created by the owner of `pub_key_hash`
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(&self.public_key) == pub_key_hash
    }
}

/// Value locked to a public key hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: i64,
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    /// Creates an output of `value` locked to `address`
    pub fn new(value: i64, address: &Address) -> Result<Self, TransactionError> {
        if value <= 0 {
            return Err(TransactionError::InvalidAmount(value));
        }

        Ok(TxOutput {
            value,
            pub_key_hash: address.pub_key_hash()?,
        })
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// A UTXO-model transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content hash, excluded from its own computation
    pub id: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Creates a coinbase transaction paying [`REWARD`] to `to`.
    ///
    /// An empty memo is replaced by random bytes so that coinbases paying the
    /// same address still get distinct ids.
    pub fn new_coinbase(to: &Address, memo: &str) -> Result<Self, TransactionError> {
        let memo = if memo.is_empty() {
            let mut random = [0u8; COINBASE_MEMO_BYTES];
            rand::thread_rng().fill_bytes(&mut random);
            hex::encode(random)
        } else {
            memo.to_string()
        };

        let input = TxInput {
            prev_tx_id: Vec::new(),
            output_index: -1,
            signature: memo.into_bytes(),
            public_key: Vec::new(),
        };

        let mut tx = Transaction {
            id: Vec::new(),
            inputs: vec![input],
            outputs: vec![TxOutput::new(REWARD, to)?],
        };
        tx.id = tx.hash()?;

        Ok(tx)
    }

    /// Builds and signs a transfer of `amount` from `from` to `to`, spending
    /// outputs selected from the UTXO index.
    pub fn new_transfer(
        from: &KeyPair,
        to: &Address,
        amount: i64,
        utxo: &UtxoSet,
    ) -> Result<Self, BlockchainError> {
        if amount <= 0 {
            return Err(TransactionError::InvalidAmount(amount).into());
        }

        let (accumulated, spendable) = utxo.find_spendable(&from.pub_key_hash(), amount)?;
        if accumulated < amount {
            return Err(TransactionError::InsufficientFunds {
                required: amount,
                available: accumulated,
            }
            .into());
        }

        let inputs = spendable
            .into_iter()
            .flat_map(|(tx_id, indices)| {
                indices.into_iter().map(move |output_index| TxInput {
                    prev_tx_id: tx_id.clone(),
                    output_index,
                    signature: Vec::new(),
                    public_key: from.public_key().to_vec(),
                })
            })
            .collect();

        let mut outputs = vec![TxOutput::new(amount, to)?];
        if accumulated > amount {
            outputs.push(TxOutput::new(accumulated - amount, &from.address())?);
        }

        let mut tx = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        };
        utxo.chain().sign_transaction(&mut tx, from)?;

        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prev_tx_id.is_empty()
            && self.inputs[0].output_index == -1
    }

    pub fn serialize(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::serialize(self).map_err(|e| TransactionError::SerializationError(e.to_string()))
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, TransactionError> {
        bincode::deserialize(data).map_err(|e| TransactionError::SerializationError(e.to_string()))
    }

    /// SHA-256 of the serialized transaction with its id cleared
    pub fn hash(&self) -> Result<Vec<u8>, TransactionError> {
        let mut copy = self.clone();
        copy.id = Vec::new();
        Ok(sha256(&copy.serialize()?).to_vec())
    }

    /// Copy with every input's signature and public key cleared
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                prev_tx_id: input.prev_tx_id.clone(),
                output_index: input.output_index,
                signature: Vec::new(),
                public_key: Vec::new(),
            })
            .collect();

        Transaction {
            id: self.id.clone(),
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Signs every input with `key` and refreshes the id over the signed form.
    ///
    /// `prev_txs` must hold every transaction referenced by an input.
    pub fn sign(
        &mut self,
        key: &KeyPair,
        prev_txs: &HashMap<Vec<u8>, Transaction>,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        for input in &self.inputs {
            referenced_output(prev_txs, input)?;
        }

        let mut trimmed = self.trimmed_copy();
        for index in 0..self.inputs.len() {
            let digest = signing_digest(&mut trimmed, index, prev_txs)?;
            self.inputs[index].signature = key.sign_digest(&digest)?;
        }

        self.id = self.hash()?;
        Ok(())
    }

    /// Checks every input's signature and ownership against the outputs it
    /// spends, and that outputs do not exceed inputs. An output referenced
    /// twice makes the transaction invalid. Stops at the first failing input.
    pub fn verify(&self, prev_txs: &HashMap<Vec<u8>, Transaction>) -> Result<bool, TransactionError> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let mut outpoints: HashSet<(&[u8], i32)> = HashSet::with_capacity(self.inputs.len());
        let mut input_total: i64 = 0;
        for input in &self.inputs {
            if !outpoints.insert((input.prev_tx_id.as_slice(), input.output_index)) {
                return Ok(false);
            }
            input_total = input_total.saturating_add(referenced_output(prev_txs, input)?.value);
        }

        let output_total = self.outputs.iter().map(|out| out.value).fold(0i64, i64::saturating_add);
        if self.outputs.iter().any(|out| out.value <= 0) || output_total > input_total {
            return Ok(false);
        }

        let mut trimmed = self.trimmed_copy();
        for (index, input) in self.inputs.iter().enumerate() {
            let spent = referenced_output(prev_txs, input)?;
            if !input.uses_key(&spent.pub_key_hash) {
                return Ok(false);
            }

            let digest = signing_digest(&mut trimmed, index, prev_txs)?;
            if !verify_digest(&digest, &input.signature, &input.public_key) {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", hex::encode(&self.id))?;
        for (index, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", index)?;
            writeln!(f, "       TXID:      {}", hex::encode(&input.prev_tx_id))?;
            writeln!(f, "       Out:       {}", input.output_index)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.public_key))?;
        }
        for (index, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", index)?;
            writeln!(f, "       Value:  {}", output.value)?;
            writeln!(f, "       Script: {}", hex::encode(&output.pub_key_hash))?;
        }
        Ok(())
    }
}

/// Finds the output an input spends
fn referenced_output<'a>(
    prev_txs: &'a HashMap<Vec<u8>, Transaction>,
    input: &TxInput,
) -> Result<&'a TxOutput, TransactionError> {
    let prev_tx = prev_txs
        .get(&input.prev_tx_id)
        .ok_or_else(|| TransactionError::MissingPreviousTransaction(hex::encode(&input.prev_tx_id)))?;

    usize::try_from(input.output_index)
        .ok()
        .and_then(|index| prev_tx.outputs.get(index))
        .ok_or_else(|| TransactionError::InvalidOutputReference {
            tx_id: hex::encode(&input.prev_tx_id),
            index: input.output_index,
        })
}

/// Digest signed for input `index`: the trimmed copy's hash with that input's
/// public key slot holding the spent output's key hash.
fn signing_digest(
    trimmed: &mut Transaction,
    index: usize,
    prev_txs: &HashMap<Vec<u8>, Transaction>,
) -> Result<Vec<u8>, TransactionError> {
    let spent = referenced_output(prev_txs, &trimmed.inputs[index])?;
    trimmed.inputs[index].public_key = spent.pub_key_hash.clone();
    let digest = trimmed.hash();
    trimmed.inputs[index].public_key = Vec::new();
    digest
}
