use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::message::{
    BlockData, GetBlocks, GetData, Inv, InvKind, Message, MessageError, TxData, Version,
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use crate::blockchain::storage::StorageError;
use crate::blockchain::transaction::TransactionError;
use crate::blockchain::{Address, Block, BlockchainError, Transaction, UtxoSet};
use crate::config::NodeConfig;

/// How long to wait for a peer to accept a connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Message error: {0}")]
    MessageError(#[from] MessageError),

    #[error("Blockchain error: {0}")]
    BlockchainError(#[from] BlockchainError),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Background task failed: {0}")]
    TaskError(String),

    #[error("Message exceeds {0} bytes")]
    MessageTooLarge(usize),
}

/// Opens a connection to `addr` and writes `data` as one message
pub async fn send_data(addr: &str, data: &[u8]) -> io::Result<()> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connecting to {} timed out", addr)))??;

    stream.write_all(data).await?;
    stream.shutdown().await?;
    Ok(())
}

/// State shared by every gossip handler of one node
#[derive(Debug)]
pub struct Node {
    address: String,
    bootstrap: String,
    miner_address: Option<Address>,
    mine_threshold: usize,
    utxo: Arc<UtxoSet>,
    known_peers: Mutex<Vec<String>>,
    mempool: DashMap<Vec<u8>, Transaction>,
    blocks_in_transit: Mutex<VecDeque<Vec<u8>>>,
    mining: AtomicBool,
}

impl Node {
    /// Creates a node listening on `address` that knows only `bootstrap`
    pub fn new(address: String, bootstrap: String, utxo: Arc<UtxoSet>) -> Self {
        Node {
            address,
            known_peers: Mutex::new(vec![bootstrap.clone()]),
            bootstrap,
            miner_address: None,
            mine_threshold: 2,
            utxo,
            mempool: DashMap::new(),
            blocks_in_transit: Mutex::new(VecDeque::new()),
            mining: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &NodeConfig, utxo: Arc<UtxoSet>, miner_address: Option<Address>) -> Self {
        Self::new(config.node_address(), config.bootstrap_node.clone(), utxo)
            .with_miner(miner_address, config.mine_threshold)
    }

    /// Enables mining to `miner_address` once the mempool holds `threshold` transactions
    pub fn with_miner(mut self, miner_address: Option<Address>, threshold: usize) -> Self {
        self.miner_address = miner_address;
        self.mine_threshold = threshold.max(1);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_bootstrap(&self) -> bool {
        self.address == self.bootstrap
    }

    pub fn known_peers(&self) -> Vec<String> {
        self.known_peers.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn add_peer(&self, addr: &str) {
        if addr.is_empty() || addr == self.address {
            return;
        }
        let mut peers = self.known_peers.lock().unwrap_or_else(PoisonError::into_inner);
        if !peers.iter().any(|peer| peer == addr) {
            peers.push(addr.to_string());
            info!("Added peer {}, {} known", addr, peers.len());
        }
    }

    fn remove_peer(&self, addr: &str) {
        self.known_peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|peer| peer != addr);
    }

    pub fn mempool_len(&self) -> usize {
        self.mempool.len()
    }

    pub fn in_mempool(&self, id: &[u8]) -> bool {
        self.mempool.contains_key(id)
    }

    /// Binds the gossip listener, greets the bootstrap node and serves forever
    pub async fn run(self: Arc<Self>) -> Result<(), NodeError> {
        let listener = TcpListener::bind(&self.address).await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener`, one message per connection
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), NodeError> {
        info!("Gossip node listening on {}", self.address);

        if !self.is_bootstrap() {
            let bootstrap = self.bootstrap.clone();
            self.send_version(&bootstrap).await?;
        }

        loop {
            let (stream, peer) = listener.accept().await?;
            let node = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = node.handle_connection(stream).await {
                    warn!("Dropped message from {}: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), NodeError> {
        let mut data = Vec::new();
        stream
            .take(MAX_MESSAGE_SIZE as u64 + 1)
            .read_to_end(&mut data)
            .await?;
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(NodeError::MessageTooLarge(MAX_MESSAGE_SIZE));
        }

        let message = Message::decode(&data)?;
        self.handle_message(message).await
    }

    /// Applies one gossip message to this node
    pub async fn handle_message(self: &Arc<Self>, message: Message) -> Result<(), NodeError> {
        debug!("Received <{}> command", message.command());

        match message {
            Message::Version(payload) => self.handle_version(payload).await,
            Message::GetBlocks(payload) => self.handle_get_blocks(payload).await,
            Message::Inv(payload) => self.handle_inv(payload).await,
            Message::GetData(payload) => self.handle_get_data(payload).await,
            Message::Block(payload) => self.handle_block(payload).await,
            Message::Tx(payload) => self.handle_tx(payload).await,
            Message::Addr(payload) => {
                for addr in &payload.addr_list {
                    self.add_peer(addr);
                }
                self.request_blocks().await
            }
        }
    }

    async fn handle_version(&self, payload: Version) -> Result<(), NodeError> {
        let best_height = self.utxo.chain().get_best_height();

        if best_height < payload.best_height {
            self.send_get_blocks(&payload.addr_from).await?;
        } else if best_height > payload.best_height {
            self.send_version(&payload.addr_from).await?;
        }

        self.add_peer(&payload.addr_from);
        Ok(())
    }

    async fn handle_get_blocks(&self, payload: GetBlocks) -> Result<(), NodeError> {
        let hashes = self.utxo.chain().get_block_hashes()?;
        self.send_inv(&payload.addr_from, InvKind::Block, hashes).await
    }

    async fn handle_inv(&self, payload: Inv) -> Result<(), NodeError> {
        info!("Received inventory with {} {:?} items", payload.items.len(), payload.kind);

        match payload.kind {
            InvKind::Block => {
                // Inventories list tip first; fetch from genesis upward, skipping known blocks
                let chain = self.utxo.chain();
                let mut wanted = VecDeque::new();
                for hash in payload.items.into_iter().rev() {
                    if !chain.storage().contains_block(&hash)? {
                        wanted.push_back(hash);
                    }
                }

                let next = {
                    let mut transit = self.blocks_in_transit.lock().unwrap_or_else(PoisonError::into_inner);
                    *transit = wanted;
                    transit.pop_front()
                };

                if let Some(hash) = next {
                    self.send_get_data(&payload.addr_from, InvKind::Block, hash).await?;
                }
            }
            InvKind::Tx => {
                for id in payload.items {
                    if !self.in_mempool(&id) {
                        self.send_get_data(&payload.addr_from, InvKind::Tx, id).await?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn handle_get_data(&self, payload: GetData) -> Result<(), NodeError> {
        match payload.kind {
            InvKind::Block => match self.utxo.chain().get_block(&payload.id)? {
                Some(block) => self.send_block(&payload.addr_from, &block).await?,
                None => debug!("Requested block {} is unknown", hex::encode(&payload.id)),
            },
            InvKind::Tx => {
                let tx = self.mempool.get(&payload.id).map(|entry| entry.value().clone());
                match tx {
                    Some(tx) => self.send_tx(&payload.addr_from, &tx).await?,
                    None => debug!("Requested transaction {} is not pooled", hex::encode(&payload.id)),
                }
            }
        }

        Ok(())
    }

    async fn handle_block(&self, payload: BlockData) -> Result<(), NodeError> {
        let block = Block::deserialize(&payload.block)?;
        info!("Received block {} at height {}", hex::encode(&block.hash), block.height);

        self.utxo.chain().add_block(&block)?;

        let next = self
            .blocks_in_transit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match next {
            Some(hash) => self.send_get_data(&payload.addr_from, InvKind::Block, hash).await?,
            None => {
                let utxo = Arc::clone(&self.utxo);
                tokio::task::spawn_blocking(move || utxo.reindex())
                    .await
                    .map_err(|e| NodeError::TaskError(e.to_string()))??;
            }
        }

        Ok(())
    }

    async fn handle_tx(self: &Arc<Self>, payload: TxData) -> Result<(), NodeError> {
        let tx = Transaction::deserialize(&payload.transaction)?;
        let id = tx.id.clone();
        self.mempool.insert(id.clone(), tx);
        info!("Pooled transaction {}, mempool holds {}", hex::encode(&id), self.mempool_len());

        if self.is_bootstrap() {
            for peer in self.known_peers() {
                if peer != self.address && peer != payload.addr_from {
                    self.send_inv(&peer, InvKind::Tx, vec![id.clone()]).await?;
                }
            }
        } else if self.miner_address.is_some() && self.mempool_len() >= self.mine_threshold {
            self.mine_transactions().await?;
        }

        Ok(())
    }

    /// Mines pooled transactions into blocks until fewer than the threshold remain.
    /// Only one mining loop runs at a time.
    pub async fn mine_transactions(self: &Arc<Self>) -> Result<(), NodeError> {
        let miner = match &self.miner_address {
            Some(address) => address.clone(),
            None => return Ok(()),
        };

        if self.mining.swap(true, Ordering::SeqCst) {
            debug!("Mining already in progress");
            return Ok(());
        }

        let result = self.mining_loop(miner).await;
        self.mining.store(false, Ordering::SeqCst);
        result
    }

    async fn mining_loop(self: &Arc<Self>, miner: Address) -> Result<(), NodeError> {
        loop {
            let node = Arc::clone(self);
            let reward_address = miner.clone();
            let mined = tokio::task::spawn_blocking(move || node.mine_pending(&reward_address))
                .await
                .map_err(|e| NodeError::TaskError(e.to_string()))??;

            let block = match mined {
                Some(block) => block,
                None => break,
            };

            for peer in self.known_peers() {
                if peer != self.address {
                    self.send_inv(&peer, InvKind::Block, vec![block.hash.clone()]).await?;
                }
            }

            if self.mempool_len() < self.mine_threshold {
                break;
            }
        }

        Ok(())
    }

    /// Verifies the mempool, drops what cannot be mined and mines the rest
    /// with a coinbase to `miner`.
    fn mine_pending(&self, miner: &Address) -> Result<Option<Block>, BlockchainError> {
        let chain = self.utxo.chain();

        let mut candidates: Vec<Transaction> =
            self.mempool.iter().map(|entry| entry.value().clone()).collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));

        let mut accepted: Vec<Transaction> = Vec::with_capacity(candidates.len() + 1);
        for tx in candidates {
            let valid = match chain.verify_transaction(&tx) {
                Ok(valid) => valid,
                Err(e) => {
                    warn!("Cannot verify transaction {}: {}", hex::encode(&tx.id), e);
                    false
                }
            };
            if !valid {
                warn!("Dropping invalid transaction {}", hex::encode(&tx.id));
                self.mempool.remove(&tx.id);
                continue;
            }

            accepted.push(tx);
            if let Err(e) = self.utxo.ensure_unspent(&accepted) {
                if let Some(tx) = accepted.pop() {
                    warn!("Dropping transaction {}: {}", hex::encode(&tx.id), e);
                    self.mempool.remove(&tx.id);
                }
            }
        }

        if accepted.is_empty() {
            info!("All pooled transactions are invalid");
            return Ok(None);
        }

        let mined_ids: Vec<Vec<u8>> = accepted.iter().map(|tx| tx.id.clone()).collect();
        accepted.push(Transaction::new_coinbase(miner, "")?);

        let block = self.utxo.mine_checked(accepted)?;

        for id in &mined_ids {
            self.mempool.remove(id);
        }

        info!(
            "Mined block {} with {} pooled transactions",
            hex::encode(&block.hash),
            mined_ids.len()
        );
        Ok(Some(block))
    }

    async fn request_blocks(&self) -> Result<(), NodeError> {
        for peer in self.known_peers() {
            self.send_get_blocks(&peer).await?;
        }
        Ok(())
    }

    /// Sends one message; an unreachable peer is forgotten
    async fn send(&self, addr: &str, message: Message) -> Result<(), NodeError> {
        let data = message.encode()?;

        if let Err(e) = send_data(addr, &data).await {
            warn!(
                "Failed to send <{}> to {} ({}), removing it from known peers",
                message.command(),
                addr,
                e
            );
            self.remove_peer(addr);
        }

        Ok(())
    }

    pub async fn send_version(&self, addr: &str) -> Result<(), NodeError> {
        let message = Message::Version(Version {
            version: PROTOCOL_VERSION,
            best_height: self.utxo.chain().get_best_height(),
            addr_from: self.address.clone(),
        });
        self.send(addr, message).await
    }

    async fn send_get_blocks(&self, addr: &str) -> Result<(), NodeError> {
        let message = Message::GetBlocks(GetBlocks {
            addr_from: self.address.clone(),
        });
        self.send(addr, message).await
    }

    async fn send_inv(&self, addr: &str, kind: InvKind, items: Vec<Vec<u8>>) -> Result<(), NodeError> {
        let message = Message::Inv(Inv {
            addr_from: self.address.clone(),
            kind,
            items,
        });
        self.send(addr, message).await
    }

    async fn send_get_data(&self, addr: &str, kind: InvKind, id: Vec<u8>) -> Result<(), NodeError> {
        let message = Message::GetData(GetData {
            addr_from: self.address.clone(),
            kind,
            id,
        });
        self.send(addr, message).await
    }

    async fn send_block(&self, addr: &str, block: &Block) -> Result<(), NodeError> {
        let message = Message::Block(BlockData {
            addr_from: self.address.clone(),
            block: block.serialize()?,
        });
        self.send(addr, message).await
    }

    pub async fn send_tx(&self, addr: &str, tx: &Transaction) -> Result<(), NodeError> {
        let message = Message::Tx(TxData {
            addr_from: self.address.clone(),
            transaction: tx.serialize()?,
        });
        self.send(addr, message).await
    }
}
