use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use actix_web::{web, HttpResponse, Responder};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::blockchain::transaction::TransactionError;
use crate::blockchain::{Address, Block, Blockchain, BlockchainError, Transaction, UtxoSet, Wallet};
use crate::config::NodeConfig;
use crate::network::message::TxData;
use crate::network::node::send_data;
use crate::network::{Message, Node};

/// Shared state behind every handler
pub struct AppState {
    pub config: NodeConfig,

    /// UTXO index over the opened chain, absent until a chain exists
    pub utxo: RwLock<Option<Arc<UtxoSet>>>,

    /// This node's accounts, saved to the wallet file on change
    pub wallet: Mutex<Wallet>,

    /// The gossip node, once started
    pub node: Mutex<Option<Arc<Node>>>,
}

impl AppState {
    pub fn new(config: NodeConfig, wallet: Wallet, utxo: Option<Arc<UtxoSet>>) -> Self {
        AppState {
            config,
            utxo: RwLock::new(utxo),
            wallet: Mutex::new(wallet),
            node: Mutex::new(None),
        }
    }

    pub fn utxo(&self) -> Option<Arc<UtxoSet>> {
        self.utxo.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn node(&self) -> Option<Arc<Node>> {
        self.node.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

pub type AppData = web::Data<AppState>;

fn error_body(message: impl ToString) -> serde_json::Value {
    serde_json::json!({ "error": message.to_string() })
}

/// Maps a chain error to the HTTP status a client should see
fn blockchain_error(err: &BlockchainError) -> HttpResponse {
    match err {
        BlockchainError::InvalidTransaction(_)
        | BlockchainError::DoubleSpend(_)
        | BlockchainError::CryptoError(_)
        | BlockchainError::TransactionError(TransactionError::InsufficientFunds { .. })
        | BlockchainError::TransactionError(TransactionError::InvalidAmount(_))
        | BlockchainError::TransactionError(TransactionError::CryptoError(_)) => {
            HttpResponse::BadRequest().json(error_body(err))
        }
        BlockchainError::AlreadyExists(_) => HttpResponse::Conflict().json(error_body(err)),
        BlockchainError::NotInitialized(_)
        | BlockchainError::BlockNotFound(_)
        | BlockchainError::TransactionNotFound(_) => HttpResponse::NotFound().json(error_body(err)),
        _ => {
            error!("Request failed: {}", err);
            HttpResponse::InternalServerError().json(error_body(err))
        }
    }
}

fn no_chain() -> HttpResponse {
    HttpResponse::NotFound().json(error_body("No blockchain found, create one first"))
}

fn parse_address(value: &str) -> Result<Address, HttpResponse> {
    Address::from_str(value)
        .map_err(|e| HttpResponse::BadRequest().json(error_body(format!("Invalid address {}: {}", value, e))))
}

/// Runs chain work on the blocking pool and flattens both error layers
async fn run_blocking<F, T>(f: F) -> Result<T, HttpResponse>
where
    F: FnOnce() -> Result<T, BlockchainError> + Send + 'static,
    T: Send + 'static,
{
    match web::block(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(blockchain_error(&err)),
        Err(err) => Err(HttpResponse::InternalServerError().json(error_body(err))),
    }
}

/// Request for the create blockchain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct CreateBlockchainRequest {
    /// Address receiving the genesis reward
    pub address: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct CreateBlockchainResponse {
    pub genesis_hash: String,
    pub height: u64,
}

/// Create a blockchain
///
/// Mines a genesis block paying the given address and builds the UTXO index
#[utoipa::path(
    post,
    path = "/api/v1/blockchain",
    request_body = CreateBlockchainRequest,
    responses(
        (status = 201, description = "Blockchain created", body = CreateBlockchainResponse),
        (status = 400, description = "Invalid address"),
        (status = 409, description = "A blockchain already exists")
    )
)]
pub async fn create_blockchain(state: AppData, req: web::Json<CreateBlockchainRequest>) -> impl Responder {
    let address = match parse_address(&req.address) {
        Ok(address) => address,
        Err(response) => return response,
    };

    if state.utxo().is_some() {
        return HttpResponse::Conflict().json(error_body("Blockchain already exists"));
    }

    let path = state.config.blocks_path();
    let created = run_blocking(move || {
        let chain = Blockchain::init(path, &address)?;
        let utxo = UtxoSet::new(Arc::new(chain));
        utxo.reindex()?;
        Ok(utxo)
    })
    .await;

    let utxo = match created {
        Ok(utxo) => Arc::new(utxo),
        Err(response) => return response,
    };

    let response = CreateBlockchainResponse {
        genesis_hash: hex::encode(utxo.chain().get_tip_hash()),
        height: utxo.chain().get_best_height(),
    };
    *state.utxo.write().unwrap_or_else(PoisonError::into_inner) = Some(utxo);

    info!("Created blockchain with genesis {}", response.genesis_hash);
    HttpResponse::Created().json(response)
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub address: String,
    pub balance: i64,
}

/// Get the balance of an address
///
/// Sums every unspent output locked to the address
#[utoipa::path(
    get,
    path = "/api/v1/balance/{address}",
    params(
        ("address" = String, Path, description = "Base58Check address")
    ),
    responses(
        (status = 200, description = "Balance retrieved", body = BalanceResponse),
        (status = 400, description = "Invalid address"),
        (status = 404, description = "No blockchain")
    )
)]
pub async fn get_balance(state: AppData, address: web::Path<String>) -> impl Responder {
    let address = match parse_address(&address) {
        Ok(address) => address,
        Err(response) => return response,
    };
    let utxo = match state.utxo() {
        Some(utxo) => utxo,
        None => return no_chain(),
    };

    match utxo.balance(&address) {
        Ok(balance) => HttpResponse::Ok().json(BalanceResponse {
            address: address.0,
            balance,
        }),
        Err(err) => blockchain_error(&err),
    }
}

/// Request for the send endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SendRequest {
    /// Sender, which must be an account of this node's wallet
    pub from: String,

    /// Recipient address
    pub to: String,

    pub amount: i64,

    /// Mine the transfer locally instead of relaying it to the bootstrap node
    #[serde(default)]
    pub mine: bool,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct SendResponse {
    pub transaction_id: String,

    /// Hash of the block holding the transfer when mined locally
    pub block_hash: Option<String>,
}

/// Send coins
///
/// Builds and signs a transfer from a wallet account, then either mines it
/// together with a coinbase to the sender or relays it to the bootstrap node
#[utoipa::path(
    post,
    path = "/api/v1/send",
    request_body = SendRequest,
    responses(
        (status = 200, description = "Transfer mined or relayed", body = SendResponse),
        (status = 400, description = "Invalid address, unknown account or insufficient funds"),
        (status = 404, description = "No blockchain"),
        (status = 502, description = "Bootstrap node unreachable")
    )
)]
pub async fn send(state: AppData, req: web::Json<SendRequest>) -> impl Responder {
    let (from, to) = match (parse_address(&req.from), parse_address(&req.to)) {
        (Ok(from), Ok(to)) => (from, to),
        (Err(response), _) | (_, Err(response)) => return response,
    };
    let utxo = match state.utxo() {
        Some(utxo) => utxo,
        None => return no_chain(),
    };
    let key = match state.wallet.lock().unwrap_or_else(PoisonError::into_inner).get(&from) {
        Some(key) => key.clone(),
        None => {
            return HttpResponse::BadRequest()
                .json(error_body(format!("Address {} is not in this wallet", from)))
        }
    };

    let amount = req.amount;
    let mine = req.mine;
    let built = run_blocking(move || {
        let tx = Transaction::new_transfer(&key, &to, amount, &utxo)?;
        if !mine {
            return Ok((tx, None));
        }

        let coinbase = Transaction::new_coinbase(&from, "")?;
        let block: Block = utxo.mine_checked(vec![coinbase, tx.clone()])?;
        Ok((tx, Some(block)))
    })
    .await;

    let (tx, block) = match built {
        Ok(result) => result,
        Err(response) => return response,
    };

    if block.is_none() {
        let bootstrap = state.config.bootstrap_node.clone();
        let relayed = match state.node() {
            Some(node) => node.send_tx(&bootstrap, &tx).await.map_err(|e| e.to_string()),
            None => relay_transaction(&state.config, &tx).await,
        };
        if let Err(e) = relayed {
            warn!("Could not relay transaction to {}: {}", bootstrap, e);
            return HttpResponse::BadGateway().json(error_body(e));
        }
        info!("Relayed transaction {} to {}", hex::encode(&tx.id), bootstrap);
    }

    HttpResponse::Ok().json(SendResponse {
        transaction_id: hex::encode(&tx.id),
        block_hash: block.map(|block| hex::encode(block.hash)),
    })
}

/// Sends a `tx` message to the bootstrap node without a running gossip node
async fn relay_transaction(config: &NodeConfig, tx: &Transaction) -> Result<(), String> {
    let message = Message::Tx(TxData {
        addr_from: config.node_address(),
        transaction: tx.serialize().map_err(|e| e.to_string())?,
    });
    let data = message.encode().map_err(|e| e.to_string())?;
    send_data(&config.bootstrap_node, &data).await.map_err(|e| e.to_string())
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct WalletResponse {
    pub address: String,
}

/// Create a wallet account
///
/// Generates a new P-256 key pair and stores it in this node's wallet file
#[utoipa::path(
    post,
    path = "/api/v1/wallet/new",
    responses(
        (status = 201, description = "Account created", body = WalletResponse),
        (status = 500, description = "Wallet file could not be written")
    )
)]
pub async fn create_wallet(state: AppData) -> impl Responder {
    let mut wallet = state.wallet.lock().unwrap_or_else(PoisonError::into_inner);
    let address = wallet.create_account();

    if let Err(err) = wallet.save(state.config.wallet_path()) {
        error!("Failed to save wallet: {}", err);
        return HttpResponse::InternalServerError().json(error_body(err));
    }

    info!("Created wallet account {}", address);
    HttpResponse::Created().json(WalletResponse { address: address.0 })
}

/// List wallet addresses
#[utoipa::path(
    get,
    path = "/api/v1/wallet/addresses",
    responses(
        (status = 200, description = "Addresses of this node's wallet", body = Vec<String>)
    )
)]
pub async fn list_addresses(state: AppData) -> impl Responder {
    let addresses: Vec<String> = state
        .wallet
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .addresses()
        .into_iter()
        .map(|address| address.0)
        .collect();

    HttpResponse::Ok().json(addresses)
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct ReindexResponse {
    /// Number of transactions with unspent outputs
    pub transactions: usize,
}

/// Rebuild the UTXO index
#[utoipa::path(
    post,
    path = "/api/v1/utxo/reindex",
    responses(
        (status = 200, description = "Index rebuilt", body = ReindexResponse),
        (status = 404, description = "No blockchain")
    )
)]
pub async fn reindex_utxo(state: AppData) -> impl Responder {
    let utxo = match state.utxo() {
        Some(utxo) => utxo,
        None => return no_chain(),
    };

    match run_blocking(move || {
        utxo.reindex()?;
        Ok(utxo.count_entries())
    })
    .await
    {
        Ok(transactions) => HttpResponse::Ok().json(ReindexResponse { transactions }),
        Err(response) => response,
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct InputView {
    pub prev_tx_id: String,
    pub output_index: i32,
    pub signature: String,
    pub public_key: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct OutputView {
    pub value: i64,
    pub pub_key_hash: String,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransactionView {
    pub id: String,
    pub inputs: Vec<InputView>,
    pub outputs: Vec<OutputView>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct BlockView {
    pub hash: String,
    pub prev_hash: String,
    pub height: u64,
    pub timestamp: i64,
    pub nonce: u64,

    /// Whether the proof of work checks out
    pub valid: bool,
    pub transactions: Vec<TransactionView>,
}

impl From<&Transaction> for TransactionView {
    fn from(tx: &Transaction) -> Self {
        TransactionView {
            id: hex::encode(&tx.id),
            inputs: tx
                .inputs
                .iter()
                .map(|input| InputView {
                    prev_tx_id: hex::encode(&input.prev_tx_id),
                    output_index: input.output_index,
                    signature: hex::encode(&input.signature),
                    public_key: hex::encode(&input.public_key),
                })
                .collect(),
            outputs: tx
                .outputs
                .iter()
                .map(|output| OutputView {
                    value: output.value,
                    pub_key_hash: hex::encode(&output.pub_key_hash),
                })
                .collect(),
        }
    }
}

impl From<&Block> for BlockView {
    fn from(block: &Block) -> Self {
        BlockView {
            hash: hex::encode(&block.hash),
            prev_hash: hex::encode(&block.prev_hash),
            height: block.height,
            timestamp: block.timestamp,
            nonce: block.nonce,
            valid: block.validate(),
            transactions: block.transactions.iter().map(TransactionView::from).collect(),
        }
    }
}

#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ChainQuery {
    /// `text` for the plain dump, JSON otherwise
    pub format: Option<String>,
}

/// Print the chain
///
/// Returns every block from the tip back to genesis
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    params(ChainQuery),
    responses(
        (status = 200, description = "Blocks from tip to genesis", body = Vec<BlockView>),
        (status = 404, description = "No blockchain")
    )
)]
pub async fn get_chain(state: AppData, query: web::Query<ChainQuery>) -> impl Responder {
    let utxo = match state.utxo() {
        Some(utxo) => utxo,
        None => return no_chain(),
    };

    if query.format.as_deref() == Some("text") {
        return match utxo.chain().print_chain() {
            Ok(text) => HttpResponse::Ok().content_type("text/plain").body(text),
            Err(err) => blockchain_error(&err),
        };
    }

    let blocks: Result<Vec<BlockView>, BlockchainError> = utxo
        .chain()
        .iter()
        .map(|block| block.map(|block| BlockView::from(&block)))
        .collect();

    match blocks {
        Ok(blocks) => HttpResponse::Ok().json(blocks),
        Err(err) => blockchain_error(&err),
    }
}

/// Request for the start node endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct StartNodeRequest {
    /// Enables mining to this address; falls back to MINER_ADDRESS
    pub miner_address: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct NodeResponse {
    pub address: String,
    pub bootstrap: String,
    pub miner_address: Option<String>,
}

/// Start the gossip node
#[utoipa::path(
    post,
    path = "/api/v1/node/start",
    request_body = StartNodeRequest,
    responses(
        (status = 200, description = "Node started", body = NodeResponse),
        (status = 400, description = "Invalid miner address"),
        (status = 404, description = "No blockchain"),
        (status = 409, description = "Node already running")
    )
)]
pub async fn start_node(state: AppData, req: web::Json<StartNodeRequest>) -> impl Responder {
    let utxo = match state.utxo() {
        Some(utxo) => utxo,
        None => return no_chain(),
    };

    let miner_address = match req.miner_address.as_deref() {
        Some(value) if !value.is_empty() => match parse_address(value) {
            Ok(address) => Some(address),
            Err(response) => return response,
        },
        _ => state.config.miner_address.clone(),
    };

    let node = {
        let mut slot = state.node.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return HttpResponse::Conflict().json(error_body("Node is already running"));
        }
        let node = Arc::new(Node::from_config(&state.config, utxo, miner_address.clone()));
        *slot = Some(Arc::clone(&node));
        node
    };

    match &miner_address {
        Some(address) => info!("Starting node {} mining to {}", node.address(), address),
        None => info!("Starting node {}", node.address()),
    }

    let runner = Arc::clone(&node);
    tokio::spawn(async move {
        if let Err(e) = runner.run().await {
            error!("Gossip node stopped: {}", e);
        }
    });

    HttpResponse::Ok().json(NodeResponse {
        address: node.address().to_string(),
        bootstrap: state.config.bootstrap_node.clone(),
        miner_address: miner_address.map(|address| address.0),
    })
}

/// List known peers of the running gossip node
#[utoipa::path(
    get,
    path = "/api/v1/node/peers",
    responses(
        (status = 200, description = "Known peers", body = Vec<String>),
        (status = 404, description = "Node not started")
    )
)]
pub async fn get_peers(state: AppData) -> impl Responder {
    match state.node() {
        Some(node) => HttpResponse::Ok().json(node.known_peers()),
        None => HttpResponse::NotFound().json(error_body("Node is not running")),
    }
}
