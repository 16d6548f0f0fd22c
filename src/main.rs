use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod api;
mod blockchain;
mod config;
mod network;

use blockchain::{Blockchain, BlockchainError, UtxoSet, Wallet};
use config::NodeConfig;

// Open this node's chain if one was created earlier
fn open_chain(config: &NodeConfig) -> anyhow::Result<Option<Arc<UtxoSet>>> {
    match Blockchain::continue_existing(config.blocks_path()) {
        Ok(chain) => {
            info!(
                "Loaded blockchain at height {} from {}",
                chain.get_best_height(),
                config.blocks_path().display()
            );
            Ok(Some(Arc::new(UtxoSet::new(Arc::new(chain)))))
        }
        Err(BlockchainError::NotInitialized(_)) => {
            info!("No blockchain yet, create one with POST /api/v1/blockchain");
            Ok(None)
        }
        Err(err) => Err(err).context("failed to open blockchain"),
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::create_blockchain,
        api::handlers::get_balance,
        api::handlers::send,
        api::handlers::create_wallet,
        api::handlers::list_addresses,
        api::handlers::reindex_utxo,
        api::handlers::get_chain,
        api::handlers::start_node,
        api::handlers::get_peers
    ),
    components(
        schemas(
            api::handlers::CreateBlockchainRequest,
            api::handlers::CreateBlockchainResponse,
            api::handlers::BalanceResponse,
            api::handlers::SendRequest,
            api::handlers::SendResponse,
            api::handlers::WalletResponse,
            api::handlers::ReindexResponse,
            api::handlers::InputView,
            api::handlers::OutputView,
            api::handlers::TransactionView,
            api::handlers::BlockView,
            api::handlers::StartNodeRequest,
            api::handlers::NodeResponse
        )
    ),
    tags(
        (name = "blockchain", description = "UTXO blockchain node endpoints")
    ),
    info(
        title = "UTXO Chain API",
        version = "0.1.0",
        description = "Proof-of-work UTXO blockchain node",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
struct ApiDoc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::from_env()?;
    let wallet = Wallet::load(config.wallet_path()).context("failed to load wallet file")?;
    if wallet.is_empty() {
        info!("Wallet is empty, create an account with POST /api/v1/wallet/new");
    }
    let utxo = open_chain(&config)?;

    let (host, port) = (config.api_host.clone(), config.api_port);
    let state = web::Data::new(api::AppState::new(config, wallet, utxo));
    let shutdown_state = state.clone();

    info!("Starting HTTP server at http://{}:{}", host, port);

    HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        // Configure OpenAPI documentation
        let openapi = ApiDoc::openapi();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(state.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((host.as_str(), port))?
    .run()
    .await?;

    if let Some(utxo) = shutdown_state.utxo() {
        utxo.chain().storage().flush().context("failed to flush block store")?;
        info!("Flushed block store");
    }

    Ok(())
}
