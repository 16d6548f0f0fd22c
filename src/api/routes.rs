use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/blockchain", web::post().to(handlers::create_blockchain))
            .route("/balance/{address}", web::get().to(handlers::get_balance))
            .route("/send", web::post().to(handlers::send))
            .route("/wallet/new", web::post().to(handlers::create_wallet))
            .route("/wallet/addresses", web::get().to(handlers::list_addresses))
            .route("/utxo/reindex", web::post().to(handlers::reindex_utxo))
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/node/start", web::post().to(handlers::start_node))
            .route("/node/peers", web::get().to(handlers::get_peers)),
    );
}
