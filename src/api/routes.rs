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
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/tip", web::get().to(handlers::get_tip))
            .route("/blocks", web::post().to(handlers::receive_blocks))
            .route("/blocks/{hash}", web::get().to(handlers::get_block))
            .route("/mine", web::post().to(handlers::mine_block))
            .route("/accounts", web::get().to(handlers::get_all_accounts))
            .route("/accounts/{address}", web::get().to(handlers::get_account)),
    );
}
