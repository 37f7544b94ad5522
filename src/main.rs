use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::{info, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use std::sync::Arc;

use ghost_ledger::api;
use ghost_ledger::blockchain::{self, storage::BlockStore, Address, Ledger};
use ghost_ledger::config::NodeConfig;
use ghost_ledger::network::{self, LocalTransport, Node};

// Build the ledger, attach storage if configured and replay what was stored
fn initialize_node(config: &NodeConfig) -> anyhow::Result<Arc<Node>> {
    let ledger = Arc::new(Ledger::new(config.consensus.clone())?);
    // No peers are connected in this binary: outbound gossip reaches nobody
    // and blocks only come in through POST /api/v1/blocks
    let transport = LocalTransport::new(&config.node.address);
    let mut node = Node::new(ledger, transport);

    if let Some(data_dir) = &config.node.data_dir {
        std::fs::create_dir_all(data_dir).unwrap_or_else(|e| {
            warn!("Failed to create data directory: {}", e);
        });

        match BlockStore::open(data_dir) {
            Ok(store) => {
                info!("Persisting blocks to {}", data_dir.display());
                node = node.with_store(Arc::new(store));
            }
            Err(err) => {
                warn!("Failed to open block store: {}", err);
                warn!("Running with an in-memory ledger instead");
            }
        }
    }

    let node = Arc::new(node);
    node.restore().context("Failed to replay stored blocks")?;
    Ok(node)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::get_chain,
        api::handlers::get_tip,
        api::handlers::get_block,
        api::handlers::receive_blocks,
        api::handlers::mine_block,
        api::handlers::get_all_accounts,
        api::handlers::get_account
    ),
    components(
        schemas(
            blockchain::Block,
            blockchain::Transaction,
            blockchain::Address,
            blockchain::Account,
            blockchain::transaction::Signature,
            network::GossipMessage,
            api::handlers::ChainResponse,
            api::handlers::TipResponse,
            api::handlers::ReceiveResponse,
            api::handlers::MineRequest,
            api::handlers::MineResponse,
            api::handlers::AccountResponse
        )
    ),
    tags(
        (name = "ledger", description = "Ledger node API endpoints")
    ),
    info(
        title = "GHOST Ledger API",
        version = "0.1.0",
        description = "A proof-of-work ledger node with GHOST fork choice",
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

    let config = NodeConfig::load().context("Failed to load configuration")?;
    let node = initialize_node(&config)?;

    let miner = config
        .node
        .miner_address
        .clone()
        .map(|address| node.spawn_miner(Address::new(address)));

    let data = web::Data::from(Arc::clone(&node));
    let host = config.node.http_host.clone();
    let port = config.node.http_port;

    info!("Starting HTTP server at http://{}:{}", host, port);

    // Start HTTP server
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
            .app_data(data.clone())
            // API routes
            .configure(api::configure_routes)
            // Swagger UI
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", openapi.clone())
            )
    })
    .bind((host.as_str(), port))
    .with_context(|| format!("Failed to bind {}:{}", host, port))?
    .run()
    .await?;

    if let Some(miner) = miner {
        let mined = miner.stop().await?;
        info!("Background miner produced {} blocks", mined);
    }
    Ok(())
}
