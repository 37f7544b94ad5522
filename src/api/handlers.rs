use actix_web::{web, HttpResponse, Responder};
use log::warn;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::blockchain::account::{Account, Address, Amount};
use crate::blockchain::ledger::{LedgerError, ReceiveOutcome};
use crate::blockchain::{Block, BlockHash, Transaction};
use crate::network::message::GossipMessage;
use crate::network::node::{Node, NodeError};

/// Shared node state
pub type NodeData = web::Data<Node>;

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the canonical chain, genesis included
    pub length: usize,

    /// Hash of the canonical tip
    pub tip: String,

    /// The blocks from genesis to tip
    pub chain: Vec<Block>,
}

/// Response for the tip endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TipResponse {
    /// Hash of the canonical tip
    pub hash: String,

    /// Height of the tip above genesis
    pub height: u64,

    /// Every known block, losing branches included
    pub block_count: usize,
}

/// Response for the receive blocks endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ReceiveResponse {
    /// Blocks newly added to the tree
    pub accepted: usize,

    /// Blocks that were already known
    pub duplicates: usize,

    /// Reasons for every refused block
    pub rejected: Vec<String>,

    /// Canonical tip after processing
    pub tip: String,

    /// Whether the canonical tip moved
    pub tip_changed: bool,
}

/// Request for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineRequest {
    /// The address credited with the block reward
    pub miner_address: String,

    /// Transfers to include after the reward
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// Response for the mine endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct MineResponse {
    /// The message
    pub message: String,

    /// The newly mined block
    pub block: Block,
}

/// Response for the account endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct AccountResponse {
    /// The address of the account
    pub address: String,

    /// The balance in base units at the canonical tip
    pub balance: Amount,

    /// The nonce of the account
    pub nonce: u64,
}

impl From<Account> for AccountResponse {
    fn from(account: Account) -> Self {
        AccountResponse {
            address: account.address.0,
            balance: account.balance,
            nonce: account.nonce,
        }
    }
}

fn error_body(message: String) -> serde_json::Value {
    serde_json::json!({ "error": message })
}

/// Get the canonical chain
///
/// Returns every block from genesis to the canonical tip
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Canonical chain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(node: NodeData) -> impl Responder {
    let chain = node.ledger().export_canonical_chain();
    let tip = chain.last().map(|block| block.hash.to_hex()).unwrap_or_default();

    HttpResponse::Ok().json(ChainResponse {
        length: chain.len(),
        tip,
        chain,
    })
}

/// Get the canonical tip
#[utoipa::path(
    get,
    path = "/api/v1/tip",
    responses(
        (status = 200, description = "Canonical tip retrieved successfully", body = TipResponse)
    )
)]
pub async fn get_tip(node: NodeData) -> impl Responder {
    let ledger = node.ledger();
    HttpResponse::Ok().json(TipResponse {
        hash: ledger.canonical_tip().to_hex(),
        height: ledger.height(),
        block_count: ledger.block_count(),
    })
}

/// Get a block by hash
///
/// Looks up any block in the tree, canonical or not
#[utoipa::path(
    get,
    path = "/api/v1/blocks/{hash}",
    params(
        ("hash" = String, Path, description = "Block hash as 64 hex characters")
    ),
    responses(
        (status = 200, description = "Block retrieved successfully", body = Block),
        (status = 400, description = "Malformed hash"),
        (status = 404, description = "Unknown block")
    )
)]
pub async fn get_block(node: NodeData, hash: web::Path<String>) -> impl Responder {
    let hash: BlockHash = match hash.parse() {
        Ok(hash) => hash,
        Err(err) => {
            return HttpResponse::BadRequest().json(error_body(format!("Invalid hash: {}", err)));
        }
    };

    match node.ledger().block(&hash) {
        Some(block) => HttpResponse::Ok().json(block),
        None => HttpResponse::NotFound().json(error_body(format!("Block {} not found", hash))),
    }
}

/// Submit blocks from a peer
///
/// Accepts a single block or a chain snapshot in any order. Invalid blocks
/// are reported, not treated as a failed request.
#[utoipa::path(
    post,
    path = "/api/v1/blocks",
    request_body = GossipMessage,
    responses(
        (status = 200, description = "Blocks processed", body = ReceiveResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn receive_blocks(node: NodeData, message: web::Json<GossipMessage>) -> impl Responder {
    match node.on_block_received(message.into_inner()).await {
        Ok(outcomes) => {
            let mut response = ReceiveResponse {
                accepted: 0,
                duplicates: 0,
                rejected: Vec::new(),
                tip: node.ledger().canonical_tip().to_hex(),
                tip_changed: false,
            };
            for outcome in outcomes {
                match outcome {
                    ReceiveOutcome::Accepted { tip_changed, .. } => {
                        response.accepted += 1;
                        response.tip_changed |= tip_changed;
                    }
                    ReceiveOutcome::Duplicate(_) => response.duplicates += 1,
                    ReceiveOutcome::Rejected(rejection) => response.rejected.push(rejection.to_string()),
                }
            }
            HttpResponse::Ok().json(response)
        }
        Err(err) => {
            warn!("Failed to process submitted blocks: {}", err);
            HttpResponse::InternalServerError().json(error_body(format!("Failed to process blocks: {}", err)))
        }
    }
}

/// Mine a new block
///
/// Mines the given transactions on top of the canonical tip, crediting the
/// miner with the block reward
#[utoipa::path(
    post,
    path = "/api/v1/mine",
    request_body = MineRequest,
    responses(
        (status = 200, description = "Block mined successfully", body = MineResponse),
        (status = 400, description = "Transactions do not apply to the canonical state"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn mine_block(node: NodeData, mine_req: web::Json<MineRequest>) -> impl Responder {
    let MineRequest {
        miner_address,
        transactions,
    } = mine_req.into_inner();

    match node.mine_block(Address::new(miner_address), transactions).await {
        Ok(block) => HttpResponse::Ok().json(MineResponse {
            message: "New Block Mined".to_string(),
            block,
        }),
        Err(NodeError::Ledger(LedgerError::InvalidTransactions(err))) => {
            HttpResponse::BadRequest().json(error_body(format!("Invalid transactions: {}", err)))
        }
        Err(err) => {
            warn!("Mining request failed: {}", err);
            HttpResponse::InternalServerError().json(error_body(format!("Failed to mine block: {}", err)))
        }
    }
}

/// Get all accounts
///
/// Returns every account in the canonical state
#[utoipa::path(
    get,
    path = "/api/v1/accounts",
    responses(
        (status = 200, description = "Accounts retrieved successfully", body = Vec<AccountResponse>)
    )
)]
pub async fn get_all_accounts(node: NodeData) -> impl Responder {
    let accounts: Vec<AccountResponse> = node
        .ledger()
        .canonical_state()
        .iter()
        .cloned()
        .map(AccountResponse::from)
        .collect();
    HttpResponse::Ok().json(accounts)
}

/// Get an account
///
/// Unknown addresses report a zero balance
#[utoipa::path(
    get,
    path = "/api/v1/accounts/{address}",
    params(
        ("address" = String, Path, description = "Account address")
    ),
    responses(
        (status = 200, description = "Account retrieved successfully", body = AccountResponse)
    )
)]
pub async fn get_account(node: NodeData, address: web::Path<String>) -> impl Responder {
    let account = node.ledger().account(&Address::new(address.into_inner()));
    HttpResponse::Ok().json(AccountResponse::from(account))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::configure_routes;
    use crate::blockchain::ledger::Ledger;
    use crate::config::ConsensusParams;
    use crate::network::transport::LocalTransport;
    use actix_web::{http::StatusCode, test, App};
    use std::sync::Arc;

    fn node_data() -> NodeData {
        let params = ConsensusParams {
            difficulty: 0,
            ..ConsensusParams::default()
        };
        let ledger = Arc::new(Ledger::new(params).unwrap());
        web::Data::new(Node::new(ledger, LocalTransport::new("api-test")))
    }

    #[actix_web::test]
    async fn test_tip_and_chain() {
        let data = node_data();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;

        let req = test::TestRequest::get().uri("/api/v1/tip").to_request();
        let tip: TipResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(tip.height, 0);
        assert_eq!(tip.block_count, 1);

        let req = test::TestRequest::get().uri("/api/v1/chain").to_request();
        let chain: ChainResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(chain.length, 1);
        assert_eq!(chain.tip, tip.hash);
    }

    #[actix_web::test]
    async fn test_mine_and_query_accounts() {
        let data = node_data();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/mine")
            .set_json(serde_json::json!({
                "miner_address": "alice",
                "transactions": [
                    { "origin": "main", "destination": "bob", "value": 3, "sender_signature": "sig" }
                ]
            }))
            .to_request();
        let mined: MineResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(mined.block.transactions.len(), 2);

        let req = test::TestRequest::get().uri("/api/v1/accounts/alice").to_request();
        let alice: AccountResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(alice.balance, 50);

        let req = test::TestRequest::get().uri("/api/v1/accounts").to_request();
        let accounts: Vec<AccountResponse> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(accounts.len(), 3);

        let uri = format!("/api/v1/blocks/{}", mined.block.hash);
        let req = test::TestRequest::get().uri(&uri).to_request();
        let block: Block = test::call_and_read_body_json(&app, req).await;
        assert_eq!(block, mined.block);
    }

    #[actix_web::test]
    async fn test_mine_rejects_overspend() {
        let app = test::init_service(App::new().app_data(node_data()).configure(configure_routes)).await;

        let req = test::TestRequest::post()
            .uri("/api/v1/mine")
            .set_json(serde_json::json!({
                "miner_address": "alice",
                "transactions": [
                    { "origin": "main", "destination": "bob", "value": 11, "sender_signature": "sig" }
                ]
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_get_block_errors() {
        let app = test::init_service(App::new().app_data(node_data()).configure(configure_routes)).await;

        let req = test::TestRequest::get().uri("/api/v1/blocks/not-hex").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let unknown = format!("/api/v1/blocks/{}", "ab".repeat(32));
        let req = test::TestRequest::get().uri(&unknown).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_receive_blocks_from_peer() {
        let peer = node_data();
        peer.mine_block("carol".into(), Vec::new()).await.unwrap();
        peer.mine_block("carol".into(), Vec::new()).await.unwrap();
        let snapshot = GossipMessage::Chain(peer.ledger().export_canonical_chain());

        let data = node_data();
        let app = test::init_service(App::new().app_data(data.clone()).configure(configure_routes)).await;
        let req = test::TestRequest::post()
            .uri("/api/v1/blocks")
            .set_json(&snapshot)
            .to_request();
        let response: ReceiveResponse = test::call_and_read_body_json(&app, req).await;

        assert_eq!(response.accepted, 2);
        assert_eq!(response.duplicates, 1);
        assert!(response.rejected.is_empty());
        assert!(response.tip_changed);
        assert_eq!(data.ledger().canonical_tip(), peer.ledger().canonical_tip());
    }
}
