//! HTTP server for the marketplace API.
//!
//! Routes live under `/api`; `/health` sits at the root for load balancers.

use crate::apis::{actions, queries};
use alloy_primitives::Address;
use axum::{
	extract::{DefaultBodyLimit, State},
	response::Json,
	routing::{get, post},
	Router,
};
use bookmarket_config::ApiConfig;
use bookmarket_core::{Identity, MarketEngine};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

/// Room for multipart framing on top of the largest accepted upload.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	pub engine: Arc<MarketEngine>,
	/// Addresses granted author capabilities.
	pub authors: Arc<HashSet<Address>>,
}

impl AppState {
	pub fn new(engine: Arc<MarketEngine>, authors: impl IntoIterator<Item = Address>) -> Self {
		Self {
			engine,
			authors: Arc::new(authors.into_iter().collect()),
		}
	}

	/// Capabilities come from configuration, never from the request.
	pub fn identity(&self, address: Address) -> Identity {
		if self.authors.contains(&address) {
			Identity::author(address)
		} else {
			Identity::reader(address)
		}
	}
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
	Router::new()
		.route("/health", get(health))
		.nest(
			"/api",
			Router::new()
				.route("/content", post(actions::upload_content))
				.route("/purchases", post(actions::purchase))
				.route("/listings", post(actions::list_book))
				.route("/withdrawals", post(actions::withdraw_royalties))
				.route("/signatures/verify", post(actions::verify_signature))
				.route("/books/{id}", get(queries::book))
				.route("/authors/{address}/books", get(queries::author_books))
				.route("/authors/{address}/royalties", get(queries::royalties))
				.route("/transactions/{hash}", get(queries::transaction))
				.route("/accounts/{address}/transactions", get(queries::history)),
		)
		.layer(
			ServiceBuilder::new()
				.layer(DefaultBodyLimit::max(max_upload_bytes.saturating_add(BODY_LIMIT_SLACK)))
				.layer(CorsLayer::permissive()),
		)
		.with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
	let network = state.engine.network();
	Json(json!({
		"status": "ok",
		"chain_id": network.expected_chain_id,
		"network_id": network.expected_network_id,
		"contract": state.engine.market().address(),
	}))
}

/// Binds `host:port` and serves until the listener fails.
pub async fn start_server(
	api_config: ApiConfig,
	engine: Arc<MarketEngine>,
	max_upload_bytes: usize,
) -> Result<(), Box<dyn std::error::Error>> {
	let state = AppState::new(engine, api_config.authors.iter().copied());
	let app = router(state, max_upload_bytes);

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!(
		address = %bind_address,
		authors = api_config.authors.len(),
		"Marketplace API server starting"
	);

	axum::serve(listener, app).await?;

	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::factory_registry::all_factories;
	use axum::body::{to_bytes, Body};
	use axum::http::{Request, StatusCode};
	use bookmarket_config::Config;
	use bookmarket_contract::testing::{artifact_json, contract_address};
	use bookmarket_core::MarketBuilder;
	use std::io::Write;
	use tower::ServiceExt;

	const AUTHOR: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

	fn config(artifact: &std::path::Path) -> Config {
		format!(
			r#"
[market]
id = "server-test"

[network]
rpc_url = "http://127.0.0.1:7545"
expected_chain_id = 1337
expected_network_id = 5777

[delivery]
primary = "simulated"
[delivery.implementations.simulated]
network_id = 5777
contracts = ["{contract}"]

[account]
primary = "local"
[account.implementations.local]
private_key = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"

[contract]
artifact_path = "{artifact}"

[storage]
primary = "memory"
[storage.implementations.memory]

[content]
max_size_bytes = 1024
allowed_extensions = ["pdf"]
"#,
			contract = contract_address(),
			artifact = artifact.display(),
		)
		.parse()
		.unwrap()
	}

	async fn app() -> (Router, tempfile::NamedTempFile) {
		let mut artifact = tempfile::NamedTempFile::new().unwrap();
		artifact.write_all(artifact_json().as_bytes()).unwrap();
		let engine = MarketBuilder::new(config(artifact.path()))
			.build(all_factories())
			.await
			.unwrap();
		let state = AppState::new(Arc::new(engine), [AUTHOR.parse().unwrap()]);
		(router(state, 1024), artifact)
	}

	async fn json_body(response: axum::response::Response) -> Value {
		let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		serde_json::from_slice(&bytes).unwrap()
	}

	fn post_json(uri: &str, body: Value) -> Request<Body> {
		Request::builder()
			.method("POST")
			.uri(uri)
			.header("content-type", "application/json")
			.body(Body::from(body.to_string()))
			.unwrap()
	}

	#[tokio::test]
	async fn test_health_reports_verified_network() {
		let (app, _artifact) = app().await;
		let response = app
			.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let body = json_body(response).await;
		assert_eq!(body["status"], "ok");
		assert_eq!(body["network_id"], 5777);
	}

	#[tokio::test]
	async fn test_upload_accepts_allowed_file() {
		let (app, _artifact) = app().await;
		let response = app
			.oneshot(
				Request::builder()
					.method("POST")
					.uri("/api/content?file_name=novel.pdf")
					.body(Body::from("%PDF-1.7 chapter one"))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let body = json_body(response).await;
		assert!(body["content_id"].as_str().unwrap().starts_with("0x"));
	}

	#[tokio::test]
	async fn test_upload_rejects_extension() {
		let (app, _artifact) = app().await;
		let response = app
			.oneshot(
				Request::builder()
					.method("POST")
					.uri("/api/content?file_name=novel.exe")
					.body(Body::from("MZ"))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
		assert_eq!(json_body(response).await["error"], "INVALID_CONTENT");
	}

	#[tokio::test]
	async fn test_purchase_with_bad_signature_is_unauthorized() {
		let (app, _artifact) = app().await;
		let response = app
			.oneshot(post_json(
				"/api/purchases",
				json!({
					"address": "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
					"book_id": "1",
					"amount": "100",
					"expires_at": bookmarket_types::current_timestamp() + 300,
					"signature": format!("0x{}", hex::encode([7u8; 65])),
				}),
			))
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
		assert_eq!(json_body(response).await["error"], "UNAUTHORIZED");
	}

	#[tokio::test]
	async fn test_purchase_for_account_other_than_operator_is_refused() {
		use bookmarket_account::{implementations::local::LocalAccount, AccountService};
		use bookmarket_core::ActionMessage;

		let buyer = AccountService::new(Box::new(
			LocalAccount::new(&bookmarket_types::SecretString::from(
				"0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
			))
			.unwrap(),
		));
		let expires_at = bookmarket_types::current_timestamp() + 300;
		let message = ActionMessage::purchase(
			alloy_primitives::U256::from(1u64),
			alloy_primitives::U256::from(100u64),
			expires_at,
		);
		let signature = buyer.sign_message(message.as_str().as_bytes()).await.unwrap();

		let (app, _artifact) = app().await;
		let response = app
			.oneshot(post_json(
				"/api/purchases",
				json!({
					"address": buyer.address().await.unwrap(),
					"book_id": "1",
					"amount": "100",
					"expires_at": expires_at,
					"signature": format!("0x{}", hex::encode(signature)),
				}),
			))
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn test_verify_signature_endpoint() {
		let (app, _artifact) = app().await;
		let response = app
			.oneshot(post_json(
				"/api/signatures/verify",
				json!({ "message": "hello", "signature": "0x00", "address": AUTHOR }),
			))
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(json_body(response).await["valid"], false);
	}

	#[tokio::test]
	async fn test_malformed_path_address() {
		let (app, _artifact) = app().await;
		let response = app
			.oneshot(
				Request::builder()
					.uri("/api/accounts/not-an-address/transactions")
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::BAD_REQUEST);
	}

	#[tokio::test]
	async fn test_history_starts_empty() {
		let (app, _artifact) = app().await;
		let response = app
			.oneshot(
				Request::builder()
					.uri(format!("/api/accounts/{}/transactions", AUTHOR))
					.body(Body::empty())
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		assert_eq!(json_body(response).await, json!([]));
	}
}
