//! Signed, state-changing requests.
//!
//! Each body names the caller's address and carries their signature over the
//! action message; the engine rebuilds that message from the other fields.

use super::error::ApiError;
use super::u256_decimal;
use crate::server::AppState;
use alloy_primitives::{Address, U256};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::response::Json;
use bookmarket_core::{ActionReceipt, ListingRequest, PurchaseRequest, WithdrawalRequest};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct PurchaseBody {
	pub address: Address,
	#[serde(with = "u256_decimal")]
	pub book_id: U256,
	#[serde(with = "u256_decimal")]
	pub amount: U256,
	/// Unix seconds; part of the signed message.
	pub expires_at: u64,
	pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct ListingBody {
	pub address: Address,
	pub content_id: String,
	#[serde(with = "u256_decimal")]
	pub price: U256,
	#[serde(with = "u256_decimal")]
	pub royalty: U256,
	pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawalBody {
	pub address: Address,
	#[serde(with = "u256_decimal")]
	pub amount: U256,
	pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
	pub file_name: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
	pub content_id: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyBody {
	pub message: String,
	pub signature: String,
	pub address: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
	pub valid: bool,
}

pub async fn purchase(
	State(state): State<AppState>,
	Json(body): Json<PurchaseBody>,
) -> Result<Json<ActionReceipt>, ApiError> {
	let identity = state.identity(body.address);
	let request = PurchaseRequest {
		book_id: body.book_id,
		amount: body.amount,
		expires_at: body.expires_at,
		signature: body.signature,
	};
	let receipt = state
		.engine
		.purchase(&identity, request, state.engine.operator())
		.await?;
	Ok(Json(receipt))
}

pub async fn list_book(
	State(state): State<AppState>,
	Json(body): Json<ListingBody>,
) -> Result<Json<ActionReceipt>, ApiError> {
	let identity = state.identity(body.address);
	let request = ListingRequest {
		content_id: body.content_id,
		price: body.price,
		royalty: body.royalty,
		signature: body.signature,
	};
	let receipt = state
		.engine
		.list_book(&identity, request, state.engine.operator())
		.await?;
	Ok(Json(receipt))
}

pub async fn withdraw_royalties(
	State(state): State<AppState>,
	Json(body): Json<WithdrawalBody>,
) -> Result<Json<ActionReceipt>, ApiError> {
	let identity = state.identity(body.address);
	let request = WithdrawalRequest {
		amount: body.amount,
		signature: body.signature,
	};
	let receipt = state
		.engine
		.withdraw_royalties(&identity, request, state.engine.operator())
		.await?;
	Ok(Json(receipt))
}

pub async fn upload_content(
	State(state): State<AppState>,
	Query(query): Query<UploadQuery>,
	body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
	let content_id = state.engine.upload_content(&query.file_name, body).await?;
	Ok(Json(UploadResponse { content_id }))
}

pub async fn verify_signature(
	State(state): State<AppState>,
	Json(body): Json<VerifyBody>,
) -> Json<VerifyResponse> {
	let valid = state
		.engine
		.verify_signature(&body.message, &body.signature, &body.address);
	Json(VerifyResponse { valid })
}
