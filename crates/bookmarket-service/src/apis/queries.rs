//! Read-only views over the contract and the ledger.

use super::error::ApiError;
use super::{parse_address, parse_hash, u256_decimal};
use crate::server::AppState;
use alloy_primitives::U256;
use axum::extract::{Path, State};
use axum::response::Json;
use bookmarket_contract::BookListing;
use bookmarket_core::TransactionView;
use bookmarket_types::TransactionRecord;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RoyaltiesResponse {
	#[serde(with = "u256_decimal")]
	pub amount: U256,
}

pub async fn book(
	State(state): State<AppState>,
	Path(id): Path<String>,
) -> Result<Json<BookListing>, ApiError> {
	let book_id = U256::from_str_radix(id.trim(), 10)
		.map_err(|_| ApiError::bad_request(format!("'{}' is not a book id", id)))?;
	Ok(Json(state.engine.book(book_id).await?))
}

pub async fn author_books(
	State(state): State<AppState>,
	Path(address): Path<String>,
) -> Result<Json<Vec<BookListing>>, ApiError> {
	let author = parse_address(&address)?;
	Ok(Json(state.engine.author_books(author).await?))
}

pub async fn royalties(
	State(state): State<AppState>,
	Path(address): Path<String>,
) -> Result<Json<RoyaltiesResponse>, ApiError> {
	let author = parse_address(&address)?;
	let amount = state.engine.royalties(author).await?;
	Ok(Json(RoyaltiesResponse { amount }))
}

pub async fn transaction(
	State(state): State<AppState>,
	Path(hash): Path<String>,
) -> Result<Json<TransactionView>, ApiError> {
	let hash = parse_hash(&hash)?;
	Ok(Json(state.engine.transaction_status(hash).await?))
}

pub async fn history(
	State(state): State<AppState>,
	Path(address): Path<String>,
) -> Result<Json<Vec<TransactionRecord>>, ApiError> {
	let address = parse_address(&address)?;
	Ok(Json(state.engine.history(address).await?))
}
