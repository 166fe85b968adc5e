// Address endpoints: summary, cursor-paginated history, unspent outputs.

use axum::extract::{Extension, Path, Query};
use axum::Json;

use super::helpers::{
    bad_request, internal_error, make_cursor, not_found, parse_cursor, ApiResult,
};
use super::types::{AddressResponse, AddressTxQuery, AddressTxResponse, AddressUtxosResponse};
use super::ApiState;

const DEFAULT_PAGE: usize = 25;
const MAX_PAGE: usize = 200;

/// GET /api/v1/addresses/{address}
pub async fn address_summary(
    Path(address): Path<String>,
    Extension(state): Extension<ApiState>,
) -> ApiResult<AddressResponse> {
    let Some(summary) = state
        .store
        .address_summary(&address)
        .map_err(|e| internal_error(e.to_string()))?
    else {
        return Err(not_found(format!("address {} not found", address)));
    };
    Ok(Json(AddressResponse { summary }))
}

/// GET /api/v1/addresses/{address}/transactions?limit=&cursor=
pub async fn address_transactions(
    Path(address): Path<String>,
    Query(query): Query<AddressTxQuery>,
    Extension(state): Extension<ApiState>,
) -> ApiResult<AddressTxResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let before = match &query.cursor {
        Some(cursor) => Some(
            parse_cursor(cursor).ok_or_else(|| bad_request("malformed cursor"))?,
        ),
        None => None,
    };
    let before_ref = before.as_ref().map(|(h, txid)| (*h, txid.as_str()));

    let transactions = state
        .store
        .address_txs_page(&address, before_ref, limit)
        .map_err(|e| internal_error(e.to_string()))?;

    // A full page means there may be more; the cursor points at the last
    // row served.
    let next_cursor = if transactions.len() == limit {
        transactions
            .last()
            .map(|row| make_cursor(row.height, &row.txid))
    } else {
        None
    };

    Ok(Json(AddressTxResponse {
        transactions,
        next_cursor,
    }))
}

/// GET /api/v1/addresses/{address}/utxos
pub async fn address_utxos(
    Path(address): Path<String>,
    Extension(state): Extension<ApiState>,
) -> ApiResult<AddressUtxosResponse> {
    let utxos = state
        .store
        .address_utxos(&address, true)
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(AddressUtxosResponse { utxos }))
}
