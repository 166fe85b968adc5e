// Transaction endpoints.

use axum::extract::{Extension, Path};
use axum::Json;

use super::helpers::{bad_request, internal_error, not_found, ApiResult};
use super::types::{TransactionResponse, TxBatchRequest, TxBatchResponse};
use super::ApiState;

const MAX_BATCH: usize = 100;

/// GET /api/v1/transactions/{txid}
pub async fn tx_by_id(
    Path(txid): Path<String>,
    Extension(state): Extension<ApiState>,
) -> ApiResult<TransactionResponse> {
    if txid.len() != 64 || !txid.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(bad_request("txid must be 64 hex characters"));
    }

    let Some(tx) = state
        .store
        .transaction(&txid)
        .map_err(|e| internal_error(e.to_string()))?
    else {
        return Err(not_found(format!("transaction {} not found", txid)));
    };

    let node_tx = if tx.is_node_tx {
        state
            .store
            .fluxnode_tx(&txid)
            .map_err(|e| internal_error(e.to_string()))?
    } else {
        None
    };
    let participants = state
        .store
        .participants(&txid)
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(TransactionResponse {
        tx,
        node_tx,
        participants,
    }))
}

/// POST /api/v1/transactions/batch
pub async fn tx_batch(
    Extension(state): Extension<ApiState>,
    Json(request): Json<TxBatchRequest>,
) -> ApiResult<TxBatchResponse> {
    if request.txids.is_empty() {
        return Err(bad_request("txids must not be empty"));
    }
    if request.txids.len() > MAX_BATCH {
        return Err(bad_request(format!(
            "at most {} txids per batch",
            MAX_BATCH
        )));
    }

    let mut transactions = Vec::with_capacity(request.txids.len());
    let mut missing = Vec::new();
    for txid in &request.txids {
        match state
            .store
            .transaction(txid)
            .map_err(|e| internal_error(e.to_string()))?
        {
            Some(tx) => transactions.push(tx),
            None => missing.push(txid.clone()),
        }
    }

    Ok(Json(TxBatchResponse {
        transactions,
        not_found: missing,
    }))
}
