// Block endpoints. Confirmed blocks are immutable, so list responses are
// cheap to cache client-side; the handlers read the store directly.

use axum::extract::{Extension, Path, Query};
use axum::Json;

use super::helpers::{bad_request, internal_error, no_data_yet, not_found, ApiResult};
use super::types::{BlockListQuery, BlockListResponse, BlockResponse};
use super::ApiState;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

fn clamp_limit(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// GET /api/v1/blocks/latest
pub async fn latest_blocks(
    Extension(state): Extension<ApiState>,
) -> ApiResult<BlockListResponse> {
    let blocks = state
        .store
        .latest_blocks(DEFAULT_LIMIT, None)
        .map_err(|e| internal_error(e.to_string()))?;
    if blocks.is_empty() {
        return Err(no_data_yet());
    }
    let next_before = blocks.last().map(|b| b.height);
    Ok(Json(BlockListResponse {
        blocks,
        next_before,
    }))
}

/// GET /api/v1/blocks?limit=&before=
pub async fn list_blocks(
    Query(query): Query<BlockListQuery>,
    Extension(state): Extension<ApiState>,
) -> ApiResult<BlockListResponse> {
    let limit = clamp_limit(query.limit);
    let blocks = state
        .store
        .latest_blocks(limit, query.before)
        .map_err(|e| internal_error(e.to_string()))?;
    if blocks.is_empty() && query.before.is_none() {
        return Err(no_data_yet());
    }
    let next_before = blocks.last().map(|b| b.height);
    Ok(Json(BlockListResponse {
        blocks,
        next_before,
    }))
}

/// GET /api/v1/blocks/{heightOrHash}
pub async fn block_by_id(
    Path(param): Path<String>,
    Extension(state): Extension<ApiState>,
) -> ApiResult<BlockResponse> {
    let block = if let Ok(height) = param.parse::<u32>() {
        state
            .store
            .block_by_height(height)
            .map_err(|e| internal_error(e.to_string()))?
    } else if param.len() == 64 && param.chars().all(|c| c.is_ascii_hexdigit()) {
        state
            .store
            .block_by_hash(&param)
            .map_err(|e| internal_error(e.to_string()))?
    } else {
        return Err(bad_request(
            "parameter must be a height or a 64-char block hash",
        ));
    };

    let Some(block) = block else {
        return Err(not_found(format!("block {} not found", param)));
    };
    let txids = state
        .store
        .block_txids(block.height)
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(BlockResponse { block, txids }))
}
