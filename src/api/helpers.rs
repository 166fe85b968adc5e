// Shared utilities for the API handlers.

use axum::http::StatusCode;
use axum::Json;

use super::types::ApiError;

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn not_found(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::NOT_FOUND, Json(ApiError::new(message)))
}

pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::BAD_REQUEST, Json(ApiError::new(message)))
}

pub fn internal_error(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError::new(message)),
    )
}

/// 503 until the indexer has produced any data.
pub fn no_data_yet() -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ApiError::new("indexer has no data yet")),
    )
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parse an opaque "height:txid" pagination cursor.
pub fn parse_cursor(cursor: &str) -> Option<(u32, String)> {
    let (height, txid) = cursor.split_once(':')?;
    let height = height.parse::<u32>().ok()?;
    if txid.is_empty() {
        return None;
    }
    Some((height, txid.to_string()))
}

pub fn make_cursor(height: u32, txid: &str) -> String {
    format!("{}:{}", height, txid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrip() {
        let cursor = make_cursor(123, "abcd");
        assert_eq!(parse_cursor(&cursor), Some((123, "abcd".to_string())));
        assert_eq!(parse_cursor("nope"), None);
        assert_eq!(parse_cursor("12:"), None);
        assert_eq!(parse_cursor("x:abcd"), None);
    }
}
