//! API Handlers
//! エンドポイント実装とハンドラ共通ヘルパー

pub mod offers;
pub mod orders;
pub mod payments;
pub mod requests;

use axum::http::StatusCode;
use axum::response::Json;
use serde::Serialize;
use tracing::warn;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

pub fn error_response(status: StatusCode, message: String) -> (StatusCode, Json<ErrorResponse>) {
    warn!("API Error: {}", message);
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: message,
        }),
    )
}

/// application/x-www-form-urlencoded ボディを (key, value) に分解する。
/// チェックボックスの重複キー（choose=0&choose=2）をそのまま受けるため、
/// マップではなくペアのリストで返す。
pub fn parse_form_pairs(body: &str) -> Vec<(String, String)> {
    body.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_form_component(k), decode_form_component(v))
        })
        .collect()
}

fn decode_form_component(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    urlencoding::decode(&plus_decoded)
        .map(|c| c.into_owned())
        .unwrap_or(plus_decoded)
}
