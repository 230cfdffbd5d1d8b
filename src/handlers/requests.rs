//! Parts Request Handlers
//! /api/request/start（有料プラン → Paysera リダイレクト）と
//! /api/request/free（無料プラン、即時メールのみ）

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::Json;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{error_response, ErrorResponse};
use crate::mailer;
use crate::models::{
    Draft, ItemImage, OkResponse, PartsRequest, PayUrlResponse, Plan, RequestItem,
};
use crate::paysera::{self, PaymentParams};
use crate::AppState;

const FREE_PLAN_LABEL: &str =
    "Nemokama paie\u{161}ka 1\u{2013}2 detali\u{173}";
const AT_LEAST_ONE_ITEM: &str =
    "Bent viena detal\u{117} turi b\u{16b}ti u\u{17e}pildyta.";

// ========================================
// フォーム解析
// ========================================

struct RequestForm {
    request: PartsRequest,
    plan_raw: String,
    return_url: String,
}

/// "items[3][name]" と旧形式 "item_3_name" の両方からインデックスを取り出す
fn item_field_index(field_name: &str, key: &str) -> Option<usize> {
    if let Some(rest) = field_name.strip_prefix("items[") {
        if let Some((idx, tail)) = rest.split_once(']') {
            if tail == format!("[{}]", key) {
                return idx.parse().ok();
            }
        }
    }
    if let Some(rest) = field_name.strip_prefix("item_") {
        if let Some((idx, tail)) = rest.split_once('_') {
            if tail == key {
                return idx.parse().ok();
            }
        }
    }
    None
}

async fn read_request_form(
    mut multipart: Multipart,
    default_count: usize,
) -> Result<RequestForm, (StatusCode, Json<ErrorResponse>)> {
    let mut texts: HashMap<String, String> = HashMap::new();
    let mut images: HashMap<usize, ItemImage> = HashMap::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, format!("Multipart error: {}", e))
    })? {
        let name = field.name().unwrap_or("").to_string();

        if let Some(idx) = item_field_index(&name, "image") {
            let filename = field
                .file_name()
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("detale_{}.jpg", idx + 1));
            let mime = field
                .content_type()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let bytes = field.bytes().await.map_err(|e| {
                error_response(StatusCode::BAD_REQUEST, format!("Image read error: {}", e))
            })?;
            images.insert(
                idx,
                ItemImage {
                    filename,
                    mime,
                    base64: BASE64.encode(&bytes),
                },
            );
        } else {
            let text = field.text().await.map_err(|e| {
                error_response(StatusCode::BAD_REQUEST, format!("Field read error: {}", e))
            })?;
            texts.insert(name, text);
        }
    }

    let text = |key: &str| -> String {
        texts.get(key).map(|s| s.trim().to_string()).unwrap_or_default()
    };
    let item_text = |idx: usize, key: &str| -> String {
        texts
            .get(&format!("items[{}][{}]", idx, key))
            .or_else(|| texts.get(&format!("item_{}_{}", idx, key)))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    let count = text("count").parse::<usize>().unwrap_or(default_count).max(1);

    let mut items = Vec::new();
    for i in 0..count {
        let name = item_text(i, "name");
        let desc = item_text(i, "desc");
        let notes = item_text(i, "notes");
        let image = images.remove(&i);
        // 完全に空の行は飛ばす
        if name.is_empty() && desc.is_empty() && notes.is_empty() && image.is_none() {
            continue;
        }
        items.push(RequestItem {
            idx: i + 1,
            name,
            desc,
            notes,
            image,
        });
    }

    Ok(RequestForm {
        request: PartsRequest {
            vin: text("vin"),
            make: text("make"),
            model: text("model"),
            year: text("year"),
            comment: text("comment"),
            name: text("name"),
            email: text("email"),
            phone: text("phone"),
            items,
        },
        plan_raw: text("plan"),
        return_url: text("return"),
    })
}

/// 支払い後に戻すフロント側URL。外部URLはそのまま、相対パスはサイトに付け、
/// それ以外はプラン別のデフォルトに落とす。
fn normalize_return_url(plan: Plan, raw: &str, site_base_url: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    if raw.starts_with('/') {
        return format!("{}{}", site_base_url, raw);
    }
    let path = match plan {
        Plan::Mini => "/uzklausa-mini",
        Plan::Standart => "/uzklausa-standart",
        Plan::Pro => "/uzklausa-pro",
    };
    format!("{}{}", site_base_url, path)
}

// ========================================
// Handlers
// ========================================

/// POST /api/request/start - 有料プラン受付。Draft を作って Paysera URL を返す。
pub async fn start_request(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<PayUrlResponse>, (StatusCode, Json<ErrorResponse>)> {
    let form = read_request_form(multipart, 5).await?;
    if form.request.items.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            AT_LEAST_ONE_ITEM.to_string(),
        ));
    }

    let plan = Plan::parse(&form.plan_raw);
    let order_id = Uuid::new_v4().to_string();
    let item_count = form.request.items.len();
    let draft = Draft {
        plan,
        request: form.request,
        created_at: Utc::now().timestamp(),
        emailed: false,
    };

    state.drafts.insert(&order_id, draft).await.map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Store error: {}", e),
        )
    })?;

    let cfg = &state.config;
    let return_url = normalize_return_url(plan, &form.return_url, &cfg.site_base_url);
    let signed = paysera::build_request(
        &PaymentParams {
            orderid: order_id.clone(),
            amount_cents: plan.amount_cents(),
            currency: cfg.paysera_currency.clone(),
            accepturl: format!(
                "{}/thanks?ok=1&o={}&return={}",
                cfg.public_api_host,
                urlencoding::encode(&order_id),
                urlencoding::encode(&return_url)
            ),
            cancelurl: format!(
                "{}/thanks?ok=0&o={}&return={}",
                cfg.public_api_host,
                urlencoding::encode(&order_id),
                urlencoding::encode(&return_url)
            ),
            callbackurl: format!("{}/api/paysera/callback", cfg.public_api_host),
            test: cfg.paysera_test,
        },
        &cfg.paysera_project_id,
        &cfg.paysera_sign_password,
    );

    info!(
        "draft created: order_id={} plan={} items={}",
        order_id,
        plan.as_str(),
        item_count
    );

    Ok(Json(PayUrlResponse {
        success: true,
        pay_url: paysera::pay_url(&signed),
    }))
}

/// POST /api/request/free - 無料プラン受付。保存せず即メール送信。
pub async fn free_request(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<OkResponse>, (StatusCode, Json<ErrorResponse>)> {
    let form = read_request_form(multipart, 2).await?;
    if form.request.items.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            AT_LEAST_ONE_ITEM.to_string(),
        ));
    }

    let plan_label = if form.plan_raw.is_empty() {
        FREE_PLAN_LABEL.to_string()
    } else {
        form.plan_raw.clone()
    };

    mailer::dispatch(
        state.notifier.clone(),
        mailer::free_request_admin_mail(&plan_label, &form.request, &state.config),
    );
    if !form.request.email.is_empty() {
        mailer::dispatch(
            state.notifier.clone(),
            mailer::free_request_customer_mail(&plan_label, &form.request, &state.config),
        );
    }

    info!("free request received: name={}", form.request.name);

    Ok(Json(OkResponse { success: true }))
}
