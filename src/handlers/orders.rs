//! Order Handlers
//! 請求書PDFの取得と、請求書メールの再送

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::{error_response, ErrorResponse};
use crate::invoice;
use crate::mailer;
use crate::models::OkResponse;
use crate::paysera::{self, PaymentParams};
use crate::AppState;

/// GET /api/invoice/:order_id - 請求書PDFを返す（再発行は採番済み番号を使う）
pub async fn get_invoice(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<axum::response::Response<Body>, (StatusCode, Json<ErrorResponse>)> {
    let order = state.orders.get(&order_id).await.ok_or_else(|| {
        error_response(StatusCode::NOT_FOUND, "Nerasta".to_string())
    })?;

    let inv = order
        .invoice_no
        .clone()
        .unwrap_or_else(|| invoice::invoice_no(&order_id, order.created_at));

    let pdf = invoice::render_invoice(
        &inv,
        &order.buyer,
        &order.items,
        order.total,
        Utc::now().timestamp(),
    )
    .map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Invoice render error: {}", e),
        )
    })?;

    let response = axum::response::Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/pdf")
        .header("Content-Length", pdf.len())
        .header(
            "Content-Disposition",
            format!("inline; filename=\"{}.pdf\"", inv),
        )
        .body(Body::from(pdf))
        .map_err(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Response build error: {}", e),
            )
        })?;

    Ok(response)
}

/// POST /api/orders/:order_id/resend - 請求書と支払いリンクを顧客へ再送。
/// 状態は変えない（配信だけ）。
pub async fn resend_invoice(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<Json<OkResponse>, (StatusCode, Json<ErrorResponse>)> {
    let order = state.orders.get(&order_id).await.ok_or_else(|| {
        error_response(StatusCode::NOT_FOUND, "Nerasta".to_string())
    })?;

    if order.buyer.email.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "N\u{117}ra kliento el. pa\u{161}to".to_string(),
        ));
    }

    let cfg = &state.config;
    let signed = paysera::build_request(
        &PaymentParams {
            orderid: order_id.clone(),
            amount_cents: (order.total * 100.0).round() as i64,
            currency: cfg.paysera_currency.clone(),
            accepturl: format!(
                "{}/thanks?ok=1&o={}&return={}",
                cfg.public_api_host,
                urlencoding::encode(&order_id),
                urlencoding::encode(&cfg.site_base_url)
            ),
            cancelurl: format!(
                "{}/thanks?ok=0&o={}&return={}",
                cfg.public_api_host,
                urlencoding::encode(&order_id),
                urlencoding::encode(&cfg.site_base_url)
            ),
            callbackurl: format!("{}/api/paysera/callback", cfg.public_api_host),
            test: cfg.paysera_test,
        },
        &cfg.paysera_project_id,
        &cfg.paysera_sign_password,
    );
    let pay_url = paysera::pay_url(&signed);

    let inv = order
        .invoice_no
        .clone()
        .unwrap_or_else(|| invoice::invoice_no(&order_id, order.created_at));
    let pdf = invoice::render_invoice(
        &inv,
        &order.buyer,
        &order.items,
        order.total,
        Utc::now().timestamp(),
    )
    .ok();

    // 再送は明示的な管理操作なので結果を待って返す
    let mail = mailer::order_invoice_customer_mail(&order, &pay_url, &inv, pdf, cfg);
    state.notifier.deliver(mail).await.map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Nepavyko persi\u{173}sti: {}", e),
        )
    })?;

    info!("invoice resent: order_id={} invoice={}", order_id, inv);

    Ok(Json(OkResponse { success: true }))
}
