//! Payment Handlers
//! Paysera サーバー間コールバックと、ブラウザが戻ってくる /thanks 画面

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::Form;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::engine::FinalizeTrigger;
use crate::mailer::escape_html;
use crate::paysera;
use crate::AppState;

// ========================================
// POST /api/paysera/callback
// ========================================

#[derive(Debug, Deserialize)]
pub struct CallbackForm {
    pub data: Option<String>,
    pub sign: Option<String>,
}

/// ゲートウェイからの支払い確認。署名が合わない限りペイロードは読まない。
/// ローカルにレコードが無くても "OK" を返す（ゲートウェイ側のリトライ嵐を
/// 避けるため、確認応答は常に成功にする）。
pub async fn paysera_callback(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CallbackForm>,
) -> Result<&'static str, (StatusCode, &'static str)> {
    let (Some(data), Some(sign)) = (form.data, form.sign) else {
        return Err((StatusCode::BAD_REQUEST, "ERROR"));
    };

    if !paysera::verify_callback(&data, &sign, &state.config.paysera_sign_password) {
        warn!("paysera callback: sign mismatch");
        return Err((StatusCode::BAD_REQUEST, "ERROR"));
    }

    let payload = match paysera::decode_payload(&data) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("paysera callback: undecodable payload: {}", e);
            return Err((StatusCode::BAD_REQUEST, "ERROR"));
        }
    };

    let order_id = payload.get("orderid").cloned().unwrap_or_default();
    let paid = payload.get("status").map(String::as_str) == Some("1");

    if paid && !order_id.is_empty() {
        // 見つからなくてもエラーにしない（重複・期限切れコールバックは正常系）
        match state.engine.finalize(&order_id, FinalizeTrigger::Callback).await {
            Ok(done) => info!("callback processed: order_id={} finalized={}", order_id, done),
            Err(e) => error!("callback finalize failed: order_id={} err={}", order_id, e),
        }
    } else {
        info!(
            "callback status!=1: order_id={} status={:?}",
            order_id,
            payload.get("status")
        );
    }

    Ok("OK")
}

// ========================================
// GET /thanks
// ========================================

#[derive(Debug, Deserialize)]
pub struct ThanksQuery {
    pub ok: Option<String>,
    pub o: Option<String>,
    #[serde(rename = "return")]
    pub return_url: Option<String>,
}

/// 支払い後のリダイレクト先。ok=1 は信頼しない。表示を変えるのと、
/// 同じ冪等 finalize を楽観的に先行発火させるだけ。正式な確定は
/// 署名付きコールバック経路が保証する。
pub async fn thanks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ThanksQuery>,
) -> Html<String> {
    let ok = query.ok.as_deref() == Some("1");
    let order_id = query.o.unwrap_or_default();

    if ok && !order_id.is_empty() {
        let engine = state.engine.clone();
        let id = order_id.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.finalize(&id, FinalizeTrigger::Return).await {
                error!("return finalize failed: order_id={} err={}", id, e);
            }
        });
    }

    // 戻り先はフロントの絶対URLだけ受け付ける。それ以外はサイトトップ。
    let back_url = query
        .return_url
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .unwrap_or_else(|| state.config.site_base_url.clone());

    Html(thanks_page(ok, &back_url))
}

fn thanks_page(ok: bool, site_home: &str) -> String {
    let (class, title, detail) = if ok {
        (
            "ok",
            "A\u{10d}i\u{16b}! J\u{16b}s\u{173} u\u{17e}klausa s\u{117}kmingai apmok\u{117}ta ir i\u{161}si\u{173}sta.",
            "Laukite detali\u{173} pasi\u{16b}lymo artimiausiu metu.",
        )
    } else {
        (
            "fail",
            "Mok\u{117}jimas ne\u{12f}vyko.",
            "Galite pabandyti dar kart\u{105} arba susisiekti su mumis.",
        )
    };
    format!(
        concat!(
            "<!doctype html>\n<meta charset=\"utf-8\">\n",
            "<title>{title}</title>\n",
            "<style>\n",
            "body{{font-family:system-ui,sans-serif;margin:0;display:grid;place-items:center;height:100dvh}}\n",
            ".card{{max-width:640px;padding:28px;border:1px solid #e5e7eb;border-radius:16px;text-align:center}}\n",
            ".ok{{color:#16a34a;font-size:26px;font-weight:800}}\n",
            ".fail{{color:#ef4444;font-size:26px;font-weight:800}}\n",
            "a.btn{{display:inline-block;margin-top:16px;padding:12px 18px;border-radius:12px;",
            "background:#436BAA;color:#fff;text-decoration:none;font-weight:600}}\n",
            "</style>\n",
            "<div class=\"card\">\n",
            "  <div class=\"{class}\">{title}</div>\n",
            "  <p>{detail}</p>\n",
            "  <a class=\"btn\" href=\"{home}\">Eiti \u{12f} prad\u{17e}i\u{105}</a>\n",
            "</div>"
        ),
        class = class,
        title = title,
        detail = detail,
        home = escape_html(site_home),
    )
}
