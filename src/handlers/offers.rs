//! Offer Handlers
//! 価格提案の作成（社内ツール用）、顧客向け表示、提案からの注文作成。
//! リンクは7日で失効し、表示と注文は同じ期限判定を共有する。

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, Json};
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::{error_response, parse_form_pairs, ErrorResponse};
use crate::invoice;
use crate::mailer::{self, escape_html};
use crate::models::{
    parse_price, Buyer, CreateOfferRequest, Offer, OfferItem, OfferLinkResponse, Order, OrderItem,
    OrderStatus,
};
use crate::paysera::{self, PaymentParams};
use crate::AppState;

// ========================================
// POST /api/offers
// ========================================

/// オファーを保存して共有リンクを返す
pub async fn create_offer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOfferRequest>,
) -> Result<Json<OfferLinkResponse>, (StatusCode, Json<ErrorResponse>)> {
    let offer = Offer {
        items: req.items,
        created_at: Utc::now().timestamp(),
    };

    let mut id = generate_offer_id();
    while state.offers.contains(&id).await {
        id = generate_offer_id();
    }

    state.offers.insert(&id, offer).await.map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Store error: {}", e),
        )
    })?;

    info!("offer created: offer_id={}", id);

    Ok(Json(OfferLinkResponse {
        success: true,
        link: format!("{}/offer/{}", state.config.public_api_host, id),
    }))
}

fn generate_offer_id() -> String {
    let random_bytes: [u8; 5] = rand::thread_rng().gen();
    let encoded = base32::encode(base32::Alphabet::Crockford, &random_bytes);
    format!("OFF{}", &encoded[..6])
}

// ========================================
// GET /offer/:id
// ========================================

/// 顧客向けオファーページ。期限切れは 410 の別ページ（復活しない）。
pub async fn view_offer(
    State(state): State<Arc<AppState>>,
    Path(offer_id): Path<String>,
) -> Result<Html<String>, (StatusCode, Html<String>)> {
    let offer = state
        .offers
        .get(&offer_id)
        .await
        .ok_or((StatusCode::NOT_FOUND, Html(not_found_page())))?;

    if offer.is_expired(Utc::now().timestamp()) {
        return Err((StatusCode::GONE, Html(expired_page())));
    }

    Ok(Html(offer_page(&offer_id, &offer, &state.config.site_base_url)))
}

// ========================================
// POST /offer/:id/order
// ========================================

/// 選択された行から注文を作る。価格は必ずストア上のオファーから取り直す
/// （フォームに紛れた価格フィールドは無視する）。
pub async fn order_from_offer(
    State(state): State<Arc<AppState>>,
    Path(offer_id): Path<String>,
    body: String,
) -> Result<Html<String>, (StatusCode, Json<ErrorResponse>)> {
    let offer = state.offers.get(&offer_id).await.ok_or_else(|| {
        error_response(StatusCode::NOT_FOUND, "Pasi\u{16b}lymas nerastas".to_string())
    })?;

    // 表示時と同じ判定。古いタブからの注文も通さない。
    if offer.is_expired(Utc::now().timestamp()) {
        return Err(error_response(
            StatusCode::GONE,
            "\u{160}ios nuorodos galiojimas pasibaig\u{117}".to_string(),
        ));
    }

    let pairs = parse_form_pairs(&body);
    let field = |key: &str| -> String {
        pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim().to_string())
            .unwrap_or_default()
    };

    let name = field("name");
    let email = field("email");
    let address = field("address");
    if name.is_empty() || email.is_empty() || address.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "B\u{16b}tina nurodyti vard\u{105}, el. pa\u{161}t\u{105} ir adres\u{105}."
                .to_string(),
        ));
    }

    let mut selected: Vec<usize> = Vec::new();
    for (k, v) in &pairs {
        if k == "choose" {
            if let Ok(idx) = v.parse::<usize>() {
                if !selected.contains(&idx) {
                    selected.push(idx);
                }
            }
        }
    }

    let (items, total) = select_order_items(&offer, &selected);
    if items.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Nepasirinkta n\u{117} viena detal\u{117}.".to_string(),
        ));
    }

    let company = field("company");
    let buyer = Buyer {
        name: if company.is_empty() { name.clone() } else { company },
        company_code: field("company_code"),
        vat_code: field("vat_code"),
        address: {
            let invoice_address = field("invoice_address");
            if invoice_address.is_empty() {
                address
            } else {
                invoice_address
            }
        },
        email: email.clone(),
    };

    let order_id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();
    let order = Order {
        offer_id: offer_id.clone(),
        buyer,
        items,
        total,
        status: OrderStatus::PendingPayment,
        created_at: now,
        invoice_no: None,
    };

    state.orders.insert(&order_id, order.clone()).await.map_err(|e| {
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Store error: {}", e),
        )
    })?;

    let cfg = &state.config;
    let signed = paysera::build_request(
        &PaymentParams {
            orderid: order_id.clone(),
            amount_cents: (total * 100.0).round() as i64,
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

    // 前払い請求書。組めなくても注文は進める。
    let inv = invoice::invoice_no(&order_id, now);
    let pdf = invoice::render_invoice(&inv, &order.buyer, &order.items, order.total, now).ok();

    mailer::dispatch(
        state.notifier.clone(),
        mailer::order_created_admin_mail(&order_id, &order, &pay_url, &inv, pdf.clone(), cfg),
    );
    mailer::dispatch(
        state.notifier.clone(),
        mailer::order_invoice_customer_mail(&order, &pay_url, &inv, pdf, cfg),
    );

    info!(
        "order created: order_id={} offer_id={} total={:.2}",
        order_id, offer_id, total
    );

    Ok(Html(order_confirmation_page(&pay_url, &cfg.site_base_url)))
}

/// 選択インデックスをオファーのストア済み価格で金額化する
fn select_order_items(offer: &Offer, selected: &[usize]) -> (Vec<OrderItem>, f64) {
    let mut items = Vec::new();
    let mut total = 0.0;
    for &idx in selected {
        if let Some(item) = offer.items.get(idx) {
            let price = parse_price(&item.price_vat);
            total += price;
            items.push(OrderItem {
                name: item.name.clone(),
                desc: item.desc.clone(),
                price,
                qty: 1,
            });
        }
    }
    (items, total)
}

// ========================================
// HTML ページ
// ========================================

fn not_found_page() -> String {
    concat!(
        "<!doctype html><meta charset=\"utf-8\">",
        "<div style=\"font-family:system-ui,sans-serif;max-width:600px;margin:40px auto\">",
        "<h2>Pasi\u{16b}lymas nerastas</h2>",
        "</div>"
    )
    .to_string()
}

fn expired_page() -> String {
    concat!(
        "<!doctype html><meta charset=\"utf-8\">",
        "<div style=\"font-family:system-ui,sans-serif;max-width:600px;margin:40px auto\">",
        "<h2>\u{160}ios nuorodos galiojimas pasibaig\u{117}</h2>",
        "<p>Jei vis dar norite \u{12f}sigyti detales, para\u{161}ykite mums \u{2013} ",
        "atnaujinsime pasi\u{16b}lym\u{105}.</p>",
        "</div>"
    )
    .to_string()
}

fn offer_item_html(index: usize, item: &OfferItem) -> String {
    let mut html = String::from("<div class=\"item\">");
    let position = item
        .position
        .map(|p| format!("{}. ", p))
        .unwrap_or_default();
    html.push_str(&format!("<b>{}{}</b>", position, escape_html(&item.name)));
    if !item.kind.is_empty() {
        html.push_str(&format!(
            " <span class=\"type\">({})</span>",
            escape_html(&item.kind)
        ));
    }
    if !item.desc.is_empty() {
        html.push_str(&format!(
            "<div class=\"desc\"><i>{}</i></div>",
            escape_html(&item.desc)
        ));
    }
    if !item.eta.is_empty() {
        html.push_str(&format!(
            "<div>Pristatymas: <b>{}</b></div>",
            escape_html(&item.eta)
        ));
    }
    html.push_str(&format!(
        "<div>Kaina: <b>{}\u{20ac}</b>",
        escape_html(&item.price_vat)
    ));
    if !item.price_novat.is_empty() {
        html.push_str(&format!(
            " (be PVM {}\u{20ac})",
            escape_html(&item.price_novat)
        ));
    }
    html.push_str("</div>");
    if !item.img_src.is_empty() {
        html.push_str(&format!(
            "<div class=\"img\"><img src=\"{}\" loading=\"lazy\" referrerpolicy=\"no-referrer\" alt=\"\"></div>",
            escape_html(&item.img_src)
        ));
    }
    html.push_str(&format!(
        "<label><input type=\"checkbox\" name=\"choose\" value=\"{}\"> U\u{17e}sakyti \u{161}i\u{105} detal\u{119}</label>",
        index
    ));
    html.push_str("</div>");
    html
}

fn offer_page(offer_id: &str, offer: &Offer, site_home: &str) -> String {
    let rows: String = offer
        .items
        .iter()
        .enumerate()
        .map(|(i, item)| offer_item_html(i, item))
        .collect();
    let rows = if rows.is_empty() {
        "<div class=\"small\">Pasi\u{16b}lymas tu\u{161}\u{10d}ias.</div>".to_string()
    } else {
        rows
    };

    format!(
        concat!(
            "<!doctype html>\n<html lang=\"lt\"><head><meta charset=\"utf-8\">",
            "<meta name=\"viewport\" content=\"width=device-width,initial-scale=1\">\n",
            "<title>Detali\u{173} pasi\u{16b}lymas</title>\n",
            "<style>\n",
            "body{{font-family:system-ui,sans-serif;background:#f9fafb;margin:0}}\n",
            ".wrap{{max-width:860px;margin:24px auto;background:#fff;border-radius:14px;padding:24px 28px}}\n",
            ".small{{color:#6b7280;font-size:12px}}\n",
            ".item{{border-top:1px solid #e5e7eb;padding:14px 0}}\n",
            ".item:first-child{{border-top:none}}\n",
            ".type{{color:#406BBA}}\n",
            ".img img{{max-width:140px;max-height:140px;border-radius:10px;margin-top:6px}}\n",
            ".btn{{background:#436BAA;color:#fff;border:none;border-radius:10px;padding:10px 16px;cursor:pointer}}\n",
            ".grid{{display:grid;grid-template-columns:1fr 1fr;gap:12px}}\n",
            "</style></head>\n<body>\n<div class=\"wrap\">\n",
            "<h1>Detali\u{173} pasi\u{16b}lymas</h1>\n",
            "<div class=\"small\">Nuoroda galioja 7 d.</div>\n",
            "<form method=\"POST\" action=\"/offer/{id}/order\">\n",
            "<div class=\"grid\">\n",
            "<label>Vardas/\u{12f}mon\u{117}<br><input name=\"name\" required></label>\n",
            "<label>El. pa\u{161}tas<br><input type=\"email\" name=\"email\" required></label>\n",
            "<label>Pristatymo adresas<br><input name=\"address\" required></label>\n",
            "</div>\n",
            "<div class=\"small\">Rekvizitai s\u{105}skaitai (neb\u{16b}tina)</div>\n",
            "<div class=\"grid\">\n",
            "<label>\u{12e}mon\u{117}s pavadinimas<br><input name=\"company\"></label>\n",
            "<label>\u{12e}mon\u{117}s kodas<br><input name=\"company_code\"></label>\n",
            "<label>PVM kodas<br><input name=\"vat_code\"></label>\n",
            "<label>S\u{105}skaitos adresas<br><input name=\"invoice_address\"></label>\n",
            "</div>\n<hr>\n",
            "{rows}\n",
            "<button type=\"submit\" class=\"btn\">U\u{17e}sakyti pasirinktas</button>\n",
            "<a href=\"{home}\">\u{12e} prad\u{17e}i\u{105}</a>\n",
            "</form>\n</div>\n</body></html>"
        ),
        id = escape_html(offer_id),
        rows = rows,
        home = escape_html(site_home),
    )
}

fn order_confirmation_page(pay_url: &str, site_home: &str) -> String {
    format!(
        concat!(
            "<!doctype html><meta charset=\"utf-8\">",
            "<div style=\"font-family:system-ui,sans-serif;max-width:640px;margin:40px auto;text-align:center\">",
            "<h2>A\u{10d}i\u{16b}! J\u{16b}s\u{173} u\u{17e}sakymas priimtas.</h2>",
            "<p>\u{12e} el. pa\u{161}t\u{105} i\u{161}siunt\u{117}me s\u{105}skait\u{105} su apmok\u{117}jimo nuoroda.</p>",
            "<p><a href=\"{pay}\" target=\"_blank\" rel=\"noopener\">Apmok\u{117}ti per Paysera</a></p>",
            "<p><a href=\"{home}\">Gr\u{12f}\u{17e}ti \u{12f} prad\u{17e}i\u{105}</a></p>",
            "</div>"
        ),
        pay = escape_html(pay_url),
        home = escape_html(site_home),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_with_prices() -> Offer {
        Offer {
            items: vec![
                OfferItem {
                    position: Some(1),
                    name: "Zibintas".into(),
                    kind: "nauja".into(),
                    desc: "Kairys".into(),
                    eta: "2-3 d.".into(),
                    price_vat: "45,50".into(),
                    price_novat: "37,60".into(),
                    img_src: String::new(),
                },
                OfferItem {
                    position: Some(2),
                    name: "Kaladeles".into(),
                    kind: String::new(),
                    desc: String::new(),
                    eta: String::new(),
                    price_vat: "19.40".into(),
                    price_novat: String::new(),
                    img_src: String::new(),
                },
            ],
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn offer_id_shape() {
        let id = generate_offer_id();
        assert!(id.starts_with("OFF"));
        assert_eq!(id.len(), 9);
        assert!(id[3..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn order_items_priced_from_store_only() {
        let offer = offer_with_prices();
        // フォームがどんな価格を送ってきても、この関数は offer の価格しか見ない
        let (items, total) = select_order_items(&offer, &[0, 1]);
        assert_eq!(items.len(), 2);
        assert!((total - 64.9).abs() < 1e-9);
        assert!((items[0].price - 45.5).abs() < 1e-9);
        assert!((items[1].price - 19.4).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_indices_are_dropped() {
        let offer = offer_with_prices();
        let (items, total) = select_order_items(&offer, &[1, 99]);
        assert_eq!(items.len(), 1);
        assert!((total - 19.4).abs() < 1e-9);
    }

    #[test]
    fn empty_selection_yields_nothing() {
        let offer = offer_with_prices();
        let (items, total) = select_order_items(&offer, &[]);
        assert!(items.is_empty());
        assert_eq!(total, 0.0);
    }

    #[test]
    fn offer_page_lists_items_and_form() {
        let offer = offer_with_prices();
        let html = offer_page("OFFABC12", &offer, "https://www.raskdali.lt");
        assert!(html.contains("Zibintas"));
        assert!(html.contains("value=\"0\""));
        assert!(html.contains("value=\"1\""));
        assert!(html.contains("action=\"/offer/OFFABC12/order\""));
        assert!(html.contains("be PVM 37,60"));
    }
}
