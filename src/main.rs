//! RaskDali API Server
//! 部品リクエスト受付、Paysera 決済確認、オファー/注文、PDF請求書

mod config;
mod engine;
mod handlers;
mod invoice;
mod mailer;
mod models;
mod paysera;
mod store;

use axum::{
    extract::DefaultBodyLimit,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use config::AppConfig;
use engine::ReconcileEngine;
use mailer::{LogNotifier, Notifier, SmtpNotifier};
use models::{Draft, Offer, Order};
use store::JsonStore;

// ========================================
// アプリ状態
// ========================================

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub drafts: Arc<JsonStore<Draft>>,
    pub orders: Arc<JsonStore<Order>>,
    pub offers: Arc<JsonStore<Offer>>,
    pub notifier: Arc<dyn Notifier>,
    pub engine: Arc<ReconcileEngine>,
}

// ========================================
// ヘルスチェック
// ========================================

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "raskdali-api".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ========================================
// メイン
// ========================================

#[tokio::main]
async fn main() {
    // ログ初期化
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Arc::new(AppConfig::from_env());

    // ストアは壊れていても空で起動する
    let drafts = Arc::new(JsonStore::open(config.drafts_path()).await);
    let orders = Arc::new(JsonStore::open(config.orders_path()).await);
    let offers = Arc::new(JsonStore::open(config.offers_path()).await);

    let notifier: Arc<dyn Notifier> = match &config.smtp {
        Some(smtp) => match SmtpNotifier::new(smtp, &config.admin_email) {
            Ok(n) => {
                info!("SMTP OK: host={}", smtp.host);
                Arc::new(n)
            }
            Err(e) => {
                warn!("SMTP ERROR: {:#}, falling back to log-only delivery", e);
                Arc::new(LogNotifier)
            }
        },
        None => {
            warn!("MAIL_HOST not set, mail delivery disabled (log only)");
            Arc::new(LogNotifier)
        }
    };

    let engine = Arc::new(ReconcileEngine::new(
        drafts.clone(),
        orders.clone(),
        notifier.clone(),
        config.clone(),
    ));

    let state = Arc::new(AppState {
        config: config.clone(),
        drafts,
        orders,
        offers,
        notifier,
        engine,
    });

    // ルーター構築
    let app = Router::new()
        .route("/api/health", get(health_check))
        .route("/api/request/start", post(handlers::requests::start_request))
        .route("/api/request/free", post(handlers::requests::free_request))
        .route(
            "/api/paysera/callback",
            post(handlers::payments::paysera_callback),
        )
        .route("/thanks", get(handlers::payments::thanks))
        .route("/api/offers", post(handlers::offers::create_offer))
        .route("/offer/:id", get(handlers::offers::view_offer))
        .route("/offer/:id/order", post(handlers::offers::order_from_offer))
        .route("/api/invoice/:order_id", get(handlers::orders::get_invoice))
        .route(
            "/api/orders/:order_id/resend",
            post(handlers::orders::resend_invoice),
        )
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024)) // 画像込みフォームを受けるため20MB
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    info!("RaskDali API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
