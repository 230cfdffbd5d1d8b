//! Data Models
//! Draft / Order / Offer などのデータ構造定義

use serde::{Deserialize, Serialize};

// ========================================
// Plan（有料プラン）
// ========================================

/// 有料検索プラン。金額はセント単位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Plan {
    Mini,
    Standart,
    Pro,
}

impl Plan {
    /// フォーム値からのパース。不明な値は Mini 扱い。
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Standart" => Plan::Standart,
            "Pro" => Plan::Pro,
            _ => Plan::Mini,
        }
    }

    pub fn amount_cents(self) -> i64 {
        match self {
            Plan::Mini => 999,
            Plan::Standart => 2999,
            Plan::Pro => 5999,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Mini => "Mini",
            Plan::Standart => "Standart",
            Plan::Pro => "Pro",
        }
    }
}

// ========================================
// 部品リクエスト（共通フォーム内容）
// ========================================

/// アップロードされた部品写真（drafts.json に base64 で保存される）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemImage {
    pub filename: String,
    pub mime: String,
    pub base64: String,
}

/// リクエスト1行分（部品名・説明・備考・任意の写真）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestItem {
    pub idx: usize,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ItemImage>,
}

/// フォームから来る車両・連絡先・部品リスト一式
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartsRequest {
    #[serde(default)]
    pub vin: String,
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    pub items: Vec<RequestItem>,
}

// ========================================
// Draft（支払い確認待ちリクエスト）
// ========================================

/// 有料プランのリクエスト。ストアに存在すること自体が「支払い待ち」状態。
/// finalize で通知を送ってから削除される。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub plan: Plan,
    #[serde(flatten)]
    pub request: PartsRequest,
    pub created_at: i64, // Unix秒
    /// 通知送信済みフラグ。削除直前に立てるので、残っていたら重複シグナル。
    #[serde(default)]
    pub emailed: bool,
}

// ========================================
// Order（オファーから作られた注文）
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingPayment,
    Paid,
}

/// 請求書の宛先。name 以外は任意（空文字で省略）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Buyer {
    pub name: String,
    #[serde(default)]
    pub company_code: String,
    #[serde(default)]
    pub vat_code: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub email: String,
}

/// 注文1行分。price は PVM 込みユーロ。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    pub price: f64,
    #[serde(default = "default_qty")]
    pub qty: i64,
}

fn default_qty() -> i64 {
    1
}

/// 確定した注文。支払い後も請求書再発行のため削除しない。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub offer_id: String,
    pub buyer: Buyer,
    pub items: Vec<OrderItem>,
    /// 作成時点の items 価格合計（PVM 込み）
    pub total: f64,
    pub status: OrderStatus,
    pub created_at: i64, // Unix秒
    /// 初回 finalize 時に一度だけ採番される。以後不変。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_no: Option<String>,
}

// ========================================
// Offer（7日間有効の部品提案）
// ========================================

/// オファー1行分。価格はフォーム入力のまま文字列で保持し、
/// 注文時に parse_price でパースする。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferItem {
    #[serde(default)]
    pub position: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub eta: String,
    #[serde(default)]
    pub price_vat: String,
    #[serde(default)]
    pub price_novat: String,
    #[serde(default)]
    pub img_src: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub items: Vec<OfferItem>,
    pub created_at: i64, // Unix秒
}

impl Offer {
    /// リンクの有効期間（7日）
    pub const MAX_AGE_SECS: i64 = 7 * 24 * 3600;

    /// 表示側と注文側の両方がこの判定を共有する
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.created_at > Self::MAX_AGE_SECS
    }
}

/// "12,34" / "12.34 €" 形式の価格文字列をパースする。壊れた値は 0。
pub fn parse_price(raw: &str) -> f64 {
    let cleaned = raw.replace(',', ".").replace('\u{20ac}', "");
    cleaned.trim().parse().unwrap_or(0.0)
}

// ========================================
// API リクエスト / レスポンス型
// ========================================

#[derive(Debug, Deserialize)]
pub struct CreateOfferRequest {
    pub items: Vec<OfferItem>,
}

#[derive(Debug, Serialize)]
pub struct OfferLinkResponse {
    pub success: bool,
    pub link: String,
}

#[derive(Debug, Serialize)]
pub struct PayUrlResponse {
    pub success: bool,
    pub pay_url: String,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub success: bool,
}
