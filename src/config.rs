//! Configuration Module
//! 環境変数からの設定読み込みと販売者（RaskDali）固定情報

use std::env;
use std::path::PathBuf;

// ========================================
// 販売者情報（請求書・メールフッター用）
// ========================================

/// 販売者の固定レクイジット
pub struct Seller {
    pub name: &'static str,
    pub addr: &'static str,
    pub company_code: &'static str,
    pub vat_code: &'static str,
}

pub const SELLER: Seller = Seller {
    name: "RaskDali / UAB \u{201e}Magdaris\u{201c}",
    addr: "Vilniaus g. 3B, Karm\u{117}lava, 54448, Lietuva",
    company_code: "159941827",
    vat_code: "LT599418219",
};

// ========================================
// アプリ設定
// ========================================

#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

#[derive(Clone)]
pub struct AppConfig {
    pub port: u16,
    /// drafts.json / orders.json / offers.json の置き場所
    pub data_dir: PathBuf,
    /// このAPI自身の公開URL（accepturl / callbackurl の組み立てに使う）
    pub public_api_host: String,
    /// フロントサイトのURL（リダイレクトとメール内リンク用）
    pub site_base_url: String,
    pub paysera_project_id: String,
    pub paysera_sign_password: String,
    pub paysera_currency: String,
    pub paysera_test: bool,
    /// 管理者宛アドレス（差出人と同一）
    pub admin_email: String,
    /// SMTP 未設定（host なし）の場合はログ通知のみ
    pub smtp: Option<SmtpConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 10000,
            data_dir: PathBuf::from("."),
            public_api_host: "https://raskdali-shortlink.onrender.com".to_string(),
            site_base_url: "https://www.raskdali.lt".to_string(),
            paysera_project_id: String::new(),
            paysera_sign_password: String::new(),
            paysera_currency: "EUR".to_string(),
            paysera_test: false,
            admin_email: "info@raskdali.lt".to_string(),
            smtp: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let smtp = env::var("MAIL_HOST").ok().map(|host| SmtpConfig {
            host,
            port: env_parsed("MAIL_PORT", 465),
            user: env_or("MAIL_USER", ""),
            pass: env_or("MAIL_PASS", ""),
        });

        Self {
            port: env_parsed("PORT", defaults.port),
            data_dir: PathBuf::from(env_or("DATA_DIR", ".")),
            public_api_host: strip_trailing_slashes(env_or(
                "PUBLIC_API_HOST",
                &defaults.public_api_host,
            )),
            site_base_url: strip_trailing_slashes(env_or(
                "SITE_BASE_URL",
                &defaults.site_base_url,
            )),
            paysera_project_id: env_or("PAYSERA_PROJECT_ID", ""),
            paysera_sign_password: env_or("PAYSERA_PASSWORD", ""),
            paysera_currency: env_or("PAYSERA_CURRENCY", &defaults.paysera_currency),
            paysera_test: env_or("PAYSERA_TEST", "") == "1",
            admin_email: env_or("MAIL_USER", &defaults.admin_email),
            smtp,
        }
    }

    pub fn drafts_path(&self) -> PathBuf {
        self.data_dir.join("drafts.json")
    }

    pub fn orders_path(&self) -> PathBuf {
        self.data_dir.join("orders.json")
    }

    pub fn offers_path(&self) -> PathBuf {
        self.data_dir.join("offers.json")
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

fn strip_trailing_slashes(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
