//! Paysera Gateway Adapter
//! 支払いリクエストの署名付き生成とコールバック検証。
//! ワイヤ形式: data = base64(key=value&...), sign = md5(data + password) 小文字hex。

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use md5::{Digest, Md5};
use std::collections::HashMap;
use thiserror::Error;

pub const PAY_BASE_URL: &str = "https://bank.paysera.com/pay/";
const PROTOCOL_VERSION: &str = "1";

/// ゲートウェイに渡す data / sign のペア
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRequest {
    pub data: String,
    pub sign: String,
}

/// 支払いリクエストのパラメータ。シリアライズ順は固定
/// （version, projectid が先頭に入る）。
#[derive(Debug, Clone)]
pub struct PaymentParams {
    pub orderid: String,
    pub amount_cents: i64,
    pub currency: String,
    pub accepturl: String,
    pub cancelurl: String,
    pub callbackurl: String,
    pub test: bool,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// 署名付きリクエストを組み立てる。入力が同じなら結果も同じ。
pub fn build_request(
    params: &PaymentParams,
    project_id: &str,
    sign_password: &str,
) -> SignedRequest {
    let pairs: Vec<(&str, String)> = vec![
        ("version", PROTOCOL_VERSION.to_string()),
        ("projectid", project_id.to_string()),
        ("orderid", params.orderid.clone()),
        ("amount", params.amount_cents.to_string()),
        ("currency", params.currency.clone()),
        ("accepturl", params.accepturl.clone()),
        ("cancelurl", params.cancelurl.clone()),
        ("callbackurl", params.callbackurl.clone()),
        ("test", if params.test { "1" } else { "0" }.to_string()),
    ];
    let query = build_query(&pairs);
    let data = BASE64.encode(query.as_bytes());
    let sign = md5_hex(&data, sign_password);
    SignedRequest { data, sign }
}

/// コールバック署名の検証。比較は大文字小文字を無視する。
/// 不一致・空文字でも false を返すだけで、決して panic しない。
pub fn verify_callback(data: &str, sign: &str, sign_password: &str) -> bool {
    md5_hex(data, sign_password).eq_ignore_ascii_case(sign)
}

/// data を base64 → query string → マップに復元する。
/// verify_callback が通った後にだけ呼ぶこと。失敗はコールバック拒否として扱う。
pub fn decode_payload(data: &str) -> Result<HashMap<String, String>, DecodeError> {
    let raw = BASE64.decode(data)?;
    let text = String::from_utf8(raw)?;

    let mut map = HashMap::new();
    for pair in text.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        map.insert(decode_component(k)?, decode_component(v)?);
    }
    Ok(map)
}

/// リダイレクト先URL
pub fn pay_url(request: &SignedRequest) -> String {
    format!(
        "{}?data={}&sign={}",
        PAY_BASE_URL,
        urlencoding::encode(&request.data),
        request.sign
    )
}

fn build_query(pairs: &[(&str, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// ゲートウェイ側は '+' 区切りのスペースも送ってくる
fn decode_component(raw: &str) -> Result<String, std::string::FromUtf8Error> {
    let plus_decoded = raw.replace('+', " ");
    Ok(urlencoding::decode(&plus_decoded)?.into_owned())
}

fn md5_hex(data: &str, sign_password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(data.as_bytes());
    hasher.update(sign_password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> PaymentParams {
        PaymentParams {
            orderid: "abc-123".to_string(),
            amount_cents: 2999,
            currency: "EUR".to_string(),
            accepturl: "https://api.example.lt/thanks?ok=1&o=abc-123".to_string(),
            cancelurl: "https://api.example.lt/thanks?ok=0&o=abc-123".to_string(),
            callbackurl: "https://api.example.lt/api/paysera/callback".to_string(),
            test: true,
        }
    }

    #[test]
    fn build_is_deterministic_and_verifies() {
        let a = build_request(&params(), "12345", "secret");
        let b = build_request(&params(), "12345", "secret");
        assert_eq!(a, b);
        assert!(verify_callback(&a.data, &a.sign, "secret"));
        assert!(verify_callback(&a.data, &a.sign.to_uppercase(), "secret"));
    }

    #[test]
    fn wrong_secret_or_mutation_fails_verification() {
        let req = build_request(&params(), "12345", "secret");
        assert!(!verify_callback(&req.data, &req.sign, "other-secret"));

        // data の1文字変化で必ず落ちる
        let mut data = req.data.clone().into_bytes();
        data[0] = if data[0] == b'A' { b'B' } else { b'A' };
        let mutated = String::from_utf8(data).unwrap();
        assert!(!verify_callback(&mutated, &req.sign, "secret"));

        // sign の1文字変化でも落ちる
        let mut sign = req.sign.clone().into_bytes();
        sign[0] = if sign[0] == b'0' { b'1' } else { b'0' };
        let mutated_sign = String::from_utf8(sign).unwrap();
        assert!(!verify_callback(&req.data, &mutated_sign, "secret"));
    }

    #[test]
    fn decode_roundtrips_built_request() {
        let req = build_request(&params(), "12345", "secret");
        let map = decode_payload(&req.data).unwrap();
        assert_eq!(map.get("version").map(String::as_str), Some("1"));
        assert_eq!(map.get("projectid").map(String::as_str), Some("12345"));
        assert_eq!(map.get("orderid").map(String::as_str), Some("abc-123"));
        assert_eq!(map.get("amount").map(String::as_str), Some("2999"));
        assert_eq!(
            map.get("accepturl").map(String::as_str),
            Some("https://api.example.lt/thanks?ok=1&o=abc-123")
        );
        assert_eq!(map.get("test").map(String::as_str), Some("1"));
    }

    #[test]
    fn decode_handles_plus_and_percent_spaces() {
        let data = BASE64.encode(b"orderid=x%201&status=1&name=Jonas+Jonaitis");
        let map = decode_payload(&data).unwrap();
        assert_eq!(map.get("orderid").map(String::as_str), Some("x 1"));
        assert_eq!(map.get("name").map(String::as_str), Some("Jonas Jonaitis"));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_payload("!!! not base64 !!!").is_err());
        // base64としては正しいがUTF-8ではない
        let bad_utf8 = BASE64.encode([0xff, 0xfe, 0xfd]);
        assert!(decode_payload(&bad_utf8).is_err());
    }

    #[test]
    fn pay_url_embeds_encoded_data() {
        let req = build_request(&params(), "12345", "secret");
        let url = pay_url(&req);
        assert!(url.starts_with(PAY_BASE_URL));
        assert!(url.contains(&format!("&sign={}", req.sign)));
        // data は percent エンコードして埋め込む（base64 の '=' は %3D になる）
        assert!(url.contains(&format!("data={}", urlencoding::encode(&req.data))));
    }

    #[test]
    fn known_signature_value() {
        // sign = md5(data + password) を独立に確認する
        let data = BASE64.encode(b"orderid=1&status=1");
        let sign = md5_hex(&data, "pw");
        assert_eq!(sign.len(), 32);
        assert!(sign.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(verify_callback(&data, &sign, "pw"));
    }
}
