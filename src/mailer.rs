//! Notification Dispatcher
//! 管理者・顧客へのメール通知。SMTP 未設定ならログのみ。
//! 送信はバックグラウンドで行い、失敗しても呼び出し側の状態を巻き戻さない。

use crate::config::{AppConfig, SmtpConfig, SELLER};
use crate::models::{Order, PartsRequest, RequestItem};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use tracing::{error, info};

const LOGO_URL: &str =
    "https://assets.zyrosite.com/A0xl6GKo12tBorNO/rask-dali-siauras-YBg7QDW7g6hKw3WD.png";

// ========================================
// 送信メッセージ型
// ========================================

#[derive(Debug, Clone)]
pub struct MailAttachment {
    pub filename: String,
    pub mime: String,
    pub content: Vec<u8>,
    /// Some の場合は HTML から cid 参照されるインライン画像
    pub inline_cid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub attachments: Vec<MailAttachment>,
}

// ========================================
// Notifier ポート
// ========================================

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, mail: OutgoingMail) -> anyhow::Result<()>;
}

/// SMTP 送信（SMTPS, デフォルト465番ポート）
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpNotifier {
    pub fn new(smtp: &SmtpConfig, from_addr: &str) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)?
            .port(smtp.port)
            .credentials(Credentials::new(smtp.user.clone(), smtp.pass.clone()))
            .build();
        let from: Mailbox = format!("RaskDali <{}>", from_addr).parse()?;
        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn deliver(&self, mail: OutgoingMail) -> anyhow::Result<()> {
        let mut body = MultiPart::mixed().singlepart(SinglePart::html(mail.html));
        for att in mail.attachments {
            let content_type = ContentType::parse(&att.mime)
                .unwrap_or(ContentType::parse("application/octet-stream")?);
            let part = match att.inline_cid {
                Some(cid) => Attachment::new_inline(cid).body(att.content, content_type),
                None => Attachment::new(att.filename).body(att.content, content_type),
            };
            body = body.singlepart(part);
        }
        let message = Message::builder()
            .from(self.from.clone())
            .to(mail.to.parse()?)
            .subject(mail.subject)
            .multipart(body)?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// SMTP 未設定のときのフォールバック。内容は送らずログに残すだけ。
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, mail: OutgoingMail) -> anyhow::Result<()> {
        info!(
            "mail skipped (SMTP not configured): to={} subject={} attachments={}",
            mail.to,
            mail.subject,
            mail.attachments.len()
        );
        Ok(())
    }
}

/// fire-and-forget 送信。HTTPレスポンスを待たせない。
pub fn dispatch(notifier: Arc<dyn Notifier>, mail: OutgoingMail) {
    tokio::spawn(async move {
        let to = mail.to.clone();
        let subject = mail.subject.clone();
        if let Err(e) = notifier.deliver(mail).await {
            error!("mail send failed: to={} subject={} err={:#}", to, subject, e);
        }
    });
}

// ========================================
// HTML ヘルパー
// ========================================

pub fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn footer_html(cfg: &AppConfig) -> String {
    format!(
        concat!(
            "<hr style=\"border:none;border-top:1px solid #eee;margin:16px 0\">",
            "<div style=\"font-family:Arial,sans-serif;font-size:13px;color:#374151\">",
            "<div style=\"font-weight:700\">{name}</div>",
            "<div>{addr}</div>",
            "<div>\u{12e}mon\u{117}s kodas: {code} \u{b7} PVM mok. kodas: {vat}</div>",
            "<div>El. pa\u{161}tas: <a href=\"mailto:{email}\">{email}</a></div>",
            "<div style=\"margin-top:8px\">Turite klausim\u{173}? <b>Atsakykite \u{12f} \u{161}\u{12f} lai\u{161}k\u{105}</b>.</div>",
            "</div>"
        ),
        name = escape_html(SELLER.name),
        addr = escape_html(SELLER.addr),
        code = SELLER.company_code,
        vat = SELLER.vat_code,
        email = escape_html(&cfg.admin_email),
    )
}

fn header_html() -> String {
    format!(
        "<div style=\"padding:16px 0\"><img src=\"{}\" alt=\"RaskDali\" style=\"height:26px\"></div>",
        LOGO_URL
    )
}

/// 車両・連絡先のサマリーブロック（管理者・顧客共通）
fn request_top_html(plan_label: &str, req: &PartsRequest) -> String {
    let mut html = format!(
        concat!(
            "{header}",
            "<div style=\"font-family:Arial,sans-serif;font-size:14px;line-height:1.5\">",
            "<p><b>Planas:</b> {plan} &nbsp;|&nbsp; <b>Detali\u{173} (u\u{17e}pildyta):</b> {count}</p>",
            "<p><b>VIN:</b> {vin} &nbsp;|&nbsp; <b>Mark\u{117}:</b> {make} &nbsp;|&nbsp; ",
            "<b>Modelis:</b> {model} &nbsp;|&nbsp; <b>Metai:</b> {year}</p>",
            "<p><b>Vardas/\u{12f}mon\u{117}:</b> {name} &nbsp;|&nbsp; <b>El. pa\u{161}tas:</b> {email} ",
            "&nbsp;|&nbsp; <b>Tel.:</b> {phone}</p>"
        ),
        header = header_html(),
        plan = escape_html(plan_label),
        count = req.items.len(),
        vin = escape_html(&req.vin),
        make = escape_html(&req.make),
        model = escape_html(&req.model),
        year = escape_html(&req.year),
        name = escape_html(&req.name),
        email = escape_html(&req.email),
        phone = escape_html(&req.phone),
    );
    if !req.comment.is_empty() {
        html.push_str(&format!(
            "<p><b>Komentarai:</b> {}</p>",
            escape_html(&req.comment)
        ));
    }
    html.push_str("<hr style=\"border:none;border-top:1px solid #eee;margin:12px 0\"></div>");
    html
}

fn request_items_html(items: &[RequestItem], with_images: bool) -> String {
    items
        .iter()
        .map(|it| {
            let title = if it.name.is_empty() {
                "(be pavadinimo)".to_string()
            } else {
                escape_html(&it.name)
            };
            let mut block = format!(
                "<div style=\"padding:10px 12px;border:1px solid #eee;border-radius:10px;margin:8px 0\">\
                 <div style=\"font-weight:600\">#{}: {}</div>",
                it.idx, title
            );
            if !it.desc.is_empty() {
                block.push_str(&format!(
                    "<div><b>Apra\u{161}ymas:</b> {}</div>",
                    escape_html(&it.desc)
                ));
            }
            if !it.notes.is_empty() {
                block.push_str(&format!(
                    "<div><b>Pastabos:</b> {}</div>",
                    escape_html(&it.notes)
                ));
            }
            if with_images && it.image.is_some() {
                block.push_str(&format!(
                    "<div style=\"margin-top:6px\"><img src=\"cid:{}\" style=\"max-width:320px\"></div>",
                    item_cid(it.idx)
                ));
            }
            block.push_str("</div>");
            block
        })
        .collect()
}

fn item_cid(idx: usize) -> String {
    format!("item{}_cid", idx)
}

/// 添付画像（base64 → バイト列）。壊れた画像は黙って飛ばす。
fn request_attachments(items: &[RequestItem], inline: bool) -> Vec<MailAttachment> {
    items
        .iter()
        .filter_map(|it| {
            let img = it.image.as_ref()?;
            let content = BASE64.decode(&img.base64).ok()?;
            Some(MailAttachment {
                filename: img.filename.clone(),
                mime: img.mime.clone(),
                content,
                inline_cid: inline.then(|| item_cid(it.idx)),
            })
        })
        .collect()
}

fn order_items_html(order: &Order) -> String {
    let rows: String = order
        .items
        .iter()
        .map(|it| {
            let desc = if it.desc.is_empty() {
                String::new()
            } else {
                format!("<br><i>{}</i>", escape_html(&it.desc))
            };
            format!(
                "<li><b>{}</b> \u{2014} {:.2} \u{20ac}{}</li>",
                escape_html(&it.name),
                it.price,
                desc
            )
        })
        .collect();
    format!(
        "<ul>{}</ul><p>Viso su PVM: <b>{:.2} \u{20ac}</b></p>",
        rows, order.total
    )
}

fn pdf_attachment(invoice_no: &str, pdf: Option<Vec<u8>>) -> Vec<MailAttachment> {
    match pdf {
        Some(content) => vec![MailAttachment {
            filename: format!("{}.pdf", invoice_no),
            mime: "application/pdf".to_string(),
            content,
            inline_cid: None,
        }],
        None => vec![],
    }
}

fn display_name(name: &str) -> &str {
    if name.is_empty() {
        "klientas"
    } else {
        name
    }
}

// ========================================
// メール組み立て（リクエスト系）
// ========================================

/// 有料プラン確定時の管理者宛メール（写真をインライン添付）
pub fn paid_request_admin_mail(
    order_id: &str,
    plan_label: &str,
    req: &PartsRequest,
    trigger: &str,
    cfg: &AppConfig,
) -> OutgoingMail {
    let html = format!(
        "{}<div style=\"font-family:Arial,sans-serif;font-size:14px\">{}</div>",
        request_top_html(plan_label, req),
        request_items_html(&req.items, true)
    );
    OutgoingMail {
        to: cfg.admin_email.clone(),
        subject: format!(
            "U\u{17e}klausa ({}) \u{2013} {} (order {}, via {})",
            plan_label,
            display_name(&req.name),
            order_id,
            trigger
        ),
        html,
        attachments: request_attachments(&req.items, true),
    }
}

/// 有料プラン確定時の顧客宛メール
pub fn paid_request_customer_mail(
    plan_label: &str,
    req: &PartsRequest,
    cfg: &AppConfig,
) -> OutgoingMail {
    let html = format!(
        concat!(
            "{top}",
            "<div style=\"font-family:Arial,sans-serif;font-size:14px\">",
            "<h2>J\u{16b}s\u{173} u\u{17e}klausa apmok\u{117}ta ir priimta</h2>",
            "<p>A\u{10d}i\u{16b}! Gavome J\u{16b}s\u{173} apmok\u{117}jim\u{105} ir u\u{17e}klaus\u{105} ",
            "(<b>{plan}</b>). M\u{16b}s\u{173} komanda paruo\u{161} detali\u{173} pasi\u{16b}lym\u{105} ",
            "artimiausiu metu (paprastai per 24\u{2013}48 val.).</p></div>",
            "{footer}"
        ),
        top = request_top_html(plan_label, req),
        plan = escape_html(plan_label),
        footer = footer_html(cfg),
    );
    OutgoingMail {
        to: req.email.clone(),
        subject: "J\u{16b}s\u{173} u\u{17e}klausa apmok\u{117}ta ir priimta \u{2013} RaskDali"
            .to_string(),
        html,
        attachments: vec![],
    }
}

/// 無料プランの管理者宛メール（写真は通常添付）
pub fn free_request_admin_mail(
    plan_label: &str,
    req: &PartsRequest,
    cfg: &AppConfig,
) -> OutgoingMail {
    let html = format!(
        "{}<div style=\"font-family:Arial,sans-serif;font-size:14px\">{}</div>",
        request_top_html(plan_label, req),
        request_items_html(&req.items, false)
    );
    OutgoingMail {
        to: cfg.admin_email.clone(),
        subject: format!(
            "Nemokama u\u{17e}klausa \u{2013} {}",
            display_name(&req.name)
        ),
        html,
        attachments: request_attachments(&req.items, false),
    }
}

/// 無料プランの顧客宛メール
pub fn free_request_customer_mail(
    plan_label: &str,
    req: &PartsRequest,
    cfg: &AppConfig,
) -> OutgoingMail {
    let html = format!(
        concat!(
            "{top}",
            "<div style=\"font-family:Arial,sans-serif;font-size:14px\">",
            "<h2>J\u{16b}s\u{173} u\u{17e}klausa gauta</h2>",
            "<p>A\u{10d}i\u{16b}! Gavome J\u{16b}s\u{173} nemokam\u{105} u\u{17e}klaus\u{105}. ",
            "Da\u{17e}niausiai atsakome per <b>24\u{2013}48 val.</b></p></div>",
            "{footer}"
        ),
        top = request_top_html(plan_label, req),
        footer = footer_html(cfg),
    );
    OutgoingMail {
        to: req.email.clone(),
        subject: "J\u{16b}s\u{173} nemokama u\u{17e}klausa gauta \u{2013} RaskDali".to_string(),
        html,
        attachments: vec![],
    }
}

// ========================================
// メール組み立て（注文系）
// ========================================

/// 注文作成時の管理者宛メール（前払い請求書PDF付き）
pub fn order_created_admin_mail(
    order_id: &str,
    order: &Order,
    pay_url: &str,
    invoice_no: &str,
    pdf: Option<Vec<u8>>,
    cfg: &AppConfig,
) -> OutgoingMail {
    let buyer = &order.buyer;
    let html = format!(
        concat!(
            "<h3>U\u{17e}sakymas i\u{161} pasi\u{16b}lymo</h3>",
            "<p><b>OrderID:</b> {id}</p>",
            "<p><b>Pirk\u{117}jas:</b> {name} {code} {vat}</p>",
            "<p><b>El. pa\u{161}tas:</b> {email}</p>",
            "<p><b>Adresas:</b> {addr}</p>",
            "{items}",
            "<p><a href=\"{pay}\" target=\"_blank\">Apmok\u{117}ti per Paysera</a></p>"
        ),
        id = escape_html(order_id),
        name = escape_html(&buyer.name),
        code = escape_html(&buyer.company_code),
        vat = escape_html(&buyer.vat_code),
        email = escape_html(&buyer.email),
        addr = escape_html(&buyer.address),
        items = order_items_html(order),
        pay = pay_url,
    );
    OutgoingMail {
        to: cfg.admin_email.clone(),
        subject: format!(
            "Naujas u\u{17e}sakymas i\u{161} pasi\u{16b}lymo \u{2013} {} (order {})",
            display_name(&buyer.name),
            order_id
        ),
        html,
        attachments: pdf_attachment(invoice_no, pdf),
    }
}

/// 注文作成時の顧客宛メール（支払いリンク + 前払い請求書PDF）。
/// resend エンドポイントでも同じものを再送する。
pub fn order_invoice_customer_mail(
    order: &Order,
    pay_url: &str,
    invoice_no: &str,
    pdf: Option<Vec<u8>>,
    cfg: &AppConfig,
) -> OutgoingMail {
    let html = format!(
        concat!(
            "<h2>J\u{16b}s\u{173} pasirinktos prek\u{117}s</h2>",
            "{items}",
            "<p>Nor\u{117}dami apmok\u{117}ti, spauskite: ",
            "<a href=\"{pay}\" target=\"_blank\" rel=\"noopener\">Apmok\u{117}ti per Paysera</a></p>",
            "<p>Prisegame s\u{105}skait\u{105} PDF formatu.</p>",
            "{footer}"
        ),
        items = order_items_html(order),
        pay = pay_url,
        footer = footer_html(cfg),
    );
    OutgoingMail {
        to: order.buyer.email.clone(),
        subject: format!("S\u{105}skaita apmok\u{117}jimui \u{2013} {}", invoice_no),
        html,
        attachments: pdf_attachment(invoice_no, pdf),
    }
}

/// 支払い確認時の管理者宛メール
pub fn order_paid_admin_mail(
    order_id: &str,
    order: &Order,
    invoice_no: &str,
    pdf: Option<Vec<u8>>,
    cfg: &AppConfig,
) -> OutgoingMail {
    let html = format!(
        concat!(
            "<h3>Apmok\u{117}tas u\u{17e}sakymas</h3>",
            "<p><b>OrderID:</b> {id} &nbsp;|&nbsp; <b>S\u{105}skaita:</b> {inv}</p>",
            "<p><b>Pirk\u{117}jas:</b> {name} ({email})</p>",
            "{items}"
        ),
        id = escape_html(order_id),
        inv = escape_html(invoice_no),
        name = escape_html(&order.buyer.name),
        email = escape_html(&order.buyer.email),
        items = order_items_html(order),
    );
    OutgoingMail {
        to: cfg.admin_email.clone(),
        subject: format!(
            "Apmok\u{117}tas u\u{17e}sakymas \u{2013} {} (order {})",
            display_name(&order.buyer.name),
            order_id
        ),
        html,
        attachments: pdf_attachment(invoice_no, pdf),
    }
}

/// 支払い確認時の顧客宛メール（正式な請求書PDF付き）
pub fn order_paid_customer_mail(
    order: &Order,
    invoice_no: &str,
    pdf: Option<Vec<u8>>,
    cfg: &AppConfig,
) -> OutgoingMail {
    let html = format!(
        concat!(
            "<h2>Apmok\u{117}jimas gautas</h2>",
            "<p>A\u{10d}i\u{16b}! Gavome J\u{16b}s\u{173} apmok\u{117}jim\u{105}. ",
            "U\u{17e}sakytos detal\u{117}s bus i\u{161}si\u{173}stos nurodytu adresu.</p>",
            "{items}",
            "{footer}"
        ),
        items = order_items_html(order),
        footer = footer_html(cfg),
    );
    OutgoingMail {
        to: order.buyer.email.clone(),
        subject: format!(
            "Apmok\u{117}jimas gautas \u{2013} {} \u{2013} RaskDali",
            invoice_no
        ),
        html,
        attachments: pdf_attachment(invoice_no, pdf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Buyer, ItemImage, OrderItem, OrderStatus};

    fn sample_request() -> PartsRequest {
        PartsRequest {
            vin: "WAUZZZ8K9BA123456".into(),
            make: "Audi".into(),
            model: "A4".into(),
            year: "2011".into(),
            comment: "Skubu <greitai>".into(),
            name: "Jonas".into(),
            email: "jonas@example.lt".into(),
            phone: "+37060000000".into(),
            items: vec![RequestItem {
                idx: 1,
                name: "Zibintas".into(),
                desc: "Kairys priekinis".into(),
                notes: String::new(),
                image: Some(ItemImage {
                    filename: "zibintas.jpg".into(),
                    mime: "image/jpeg".into(),
                    base64: BASE64.encode(b"fake-jpeg-bytes"),
                }),
            }],
        }
    }

    #[test]
    fn escape_html_covers_specials() {
        assert_eq!(
            escape_html("<b>\"A&B\"</b>'x'"),
            "&lt;b&gt;&quot;A&amp;B&quot;&lt;/b&gt;&#39;x&#39;"
        );
    }

    #[test]
    fn admin_mail_inlines_images_and_escapes() {
        let cfg = AppConfig::default();
        let mail = paid_request_admin_mail("oid-1", "Standart", &sample_request(), "callback", &cfg);
        assert_eq!(mail.to, cfg.admin_email);
        assert!(mail.subject.contains("Standart"));
        assert!(mail.subject.contains("via callback"));
        // コメントはエスケープされる
        assert!(mail.html.contains("&lt;greitai&gt;"));
        assert_eq!(mail.attachments.len(), 1);
        assert_eq!(mail.attachments[0].inline_cid.as_deref(), Some("item1_cid"));
        assert!(mail.html.contains("cid:item1_cid"));
    }

    #[test]
    fn free_mail_attaches_without_cid() {
        let cfg = AppConfig::default();
        let mail = free_request_admin_mail("Nemokama paieska", &sample_request(), &cfg);
        assert_eq!(mail.attachments.len(), 1);
        assert!(mail.attachments[0].inline_cid.is_none());
        assert!(!mail.html.contains("cid:"));
    }

    #[test]
    fn broken_image_is_skipped() {
        let mut req = sample_request();
        req.items[0].image = Some(ItemImage {
            filename: "x.jpg".into(),
            mime: "image/jpeg".into(),
            base64: "!!! not base64 !!!".into(),
        });
        let cfg = AppConfig::default();
        let mail = paid_request_admin_mail("oid-1", "Mini", &req, "return", &cfg);
        assert!(mail.attachments.is_empty());
    }

    #[test]
    fn order_mails_carry_invoice_pdf() {
        let cfg = AppConfig::default();
        let order = Order {
            offer_id: "OFF123".into(),
            buyer: Buyer {
                name: "UAB Bandymas".into(),
                company_code: String::new(),
                vat_code: String::new(),
                address: "Kauno g. 1".into(),
                email: "pirkejas@example.lt".into(),
            },
            items: vec![OrderItem {
                name: "Zibintas".into(),
                desc: String::new(),
                price: 45.5,
                qty: 1,
            }],
            total: 45.5,
            status: OrderStatus::PendingPayment,
            created_at: 1_700_000_000,
            invoice_no: None,
        };
        let mail = order_invoice_customer_mail(
            &order,
            "https://bank.paysera.com/pay/?data=x&sign=y",
            "RD-2023-ABC123",
            Some(b"%PDF-fake".to_vec()),
            &cfg,
        );
        assert_eq!(mail.to, "pirkejas@example.lt");
        assert_eq!(mail.attachments.len(), 1);
        assert_eq!(mail.attachments[0].filename, "RD-2023-ABC123.pdf");
        assert!(mail.html.contains("45.50"));

        let none = order_paid_customer_mail(&order, "RD-2023-ABC123", None, &cfg);
        assert!(none.attachments.is_empty());
    }
}
