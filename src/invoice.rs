//! PDF Invoice Renderer
//! 注文内容から PVM 込み請求書PDFをバイト列として生成する。
//! 入力が同じなら出力も同じ（時刻は issued_at として渡す）。

use crate::config::SELLER;
use crate::models::{Buyer, OrderItem};
use anyhow::Result;
use chrono::{Datelike, TimeZone, Utc};
use printpdf::{BuiltinFont, Mm, PdfDocument};

/// 請求書番号: RD-{年}-{注文ID先頭6文字を大文字化}。
/// 決定的に導出できるので前払い書類にも使えるが、正式な採番は
/// finalize 時に一度だけ Order に書き込まれる。
pub fn invoice_no(order_id: &str, created_at: i64) -> String {
    let year = Utc
        .timestamp_opt(created_at, 0)
        .single()
        .map(|t| t.year())
        .unwrap_or(1970);
    let short: String = order_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(6)
        .collect::<String>()
        .to_uppercase();
    format!("RD-{}-{}", year, short)
}

/// A4縦の請求書を組んでバイト列を返す。
/// 組み込みフォント（WinAnsi）はリトアニア語のダイアクリティカルを持たないので
/// PDF内のテキストはASCII化した表記を使う。
pub fn render_invoice(
    invoice_no: &str,
    buyer: &Buyer,
    items: &[OrderItem],
    total: f64,
    issued_at: i64,
) -> Result<Vec<u8>> {
    let (doc, page, layer) = PdfDocument::new(
        format!("Saskaita {}", invoice_no),
        Mm(210.0),
        Mm(297.0),
        "Layer 1",
    );
    let font = doc.add_builtin_font(BuiltinFont::Helvetica)?;
    let bold = doc.add_builtin_font(BuiltinFont::HelveticaBold)?;
    let mut layer_ref = doc.get_page(page).get_layer(layer);

    let date = Utc
        .timestamp_opt(issued_at, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default();

    let mut y = 277.0;
    layer_ref.use_text("PVM SASKAITA-FAKTURA", 13.0, Mm(20.0), Mm(y), &bold);
    y -= 6.0;
    layer_ref.use_text(
        format!("Serija/NR: {}", invoice_no),
        10.0,
        Mm(20.0),
        Mm(y),
        &font,
    );
    y -= 5.0;
    layer_ref.use_text(format!("Data: {}", date), 10.0, Mm(20.0), Mm(y), &font);
    y -= 12.0;

    // 販売者 / 購入者を左右2カラムで
    layer_ref.use_text("Pardavejas:", 10.0, Mm(20.0), Mm(y), &bold);
    layer_ref.use_text("Pirkejas:", 10.0, Mm(110.0), Mm(y), &bold);
    y -= 5.0;
    layer_ref.use_text(ascii_fold(SELLER.name), 9.0, Mm(20.0), Mm(y), &font);
    layer_ref.use_text(ascii_fold(&buyer.name), 9.0, Mm(110.0), Mm(y), &font);
    y -= 4.5;
    layer_ref.use_text(ascii_fold(SELLER.addr), 9.0, Mm(20.0), Mm(y), &font);
    if !buyer.address.is_empty() {
        layer_ref.use_text(ascii_fold(&buyer.address), 9.0, Mm(110.0), Mm(y), &font);
    }
    y -= 4.5;
    layer_ref.use_text(
        format!("Imones kodas: {}", SELLER.company_code),
        9.0,
        Mm(20.0),
        Mm(y),
        &font,
    );
    if !buyer.company_code.is_empty() {
        layer_ref.use_text(
            format!("Imones kodas: {}", buyer.company_code),
            9.0,
            Mm(110.0),
            Mm(y),
            &font,
        );
    }
    y -= 4.5;
    layer_ref.use_text(
        format!("PVM mok. kodas: {}", SELLER.vat_code),
        9.0,
        Mm(20.0),
        Mm(y),
        &font,
    );
    if !buyer.vat_code.is_empty() {
        layer_ref.use_text(
            format!("PVM kodas: {}", buyer.vat_code),
            9.0,
            Mm(110.0),
            Mm(y),
            &font,
        );
    }
    y -= 4.5;
    if !buyer.email.is_empty() {
        layer_ref.use_text(
            format!("El. pastas: {}", ascii_fold(&buyer.email)),
            9.0,
            Mm(110.0),
            Mm(y),
            &font,
        );
    }
    y -= 12.0;

    layer_ref.use_text("Preke / paslauga", 10.0, Mm(20.0), Mm(y), &bold);
    layer_ref.use_text("Kaina su PVM", 10.0, Mm(160.0), Mm(y), &bold);
    y -= 7.0;

    for (i, item) in items.iter().enumerate() {
        if y < 30.0 {
            let (next_page, next_layer) = doc.add_page(Mm(210.0), Mm(297.0), "Layer 1");
            layer_ref = doc.get_page(next_page).get_layer(next_layer);
            y = 277.0;
        }
        layer_ref.use_text(
            format!("{}. {}", i + 1, ascii_fold(&item.name)),
            10.0,
            Mm(20.0),
            Mm(y),
            &font,
        );
        layer_ref.use_text(
            format!("{:.2} EUR", item.price),
            10.0,
            Mm(160.0),
            Mm(y),
            &font,
        );
        y -= 5.0;
        if !item.desc.is_empty() {
            layer_ref.use_text(ascii_fold(&item.desc), 8.0, Mm(25.0), Mm(y), &font);
            y -= 5.0;
        }
        y -= 2.0;
    }

    y -= 6.0;
    layer_ref.use_text(
        format!("Is viso su PVM: {:.2} EUR", total),
        11.0,
        Mm(130.0),
        Mm(y),
        &bold,
    );

    Ok(doc.save_to_bytes()?)
}

// 組み込みフォントで出せない文字を近いASCIIに落とす
fn ascii_fold(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{105}' | '\u{104}' => 'a', // ą
            '\u{10d}' | '\u{10c}' => 'c', // č
            '\u{119}' | '\u{118}' | '\u{117}' | '\u{116}' => 'e', // ę ė
            '\u{12f}' | '\u{12e}' => 'i', // į
            '\u{161}' | '\u{160}' => 's', // š
            '\u{173}' | '\u{172}' | '\u{16b}' | '\u{16a}' => 'u', // ų ū
            '\u{17e}' | '\u{17d}' => 'z', // ž
            '\u{201e}' | '\u{201c}' => '"',
            '\u{2013}' | '\u{2014}' => '-',
            c if c.is_ascii() => c,
            _ => '?',
        })
        .collect()
}
