//! Reconciliation Engine
//! Draft / Order の確定処理。Paysera コールバックと /thanks リターンの
//! どちらから（何度）呼ばれても、通知は一度しか送らない。

use crate::config::AppConfig;
use crate::invoice;
use crate::mailer::{self, Notifier};
use crate::models::{Draft, Order, OrderStatus};
use crate::store::{JsonStore, Result as StoreResult};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// finalize を起動した経路（ログとメール件名用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeTrigger {
    /// ゲートウェイからの署名付きコールバック
    Callback,
    /// ブラウザの /thanks リダイレクト（信頼しない、楽観的トリガーのみ）
    Return,
}

impl FinalizeTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalizeTrigger::Callback => "callback",
            FinalizeTrigger::Return => "return",
        }
    }
}

pub struct ReconcileEngine {
    drafts: Arc<JsonStore<Draft>>,
    orders: Arc<JsonStore<Order>>,
    notifier: Arc<dyn Notifier>,
    config: Arc<AppConfig>,
    /// finalize 全体を直列化するゲート。2経路の同時着火でも
    /// 「通知済みチェック → 通知 → 永続化」が交錯しない。
    gate: Mutex<()>,
}

impl ReconcileEngine {
    pub fn new(
        drafts: Arc<JsonStore<Draft>>,
        orders: Arc<JsonStore<Order>>,
        notifier: Arc<dyn Notifier>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            drafts,
            orders,
            notifier,
            config,
            gate: Mutex::new(()),
        }
    }

    /// 確定処理（冪等）。ID が Draft にあれば通知して削除、Order にあれば
    /// paid へ遷移して請求書番号を採番する。どちらにも無ければ false
    /// （エラーではない。重複・期限切れシグナルは正常系）。
    pub async fn finalize(&self, order_id: &str, trigger: FinalizeTrigger) -> StoreResult<bool> {
        let _gate = self.gate.lock().await;

        if let Some(draft) = self.drafts.get(order_id).await {
            return self.finalize_draft(order_id, draft, trigger).await;
        }
        if let Some(order) = self.orders.get(order_id).await {
            return self.finalize_order(order_id, order, trigger).await;
        }

        info!(
            "finalize: no record for order_id={} trigger={}",
            order_id,
            trigger.as_str()
        );
        Ok(false)
    }

    async fn finalize_draft(
        &self,
        order_id: &str,
        draft: Draft,
        trigger: FinalizeTrigger,
    ) -> StoreResult<bool> {
        if draft.emailed {
            // 既に通知済み: 掃除だけして成功扱い
            self.drafts.remove(order_id).await?;
            info!(
                "finalize: already emailed, cleanup order_id={} trigger={}",
                order_id,
                trigger.as_str()
            );
            return Ok(true);
        }

        let plan_label = draft.plan.as_str();
        mailer::dispatch(
            self.notifier.clone(),
            mailer::paid_request_admin_mail(
                order_id,
                plan_label,
                &draft.request,
                trigger.as_str(),
                &self.config,
            ),
        );
        if !draft.request.email.is_empty() {
            mailer::dispatch(
                self.notifier.clone(),
                mailer::paid_request_customer_mail(plan_label, &draft.request, &self.config),
            );
        }

        // emailed を先に永続化してから削除する。間でクラッシュしても
        // 次の finalize は重複シグナル扱いになり、再送は起きない。
        let mut done = draft;
        done.emailed = true;
        self.drafts.insert(order_id, done).await?;
        self.drafts.remove(order_id).await?;

        info!(
            "finalize: draft done order_id={} trigger={}",
            order_id,
            trigger.as_str()
        );
        Ok(true)
    }

    async fn finalize_order(
        &self,
        order_id: &str,
        mut order: Order,
        trigger: FinalizeTrigger,
    ) -> StoreResult<bool> {
        if order.status == OrderStatus::Paid {
            info!(
                "finalize: order already paid order_id={} trigger={}",
                order_id,
                trigger.as_str()
            );
            return Ok(true);
        }

        // 請求書番号は初回だけ採番。以後は再発行でも同じ番号を使う。
        if order.invoice_no.is_none() {
            order.invoice_no = Some(invoice::invoice_no(order_id, order.created_at));
        }
        let inv = order.invoice_no.clone().unwrap_or_default();

        // PDFが組めなくても確定自体は止めない
        let pdf = match invoice::render_invoice(
            &inv,
            &order.buyer,
            &order.items,
            order.total,
            Utc::now().timestamp(),
        ) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!("invoice render failed: order_id={} err={:#}", order_id, e);
                None
            }
        };

        mailer::dispatch(
            self.notifier.clone(),
            mailer::order_paid_admin_mail(order_id, &order, &inv, pdf.clone(), &self.config),
        );
        if !order.buyer.email.is_empty() {
            mailer::dispatch(
                self.notifier.clone(),
                mailer::order_paid_customer_mail(&order, &inv, pdf, &self.config),
            );
        }

        order.status = OrderStatus::Paid;
        self.orders.insert(order_id, order).await?;

        info!(
            "finalize: order paid order_id={} invoice={} trigger={}",
            order_id,
            inv,
            trigger.as_str()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailer::OutgoingMail;
    use crate::models::{Buyer, OrderItem, PartsRequest, Plan, RequestItem};
    use crate::paysera;
    use async_trait::async_trait;
    use std::time::Duration;

    /// 送信内容を貯めるだけのテスト用 Notifier
    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<OutgoingMail>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn deliver(&self, mail: OutgoingMail) -> anyhow::Result<()> {
            self.sent.lock().await.push(mail);
            Ok(())
        }
    }

    impl RecordingNotifier {
        async fn sent_to(&self, addr: &str) -> usize {
            self.sent
                .lock()
                .await
                .iter()
                .filter(|m| m.to == addr)
                .count()
        }

        async fn total(&self) -> usize {
            self.sent.lock().await.len()
        }
    }

    struct Harness {
        engine: ReconcileEngine,
        drafts: Arc<JsonStore<Draft>>,
        orders: Arc<JsonStore<Order>>,
        notifier: Arc<RecordingNotifier>,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let drafts = Arc::new(JsonStore::open(dir.path().join("drafts.json")).await);
        let orders = Arc::new(JsonStore::open(dir.path().join("orders.json")).await);
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = ReconcileEngine::new(
            drafts.clone(),
            orders.clone(),
            notifier.clone(),
            Arc::new(AppConfig::default()),
        );
        Harness {
            engine,
            drafts,
            orders,
            notifier,
            _dir: dir,
        }
    }

    fn draft(email: &str) -> Draft {
        Draft {
            plan: Plan::Standart,
            request: PartsRequest {
                vin: "VIN123".into(),
                make: "BMW".into(),
                model: "320d".into(),
                year: "2015".into(),
                comment: String::new(),
                name: "Jonas".into(),
                email: email.into(),
                phone: "+370".into(),
                items: vec![RequestItem {
                    idx: 1,
                    name: "Veidrodelis".into(),
                    desc: String::new(),
                    notes: String::new(),
                    image: None,
                }],
            },
            created_at: 1_700_000_000,
            emailed: false,
        }
    }

    fn order() -> Order {
        Order {
            offer_id: "OFFABC".into(),
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
        }
    }

    async fn settle() {
        // dispatch は tokio::spawn なので履歴が落ち着くまで少し待つ
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn finalize_draft_notifies_once_and_deletes() {
        let h = harness().await;
        h.drafts.insert("d1", draft("jonas@example.lt")).await.unwrap();

        assert!(h.engine.finalize("d1", FinalizeTrigger::Callback).await.unwrap());
        // 2回目は not-found の静かな no-op
        assert!(!h.engine.finalize("d1", FinalizeTrigger::Return).await.unwrap());
        settle().await;

        assert!(h.drafts.get("d1").await.is_none());
        let cfg = AppConfig::default();
        assert_eq!(h.notifier.sent_to(&cfg.admin_email).await, 1);
        assert_eq!(h.notifier.sent_to("jonas@example.lt").await, 1);
        assert_eq!(h.notifier.total().await, 2);
    }

    #[tokio::test]
    async fn finalize_draft_without_email_only_notifies_admin() {
        let h = harness().await;
        h.drafts.insert("d2", draft("")).await.unwrap();

        assert!(h.engine.finalize("d2", FinalizeTrigger::Callback).await.unwrap());
        settle().await;

        assert_eq!(h.notifier.total().await, 1);
    }

    #[tokio::test]
    async fn dual_trigger_race_sends_one_notification_set() {
        let h = harness().await;
        h.drafts.insert("d3", draft("jonas@example.lt")).await.unwrap();

        // コールバックとリターンが同時に来る
        let (a, b) = tokio::join!(
            h.engine.finalize("d3", FinalizeTrigger::Callback),
            h.engine.finalize("d3", FinalizeTrigger::Return),
        );
        settle().await;

        // 片方は実処理、片方は no-op。両方成功扱いか、遅い方は not-found。
        assert!(a.unwrap() || b.unwrap());
        assert!(h.drafts.get("d3").await.is_none());
        assert_eq!(h.notifier.total().await, 2);
    }

    #[tokio::test]
    async fn stale_emailed_draft_is_cleaned_up_without_resend() {
        let h = harness().await;
        let mut d = draft("jonas@example.lt");
        d.emailed = true; // 前回クラッシュで削除だけ漏れたケース
        h.drafts.insert("d4", d).await.unwrap();

        assert!(h.engine.finalize("d4", FinalizeTrigger::Callback).await.unwrap());
        settle().await;

        assert!(h.drafts.get("d4").await.is_none());
        assert_eq!(h.notifier.total().await, 0);
    }

    #[tokio::test]
    async fn unknown_id_is_quiet_noop() {
        let h = harness().await;
        assert!(!h.engine.finalize("missing", FinalizeTrigger::Callback).await.unwrap());
        settle().await;
        assert_eq!(h.notifier.total().await, 0);
        assert_eq!(h.drafts.len().await, 0);
        assert_eq!(h.orders.len().await, 0);
    }

    #[tokio::test]
    async fn order_finalize_is_monotonic_and_keeps_invoice_no() {
        let h = harness().await;
        h.orders.insert("o1", order()).await.unwrap();

        assert!(h.engine.finalize("o1", FinalizeTrigger::Callback).await.unwrap());
        settle().await;

        let paid = h.orders.get("o1").await.unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        let inv = paid.invoice_no.clone().unwrap();
        assert_eq!(inv, "RD-2023-O1");
        assert_eq!(h.notifier.total().await, 2);

        // 2回目は no-op: 通知も番号も増えない
        assert!(h.engine.finalize("o1", FinalizeTrigger::Return).await.unwrap());
        settle().await;
        let again = h.orders.get("o1").await.unwrap();
        assert_eq!(again.invoice_no.unwrap(), inv);
        assert_eq!(again.status, OrderStatus::Paid);
        assert_eq!(h.notifier.total().await, 2);
    }

    #[tokio::test]
    async fn end_to_end_standart_flow() {
        let h = harness().await;

        // 1) フォーム送信相当: Standart プランの draft を作成
        let order_id = uuid::Uuid::new_v4().to_string();
        h.drafts.insert(&order_id, draft("jonas@example.lt")).await.unwrap();

        // 2) 支払いリクエストが組める（リダイレクトURLに orderid が入る）
        let signed = paysera::build_request(
            &paysera::PaymentParams {
                orderid: order_id.clone(),
                amount_cents: Plan::Standart.amount_cents(),
                currency: "EUR".into(),
                accepturl: "https://api.example.lt/thanks?ok=1".into(),
                cancelurl: "https://api.example.lt/thanks?ok=0".into(),
                callbackurl: "https://api.example.lt/api/paysera/callback".into(),
                test: true,
            },
            "12345",
            "secret",
        );
        assert!(paysera::decode_payload(&signed.data)
            .unwrap()
            .get("orderid")
            .is_some_and(|v| v == &order_id));

        // 3) ゲートウェイが署名付きで status=1 をコールバック
        let query = format!(
            "projectid=12345&orderid={}&status=1",
            urlencoding::encode(&order_id)
        );
        let data = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, query);
        let sign = {
            // 正しい鍵で署名されたコールバックだけが通る
            use md5::{Digest, Md5};
            let mut hasher = Md5::new();
            hasher.update(data.as_bytes());
            hasher.update(b"secret");
            hex::encode(hasher.finalize())
        };
        assert!(paysera::verify_callback(&data, &sign, "secret"));
        assert!(!paysera::verify_callback(&data, &sign, "wrong"));

        let payload = paysera::decode_payload(&data).unwrap();
        assert_eq!(payload.get("status").map(String::as_str), Some("1"));

        // 4) finalize: draft が消え、管理者1通 + 顧客1通
        assert!(h
            .engine
            .finalize(payload.get("orderid").unwrap(), FinalizeTrigger::Callback)
            .await
            .unwrap());
        settle().await;

        assert!(h.drafts.get(&order_id).await.is_none());
        let cfg = AppConfig::default();
        assert_eq!(h.notifier.sent_to(&cfg.admin_email).await, 1);
        assert_eq!(h.notifier.sent_to("jonas@example.lt").await, 1);
    }
}
