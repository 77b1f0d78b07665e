//! Order, payment and refund state machines.
//!
//! Every transition happens inside a single write transaction that re-reads
//! the affected rows, verifies the current status is a permitted
//! predecessor, writes the new state, and appends outbox rows. Authorizer
//! calls always complete before the transaction opens; no transaction is
//! held across outbound I/O.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redb::ReadableTable;
use serde_json::json;
use tracing::instrument;

use crate::dispatcher;
use crate::gateway::authorizer::{AuthorizeRequest, Outcome};
use crate::gateway::errors::GatewayError;
use crate::gateway::fraud::{self, Attempt, History, PriorPayment};
use crate::gateway::refs;
use crate::gateway::Gateway;
use crate::store::models::{
    IdempotencyRecord, Merchant, Order, OrderStatus, Payment, PaymentMethod, PaymentStatus,
    Refund, RefundStatus,
};
use crate::store::{self, tables};

pub const SUPPORTED_CURRENCIES: &[&str] = &["INR", "USD", "EUR"];
/// `notes` is an opaque string, capped at 4 KiB.
pub const NOTES_LIMIT: usize = 4096;

#[derive(Debug, Clone)]
pub struct CreateOrder {
    pub amount: i64,
    pub currency: String,
    pub receipt: Option<String>,
    pub notes: Option<String>,
    pub auto_capture: bool,
    pub idempotency_key: Option<String>,
}

/// Create an order, or replay the stored one when the idempotency key was
/// seen before with an identical body. Returns the order and whether it was
/// a replay.
#[instrument(skip(gw, req))]
pub fn create_order(
    gw: &Gateway,
    merchant_id: u64,
    req: CreateOrder,
) -> Result<(Order, bool), GatewayError> {
    if req.amount <= 0 {
        return Err(GatewayError::validation("amount must be greater than 0 minor units"));
    }
    if !SUPPORTED_CURRENCIES.contains(&req.currency.as_str()) {
        return Err(GatewayError::validation("unsupported currency, use INR, USD or EUR"));
    }
    if req.notes.as_deref().map(|n| n.len() > NOTES_LIMIT).unwrap_or(false) {
        return Err(GatewayError::validation("notes must not exceed 4096 bytes"));
    }

    let key = req
        .idempotency_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .unwrap_or_else(refs::idempotency_key);
    let fingerprint = refs::body_fingerprint(&[
        &req.amount.to_string(),
        &req.currency,
        req.receipt.as_deref().unwrap_or(""),
        req.notes.as_deref().unwrap_or(""),
        if req.auto_capture { "1" } else { "0" },
    ]);
    let idem_key = format!("{merchant_id}:{key}");
    let now = Utc::now();
    let expires_at = now
        + ChronoDuration::from_std(gw.settings.order_ttl)
            .unwrap_or_else(|_| ChronoDuration::minutes(30));

    let wtx = gw.store.begin_write()?;
    let mut created: Option<Order> = None;
    let mut replayed: Option<Order> = None;
    {
        let mut idem = wtx.open_table(tables::ORDER_IDEMPOTENCY)?;
        match store::get_doc::<&str, IdempotencyRecord>(&idem, idem_key.as_str())? {
            Some(record) => {
                if record.fingerprint != fingerprint {
                    return Err(GatewayError::conflict(
                        "idempotency key was already used with a different body",
                    ));
                }
                let orders = wtx.open_table(tables::ORDERS)?;
                let order: Order = store::get_doc(&orders, record.order_ref.as_str())?
                    .ok_or_else(|| GatewayError::internal("idempotency record without order"))?;
                replayed = Some(order);
            }
            None => {
                let order = Order {
                    order_ref: refs::order_ref(),
                    merchant_id,
                    amount: req.amount,
                    currency: req.currency.clone(),
                    receipt: req.receipt.clone(),
                    notes: req.notes.clone(),
                    status: OrderStatus::Created,
                    attempts: 0,
                    auto_capture: req.auto_capture,
                    expires_at: Some(expires_at),
                    created_at: now,
                };
                let mut orders = wtx.open_table(tables::ORDERS)?;
                store::put_doc(&mut orders, order.order_ref.as_str(), &order)?;
                let mut by_merchant = wtx.open_multimap_table(tables::ORDERS_BY_MERCHANT)?;
                by_merchant.insert(merchant_id, order.order_ref.as_str())?;
                store::put_doc(
                    &mut idem,
                    idem_key.as_str(),
                    &IdempotencyRecord { order_ref: order.order_ref.clone(), fingerprint },
                )?;
                created = Some(order);
            }
        }
    }

    if let Some(order) = replayed {
        // Nothing was written; the transaction is dropped.
        return Ok((order, true));
    }
    wtx.commit()?;
    Ok((created.expect("order created"), false))
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct CheckoutRequest {
    pub method: String,
    pub vpa: Option<String>,
    pub card_number: Option<String>,
    pub card_expiry: Option<String>,
    pub card_cvv: Option<String>,
    pub card_name: Option<String>,
    pub email: Option<String>,
    pub contact: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn valid_expiry(raw: &str) -> bool {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.len() == 4 && matches!(digits[..2].parse::<u8>(), Ok(1..=12))
}

/// Mask a card number down to its last four digits and detect the network
/// from the leading digit. CVV and expiry never leave the request.
fn mask_card(number: &str) -> Option<(String, String)> {
    let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return None;
    }
    let network = match digits.as_bytes()[0] {
        b'4' => "Visa",
        b'5' => "Mastercard",
        b'6' => "RuPay",
        b'3' => "Amex",
        _ => "Unknown",
    };
    Some((digits[digits.len() - 4..].to_string(), network.to_string()))
}

/// Submit a payment from the hosted checkout.
///
/// Fraud evaluation and the authorizer call happen before the write
/// transaction. Inside the transaction the order status and the absence of
/// a competing non-failed payment are re-checked, so two concurrent
/// submissions serialize and the loser gets a conflict.
#[instrument(skip(gw, req))]
pub async fn submit_payment(
    gw: &Gateway,
    order_ref: &str,
    req: CheckoutRequest,
) -> Result<Payment, GatewayError> {
    let method = PaymentMethod::parse(&req.method.to_lowercase())
        .ok_or_else(|| GatewayError::validation("invalid method, choose upi, card, netbanking or wallet"))?;

    let vpa = non_empty(req.vpa);
    let email = non_empty(req.email);
    let contact = non_empty(req.contact);
    let card_name = non_empty(req.card_name);
    let card = non_empty(req.card_number).as_deref().and_then(mask_card);
    if method == PaymentMethod::Card {
        if card.is_none() {
            return Err(GatewayError::validation("card_number is required for method card"));
        }
        if let Some(cvv) = non_empty(req.card_cvv) {
            if !(3..=4).contains(&cvv.len()) || !cvv.chars().all(|c| c.is_ascii_digit()) {
                return Err(GatewayError::validation("card_cvv must be 3 or 4 digits"));
            }
        }
        if let Some(expiry) = non_empty(req.card_expiry) {
            if !valid_expiry(&expiry) {
                return Err(GatewayError::validation("card_expiry must look like MM/YY"));
            }
        }
    }
    let (card_last4, card_network) = match card {
        Some((last4, network)) => (Some(last4), Some(network)),
        None => (None, None),
    };

    let now = Utc::now();
    let payer = fraud::payer_key(
        method,
        vpa.as_deref(),
        email.as_deref(),
        contact.as_deref(),
        card_name.as_deref(),
        card_last4.as_deref(),
    );

    // Pre-checks and fraud history, outside any write transaction.
    let order = {
        let rtx = gw.store.begin_read()?;
        let orders = rtx.open_table(tables::ORDERS)?;
        let order: Order =
            store::get_doc(&orders, order_ref)?.ok_or(GatewayError::NotFound("order"))?;
        if order.status == OrderStatus::Paid {
            return Err(GatewayError::conflict("order is already paid"));
        }
        order
    };

    let history = {
        let rtx = gw.store.begin_read()?;
        let by_payer = rtx.open_multimap_table(tables::PAYMENTS_BY_PAYER)?;
        let payments = rtx.open_table(tables::PAYMENTS)?;
        let mut prior = Vec::new();
        for pref in store::str_refs(&by_payer, payer.as_str())? {
            if let Some(p) = store::get_doc::<&str, Payment>(&payments, pref.as_str())? {
                prior.push(PriorPayment { amount: p.amount, created_at: p.created_at });
            }
        }
        History::within_window(prior, now)
    };

    let attempt = Attempt { amount: order.amount, method, vpa: vpa.as_deref() };
    let (is_flagged, fraud_rules) = fraud::evaluate(&attempt, &history);

    // Authorization completes before the transaction opens.
    let outcome = gw
        .authorizer
        .authorize(AuthorizeRequest {
            amount: order.amount,
            currency: &order.currency,
            method,
            is_flagged,
        })
        .await;

    let now = Utc::now();
    let wtx = gw.store.begin_write()?;
    let mut queued = false;
    let mut expired = false;
    let mut result: Option<Payment> = None;
    {
        let mut orders = wtx.open_table(tables::ORDERS)?;
        let mut order: Order =
            store::get_doc(&orders, order_ref)?.ok_or(GatewayError::NotFound("order"))?;
        match order.status {
            OrderStatus::Paid => return Err(GatewayError::conflict("order is already paid")),
            OrderStatus::Expired => return Err(GatewayError::conflict("order has expired")),
            OrderStatus::Created | OrderStatus::Attempted => {}
        }
        if order.expires_at.map(|exp| exp < now).unwrap_or(false) {
            order.status = OrderStatus::Expired;
            store::put_doc(&mut orders, order_ref, &order)?;
            expired = true;
        } else {
            let mut by_order = wtx.open_multimap_table(tables::PAYMENTS_BY_ORDER)?;
            let mut payments = wtx.open_table(tables::PAYMENTS)?;
            for pref in store::str_refs(&by_order, order_ref)? {
                if let Some(p) = store::get_doc::<&str, Payment>(&payments, pref.as_str())? {
                    if p.status.occupies_order() {
                        return Err(GatewayError::conflict(
                            "order already has an active payment",
                        ));
                    }
                }
            }

            let (status, error_code, error_reason, captured_at) = match &outcome {
                Outcome::Approved => {
                    if order.auto_capture {
                        (PaymentStatus::Captured, None, None, Some(now))
                    } else {
                        (PaymentStatus::Authorized, None, None, None)
                    }
                }
                Outcome::Declined { code, reason } => (
                    PaymentStatus::Failed,
                    Some(code.clone()),
                    Some(reason.clone()),
                    None,
                ),
            };

            let payment = Payment {
                payment_ref: refs::payment_ref(),
                order_ref: order_ref.to_string(),
                merchant_id: order.merchant_id,
                amount: order.amount,
                currency: order.currency.clone(),
                method,
                status,
                vpa,
                card_last4,
                card_network,
                card_name,
                email,
                contact,
                payer_key: payer.clone(),
                is_flagged,
                fraud_rules,
                error_code,
                error_reason,
                captured_at,
                created_at: now,
            };
            store::put_doc(&mut payments, payment.payment_ref.as_str(), &payment)?;
            by_order.insert(order_ref, payment.payment_ref.as_str())?;
            let mut by_payer = wtx.open_multimap_table(tables::PAYMENTS_BY_PAYER)?;
            by_payer.insert(payer.as_str(), payment.payment_ref.as_str())?;

            order.attempts += 1;
            order.status = if status == PaymentStatus::Captured {
                OrderStatus::Paid
            } else {
                OrderStatus::Attempted
            };
            store::put_doc(&mut orders, order_ref, &order)?;

            let merchants = wtx.open_table(tables::MERCHANTS)?;
            if let Some(merchant) =
                store::get_doc::<u64, Merchant>(&merchants, order.merchant_id)?
            {
                queued = enqueue_payment_events(&wtx, &merchant, &order, &payment, now)?;
            }
            result = Some(payment);
        }
    }
    wtx.commit()?;
    if queued {
        gw.outbox_wake.notify_waiters();
    }
    if expired {
        return Err(GatewayError::conflict("order has expired"));
    }
    Ok(result.expect("payment recorded"))
}

fn enqueue_payment_events(
    wtx: &redb::WriteTransaction,
    merchant: &Merchant,
    order: &Order,
    payment: &Payment,
    now: DateTime<Utc>,
) -> Result<bool, GatewayError> {
    let mut queued = false;
    match payment.status {
        PaymentStatus::Captured => {
            queued |= dispatcher::enqueue(
                wtx,
                merchant,
                "payment.captured",
                json!({
                    "payment_ref": payment.payment_ref,
                    "order_ref": order.order_ref,
                    "amount": payment.amount,
                    "currency": payment.currency,
                    "method": payment.method.as_str(),
                    "status": payment.status.as_str(),
                }),
                now,
            )?;
            queued |= dispatcher::enqueue(
                wtx,
                merchant,
                "order.paid",
                json!({
                    "order_ref": order.order_ref,
                    "amount": order.amount,
                    "currency": order.currency,
                    "receipt": order.receipt,
                }),
                now,
            )?;
        }
        PaymentStatus::Failed => {
            queued |= dispatcher::enqueue(
                wtx,
                merchant,
                "payment.failed",
                json!({
                    "payment_ref": payment.payment_ref,
                    "order_ref": order.order_ref,
                    "amount": payment.amount,
                    "method": payment.method.as_str(),
                    "error_code": payment.error_code,
                    "error_reason": payment.error_reason,
                }),
                now,
            )?;
        }
        _ => {}
    }
    Ok(queued)
}

/// Capture an authorized payment. Capturing an already-captured payment is
/// a no-op returning the stored row.
#[instrument(skip(gw))]
pub fn capture_payment(
    gw: &Gateway,
    merchant_id: u64,
    payment_ref: &str,
) -> Result<Payment, GatewayError> {
    let now = Utc::now();
    let wtx = gw.store.begin_write()?;
    let mut queued = false;
    let mut captured: Option<Payment> = None;
    let mut replayed: Option<Payment> = None;
    {
        let mut payments = wtx.open_table(tables::PAYMENTS)?;
        let mut payment: Payment =
            store::get_doc(&payments, payment_ref)?.ok_or(GatewayError::NotFound("payment"))?;
        if payment.merchant_id != merchant_id {
            return Err(GatewayError::NotFound("payment"));
        }
        match payment.status {
            PaymentStatus::Captured => {
                replayed = Some(payment);
            }
            PaymentStatus::Authorized => {
                payment.status = PaymentStatus::Captured;
                payment.captured_at = Some(now);
                store::put_doc(&mut payments, payment_ref, &payment)?;

                let mut orders = wtx.open_table(tables::ORDERS)?;
                let mut order: Order = store::get_doc(&orders, payment.order_ref.as_str())?
                    .ok_or_else(|| GatewayError::internal("payment without order"))?;
                order.status = OrderStatus::Paid;
                store::put_doc(&mut orders, payment.order_ref.as_str(), &order)?;

                let merchants = wtx.open_table(tables::MERCHANTS)?;
                if let Some(merchant) =
                    store::get_doc::<u64, Merchant>(&merchants, payment.merchant_id)?
                {
                    queued = enqueue_payment_events(&wtx, &merchant, &order, &payment, now)?;
                }
                captured = Some(payment);
            }
            other => {
                return Err(GatewayError::conflict(format!(
                    "cannot capture payment in status '{}'",
                    other.as_str()
                )));
            }
        }
    }

    if let Some(payment) = replayed {
        return Ok(payment);
    }
    wtx.commit()?;
    if queued {
        gw.outbox_wake.notify_waiters();
    }
    Ok(captured.expect("payment captured"))
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(default)]
pub struct RefundRequest {
    /// None refunds whatever remains.
    pub amount: Option<i64>,
    pub reason: Option<String>,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
}

/// Refund a captured payment, fully or partially. The refundable balance is
/// re-derived inside the write transaction from the processed refund rows.
#[instrument(skip(gw, req))]
pub async fn create_refund(
    gw: &Gateway,
    merchant_id: u64,
    payment_ref: &str,
    req: RefundRequest,
) -> Result<(Refund, bool), GatewayError> {
    if req.notes.as_deref().map(|n| n.len() > NOTES_LIMIT).unwrap_or(false) {
        return Err(GatewayError::validation("notes must not exceed 4096 bytes"));
    }
    if req.amount.map(|a| a <= 0).unwrap_or(false) {
        return Err(GatewayError::validation("refund amount must be greater than 0"));
    }

    // Pre-check ownership and refundability before paying for the
    // authorizer round-trip.
    let requested = {
        let rtx = gw.store.begin_read()?;
        let payments = rtx.open_table(tables::PAYMENTS)?;
        let payment: Payment =
            store::get_doc(&payments, payment_ref)?.ok_or(GatewayError::NotFound("payment"))?;
        if payment.merchant_id != merchant_id {
            return Err(GatewayError::NotFound("payment"));
        }
        if !payment.status.refundable() {
            return Err(GatewayError::conflict(format!(
                "cannot refund payment in status '{}'",
                payment.status.as_str()
            )));
        }
        let already = refunded_total(&rtx, payment_ref)?;
        req.amount.unwrap_or(payment.amount - already)
    };

    let idem_key = req
        .idempotency_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .map(|k| format!("{payment_ref}:{k}"));

    let outcome = gw.authorizer.refund(requested).await;

    let now = Utc::now();
    let wtx = gw.store.begin_write()?;
    let mut queued = false;
    let mut created: Option<Refund> = None;
    let mut replayed: Option<Refund> = None;
    {
        let refunds_table = wtx.open_table(tables::REFUNDS)?;
        if let Some(key) = idem_key.as_deref() {
            let idem = wtx.open_table(tables::REFUND_IDEMPOTENCY)?;
            let existing_ref = idem.get(key)?.map(|guard| guard.value().to_string());
            if let Some(existing_ref) = existing_ref {
                let existing: Refund = store::get_doc(&refunds_table, existing_ref.as_str())?
                    .ok_or_else(|| GatewayError::internal("refund idempotency without row"))?;
                replayed = Some(existing);
            }
        }
        drop(refunds_table);

        if replayed.is_none() {
            let mut payments = wtx.open_table(tables::PAYMENTS)?;
            let mut payment: Payment = store::get_doc(&payments, payment_ref)?
                .ok_or(GatewayError::NotFound("payment"))?;
            if !payment.status.refundable() {
                return Err(GatewayError::conflict(format!(
                    "cannot refund payment in status '{}'",
                    payment.status.as_str()
                )));
            }

            // Re-derive the balance inside the transaction.
            let already = refunded_total_write(&wtx, payment_ref)?;
            let remaining = payment.amount - already;
            let amount = req.amount.unwrap_or(remaining);
            if amount > remaining {
                return Err(GatewayError::conflict(format!(
                    "refund amount {amount} exceeds refundable amount {remaining}"
                )));
            }

            let status = match &outcome {
                Outcome::Approved => RefundStatus::Processed,
                Outcome::Declined { .. } => RefundStatus::Failed,
            };
            let refund = Refund {
                refund_ref: refs::refund_ref(),
                payment_ref: payment_ref.to_string(),
                amount,
                reason: req.reason.clone(),
                notes: req.notes.clone(),
                status,
                idempotency_key: req.idempotency_key.clone(),
                created_at: now,
            };

            let mut refunds = wtx.open_table(tables::REFUNDS)?;
            store::put_doc(&mut refunds, refund.refund_ref.as_str(), &refund)?;
            let mut by_payment = wtx.open_multimap_table(tables::REFUNDS_BY_PAYMENT)?;
            by_payment.insert(payment_ref, refund.refund_ref.as_str())?;
            if let Some(key) = idem_key.as_deref() {
                let mut idem = wtx.open_table(tables::REFUND_IDEMPOTENCY)?;
                idem.insert(key, refund.refund_ref.as_str())?;
            }

            if status == RefundStatus::Processed {
                payment.status = if already + amount >= payment.amount {
                    PaymentStatus::Refunded
                } else {
                    PaymentStatus::PartiallyRefunded
                };
                store::put_doc(&mut payments, payment_ref, &payment)?;

                let merchants = wtx.open_table(tables::MERCHANTS)?;
                if let Some(merchant) =
                    store::get_doc::<u64, Merchant>(&merchants, payment.merchant_id)?
                {
                    queued = dispatcher::enqueue(
                        &wtx,
                        &merchant,
                        "refund.processed",
                        json!({
                            "refund_ref": refund.refund_ref,
                            "payment_ref": payment.payment_ref,
                            "order_ref": payment.order_ref,
                            "amount": refund.amount,
                            "status": "processed",
                        }),
                        now,
                    )?;
                }
            }
            created = Some(refund);
        }
    }

    if let Some(refund) = replayed {
        return Ok((refund, true));
    }
    wtx.commit()?;
    if queued {
        gw.outbox_wake.notify_waiters();
    }
    Ok((created.expect("refund recorded"), false))
}

/// Sum of processed refunds for a payment (read transaction).
pub fn refunded_total(
    rtx: &redb::ReadTransaction,
    payment_ref: &str,
) -> Result<i64, GatewayError> {
    let by_payment = rtx.open_multimap_table(tables::REFUNDS_BY_PAYMENT)?;
    let refunds = rtx.open_table(tables::REFUNDS)?;
    sum_processed(&by_payment, &refunds, payment_ref)
}

fn refunded_total_write(
    wtx: &redb::WriteTransaction,
    payment_ref: &str,
) -> Result<i64, GatewayError> {
    let by_payment = wtx.open_multimap_table(tables::REFUNDS_BY_PAYMENT)?;
    let refunds = wtx.open_table(tables::REFUNDS)?;
    sum_processed(&by_payment, &refunds, payment_ref)
}

fn sum_processed(
    by_payment: &impl redb::ReadableMultimapTable<&'static str, &'static str>,
    refunds: &impl redb::ReadableTable<&'static str, &'static [u8]>,
    payment_ref: &str,
) -> Result<i64, GatewayError> {
    let mut total = 0i64;
    for refund_ref in store::str_refs(by_payment, payment_ref)? {
        if let Some(refund) = store::get_doc::<&str, Refund>(refunds, refund_ref.as_str())? {
            if refund.status == RefundStatus::Processed {
                total += refund.amount;
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::gateway::authorizer::{Authorizer, StaticAuthorizer};
    use crate::store::models::WebhookEvent;

    fn gateway(authorizer: StaticAuthorizer) -> Arc<Gateway> {
        Gateway::for_tests(Arc::new(authorizer) as Arc<dyn Authorizer>)
    }

    fn seed_merchant(gw: &Gateway, id: u64) -> Merchant {
        let merchant = Merchant {
            id,
            user_id: id,
            business_name: "Acme Books".to_string(),
            business_email: format!("ops{id}@acme.test"),
            website: None,
            webhook_url: Some("https://merchant.test/hooks".to_string()),
            webhook_secret: refs::webhook_secret(),
            active: true,
            created_at: Utc::now(),
        };
        let wtx = gw.store.begin_write().unwrap();
        {
            let mut merchants = wtx.open_table(tables::MERCHANTS).unwrap();
            store::put_doc_id(&mut merchants, id, &merchant).unwrap();
            let mut by_user = wtx.open_table(tables::MERCHANTS_BY_USER).unwrap();
            by_user.insert(id, id).unwrap();
        }
        wtx.commit().unwrap();
        merchant
    }

    fn order_req(amount: i64) -> CreateOrder {
        CreateOrder {
            amount,
            currency: "INR".to_string(),
            receipt: Some("rcpt-42".to_string()),
            notes: None,
            auto_capture: true,
            idempotency_key: None,
        }
    }

    fn upi_checkout(vpa: &str) -> CheckoutRequest {
        CheckoutRequest {
            method: "upi".to_string(),
            vpa: Some(vpa.to_string()),
            ..Default::default()
        }
    }

    fn outbox_events(gw: &Gateway) -> Vec<WebhookEvent> {
        let rtx = gw.store.begin_read().unwrap();
        let outbox = rtx.open_table(tables::OUTBOX).unwrap();
        let mut out = Vec::new();
        for entry in outbox.iter().unwrap() {
            let (_, value) = entry.unwrap();
            out.push(serde_json::from_slice(value.value()).unwrap());
        }
        out
    }

    fn load_order(gw: &Gateway, order_ref: &str) -> Order {
        let rtx = gw.store.begin_read().unwrap();
        let orders = rtx.open_table(tables::ORDERS).unwrap();
        store::get_doc(&orders, order_ref).unwrap().unwrap()
    }

    #[tokio::test]
    async fn upi_happy_path_captures_and_pays() {
        let gw = gateway(StaticAuthorizer::approving());
        seed_merchant(&gw, 1);
        let (order, _) = create_order(&gw, 1, order_req(49_900)).unwrap();
        assert_eq!(order.status, OrderStatus::Created);

        let payment = submit_payment(&gw, &order.order_ref, upi_checkout("user@upi"))
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Captured);
        assert!(!payment.is_flagged);
        assert_eq!(payment.amount, 49_900);

        let order = load_order(&gw, &order.order_ref);
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.attempts, 1);

        let mut events: Vec<String> =
            outbox_events(&gw).into_iter().map(|e| e.event).collect();
        events.sort();
        assert_eq!(events, vec!["order.paid", "payment.captured"]);
    }

    #[tokio::test]
    async fn high_value_payment_is_flagged_but_still_captures() {
        let gw = gateway(StaticAuthorizer::approving());
        seed_merchant(&gw, 1);
        let (order, _) = create_order(&gw, 1, order_req(75_000)).unwrap();

        let payment = submit_payment(&gw, &order.order_ref, upi_checkout("user@upi"))
            .await
            .unwrap();
        assert!(payment.is_flagged);
        assert!(payment.fraud_rules.contains(&"high_value".to_string()));
        assert_eq!(payment.status, PaymentStatus::Captured);
        assert_eq!(load_order(&gw, &order.order_ref).status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn repeat_amount_by_same_payer_is_flagged() {
        let gw = gateway(StaticAuthorizer::approving());
        seed_merchant(&gw, 1);
        let (first, _) = create_order(&gw, 1, order_req(1_000)).unwrap();
        let (second, _) = create_order(&gw, 1, order_req(1_000)).unwrap();

        let p1 = submit_payment(&gw, &first.order_ref, upi_checkout("same@upi"))
            .await
            .unwrap();
        assert!(!p1.is_flagged);

        let p2 = submit_payment(&gw, &second.order_ref, upi_checkout("same@upi"))
            .await
            .unwrap();
        assert!(p2.is_flagged);
        assert!(p2.fraud_rules.contains(&"duplicate_amount".to_string()));
    }

    #[tokio::test]
    async fn partial_then_full_refund_then_conflict() {
        let gw = gateway(StaticAuthorizer::approving());
        seed_merchant(&gw, 1);
        let (order, _) = create_order(&gw, 1, order_req(20_000)).unwrap();
        let payment = submit_payment(&gw, &order.order_ref, upi_checkout("user@upi"))
            .await
            .unwrap();

        let (refund, _) = create_refund(
            &gw,
            1,
            &payment.payment_ref,
            RefundRequest { amount: Some(5_000), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(refund.status, RefundStatus::Processed);
        let payment_now =
            crate::gateway::queries::payment_for_merchant(&gw.store, 1, &payment.payment_ref)
                .unwrap();
        assert_eq!(payment_now.status, PaymentStatus::PartiallyRefunded);

        let (refund, _) = create_refund(
            &gw,
            1,
            &payment.payment_ref,
            RefundRequest { amount: Some(15_000), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(refund.amount, 15_000);
        let payment_now =
            crate::gateway::queries::payment_for_merchant(&gw.store, 1, &payment.payment_ref)
                .unwrap();
        assert_eq!(payment_now.status, PaymentStatus::Refunded);

        let err = create_refund(
            &gw,
            1,
            &payment.payment_ref,
            RefundRequest { amount: Some(1), ..Default::default() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn order_create_is_idempotent_per_key() {
        let gw = gateway(StaticAuthorizer::approving());
        seed_merchant(&gw, 1);
        let mut req = order_req(5_000);
        req.idempotency_key = Some("abc".to_string());

        let (first, replayed) = create_order(&gw, 1, req.clone()).unwrap();
        assert!(!replayed);
        let (second, replayed) = create_order(&gw, 1, req.clone()).unwrap();
        assert!(replayed);
        assert_eq!(first.order_ref, second.order_ref);

        // Exactly one row exists.
        let orders = crate::gateway::queries::list_orders(&gw.store, 1).unwrap();
        assert_eq!(orders.len(), 1);

        // Same key, different body: conflict.
        req.amount = 6_000;
        let err = create_order(&gw, 1, req).unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));

        // A different merchant may reuse the key freely.
        seed_merchant(&gw, 2);
        let mut other = order_req(5_000);
        other.idempotency_key = Some("abc".to_string());
        let (_, replayed) = create_order(&gw, 2, other).unwrap();
        assert!(!replayed);
    }

    #[tokio::test]
    async fn declined_payment_fails_and_order_stays_retryable() {
        let gw = gateway(StaticAuthorizer::declining());
        seed_merchant(&gw, 1);
        let (order, _) = create_order(&gw, 1, order_req(2_500)).unwrap();

        let payment = submit_payment(&gw, &order.order_ref, upi_checkout("user@upi"))
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.error_code.as_deref(), Some("payment_declined"));

        let order_now = load_order(&gw, &order.order_ref);
        assert_eq!(order_now.status, OrderStatus::Attempted);

        // A failed payment does not occupy the order.
        let payment = submit_payment(&gw, &order.order_ref, upi_checkout("user@upi"))
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(load_order(&gw, &order.order_ref).attempts, 2);

        let events: Vec<String> = outbox_events(&gw).into_iter().map(|e| e.event).collect();
        assert_eq!(events, vec!["payment.failed", "payment.failed"]);
    }

    #[tokio::test]
    async fn paid_order_rejects_further_payments() {
        let gw = gateway(StaticAuthorizer::approving());
        seed_merchant(&gw, 1);
        let (order, _) = create_order(&gw, 1, order_req(1_500)).unwrap();
        submit_payment(&gw, &order.order_ref, upi_checkout("user@upi"))
            .await
            .unwrap();

        let err = submit_payment(&gw, &order.order_ref, upi_checkout("user@upi"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
    }

    #[tokio::test]
    async fn manual_capture_flow_and_double_capture_noop() {
        let gw = gateway(StaticAuthorizer::approving());
        seed_merchant(&gw, 1);
        let mut req = order_req(9_000);
        req.auto_capture = false;
        let (order, _) = create_order(&gw, 1, req).unwrap();

        let payment = submit_payment(&gw, &order.order_ref, upi_checkout("user@upi"))
            .await
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Authorized);
        assert_eq!(load_order(&gw, &order.order_ref).status, OrderStatus::Attempted);
        // No capture event yet.
        assert!(outbox_events(&gw).is_empty());

        let captured = capture_payment(&gw, 1, &payment.payment_ref).unwrap();
        assert_eq!(captured.status, PaymentStatus::Captured);
        assert_eq!(load_order(&gw, &order.order_ref).status, OrderStatus::Paid);
        let mut events: Vec<String> =
            outbox_events(&gw).into_iter().map(|e| e.event).collect();
        events.sort();
        assert_eq!(events, vec!["order.paid", "payment.captured"]);

        // Double capture returns the same resource and emits nothing new.
        let again = capture_payment(&gw, 1, &payment.payment_ref).unwrap();
        assert_eq!(again.payment_ref, captured.payment_ref);
        assert_eq!(outbox_events(&gw).len(), 2);

        // A foreign merchant cannot see the payment.
        let err = capture_payment(&gw, 2, &payment.payment_ref).unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn refund_idempotency_key_sums_only_once() {
        let gw = gateway(StaticAuthorizer::approving());
        seed_merchant(&gw, 1);
        let (order, _) = create_order(&gw, 1, order_req(10_000)).unwrap();
        let payment = submit_payment(&gw, &order.order_ref, upi_checkout("user@upi"))
            .await
            .unwrap();

        let req = RefundRequest {
            amount: Some(4_000),
            idempotency_key: Some("rf-1".to_string()),
            ..Default::default()
        };
        let (first, replayed) = create_refund(&gw, 1, &payment.payment_ref, req.clone())
            .await
            .unwrap();
        assert!(!replayed);
        let (second, replayed) = create_refund(&gw, 1, &payment.payment_ref, req)
            .await
            .unwrap();
        assert!(replayed);
        assert_eq!(first.refund_ref, second.refund_ref);

        let rtx = gw.store.begin_read().unwrap();
        let total = refunded_total(&rtx, &payment.payment_ref).unwrap();
        assert_eq!(total, 4_000);
    }

    #[tokio::test]
    async fn expired_orders_reject_payment() {
        let mut settings = crate::settings::Config::default();
        settings.secret_key = "payflow-test-secret-key-0123456789abcdef".to_string();
        settings.order_ttl = std::time::Duration::from_secs(0);
        let store = crate::store::Store::in_memory().unwrap();
        let gw = Gateway::new(
            settings,
            store,
            Arc::new(StaticAuthorizer::approving()) as Arc<dyn Authorizer>,
        )
        .unwrap();
        seed_merchant(&gw, 1);

        let (order, _) = create_order(&gw, 1, order_req(1_000)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let err = submit_payment(&gw, &order.order_ref, upi_checkout("user@upi"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict(_)));
        assert_eq!(load_order(&gw, &order.order_ref).status, OrderStatus::Expired);
    }

    #[tokio::test]
    async fn validation_failures_reject_early() {
        let gw = gateway(StaticAuthorizer::approving());
        seed_merchant(&gw, 1);

        let err = create_order(&gw, 1, order_req(0)).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let mut req = order_req(100);
        req.currency = "GBP".to_string();
        let err = create_order(&gw, 1, req).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let mut req = order_req(100);
        req.notes = Some("x".repeat(NOTES_LIMIT + 1));
        let err = create_order(&gw, 1, req).unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let (order, _) = create_order(&gw, 1, order_req(100)).unwrap();
        let err = submit_payment(
            &gw,
            &order.order_ref,
            CheckoutRequest { method: "crypto".to_string(), ..Default::default() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));

        let err = submit_payment(
            &gw,
            &order.order_ref,
            CheckoutRequest { method: "card".to_string(), ..Default::default() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn card_details_are_masked_at_rest() {
        let gw = gateway(StaticAuthorizer::approving());
        seed_merchant(&gw, 1);
        let (order, _) = create_order(&gw, 1, order_req(3_000)).unwrap();

        let payment = submit_payment(
            &gw,
            &order.order_ref,
            CheckoutRequest {
                method: "card".to_string(),
                card_number: Some("4111 1111 1111 4242".to_string()),
                card_expiry: Some("12 / 29".to_string()),
                card_cvv: Some("123".to_string()),
                card_name: Some("Jane Doe".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(payment.card_last4.as_deref(), Some("4242"));
        assert_eq!(payment.card_network.as_deref(), Some("Visa"));

        // The stored row carries no PAN, expiry or CVV.
        let stored =
            crate::gateway::queries::payment_for_merchant(&gw.store, 1, &payment.payment_ref)
                .unwrap();
        let raw = serde_json::to_string(&stored).unwrap();
        assert!(!raw.contains("4111"));
        assert!(!raw.contains("1111 1111"));
        assert!(!raw.contains("card_cvv"));
    }
}
