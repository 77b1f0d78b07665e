// Read-side lookups for the HTTP surface. Ownership is always checked
// against the authenticated merchant before a row leaves this module.

use redb::ReadableTable;
use serde::Serialize;

use crate::gateway::errors::GatewayError;
use crate::store::models::{
    Merchant, Order, OrderStatus, Payment, PaymentStatus, Refund, User, WebhookLog,
};
use crate::store::{self, tables, Store};

pub const ORDER_LIST_LIMIT: usize = 100;
pub const WEBHOOK_LOG_LIMIT: usize = 50;

pub fn user_by_email(store: &Store, email: &str) -> Result<Option<User>, GatewayError> {
    let rtx = store.begin_read()?;
    let by_email = rtx.open_table(tables::USERS_BY_EMAIL)?;
    let Some(id) = by_email.get(email)?.map(|g| g.value()) else {
        return Ok(None);
    };
    let users = rtx.open_table(tables::USERS)?;
    Ok(store::get_doc(&users, id)?)
}

pub fn merchant_by_user(store: &Store, user_id: u64) -> Result<Option<Merchant>, GatewayError> {
    let rtx = store.begin_read()?;
    let by_user = rtx.open_table(tables::MERCHANTS_BY_USER)?;
    let Some(id) = by_user.get(user_id)?.map(|g| g.value()) else {
        return Ok(None);
    };
    let merchants = rtx.open_table(tables::MERCHANTS)?;
    Ok(store::get_doc(&merchants, id)?)
}

pub fn order_for_merchant(
    store: &Store,
    merchant_id: u64,
    order_ref: &str,
) -> Result<Order, GatewayError> {
    let rtx = store.begin_read()?;
    let orders = rtx.open_table(tables::ORDERS)?;
    let order: Order =
        store::get_doc(&orders, order_ref)?.ok_or(GatewayError::NotFound("order"))?;
    if order.merchant_id != merchant_id {
        return Err(GatewayError::NotFound("order"));
    }
    Ok(order)
}

pub fn list_orders(store: &Store, merchant_id: u64) -> Result<Vec<Order>, GatewayError> {
    let rtx = store.begin_read()?;
    let by_merchant = rtx.open_multimap_table(tables::ORDERS_BY_MERCHANT)?;
    let orders = rtx.open_table(tables::ORDERS)?;
    let mut out = Vec::new();
    for order_ref in store::str_refs(&by_merchant, merchant_id)? {
        if let Some(order) = store::get_doc::<&str, Order>(&orders, order_ref.as_str())? {
            out.push(order);
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    out.truncate(ORDER_LIST_LIMIT);
    Ok(out)
}

pub fn payments_for_order(
    store: &Store,
    merchant_id: u64,
    order_ref: &str,
) -> Result<Vec<Payment>, GatewayError> {
    // Ownership check first; an unknown or foreign order is a 404.
    order_for_merchant(store, merchant_id, order_ref)?;
    let rtx = store.begin_read()?;
    let by_order = rtx.open_multimap_table(tables::PAYMENTS_BY_ORDER)?;
    let payments = rtx.open_table(tables::PAYMENTS)?;
    let mut out = Vec::new();
    for payment_ref in store::str_refs(&by_order, order_ref)? {
        if let Some(payment) = store::get_doc::<&str, Payment>(&payments, payment_ref.as_str())? {
            out.push(payment);
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}

pub fn payment_for_merchant(
    store: &Store,
    merchant_id: u64,
    payment_ref: &str,
) -> Result<Payment, GatewayError> {
    let rtx = store.begin_read()?;
    let payments = rtx.open_table(tables::PAYMENTS)?;
    let payment: Payment =
        store::get_doc(&payments, payment_ref)?.ok_or(GatewayError::NotFound("payment"))?;
    if payment.merchant_id != merchant_id {
        return Err(GatewayError::NotFound("payment"));
    }
    Ok(payment)
}

pub fn refunds_for_payment(
    store: &Store,
    merchant_id: u64,
    payment_ref: &str,
) -> Result<Vec<Refund>, GatewayError> {
    payment_for_merchant(store, merchant_id, payment_ref)?;
    let rtx = store.begin_read()?;
    let by_payment = rtx.open_multimap_table(tables::REFUNDS_BY_PAYMENT)?;
    let refunds = rtx.open_table(tables::REFUNDS)?;
    let mut out = Vec::new();
    for refund_ref in store::str_refs(&by_payment, payment_ref)? {
        if let Some(refund) = store::get_doc::<&str, Refund>(&refunds, refund_ref.as_str())? {
            out.push(refund);
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}

pub fn webhook_logs(store: &Store, merchant_id: u64) -> Result<Vec<WebhookLog>, GatewayError> {
    let rtx = store.begin_read()?;
    let by_merchant = rtx.open_multimap_table(tables::WEBHOOK_LOGS_BY_MERCHANT)?;
    let logs = rtx.open_table(tables::WEBHOOK_LOGS)?;
    let mut out = Vec::new();
    for id in store::id_refs(&by_merchant, merchant_id)? {
        if let Some(log) = store::get_doc::<u64, WebhookLog>(&logs, id)? {
            out.push(log);
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    out.truncate(WEBHOOK_LOG_LIMIT);
    Ok(out)
}

/// Public display info for the hosted checkout page.
#[derive(Debug, Serialize)]
pub struct CheckoutInfo {
    pub order_ref: String,
    pub business_name: String,
    pub amount: i64,
    pub currency: String,
    pub status: OrderStatus,
}

pub fn checkout_info(store: &Store, order_ref: &str) -> Result<CheckoutInfo, GatewayError> {
    let rtx = store.begin_read()?;
    let orders = rtx.open_table(tables::ORDERS)?;
    let order: Order =
        store::get_doc(&orders, order_ref)?.ok_or(GatewayError::NotFound("order"))?;
    let merchants = rtx.open_table(tables::MERCHANTS)?;
    let merchant: Option<Merchant> = store::get_doc(&merchants, order.merchant_id)?;
    Ok(CheckoutInfo {
        order_ref: order.order_ref,
        business_name: merchant
            .map(|m| m.business_name)
            .unwrap_or_else(|| "PayFlow Checkout".to_string()),
        amount: order.amount,
        currency: order.currency,
        status: order.status,
    })
}

/// System-wide analytics for the admin views.
#[derive(Debug, Default, Serialize)]
pub struct GatewayStats {
    pub total_orders: u64,
    pub paid_orders: u64,
    pub total_payments: u64,
    pub captured_count: u64,
    pub failed_count: u64,
    pub flagged_count: u64,
    pub captured_amount: i64,
    pub refund_count: u64,
    pub refunded_amount: i64,
}

pub fn gateway_stats(store: &Store) -> Result<GatewayStats, GatewayError> {
    let rtx = store.begin_read()?;
    let mut stats = GatewayStats::default();

    let orders = rtx.open_table(tables::ORDERS)?;
    for entry in orders.iter()? {
        let (_, value) = entry?;
        let order: Order = serde_json::from_slice(value.value())?;
        stats.total_orders += 1;
        if order.status == OrderStatus::Paid {
            stats.paid_orders += 1;
        }
    }

    let payments = rtx.open_table(tables::PAYMENTS)?;
    for entry in payments.iter()? {
        let (_, value) = entry?;
        let payment: Payment = serde_json::from_slice(value.value())?;
        stats.total_payments += 1;
        if payment.is_flagged {
            stats.flagged_count += 1;
        }
        match payment.status {
            PaymentStatus::Captured
            | PaymentStatus::Refunded
            | PaymentStatus::PartiallyRefunded => {
                stats.captured_count += 1;
                stats.captured_amount += payment.amount;
            }
            PaymentStatus::Failed => stats.failed_count += 1,
            _ => {}
        }
    }

    let refunds = rtx.open_table(tables::REFUNDS)?;
    for entry in refunds.iter()? {
        let (_, value) = entry?;
        let refund: Refund = serde_json::from_slice(value.value())?;
        if refund.status == crate::store::models::RefundStatus::Processed {
            stats.refund_count += 1;
            stats.refunded_amount += refund.amount;
        }
    }

    Ok(stats)
}

/// Flagged payments, newest first.
pub fn flagged_payments(store: &Store) -> Result<Vec<Payment>, GatewayError> {
    let rtx = store.begin_read()?;
    let payments = rtx.open_table(tables::PAYMENTS)?;
    let mut out = Vec::new();
    for entry in payments.iter()? {
        let (_, value) = entry?;
        let payment: Payment = serde_json::from_slice(value.value())?;
        if payment.is_flagged {
            out.push(payment);
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}
