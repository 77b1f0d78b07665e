//! `/admin` — read-only analytics, admin role required.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::Serialize;

use crate::gateway::errors::GatewayError;
use crate::gateway::queries::{self, GatewayStats};
use crate::server::extract::AdminUser;
use crate::server::App;
use crate::store::models::{Payment, Transaction};
use crate::store::tables;

pub fn routes() -> Router<App> {
    Router::new()
        .route("/admin/stats", get(stats).post(stats))
        .route("/admin/flagged", get(flagged).post(flagged))
        .route("/admin/transactions", get(all_transactions))
}

async fn stats(
    State(gw): State<App>,
    AdminUser(admin): AdminUser,
) -> Result<Json<GatewayStats>, GatewayError> {
    tracing::debug!(admin_id = admin.id, "admin stats requested");
    Ok(Json(queries::gateway_stats(&gw.store)?))
}

/// Flagged payment view: rule hits included, payer identifiers omitted.
#[derive(Debug, Serialize)]
struct FlaggedPaymentOut {
    payment_ref: String,
    order_ref: String,
    amount: i64,
    currency: String,
    method: &'static str,
    status: &'static str,
    fraud_rules: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<Payment> for FlaggedPaymentOut {
    fn from(payment: Payment) -> Self {
        Self {
            payment_ref: payment.payment_ref,
            order_ref: payment.order_ref,
            amount: payment.amount,
            currency: payment.currency,
            method: payment.method.as_str(),
            status: payment.status.as_str(),
            fraud_rules: payment.fraud_rules,
            created_at: payment.created_at,
        }
    }
}

async fn flagged(
    State(gw): State<App>,
    AdminUser(_): AdminUser,
) -> Result<Json<Vec<FlaggedPaymentOut>>, GatewayError> {
    let payments = queries::flagged_payments(&gw.store)?;
    Ok(Json(payments.into_iter().map(FlaggedPaymentOut::from).collect()))
}

#[derive(Debug, Serialize)]
struct AdminTransactionOut {
    id: u64,
    user_id: u64,
    amount: f64,
    payment_method: &'static str,
    status: crate::store::models::TransactionStatus,
    is_flagged: bool,
    created_at: DateTime<Utc>,
}

async fn all_transactions(
    State(gw): State<App>,
    AdminUser(_): AdminUser,
) -> Result<Json<Vec<AdminTransactionOut>>, GatewayError> {
    let rtx = gw.store.begin_read()?;
    let txns = rtx.open_table(tables::TRANSACTIONS)?;
    let mut out = Vec::new();
    for entry in txns.iter()? {
        let (_, value) = entry?;
        let txn: Transaction = serde_json::from_slice(value.value())?;
        out.push(AdminTransactionOut {
            id: txn.id,
            user_id: txn.user_id,
            amount: txn.amount as f64 / 100.0,
            payment_method: txn.method.as_str(),
            status: txn.status,
            is_flagged: txn.is_flagged,
            created_at: txn.created_at,
        });
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(out))
}
