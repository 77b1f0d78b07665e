//! `/transactions` — the legacy dashboard API, authenticated with JWTs.
//!
//! Kept distinct from the gateway order/payment rows. The JSON contract is
//! rupees; conversion to minor units happens here, at the boundary, and
//! nowhere else.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use http::StatusCode;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::gateway::authorizer::AuthorizeRequest;
use crate::gateway::errors::GatewayError;
use crate::gateway::fraud::{self, Attempt, History, PriorPayment};
use crate::server::extract::{AuthUser, JsonBody};
use crate::server::App;
use crate::store::models::{PaymentMethod, Transaction, TransactionStatus, User, UserRole};
use crate::store::{self, tables};

pub fn routes() -> Router<App> {
    Router::new()
        .route("/transactions", post(create_transaction).get(list_transactions))
        .route("/transactions/", post(create_transaction).get(list_transactions))
        .route("/transactions/{txn_id}", get(get_transaction))
        .route("/transactions/{txn_id}/refund", post(refund_transaction))
}

/// Rules the legacy anomaly check runs; no instrument data is available.
const LEGACY_RULES: &[&str] = &["high_value", "duplicate_amount", "high_frequency"];

#[derive(Debug, Deserialize)]
struct TransactionCreateRequest {
    /// Rupees, as the dashboard has always sent them.
    amount: f64,
    payment_method: String,
    idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransactionOut {
    id: u64,
    /// Rupees, converted back from the stored minor units.
    amount: f64,
    payment_method: &'static str,
    status: TransactionStatus,
    idempotency_key: Option<String>,
    is_flagged: bool,
    created_at: DateTime<Utc>,
}

impl From<Transaction> for TransactionOut {
    fn from(txn: Transaction) -> Self {
        Self {
            id: txn.id,
            amount: txn.amount as f64 / 100.0,
            payment_method: txn.method.as_str(),
            status: txn.status,
            idempotency_key: txn.idempotency_key,
            is_flagged: txn.is_flagged,
            created_at: txn.created_at,
        }
    }
}

fn recent_by_user(gw: &App, user_id: u64, now: DateTime<Utc>) -> Result<History, GatewayError> {
    let rtx = gw.store.begin_read()?;
    let by_user = rtx.open_multimap_table(tables::TRANSACTIONS_BY_USER)?;
    let txns = rtx.open_table(tables::TRANSACTIONS)?;
    let mut prior = Vec::new();
    for id in store::id_refs(&by_user, user_id)? {
        if let Some(txn) = store::get_doc::<u64, Transaction>(&txns, id)? {
            prior.push(PriorPayment { amount: txn.amount, created_at: txn.created_at });
        }
    }
    Ok(History::within_window(prior, now))
}

async fn create_transaction(
    State(gw): State<App>,
    AuthUser(user): AuthUser,
    JsonBody(req): JsonBody<TransactionCreateRequest>,
) -> Result<(StatusCode, Json<TransactionOut>), GatewayError> {
    if !req.amount.is_finite() || req.amount <= 0.0 {
        return Err(GatewayError::validation("amount must be greater than 0"));
    }
    let method = PaymentMethod::parse(&req.payment_method.to_lowercase())
        .filter(|m| *m != PaymentMethod::Wallet)
        .ok_or_else(|| {
            GatewayError::validation("invalid payment_method, choose upi, card or netbanking")
        })?;
    // Rupees -> paise, the single conversion point for this surface.
    let amount_minor = (req.amount * 100.0).round() as i64;

    let idem_key = req
        .idempotency_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .map(|k| format!("{}:{}", user.id, k));

    let now = Utc::now();
    let history = recent_by_user(&gw, user.id, now)?;
    let attempt = Attempt { amount: amount_minor, method, vpa: None };
    let (is_flagged, _) = fraud::evaluate_named(&attempt, &history, LEGACY_RULES);

    // Simulated outcome, resolved before the write transaction.
    let outcome = gw
        .authorizer
        .authorize(AuthorizeRequest {
            amount: amount_minor,
            currency: "INR",
            method,
            is_flagged,
        })
        .await;
    let status = match outcome {
        crate::gateway::authorizer::Outcome::Approved => TransactionStatus::Success,
        crate::gateway::authorizer::Outcome::Declined { .. } => TransactionStatus::Failed,
    };

    let wtx = gw.store.begin_write()?;
    let mut replayed: Option<Transaction> = None;
    let mut created: Option<Transaction> = None;
    {
        let mut txns = wtx.open_table(tables::TRANSACTIONS)?;
        let mut idem = wtx.open_table(tables::TXN_IDEMPOTENCY)?;
        let existing = match idem_key.as_deref() {
            Some(key) => idem.get(key)?.map(|g| g.value()),
            None => None,
        };
        match existing {
            Some(id) => {
                let txn: Transaction = store::get_doc(&txns, id)?
                    .ok_or_else(|| GatewayError::internal("idempotency record without row"))?;
                replayed = Some(txn);
            }
            None => {
                let id = store::next_id(&wtx, "transactions")?;
                let txn = Transaction {
                    id,
                    user_id: user.id,
                    amount: amount_minor,
                    method,
                    status,
                    idempotency_key: req.idempotency_key.clone(),
                    is_flagged,
                    created_at: now,
                };
                store::put_doc_id(&mut txns, id, &txn)?;
                let mut by_user = wtx.open_multimap_table(tables::TRANSACTIONS_BY_USER)?;
                by_user.insert(user.id, id)?;
                if let Some(key) = idem_key.as_deref() {
                    idem.insert(key, id)?;
                }
                created = Some(txn);
            }
        }
    }

    if let Some(txn) = replayed {
        return Ok((StatusCode::OK, Json(txn.into())));
    }
    wtx.commit()?;
    Ok((StatusCode::CREATED, Json(created.expect("transaction recorded").into())))
}

async fn list_transactions(
    State(gw): State<App>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<TransactionOut>>, GatewayError> {
    let rtx = gw.store.begin_read()?;
    let by_user = rtx.open_multimap_table(tables::TRANSACTIONS_BY_USER)?;
    let txns = rtx.open_table(tables::TRANSACTIONS)?;
    let mut out = Vec::new();
    for id in store::id_refs(&by_user, user.id)? {
        if let Some(txn) = store::get_doc::<u64, Transaction>(&txns, id)? {
            out.push(txn);
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(out.into_iter().map(TransactionOut::from).collect()))
}

fn load_owned(gw: &App, user: &User, txn_id: u64) -> Result<Transaction, GatewayError> {
    let rtx = gw.store.begin_read()?;
    let txns = rtx.open_table(tables::TRANSACTIONS)?;
    let txn: Transaction =
        store::get_doc(&txns, txn_id)?.ok_or(GatewayError::NotFound("transaction"))?;
    if txn.user_id != user.id && user.role != UserRole::Admin {
        return Err(GatewayError::Forbidden("not your transaction".to_string()));
    }
    Ok(txn)
}

async fn get_transaction(
    State(gw): State<App>,
    AuthUser(user): AuthUser,
    Path(txn_id): Path<u64>,
) -> Result<Json<TransactionOut>, GatewayError> {
    let txn = load_owned(&gw, &user, txn_id)?;
    Ok(Json(txn.into()))
}

async fn refund_transaction(
    State(gw): State<App>,
    AuthUser(user): AuthUser,
    Path(txn_id): Path<u64>,
) -> Result<Json<TransactionOut>, GatewayError> {
    // Ownership check outside the transaction; the status check repeats
    // inside it.
    load_owned(&gw, &user, txn_id)?;

    let wtx = gw.store.begin_write()?;
    let txn = {
        let mut txns = wtx.open_table(tables::TRANSACTIONS)?;
        let mut txn: Transaction =
            store::get_doc(&txns, txn_id)?.ok_or(GatewayError::NotFound("transaction"))?;
        if txn.status != TransactionStatus::Success {
            return Err(GatewayError::conflict(
                "only successful transactions can be refunded",
            ));
        }
        txn.status = TransactionStatus::Refunded;
        store::put_doc_id(&mut txns, txn_id, &txn)?;
        txn
    };
    wtx.commit()?;
    Ok(Json(txn.into()))
}
