//! `/v1` — the merchant gateway API, authenticated with Basic API keys.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::gateway::errors::GatewayError;
use crate::gateway::lifecycle::{self, CreateOrder, RefundRequest};
use crate::gateway::queries;
use crate::server::extract::{ApiAuth, JsonBody};
use crate::server::App;
use crate::store::models::{Order, Payment, Refund, WebhookLog};

pub fn routes() -> Router<App> {
    Router::new()
        .route("/v1/orders", post(create_order).get(list_orders))
        .route("/v1/orders/{order_ref}", get(get_order))
        .route("/v1/orders/{order_ref}/payments", get(list_order_payments))
        .route("/v1/payments/{payment_ref}", get(get_payment))
        .route("/v1/payments/{payment_ref}/capture", post(capture_payment))
        .route("/v1/payments/{payment_ref}/refund", post(create_refund))
        .route("/v1/payments/{payment_ref}/refunds", get(list_refunds))
        .route("/v1/webhooks/logs", get(webhook_logs))
}

const REPLAY_HEADER: &str = "x-idempotent-replay";

#[derive(Debug, Deserialize)]
struct OrderCreateRequest {
    amount: i64,
    currency: Option<String>,
    receipt: Option<String>,
    notes: Option<String>,
    auto_capture: Option<bool>,
    idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct OrderOut {
    order_ref: String,
    amount: i64,
    currency: String,
    status: &'static str,
    receipt: Option<String>,
    notes: Option<String>,
    attempts: u32,
    created_at: DateTime<Utc>,
}

impl From<Order> for OrderOut {
    fn from(order: Order) -> Self {
        Self {
            order_ref: order.order_ref,
            amount: order.amount,
            currency: order.currency,
            status: order.status.as_str(),
            receipt: order.receipt,
            notes: order.notes,
            attempts: order.attempts,
            created_at: order.created_at,
        }
    }
}

/// Payment view for merchants: method-specific payer identifiers are never
/// echoed, only the masked card display fields.
#[derive(Debug, Serialize)]
struct PaymentOut {
    payment_ref: String,
    order_ref: String,
    amount: i64,
    currency: String,
    method: &'static str,
    status: &'static str,
    is_flagged: bool,
    card_last4: Option<String>,
    card_network: Option<String>,
    error_code: Option<String>,
    error_reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<Payment> for PaymentOut {
    fn from(payment: Payment) -> Self {
        Self {
            payment_ref: payment.payment_ref,
            order_ref: payment.order_ref,
            amount: payment.amount,
            currency: payment.currency,
            method: payment.method.as_str(),
            status: payment.status.as_str(),
            is_flagged: payment.is_flagged,
            card_last4: payment.card_last4,
            card_network: payment.card_network,
            error_code: payment.error_code,
            error_reason: payment.error_reason,
            created_at: payment.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct RefundOut {
    refund_ref: String,
    payment_ref: String,
    amount: i64,
    status: &'static str,
    reason: Option<String>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl From<Refund> for RefundOut {
    fn from(refund: Refund) -> Self {
        Self {
            refund_ref: refund.refund_ref,
            payment_ref: refund.payment_ref,
            amount: refund.amount,
            status: match refund.status {
                crate::store::models::RefundStatus::Processed => "processed",
                crate::store::models::RefundStatus::Failed => "failed",
            },
            reason: refund.reason,
            notes: refund.notes,
            created_at: refund.created_at,
        }
    }
}

fn with_replay_header(mut response: Response, replayed: bool) -> Response {
    if replayed {
        response
            .headers_mut()
            .insert(REPLAY_HEADER, HeaderValue::from_static("true"));
    }
    response
}

async fn create_order(
    State(gw): State<App>,
    ApiAuth(merchant): ApiAuth,
    headers: HeaderMap,
    JsonBody(req): JsonBody<OrderCreateRequest>,
) -> Result<Response, GatewayError> {
    // The body field wins; the Idempotency-Key header is accepted for
    // clients that prefer it.
    let idempotency_key = req.idempotency_key.clone().or_else(|| {
        headers
            .get("idempotency-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let (order, replayed) = lifecycle::create_order(
        &gw,
        merchant.id,
        CreateOrder {
            amount: req.amount,
            currency: req.currency.unwrap_or_else(|| "INR".to_string()),
            receipt: req.receipt,
            notes: req.notes,
            auto_capture: req.auto_capture.unwrap_or(true),
            idempotency_key,
        },
    )?;
    let status = if replayed { StatusCode::OK } else { StatusCode::CREATED };
    let response = (status, Json(OrderOut::from(order))).into_response();
    Ok(with_replay_header(response, replayed))
}

async fn list_orders(
    State(gw): State<App>,
    ApiAuth(merchant): ApiAuth,
) -> Result<Json<Vec<OrderOut>>, GatewayError> {
    let orders = queries::list_orders(&gw.store, merchant.id)?;
    Ok(Json(orders.into_iter().map(OrderOut::from).collect()))
}

async fn get_order(
    State(gw): State<App>,
    ApiAuth(merchant): ApiAuth,
    Path(order_ref): Path<String>,
) -> Result<Json<OrderOut>, GatewayError> {
    let order = queries::order_for_merchant(&gw.store, merchant.id, &order_ref)?;
    Ok(Json(order.into()))
}

async fn list_order_payments(
    State(gw): State<App>,
    ApiAuth(merchant): ApiAuth,
    Path(order_ref): Path<String>,
) -> Result<Json<Vec<PaymentOut>>, GatewayError> {
    let payments = queries::payments_for_order(&gw.store, merchant.id, &order_ref)?;
    Ok(Json(payments.into_iter().map(PaymentOut::from).collect()))
}

async fn get_payment(
    State(gw): State<App>,
    ApiAuth(merchant): ApiAuth,
    Path(payment_ref): Path<String>,
) -> Result<Json<PaymentOut>, GatewayError> {
    let payment = queries::payment_for_merchant(&gw.store, merchant.id, &payment_ref)?;
    Ok(Json(payment.into()))
}

async fn capture_payment(
    State(gw): State<App>,
    ApiAuth(merchant): ApiAuth,
    Path(payment_ref): Path<String>,
) -> Result<Json<PaymentOut>, GatewayError> {
    let payment = lifecycle::capture_payment(&gw, merchant.id, &payment_ref)?;
    Ok(Json(payment.into()))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RefundCreateRequest {
    amount: Option<i64>,
    reason: Option<String>,
    notes: Option<String>,
    idempotency_key: Option<String>,
}

async fn create_refund(
    State(gw): State<App>,
    ApiAuth(merchant): ApiAuth,
    Path(payment_ref): Path<String>,
    JsonBody(req): JsonBody<RefundCreateRequest>,
) -> Result<Response, GatewayError> {
    let (refund, replayed) = lifecycle::create_refund(
        &gw,
        merchant.id,
        &payment_ref,
        RefundRequest {
            amount: req.amount,
            reason: req.reason,
            notes: req.notes,
            idempotency_key: req.idempotency_key,
        },
    )
    .await?;
    let status = if replayed { StatusCode::OK } else { StatusCode::CREATED };
    let response = (status, Json(RefundOut::from(refund))).into_response();
    Ok(with_replay_header(response, replayed))
}

async fn list_refunds(
    State(gw): State<App>,
    ApiAuth(merchant): ApiAuth,
    Path(payment_ref): Path<String>,
) -> Result<Json<Vec<RefundOut>>, GatewayError> {
    let refunds = queries::refunds_for_payment(&gw.store, merchant.id, &payment_ref)?;
    Ok(Json(refunds.into_iter().map(RefundOut::from).collect()))
}

#[derive(Debug, Serialize)]
struct WebhookLogOut {
    id: u64,
    event_id: u64,
    event: String,
    target_url: String,
    attempt: u32,
    status_code: Option<u16>,
    response_body: Option<String>,
    success: bool,
    created_at: DateTime<Utc>,
}

impl From<WebhookLog> for WebhookLogOut {
    fn from(log: WebhookLog) -> Self {
        Self {
            id: log.id,
            event_id: log.event_id,
            event: log.event,
            target_url: log.target_url,
            attempt: log.attempt,
            status_code: log.status_code,
            response_body: log.response_body,
            success: log.success,
            created_at: log.created_at,
        }
    }
}

async fn webhook_logs(
    State(gw): State<App>,
    ApiAuth(merchant): ApiAuth,
) -> Result<Json<Vec<WebhookLogOut>>, GatewayError> {
    let logs = queries::webhook_logs(&gw.store, merchant.id)?;
    Ok(Json(logs.into_iter().map(WebhookLogOut::from).collect()))
}
