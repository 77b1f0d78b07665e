//! `/pay` — the public hosted-checkout endpoints. No authentication: the
//! order_ref is the capability.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::gateway::errors::GatewayError;
use crate::gateway::lifecycle::{self, CheckoutRequest};
use crate::gateway::queries::{self, CheckoutInfo};
use crate::server::extract::JsonBody;
use crate::server::App;
use crate::store::models::Payment;

pub fn routes() -> Router<App> {
    Router::new()
        .route("/pay/{order_ref}", post(submit_payment))
        .route("/pay/{order_ref}/merchant", get(merchant_info))
}

/// Checkout response: just enough for the payment page to show the result.
#[derive(Debug, Serialize)]
struct CheckoutOut {
    payment_ref: String,
    order_ref: String,
    amount: i64,
    status: &'static str,
    is_flagged: bool,
}

impl From<Payment> for CheckoutOut {
    fn from(payment: Payment) -> Self {
        Self {
            payment_ref: payment.payment_ref,
            order_ref: payment.order_ref,
            amount: payment.amount,
            status: payment.status.as_str(),
            is_flagged: payment.is_flagged,
        }
    }
}

async fn submit_payment(
    State(gw): State<App>,
    Path(order_ref): Path<String>,
    JsonBody(req): JsonBody<CheckoutRequest>,
) -> Result<Json<CheckoutOut>, GatewayError> {
    let payment = lifecycle::submit_payment(&gw, &order_ref, req).await?;
    Ok(Json(payment.into()))
}

async fn merchant_info(
    State(gw): State<App>,
    Path(order_ref): Path<String>,
) -> Result<Json<CheckoutInfo>, GatewayError> {
    Ok(Json(queries::checkout_info(&gw.store, &order_ref)?))
}
