//! `/merchants` — onboarding, profile, API key management, checkout QR.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use http::{header, StatusCode};
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::gateway::errors::GatewayError;
use crate::gateway::{keys, refs};
use crate::server::extract::{MerchantAccount, MerchantRole, JsonBody};
use crate::server::App;
use crate::store::models::{ApiKey, Merchant};
use crate::store::{self, tables};

pub fn routes() -> Router<App> {
    Router::new()
        .route("/merchants", post(create_merchant))
        .route("/merchants/", post(create_merchant))
        .route("/merchants/me", get(get_me).patch(update_me))
        .route("/merchants/me/keys", post(create_key).get(list_keys))
        .route("/merchants/me/keys/{key_id}", delete(revoke_key))
        .route("/merchants/me/qr-code", get(qr_code))
}

#[derive(Debug, Deserialize)]
struct MerchantCreateRequest {
    business_name: String,
    business_email: String,
    website: Option<String>,
    webhook_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct MerchantOut {
    id: u64,
    business_name: String,
    business_email: String,
    website: Option<String>,
    webhook_url: Option<String>,
    active: bool,
    created_at: DateTime<Utc>,
    /// Present only in the creation response; record it to verify webhook
    /// signatures.
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook_secret: Option<String>,
}

impl MerchantOut {
    fn from_merchant(merchant: Merchant, reveal_secret: bool) -> Self {
        Self {
            id: merchant.id,
            business_name: merchant.business_name,
            business_email: merchant.business_email,
            website: merchant.website,
            webhook_url: merchant.webhook_url,
            active: merchant.active,
            created_at: merchant.created_at,
            webhook_secret: reveal_secret.then_some(merchant.webhook_secret),
        }
    }
}

async fn create_merchant(
    State(gw): State<App>,
    MerchantRole(user): MerchantRole,
    JsonBody(req): JsonBody<MerchantCreateRequest>,
) -> Result<(StatusCode, Json<MerchantOut>), GatewayError> {
    let business_name = req.business_name.trim().to_string();
    if business_name.is_empty() {
        return Err(GatewayError::validation("business_name is required"));
    }
    let business_email = req.business_email.trim().to_lowercase();
    if business_email.is_empty() || !business_email.contains('@') {
        return Err(GatewayError::validation("a valid business_email is required"));
    }

    let wtx = gw.store.begin_write()?;
    let merchant = {
        let mut by_user = wtx.open_table(tables::MERCHANTS_BY_USER)?;
        if by_user.get(user.id)?.is_some() {
            return Err(GatewayError::conflict("merchant profile already exists"));
        }
        let mut by_email = wtx.open_table(tables::MERCHANTS_BY_EMAIL)?;
        if by_email.get(business_email.as_str())?.is_some() {
            return Err(GatewayError::conflict("business email is already registered"));
        }
        let id = store::next_id(&wtx, "merchants")?;
        let merchant = Merchant {
            id,
            user_id: user.id,
            business_name,
            business_email: business_email.clone(),
            website: req.website.clone(),
            webhook_url: req.webhook_url.clone(),
            webhook_secret: refs::webhook_secret(),
            active: true,
            created_at: Utc::now(),
        };
        let mut merchants = wtx.open_table(tables::MERCHANTS)?;
        store::put_doc_id(&mut merchants, id, &merchant)?;
        by_user.insert(user.id, id)?;
        by_email.insert(business_email.as_str(), id)?;
        merchant
    };
    wtx.commit()?;

    tracing::info!(merchant_id = merchant.id, user_id = user.id, "registered merchant");
    Ok((StatusCode::CREATED, Json(MerchantOut::from_merchant(merchant, true))))
}

async fn get_me(account: MerchantAccount) -> Json<MerchantOut> {
    Json(MerchantOut::from_merchant(account.merchant, false))
}

#[derive(Debug, Deserialize)]
struct MerchantUpdateRequest {
    business_name: Option<String>,
    website: Option<String>,
    webhook_url: Option<String>,
}

async fn update_me(
    State(gw): State<App>,
    account: MerchantAccount,
    JsonBody(req): JsonBody<MerchantUpdateRequest>,
) -> Result<Json<MerchantOut>, GatewayError> {
    let wtx = gw.store.begin_write()?;
    let merchant = {
        let mut merchants = wtx.open_table(tables::MERCHANTS)?;
        let mut merchant: Merchant = store::get_doc(&merchants, account.merchant.id)?
            .ok_or(GatewayError::NotFound("merchant profile"))?;
        if let Some(name) = req.business_name.filter(|n| !n.trim().is_empty()) {
            merchant.business_name = name.trim().to_string();
        }
        if let Some(website) = req.website {
            merchant.website = if website.is_empty() { None } else { Some(website) };
        }
        if let Some(url) = req.webhook_url {
            merchant.webhook_url = if url.is_empty() { None } else { Some(url) };
        }
        store::put_doc_id(&mut merchants, merchant.id, &merchant)?;
        merchant
    };
    wtx.commit()?;
    Ok(Json(MerchantOut::from_merchant(merchant, false)))
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ApiKeyCreateRequest {
    label: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiKeyCreatedOut {
    key_id: String,
    /// Shown exactly once.
    key_secret: String,
    label: String,
    active: bool,
    created_at: DateTime<Utc>,
}

async fn create_key(
    State(gw): State<App>,
    account: MerchantAccount,
    JsonBody(req): JsonBody<ApiKeyCreateRequest>,
) -> Result<(StatusCode, Json<ApiKeyCreatedOut>), GatewayError> {
    let issued = keys::issue_key(&gw.store, account.merchant.id, req.label)?;
    Ok((
        StatusCode::CREATED,
        Json(ApiKeyCreatedOut {
            key_id: issued.key_id,
            key_secret: issued.key_secret,
            label: issued.record.label,
            active: issued.record.active,
            created_at: issued.record.created_at,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct ApiKeyOut {
    key_id: String,
    label: String,
    active: bool,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

impl From<ApiKey> for ApiKeyOut {
    fn from(key: ApiKey) -> Self {
        Self {
            key_id: key.key_id,
            label: key.label,
            active: key.active,
            created_at: key.created_at,
            last_used_at: key.last_used_at,
        }
    }
}

async fn list_keys(
    State(gw): State<App>,
    account: MerchantAccount,
) -> Result<Json<Vec<ApiKeyOut>>, GatewayError> {
    let listed = keys::list_keys(&gw.store, account.merchant.id)?;
    Ok(Json(listed.into_iter().map(ApiKeyOut::from).collect()))
}

async fn revoke_key(
    State(gw): State<App>,
    account: MerchantAccount,
    Path(key_id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    keys::revoke_key(&gw.store, &gw.key_cache, account.merchant.id, &key_id).await?;
    tracing::info!(
        key_id = %key_id,
        merchant_id = account.merchant.id,
        user_id = account.user.id,
        "revoked api key"
    );
    Ok(StatusCode::NO_CONTENT)
}

/// PNG QR code of the merchant's hosted-checkout URL.
async fn qr_code(
    State(gw): State<App>,
    account: MerchantAccount,
) -> Result<impl IntoResponse, GatewayError> {
    let url = format!(
        "{}/pay/m/{}",
        gw.settings.frontend_url.trim_end_matches('/'),
        account.merchant.id
    );
    let png = render_qr_png(&url)
        .map_err(|e| GatewayError::internal(format!("render qr code: {e}")))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

fn render_qr_png(data: &str) -> anyhow::Result<Vec<u8>> {
    use image::Luma;
    use qrcode::QrCode;

    let code = QrCode::new(data.as_bytes())?;
    let img = code
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(250, 250)
        .build();

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qr_render_produces_png() {
        let png = render_qr_png("http://localhost:5173/pay/m/1").unwrap();
        // PNG magic bytes.
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n']);
    }
}
