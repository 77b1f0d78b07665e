//! Typed principals attached to requests by the auth extractors.
//!
//! `ApiAuth` resolves Basic credentials against the key store for the
//! `/v1/*` gateway surface; the JWT extractors gate the dashboard routes by
//! role. Handlers declare the principal they need in their signature.

use std::sync::Arc;

use axum::extract::{FromRef, FromRequest, FromRequestParts, Request};
use base64::Engine;
use http::request::Parts;
use serde::de::DeserializeOwned;

use crate::auth;
use crate::gateway::errors::GatewayError;
use crate::gateway::{keys, queries, Gateway};
use crate::store::models::{Merchant, User, UserRole};

/// JSON body extractor that maps deserialization failures into the
/// validation error envelope instead of the framework default.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(GatewayError::Validation(rejection.body_text())),
        }
    }
}

/// Merchant principal resolved from `Authorization: Basic`.
pub struct ApiAuth(pub Merchant);

impl<S> FromRequestParts<S> for ApiAuth
where
    Arc<Gateway>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let gw = Arc::<Gateway>::from_ref(state);
        let header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(GatewayError::Unauthenticated)?;
        let encoded = header.strip_prefix("Basic ").ok_or(GatewayError::Unauthenticated)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| GatewayError::Unauthenticated)?;
        let decoded = String::from_utf8(decoded).map_err(|_| GatewayError::Unauthenticated)?;
        let (key_id, key_secret) =
            decoded.split_once(':').ok_or(GatewayError::Unauthenticated)?;

        let merchant = keys::resolve_key(&gw.store, &gw.key_cache, key_id, key_secret).await?;
        Ok(ApiAuth(merchant))
    }
}

fn bearer_user<S>(parts: &Parts, state: &S) -> Result<User, GatewayError>
where
    Arc<Gateway>: FromRef<S>,
{
    let gw = Arc::<Gateway>::from_ref(state);
    let header = parts
        .headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(GatewayError::Unauthenticated)?;
    let token = header.strip_prefix("Bearer ").ok_or(GatewayError::Unauthenticated)?;
    let claims = auth::decode_token(token.trim(), &gw.settings.secret_key)?;
    // The user row is authoritative for the role; a token issued before a
    // role change does not widen access.
    queries::user_by_email(&gw.store, &claims.sub)?.ok_or(GatewayError::Unauthenticated)
}

/// Any authenticated dashboard user.
pub struct AuthUser(pub User);

impl<S> FromRequestParts<S> for AuthUser
where
    Arc<Gateway>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(AuthUser(bearer_user(parts, state)?))
    }
}

/// Admin-only routes.
pub struct AdminUser(pub User);

impl<S> FromRequestParts<S> for AdminUser
where
    Arc<Gateway>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = bearer_user(parts, state)?;
        if user.role != UserRole::Admin {
            return Err(GatewayError::Forbidden("admin access required".to_string()));
        }
        Ok(AdminUser(user))
    }
}

/// A user allowed on the merchant surface (merchant or admin role); the
/// merchant row may not exist yet.
pub struct MerchantRole(pub User);

impl<S> FromRequestParts<S> for MerchantRole
where
    Arc<Gateway>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = bearer_user(parts, state)?;
        if !matches!(user.role, UserRole::Merchant | UserRole::Admin) {
            return Err(GatewayError::Forbidden(
                "merchant or admin account required".to_string(),
            ));
        }
        Ok(MerchantRole(user))
    }
}

/// A merchant-surface user together with their existing merchant profile.
pub struct MerchantAccount {
    pub user: User,
    pub merchant: Merchant,
}

impl<S> FromRequestParts<S> for MerchantAccount
where
    Arc<Gateway>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let gw = Arc::<Gateway>::from_ref(state);
        let MerchantRole(user) = MerchantRole::from_request_parts(parts, state).await?;
        let merchant = queries::merchant_by_user(&gw.store, user.id)?
            .ok_or(GatewayError::NotFound("merchant profile"))?;
        Ok(MerchantAccount { user, merchant })
    }
}
