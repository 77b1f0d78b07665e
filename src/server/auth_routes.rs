//! `/auth` — register, login, change password.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use http::StatusCode;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::auth;
use crate::gateway::errors::GatewayError;
use crate::gateway::queries;
use crate::server::extract::{AuthUser, JsonBody};
use crate::server::App;
use crate::store::models::{User, UserRole};
use crate::store::{self, tables};

pub fn routes() -> Router<App> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login-json", post(login_json))
        .route("/auth/change-password", post(change_password))
}

const MIN_PASSWORD_LEN: usize = 6;

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    name: String,
    email: String,
    password: String,
    role: Option<String>,
}

#[derive(Debug, Serialize)]
struct UserOut {
    id: u64,
    name: String,
    email: String,
    role: UserRole,
    created_at: DateTime<Utc>,
}

impl From<User> for UserOut {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            name: user.name,
            email: user.email,
            role: user.role,
            created_at: user.created_at,
        }
    }
}

async fn register(
    State(gw): State<App>,
    JsonBody(req): JsonBody<RegisterRequest>,
) -> Result<(StatusCode, Json<UserOut>), GatewayError> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(GatewayError::validation("a valid email is required"));
    }
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(GatewayError::validation("password must be at least 6 characters"));
    }
    let role = match req.role.as_deref() {
        None | Some("") => UserRole::User,
        Some(raw) => UserRole::parse(raw)
            .ok_or_else(|| GatewayError::validation("role must be user, merchant or admin"))?,
    };
    let password_hash = auth::hash_password(&req.password)?;

    let wtx = gw.store.begin_write()?;
    let user = {
        let mut by_email = wtx.open_table(tables::USERS_BY_EMAIL)?;
        if by_email.get(email.as_str())?.is_some() {
            return Err(GatewayError::conflict("email is already registered"));
        }
        let id = store::next_id(&wtx, "users")?;
        let user = User {
            id,
            name: req.name.trim().to_string(),
            email: email.clone(),
            password_hash,
            role,
            created_at: Utc::now(),
        };
        let mut users = wtx.open_table(tables::USERS)?;
        store::put_doc_id(&mut users, id, &user)?;
        by_email.insert(email.as_str(), id)?;
        user
    };
    wtx.commit()?;

    tracing::info!(user_id = user.id, role = role.as_str(), "registered user");
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct TokenOut {
    access_token: String,
    token_type: &'static str,
}

async fn login_json(
    State(gw): State<App>,
    JsonBody(req): JsonBody<LoginRequest>,
) -> Result<Json<TokenOut>, GatewayError> {
    let email = req.email.trim().to_lowercase();
    let user = queries::user_by_email(&gw.store, &email)?
        .ok_or(GatewayError::Unauthenticated)?;
    if !auth::verify_password(&req.password, &user.password_hash) {
        return Err(GatewayError::Unauthenticated);
    }
    let access_token = auth::create_access_token(
        &user.email,
        user.role,
        &gw.settings.secret_key,
        gw.settings.token_ttl,
    )?;
    Ok(Json(TokenOut { access_token, token_type: "bearer" }))
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

async fn change_password(
    State(gw): State<App>,
    AuthUser(user): AuthUser,
    JsonBody(req): JsonBody<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    if !auth::verify_password(&req.current_password, &user.password_hash) {
        return Err(GatewayError::Unauthenticated);
    }
    if req.new_password.len() < MIN_PASSWORD_LEN {
        return Err(GatewayError::validation("new password must be at least 6 characters"));
    }
    let password_hash = auth::hash_password(&req.new_password)?;

    let wtx = gw.store.begin_write()?;
    {
        let mut users = wtx.open_table(tables::USERS)?;
        let mut stored: User = store::get_doc(&users, user.id)?
            .ok_or(GatewayError::Unauthenticated)?;
        stored.password_hash = password_hash;
        store::put_doc_id(&mut users, user.id, &stored)?;
    }
    wtx.commit()?;

    Ok(Json(serde_json::json!({ "message": "password updated" })))
}
