// ============================================================================
// CARDVAULT ROUTES
// ============================================================================
//
// HTTP surface. Every reply embeds a "status" field ("ok" or a
// human-readable reason); transport status codes are not the signal.
//
// Route organization:
// - auth.rs:    nonce issuance + signature authorization (public)
// - account.rs: profile, referrals, ledger/reward lists, tier changes,
//               peer transfer, withdraw (authenticated)
// - card.rs:    card opening, funding, pin/freeze/token, code lists
//               (authenticated)

pub mod account;
pub mod auth;
pub mod card;

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};

use crate::auth as wallet_auth;
use crate::nonce::{KeyedLocks, TtlStore};
use crate::provider::CardProvider;
use crate::storage::{LedgerStore, User};

/// Page size for every list endpoint.
pub const PAGE_SIZE: usize = 20;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: LedgerStore,
    pub nonces: TtlStore,
    pub locks: KeyedLocks,
    pub provider: CardProvider,
    pub jwt_secret: Arc<Vec<u8>>,
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .nest("/auth", auth::routes())
        .nest("/user", account::user_routes())
        .route("/transfer", post(account::transfer_handler))
        .route("/withdraw", post(account::withdraw_handler))
        .nest("/card", card::routes())
        .with_state(state)
}

/// GET /health - liveness probe.
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let accounts = state.store.all_users().map(|m| m.len()).unwrap_or(0);
    Json(json!({
        "status": "ok",
        "engine": "axum",
        "storage": "redb",
        "accounts": accounts,
    }))
}

/// Bare status reply.
pub(crate) fn status(message: impl std::fmt::Display) -> Json<Value> {
    Json(json!({ "status": message.to_string() }))
}

/// Resolve the authenticated user from the bearer token. Soft-deleted
/// accounts are rejected everywhere.
pub(crate) fn current_user(state: &AppState, headers: &HeaderMap) -> Result<User, Json<Value>> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| status("invalid token"))?;

    let claims = wallet_auth::verify_token(token, &state.jwt_secret)
        .map_err(|_| status("invalid token"))?;

    let user = state
        .store
        .user_by_id(claims.user_id)
        .map_err(|_| status("user not found"))?;
    if user.is_deleted {
        return Err(status("account disabled"));
    }
    Ok(user)
}
