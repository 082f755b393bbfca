// ============================================================================
// AUTH ROUTES - Nonce Issuance + Wallet Authorization
// ============================================================================
//
// Public endpoints. Login flow:
//   1. POST /auth/nonce      -> single-use challenge for the address
//   2. client signs the challenge with the wallet key
//   3. POST /auth/authorize  -> consumes the challenge, verifies the
//      signature, creates the user on first sight, returns a session token

use axum::extract::State;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{status, AppState};
use crate::auth;
use crate::ops;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/nonce", post(nonce_handler))
        .route("/authorize", post(authorize_handler))
}

#[derive(Deserialize)]
struct NonceRequest {
    address: String,
}

/// POST /auth/nonce - issue (or re-issue) the challenge for an address.
async fn nonce_handler(
    State(state): State<AppState>,
    Json(req): Json<NonceRequest>,
) -> Json<Value> {
    if !auth::is_valid_address(&req.address) {
        return Json(json!({ "status": "invalid address format", "nonce": "" }));
    }

    let nonce = {
        let _guard = state.locks.acquire(&format!("nonce:{}", req.address)).await;
        state.nonces.issue_nonce(&req.address)
    };

    Json(json!({ "status": "ok", "nonce": nonce }))
}

#[derive(Deserialize)]
struct AuthorizeRequest {
    address: String,
    public_key: String,
    sign: String,
    /// Referral code: the root bonus code or an existing user's address.
    #[serde(default)]
    code: String,
}

/// POST /auth/authorize - signature login, creating the user on first use.
async fn authorize_handler(
    State(state): State<AppState>,
    Json(req): Json<AuthorizeRequest>,
) -> Json<Value> {
    match ops::authorize(
        &state.store,
        &state.nonces,
        &state.locks,
        &state.jwt_secret,
        &req.address,
        &req.public_key,
        &req.sign,
        &req.code,
    )
    .await
    {
        Ok(outcome) => Json(json!({
            "status": "ok",
            "token": outcome.token,
            "user_id": outcome.user.id,
        })),
        Err(e) => status(e),
    }
}
