// ============================================================================
// ACCOUNT ROUTES - Profile, Referrals, Ledger Lists, Tier, Transfer, Withdraw
// ============================================================================
//
// All mutating endpoints require BOTH the session token and a fresh wallet
// signature over a consumed nonce; lists require the token only.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{current_user, status, AppState, PAGE_SIZE};
use crate::ops;
use crate::storage::{CardState, RewardReason};

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/profile", post(profile_handler))
        .route("/referrals", post(referrals_handler))
        .route("/rewards", post(rewards_handler))
        .route("/records", post(records_handler))
        .route("/vip", post(set_vip_handler))
}

fn fmt_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn card_status(state: CardState) -> u64 {
    match state {
        CardState::None => 0,
        CardState::Pending => 1,
        CardState::Issued => 2,
    }
}

// ============================================================================
// PROFILE
// ============================================================================

/// POST /user/profile - balances, tier, card states, referrer, rates.
/// Provider card balances are best effort; the ledger balance is ours.
async fn profile_handler(State(state): State<AppState>, headers: HeaderMap) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };

    let withdraw_rate = state.store.config_decimal("withdraw_rate", Default::default());
    let transfer_rate = state.store.config_decimal("transfer_rate", Default::default());

    let referrer_address = state
        .store
        .referral_of(user.id)
        .ok()
        .flatten()
        .and_then(|edge| edge.path.immediate_referrer())
        .and_then(|id| state.store.user_by_id(id).ok())
        .map(|u| u.address)
        .unwrap_or_default();

    let mut card_amount = String::new();
    if let Some(card_id) = user.virtual_card.card_id.as_deref() {
        if let Ok(summary) = state.provider.card_summary(card_id).await {
            card_amount = summary.balance.available;
        }
    }
    let mut card_amount_two = String::new();
    if let Some(card_id) = user.physical_card.card_id.as_deref() {
        if let Ok(summary) = state.provider.card_summary(card_id).await {
            card_amount_two = summary.balance.available;
        }
    }

    Json(json!({
        "status": "ok",
        "address": user.address,
        "amount": format!("{:.2}", user.balance.round_dp(2)),
        "vip": user.vip,
        "can_vip": user.can_vip,
        "team_volume": user.team_volume,
        "card_status": card_status(user.virtual_card.state),
        "card_status_two": card_status(user.physical_card.state),
        "card_amount": card_amount,
        "card_amount_two": card_amount_two,
        "recommend_address": referrer_address,
        "withdraw_rate": withdraw_rate,
        "transfer_rate": transfer_rate,
    }))
}

// ============================================================================
// REFERRALS
// ============================================================================

#[derive(Deserialize)]
struct ReferralsRequest {
    address: String,
}

/// POST /user/referrals - direct downline of the given wallet.
async fn referrals_handler(
    State(state): State<AppState>,
    Json(req): Json<ReferralsRequest>,
) -> Json<Value> {
    if req.address.is_empty() {
        return status("invalid address format");
    }
    let Ok(Some(user)) = state.store.user_by_address(&req.address) else {
        return status("user not found");
    };
    let Ok(Some(edge)) = state.store.referral_of(user.id) else {
        return status("user not found");
    };

    let children = match state.store.direct_referrals(user.id, &edge.path) {
        Ok(children) => children,
        Err(_) => return status("please contact the administrator"),
    };

    let mut list = Vec::with_capacity(children.len());
    for child in children {
        let Ok(child_user) = state.store.user_by_id(child.user_id) else {
            continue;
        };
        list.push(json!({
            "address": child_user.address,
            "vip": child_user.vip,
            "amount": child_user.team_volume,
            "card_open": if child_user.virtual_card.state == CardState::Issued { 1 } else { 0 },
        }));
    }

    Json(json!({ "status": "ok", "recommends": list }))
}

// ============================================================================
// LEDGER LISTS
// ============================================================================

#[derive(Deserialize)]
struct RewardsRequest {
    #[serde(default)]
    page: usize,
    /// Reason code filter (0 = all).
    #[serde(default)]
    req_type: u64,
    /// Card kind filter for funding entries (0 virtual / 1 physical).
    #[serde(default)]
    card_type: Option<u64>,
}

/// POST /user/rewards - paged audit ledger, filterable by reason code.
async fn rewards_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RewardsRequest>,
) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };

    let reason = if req.req_type == 0 {
        None
    } else {
        match RewardReason::from_code(req.req_type) {
            Some(reason) => Some(reason),
            None => return status("parameter error"),
        }
    };
    let card_kind = req.card_type.map(ops::card_kind_from_type);

    let (entries, total) =
        match state.store.rewards_page(user.id, reason, card_kind, req.page.max(1), PAGE_SIZE) {
            Ok(page) => page,
            Err(_) => return status("please contact the administrator"),
        };

    let list: Vec<Value> = entries
        .iter()
        .map(|entry| {
            json!({
                "created_at": fmt_time(entry.created_at),
                "amount": format!("{:.4}", entry.amount.round_dp(4)),
                "reason": entry.reason,
                "address": entry.counterparty.clone().unwrap_or_default(),
                "status": entry.status,
            })
        })
        .collect();

    Json(json!({ "status": "ok", "count": total, "list": list }))
}

#[derive(Deserialize)]
struct RecordsRequest {
    #[serde(default)]
    page: usize,
}

/// POST /user/records - paged operator remarks.
async fn records_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecordsRequest>,
) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };

    let (records, total) = match state.store.records_page(user.id, req.page.max(1), PAGE_SIZE) {
        Ok(page) => page,
        Err(_) => return status("please contact the administrator"),
    };

    let list: Vec<Value> = records
        .iter()
        .map(|r| json!({ "created_at": fmt_time(r.created_at), "remark": r.remark }))
        .collect();

    Json(json!({ "status": "ok", "count": total, "list": list }))
}

// ============================================================================
// TIER CHANGES
// ============================================================================

#[derive(Deserialize)]
struct SetVipRequest {
    address: String,
    vip: u64,
    public_key: String,
    sign: String,
}

/// POST /user/vip - change a downline member's tier.
async fn set_vip_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SetVipRequest>,
) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    if let Err(e) =
        ops::verify_action_signature(&state.nonces, &state.locks, &user, &req.public_key, &req.sign)
            .await
    {
        return status(e);
    }

    match ops::set_tier(&state.store, &state.locks, &user, &req.address, req.vip).await {
        Ok(()) => status("ok"),
        Err(e) => status(e),
    }
}

// ============================================================================
// MONEY MOVEMENT
// ============================================================================

#[derive(Deserialize)]
pub struct TransferRequest {
    address: String,
    amount: u64,
    public_key: String,
    sign: String,
}

/// POST /transfer - peer transfer to another wallet.
pub async fn transfer_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TransferRequest>,
) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    if let Err(e) =
        ops::verify_action_signature(&state.nonces, &state.locks, &user, &req.public_key, &req.sign)
            .await
    {
        return status(e);
    }

    match ops::peer_transfer(&state.store, &user, &req.address, req.amount) {
        Ok(()) => status("ok"),
        Err(e) => status(e),
    }
}

#[derive(Deserialize)]
pub struct WithdrawRequest {
    amount: u64,
    public_key: String,
    sign: String,
}

/// POST /withdraw - withdraw to the caller's own wallet, net of fee.
pub async fn withdraw_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<WithdrawRequest>,
) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    if let Err(e) =
        ops::verify_action_signature(&state.nonces, &state.locks, &user, &req.public_key, &req.sign)
            .await
    {
        return status(e);
    }

    match ops::withdraw(&state.store, &user, req.amount) {
        Ok(_) => status("ok"),
        Err(e) => status(e),
    }
}
