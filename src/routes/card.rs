// ============================================================================
// CARD ROUTES - Opening, Funding, PIN/Freeze/Token, Code + Order Lists
// ============================================================================
//
// Everything here is authenticated; mutations additionally require a fresh
// wallet signature. Provider calls never run inside a ledger transaction.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{current_user, status, AppState, PAGE_SIZE};
use crate::ops::{self, PhysicalCardForm};
use crate::provider::TransactionQuery;
use crate::storage::CardState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/open", post(open_card_handler))
        .route("/open/physical", post(open_physical_handler))
        .route("/confirm", post(confirm_handler))
        .route("/fund", post(fund_handler))
        .route("/pin", post(pin_handler))
        .route("/freeze", post(freeze_handler))
        .route("/token", post(token_handler))
        .route("/codes", post(codes_handler))
        .route("/orders", post(orders_handler))
        .route("/orders/settled", post(orders_settled_handler))
}

#[derive(Deserialize)]
struct SignedAction {
    public_key: String,
    sign: String,
}

// ============================================================================
// OPENING
// ============================================================================

#[derive(Deserialize)]
struct OpenCardRequest {
    email: String,
    public_key: String,
    sign: String,
}

/// POST /card/open - apply for the virtual card (fixed fee).
async fn open_card_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OpenCardRequest>,
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

    match ops::open_virtual_card(&state.store, &user, &req.email) {
        Ok(()) => status("ok"),
        Err(e) => status(e),
    }
}

#[derive(Deserialize)]
struct OpenPhysicalRequest {
    #[serde(flatten)]
    form: PhysicalCardForm,
    public_key: String,
    sign: String,
}

/// POST /card/open/physical - apply for the physical card (config fee + KYC).
async fn open_physical_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OpenPhysicalRequest>,
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

    match ops::open_physical_card(&state.store, &user, req.form) {
        Ok(()) => status("ok"),
        Err(e) => status(e),
    }
}

#[derive(Deserialize)]
struct ConfirmRequest {
    #[serde(default)]
    card_type: u64,
    num: String,
    public_key: String,
    sign: String,
}

/// POST /card/confirm - record the card number printed on the card.
async fn confirm_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConfirmRequest>,
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

    let kind = ops::card_kind_from_type(req.card_type);
    match ops::confirm_card_number(&state.store, &user, kind, &req.num) {
        Ok(()) => status("ok"),
        Err(e) => status(e),
    }
}

// ============================================================================
// FUNDING
// ============================================================================

#[derive(Deserialize)]
struct FundRequest {
    amount: u64,
    /// 1 = physical card, otherwise virtual.
    #[serde(default)]
    to_type: u64,
    public_key: String,
    sign: String,
}

/// POST /card/fund - move balance onto a card. The ledger debit commits
/// before the provider call; a provider failure afterwards surfaces as its
/// own status and is never rolled back here.
async fn fund_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<FundRequest>,
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

    let kind = ops::card_kind_from_type(req.to_type);
    match ops::fund_card(&state.store, &state.nonces, &state.provider, &user, req.amount, kind)
        .await
    {
        Ok(outcome) => Json(json!({
            "status": "ok",
            "order_id": outcome.order_id,
            "net_amount": format!("{:.2}", outcome.net.round_dp(2)),
        })),
        Err(e) => status(e),
    }
}

// ============================================================================
// CARD MANAGEMENT
// ============================================================================

#[derive(Deserialize)]
struct PinRequest {
    #[serde(default)]
    card_type: u64,
    pin: String,
    public_key: String,
    sign: String,
}

/// POST /card/pin - set the card PIN at the provider.
async fn pin_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PinRequest>,
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

    let kind = ops::card_kind_from_type(req.card_type);
    let Some(card_id) = user.card(kind).card_id.clone() else {
        return status("card not issued yet");
    };

    match state.provider.set_pin(&card_id, &req.pin).await {
        Ok(true) => status("ok"),
        Ok(false) | Err(_) => status("pin change failed"),
    }
}

#[derive(Deserialize)]
struct FreezeRequest {
    #[serde(default)]
    card_type: u64,
    #[serde(flatten)]
    signed: SignedAction,
}

/// POST /card/freeze - freeze a card. Local flag first, then the provider;
/// a provider failure leaves the card locally frozen for reconciliation.
async fn freeze_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<FreezeRequest>,
) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    if let Err(e) = ops::verify_action_signature(
        &state.nonces,
        &state.locks,
        &user,
        &req.signed.public_key,
        &req.signed.sign,
    )
    .await
    {
        return status(e);
    }

    let kind = ops::card_kind_from_type(req.card_type);
    let Some(card_id) = user.card(kind).card_id.clone() else {
        return status("card not issued yet");
    };

    if state.store.set_card_frozen(user.id, kind).is_err() {
        return status("please contact the administrator");
    }
    match state.provider.freeze_card(&card_id).await {
        Ok(card) => Json(json!({ "status": "ok", "card_status": card.status })),
        Err(_) => status("freeze failed, contact support"),
    }
}

#[derive(Deserialize)]
struct TokenRequest {
    #[serde(default)]
    card_type: u64,
}

/// POST /card/token - one-time provider token for the card detail view.
async fn token_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TokenRequest>,
) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };

    let kind = ops::card_kind_from_type(req.card_type);
    if user.card(kind).state != CardState::Issued {
        return status("card not issued yet");
    }
    let Some(card_id) = user.card(kind).card_id.clone() else {
        return status("card not issued yet");
    };

    match state.provider.card_private_token(&card_id).await {
        Ok(token) => Json(json!({ "status": "ok", "access_token": token })),
        Err(_) => status("lookup failed"),
    }
}

// ============================================================================
// LISTS
// ============================================================================

#[derive(Deserialize)]
struct CodesRequest {
    /// 1 = physical card reference, otherwise virtual.
    #[serde(default)]
    num: u64,
    #[serde(default)]
    page: usize,
}

/// POST /card/codes - codes recorded against the masked card number.
async fn codes_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CodesRequest>,
) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };

    let kind = ops::card_kind_from_type(req.num);
    let Some(card_ref) = user.card(kind).card_ref.clone() else {
        return Json(json!({ "status": "ok", "count": 0, "list": [] }));
    };
    let mask = ops::mask_card(&card_ref);
    if mask.len() <= 5 {
        return Json(json!({ "status": "ok", "count": 0, "list": [] }));
    }

    let (codes, total) = match state.store.card_codes_page(&mask, req.page.max(1), PAGE_SIZE) {
        Ok(page) => page,
        Err(_) => return status("please contact the administrator"),
    };

    let list: Vec<Value> = codes
        .iter()
        .map(|c| {
            json!({
                "created_at": c.time.format("%Y-%m-%d %H:%M:%S").to_string(),
                "code": c.code,
            })
        })
        .collect();

    Json(json!({ "status": "ok", "count": total, "list": list }))
}

#[derive(Deserialize)]
struct OrdersRequest {
    #[serde(default)]
    card_type: u64,
    #[serde(default)]
    page: usize,
}

fn issued_card_id(user: &crate::storage::User, card_type: u64) -> Option<String> {
    let kind = ops::card_kind_from_type(card_type);
    let slot = user.card(kind);
    if slot.state != CardState::Issued {
        return None;
    }
    slot.card_id.clone()
}

/// POST /card/orders - provider transaction history for a card.
async fn orders_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OrdersRequest>,
) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    let Some(card_id) = issued_card_id(&user, req.card_type) else {
        return Json(json!({ "status": "ok", "count": 0, "list": [] }));
    };

    let query = TransactionQuery {
        card_id,
        limit: PAGE_SIZE,
        page: req.page.max(1),
        ..TransactionQuery::default()
    };
    let (txs, total) = match state.provider.list_transactions(&query).await {
        Ok(page) => page,
        Err(_) => return Json(json!({ "status": "ok", "count": 0, "list": [] })),
    };

    let list: Vec<Value> = txs
        .iter()
        // Type 3 is the provider's internal rebalance, not user activity.
        .filter(|tx| tx.txn_type != 3)
        .map(|tx| {
            json!({
                "timestamp": tx.create_time,
                "status": ops::map_order_status(&tx.status),
                "trade_amount": tx.amount,
                "actual_amount": tx.transaction_amount,
                "service_fee": tx.fee,
                "trader_num": tx.detail,
            })
        })
        .collect();

    Json(json!({ "status": "ok", "count": total.parse::<u64>().unwrap_or(0), "list": list }))
}

/// POST /card/orders/settled - settled transfer rows (provider type 1).
async fn orders_settled_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<OrdersRequest>,
) -> Json<Value> {
    let user = match current_user(&state, &headers) {
        Ok(user) => user,
        Err(reply) => return reply,
    };
    let Some(card_id) = issued_card_id(&user, req.card_type) else {
        return Json(json!({ "status": "ok", "count": 0, "list": [] }));
    };

    let query = TransactionQuery {
        card_id,
        txn_type: Some("1".to_string()),
        limit: PAGE_SIZE,
        page: req.page.max(1),
        ..TransactionQuery::default()
    };
    let (txs, total) = match state.provider.list_transactions(&query).await {
        Ok(page) => page,
        Err(_) => return Json(json!({ "status": "ok", "count": 0, "list": [] })),
    };

    let list: Vec<Value> = txs
        .iter()
        .map(|tx| {
            json!({
                "timestamp": tx.create_time,
                "status": tx.status,
                "trade_amount": tx.transaction_amount,
                "remark": tx.remark,
                "detail": tx.detail,
                "service_fee": tx.fee,
            })
        })
        .collect();

    Json(json!({ "status": "ok", "count": total.parse::<u64>().unwrap_or(0), "list": list }))
}
