// ============================================================================
// OPERATIONS - Transfer Orchestrator
// ============================================================================
//
// User-facing operations composing the ledger, the referral tree, the
// authorization engine and the card provider. Sequencing rule for anything
// that touches money AND the provider: commit the local ledger transaction
// first, then make the network call with the correlation token. A provider
// failure after commit is its own outcome ("recorded but not transferred"),
// never rolled back and never silently dropped.
//
// Every error here maps to a caller-facing status string via Display.
// Internal storage errors are logged and collapsed to a generic status.

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::auth;
use crate::nonce::{KeyedLocks, TtlStore};
use crate::provider::CardGateway;
use crate::referral::ReferralPath;
use crate::storage::{
    CardApplication, CardKind, CardState, LedgerStore, StoreError, User, MAX_OPEN_ATTEMPTS,
};
use crate::vip::{self, TierDenied, TIER_MAX, TIER_ROOT};

/// Fee debited when opening a virtual card.
pub fn virtual_card_fee() -> Decimal {
    Decimal::from(15)
}

/// Fallback fee for the physical card when config is missing.
pub fn default_physical_card_fee() -> Decimal {
    Decimal::from(150)
}

/// Minimum card funding amount.
pub const MIN_FUND_AMOUNT: u64 = 20;

/// Reserved referral code granting root status. Overridable via env so the
/// credential never lives in the binary.
pub fn root_bonus_code() -> String {
    std::env::var("ROOT_BONUS_CODE").unwrap_or_else(|_| "platform-genesis".to_string())
}

// ============================================================================
// ERRORS -> caller-facing statuses
// ============================================================================

#[derive(Debug, Error)]
pub enum OpError {
    #[error("user not found")]
    UserNotFound,
    #[error("target user not found")]
    TargetNotFound,
    #[error("account disabled")]
    AccountDisabled,
    #[error("invalid address format")]
    InvalidAddress,
    #[error("invalid referral code")]
    InvalidReferralCode,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("funding amount below the minimum")]
    BelowMinimum,
    #[error("fee configuration error")]
    FeeMisconfigured,
    #[error("card application already submitted")]
    AlreadySubmitted,
    #[error("submitted too many times, contact the administrator")]
    TooManyAttempts,
    #[error("card not issued yet")]
    CardNotIssued,
    #[error("one transfer per minute")]
    AlreadyInFlight,
    #[error("missing or expired nonce")]
    NonceMissing,
    #[error("signature mismatch")]
    BadSignature,
    #[error("{0}")]
    Denied(#[from] TierDenied),
    #[error("{0}")]
    Invalid(String),
    #[error("recorded but not transferred, contact support")]
    RecordedNotTransferred,
    #[error("please contact the administrator")]
    Internal,
}

impl From<StoreError> for OpError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UserNotFound => OpError::UserNotFound,
            StoreError::InsufficientFunds => OpError::InsufficientBalance,
            StoreError::AlreadyProvisioned => OpError::AlreadySubmitted,
            StoreError::TooManyAttempts => OpError::TooManyAttempts,
            other => {
                error!(error = %other, "store operation failed");
                OpError::Internal
            }
        }
    }
}

pub type OpResult<T> = Result<T, OpError>;

// ============================================================================
// REGISTRATION + AUTHENTICATION
// ============================================================================

/// Outcome of a signature authorization.
#[derive(Debug)]
pub struct AuthOutcome {
    pub user: User,
    pub token: String,
}

/// Look up the wallet, creating the user (and their immutable referral
/// edge) on first sight. The referral code must be the root bonus code or
/// the wallet address of an existing, non-deleted user; anything else is
/// rejected before any state is written.
pub fn register_or_login(
    store: &LedgerStore,
    address: &str,
    referral_code: &str,
) -> OpResult<User> {
    if let Some(user) = store.user_by_address(address)? {
        return Ok(user);
    }

    let (path, vip) = if referral_code == root_bonus_code() {
        (ReferralPath::root(), TIER_ROOT)
    } else {
        if referral_code.len() <= 1 {
            return Err(OpError::InvalidReferralCode);
        }
        let referrer = store
            .user_by_address(referral_code)?
            .ok_or(OpError::InvalidReferralCode)?;
        if referrer.is_deleted {
            return Err(OpError::InvalidReferralCode);
        }
        let edge = store
            .referral_of(referrer.id)?
            .ok_or(OpError::InvalidReferralCode)?;
        (edge.path.child(referrer.id), 0)
    };

    match store.create_user(address, path, vip) {
        Ok(user) => Ok(user),
        // Lost a creation race: the row exists now, use it.
        Err(StoreError::DuplicateAddress) => {
            store.user_by_address(address)?.ok_or(OpError::UserNotFound)
        }
        Err(e) => Err(e.into()),
    }
}

/// Authorize a wallet by signature over its consumed single-use challenge,
/// creating the user on first login and issuing a session token.
pub async fn authorize(
    store: &LedgerStore,
    nonces: &TtlStore,
    locks: &KeyedLocks,
    jwt_secret: &[u8],
    address: &str,
    public_key: &str,
    signature: &str,
    referral_code: &str,
) -> OpResult<AuthOutcome> {
    if !auth::is_valid_address(address) {
        return Err(OpError::InvalidAddress);
    }
    if signature.len() <= 10 {
        return Err(OpError::BadSignature);
    }

    let challenge = {
        let _guard = locks.acquire(&format!("nonce:{}", address)).await;
        nonces.consume_nonce(address).ok_or(OpError::NonceMissing)?
    };

    let recovered = auth::verify_signature(public_key, signature, &challenge)
        .map_err(|_| OpError::BadSignature)?;
    if recovered != address {
        return Err(OpError::BadSignature);
    }

    let user = register_or_login(store, address, referral_code)?;
    if user.is_deleted {
        return Err(OpError::AccountDisabled);
    }

    let token = auth::issue_token(user.id, "user", jwt_secret).map_err(|e| {
        error!(error = %e, "token issue failed");
        OpError::Internal
    })?;

    Ok(AuthOutcome { user, token })
}

/// Verify the fresh signature every mutating request must carry: consume
/// the caller's nonce (under the per-address lock) and check the signature
/// recovers the caller's own wallet.
pub async fn verify_action_signature(
    nonces: &TtlStore,
    locks: &KeyedLocks,
    user: &User,
    public_key: &str,
    signature: &str,
) -> OpResult<()> {
    if signature.len() <= 10 {
        return Err(OpError::BadSignature);
    }

    let challenge = {
        let _guard = locks.acquire(&format!("nonce:{}", user.address)).await;
        nonces.consume_nonce(&user.address).ok_or(OpError::NonceMissing)?
    };

    let recovered = auth::verify_signature(public_key, signature, &challenge)
        .map_err(|_| OpError::BadSignature)?;
    if recovered != user.address {
        return Err(OpError::BadSignature);
    }
    Ok(())
}

// ============================================================================
// PRIVILEGE TIERS
// ============================================================================

/// Change `target_address`'s tier on behalf of `actor`. Snapshot-then-decide
/// under the per-target lock, then tier write + audit entry in one unit.
pub async fn set_tier(
    store: &LedgerStore,
    locks: &KeyedLocks,
    actor: &User,
    target_address: &str,
    requested: u64,
) -> OpResult<()> {
    if !auth::is_valid_address(target_address) {
        return Err(OpError::InvalidAddress);
    }
    if requested > TIER_MAX as u64 {
        return Err(TierDenied::OutOfRange.into());
    }

    let target = store
        .user_by_address(target_address)?
        .ok_or(OpError::TargetNotFound)?;

    let _guard = locks.acquire(&format!("vip:{}", target.id)).await;

    // Re-read under the lock; the decision runs against this snapshot.
    let target = store.user_by_id(target.id)?;
    let edge = store.referral_of(target.id)?.ok_or(OpError::TargetNotFound)?;
    let users = store.all_users()?;
    let descendants = store.descendants_of(target.id, &edge.path)?;

    vip::authorize_tier_change(actor, &target, &edge.path, requested as u8, &users, &descendants)?;

    store.set_tier(target.id, requested as u8, &actor.address)?;
    Ok(())
}

// ============================================================================
// CARD OPENING
// ============================================================================

/// Apply for the virtual card: fixed fee, provisioning state none -> pending.
pub fn open_virtual_card(store: &LedgerStore, user: &User, email: &str) -> OpResult<()> {
    if user.open_attempts >= MAX_OPEN_ATTEMPTS {
        return Err(OpError::TooManyAttempts);
    }
    if user.virtual_card.state != CardState::None {
        return Err(OpError::AlreadySubmitted);
    }
    if user.balance < virtual_card_fee() {
        return Err(OpError::InsufficientBalance);
    }
    if email.is_empty() || email.len() > 99 {
        return Err(OpError::Invalid("email error".to_string()));
    }

    store.open_card(user.id, virtual_card_fee(), CardKind::Virtual, None)?;
    Ok(())
}

/// KYC form for the physical card application.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct PhysicalCardForm {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub country_code: String,
    pub phone: String,
    pub city: String,
    pub country: String,
    pub street: String,
    pub postal_code: String,
    #[serde(default)]
    pub state: String,
    pub gender: String,
    pub id_number: String,
    #[serde(default)]
    pub birth_date: String,
}

fn check_len(value: &str, max: usize, label: &str) -> OpResult<()> {
    if value.is_empty() || value.len() > max {
        return Err(OpError::Invalid(format!("{} error", label)));
    }
    Ok(())
}

/// Apply for the physical card: configurable fee, KYC row persisted with
/// the debit.
pub fn open_physical_card(
    store: &LedgerStore,
    user: &User,
    form: PhysicalCardForm,
) -> OpResult<()> {
    let fee = store.config_decimal("physical_card_fee", default_physical_card_fee());

    if user.open_attempts >= MAX_OPEN_ATTEMPTS {
        return Err(OpError::TooManyAttempts);
    }
    if user.physical_card.state != CardState::None {
        return Err(OpError::AlreadySubmitted);
    }
    if user.balance < fee {
        return Err(OpError::InsufficientBalance);
    }

    check_len(&form.email, 99, "email")?;
    check_len(&form.first_name, 44, "first name")?;
    check_len(&form.last_name, 44, "last name")?;
    check_len(&form.phone, 44, "phone")?;
    check_len(&form.country_code, 44, "country code")?;
    check_len(&form.street, 99, "street")?;
    check_len(&form.city, 99, "city")?;
    check_len(&form.postal_code, 99, "postal code")?;
    check_len(&form.gender, 40, "gender")?;
    if form.id_number.len() < 10 || form.id_number.len() > 40 {
        return Err(OpError::Invalid("id number error".to_string()));
    }

    // Id, owner and timestamp are assigned inside the store transaction.
    let application = CardApplication {
        id: 0,
        user_id: 0,
        first_name: form.first_name,
        last_name: form.last_name,
        email: form.email,
        country_code: form.country_code,
        phone: form.phone,
        phone_country_code: "86".to_string(),
        city: form.city,
        country: form.country,
        street: form.street,
        postal_code: form.postal_code,
        state: form.state,
        birth_date: form.birth_date,
        id_number: form.id_number,
        gender: form.gender,
        created_at: chrono::Utc::now(),
    };

    store.open_card(user.id, fee, CardKind::Physical, Some(application))?;
    Ok(())
}

/// Record the card number the user read off their physical/virtual card.
pub fn confirm_card_number(
    store: &LedgerStore,
    user: &User,
    kind: CardKind,
    number: &str,
) -> OpResult<()> {
    if number.len() != 16 || !number.bytes().all(|b| b.is_ascii_digit()) {
        return Err(OpError::Invalid("card number format error".to_string()));
    }

    match kind {
        CardKind::Virtual => {
            if user.virtual_card.state != CardState::Issued {
                return Err(OpError::CardNotIssued);
            }
        }
        CardKind::Physical => {
            if user.physical_card.state == CardState::Issued {
                return Err(OpError::Invalid("card already activated".to_string()));
            }
        }
    }

    store.set_card_ref(user.id, kind, number)?;
    Ok(())
}

// ============================================================================
// MONEY MOVEMENT
// ============================================================================

/// Result of a fund-card call: the correlation token ties the local ledger
/// entries to the provider transaction.
#[derive(Debug)]
pub struct FundOutcome {
    pub order_id: String,
    pub net: Decimal,
}

/// Fund a card from the spendable balance.
///
/// Order of operations: per-address short lock, local validations, atomic
/// debit + pending entry, THEN the provider call. If the provider fails the
/// committed debit stays and the caller gets the explicit partial-failure
/// status; the pending entry is the reconciliation handle.
pub async fn fund_card<G: CardGateway>(
    store: &LedgerStore,
    nonces: &TtlStore,
    gateway: &G,
    user: &User,
    amount: u64,
    kind: CardKind,
) -> OpResult<FundOutcome> {
    if nonces.fund_lock_held(&user.address) {
        return Err(OpError::AlreadyInFlight);
    }
    nonces.set_fund_lock(&user.address);

    let gross = Decimal::from(amount);
    if gross > user.balance {
        return Err(OpError::InsufficientBalance);
    }
    if amount < MIN_FUND_AMOUNT {
        return Err(OpError::BelowMinimum);
    }

    let rate = store.config_decimal("transfer_rate", Decimal::ZERO);
    let net = gross - gross * rate;
    if net <= Decimal::ZERO {
        return Err(OpError::FeeMisconfigured);
    }

    let slot = user.card(kind);
    if slot.state != CardState::Issued {
        return Err(OpError::CardNotIssued);
    }
    let card_id = slot.card_id.clone().ok_or(OpError::CardNotIssued)?;

    let order_id = format!("in-{}", Uuid::new_v4());
    let entry_id = store.fund_card_debit(user.id, gross, &order_id, kind)?;

    // Network call, outside any transaction. The debit above is durable.
    match gateway.transfer_in(&card_id, &order_id, net).await {
        Ok(_) => {
            store.confirm_card_funding(entry_id, net, &order_id, kind)?;
            Ok(FundOutcome { order_id, net })
        }
        Err(e) => {
            warn!(user_id = user.id, order_id = %order_id, error = %e, "provider transfer-in failed after debit");
            Err(OpError::RecordedNotTransferred)
        }
    }
}

/// Move balance to another wallet. Debit, credit and the audit entry land
/// atomically or not at all.
pub fn peer_transfer(store: &LedgerStore, user: &User, to_address: &str, amount: u64) -> OpResult<()> {
    let value = Decimal::from(amount);
    if value > user.balance {
        return Err(OpError::InsufficientBalance);
    }
    if !auth::is_valid_address(to_address) {
        return Err(OpError::InvalidAddress);
    }
    if to_address == user.address {
        return Err(OpError::Invalid("cannot transfer to yourself".to_string()));
    }

    let recipient = store.user_by_address(to_address)?.ok_or(OpError::TargetNotFound)?;

    store.transfer(user.id, recipient.id, to_address, value)?;
    Ok(())
}

/// Withdraw to the caller's own wallet address, net of the configured fee.
pub fn withdraw(store: &LedgerStore, user: &User, amount: u64) -> OpResult<u64> {
    let gross = Decimal::from(amount);
    if gross > user.balance {
        return Err(OpError::InsufficientBalance);
    }

    let rate = store.config_decimal("withdraw_rate", Decimal::ZERO);
    let net = gross - gross * rate;
    if net <= Decimal::ZERO {
        return Err(OpError::FeeMisconfigured);
    }

    let id = store.withdraw(user.id, gross, net, &user.address)?;
    Ok(id)
}

// ============================================================================
// HELPERS
// ============================================================================

/// Mask a card number as first8 + "xxxxxx" + last4, digits only. Numbers
/// shorter than 12 digits come back unchanged.
pub fn mask_card(card: &str) -> String {
    let digits: String = card.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 12 {
        return card.to_string();
    }
    format!("{}xxxxxx{}", &digits[..8], &digits[digits.len() - 4..])
}

/// Map a provider transaction status to the caller-facing vocabulary.
pub fn map_order_status(status: &str) -> &'static str {
    match status {
        "FAIL" => "FAILED",
        "PENDING" => "PROCESSING",
        _ => "SUCCESS",
    }
}

/// Card kind from the wire-level card type flag (1 = physical).
pub fn card_kind_from_type(card_type: u64) -> CardKind {
    if card_type == 1 {
        CardKind::Physical
    } else {
        CardKind::Virtual
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_card_shapes() {
        assert_eq!(mask_card("4111222233334444"), "41112222xxxxxx4444");
        assert_eq!(mask_card("4111 2222 3333 4444"), "41112222xxxxxx4444");
        // Too short to mask: unchanged.
        assert_eq!(mask_card("41112222"), "41112222");
    }

    #[test]
    fn order_status_vocabulary() {
        assert_eq!(map_order_status("CLOSED"), "SUCCESS");
        assert_eq!(map_order_status("FAIL"), "FAILED");
        assert_eq!(map_order_status("PENDING"), "PROCESSING");
    }

    #[test]
    fn card_kind_flag() {
        assert_eq!(card_kind_from_type(1), CardKind::Physical);
        assert_eq!(card_kind_from_type(0), CardKind::Virtual);
        assert_eq!(card_kind_from_type(2), CardKind::Virtual);
    }
}
