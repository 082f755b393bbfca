//! Ledger invariant tests
//!
//! - Conservation across transfers and withdrawals
//! - No overdraft under concurrent debits
//! - Withdraw fee accounting
//! - Fund-card two-step flow (pending -> confirmed, partial failure)
//! - Card provisioning state machine
//! - Referral creation (duplicates, immutable paths)

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tempfile::tempdir;

use cardvault::ops;
use cardvault::{
    CardGateway, CardKind, CardState, EntryStatus, LedgerStore, OpError, ProviderError,
    ReferralPath, RewardReason, StoreError, TransferReceipt, TtlStore, User,
};

fn open_store() -> (tempfile::TempDir, LedgerStore) {
    let dir = tempdir().unwrap();
    let store = LedgerStore::open(dir.path().to_str().unwrap()).unwrap();
    (dir, store)
}

fn addr(n: u64) -> String {
    format!("0x{:040x}", n)
}

/// Root user funded with `amount` through the referral-bonus credit path.
fn funded_user(store: &LedgerStore, n: u64, amount: u64) -> User {
    let user = store.create_user(&addr(n), ReferralPath::root(), 15).unwrap();
    store
        .credit_referral_bonus(user.id, Decimal::from(amount), 15, "0xseed")
        .unwrap();
    store.user_by_id(user.id).unwrap()
}

// ============================================================================
// CONSERVATION
// ============================================================================

#[test]
fn transfers_and_withdrawals_conserve_money() {
    let (_dir, store) = open_store();
    let a = funded_user(&store, 1, 500);
    let b = funded_user(&store, 2, 200);
    let total_credited = dec!(700);

    store.transfer(a.id, b.id, &b.address, dec!(120)).unwrap();
    store.transfer(b.id, a.id, &a.address, dec!(45)).unwrap();
    store.withdraw(a.id, dec!(100), dec!(95), &a.address).unwrap();
    store.withdraw(b.id, dec!(50), dec!(47.5), &b.address).unwrap();

    let balances: Decimal = store
        .all_users()
        .unwrap()
        .values()
        .map(|u| u.balance)
        .sum();
    let withdrawn: Decimal = store
        .withdraws_of(a.id)
        .unwrap()
        .iter()
        .chain(store.withdraws_of(b.id).unwrap().iter())
        .map(|w| w.amount)
        .sum();

    assert_eq!(balances + withdrawn, total_credited);
}

#[test]
fn failed_transfer_leaves_no_trace() {
    let (_dir, store) = open_store();
    let a = funded_user(&store, 1, 10);
    let b = funded_user(&store, 2, 0);

    let err = store.transfer(a.id, b.id, &b.address, dec!(11)).unwrap_err();
    assert!(matches!(err, StoreError::InsufficientFunds));

    assert_eq!(store.user_by_id(a.id).unwrap().balance, dec!(10));
    assert_eq!(store.user_by_id(b.id).unwrap().balance, Decimal::ZERO);
    // No audit entry for a mutation that did not happen.
    assert!(store
        .rewards_of(a.id)
        .unwrap()
        .iter()
        .all(|e| e.reason != RewardReason::PeerTransfer));
}

// ============================================================================
// NO OVERDRAFT UNDER CONCURRENCY
// ============================================================================

#[test]
fn concurrent_debits_cannot_overdraw() {
    let (_dir, store) = open_store();
    let a = funded_user(&store, 1, 100);
    let b = funded_user(&store, 2, 0);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = store.clone();
        let (from, to, to_addr) = (a.id, b.id, b.address.clone());
        handles.push(std::thread::spawn(move || {
            store.transfer(from, to, &to_addr, dec!(30)).is_ok()
        }));
    }
    let successes = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    // 100 / 30: at most 3 debits can fit.
    assert!(successes <= 3, "{} debits succeeded against balance 100", successes);
    let a_balance = store.user_by_id(a.id).unwrap().balance;
    assert_eq!(a_balance, dec!(100) - dec!(30) * Decimal::from(successes as u64));
    assert!(a_balance >= Decimal::ZERO);

    // Exactly one audit entry per successful debit.
    let entries = store
        .rewards_of(a.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.reason == RewardReason::PeerTransfer)
        .count();
    assert_eq!(entries, successes);
}

// ============================================================================
// WITHDRAW FEES
// ============================================================================

#[test]
fn withdraw_takes_fee_and_writes_one_entry() {
    let (_dir, store) = open_store();
    let user = funded_user(&store, 1, 100);

    // Default withdraw_rate is 0.05: gross 50 -> net 47.50.
    ops::withdraw(&store, &user, 50).unwrap();

    let after = store.user_by_id(user.id).unwrap();
    assert_eq!(after.balance, dec!(50));

    let withdraws = store.withdraws_of(user.id).unwrap();
    assert_eq!(withdraws.len(), 1);
    assert_eq!(withdraws[0].amount, dec!(50));
    assert_eq!(withdraws[0].net_amount, dec!(47.50));
    assert_eq!(withdraws[0].status, "pending");

    let entries = store.rewards_of(user.id).unwrap();
    let withdrawals: Vec<_> = entries
        .iter()
        .filter(|e| e.reason == RewardReason::Withdrawal)
        .collect();
    assert_eq!(withdrawals.len(), 1);
    assert_eq!(withdrawals[0].amount, dec!(-50));
    // This path must not manufacture a bonus.
    assert!(entries.iter().all(|e| e.reason != RewardReason::ReferralBonus));
}

#[test]
fn withdraw_rejects_nonpositive_net() {
    let (_dir, store) = open_store();
    let user = funded_user(&store, 1, 100);

    // Zero gross means zero net after fees.
    let err = ops::withdraw(&store, &user, 0).unwrap_err();
    assert!(matches!(err, OpError::FeeMisconfigured));
    assert_eq!(store.user_by_id(user.id).unwrap().balance, dec!(100));
}

// ============================================================================
// FUND CARD (two-step flow)
// ============================================================================

struct OkGateway;
impl CardGateway for OkGateway {
    async fn transfer_in(
        &self,
        _card_id: &str,
        client_transaction_id: &str,
        _amount: Decimal,
    ) -> Result<TransferReceipt, ProviderError> {
        Ok(TransferReceipt {
            id: "prov-1".to_string(),
            client_transaction_id: client_transaction_id.to_string(),
            status: "PENDING".to_string(),
        })
    }
}

struct DownGateway;
impl CardGateway for DownGateway {
    async fn transfer_in(
        &self,
        _card_id: &str,
        _client_transaction_id: &str,
        _amount: Decimal,
    ) -> Result<TransferReceipt, ProviderError> {
        Err(ProviderError::Missing("data"))
    }
}

fn user_with_issued_card(store: &LedgerStore, n: u64, balance: u64) -> User {
    let user = funded_user(store, n, balance);
    store
        .open_card(user.id, Decimal::from(15), CardKind::Virtual, None)
        .unwrap();
    store.mark_card_issued(user.id, CardKind::Virtual, "card-123").unwrap();
    store.user_by_id(user.id).unwrap()
}

#[tokio::test]
async fn fund_card_links_pending_and_confirmed_entries() {
    let (_dir, store) = open_store();
    let nonces = TtlStore::new();
    let user = user_with_issued_card(&store, 1, 115);

    let outcome = ops::fund_card(&store, &nonces, &OkGateway, &user, 50, CardKind::Virtual)
        .await
        .unwrap();
    // Default transfer_rate 0.01: net = 50 - 0.50.
    assert_eq!(outcome.net, dec!(49.50));

    let after = store.user_by_id(user.id).unwrap();
    assert_eq!(after.balance, dec!(50)); // 115 - 15 open fee - 50 gross

    let entries = store.rewards_of(user.id).unwrap();
    let debit = entries
        .iter()
        .find(|e| e.reason == RewardReason::CardFunding)
        .expect("funding debit entry");
    let confirm = entries
        .iter()
        .find(|e| e.reason == RewardReason::CardFundingConfirmed)
        .expect("funding confirmation entry");

    assert_eq!(debit.amount, dec!(-50));
    assert_eq!(debit.status, EntryStatus::Confirmed); // flipped by confirmation
    assert_eq!(confirm.amount, dec!(49.50));
    // Linked by the correlation token, not by mutating amounts.
    assert_eq!(debit.order_id, confirm.order_id);
    assert_eq!(debit.order_id.as_deref(), Some(outcome.order_id.as_str()));
}

#[tokio::test]
async fn fund_card_provider_failure_keeps_committed_debit() {
    let (_dir, store) = open_store();
    let nonces = TtlStore::new();
    let user = user_with_issued_card(&store, 1, 115);

    let err = ops::fund_card(&store, &nonces, &DownGateway, &user, 50, CardKind::Virtual)
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::RecordedNotTransferred));

    // The debit is durable and the pending entry is the reconciliation handle.
    assert_eq!(store.user_by_id(user.id).unwrap().balance, dec!(50));
    let entries = store.rewards_of(user.id).unwrap();
    let debit = entries
        .iter()
        .find(|e| e.reason == RewardReason::CardFunding)
        .unwrap();
    assert_eq!(debit.status, EntryStatus::Pending);
    assert!(entries.iter().all(|e| e.reason != RewardReason::CardFundingConfirmed));
}

#[tokio::test]
async fn fund_card_is_rate_limited_per_address() {
    let (_dir, store) = open_store();
    let nonces = TtlStore::new();
    let user = user_with_issued_card(&store, 1, 200);

    ops::fund_card(&store, &nonces, &OkGateway, &user, 50, CardKind::Virtual)
        .await
        .unwrap();

    let user = store.user_by_id(user.id).unwrap();
    let err = ops::fund_card(&store, &nonces, &OkGateway, &user, 50, CardKind::Virtual)
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::AlreadyInFlight));
}

#[tokio::test]
async fn fund_card_enforces_minimum_and_card_state() {
    let (_dir, store) = open_store();
    let user = funded_user(&store, 1, 200);

    // Below minimum.
    let nonces = TtlStore::new();
    let err = ops::fund_card(&store, &nonces, &OkGateway, &user, 10, CardKind::Virtual)
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::BelowMinimum));

    // No issued card.
    let nonces = TtlStore::new();
    let err = ops::fund_card(&store, &nonces, &OkGateway, &user, 50, CardKind::Virtual)
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::CardNotIssued));
}

// ============================================================================
// CARD PROVISIONING STATE MACHINE
// ============================================================================

#[test]
fn open_card_debits_fee_and_moves_to_pending() {
    let (_dir, store) = open_store();
    let user = funded_user(&store, 1, 100);

    store
        .open_card(user.id, Decimal::from(15), CardKind::Virtual, None)
        .unwrap();

    let after = store.user_by_id(user.id).unwrap();
    assert_eq!(after.balance, dec!(85));
    assert_eq!(after.virtual_card.state, CardState::Pending);
    assert_eq!(after.open_attempts, 1);

    let entries = store.rewards_of(user.id).unwrap();
    assert!(entries
        .iter()
        .any(|e| e.reason == RewardReason::CardOpenRebate && e.amount == dec!(-15)));

    // Duplicate application rejected, no second debit.
    let err = store
        .open_card(after.id, Decimal::from(15), CardKind::Virtual, None)
        .unwrap_err();
    assert!(matches!(err, StoreError::AlreadyProvisioned));
    assert_eq!(store.user_by_id(user.id).unwrap().balance, dec!(85));
}

#[test]
fn card_state_only_moves_forward() {
    let (_dir, store) = open_store();
    let user = funded_user(&store, 1, 100);

    // Cannot issue before an application exists.
    let err = store
        .mark_card_issued(user.id, CardKind::Virtual, "card-1")
        .unwrap_err();
    assert!(matches!(err, StoreError::StateConflict));

    store
        .open_card(user.id, Decimal::from(15), CardKind::Virtual, None)
        .unwrap();
    store.mark_card_issued(user.id, CardKind::Virtual, "card-1").unwrap();

    let after = store.user_by_id(user.id).unwrap();
    assert_eq!(after.virtual_card.state, CardState::Issued);
    assert_eq!(after.virtual_card.card_id.as_deref(), Some("card-1"));

    // A second issuance is a conflict, not a silent overwrite.
    let err = store
        .mark_card_issued(user.id, CardKind::Virtual, "card-2")
        .unwrap_err();
    assert!(matches!(err, StoreError::StateConflict));
}

#[test]
fn open_attempt_cap_is_enforced() {
    let (_dir, store) = open_store();
    let mut user = funded_user(&store, 1, 100);
    user.open_attempts = 5;

    let err = ops::open_virtual_card(&store, &user, "a@b.test").unwrap_err();
    assert!(matches!(err, OpError::TooManyAttempts));
}

#[test]
fn open_card_requires_balance() {
    let (_dir, store) = open_store();
    let user = funded_user(&store, 1, 10);

    let err = ops::open_virtual_card(&store, &user, "a@b.test").unwrap_err();
    assert!(matches!(err, OpError::InsufficientBalance));
    assert_eq!(store.user_by_id(user.id).unwrap().virtual_card.state, CardState::None);
}

// ============================================================================
// REFERRAL CREATION
// ============================================================================

#[test]
fn register_builds_immutable_paths() {
    let (_dir, store) = open_store();

    let root = ops::register_or_login(&store, &addr(1), "platform-genesis").unwrap();
    assert_eq!(root.vip, 15);
    assert!(store.referral_of(root.id).unwrap().unwrap().path.is_empty());

    // B referred by the root's address.
    let b = ops::register_or_login(&store, &addr(2), &root.address).unwrap();
    let b_path = store.referral_of(b.id).unwrap().unwrap().path;
    assert_eq!(b_path.ids(), &[root.id]);
    assert_eq!(b_path.immediate_referrer(), Some(root.id));

    // C referred by B.
    let c = ops::register_or_login(&store, &addr(3), &b.address).unwrap();
    let c_path = store.referral_of(c.id).unwrap().unwrap().path;
    assert_eq!(c_path.ids(), &[root.id, b.id]);

    // Logging in again neither re-creates nor rewrites the path.
    let b_again = ops::register_or_login(&store, &addr(2), "platform-genesis").unwrap();
    assert_eq!(b_again.id, b.id);
    assert_eq!(store.referral_of(b.id).unwrap().unwrap().path.ids(), &[root.id]);
}

#[test]
fn bad_referral_codes_create_nothing() {
    let (_dir, store) = open_store();

    let err = ops::register_or_login(&store, &addr(7), "").unwrap_err();
    assert!(matches!(err, OpError::InvalidReferralCode));
    let err = ops::register_or_login(&store, &addr(7), &addr(99)).unwrap_err();
    assert!(matches!(err, OpError::InvalidReferralCode));

    // No orphan user row, no orphan edge.
    assert!(store.user_by_address(&addr(7)).unwrap().is_none());
}
