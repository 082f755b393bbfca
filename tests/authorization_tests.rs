//! Authorization and authentication flow tests
//!
//! - Tier-change scenarios through the full orchestrator path
//! - Nonce single-use during signature login
//! - Session token round trips

use rust_decimal_macros::dec;
use tempfile::tempdir;

use cardvault::ops;
use cardvault::{
    auth, KeyedLocks, LedgerStore, OpError, ReferralPath, RewardReason, TierDenied, TtlStore,
};

fn open_store() -> (tempfile::TempDir, LedgerStore) {
    let dir = tempdir().unwrap();
    let store = LedgerStore::open(dir.path().to_str().unwrap()).unwrap();
    (dir, store)
}

fn addr(n: u64) -> String {
    format!("0x{:040x}", n)
}

// ============================================================================
// TIER CHANGES (orchestrated)
// ============================================================================

#[tokio::test]
async fn direct_referrer_lowers_tier_and_audits_it() {
    let (_dir, store) = open_store();
    let locks = KeyedLocks::new();

    // A: root with tier 10, refers B.
    let a = store.create_user(&addr(1), ReferralPath::root(), 10).unwrap();
    let b = store
        .create_user(&addr(2), ReferralPath::root().child(a.id), 0)
        .unwrap();

    ops::set_tier(&store, &locks, &a, &b.address, 3).await.unwrap();

    let b_after = store.user_by_id(b.id).unwrap();
    assert_eq!(b_after.vip, 3);

    let entries = store.rewards_of(b.id).unwrap();
    let audit: Vec<_> = entries
        .iter()
        .filter(|e| e.reason == RewardReason::PrivilegeChange)
        .collect();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].counterparty.as_deref(), Some(a.address.as_str()));
    assert_eq!(audit[0].amount, dec!(0));
}

#[tokio::test]
async fn downline_tier_blocks_direct_mode_demotion() {
    let (_dir, store) = open_store();
    let locks = KeyedLocks::new();

    let a = store.create_user(&addr(1), ReferralPath::root(), 10).unwrap();
    let b = store
        .create_user(&addr(2), ReferralPath::root().child(a.id), 0)
        .unwrap();
    ops::set_tier(&store, &locks, &a, &b.address, 3).await.unwrap();

    // B refers C, who holds tier 5.
    let b_path = store.referral_of(b.id).unwrap().unwrap().path;
    store.create_user(&addr(3), b_path.child(b.id), 5).unwrap();

    // A cannot push B below C's tier.
    let err = ops::set_tier(&store, &locks, &a, &b.address, 2).await.unwrap_err();
    assert!(matches!(err, OpError::Denied(TierDenied::DownlineConflict)));
    assert_eq!(store.user_by_id(b.id).unwrap().vip, 3);

    // And no audit entry was written for the refusal.
    let changes = store
        .rewards_of(b.id)
        .unwrap()
        .into_iter()
        .filter(|e| e.reason == RewardReason::PrivilegeChange)
        .count();
    assert_eq!(changes, 1);
}

#[tokio::test]
async fn broad_grant_actor_reaches_deep_descendants() {
    let (_dir, store) = open_store();
    let locks = KeyedLocks::new();

    let mut a = store.create_user(&addr(1), ReferralPath::root(), 10).unwrap();
    a.can_vip = true;
    let b = store
        .create_user(&addr(2), ReferralPath::root().child(a.id), 0)
        .unwrap();
    let b_path = store.referral_of(b.id).unwrap().unwrap().path;
    let c = store.create_user(&addr(3), b_path.child(b.id), 0).unwrap();

    // A is C's grandparent: allowed in broad mode, even with B in between.
    ops::set_tier(&store, &locks, &a, &c.address, 4).await.unwrap();
    assert_eq!(store.user_by_id(c.id).unwrap().vip, 4);

    // Without the broad flag the same request is refused.
    a.can_vip = false;
    let err = ops::set_tier(&store, &locks, &a, &c.address, 5).await.unwrap_err();
    assert!(matches!(err, OpError::Denied(TierDenied::NotDirectReferral)));
}

#[tokio::test]
async fn tier_change_basic_guards() {
    let (_dir, store) = open_store();
    let locks = KeyedLocks::new();

    let a = store.create_user(&addr(1), ReferralPath::root(), 5).unwrap();
    let b = store
        .create_user(&addr(2), ReferralPath::root().child(a.id), 2)
        .unwrap();

    let err = ops::set_tier(&store, &locks, &a, &b.address, 15).await.unwrap_err();
    assert!(matches!(err, OpError::Denied(TierDenied::OutOfRange)));

    let err = ops::set_tier(&store, &locks, &a, &b.address, 5).await.unwrap_err();
    assert!(matches!(err, OpError::Denied(TierDenied::NotBelowOwn)));

    let err = ops::set_tier(&store, &locks, &a, &b.address, 2).await.unwrap_err();
    assert!(matches!(err, OpError::Denied(TierDenied::NoChange)));

    let err = ops::set_tier(&store, &locks, &a, "not-an-address", 1).await.unwrap_err();
    assert!(matches!(err, OpError::InvalidAddress));

    let err = ops::set_tier(&store, &locks, &a, &addr(9), 1).await.unwrap_err();
    assert!(matches!(err, OpError::TargetNotFound));
}

// ============================================================================
// SIGNATURE LOGIN + NONCE SINGLE USE
// ============================================================================

#[tokio::test]
async fn authorize_consumes_the_nonce_exactly_once() {
    let (_dir, store) = open_store();
    let nonces = TtlStore::new();
    let locks = KeyedLocks::new();
    let secret = b"test-secret";

    let (private, public) = auth::generate_keypair();
    let address = auth::derive_address(&public).unwrap();

    let challenge = nonces.issue_nonce(&address);
    let sign = auth::sign_message(&private, &challenge).unwrap();

    let outcome = ops::authorize(
        &store,
        &nonces,
        &locks,
        secret,
        &address,
        &public,
        &sign,
        "platform-genesis",
    )
    .await
    .unwrap();

    // First login created the user as a platform root.
    assert_eq!(outcome.user.address, address);
    assert_eq!(outcome.user.vip, 15);
    let claims = auth::verify_token(&outcome.token, secret).unwrap();
    assert_eq!(claims.user_id, outcome.user.id);

    // Replaying the same signature over the same challenge fails: the
    // nonce is gone.
    let err = ops::authorize(
        &store,
        &nonces,
        &locks,
        secret,
        &address,
        &public,
        &sign,
        "platform-genesis",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::NonceMissing));
}

#[tokio::test]
async fn authorize_rejects_foreign_signatures() {
    let (_dir, store) = open_store();
    let nonces = TtlStore::new();
    let locks = KeyedLocks::new();

    let (_, public) = auth::generate_keypair();
    let (other_private, _) = auth::generate_keypair();
    let address = auth::derive_address(&public).unwrap();

    let challenge = nonces.issue_nonce(&address);
    let sign = auth::sign_message(&other_private, &challenge).unwrap();

    let err = ops::authorize(
        &store,
        &nonces,
        &locks,
        b"test-secret",
        &address,
        &public,
        &sign,
        "platform-genesis",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::BadSignature));

    // The failed attempt must not have created a user.
    assert!(store.user_by_address(&address).unwrap().is_none());
}

#[tokio::test]
async fn action_signature_requires_a_fresh_nonce() {
    let (_dir, store) = open_store();
    let nonces = TtlStore::new();
    let locks = KeyedLocks::new();

    let (private, public) = auth::generate_keypair();
    let address = auth::derive_address(&public).unwrap();
    let user = store.create_user(&address, ReferralPath::root(), 15).unwrap();

    // No nonce issued yet.
    let sign = auth::sign_message(&private, "whatever-long-enough").unwrap();
    let err = ops::verify_action_signature(&nonces, &locks, &user, &public, &sign)
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::NonceMissing));

    // With a fresh nonce the same flow passes, once.
    let challenge = nonces.issue_nonce(&address);
    let sign = auth::sign_message(&private, &challenge).unwrap();
    ops::verify_action_signature(&nonces, &locks, &user, &public, &sign)
        .await
        .unwrap();
    let err = ops::verify_action_signature(&nonces, &locks, &user, &public, &sign)
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::NonceMissing));
}
