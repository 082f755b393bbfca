//! Cardvault - wallet-authenticated card and rewards ledger
//!
//! ## Architecture
//!
//! - **Storage**: ReDB (ACID) + DashMap (lock-free cache)
//! - **Server**: Axum
//! - **Auth**: Ed25519 wallet signatures over single-use nonces + JWT sessions
//! - **Money**: fixed-point decimals; every mutation pairs a conditional
//!   balance update with an append-only audit entry in one transaction

pub mod auth;
pub mod nonce;
pub mod ops;
pub mod provider;
pub mod referral;
pub mod routes;
pub mod storage;
pub mod vip;

// ============================================================================
// PUBLIC API
// ============================================================================

// Storage
pub use storage::{
    CardApplication, CardKind, CardSlot, CardState, EntryStatus, LedgerEntry, LedgerStore,
    RewardReason, StoreError, User, WithdrawRecord,
};

// Referral tree
pub use referral::{ReferralEdge, ReferralPath};

// Authorization engine
pub use vip::{authorize_tier_change, TierDenied, TIER_MAX, TIER_MIN, TIER_ROOT};

// Orchestrator
pub use ops::{OpError, PhysicalCardForm};

// Shared state + auth primitives
pub use auth::{derive_address, generate_keypair, sign_message, verify_signature, Claims};
pub use nonce::{KeyedLocks, TtlStore};
pub use provider::{CardGateway, CardProvider, ProviderError, TransferReceipt};
pub use routes::AppState;
