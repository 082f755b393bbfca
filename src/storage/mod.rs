// ============================================================================
// CARDVAULT - LEDGER STORAGE LAYER
// ============================================================================
//
// Single source of truth for money. Built on:
// - ReDB: ACID-compliant embedded database (MVCC, single-writer commits)
// - DashMap: lock-free user cache for hot reads
//
// CONCURRENCY MODEL:
// - Reads: lock-free via DashMap, falling back to ReDB MVCC snapshots
// - Writes: ReDB serializes write transactions, so "check balance, then
//   mutate" executes as one atomic unit. A failed precondition aborts the
//   transaction; there is no separate race to reason about.
//
// Every balance mutation writes its audit entry in the SAME transaction.
// The ledger never changes a balance without an entry and never writes an
// entry for a change that did not commit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redb::{Database, ReadableTable, Table, TableDefinition};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::referral::{ReferralEdge, ReferralPath};

// ============================================================================
// TABLE DEFINITIONS
// ============================================================================

/// Users by id. Values are serialized `User` records.
const USERS: TableDefinition<u64, &[u8]> = TableDefinition::new("user");
/// Wallet address -> user id. Enforces address uniqueness.
const ADDR_INDEX: TableDefinition<&str, u64> = TableDefinition::new("addr_index");
/// Referral edges by user id (ancestor path, written once).
const REFERRALS: TableDefinition<u64, &[u8]> = TableDefinition::new("user_recommend");
/// Append-only audit ledger.
const REWARDS: TableDefinition<u64, &[u8]> = TableDefinition::new("reward");
/// Withdrawal requests.
const WITHDRAWS: TableDefinition<u64, &[u8]> = TableDefinition::new("withdraw");
/// Physical card applications (KYC rows).
const CARD_APPS: TableDefinition<u64, &[u8]> = TableDefinition::new("card_two");
/// Operator remarks shown to the user.
const CARD_RECORDS: TableDefinition<u64, &[u8]> = TableDefinition::new("card_record");
/// Card codes pulled from the provider, keyed by masked card number.
const CARD_CODES: TableDefinition<u64, &[u8]> = TableDefinition::new("card_code");
/// Platform parameters (fee rates, thresholds). Externally administered.
const CONFIG: TableDefinition<&str, &str> = TableDefinition::new("config");
/// Sequence counters.
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Cap on repeated card provisioning attempts per user.
pub const MAX_OPEN_ATTEMPTS: u32 = 5;

// ============================================================================
// MODELS
// ============================================================================

/// Which card product a record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Virtual,
    Physical,
}

/// Card provisioning lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardState {
    #[default]
    None,
    Pending,
    Issued,
}

/// Per-card provisioning state on a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardSlot {
    pub state: CardState,
    /// Provider-side card id, set when issued.
    pub card_id: Option<String>,
    /// User-confirmed card number used for code lookups.
    pub card_ref: Option<String>,
    pub frozen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub address: String,
    pub balance: Decimal,
    /// Privilege tier, 0-14 assignable, 15 reserved for platform roots.
    pub vip: u8,
    /// Broad-grant flag: may assign tiers anywhere in the downline.
    pub can_vip: bool,
    pub is_deleted: bool,
    pub email: String,
    pub virtual_card: CardSlot,
    pub physical_card: CardSlot,
    pub open_attempts: u32,
    /// Accumulated team volume, maintained by external settlement.
    pub team_volume: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: u64, address: String, now: DateTime<Utc>) -> Self {
        User {
            id,
            address,
            balance: Decimal::ZERO,
            vip: 0,
            can_vip: false,
            is_deleted: false,
            email: String::new(),
            virtual_card: CardSlot::default(),
            physical_card: CardSlot::default(),
            open_attempts: 0,
            team_volume: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn card(&self, kind: CardKind) -> &CardSlot {
        match kind {
            CardKind::Virtual => &self.virtual_card,
            CardKind::Physical => &self.physical_card,
        }
    }

    fn card_mut(&mut self, kind: CardKind) -> &mut CardSlot {
        match kind {
            CardKind::Virtual => &mut self.virtual_card,
            CardKind::Physical => &mut self.physical_card,
        }
    }
}

/// Business reason of a ledger entry. Closed set; numeric codes are stable
/// and double as list filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RewardReason {
    Withdrawal,
    CardOpenRebate,
    CardFundingConfirmed,
    PeerTransfer,
    ReferralBonus,
    PrivilegeChange,
    PhysicalCardRebate,
    CardFunding,
}

impl RewardReason {
    pub fn code(self) -> u64 {
        match self {
            RewardReason::Withdrawal => 2,
            RewardReason::CardOpenRebate => 3,
            RewardReason::CardFundingConfirmed => 4,
            RewardReason::PeerTransfer => 5,
            RewardReason::ReferralBonus => 6,
            RewardReason::PrivilegeChange => 7,
            RewardReason::PhysicalCardRebate => 9,
            RewardReason::CardFunding => 14,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            2 => Some(RewardReason::Withdrawal),
            3 => Some(RewardReason::CardOpenRebate),
            4 => Some(RewardReason::CardFundingConfirmed),
            5 => Some(RewardReason::PeerTransfer),
            6 => Some(RewardReason::ReferralBonus),
            7 => Some(RewardReason::PrivilegeChange),
            9 => Some(RewardReason::PhysicalCardRebate),
            14 => Some(RewardReason::CardFunding),
            _ => None,
        }
    }
}

/// Confirmation state of a ledger entry. Only card-funding entries start
/// pending; the flip to confirmed is the single permitted update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Confirmed,
}

/// Audit record of one balance mutation. Amounts are signed: debits
/// negative, credits positive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub user_id: u64,
    pub amount: Decimal,
    pub reason: RewardReason,
    /// Counterparty wallet address or destination, when there is one.
    pub counterparty: Option<String>,
    pub card_kind: Option<CardKind>,
    /// Correlation token linking two-step flows to the provider call.
    pub order_id: Option<String>,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRecord {
    pub id: u64,
    pub user_id: u64,
    /// Gross amount debited.
    pub amount: Decimal,
    /// Net amount after fee, owed to the destination.
    pub net_amount: Decimal,
    pub address: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// KYC row captured with a physical card application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardApplication {
    pub id: u64,
    pub user_id: u64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub country_code: String,
    pub phone: String,
    pub phone_country_code: String,
    pub city: String,
    pub country: String,
    pub street: String,
    pub postal_code: String,
    pub state: String,
    pub birth_date: String,
    pub id_number: String,
    pub gender: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardRecord {
    pub id: u64,
    pub user_id: u64,
    pub remark: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardCode {
    pub id: u64,
    /// Masked card number the code belongs to.
    pub card: String,
    pub code: String,
    pub time: DateTime<Utc>,
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] redb::Error),
    #[error("record codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("user not found")]
    UserNotFound,
    #[error("address already registered")]
    DuplicateAddress,
    #[error("insufficient balance")]
    InsufficientFunds,
    #[error("card already requested")]
    AlreadyProvisioned,
    #[error("too many provisioning attempts")]
    TooManyAttempts,
    #[error("ledger entry not found")]
    EntryNotFound,
    #[error("tier changed since snapshot")]
    TierChanged,
    #[error("card state conflict")]
    StateConflict,
}

impl From<redb::DatabaseError> for StoreError {
    fn from(e: redb::DatabaseError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::TransactionError> for StoreError {
    fn from(e: redb::TransactionError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::TableError> for StoreError {
    fn from(e: redb::TableError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::StorageError> for StoreError {
    fn from(e: redb::StorageError) -> Self {
        StoreError::Db(e.into())
    }
}
impl From<redb::CommitError> for StoreError {
    fn from(e: redb::CommitError) -> Self {
        StoreError::Db(e.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// LEDGER STORE
// ============================================================================

/// The ledger store. `Clone` is cheap (Arc handles); reads are lock-free
/// via the cache, writes go through ReDB's serialized write transactions.
#[derive(Clone)]
pub struct LedgerStore {
    db: Arc<Database>,
    /// User cache, updated only after a successful commit.
    users: Arc<DashMap<u64, User>>,
}

impl LedgerStore {
    /// Create or open the store at the given directory.
    pub fn open(path: &str) -> StoreResult<Self> {
        let _ = std::fs::create_dir_all(path);

        let db = Database::create(format!("{}/cardvault.redb", path))?;

        // Make sure all tables exist and seed config defaults.
        let txn = db.begin_write()?;
        {
            let _ = txn.open_table(USERS)?;
            let _ = txn.open_table(ADDR_INDEX)?;
            let _ = txn.open_table(REFERRALS)?;
            let _ = txn.open_table(REWARDS)?;
            let _ = txn.open_table(WITHDRAWS)?;
            let _ = txn.open_table(CARD_APPS)?;
            let _ = txn.open_table(CARD_RECORDS)?;
            let _ = txn.open_table(CARD_CODES)?;
            let _ = txn.open_table(META)?;

            let mut config = txn.open_table(CONFIG)?;
            for (key, value) in [
                ("withdraw_rate", "0.05"),
                ("transfer_rate", "0.01"),
                ("physical_card_fee", "150"),
            ] {
                if config.get(key)?.is_none() {
                    config.insert(key, value)?;
                }
            }
        }
        txn.commit()?;

        // Warm the user cache.
        let users = Arc::new(DashMap::new());
        {
            let read = db.begin_read()?;
            let table = read.open_table(USERS)?;
            let mut iter = table.iter()?;
            while let Some(row) = iter.next() {
                let (_, value) = row?;
                let user: User = serde_json::from_slice(value.value())?;
                users.insert(user.id, user);
            }
        }
        info!(path = %path, accounts = users.len(), "ledger store opened");

        Ok(Self { db: Arc::new(db), users })
    }

    // ========================================================================
    // INTERNAL HELPERS
    // ========================================================================

    fn load_user<T>(table: &T, id: u64) -> StoreResult<User>
    where
        T: ReadableTable<u64, &'static [u8]>,
    {
        let guard = table.get(id)?.ok_or(StoreError::UserNotFound)?;
        Ok(serde_json::from_slice(guard.value())?)
    }

    fn store_user(table: &mut Table<'_, u64, &'static [u8]>, user: &User) -> StoreResult<()> {
        let bytes = serde_json::to_vec(user)?;
        table.insert(user.id, bytes.as_slice())?;
        Ok(())
    }

    fn next_id(meta: &mut Table<'_, &'static str, u64>, key: &str) -> StoreResult<u64> {
        let next = meta.get(key)?.map(|v| v.value()).unwrap_or(0) + 1;
        meta.insert(key, next)?;
        Ok(next)
    }

    #[allow(clippy::too_many_arguments)]
    fn append_entry(
        rewards: &mut Table<'_, u64, &'static [u8]>,
        meta: &mut Table<'_, &'static str, u64>,
        user_id: u64,
        amount: Decimal,
        reason: RewardReason,
        counterparty: Option<String>,
        card_kind: Option<CardKind>,
        order_id: Option<String>,
        status: EntryStatus,
    ) -> StoreResult<u64> {
        let id = Self::next_id(meta, "reward_seq")?;
        let entry = LedgerEntry {
            id,
            user_id,
            amount,
            reason,
            counterparty,
            card_kind,
            order_id,
            status,
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&entry)?;
        rewards.insert(id, bytes.as_slice())?;
        Ok(id)
    }

    fn cache(&self, user: User) {
        self.users.insert(user.id, user);
    }

    // ========================================================================
    // USER CREATION
    // ========================================================================

    /// Create a user and their referral edge in one transaction.
    ///
    /// `path` is the new user's full ancestor chain (empty for roots) and is
    /// immutable afterwards. Fails with `DuplicateAddress` when the wallet
    /// is already registered; nothing is written in that case.
    pub fn create_user(&self, address: &str, path: ReferralPath, vip: u8) -> StoreResult<User> {
        let txn = self.db.begin_write()?;
        let user = {
            let mut users = txn.open_table(USERS)?;
            let mut index = txn.open_table(ADDR_INDEX)?;
            let mut referrals = txn.open_table(REFERRALS)?;
            let mut meta = txn.open_table(META)?;

            if index.get(address)?.is_some() {
                return Err(StoreError::DuplicateAddress);
            }

            let id = Self::next_id(&mut meta, "user_seq")?;
            let now = Utc::now();
            let mut user = User::new(id, address.to_string(), now);
            user.vip = vip;

            Self::store_user(&mut users, &user)?;
            index.insert(address, id)?;

            let edge = ReferralEdge { user_id: id, path, created_at: now };
            let bytes = serde_json::to_vec(&edge)?;
            referrals.insert(id, bytes.as_slice())?;

            user
        };
        txn.commit()?;

        info!(user_id = user.id, address = %user.address, vip = user.vip, "user created");
        self.cache(user.clone());
        Ok(user)
    }

    // ========================================================================
    // LEDGER MUTATIONS (conditional update + audit entry, one transaction)
    // ========================================================================

    /// Peer transfer: conditional debit of the sender, credit of the
    /// recipient and one audit entry. Either all three land or none.
    pub fn transfer(
        &self,
        from_id: u64,
        to_id: u64,
        to_address: &str,
        amount: Decimal,
    ) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        let (from_user, to_user) = {
            let mut users = txn.open_table(USERS)?;
            let mut rewards = txn.open_table(REWARDS)?;
            let mut meta = txn.open_table(META)?;

            let mut from_user = Self::load_user(&users, from_id)?;
            if from_user.balance < amount {
                return Err(StoreError::InsufficientFunds);
            }
            let mut to_user = Self::load_user(&users, to_id)?;

            let now = Utc::now();
            from_user.balance -= amount;
            from_user.updated_at = now;
            to_user.balance += amount;
            to_user.updated_at = now;

            Self::store_user(&mut users, &from_user)?;
            Self::store_user(&mut users, &to_user)?;
            Self::append_entry(
                &mut rewards,
                &mut meta,
                from_id,
                -amount,
                RewardReason::PeerTransfer,
                Some(to_address.to_string()),
                None,
                None,
                EntryStatus::Confirmed,
            )?;

            (from_user, to_user)
        };
        txn.commit()?;

        info!(from = from_id, to = to_id, amount = %amount, "peer transfer committed");
        self.cache(from_user);
        self.cache(to_user);
        Ok(())
    }

    /// Withdrawal: conditional debit of the gross amount, a withdraw row
    /// carrying the net amount and one audit entry.
    pub fn withdraw(
        &self,
        user_id: u64,
        gross: Decimal,
        net: Decimal,
        address: &str,
    ) -> StoreResult<u64> {
        let txn = self.db.begin_write()?;
        let (user, withdraw_id) = {
            let mut users = txn.open_table(USERS)?;
            let mut rewards = txn.open_table(REWARDS)?;
            let mut withdraws = txn.open_table(WITHDRAWS)?;
            let mut meta = txn.open_table(META)?;

            let mut user = Self::load_user(&users, user_id)?;
            if user.balance < gross {
                return Err(StoreError::InsufficientFunds);
            }
            user.balance -= gross;
            user.updated_at = Utc::now();
            Self::store_user(&mut users, &user)?;

            let withdraw_id = Self::next_id(&mut meta, "withdraw_seq")?;
            let record = WithdrawRecord {
                id: withdraw_id,
                user_id,
                amount: gross,
                net_amount: net,
                address: address.to_string(),
                status: "pending".to_string(),
                created_at: Utc::now(),
            };
            let bytes = serde_json::to_vec(&record)?;
            withdraws.insert(withdraw_id, bytes.as_slice())?;

            Self::append_entry(
                &mut rewards,
                &mut meta,
                user_id,
                -gross,
                RewardReason::Withdrawal,
                Some(address.to_string()),
                None,
                None,
                EntryStatus::Confirmed,
            )?;

            (user, withdraw_id)
        };
        txn.commit()?;

        info!(user_id, gross = %gross, net = %net, "withdrawal committed");
        self.cache(user);
        Ok(withdraw_id)
    }

    /// Card opening: fee debit, attempt accounting and the state flip to
    /// pending, all guarded inside the transaction. A physical application
    /// also persists its KYC row.
    pub fn open_card(
        &self,
        user_id: u64,
        fee: Decimal,
        kind: CardKind,
        application: Option<CardApplication>,
    ) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        let user = {
            let mut users = txn.open_table(USERS)?;
            let mut rewards = txn.open_table(REWARDS)?;
            let mut apps = txn.open_table(CARD_APPS)?;
            let mut meta = txn.open_table(META)?;

            let mut user = Self::load_user(&users, user_id)?;
            if user.card(kind).state != CardState::None {
                return Err(StoreError::AlreadyProvisioned);
            }
            if user.open_attempts >= MAX_OPEN_ATTEMPTS {
                return Err(StoreError::TooManyAttempts);
            }
            if user.balance < fee {
                return Err(StoreError::InsufficientFunds);
            }

            user.balance -= fee;
            user.card_mut(kind).state = CardState::Pending;
            if kind == CardKind::Virtual {
                user.open_attempts += 1;
            }
            user.updated_at = Utc::now();
            Self::store_user(&mut users, &user)?;

            let reason = match kind {
                CardKind::Virtual => RewardReason::CardOpenRebate,
                CardKind::Physical => RewardReason::PhysicalCardRebate,
            };
            Self::append_entry(
                &mut rewards,
                &mut meta,
                user_id,
                -fee,
                reason,
                None,
                Some(kind),
                None,
                EntryStatus::Confirmed,
            )?;

            if let Some(mut app) = application {
                let app_id = Self::next_id(&mut meta, "card_app_seq")?;
                app.id = app_id;
                app.user_id = user_id;
                app.created_at = Utc::now();
                let bytes = serde_json::to_vec(&app)?;
                apps.insert(app_id, bytes.as_slice())?;
            }

            user
        };
        txn.commit()?;

        info!(user_id, kind = ?kind, fee = %fee, "card application committed");
        self.cache(user);
        Ok(())
    }

    /// First half of the fund-card flow: conditional debit of the gross
    /// amount plus a PENDING entry carrying the correlation token. Returns
    /// the entry id for the later confirmation.
    pub fn fund_card_debit(
        &self,
        user_id: u64,
        gross: Decimal,
        order_id: &str,
        kind: CardKind,
    ) -> StoreResult<u64> {
        let txn = self.db.begin_write()?;
        let (user, entry_id) = {
            let mut users = txn.open_table(USERS)?;
            let mut rewards = txn.open_table(REWARDS)?;
            let mut meta = txn.open_table(META)?;

            let mut user = Self::load_user(&users, user_id)?;
            if user.balance < gross {
                return Err(StoreError::InsufficientFunds);
            }
            user.balance -= gross;
            user.updated_at = Utc::now();
            Self::store_user(&mut users, &user)?;

            let entry_id = Self::append_entry(
                &mut rewards,
                &mut meta,
                user_id,
                -gross,
                RewardReason::CardFunding,
                None,
                Some(kind),
                Some(order_id.to_string()),
                EntryStatus::Pending,
            )?;

            (user, entry_id)
        };
        txn.commit()?;

        info!(user_id, gross = %gross, order_id, "card funding debited (pending)");
        self.cache(user);
        Ok(entry_id)
    }

    /// Second half of the fund-card flow: flip the pending entry to
    /// confirmed (its one permitted update) and append the confirmation
    /// entry with the same token and the net amount handed to the provider.
    pub fn confirm_card_funding(
        &self,
        entry_id: u64,
        net: Decimal,
        order_id: &str,
        kind: CardKind,
    ) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut rewards = txn.open_table(REWARDS)?;
            let mut meta = txn.open_table(META)?;

            let mut entry: LedgerEntry = {
                let guard = rewards.get(entry_id)?.ok_or(StoreError::EntryNotFound)?;
                serde_json::from_slice(guard.value())?
            };
            if entry.reason != RewardReason::CardFunding || entry.status != EntryStatus::Pending {
                return Err(StoreError::StateConflict);
            }
            entry.status = EntryStatus::Confirmed;
            let user_id = entry.user_id;
            let bytes = serde_json::to_vec(&entry)?;
            rewards.insert(entry_id, bytes.as_slice())?;

            Self::append_entry(
                &mut rewards,
                &mut meta,
                user_id,
                net,
                RewardReason::CardFundingConfirmed,
                None,
                Some(kind),
                Some(order_id.to_string()),
                EntryStatus::Confirmed,
            )?;
        }
        txn.commit()?;

        info!(entry_id, order_id, "card funding confirmed");
        Ok(())
    }

    /// Tier write plus its audit entry, in one transaction. The caller has
    /// already run the authorization engine under the per-target lock.
    pub fn set_tier(&self, user_id: u64, vip: u8, actor_address: &str) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        let user = {
            let mut users = txn.open_table(USERS)?;
            let mut rewards = txn.open_table(REWARDS)?;
            let mut meta = txn.open_table(META)?;

            let mut user = Self::load_user(&users, user_id)?;
            user.vip = vip;
            user.updated_at = Utc::now();
            Self::store_user(&mut users, &user)?;

            Self::append_entry(
                &mut rewards,
                &mut meta,
                user_id,
                Decimal::ZERO,
                RewardReason::PrivilegeChange,
                Some(actor_address.to_string()),
                None,
                None,
                EntryStatus::Confirmed,
            )?;

            user
        };
        txn.commit()?;

        info!(user_id, vip, "tier updated");
        self.cache(user);
        Ok(())
    }

    /// Referral bonus credit, guarded on the beneficiary's tier being
    /// unchanged since the caller's snapshot. Driven by the external
    /// settlement worker.
    pub fn credit_referral_bonus(
        &self,
        user_id: u64,
        amount: Decimal,
        expected_vip: u8,
        counterparty: &str,
    ) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        let user = {
            let mut users = txn.open_table(USERS)?;
            let mut rewards = txn.open_table(REWARDS)?;
            let mut meta = txn.open_table(META)?;

            let mut user = Self::load_user(&users, user_id)?;
            if user.vip != expected_vip {
                return Err(StoreError::TierChanged);
            }
            user.balance += amount;
            user.updated_at = Utc::now();
            Self::store_user(&mut users, &user)?;

            Self::append_entry(
                &mut rewards,
                &mut meta,
                user_id,
                amount,
                RewardReason::ReferralBonus,
                Some(counterparty.to_string()),
                None,
                None,
                EntryStatus::Confirmed,
            )?;

            user
        };
        txn.commit()?;

        info!(user_id, amount = %amount, "referral bonus credited");
        self.cache(user);
        Ok(())
    }

    // ========================================================================
    // CARD STATE UPDATES
    // ========================================================================

    /// Pending -> Issued, called by the issuance worker once the provider
    /// confirms the card. Guarded so a second confirmation is rejected.
    pub fn mark_card_issued(&self, user_id: u64, kind: CardKind, card_id: &str) -> StoreResult<()> {
        self.update_user(user_id, |user| {
            let slot = user.card_mut(kind);
            if slot.state != CardState::Pending {
                return Err(StoreError::StateConflict);
            }
            slot.state = CardState::Issued;
            slot.card_id = Some(card_id.to_string());
            Ok(())
        })
    }

    /// Record the user-confirmed card number used for code lookups.
    pub fn set_card_ref(&self, user_id: u64, kind: CardKind, number: &str) -> StoreResult<()> {
        self.update_user(user_id, |user| {
            user.card_mut(kind).card_ref = Some(number.to_string());
            Ok(())
        })
    }

    /// Mark a card frozen locally. The provider call happens outside.
    pub fn set_card_frozen(&self, user_id: u64, kind: CardKind) -> StoreResult<()> {
        self.update_user(user_id, |user| {
            user.card_mut(kind).frozen = true;
            Ok(())
        })
    }

    fn update_user<F>(&self, user_id: u64, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut User) -> StoreResult<()>,
    {
        let txn = self.db.begin_write()?;
        let user = {
            let mut users = txn.open_table(USERS)?;
            let mut user = Self::load_user(&users, user_id)?;
            mutate(&mut user)?;
            user.updated_at = Utc::now();
            Self::store_user(&mut users, &user)?;
            user
        };
        txn.commit()?;
        self.cache(user);
        Ok(())
    }

    // ========================================================================
    // EXTERNALLY FED TABLES
    // ========================================================================

    /// Append an operator remark for the user.
    pub fn add_card_record(&self, user_id: u64, remark: &str) -> StoreResult<u64> {
        let txn = self.db.begin_write()?;
        let id = {
            let mut records = txn.open_table(CARD_RECORDS)?;
            let mut meta = txn.open_table(META)?;
            let id = Self::next_id(&mut meta, "card_record_seq")?;
            let record =
                CardRecord { id, user_id, remark: remark.to_string(), created_at: Utc::now() };
            let bytes = serde_json::to_vec(&record)?;
            records.insert(id, bytes.as_slice())?;
            id
        };
        txn.commit()?;
        Ok(id)
    }

    /// Store a provider-synced card code under its masked card number.
    pub fn add_card_code(
        &self,
        card_mask: &str,
        code: &str,
        time: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let txn = self.db.begin_write()?;
        let id = {
            let mut codes = txn.open_table(CARD_CODES)?;
            let mut meta = txn.open_table(META)?;
            let id = Self::next_id(&mut meta, "card_code_seq")?;
            let record =
                CardCode { id, card: card_mask.to_string(), code: code.to_string(), time };
            let bytes = serde_json::to_vec(&record)?;
            codes.insert(id, bytes.as_slice())?;
            id
        };
        txn.commit()?;
        Ok(id)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn user_by_id(&self, id: u64) -> StoreResult<User> {
        if let Some(user) = self.users.get(&id) {
            return Ok(user.clone());
        }
        let read = self.db.begin_read()?;
        let table = read.open_table(USERS)?;
        let user = Self::load_user(&table, id)?;
        self.cache(user.clone());
        Ok(user)
    }

    pub fn user_by_address(&self, address: &str) -> StoreResult<Option<User>> {
        let read = self.db.begin_read()?;
        let index = read.open_table(ADDR_INDEX)?;
        let Some(id) = index.get(address)?.map(|v| v.value()) else {
            return Ok(None);
        };
        let table = read.open_table(USERS)?;
        Ok(Some(Self::load_user(&table, id)?))
    }

    /// Authoritative snapshot of every user, keyed by id.
    pub fn all_users(&self) -> StoreResult<std::collections::HashMap<u64, User>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(USERS)?;
        let mut out = std::collections::HashMap::new();
        let mut iter = table.iter()?;
        while let Some(row) = iter.next() {
            let (_, value) = row?;
            let user: User = serde_json::from_slice(value.value())?;
            out.insert(user.id, user);
        }
        Ok(out)
    }

    pub fn referral_of(&self, user_id: u64) -> StoreResult<Option<ReferralEdge>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(REFERRALS)?;
        let Some(guard) = table.get(user_id)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(guard.value())?))
    }

    /// Direct children of `parent_id`: edges whose path is exactly the
    /// parent's path extended by the parent's id.
    pub fn direct_referrals(
        &self,
        parent_id: u64,
        parent_path: &ReferralPath,
    ) -> StoreResult<Vec<ReferralEdge>> {
        let needle = parent_path.child(parent_id);
        self.scan_referrals(|edge| edge.path == needle)
    }

    /// The whole downline of a user: every edge whose path starts with the
    /// user's subtree prefix.
    pub fn descendants_of(
        &self,
        user_id: u64,
        path: &ReferralPath,
    ) -> StoreResult<Vec<ReferralEdge>> {
        let prefix = path.subtree(user_id);
        self.scan_referrals(|edge| prefix.is_prefix_of(&edge.path))
    }

    fn scan_referrals<F>(&self, keep: F) -> StoreResult<Vec<ReferralEdge>>
    where
        F: Fn(&ReferralEdge) -> bool,
    {
        let read = self.db.begin_read()?;
        let table = read.open_table(REFERRALS)?;
        let mut out = Vec::new();
        let mut iter = table.iter()?;
        while let Some(row) = iter.next() {
            let (_, value) = row?;
            let edge: ReferralEdge = serde_json::from_slice(value.value())?;
            if keep(&edge) {
                out.push(edge);
            }
        }
        Ok(out)
    }

    /// Page through a user's ledger entries, newest first, optionally
    /// filtered by reason and (for funding confirmations) card kind.
    pub fn rewards_page(
        &self,
        user_id: u64,
        reason: Option<RewardReason>,
        card_kind: Option<CardKind>,
        page: usize,
        page_size: usize,
    ) -> StoreResult<(Vec<LedgerEntry>, u64)> {
        let read = self.db.begin_read()?;
        let table = read.open_table(REWARDS)?;
        let mut entries = Vec::new();
        let mut iter = table.iter()?;
        while let Some(row) = iter.next() {
            let (_, value) = row?;
            let entry: LedgerEntry = serde_json::from_slice(value.value())?;
            if entry.user_id != user_id {
                continue;
            }
            if let Some(reason) = reason {
                if entry.reason != reason {
                    continue;
                }
                if reason == RewardReason::CardFundingConfirmed {
                    if let Some(kind) = card_kind {
                        if entry.card_kind != Some(kind) {
                            continue;
                        }
                    }
                }
            }
            entries.push(entry);
        }
        let total = entries.len() as u64;
        entries.sort_by(|a, b| b.id.cmp(&a.id));
        Ok((paginate(entries, page, page_size), total))
    }

    /// All ledger entries of a user, oldest first.
    pub fn rewards_of(&self, user_id: u64) -> StoreResult<Vec<LedgerEntry>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(REWARDS)?;
        let mut entries = Vec::new();
        let mut iter = table.iter()?;
        while let Some(row) = iter.next() {
            let (_, value) = row?;
            let entry: LedgerEntry = serde_json::from_slice(value.value())?;
            if entry.user_id == user_id {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn withdraws_of(&self, user_id: u64) -> StoreResult<Vec<WithdrawRecord>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(WITHDRAWS)?;
        let mut out = Vec::new();
        let mut iter = table.iter()?;
        while let Some(row) = iter.next() {
            let (_, value) = row?;
            let record: WithdrawRecord = serde_json::from_slice(value.value())?;
            if record.user_id == user_id {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn records_page(
        &self,
        user_id: u64,
        page: usize,
        page_size: usize,
    ) -> StoreResult<(Vec<CardRecord>, u64)> {
        let read = self.db.begin_read()?;
        let table = read.open_table(CARD_RECORDS)?;
        let mut records = Vec::new();
        let mut iter = table.iter()?;
        while let Some(row) = iter.next() {
            let (_, value) = row?;
            let record: CardRecord = serde_json::from_slice(value.value())?;
            if record.user_id == user_id {
                records.push(record);
            }
        }
        let total = records.len() as u64;
        records.sort_by(|a, b| b.id.cmp(&a.id));
        Ok((paginate(records, page, page_size), total))
    }

    pub fn card_codes_page(
        &self,
        card_mask: &str,
        page: usize,
        page_size: usize,
    ) -> StoreResult<(Vec<CardCode>, u64)> {
        let read = self.db.begin_read()?;
        let table = read.open_table(CARD_CODES)?;
        let mut codes = Vec::new();
        let mut iter = table.iter()?;
        while let Some(row) = iter.next() {
            let (_, value) = row?;
            let code: CardCode = serde_json::from_slice(value.value())?;
            if code.card == card_mask {
                codes.push(code);
            }
        }
        let total = codes.len() as u64;
        codes.sort_by(|a, b| b.id.cmp(&a.id));
        Ok((paginate(codes, page, page_size), total))
    }

    /// Users with a pending virtual card application, oldest first. Consumed
    /// by the external issuance worker.
    pub fn pending_card_applications(&self) -> StoreResult<Vec<User>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(USERS)?;
        let mut out = Vec::new();
        let mut iter = table.iter()?;
        while let Some(row) = iter.next() {
            let (_, value) = row?;
            let user: User = serde_json::from_slice(value.value())?;
            if user.virtual_card.state == CardState::Pending {
                out.push(user);
            }
        }
        out.sort_by_key(|u| u.id);
        Ok(out)
    }

    pub fn config_value(&self, key: &str) -> StoreResult<Option<String>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(CONFIG)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    /// Numeric config parameter, or the given default when absent or
    /// unparsable.
    pub fn config_decimal(&self, key: &str, default: Decimal) -> Decimal {
        match self.config_value(key) {
            Ok(Some(raw)) => raw.parse().unwrap_or(default),
            _ => default,
        }
    }
}

fn paginate<T>(items: Vec<T>, page: usize, page_size: usize) -> Vec<T> {
    let page = page.max(1);
    let start = (page - 1) * page_size;
    items.into_iter().skip(start).take(page_size).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, LedgerStore) {
        let dir = tempdir().unwrap();
        let store = LedgerStore::open(dir.path().to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_user_rejects_duplicate_address() {
        let (_dir, store) = open_store();
        store.create_user("0xaaa", ReferralPath::root(), 15).unwrap();
        let err = store.create_user("0xaaa", ReferralPath::root(), 0).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAddress));
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_str().unwrap().to_string();
        let id = {
            let store = LedgerStore::open(&path).unwrap();
            let user = store.create_user("0xaaa", ReferralPath::root(), 15).unwrap();
            store.credit_referral_bonus(user.id, Decimal::from(40), 15, "0xroot").unwrap();
            user.id
        };
        let store = LedgerStore::open(&path).unwrap();
        assert_eq!(store.user_by_id(id).unwrap().balance, Decimal::from(40));
    }

    #[test]
    fn referral_bonus_guarded_by_tier() {
        let (_dir, store) = open_store();
        let user = store.create_user("0xaaa", ReferralPath::root(), 15).unwrap();
        let err =
            store.credit_referral_bonus(user.id, Decimal::from(10), 3, "0xother").unwrap_err();
        assert!(matches!(err, StoreError::TierChanged));
        assert_eq!(store.user_by_id(user.id).unwrap().balance, Decimal::ZERO);
        assert!(store.rewards_of(user.id).unwrap().is_empty());
    }

    #[test]
    fn config_defaults_seeded() {
        let (_dir, store) = open_store();
        assert_eq!(
            store.config_decimal("withdraw_rate", Decimal::ZERO),
            "0.05".parse::<Decimal>().unwrap()
        );
    }
}
