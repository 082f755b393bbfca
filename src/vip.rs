// ============================================================================
// PRIVILEGE TIERS - Authorization Engine
// ============================================================================
//
// Decides whether one user may change another user's tier. Pure function
// over a snapshot of the user table: no storage access, no side effects.
// Lower tier numbers rank LOWER here; an actor can only hand out tiers
// strictly below their own.
//
// Two modes, selected by the actor's broad-grant flag:
//
//   broad grant:    the actor may be ANY ancestor of the target.
//   direct report:  the actor must be the target's immediate referrer, and
//                   the new tier must stay strictly above every tier already
//                   held in the target's own downline.
//
// The asymmetry (broad grant skips the downline cap) is deliberate platform
// behavior; do not "fix" it.

use std::collections::HashMap;

use thiserror::Error;

use crate::referral::{ReferralEdge, ReferralPath};
use crate::storage::User;

/// Lowest assignable tier.
pub const TIER_MIN: u8 = 0;
/// Highest assignable tier.
pub const TIER_MAX: u8 = 14;
/// Tier granted once to users who sign up with the reserved root bonus code.
/// Sits above the assignable range so roots outrank everyone.
pub const TIER_ROOT: u8 = 15;

/// Why a tier change was refused. `Display` strings are caller-facing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TierDenied {
    #[error("tier must be between 0 and 14")]
    OutOfRange,
    #[error("tier must be lower than your own")]
    NotBelowOwn,
    #[error("no change needed")]
    NoChange,
    #[error("target has no referrer")]
    NoReferrer,
    #[error("target is not in your team")]
    NotInTeam,
    #[error("target is not your direct referral")]
    NotDirectReferral,
    #[error("a downline member already holds an equal or higher tier")]
    DownlineConflict,
    #[error("user snapshot incomplete")]
    MissingSnapshot,
}

/// Decide whether `actor` may set `target`'s tier to `requested`.
///
/// `users` is a snapshot of all users keyed by id; `target_descendants` is
/// the target's whole downline (every edge whose path starts with the
/// target's subtree prefix). Both are read before the decision and the
/// caller serializes tier changes per target, so the snapshot stays valid
/// until the write lands.
pub fn authorize_tier_change(
    actor: &User,
    target: &User,
    target_path: &ReferralPath,
    requested: u8,
    users: &HashMap<u64, User>,
    target_descendants: &[ReferralEdge],
) -> Result<(), TierDenied> {
    if requested > TIER_MAX {
        return Err(TierDenied::OutOfRange);
    }
    if requested >= actor.vip {
        return Err(TierDenied::NotBelowOwn);
    }
    if requested == target.vip {
        return Err(TierDenied::NoChange);
    }
    if target_path.is_empty() {
        return Err(TierDenied::NoReferrer);
    }

    if actor.can_vip {
        // Broad grant: any ancestor qualifies.
        if !target_path.contains(actor.id) {
            return Err(TierDenied::NotInTeam);
        }
    } else {
        // Direct report: immediate referrer only. Being a higher ancestor
        // is not enough.
        if target_path.immediate_referrer() != Some(actor.id) {
            return Err(TierDenied::NotDirectReferral);
        }

        // The new tier must dominate the target's entire downline.
        for edge in target_descendants {
            let member = users.get(&edge.user_id).ok_or(TierDenied::MissingSnapshot)?;
            if requested <= member.vip {
                return Err(TierDenied::DownlineConflict);
            }
        }
    }

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
