// ============================================================================
// REFERRAL TREE - Materialized Ancestor Paths
// ============================================================================
//
// Every user carries the full chain of ancestor ids, root first, immediate
// referrer last. The chain is written once at signup and never mutated, so
// ancestor/descendant questions are answered without walking parent links:
//
//   is X an ancestor of Y?        -> X.id appears in Y.path
//   is X the direct referrer?     -> X.id is the LAST element of Y.path
//   everyone below X?             -> path starts with X.path + [X.id]
//
// Platform roots (signed up with the reserved bonus code) have an empty path.

use serde::{Deserialize, Serialize};

/// Ordered ancestor chain of a user. Does not include the user's own id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReferralPath(Vec<u64>);

impl ReferralPath {
    /// The empty path of a platform root.
    pub fn root() -> Self {
        ReferralPath(Vec::new())
    }

    pub fn new(ids: Vec<u64>) -> Self {
        ReferralPath(ids)
    }

    /// Path of a user referred by `parent_id`, whose own path is `self`.
    pub fn child(&self, parent_id: u64) -> Self {
        let mut ids = self.0.clone();
        ids.push(parent_id);
        ReferralPath(ids)
    }

    /// The direct referrer, or None for a root.
    pub fn immediate_referrer(&self) -> Option<u64> {
        self.0.last().copied()
    }

    /// Broad ancestor test: is `user_id` anywhere in this chain?
    pub fn contains(&self, user_id: u64) -> bool {
        self.0.contains(&user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> &[u64] {
        &self.0
    }

    /// Prefix that every member of `user_id`'s downline must carry.
    pub fn subtree(&self, user_id: u64) -> Self {
        self.child(user_id)
    }

    /// True iff `self` is a (not necessarily proper) prefix of `other`.
    pub fn is_prefix_of(&self, other: &ReferralPath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }
}

impl std::fmt::Display for ReferralPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|id| id.to_string()).collect();
        write!(f, "{}", parts.join(">"))
    }
}

/// One row per user in the `user_recommend` table, written at creation and
/// immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralEdge {
    pub user_id: u64,
    pub path: ReferralPath,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path_is_empty() {
        let root = ReferralPath::root();
        assert!(root.is_empty());
        assert_eq!(root.immediate_referrer(), None);
    }

    #[test]
    fn child_appends_parent_id() {
        let a = ReferralPath::root();
        let b = a.child(1);
        let c = b.child(2);

        assert_eq!(b.ids(), &[1]);
        assert_eq!(c.ids(), &[1, 2]);
        assert_eq!(c.immediate_referrer(), Some(2));
    }

    #[test]
    fn ancestor_membership() {
        let c = ReferralPath::new(vec![1, 2]);
        assert!(c.contains(1));
        assert!(c.contains(2));
        assert!(!c.contains(3));
    }

    #[test]
    fn subtree_prefix_matches_descendants_only() {
        let a_path = ReferralPath::root();
        let b_path = a_path.child(1); // B referred by A (id 1)
        let c_path = b_path.child(2); // C referred by B (id 2)

        let b_subtree = b_path.subtree(2);
        assert!(b_subtree.is_prefix_of(&c_path));
        assert!(!b_subtree.is_prefix_of(&b_path));
        assert!(!b_subtree.is_prefix_of(&a_path));

        // Sibling under A is not in B's downline
        let d_path = a_path.child(1);
        assert!(a_path.subtree(1).is_prefix_of(&d_path));
        assert!(!b_subtree.is_prefix_of(&d_path));
    }

    #[test]
    fn display_joins_ids() {
        assert_eq!(ReferralPath::new(vec![1, 2, 3]).to_string(), "1>2>3");
        assert_eq!(ReferralPath::root().to_string(), "");
    }
}
