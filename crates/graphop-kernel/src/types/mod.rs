//! Traversal vocabulary shared by the policy, planner and executor

use graphop_schema::ModelRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Per-node traversal verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Processed by the operation (moved, re-owned, duplicated, found)
    Include,
    /// Not part of the operation
    Exclude,
    /// Deleted by the operation
    Delete,
    /// Removed from consideration altogether
    Outside,
}

impl Action {
    /// Whether the operation touches the node
    #[inline]
    #[must_use]
    pub fn is_processed(self) -> bool {
        matches!(self, Action::Include | Action::Delete)
    }

    /// Whether an adjuster may move a node from `self` to `to`
    ///
    /// INCLUDE and EXCLUDE may tighten to DELETE or OUTSIDE; nothing loosens.
    #[must_use]
    pub fn may_tighten_to(self, to: Action) -> bool {
        self == to
            || (matches!(self, Action::Include | Action::Exclude)
                && matches!(to, Action::Delete | Action::Outside))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Include => "INCLUDE",
            Action::Exclude => "EXCLUDE",
            Action::Delete => "DELETE",
            Action::Outside => "OUTSIDE",
        };
        f.write_str(s)
    }
}

/// Whether excluding a node would leave it unreferenced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Orphan {
    /// Not yet known
    #[default]
    Relevant,
    /// Every containing referer is processed
    IsLast,
    /// Some containing referer survives
    IsNotLast,
}

impl Orphan {
    /// IS_LAST and IS_NOT_LAST never change once set
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Orphan::Relevant)
    }
}

/// Permission token required to operate on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Ability {
    /// Modify link properties
    Update,
    /// Delete the object
    Delete,
    /// Give the object to another user
    Own,
    /// Move the object to another group
    Chgrp,
    /// Change permission bits
    Chmod,
}

/// Set of abilities, ordered for stable reporting
pub type AbilitySet = BTreeSet<Ability>;

/// The user on whose behalf an operation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// User id
    pub user: u64,
    /// Group the request runs in
    pub group: u64,
    /// Administrators hold every ability
    #[serde(default)]
    pub admin: bool,
}

impl Actor {
    /// A regular user
    #[must_use]
    pub const fn user(user: u64, group: u64) -> Self {
        Self {
            user,
            group,
            admin: false,
        }
    }

    /// An administrator
    #[must_use]
    pub const fn admin(user: u64, group: u64) -> Self {
        Self {
            user,
            group,
            admin: true,
        }
    }
}

/// Bulk operation families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Delete the targets and whatever depends on them
    Delete,
    /// Re-owner
    Chown,
    /// Re-group
    Chgrp,
    /// Re-permission
    Chmod,
    /// Deep copy
    Duplicate,
    /// Report descendants without mutating
    FindChildren,
}

impl OperationKind {
    /// Action assigned to the targets
    #[inline]
    #[must_use]
    pub fn start_action(self) -> Action {
        match self {
            OperationKind::Delete => Action::Delete,
            _ => Action::Include,
        }
    }

    /// Whether the operation writes to the store
    #[inline]
    #[must_use]
    pub fn mutates(self) -> bool {
        !matches!(self, OperationKind::FindChildren)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Delete => "delete",
            OperationKind::Chown => "chown",
            OperationKind::Chgrp => "chgrp",
            OperationKind::Chmod => "chmod",
            OperationKind::Duplicate => "duplicate",
            OperationKind::FindChildren => "find_children",
        };
        f.write_str(s)
    }
}

/// Candidate details: the planner's record for one reached object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Details {
    /// Object this record describes
    pub subject: ModelRef,
    /// Tentative verdict
    pub action: Action,
    /// Orphan status
    pub orphan: Orphan,
    /// Abilities the actor needs for the current verdict
    pub required_abilities: AbilitySet,
    /// Whether abilities are checked for this node
    pub check_permissions: bool,
    /// Namespace, for namespaced classes
    pub namespace: Option<String>,
}

impl Details {
    /// Fresh record with a RELEVANT orphan status and no abilities
    #[must_use]
    pub fn new(subject: ModelRef, action: Action) -> Self {
        Self {
            subject,
            action,
            orphan: Orphan::Relevant,
            required_abilities: AbilitySet::new(),
            check_permissions: true,
            namespace: None,
        }
    }

    /// Set whether permissions are checked
    #[must_use]
    pub fn with_check_permissions(mut self, check: bool) -> Self {
        self.check_permissions = check;
        self
    }

    /// Whether child options and orphan overrides may still decide this node
    #[inline]
    #[must_use]
    pub fn is_undecided_orphan(&self) -> bool {
        self.action == Action::Exclude && self.orphan == Orphan::Relevant
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_only_tighten() {
        assert!(Action::Exclude.may_tighten_to(Action::Delete));
        assert!(Action::Include.may_tighten_to(Action::Outside));
        assert!(Action::Delete.may_tighten_to(Action::Delete));
        assert!(!Action::Delete.may_tighten_to(Action::Include));
        assert!(!Action::Outside.may_tighten_to(Action::Exclude));
        assert!(!Action::Exclude.may_tighten_to(Action::Include));
    }

    #[test]
    fn terminal_orphans() {
        assert!(!Orphan::Relevant.is_terminal());
        assert!(Orphan::IsLast.is_terminal());
        assert!(Orphan::IsNotLast.is_terminal());
    }

    #[test]
    fn delete_starts_with_delete() {
        assert_eq!(OperationKind::Delete.start_action(), Action::Delete);
        assert_eq!(OperationKind::Chgrp.start_action(), Action::Include);
        assert!(!OperationKind::FindChildren.mutates());
    }
}
