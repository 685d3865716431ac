//! Baseline traversal rules
//!
//! For a processed (INCLUDE or DELETE) focus:
//!
//! - **dependents follow**: an object holding a non-nullable link to the
//!   focus takes the focus's action; an included holder of a link to a
//!   deleted focus is deleted too
//! - **containment**: an excluded object contained by the focus becomes an
//!   orphan candidate; once known to be the last, it takes the focus's action
//! - **severing** (re-group): an included focus holding a non-nullable link
//!   to an object that stays behind is deleted instead
//! - **forward following** (duplication): excluded objects the focus links to
//!   are included unless already known not to be orphans; a dependent that
//!   also holds a non-nullable link to an excluded object elsewhere stays out
//!   of the copy
//!
//! Every reviewed node is then given the abilities its verdict requires.

use super::{Neighborhood, ReviewContext, WorkingSet};
use crate::types::{AbilitySet, Action, OperationKind, Orphan};
use graphop_schema::ModelRef;

/// Switches selecting the optional rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuleProfile {
    /// Delete included objects stuck to objects that stay behind
    pub sever_external_links: bool,
    /// Include whatever an included object links to
    pub follow_forward_links: bool,
}

impl RuleProfile {
    /// Rules used by each operation
    #[must_use]
    pub fn for_kind(kind: OperationKind) -> Self {
        Self {
            sever_external_links: kind == OperationKind::Chgrp,
            follow_forward_links: kind == OperationKind::Duplicate,
        }
    }
}

/// The innermost policy of every chain
#[derive(Debug, Clone, Default)]
pub struct BasePolicy {
    profile: RuleProfile,
}

impl BasePolicy {
    /// Baseline rules with the given profile
    #[must_use]
    pub fn new(profile: RuleProfile) -> Self {
        Self { profile }
    }

    /// Baseline rules for an operation
    #[must_use]
    pub fn for_kind(kind: OperationKind) -> Self {
        Self::new(RuleProfile::for_kind(kind))
    }

    /// Rules in use
    #[inline]
    #[must_use]
    pub fn profile(&self) -> RuleProfile {
        self.profile
    }

    /// Apply the rules, returning new orphan candidates
    pub fn review(
        &self,
        hood: &Neighborhood<'_>,
        working: &mut WorkingSet,
        ctx: &ReviewContext<'_>,
    ) -> Vec<ModelRef> {
        let mut candidates = Vec::new();
        let focus_action = working.get(&hood.focus).map(|d| d.action);
        if let Some(action) = focus_action.filter(|a| a.is_processed()) {
            self.follow_dependents(hood, working, ctx, action);
            self.settle_children(hood, working, action, &mut candidates);
            if self.profile.sever_external_links && action == Action::Include {
                self.sever(hood, working, ctx);
            }
            if self.profile.follow_forward_links && action == Action::Include {
                follow_forward(hood, working);
            }
        }
        for node in working.values_mut() {
            node.required_abilities = if node.action.is_processed() {
                ctx.voter.required_abilities(node, ctx.kind)
            } else {
                AbilitySet::new()
            };
        }
        candidates
    }

    fn follow_dependents(
        &self,
        hood: &Neighborhood<'_>,
        working: &mut WorkingSet,
        ctx: &ReviewContext<'_>,
        action: Action,
    ) {
        for (link, holder) in &hood.linked_from {
            if *holder == hood.focus || ctx.is_nullable(link) {
                continue;
            }
            if self.profile.follow_forward_links && anchored_elsewhere(hood, *holder, working, ctx) {
                continue;
            }
            let Some(node) = working.get_mut(holder) else {
                continue;
            };
            match (node.action, action) {
                (Action::Exclude, _) | (Action::Include, Action::Delete) => node.action = action,
                _ => {}
            }
        }
    }

    fn settle_children(
        &self,
        hood: &Neighborhood<'_>,
        working: &mut WorkingSet,
        action: Action,
        candidates: &mut Vec<ModelRef>,
    ) {
        for (link, target) in &hood.linked_to {
            if !link.containment || *target == hood.focus {
                continue;
            }
            let Some(node) = working.get_mut(target) else {
                continue;
            };
            if node.action != Action::Exclude {
                continue;
            }
            match node.orphan {
                Orphan::Relevant => candidates.push(*target),
                Orphan::IsLast => node.action = action,
                Orphan::IsNotLast => {}
            }
        }
    }

    fn sever(&self, hood: &Neighborhood<'_>, working: &mut WorkingSet, ctx: &ReviewContext<'_>) {
        let stuck = hood.linked_to.iter().any(|(link, target)| {
            if ctx.is_nullable(link) {
                return false;
            }
            working.get(target).is_some_and(|node| {
                node.action == Action::Exclude
                    && (!link.containment || node.orphan == Orphan::IsNotLast)
            })
        });
        if stuck {
            if let Some(focus) = working.get_mut(&hood.focus) {
                focus.action = Action::Delete;
            }
        }
    }
}

/// Whether `holder` needs an excluded object other than the focus through a
/// non-nullable, non-containment link
fn anchored_elsewhere(hood: &Neighborhood<'_>, holder: ModelRef, working: &WorkingSet, ctx: &ReviewContext<'_>) -> bool {
    hood.holder_links.iter().any(|(h, link, target)| {
        *h == holder
            && *target != hood.focus
            && !link.containment
            && !ctx.is_nullable(link)
            && working.get(target).is_some_and(|node| node.action == Action::Exclude)
    })
}

fn follow_forward(hood: &Neighborhood<'_>, working: &mut WorkingSet) {
    for (_, target) in &hood.linked_to {
        if let Some(node) = working.get_mut(target) {
            if node.action == Action::Exclude && node.orphan != Orphan::IsNotLast {
                node.action = Action::Include;
            }
        }
    }
}
