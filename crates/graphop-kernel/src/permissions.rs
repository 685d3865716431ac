//! Permission voting
//!
//! The planner asks a [`PermissionVoter`] which abilities each verdict needs
//! and, after fixpoint, whether the actor holds them.

use crate::types::{Ability, AbilitySet, Action, Actor, Details, OperationKind};
use graphop_schema::ModelRef;
use std::collections::BTreeMap;

/// Decides which abilities a node needs and whether an actor holds them
pub trait PermissionVoter: std::fmt::Debug {
    /// Abilities needed to apply the node's current verdict
    fn required_abilities(&self, node: &Details, kind: OperationKind) -> AbilitySet {
        default_abilities(node.action, kind)
    }

    /// Whether `actor` holds every ability in `abilities` on `subject`
    fn has_abilities(&self, actor: &Actor, subject: ModelRef, abilities: &AbilitySet) -> bool;
}

/// Abilities implied by a verdict under an operation
#[must_use]
pub fn default_abilities(action: Action, kind: OperationKind) -> AbilitySet {
    let ability = match (action, kind) {
        (Action::Delete, _) => Some(Ability::Delete),
        (Action::Include, OperationKind::Delete) => Some(Ability::Delete),
        (Action::Include, OperationKind::Chown) => Some(Ability::Own),
        (Action::Include, OperationKind::Chgrp) => Some(Ability::Chgrp),
        (Action::Include, OperationKind::Chmod) => Some(Ability::Chmod),
        _ => None,
    };
    ability.into_iter().collect()
}

/// Voter backed by explicit denials
///
/// Everything is allowed unless denied; administrators ignore denials.
#[derive(Debug, Clone, Default)]
pub struct StaticVoter {
    denied: BTreeMap<ModelRef, AbilitySet>,
}

impl StaticVoter {
    /// Voter that allows everything
    #[must_use]
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Deny `ability` on `subject` to non-administrators
    #[must_use]
    pub fn deny(mut self, subject: ModelRef, ability: Ability) -> Self {
        self.denied.entry(subject).or_default().insert(ability);
        self
    }

    /// Number of objects with denials
    #[inline]
    #[must_use]
    pub fn denial_count(&self) -> usize {
        self.denied.len()
    }
}

impl PermissionVoter for StaticVoter {
    fn has_abilities(&self, actor: &Actor, subject: ModelRef, abilities: &AbilitySet) -> bool {
        if actor.admin || abilities.is_empty() {
            return true;
        }
        match self.denied.get(&subject) {
            Some(denied) => denied.is_disjoint(abilities),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphop_schema::{ClassSpec, SchemaBuilder};

    fn subject() -> ModelRef {
        let schema = SchemaBuilder::new().class(ClassSpec::new("Image")).build().unwrap();
        ModelRef::new(schema.resolve("Image").unwrap(), 1)
    }

    #[test]
    fn verdicts_map_to_abilities() {
        assert_eq!(
            default_abilities(Action::Delete, OperationKind::Chgrp),
            AbilitySet::from([Ability::Delete])
        );
        assert_eq!(
            default_abilities(Action::Include, OperationKind::Chown),
            AbilitySet::from([Ability::Own])
        );
        assert!(default_abilities(Action::Include, OperationKind::FindChildren).is_empty());
        assert!(default_abilities(Action::Exclude, OperationKind::Delete).is_empty());
    }

    #[test]
    fn denials_apply_to_users_only() {
        let image = subject();
        let voter = StaticVoter::allow_all().deny(image, Ability::Delete);
        let wanted = AbilitySet::from([Ability::Delete]);

        assert!(!voter.has_abilities(&Actor::user(2, 1), image, &wanted));
        assert!(voter.has_abilities(&Actor::admin(0, 0), image, &wanted));
        assert!(voter.has_abilities(&Actor::user(2, 1), image, &AbilitySet::from([Ability::Own])));
        assert_eq!(voter.denial_count(), 1);
    }
}
