//! Graph policy: baseline rules plus an ordered chain of adjusters
//!
//! A review looks at one focus node together with the objects it links to
//! and the objects linking to it. The chain works on copies of their
//! [`Details`] in a [`WorkingSet`]:
//!
//! 1. outermost-first, any adjuster may halt the review of the focus
//! 2. innermost-first, adjusters rewrite nodes before the baseline rules
//! 3. [`BasePolicy`] applies the baseline rules
//! 4. innermost-first, adjusters rewrite nodes after the baseline rules
//!
//! The review returns the nodes whose details differ from the input. Orphan
//! statuses already IS_LAST or IS_NOT_LAST survive every adjuster, and an
//! adjuster may only tighten an action unless it declares itself an override.

pub mod adjusters;
pub mod core;

pub use self::core::{BasePolicy, RuleProfile};
pub use adjusters::{
    ChildOption, ChildOptionsPolicy, DeferredTargets, HeadTruncation, OrphanOverride,
    PolicyAdjuster, ResolvedChildOption, TailTruncation, TypeIgnore,
};

use crate::error::GraphError;
use crate::permissions::PermissionVoter;
use crate::types::{Actor, Details, OperationKind};
use graphop_schema::{LinkId, LinkProperty, ModelRef, Schema};
use indexmap::IndexMap;
use std::collections::HashSet;
use tracing::trace;

/// Copies of the details a review may change, keyed by subject
pub type WorkingSet = IndexMap<ModelRef, Details>;

/// Read-only inputs shared by every review of a run
#[derive(Debug, Clone, Copy)]
pub struct ReviewContext<'a> {
    /// Schema of the graph
    pub schema: &'a Schema,
    /// Operation being planned
    pub kind: OperationKind,
    /// User running the operation
    pub actor: &'a Actor,
    /// Ability oracle
    pub voter: &'a dyn PermissionVoter,
    /// Links configured as never severable
    pub unnullable: &'a HashSet<LinkId>,
}

impl ReviewContext<'_> {
    /// Whether `link` may be severed by nulling or filtering
    #[inline]
    #[must_use]
    pub fn is_nullable(&self, link: &LinkProperty) -> bool {
        link.nullable && !self.unnullable.contains(&link.id)
    }

    /// Whether the actor may process `node` under `details`
    #[must_use]
    pub fn may_process(&self, details: &Details) -> bool {
        if !details.check_permissions {
            return true;
        }
        let required = self.voter.required_abilities(details, self.kind);
        self.voter.has_abilities(self.actor, details.subject, &required)
    }
}

/// The focus node and its direct links
#[derive(Debug, Clone)]
pub struct Neighborhood<'s> {
    /// Node under review
    pub focus: ModelRef,
    /// Links held by the focus, with their targets
    pub linked_to: Vec<(&'s LinkProperty, ModelRef)>,
    /// Links referencing the focus, with their holders
    pub linked_from: Vec<(&'s LinkProperty, ModelRef)>,
    /// Other links of those holders as `(holder, link, target)`; loaded only
    /// for duplication, empty otherwise
    pub holder_links: Vec<(ModelRef, &'s LinkProperty, ModelRef)>,
}

impl Neighborhood<'_> {
    /// Every subject a review of this neighborhood may touch
    pub fn subjects(&self) -> impl Iterator<Item = ModelRef> + '_ {
        std::iter::once(self.focus)
            .chain(self.linked_to.iter().map(|(_, target)| *target))
            .chain(self.linked_from.iter().map(|(_, holder)| *holder))
            .chain(self.holder_links.iter().map(|(_, _, target)| *target))
    }
}

/// Outcome of one review
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Review {
    /// Nodes whose details changed
    pub changed: Vec<Details>,
    /// Containment children whose orphan status must be resolved
    pub orphan_candidates: Vec<ModelRef>,
}

impl Review {
    /// Whether nothing changed and nothing awaits resolution
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.orphan_candidates.is_empty()
    }
}

/// Baseline rules wrapped by adjusters, innermost first
#[derive(Debug)]
pub struct PolicyChain {
    core: BasePolicy,
    adjusters: Vec<Box<dyn PolicyAdjuster>>,
}

impl PolicyChain {
    /// Chain with no adjusters
    #[must_use]
    pub fn new(core: BasePolicy) -> Self {
        Self {
            core,
            adjusters: Vec::new(),
        }
    }

    /// Wrap the chain in one more (outer) adjuster
    #[must_use]
    pub fn wrap(mut self, adjuster: impl PolicyAdjuster + 'static) -> Self {
        self.adjusters.push(Box::new(adjuster));
        self
    }

    /// Wrap the chain in an already boxed adjuster
    #[must_use]
    pub fn wrap_boxed(mut self, adjuster: Box<dyn PolicyAdjuster>) -> Self {
        self.adjusters.push(adjuster);
        self
    }

    /// Adjuster names, innermost first
    #[must_use]
    pub fn adjuster_names(&self) -> Vec<&'static str> {
        self.adjusters.iter().map(|a| a.name()).collect()
    }

    /// Baseline rules in use
    #[inline]
    #[must_use]
    pub fn core(&self) -> &BasePolicy {
        &self.core
    }

    /// Review one neighborhood
    ///
    /// `working` must hold details for every subject of `hood`; it is left
    /// holding the reviewed values.
    pub fn review(
        &mut self,
        hood: &Neighborhood<'_>,
        working: &mut WorkingSet,
        ctx: &ReviewContext<'_>,
    ) -> Review {
        let Some(focus) = working.get(&hood.focus) else {
            return Review::default();
        };
        for adjuster in self.adjusters.iter_mut().rev() {
            if adjuster.halts_review(focus, ctx) {
                trace!(focus = %hood.focus, adjuster = adjuster.name(), "review halted");
                return Review::default();
            }
        }

        let original = working.clone();
        for adjuster in &mut self.adjusters {
            for node in working.values_mut() {
                if let Some(proposed) = adjuster.adjust_before_review(node, ctx) {
                    fold_adjustment(node, proposed, adjuster.as_ref());
                }
            }
        }
        let orphan_candidates = self.core.review(hood, working, ctx);
        for adjuster in &mut self.adjusters {
            for node in working.values_mut() {
                if let Some(proposed) = adjuster.adjust_after_review(node, ctx) {
                    fold_adjustment(node, proposed, adjuster.as_ref());
                }
            }
        }

        let changed = working
            .values()
            .filter(|node| original.get(&node.subject) != Some(*node))
            .cloned()
            .collect();
        Review {
            changed,
            orphan_candidates,
        }
    }

    /// Fresh chain for another run
    ///
    /// # Errors
    /// [`GraphError::IllegalState`] if an adjuster is single-use
    pub fn clean_instance(&self) -> Result<Self, GraphError> {
        let adjusters = self
            .adjusters
            .iter()
            .map(|a| a.clean_instance())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            core: self.core.clone(),
            adjusters,
        })
    }
}

/// Apply an adjuster's proposal within the chain's invariants
fn fold_adjustment(node: &mut Details, mut proposed: Details, adjuster: &dyn PolicyAdjuster) -> bool {
    proposed.subject = node.subject;
    if node.orphan.is_terminal() {
        proposed.orphan = node.orphan;
    }
    if !adjuster.overrides_action() && !node.action.may_tighten_to(proposed.action) {
        trace!(
            subject = %node.subject,
            from = %node.action,
            to = %proposed.action,
            adjuster = adjuster.name(),
            "loosening ignored"
        );
        proposed.action = node.action;
    }
    if proposed == *node {
        false
    } else {
        *node = proposed;
        true
    }
}
