//! Traversal planner
//!
//! Breadth-first over processed objects, to fixpoint:
//!
//! 1. pop up to `batch_size` queued objects and load their forward and
//!    backward links, plus namespaces of newly reached objects
//! 2. review each through the [`PolicyChain`]; objects that become INCLUDE
//!    or DELETE are queued
//! 3. when the queue drains, resolve pending orphan candidates and queue
//!    their processed containers so the baseline rules see the outcome
//! 4. stop when nothing is queued and nothing is pending
//!
//! All traversal state lives in insertion-ordered maps so two runs over the
//! same store produce the same plan.

use crate::config::ResolvedConfig;
use crate::error::{GraphError, Inconsistency, Violation, ViolationReport};
use crate::permissions::PermissionVoter;
use crate::plan::{ClassBatches, Plan, SeveredLink};
use crate::policy::{Neighborhood, PolicyChain, Review, ReviewContext, WorkingSet};
use crate::store::ObjectStore;
use crate::types::{Ability, AbilitySet, Action, Actor, Details, OperationKind, Orphan};
use graphop_schema::{ClassId, LinkId, ModelRef, Schema};
use indexmap::{IndexMap, IndexSet};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, trace, warn};

/// One known reference between two objects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Edge {
    holder: ModelRef,
    link: LinkId,
    target: ModelRef,
}

/// Plans one operation over one store
#[derive(Debug)]
pub struct Planner<'a> {
    schema: &'a Schema,
    config: &'a ResolvedConfig,
    kind: OperationKind,
    actor: &'a Actor,
    voter: &'a dyn PermissionVoter,
    chain: PolicyChain,
    overrides: BTreeSet<ModelRef>,
}

impl<'a> Planner<'a> {
    /// Planner for `kind` run by `actor`
    #[must_use]
    pub fn new(
        schema: &'a Schema,
        config: &'a ResolvedConfig,
        kind: OperationKind,
        actor: &'a Actor,
        voter: &'a dyn PermissionVoter,
        chain: PolicyChain,
    ) -> Self {
        Self {
            schema,
            config,
            kind,
            actor,
            voter,
            chain,
            overrides: BTreeSet::new(),
        }
    }

    /// Objects whose abilities are not checked
    #[must_use]
    pub fn with_permission_overrides(mut self, overrides: BTreeSet<ModelRef>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Traverse from `targets` and classify everything reached
    ///
    /// # Errors
    /// Store failures, links that can neither be kept nor severed, and
    /// traversals that do not converge within `max_passes`
    pub fn plan(mut self, store: &dyn ObjectStore, targets: &[ModelRef]) -> Result<Plan, GraphError> {
        let ctx = ReviewContext {
            schema: self.schema,
            kind: self.kind,
            actor: self.actor,
            voter: self.voter,
            unnullable: &self.config.unnullable,
        };
        let mut traversal = Traversal::new(self.schema, self.config.batch_size, &self.overrides);

        let start = self.kind.start_action();
        for target in targets {
            let details = traversal.ensure(*target);
            details.action = start;
            details.required_abilities = self.voter.required_abilities(details, self.kind);
            traversal.enqueue(*target);
        }

        let mut passes = 0;
        loop {
            while !traversal.queue.is_empty() {
                passes += 1;
                check_passes(passes, self.config.max_passes)?;
                let batch = traversal.next_batch();
                debug!(pass = passes, batch = batch.len(), queued = traversal.queue.len(), "review pass");
                traversal.review_batch(store, &batch, &mut self.chain, &ctx)?;
            }
            if traversal.find_if_last.is_empty() {
                break;
            }
            passes += 1;
            check_passes(passes, self.config.max_passes)?;
            traversal.resolve_orphans(store, &ctx)?;
        }

        let plan = traversal.into_plan(self.kind, targets, &ctx, self.chain.core().profile().sever_external_links, passes)?;
        debug!(
            kind = %self.kind,
            passes,
            process = plan.to_process.len(),
            delete = plan.to_delete.len(),
            severed = plan.severed.len(),
            violations = plan.violations.len(),
            "plan complete"
        );
        Ok(plan)
    }
}

fn check_passes(passes: usize, max_passes: usize) -> Result<(), GraphError> {
    if passes > max_passes {
        Err(Inconsistency::FixpointNotReached { passes: max_passes }.into())
    } else {
        Ok(())
    }
}

/// Mutable state of one traversal
struct Traversal<'a> {
    schema: &'a Schema,
    batch_size: usize,
    overrides: &'a BTreeSet<ModelRef>,
    details: IndexMap<ModelRef, Details>,
    edges: IndexSet<Edge>,
    outgoing: HashMap<ModelRef, Vec<Edge>>,
    incoming: HashMap<ModelRef, Vec<Edge>>,
    forward_loaded: HashSet<ModelRef>,
    backward_loaded: HashSet<ModelRef>,
    namespace_pending: Vec<ModelRef>,
    queue: VecDeque<ModelRef>,
    queued: HashSet<ModelRef>,
    find_if_last: IndexSet<ModelRef>,
}

impl<'a> Traversal<'a> {
    fn new(schema: &'a Schema, batch_size: usize, overrides: &'a BTreeSet<ModelRef>) -> Self {
        Self {
            schema,
            batch_size,
            overrides,
            details: IndexMap::new(),
            edges: IndexSet::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            forward_loaded: HashSet::new(),
            backward_loaded: HashSet::new(),
            namespace_pending: Vec::new(),
            queue: VecDeque::new(),
            queued: HashSet::new(),
            find_if_last: IndexSet::new(),
        }
    }

    fn ensure(&mut self, subject: ModelRef) -> &mut Details {
        let schema = self.schema;
        let overrides = self.overrides;
        let pending = &mut self.namespace_pending;
        self.details.entry(subject).or_insert_with(|| {
            if schema.namespace_property(subject.class).is_some() {
                pending.push(subject);
            }
            Details::new(subject, Action::Exclude).with_check_permissions(!overrides.contains(&subject))
        })
    }

    fn action(&self, subject: ModelRef) -> Action {
        self.details.get(&subject).map_or(Action::Exclude, |d| d.action)
    }

    fn enqueue(&mut self, subject: ModelRef) {
        if self.queued.insert(subject) {
            self.queue.push_back(subject);
        }
    }

    fn next_batch(&mut self) -> Vec<ModelRef> {
        let take = self.batch_size.min(self.queue.len());
        let batch: Vec<ModelRef> = self.queue.drain(..take).collect();
        for subject in &batch {
            self.queued.remove(subject);
        }
        batch
    }

    fn add_edge(&mut self, edge: Edge) {
        if self.edges.insert(edge) {
            self.outgoing.entry(edge.holder).or_default().push(edge);
            self.incoming.entry(edge.target).or_default().push(edge);
            self.ensure(edge.holder);
            self.ensure(edge.target);
        }
    }

    fn group_by_class(subjects: impl IntoIterator<Item = ModelRef>) -> IndexMap<ClassId, Vec<ModelRef>> {
        let mut groups: IndexMap<ClassId, Vec<ModelRef>> = IndexMap::new();
        for subject in subjects {
            groups.entry(subject.class).or_default().push(subject);
        }
        groups
    }

    fn load_forward(&mut self, store: &dyn ObjectStore, subjects: &[ModelRef]) -> Result<(), GraphError> {
        let fresh: Vec<ModelRef> = subjects
            .iter()
            .copied()
            .filter(|s| self.forward_loaded.insert(*s))
            .collect();
        let schema = self.schema;
        for (class, members) in Self::group_by_class(fresh) {
            let ids: Vec<u64> = members.iter().map(|s| s.id).collect();
            for link in schema.linked_to(class) {
                for chunk in ids.chunks(self.batch_size) {
                    for (id, target) in store.forward_links(class, &link.name, chunk)? {
                        self.add_edge(Edge {
                            holder: ModelRef::new(class, id),
                            link: link.id,
                            target,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn load_backward(&mut self, store: &dyn ObjectStore, subjects: &[ModelRef]) -> Result<(), GraphError> {
        let fresh: Vec<ModelRef> = subjects
            .iter()
            .copied()
            .filter(|s| self.backward_loaded.insert(*s))
            .collect();
        let schema = self.schema;
        for (class, members) in Self::group_by_class(fresh) {
            for link in schema.linked_by(class) {
                for chunk in members.chunks(self.batch_size) {
                    for (holder, target) in store.backward_links(link.declared_on, &link.name, chunk)? {
                        self.add_edge(Edge {
                            holder,
                            link: link.id,
                            target,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn load_namespaces(&mut self, store: &dyn ObjectStore) -> Result<(), GraphError> {
        let pending = std::mem::take(&mut self.namespace_pending);
        for (class, members) in Self::group_by_class(pending) {
            let Some(property) = self.schema.namespace_property(class) else {
                continue;
            };
            let ids: Vec<u64> = members.iter().map(|s| s.id).collect();
            for chunk in ids.chunks(self.batch_size) {
                for (id, value) in store.read_simple(class, property, chunk)? {
                    if let (Some(details), Some(ns)) =
                        (self.details.get_mut(&ModelRef::new(class, id)), value.as_str())
                    {
                        details.namespace = Some(ns.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    fn neighborhood(&self, focus: ModelRef, with_holder_links: bool) -> Neighborhood<'a> {
        let schema = self.schema;
        let linked_to = self
            .outgoing
            .get(&focus)
            .map(|edges| edges.iter().map(|e| (schema.link_by_id(e.link), e.target)).collect())
            .unwrap_or_default();
        let linked_from = self
            .incoming
            .get(&focus)
            .map(|edges| edges.iter().map(|e| (schema.link_by_id(e.link), e.holder)).collect())
            .unwrap_or_default();
        let mut holder_links = Vec::new();
        if with_holder_links {
            for holder in self.incoming.get(&focus).into_iter().flatten().map(|e| e.holder) {
                for edge in self.outgoing.get(&holder).into_iter().flatten() {
                    if edge.target != focus {
                        holder_links.push((holder, schema.link_by_id(edge.link), edge.target));
                    }
                }
            }
        }
        Neighborhood {
            focus,
            linked_to,
            linked_from,
            holder_links,
        }
    }

    fn review_batch(
        &mut self,
        store: &dyn ObjectStore,
        batch: &[ModelRef],
        chain: &mut PolicyChain,
        ctx: &ReviewContext<'_>,
    ) -> Result<(), GraphError> {
        let with_holder_links = chain.core().profile().follow_forward_links;
        self.load_forward(store, batch)?;
        self.load_backward(store, batch)?;
        if with_holder_links {
            let holders: Vec<ModelRef> = batch
                .iter()
                .filter_map(|focus| self.incoming.get(focus))
                .flatten()
                .map(|e| e.holder)
                .collect();
            self.load_forward(store, &holders)?;
        }
        self.load_namespaces(store)?;

        for focus in batch {
            if !self.action(*focus).is_processed() {
                continue;
            }
            let hood = self.neighborhood(*focus, with_holder_links);
            let mut working: WorkingSet = hood
                .subjects()
                .filter_map(|s| self.details.get(&s).map(|d| (s, d.clone())))
                .collect();
            trace!(focus = %focus, action = %self.action(*focus), neighbors = working.len() - 1, "reviewing");
            let review = chain.review(&hood, &mut working, ctx);
            self.apply(review);
        }
        Ok(())
    }

    fn apply(&mut self, review: Review) {
        for changed in review.changed {
            let subject = changed.subject;
            let (action, orphan) = (changed.action, changed.orphan);
            let Some(previous) = self.details.insert(subject, changed) else {
                continue;
            };
            if previous.action != action && action.is_processed() {
                trace!(subject = %subject, from = %previous.action, to = %action, "verdict changed");
                self.enqueue(subject);
            }
            if previous.orphan != orphan {
                self.requeue_containers(subject);
            }
        }
        for candidate in review.orphan_candidates {
            if self.details.get(&candidate).is_some_and(Details::is_undecided_orphan) {
                self.find_if_last.insert(candidate);
            }
        }
    }

    fn containers(&self, subject: ModelRef) -> Vec<ModelRef> {
        let schema = self.schema;
        self.incoming
            .get(&subject)
            .map(|edges| {
                edges
                    .iter()
                    .filter(|e| schema.link_by_id(e.link).containment)
                    .map(|e| e.holder)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn requeue_containers(&mut self, subject: ModelRef) {
        for holder in self.containers(subject) {
            if self.action(holder).is_processed() {
                self.enqueue(holder);
            }
        }
    }

    /// Whether an excluded container may still change because it holds a
    /// non-nullable link to another pending candidate
    fn leans_on_pending(&self, container: ModelRef, candidate: ModelRef, pending: &HashSet<ModelRef>, ctx: &ReviewContext<'_>) -> bool {
        if self.action(container) != Action::Exclude {
            return false;
        }
        self.outgoing.get(&container).is_some_and(|edges| {
            edges.iter().any(|e| {
                e.target != candidate
                    && pending.contains(&e.target)
                    && !ctx.is_nullable(self.schema.link_by_id(e.link))
            })
        })
    }

    fn resolve_orphans(&mut self, store: &dyn ObjectStore, ctx: &ReviewContext<'_>) -> Result<(), GraphError> {
        let pending: Vec<ModelRef> = self
            .find_if_last
            .drain(..)
            .filter(|c| self.details.get(c).is_some_and(Details::is_undecided_orphan))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        self.load_backward(store, &pending)?;
        let excluded_containers: Vec<ModelRef> = pending
            .iter()
            .flat_map(|c| self.containers(*c))
            .filter(|holder| self.action(*holder) == Action::Exclude)
            .collect();
        self.load_forward(store, &excluded_containers)?;
        self.load_namespaces(store)?;

        let pending_set: HashSet<ModelRef> = pending.iter().copied().collect();
        let mut resolved = Vec::new();
        let mut blocked = Vec::new();
        for candidate in &pending {
            let containers = self.containers(*candidate);
            let waits = containers.iter().any(|holder| {
                *holder != *candidate
                    && (pending_set.contains(holder)
                        || self.leans_on_pending(*holder, *candidate, &pending_set, ctx))
            });
            if waits {
                blocked.push(*candidate);
            } else {
                let last = containers.iter().all(|holder| self.action(*holder).is_processed());
                resolved.push((*candidate, last));
            }
        }
        if resolved.is_empty() {
            warn!(count = blocked.len(), "orphan candidates only block each other; keeping them");
            resolved = blocked.drain(..).map(|c| (c, false)).collect();
        }

        for (candidate, last) in resolved {
            let orphan = if last { Orphan::IsLast } else { Orphan::IsNotLast };
            if let Some(details) = self.details.get_mut(&candidate) {
                details.orphan = orphan;
            }
            trace!(subject = %candidate, ?orphan, "orphan resolved");
            self.requeue_containers(candidate);
        }
        self.find_if_last.extend(blocked);
        Ok(())
    }

    fn into_plan(
        self,
        kind: OperationKind,
        targets: &[ModelRef],
        ctx: &ReviewContext<'_>,
        sever_external: bool,
        passes: usize,
    ) -> Result<Plan, GraphError> {
        let mut plan = Plan::empty(kind);
        plan.targets = targets.to_vec();
        plan.passes = passes;

        for (subject, details) in &self.details {
            match details.action {
                Action::Include => plan.to_process.push(*subject),
                Action::Delete => plan.to_delete.push(*subject),
                Action::Exclude | Action::Outside => continue,
            }
            if !details.check_permissions {
                plan.unchecked.insert(*subject);
            }
        }

        for edge in &self.edges {
            let link = self.schema.link_by_id(edge.link);
            let holder = self.action(edge.holder);
            let target = self.action(edge.target);
            let nullable = ctx.is_nullable(link);
            let must_sever = match (holder, target) {
                (Action::Delete, Action::Delete) => {
                    if edge.holder != edge.target && !nullable {
                        plan.dependencies.push((edge.holder, edge.target));
                    }
                    nullable
                }
                (Action::Delete, _) => false,
                (_, Action::Delete) => true,
                (Action::Include, Action::Exclude) | (Action::Exclude, Action::Include) => sever_external,
                _ => false,
            };
            if !must_sever {
                continue;
            }
            if !nullable {
                return Err(Inconsistency::UnseverableLink {
                    holder: edge.holder,
                    property: format!("{}.{}", self.schema.name(link.declared_on), link.name),
                    target: edge.target,
                }
                .into());
            }
            plan.severed.push(SeveredLink {
                holder: edge.holder,
                holder_action: holder,
                link: edge.link,
                target: edge.target,
            });
        }

        plan.violations = self.violations(&plan, ctx);
        Ok(plan)
    }

    fn violations(&self, plan: &Plan, ctx: &ReviewContext<'_>) -> ViolationReport {
        let mut report = ViolationReport::default();
        let mut offenders = HashSet::new();
        let mut check = |subject: ModelRef, required: &AbilitySet| {
            if !ctx.voter.has_abilities(ctx.actor, subject, required) && offenders.insert(subject) {
                report.violations.push(Violation {
                    class: self.schema.name(subject.class).to_string(),
                    id: subject.id,
                    required: required.clone(),
                });
            }
        };
        for (subject, details) in &self.details {
            if details.action.is_processed() && details.check_permissions {
                check(*subject, &details.required_abilities);
            }
        }
        let update = AbilitySet::from([Ability::Update]);
        for severed in &plan.severed {
            let checked = self.details.get(&severed.holder).is_some_and(|d| d.check_permissions);
            if !severed.holder_action.is_processed() && checked {
                check(severed.holder, &update);
            }
        }
        report
    }
}
