//! Plan execution
//!
//! Execution runs in two phases with separate executors: **unlink** nulls or
//! filters every severed reference, then **process** deletes objects and
//! applies the operation's mutation. Each batch addresses one class with a
//! set of ids and goes to the [`Processor`] in a single call.

use crate::dag::DependencyGraph;
use crate::error::{GraphError, Violation, ViolationReport};
use crate::permissions::{default_abilities, PermissionVoter};
use crate::plan::Plan;
use crate::store::{DetailsChange, ObjectStore};
use crate::types::{Ability, AbilitySet, Action, Actor, OperationKind};
use graphop_schema::{ClassId, LinkId, ModelRef, Schema};
use indexmap::{IndexMap, IndexSet};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Applies batches to the store
pub trait Processor {
    /// Null a to-one property
    ///
    /// # Errors
    /// Store failures
    fn null_properties(&mut self, class: ClassId, property: &str, ids: &[u64]) -> Result<usize, GraphError>;

    /// Remove items from a to-many property
    ///
    /// # Errors
    /// Store failures
    fn filter_properties(
        &mut self,
        class: ClassId,
        property: &str,
        ids: &[u64],
        remove: &[ModelRef],
    ) -> Result<usize, GraphError>;

    /// Delete objects
    ///
    /// # Errors
    /// Store failures
    fn delete_instances(&mut self, class: ClassId, ids: &[u64]) -> Result<usize, GraphError>;

    /// Apply the operation's mutation
    ///
    /// # Errors
    /// Store failures
    fn process_instances(&mut self, class: ClassId, ids: &[u64]) -> Result<usize, GraphError>;

    /// Check the actor's abilities before a batch
    ///
    /// # Errors
    /// [`GraphError::PolicyViolation`] naming every object lacking abilities
    fn assert_may_process(&self, class: ClassId, ids: &[u64], abilities: &AbilitySet) -> Result<(), GraphError>;

    /// Order the deletion targets of one class
    fn arrange_deletion_targets(&self, _class: ClassId, ids: Vec<u64>) -> Vec<u64> {
        ids
    }
}

/// Processor writing through an [`ObjectStore`]
pub struct StoreProcessor<'a> {
    store: &'a mut dyn ObjectStore,
    schema: &'a Schema,
    mutation: Option<DetailsChange>,
    actor: &'a Actor,
    voter: &'a dyn PermissionVoter,
    unchecked: &'a BTreeSet<ModelRef>,
}

impl<'a> StoreProcessor<'a> {
    /// Processor applying `mutation` to processed objects
    pub fn new(
        store: &'a mut dyn ObjectStore,
        schema: &'a Schema,
        mutation: Option<DetailsChange>,
        actor: &'a Actor,
        voter: &'a dyn PermissionVoter,
        unchecked: &'a BTreeSet<ModelRef>,
    ) -> Self {
        Self {
            store,
            schema,
            mutation,
            actor,
            voter,
            unchecked,
        }
    }
}

impl Processor for StoreProcessor<'_> {
    fn null_properties(&mut self, class: ClassId, property: &str, ids: &[u64]) -> Result<usize, GraphError> {
        Ok(self.store.null_property(class, property, ids)?)
    }

    fn filter_properties(
        &mut self,
        class: ClassId,
        property: &str,
        ids: &[u64],
        remove: &[ModelRef],
    ) -> Result<usize, GraphError> {
        Ok(self.store.filter_collection(class, property, ids, remove)?)
    }

    fn delete_instances(&mut self, class: ClassId, ids: &[u64]) -> Result<usize, GraphError> {
        Ok(self.store.delete(class, ids)?)
    }

    fn process_instances(&mut self, class: ClassId, ids: &[u64]) -> Result<usize, GraphError> {
        match self.mutation {
            Some(change) => Ok(self.store.update_details(class, ids, change)?),
            None => Ok(0),
        }
    }

    fn assert_may_process(&self, class: ClassId, ids: &[u64], abilities: &AbilitySet) -> Result<(), GraphError> {
        let violations: Vec<Violation> = ids
            .iter()
            .map(|id| ModelRef::new(class, *id))
            .filter(|subject| !self.unchecked.contains(subject))
            .filter(|subject| !self.voter.has_abilities(self.actor, *subject, abilities))
            .map(|subject| Violation {
                class: self.schema.name(class).to_string(),
                id: subject.id,
                required: abilities.clone(),
            })
            .collect();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(GraphError::PolicyViolation(ViolationReport { violations }))
        }
    }
}

/// Wrapper that checks permissions but writes nothing
///
/// Every write reports the number of ids it would have touched.
pub struct DryRunProcessor<P> {
    inner: P,
}

impl<P: Processor> DryRunProcessor<P> {
    /// Wrap a processor
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: Processor> Processor for DryRunProcessor<P> {
    fn null_properties(&mut self, _class: ClassId, _property: &str, ids: &[u64]) -> Result<usize, GraphError> {
        Ok(ids.len())
    }

    fn filter_properties(
        &mut self,
        _class: ClassId,
        _property: &str,
        ids: &[u64],
        _remove: &[ModelRef],
    ) -> Result<usize, GraphError> {
        Ok(ids.len())
    }

    fn delete_instances(&mut self, _class: ClassId, ids: &[u64]) -> Result<usize, GraphError> {
        Ok(ids.len())
    }

    fn process_instances(&mut self, _class: ClassId, ids: &[u64]) -> Result<usize, GraphError> {
        Ok(ids.len())
    }

    fn assert_may_process(&self, class: ClassId, ids: &[u64], abilities: &AbilitySet) -> Result<(), GraphError> {
        self.inner.assert_may_process(class, ids, abilities)
    }

    fn arrange_deletion_targets(&self, class: ClassId, ids: Vec<u64>) -> Vec<u64> {
        self.inner.arrange_deletion_targets(class, ids)
    }
}

/// What a batch does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Null a to-one property
    Null {
        /// Holder class
        class: ClassId,
        /// Property name
        property: String,
    },
    /// Remove items from a to-many property
    Filter {
        /// Holder class
        class: ClassId,
        /// Property name
        property: String,
        /// Items to remove
        remove: Vec<ModelRef>,
    },
    /// Delete objects
    Delete {
        /// Concrete class
        class: ClassId,
    },
    /// Apply the mutation
    Process {
        /// Concrete class
        class: ClassId,
    },
}

impl BatchOp {
    fn class(&self) -> ClassId {
        match self {
            BatchOp::Null { class, .. }
            | BatchOp::Filter { class, .. }
            | BatchOp::Delete { class }
            | BatchOp::Process { class } => *class,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            BatchOp::Null { .. } => "null",
            BatchOp::Filter { .. } => "filter",
            BatchOp::Delete { .. } => "delete",
            BatchOp::Process { .. } => "process",
        }
    }
}

/// One processor call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Operation
    pub op: BatchOp,
    /// Ids addressed
    pub ids: Vec<u64>,
    /// Abilities asserted before the call
    pub abilities: AbilitySet,
}

/// Counts of affected objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Batches run
    pub batches: usize,
    /// Holders whose to-one links were nulled
    pub nulled: usize,
    /// Holders whose collections were filtered
    pub filtered: usize,
    /// Objects deleted
    pub deleted: usize,
    /// Objects mutated
    pub processed: usize,
}

impl ExecutionSummary {
    /// Sum two summaries
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            batches: self.batches + other.batches,
            nulled: self.nulled + other.nulled,
            filtered: self.filtered + other.filtered,
            deleted: self.deleted + other.deleted,
            processed: self.processed + other.processed,
        }
    }
}

/// Execution phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Sever references
    Unlink,
    /// Delete and mutate
    Process,
}

/// Ordered batches of one phase
#[derive(Debug, Clone)]
pub struct BatchExecutor {
    phase: Phase,
    batches: Vec<Batch>,
}

impl BatchExecutor {
    /// Batches severing every reference the plan lists
    ///
    /// Holders are grouped by class, property and verdict so every holder of
    /// a group drops the same set of targets.
    #[must_use]
    pub fn unlink(plan: &Plan, schema: &Schema, batch_size: usize) -> Self {
        type Group = (IndexSet<u64>, IndexSet<ModelRef>);
        let mut groups: IndexMap<(ClassId, LinkId, Action), Group> = IndexMap::new();
        for severed in &plan.severed {
            let key = (severed.holder.class, severed.link, severed.holder_action);
            let (holders, targets) = groups.entry(key).or_default();
            holders.insert(severed.holder.id);
            targets.insert(severed.target);
        }

        let mut batches = Vec::new();
        for ((class, link, holder_action), (holders, targets)) in groups {
            let link = schema.link_by_id(link);
            let abilities = if holder_action.is_processed() {
                AbilitySet::new()
            } else {
                AbilitySet::from([Ability::Update])
            };
            let ids: Vec<u64> = holders.into_iter().collect();
            let remove: Vec<ModelRef> = targets.into_iter().collect();
            for chunk in ids.chunks(batch_size) {
                let op = if link.is_to_many() {
                    BatchOp::Filter {
                        class,
                        property: link.name.clone(),
                        remove: remove.clone(),
                    }
                } else {
                    BatchOp::Null {
                        class,
                        property: link.name.clone(),
                    }
                };
                batches.push(Batch {
                    op,
                    ids: chunk.to_vec(),
                    abilities: abilities.clone(),
                });
            }
        }
        Self {
            phase: Phase::Unlink,
            batches,
        }
    }

    /// Batches deleting and mutating the plan's objects
    ///
    /// Deletions come first, layered so that an object holding a non-nullable
    /// link to another deleted object goes in an earlier batch.
    ///
    /// # Errors
    /// [`Inconsistency::DeletionCycle`](crate::error::Inconsistency) when
    /// deleted objects hold non-nullable links in a loop
    pub fn process(
        plan: &Plan,
        batch_size: usize,
        processor: &dyn Processor,
    ) -> Result<Self, GraphError> {
        let mut graph = DependencyGraph::new();
        let mut rank = HashMap::new();
        for (index, subject) in plan.to_delete.refs().enumerate() {
            graph.add_node(subject);
            rank.insert(subject, index);
        }
        for (referer, referee) in &plan.dependencies {
            graph.add_edge(*referer, *referee);
        }

        let mut batches = Vec::new();
        let delete = default_abilities(Action::Delete, plan.kind);
        for layer in graph.layers(&rank)? {
            let mut by_class: IndexMap<ClassId, Vec<u64>> = IndexMap::new();
            for subject in layer {
                by_class.entry(subject.class).or_default().push(subject.id);
            }
            for (class, ids) in by_class {
                let ids = processor.arrange_deletion_targets(class, ids);
                for chunk in ids.chunks(batch_size) {
                    batches.push(Batch {
                        op: BatchOp::Delete { class },
                        ids: chunk.to_vec(),
                        abilities: delete.clone(),
                    });
                }
            }
        }

        let include = default_abilities(Action::Include, plan.kind);
        if plan.kind.mutates() && plan.kind != OperationKind::Duplicate {
            for (class, ids) in plan.to_process.iter() {
                for chunk in ids.chunks(batch_size) {
                    batches.push(Batch {
                        op: BatchOp::Process { class },
                        ids: chunk.to_vec(),
                        abilities: include.clone(),
                    });
                }
            }
        }
        Ok(Self {
            phase: Phase::Process,
            batches,
        })
    }

    /// Phase of these batches
    #[inline]
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Batches in execution order
    #[inline]
    #[must_use]
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Run every batch in order
    ///
    /// # Errors
    /// The first failing permission assertion or store call; earlier batches
    /// stay applied
    pub fn execute(&self, processor: &mut dyn Processor) -> Result<ExecutionSummary, GraphError> {
        let mut summary = ExecutionSummary::default();
        for batch in &self.batches {
            let class = batch.op.class();
            if !batch.abilities.is_empty() {
                processor.assert_may_process(class, &batch.ids, &batch.abilities)?;
            }
            let affected = match &batch.op {
                BatchOp::Null { class, property } => {
                    let n = processor.null_properties(*class, property, &batch.ids)?;
                    summary.nulled += n;
                    n
                }
                BatchOp::Filter {
                    class,
                    property,
                    remove,
                } => {
                    let n = processor.filter_properties(*class, property, &batch.ids, remove)?;
                    summary.filtered += n;
                    n
                }
                BatchOp::Delete { class } => {
                    let n = processor.delete_instances(*class, &batch.ids)?;
                    summary.deleted += n;
                    n
                }
                BatchOp::Process { class } => {
                    let n = processor.process_instances(*class, &batch.ids)?;
                    summary.processed += n;
                    n
                }
            };
            summary.batches += 1;
            debug!(phase = ?self.phase, op = batch.op.label(), class = %class, ids = batch.ids.len(), affected, "batch executed");
        }
        Ok(summary)
    }
}
