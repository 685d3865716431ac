//! Operation requests
//!
//! A [`Request`] walks the [`RequestState`] machine one step per call:
//!
//! | state        | step                                                   |
//! |--------------|--------------------------------------------------------|
//! | `Planning`   | load targets, traverse, remove files of side deletions |
//! | `Validating` | refuse plans with policy violations                    |
//! | `Processing` | build executors or prepare duplicates                  |
//! | `Unlinking`  | sever references                                       |
//! | `Executing`  | delete, mutate or persist duplicates                   |
//!
//! Any failure moves the request to `Failed` and is reported with the step
//! index. Dry runs execute every step with writes suppressed.

pub mod operation;
pub mod skip_head;

pub use operation::{Operation, OperationRequest, OperationResponse, SkipHead};
pub use skip_head::SkipHeadRequest;

use crate::config::ResolvedConfig;
use crate::duplicate::Duplicator;
use crate::error::{GraphError, RequestFailure};
use crate::executor::{BatchExecutor, DryRunProcessor, ExecutionSummary, StoreProcessor};
use crate::permissions::PermissionVoter;
use crate::plan::{ClassBatches, Plan};
use crate::planner::Planner;
use crate::policy::{BasePolicy, ChildOptionsPolicy, OrphanOverride, PolicyChain, TailTruncation, TypeIgnore};
use crate::state_machine::{validate_transition, RequestState};
use crate::store::{DetailsChange, FileRepository, ObjectStore};
use crate::types::{Actor, OperationKind};
use graphop_schema::{ClassId, ModelRef, Schema, Specificity, SpecificityClassifier};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Collaborators a step works against
pub struct StepContext<'s> {
    /// Object store
    pub store: &'s mut dyn ObjectStore,
    /// Backing files, when the deployment has any
    pub files: Option<&'s mut dyn FileRepository>,
}

impl<'s> StepContext<'s> {
    /// Context without a file repository
    pub fn new(store: &'s mut dyn ObjectStore) -> Self {
        Self { store, files: None }
    }

    /// Attach a file repository
    #[must_use]
    pub fn with_files(mut self, files: &'s mut dyn FileRepository) -> Self {
        self.files = Some(files);
        self
    }
}

/// Engine parts a request borrows
#[derive(Debug, Clone, Copy)]
pub(crate) struct Environment<'e> {
    pub(crate) schema: &'e Schema,
    pub(crate) config: &'e ResolvedConfig,
    pub(crate) voter: &'e dyn PermissionVoter,
}

/// Validated request inputs
#[derive(Debug)]
pub(crate) struct Prepared {
    pub(crate) kind: OperationKind,
    pub(crate) mutation: Option<DetailsChange>,
    pub(crate) targets: Vec<(ClassId, Vec<u64>)>,
    pub(crate) dry_run: bool,
    pub(crate) chain: PolicyChain,
    pub(crate) classifier: Option<SpecificityClassifier>,
    pub(crate) child_types: Vec<ClassId>,
    pub(crate) overrides: BTreeSet<ModelRef>,
}

fn resolve_names(schema: &Schema, names: &[String]) -> Result<Vec<ClassId>, GraphError> {
    names
        .iter()
        .map(|name| schema.resolve(name).map_err(GraphError::from))
        .collect()
}

impl Prepared {
    /// Validate a request against the schema and build its policy chain
    pub(crate) fn from_request(
        schema: &Schema,
        request: &OperationRequest,
        targets: Vec<(ClassId, Vec<u64>)>,
    ) -> Result<Self, GraphError> {
        if targets.iter().all(|(_, ids)| ids.is_empty()) {
            return Err(GraphError::bad_input("no targets given"));
        }
        let kind = request.operation.kind();
        let child_options = request
            .child_options
            .iter()
            .map(|option| option.resolve(schema))
            .collect::<Result<Vec<_>, _>>()?;
        let ignored = resolve_names(schema, &request.type_ignore)?;

        let mut classifier = None;
        let mut child_types = Vec::new();
        let core = BasePolicy::for_kind(kind);
        let chain = match &request.operation {
            Operation::Delete | Operation::Chown { .. } | Operation::Chgrp { .. } | Operation::Chmod { .. } => {
                PolicyChain::new(core)
                    .wrap(ChildOptionsPolicy::new(child_options))
                    .wrap(TypeIgnore::new(ignored))
            }
            Operation::FindChildren {
                child_types: wanted,
                stop_before,
            } => {
                if wanted.is_empty() {
                    return Err(GraphError::bad_input("find children needs at least one child type"));
                }
                child_types = resolve_names(schema, wanted)?;
                PolicyChain::new(core)
                    .wrap(OrphanOverride::all_last())
                    .wrap(TypeIgnore::new(ignored))
                    .wrap(TailTruncation::new(resolve_names(schema, stop_before)?))
            }
            Operation::Duplicate {
                duplicate,
                reference,
                ignore,
            } => {
                let target_names: Vec<&str> = targets.iter().map(|(class, _)| schema.name(*class)).collect();
                let registrations = target_names
                    .into_iter()
                    .chain(duplicate.iter().map(String::as_str))
                    .map(|name| (name, Specificity::Duplicate))
                    .chain(reference.iter().map(|name| (name.as_str(), Specificity::Reference)))
                    .chain(
                        ignore
                            .iter()
                            .chain(request.type_ignore.iter())
                            .map(|name| (name.as_str(), Specificity::Ignore)),
                    );
                let built = SpecificityClassifier::new(schema, registrations)?;
                let left_out: Vec<ClassId> = built
                    .classes_with(Specificity::Reference)
                    .chain(built.classes_with(Specificity::Ignore))
                    .collect();
                classifier = Some(built);
                PolicyChain::new(core)
                    .wrap(ChildOptionsPolicy::new(child_options))
                    .wrap(TypeIgnore::exact(left_out.clone()))
                    .wrap(TailTruncation::exact(left_out))
            }
        };

        Ok(Self {
            kind,
            mutation: request.operation.mutation(),
            targets,
            dry_run: request.dry_run,
            chain,
            classifier,
            child_types,
            overrides: BTreeSet::new(),
        })
    }

    /// Request targets resolved to classes
    pub(crate) fn named_targets(schema: &Schema, request: &OperationRequest) -> Result<Vec<(ClassId, Vec<u64>)>, GraphError> {
        request
            .targets
            .iter()
            .map(|(name, ids)| -> Result<_, GraphError> { Ok((schema.resolve(name)?, ids.clone())) })
            .collect()
    }
}

/// Group objects by class
pub(crate) fn group_targets(subjects: &[ModelRef]) -> Vec<(ClassId, Vec<u64>)> {
    subjects
        .iter()
        .copied()
        .collect::<ClassBatches>()
        .iter()
        .map(|(class, ids)| (class, ids.to_vec()))
        .collect()
}

/// One operation moving through its steps
#[derive(Debug)]
pub struct Request<'e> {
    env: Environment<'e>,
    actor: Actor,
    kind: OperationKind,
    mutation: Option<DetailsChange>,
    targets: Vec<(ClassId, Vec<u64>)>,
    dry_run: bool,
    chain: Option<PolicyChain>,
    classifier: Option<SpecificityClassifier>,
    child_types: Vec<ClassId>,
    overrides: BTreeSet<ModelRef>,
    state: RequestState,
    steps: usize,
    plan: Option<Plan>,
    unlink: Option<BatchExecutor>,
    process: Option<BatchExecutor>,
    duplicator: Option<Duplicator<'e>>,
    executed: ExecutionSummary,
    response: OperationResponse,
}

impl<'e> Request<'e> {
    pub(crate) fn new(env: Environment<'e>, actor: Actor, prepared: Prepared) -> Self {
        info!(
            kind = %prepared.kind,
            dry_run = prepared.dry_run,
            targets = prepared.targets.iter().map(|(_, ids)| ids.len()).sum::<usize>(),
            adjusters = ?prepared.chain.adjuster_names(),
            "request accepted"
        );
        Self {
            env,
            actor,
            kind: prepared.kind,
            mutation: prepared.mutation,
            targets: prepared.targets,
            dry_run: prepared.dry_run,
            chain: Some(prepared.chain),
            classifier: prepared.classifier,
            child_types: prepared.child_types,
            overrides: prepared.overrides,
            state: RequestState::Planning,
            steps: 0,
            plan: None,
            unlink: None,
            process: None,
            duplicator: None,
            executed: ExecutionSummary::default(),
            response: OperationResponse::new(prepared.kind, prepared.dry_run),
        }
    }

    /// Current state
    #[inline]
    #[must_use]
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Steps completed
    #[inline]
    #[must_use]
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Kind of the operation
    #[inline]
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// The plan, once computed
    #[must_use]
    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// The response, once done
    #[must_use]
    pub fn response(&self) -> Option<&OperationResponse> {
        (self.state == RequestState::Done).then_some(&self.response)
    }

    /// Counts of what the executors touched so far
    #[must_use]
    pub fn executed(&self) -> ExecutionSummary {
        self.executed
    }

    /// Stop between steps
    ///
    /// # Errors
    /// [`GraphError::IllegalState`] if the request already finished
    pub fn cancel(&mut self) -> Result<(), GraphError> {
        validate_transition(self.state, RequestState::Cancelled)?;
        info!(kind = %self.kind, after = self.steps, "request cancelled");
        self.state = RequestState::Cancelled;
        Ok(())
    }

    /// Run the next step
    ///
    /// # Errors
    /// The failing step's index, state and cause; the request is then
    /// `Failed`
    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<RequestState, RequestFailure> {
        let state = self.state;
        let next = match state {
            RequestState::Planning => RequestState::Validating,
            RequestState::Validating => RequestState::Processing,
            RequestState::Processing => RequestState::Unlinking,
            RequestState::Unlinking => RequestState::Executing,
            RequestState::Executing => RequestState::Done,
            RequestState::Done | RequestState::Failed | RequestState::Cancelled => {
                return Err(self.failure(state, GraphError::IllegalState(format!("request is already {state}"))));
            }
        };
        let outcome = match state {
            RequestState::Planning => self.plan_step(ctx),
            RequestState::Validating => self.validate_step(),
            RequestState::Processing => self.prepare_step(ctx),
            RequestState::Unlinking => self.unlink_step(ctx),
            _ => self.execute_step(ctx),
        }
        .and_then(|()| validate_transition(state, next));

        match outcome {
            Ok(()) => {
                self.steps += 1;
                self.state = next;
                debug!(kind = %self.kind, step = self.steps, state = %next, "step complete");
                if next == RequestState::Done {
                    self.finish();
                }
                Ok(next)
            }
            Err(error) => {
                warn!(kind = %self.kind, step = self.steps, %state, %error, "step failed");
                self.state = RequestState::Failed;
                Err(self.failure(state, error))
            }
        }
    }

    /// Step until done
    ///
    /// # Errors
    /// The first failing step
    pub fn run(&mut self, ctx: &mut StepContext<'_>) -> Result<OperationResponse, RequestFailure> {
        while self.state != RequestState::Done {
            self.step(ctx)?;
        }
        Ok(self.response.clone())
    }

    fn failure(&self, state: RequestState, error: GraphError) -> RequestFailure {
        RequestFailure {
            step: self.steps,
            state,
            error,
        }
    }

    fn current_plan(&self) -> Result<&Plan, GraphError> {
        self.plan
            .as_ref()
            .ok_or_else(|| GraphError::IllegalState("no plan computed".into()))
    }

    fn plan_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), GraphError> {
        let chain = self
            .chain
            .take()
            .ok_or_else(|| GraphError::IllegalState("policy chain already used".into()))?;
        let batch_size = self.env.config.batch_size;
        let mut targets = Vec::new();
        for (class, ids) in &self.targets {
            for chunk in ids.chunks(batch_size) {
                targets.extend(ctx.store.load(*class, chunk)?.into_iter().map(|o| o.subject));
            }
        }
        if let Some(classifier) = &self.classifier {
            if let Some(odd) = targets.iter().find(|t| classifier.classify(t.class) != Specificity::Duplicate) {
                return Err(GraphError::bad_input(format!(
                    "target {} of class {} is not duplicated",
                    odd,
                    self.env.schema.name(odd.class)
                )));
            }
        }

        let plan = Planner::new(self.env.schema, self.env.config, self.kind, &self.actor, self.env.voter, chain)
            .with_permission_overrides(self.overrides.clone())
            .plan(&*ctx.store, &targets)?;
        self.plan = Some(plan);
        Ok(())
    }

    fn delete_files(&self, ctx: &mut StepContext<'_>, plan: &Plan) -> Result<usize, GraphError> {
        let files = plan.deleted_of(self.env.schema, &self.env.config.file_classes);
        match ctx.files.as_deref_mut() {
            Some(repository) if !files.is_empty() => {
                let removed = repository.delete_files(&files)?;
                debug!(files = removed, "backing files removed");
                Ok(removed)
            }
            _ => Ok(0),
        }
    }

    fn validate_step(&self) -> Result<(), GraphError> {
        let plan = self.current_plan()?;
        if plan.has_violations() {
            Err(GraphError::PolicyViolation(plan.violations.clone()))
        } else {
            Ok(())
        }
    }

    fn prepare_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), GraphError> {
        let plan = self.current_plan()?;
        match self.kind {
            OperationKind::FindChildren => {}
            OperationKind::Duplicate => {
                let classifier = self
                    .classifier
                    .clone()
                    .ok_or_else(|| GraphError::IllegalState("duplicate request without classifier".into()))?;
                let mut duplicator = Duplicator::new(self.env.schema, classifier, self.actor, self.env.config.batch_size);
                duplicator.prepare(&*ctx.store, plan)?;
                self.duplicator = Some(duplicator);
            }
            _ => {
                let batch_size = self.env.config.batch_size;
                let unlink = BatchExecutor::unlink(plan, self.env.schema, batch_size);
                let processor = self.processor(&mut *ctx.store, plan);
                let process = BatchExecutor::process(plan, batch_size, &processor)?;
                debug!(unlink = unlink.batches().len(), process = process.batches().len(), "executors built");
                self.unlink = Some(unlink);
                self.process = Some(process);
            }
        }
        Ok(())
    }

    fn processor<'x>(&'x self, store: &'x mut dyn ObjectStore, plan: &'x Plan) -> StoreProcessor<'x> {
        StoreProcessor::new(store, self.env.schema, self.mutation, &self.actor, self.env.voter, &plan.unchecked)
    }

    fn run_executor(&self, store: &mut dyn ObjectStore, executor: &BatchExecutor) -> Result<ExecutionSummary, GraphError> {
        let plan = self.current_plan()?;
        let processor = self.processor(store, plan);
        if self.dry_run {
            executor.execute(&mut DryRunProcessor::new(processor))
        } else {
            let mut processor = processor;
            executor.execute(&mut processor)
        }
    }

    fn unlink_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), GraphError> {
        if let Some(unlink) = &self.unlink {
            let summary = self.run_executor(&mut *ctx.store, unlink)?;
            self.response.unlinked = summary.nulled + summary.filtered;
            self.executed = self.executed.merge(summary);
        }
        Ok(())
    }

    fn execute_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), GraphError> {
        // Files go only once the plan has been validated and prepared, right
        // before the records that own them
        if !self.dry_run {
            let plan = self.current_plan()?;
            let removed = self.delete_files(ctx, plan)?;
            self.response.files_deleted += removed;
        }
        if let Some(process) = &self.process {
            let summary = self.run_executor(&mut *ctx.store, process)?;
            self.executed = self.executed.merge(summary);
        }
        if let Some(duplicator) = self.duplicator.as_mut() {
            if !self.dry_run {
                let summary = duplicator.persist(&mut *ctx.store)?;
                for (original, copy) in summary.mapping {
                    self.response
                        .duplicates
                        .entry(self.env.schema.name(original.class).to_string())
                        .or_default()
                        .insert(original.id, copy.id);
                }
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        let schema = self.env.schema;
        self.response.steps = self.steps;
        if let Some(plan) = &self.plan {
            match self.kind {
                OperationKind::FindChildren => {
                    let targets: BTreeSet<ModelRef> = plan.targets.iter().copied().collect();
                    let found: ClassBatches = plan
                        .to_process
                        .refs()
                        .filter(|s| !targets.contains(s))
                        .filter(|s| self.child_types.iter().any(|c| schema.is_a(s.class, *c)))
                        .collect();
                    self.response.found = found.by_name(schema);
                }
                OperationKind::Duplicate => {
                    if self.dry_run {
                        self.response.processed = plan.to_process.by_name(schema);
                    }
                }
                _ => {
                    self.response.processed = plan.to_process.by_name(schema);
                    self.response.deleted = plan.to_delete.by_name(schema);
                }
            }
        }
        info!(
            kind = %self.kind,
            dry_run = self.dry_run,
            steps = self.steps,
            objects = self.response.object_count(),
            "request complete"
        );
    }
}

/// A request as submitted: either one traversal or a head-skip pair
#[derive(Debug)]
pub enum Submission<'e> {
    /// One request
    Single(Request<'e>),
    /// A dry-run traversal deferring to a second request
    SkipHead(SkipHeadRequest<'e>),
}

impl Submission<'_> {
    /// Run every step
    ///
    /// # Errors
    /// The first failing step
    pub fn run(&mut self, ctx: &mut StepContext<'_>) -> Result<OperationResponse, RequestFailure> {
        match self {
            Submission::Single(request) => request.run(ctx),
            Submission::SkipHead(request) => request.run(ctx),
        }
    }

    /// Stop between steps
    ///
    /// # Errors
    /// [`GraphError::IllegalState`] if already finished
    pub fn cancel(&mut self) -> Result<(), GraphError> {
        match self {
            Submission::Single(request) => request.cancel(),
            Submission::SkipHead(request) => request.cancel(),
        }
    }
}

/// Ids by class name for responses
pub(crate) fn by_name(schema: &Schema, subjects: &[ModelRef]) -> BTreeMap<String, Vec<u64>> {
    subjects.iter().copied().collect::<ClassBatches>().by_name(schema)
}
