//! Head-skip: run an operation on contained objects instead of the targets
//!
//! A dry-run traversal from the targets halts at objects of the start-from
//! types and records them. A second request then runs the real operation
//! seeded with exactly those objects, keeping each one's permission-checking
//! posture from the first traversal.

use super::{by_name, group_targets, Environment, OperationRequest, OperationResponse, Prepared, Request, StepContext};
use crate::error::{GraphError, RequestFailure};
use crate::policy::{BasePolicy, DeferredTargets, HeadTruncation, OrphanOverride, PolicyChain};
use crate::state_machine::RequestState;
use crate::types::{Actor, OperationKind};
use graphop_schema::ModelRef;
use std::collections::BTreeSet;
use tracing::info;

/// Two chained requests: skip, then perform
#[derive(Debug)]
pub struct SkipHeadRequest<'e> {
    env: Environment<'e>,
    actor: Actor,
    request: OperationRequest,
    deferred: DeferredTargets,
    skip: Request<'e>,
    perform: Option<Request<'e>>,
    skipped: Vec<ModelRef>,
}

impl<'e> SkipHeadRequest<'e> {
    pub(crate) fn new(env: Environment<'e>, actor: Actor, request: &OperationRequest) -> Result<Self, GraphError> {
        let start_from = request
            .skip_head
            .as_ref()
            .map(|s| s.start_from.as_slice())
            .unwrap_or_default();
        if start_from.is_empty() {
            return Err(GraphError::bad_input("head skip needs at least one start-from type"));
        }
        let start_from = start_from
            .iter()
            .map(|name| env.schema.resolve(name).map_err(GraphError::from))
            .collect::<Result<Vec<_>, _>>()?;
        let targets = Prepared::named_targets(env.schema, request)?;
        // Validate the perform half up front so bad input fails before any traversal
        Prepared::from_request(env.schema, request, targets.clone())?;

        let deferred = DeferredTargets::new();
        let chain = PolicyChain::new(BasePolicy::for_kind(OperationKind::FindChildren))
            .wrap(OrphanOverride::all_last())
            .wrap(HeadTruncation::new(start_from, deferred.clone()));
        let skip = Request::new(
            env,
            actor,
            Prepared {
                kind: OperationKind::FindChildren,
                mutation: None,
                targets,
                dry_run: true,
                chain,
                classifier: None,
                child_types: Vec::new(),
                overrides: BTreeSet::new(),
            },
        );
        Ok(Self {
            env,
            actor,
            request: request.clone(),
            deferred,
            skip,
            perform: None,
            skipped: Vec::new(),
        })
    }

    /// Objects the operation was deferred to, once the skip half finished
    #[must_use]
    pub fn deferred(&self) -> Vec<ModelRef> {
        self.deferred.targets()
    }

    /// The perform half, once started
    #[must_use]
    pub fn perform(&self) -> Option<&Request<'e>> {
        self.perform.as_ref()
    }

    /// Whether both halves finished
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.perform.as_ref().is_some_and(|p| p.state() == RequestState::Done)
    }

    /// Run the next step of whichever half is active
    ///
    /// # Errors
    /// The failing step; steps are numbered across both halves
    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<RequestState, RequestFailure> {
        if let Some(perform) = self.perform.as_mut() {
            let offset = self.skip.steps();
            return perform.step(ctx).map_err(|mut failure| {
                failure.step += offset;
                failure
            });
        }

        let state = self.skip.step(ctx)?;
        if state == RequestState::Done {
            self.start_perform().map_err(|error| RequestFailure {
                step: self.skip.steps(),
                state,
                error,
            })?;
        }
        Ok(state)
    }

    fn start_perform(&mut self) -> Result<(), GraphError> {
        let targets = self.deferred.targets();
        let unchecked = self.deferred.unchecked();
        info!(deferred = targets.len(), unchecked = unchecked.len(), "head skipped");
        if targets.is_empty() {
            return Err(GraphError::bad_input("no objects of the start-from types below the targets"));
        }
        let mut prepared = Prepared::from_request(self.env.schema, &self.request, group_targets(&targets))?;
        prepared.overrides = unchecked;
        self.skipped = targets;
        self.perform = Some(Request::new(self.env, self.actor, prepared));
        Ok(())
    }

    /// Run both halves to completion
    ///
    /// # Errors
    /// The first failing step
    pub fn run(&mut self, ctx: &mut StepContext<'_>) -> Result<OperationResponse, RequestFailure> {
        while !self.is_done() {
            self.step(ctx)?;
        }
        let mut response = self
            .perform
            .as_ref()
            .and_then(Request::response)
            .cloned()
            .ok_or_else(|| RequestFailure {
                step: self.skip.steps(),
                state: RequestState::Done,
                error: GraphError::IllegalState("perform half produced no response".into()),
            })?;
        response.steps += self.skip.steps();
        response.deferred = by_name(self.env.schema, &self.skipped);
        Ok(response)
    }

    /// Stop between steps
    ///
    /// # Errors
    /// [`GraphError::IllegalState`] if already finished
    pub fn cancel(&mut self) -> Result<(), GraphError> {
        match self.perform.as_mut() {
            Some(perform) => perform.cancel(),
            None => self.skip.cancel(),
        }
    }
}
