//! Engine: schema, configuration and voter shared by every request

use crate::config::{EngineConfig, ResolvedConfig};
use crate::error::{GraphError, RequestFailure};
use crate::permissions::PermissionVoter;
use crate::request::{
    Environment, OperationRequest, OperationResponse, Prepared, Request, SkipHeadRequest, StepContext, Submission,
};
use crate::types::Actor;
use graphop_schema::Schema;
use std::sync::Arc;

/// Entry point for operation requests
#[derive(Debug)]
pub struct Engine {
    schema: Arc<Schema>,
    config: ResolvedConfig,
    voter: Box<dyn PermissionVoter>,
}

impl Engine {
    /// Engine over `schema`
    ///
    /// # Errors
    /// [`GraphError::BadInput`] if the configuration names unknown classes or
    /// properties, or has zero limits
    pub fn new(schema: Arc<Schema>, config: &EngineConfig, voter: Box<dyn PermissionVoter>) -> Result<Self, GraphError> {
        let config = config.resolve(&schema)?;
        Ok(Self { schema, config, voter })
    }

    /// Schema in use
    #[inline]
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Resolved configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    fn environment(&self) -> Environment<'_> {
        Environment {
            schema: &self.schema,
            config: &self.config,
            voter: self.voter.as_ref(),
        }
    }

    /// Validate a request and set it up to be stepped
    ///
    /// # Errors
    /// [`GraphError::BadInput`] for unknown classes, conflicting options or
    /// missing targets
    pub fn submit(&self, request: &OperationRequest, actor: Actor) -> Result<Submission<'_>, GraphError> {
        let env = self.environment();
        if request.skip_head.is_some() {
            return Ok(Submission::SkipHead(SkipHeadRequest::new(env, actor, request)?));
        }
        let targets = Prepared::named_targets(&self.schema, request)?;
        let prepared = Prepared::from_request(&self.schema, request, targets)?;
        Ok(Submission::Single(Request::new(env, actor, prepared)))
    }

    /// Submit and run to completion
    ///
    /// Bad input is reported as a failure of step 0.
    ///
    /// # Errors
    /// The first failing step
    pub fn run(
        &self,
        request: &OperationRequest,
        actor: Actor,
        ctx: &mut StepContext<'_>,
    ) -> Result<OperationResponse, RequestFailure> {
        let mut submission = self.submit(request, actor).map_err(|error| RequestFailure {
            step: 0,
            state: crate::state_machine::RequestState::Planning,
            error,
        })?;
        submission.run(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::permissions::StaticVoter;
    use crate::request::Operation;
    use crate::test_harness::fixtures::ImagingWorld;

    #[test]
    fn unknown_names_are_rejected_before_traversal() {
        let world = ImagingWorld::project_with_images(1).unwrap();
        let engine = Engine::new(world.schema.clone(), &EngineConfig::default(), Box::new(StaticVoter::allow_all())).unwrap();
        let actor = Actor::user(1, 1);

        let unknown = OperationRequest::new(Operation::Delete).target("Nope", [1]);
        assert_eq!(engine.submit(&unknown, actor).unwrap_err().kind(), ErrorKind::BadInput);

        let empty = OperationRequest::new(Operation::Delete);
        assert_eq!(engine.submit(&empty, actor).unwrap_err().kind(), ErrorKind::BadInput);

        let no_start = OperationRequest::new(Operation::Delete)
            .target("Project", [world.project.id])
            .skip_head(Vec::<String>::new());
        assert_eq!(engine.submit(&no_start, actor).unwrap_err().kind(), ErrorKind::BadInput);
    }

    #[test]
    fn configuration_is_checked_against_the_schema() {
        let world = ImagingWorld::project_with_images(0).unwrap();
        let config = EngineConfig::default().with_unnullable("Image", "missing");
        assert!(Engine::new(world.schema.clone(), &config, Box::new(StaticVoter::allow_all())).is_err());
    }
}
