//! graphop kernel
//!
//! Plans and executes bulk operations (delete, chown, chgrp, chmod,
//! duplicate, find children) over persisted object graphs.
//!
//! A request is traversed from its targets by a [`Planner`] driving a
//! [`PolicyChain`], producing a [`Plan`]. The plan is validated against the
//! actor's abilities, then executed in batches: references are severed,
//! deletions run in dependency order, and the remaining objects are mutated
//! or duplicated.
//!
//! ```rust
//! use graphop_kernel::test_harness::ImagingWorld;
//! use graphop_kernel::{Actor, Engine, EngineConfig, Operation, OperationRequest, StaticVoter, StepContext};
//!
//! let mut world = ImagingWorld::project_with_images(2).unwrap();
//! let engine = Engine::new(world.schema.clone(), &EngineConfig::default(), Box::new(StaticVoter::allow_all())).unwrap();
//! let request = OperationRequest::new(Operation::Delete).target("Project", [world.project.id]);
//!
//! let mut ctx = StepContext::new(&mut world.store);
//! let response = engine.run(&request, Actor::user(1, 1), &mut ctx).unwrap();
//! assert_eq!(response.deleted["Image"].len(), 2);
//! ```

pub mod config;
pub mod dag;
pub mod duplicate;
pub mod engine;
pub mod error;
pub mod executor;
pub mod logging;
pub mod permissions;
pub mod plan;
pub mod planner;
pub mod policy;
pub mod request;
pub mod state_machine;
pub mod store;
pub mod test_harness;
pub mod types;

pub use config::{EngineConfig, ResolvedConfig};
pub use engine::Engine;
pub use error::{ErrorKind, GraphError, Inconsistency, RequestFailure, Violation, ViolationReport};
pub use permissions::{PermissionVoter, StaticVoter};
pub use plan::{ClassBatches, Plan, SeveredLink};
pub use planner::Planner;
pub use policy::{ChildOption, PolicyAdjuster, PolicyChain};
pub use request::{Operation, OperationRequest, OperationResponse, Request, SkipHead, StepContext, Submission};
pub use state_machine::RequestState;
pub use store::{DetailsChange, FileRepository, LinkValue, NewObject, ObjectDetails, ObjectStore, StoreError, StoredObject};
pub use types::*;

/// Re-export test harness for external use
pub use test_harness::{run_simulator, SimulatorConfig, TestHarness};
