//! Operation simulator
//!
//! Builds seeded random imaging worlds, runs random operations against them
//! dry and then for real, and checks the invariants every run must keep.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{ErrorKind, GraphError};
use crate::permissions::StaticVoter;
use crate::request::{Operation, OperationRequest, OperationResponse, StepContext};
use crate::store::LinkValue;
use crate::test_harness::fixtures::ImagingWorld;
use crate::types::Actor;
use graphop_schema::{ModelRef, Schema};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

/// Namespace given to some annotations
pub const RATING_NS: &str = "openmicroscopy.org/omero/insight/rating";

/// Classes cloned by simulated duplications
const DUPLICATED: [&str; 8] = [
    "Dataset",
    "DatasetImageLink",
    "Image",
    "Pixels",
    "Roi",
    "Shape",
    "ImageAnnotationLink",
    "Annotation",
];

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Worlds to generate; one operation runs per world
    pub worlds: u64,
    /// Upper bound on images per world
    pub max_images: usize,
    /// Distribution of operation kinds
    pub operation_mix: OperationMix,
    /// Store batch size used by the engine
    pub batch_size: usize,
    /// Stop at the first violation
    pub stop_on_first_violation: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            worlds: 200,
            max_images: 6,
            operation_mix: OperationMix::default(),
            batch_size: 3,
            stop_on_first_violation: true,
        }
    }
}

/// Relative weights of generated operation kinds
#[derive(Debug, Clone)]
pub struct OperationMix {
    /// Deletions
    pub delete: f64,
    /// Ownership, group and permission changes
    pub regroup: f64,
    /// Duplications
    pub duplicate: f64,
    /// Child searches
    pub find: f64,
}

impl Default for OperationMix {
    fn default() -> Self {
        Self {
            delete: 0.40,
            regroup: 0.30,
            duplicate: 0.20,
            find: 0.10,
        }
    }
}

/// An operation the simulator can generate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedOperation {
    /// Delete one object
    Delete(ModelRef),
    /// Move one object to another group
    Chgrp(ModelRef, u64),
    /// Give one object to another user
    Chown(ModelRef, u64),
    /// Change permission bits of one object
    Chmod(ModelRef, u32),
    /// Duplicate one object
    Duplicate(ModelRef),
    /// Find images below one object
    FindImages(ModelRef),
}

impl SimulatedOperation {
    /// The object the operation starts from
    #[must_use]
    pub fn target(&self) -> ModelRef {
        match self {
            SimulatedOperation::Delete(t)
            | SimulatedOperation::Chgrp(t, _)
            | SimulatedOperation::Chown(t, _)
            | SimulatedOperation::Chmod(t, _)
            | SimulatedOperation::Duplicate(t)
            | SimulatedOperation::FindImages(t) => *t,
        }
    }

    /// Short label used in statistics
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            SimulatedOperation::Delete(_) => "delete",
            SimulatedOperation::Chgrp(..) => "chgrp",
            SimulatedOperation::Chown(..) => "chown",
            SimulatedOperation::Chmod(..) => "chmod",
            SimulatedOperation::Duplicate(_) => "duplicate",
            SimulatedOperation::FindImages(_) => "find_children",
        }
    }

    fn request(&self, schema: &Schema) -> OperationRequest {
        let operation = match self {
            SimulatedOperation::Delete(_) => Operation::Delete,
            SimulatedOperation::Chgrp(_, group) => Operation::Chgrp { group: *group },
            SimulatedOperation::Chown(_, user) => Operation::Chown { user: *user },
            SimulatedOperation::Chmod(_, bits) => Operation::Chmod { permissions: *bits },
            SimulatedOperation::Duplicate(_) => Operation::Duplicate {
                duplicate: DUPLICATED.iter().map(ToString::to_string).collect(),
                reference: vec!["OriginalFile".into()],
                ignore: Vec::new(),
            },
            SimulatedOperation::FindImages(_) => Operation::FindChildren {
                child_types: vec!["Image".into()],
                stop_before: Vec::new(),
            },
        };
        let target = self.target();
        OperationRequest::new(operation).target(schema.name(target.class), [target.id])
    }
}

/// A violation detected during simulation
#[derive(Debug, Clone)]
pub struct InvariantViolation {
    /// World index
    pub world: u64,
    /// Operation run against the world
    pub operation: SimulatedOperation,
    /// Broken invariant
    pub check: InvariantCheck,
    /// What was observed
    pub details: String,
}

/// Invariants checked after every operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvariantCheck {
    /// Two dry runs over the same store answer the same
    DryRunIsDeterministic,
    /// Dry runs write nothing
    DryRunLeavesStoreUnchanged,
    /// A dry run fails exactly when the real run fails, with the same kind
    DryRunPredictsOutcome,
    /// The real run touches what the dry run reported
    ExecutionMatchesPlan,
    /// Deleted objects are gone
    DeletedObjectsAreGone,
    /// Processed objects carry the requested change
    ChangesApplied,
    /// No surviving object references a missing one
    NoDanglingReferences,
    /// Duplicates copy the simple properties of their originals
    DuplicatesMatchOriginals,
}

/// Statistics collected during simulation
#[derive(Debug, Clone, Default)]
pub struct OperationStats {
    /// Operations run
    pub total_operations: u64,
    /// Operations that completed
    pub successful_operations: u64,
    /// Operations refused by the engine
    pub failed_operations: u64,
    /// Objects touched by completed operations
    pub objects_touched: u64,
    /// Operations by kind
    pub operations_by_type: HashMap<&'static str, u64>,
    /// Refusals by error kind
    pub failures_by_kind: HashMap<ErrorKind, u64>,
}

impl OperationStats {
    fn record(&mut self, operation: &SimulatedOperation, outcome: &Result<OperationResponse, ErrorKind>) {
        self.total_operations += 1;
        *self.operations_by_type.entry(operation.label()).or_insert(0) += 1;
        match outcome {
            Ok(response) => {
                self.successful_operations += 1;
                self.objects_touched += response.object_count() as u64;
            }
            Err(kind) => {
                self.failed_operations += 1;
                *self.failures_by_kind.entry(*kind).or_insert(0) += 1;
            }
        }
    }
}

/// Final report from the simulator
#[derive(Debug, Clone)]
pub struct SimulatorReport {
    /// Configuration used
    pub config: SimulatorConfig,
    /// Statistics
    pub stats: OperationStats,
    /// Violations found
    pub violations: Vec<InvariantViolation>,
}

impl SimulatorReport {
    /// Whether no invariant was broken
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut report = String::new();
        let _ = writeln!(report, "=== Operation Simulator Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Worlds: {}", self.config.worlds);
        let _ = writeln!(report, "Total Operations: {}", self.stats.total_operations);
        let _ = writeln!(report, "Successful: {}", self.stats.successful_operations);
        let _ = writeln!(report, "Refused: {}", self.stats.failed_operations);
        let _ = writeln!(report, "Objects Touched: {}", self.stats.objects_touched);

        let mut kinds: Vec<_> = self.stats.operations_by_type.iter().collect();
        kinds.sort();
        for (kind, count) in kinds {
            let _ = writeln!(report, "  {kind}: {count}");
        }
        let mut refusals: Vec<_> = self.stats.failures_by_kind.iter().map(|(k, n)| (k.code(), *n)).collect();
        refusals.sort_unstable();
        for (code, count) in refusals {
            let _ = writeln!(report, "  refused ({code}): {count}");
        }

        let _ = writeln!(report, "Violations: {}", self.violations.len());
        if !self.violations.is_empty() {
            report.push_str("\n=== Violations ===\n");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(
                    report,
                    "{}. world {} {:?}: {:?} {}",
                    i + 1,
                    v.world,
                    v.operation,
                    v.check,
                    v.details
                );
            }
        }

        let _ = writeln!(report, "\n=== Result: {} ===", if self.passed() { "PASS" } else { "FAIL" });
        report
    }
}

/// Run the simulator
#[must_use]
pub fn run_simulator(config: SimulatorConfig) -> SimulatorReport {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut stats = OperationStats::default();
    let mut violations = Vec::new();

    for world_index in 0..config.worlds {
        let world = match random_world(&mut rng, config.max_images) {
            Ok(world) => world,
            Err(error) => {
                tracing::error!(%error, "imaging world could not be built");
                break;
            }
        };
        let operation = generate_operation(&mut rng, &config.operation_mix, &world);
        let mut found = Vec::new();
        let outcome = check_operation(&world, &operation, config.batch_size, &mut found);
        stats.record(&operation, &outcome);

        let stop = !found.is_empty() && config.stop_on_first_violation;
        violations.extend(found.into_iter().map(|(check, details)| InvariantViolation {
            world: world_index,
            operation: operation.clone(),
            check,
            details,
        }));
        if stop {
            break;
        }
    }

    SimulatorReport {
        config,
        stats,
        violations,
    }
}

/// A project with a dataset of random images, annotations, regions, files
/// and albums, some images shared with a second dataset
fn random_world(rng: &mut StdRng, max_images: usize) -> Result<ImagingWorld, GraphError> {
    let images = rng.gen_range(1..=max_images.max(1));
    let mut world = ImagingWorld::project_with_images(images)?;
    let mut annotations = Vec::new();

    for image in world.images.clone() {
        for _ in 0..rng.gen_range(0..3) {
            let ns = rng.gen_bool(0.3).then_some(RATING_NS);
            annotations.push(world.annotate(image, ns));
        }
        if !annotations.is_empty() && rng.gen_bool(0.2) {
            if let Some(shared) = annotations.choose(rng).copied() {
                world.attach(image, shared);
            }
        }
        if rng.gen_bool(0.3) {
            let shapes = rng.gen_range(0..4);
            world.add_roi(image, shapes);
        }
        if rng.gen_bool(0.3) {
            world.add_original_file(image);
        }
    }
    if rng.gen_bool(0.3) {
        let members: Vec<ModelRef> = world.images.iter().copied().filter(|_| rng.gen_bool(0.5)).collect();
        world.add_album(&members);
    }
    if rng.gen_bool(0.3) {
        let other = world.add_dataset("other");
        if let Some(image) = world.images.choose(rng).copied() {
            world.link_dataset_image(other, image);
        }
    }
    Ok(world)
}

fn generate_operation(rng: &mut StdRng, mix: &OperationMix, world: &ImagingWorld) -> SimulatedOperation {
    let mut containers = vec![world.project, world.dataset];
    containers.extend(world.images.iter().copied());
    let target = containers.choose(rng).copied().unwrap_or(world.project);

    let total = mix.delete + mix.regroup + mix.duplicate + mix.find;
    let r = rng.gen::<f64>() * total;
    if r < mix.delete {
        SimulatedOperation::Delete(target)
    } else if r < mix.delete + mix.regroup {
        match rng.gen_range(0..3) {
            0 => SimulatedOperation::Chgrp(target, rng.gen_range(2..10)),
            1 => SimulatedOperation::Chown(target, rng.gen_range(2..10)),
            _ => SimulatedOperation::Chmod(target, 0o600 + rng.gen_range(0..0o100)),
        }
    } else if r < mix.delete + mix.regroup + mix.duplicate {
        let pick = [world.dataset].into_iter().chain(world.images.iter().copied()).collect::<Vec<_>>();
        SimulatedOperation::Duplicate(pick.choose(rng).copied().unwrap_or(world.dataset))
    } else {
        SimulatedOperation::FindImages(target)
    }
}

type Found = Vec<(InvariantCheck, String)>;

fn run_once(
    engine: &Engine,
    world: &mut ImagingWorld,
    request: &OperationRequest,
) -> Result<OperationResponse, ErrorKind> {
    let mut ctx = StepContext::new(&mut world.store).with_files(&mut world.files);
    engine
        .run(request, Actor::user(1, 1), &mut ctx)
        .map_err(|failure| failure.kind())
}

/// Run `operation` twice dry and once for real on a copy of `world`
fn check_operation(
    world: &ImagingWorld,
    operation: &SimulatedOperation,
    batch_size: usize,
    found: &mut Found,
) -> Result<OperationResponse, ErrorKind> {
    let config = EngineConfig::default()
        .with_batch_size(batch_size)
        .with_file_class("OriginalFile");
    let engine = match Engine::new(world.schema.clone(), &config, Box::new(StaticVoter::allow_all())) {
        Ok(engine) => engine,
        Err(error) => return Err(error.kind()),
    };
    let request = operation.request(&world.schema);
    let dry_request = request.clone().dry_run(true);

    let mut scratch = world.clone();
    let first = run_once(&engine, &mut scratch, &dry_request);
    let second = run_once(&engine, &mut scratch, &dry_request);
    if first != second {
        found.push((InvariantCheck::DryRunIsDeterministic, format!("{first:?} then {second:?}")));
    }
    if scratch.store != world.store || scratch.files != world.files {
        found.push((InvariantCheck::DryRunLeavesStoreUnchanged, "store changed".into()));
    }

    let mut wet = world.clone();
    let outcome = run_once(&engine, &mut wet, &request);
    match (&first, &outcome) {
        (Ok(dry), Ok(done)) => check_execution(world, &wet, operation, dry, done, found),
        (Err(a), Err(b)) if a == b => {}
        _ => found.push((
            InvariantCheck::DryRunPredictsOutcome,
            format!("dry {first:?}, real {outcome:?}"),
        )),
    }
    outcome
}

fn check_execution(
    before: &ImagingWorld,
    after: &ImagingWorld,
    operation: &SimulatedOperation,
    dry: &OperationResponse,
    done: &OperationResponse,
    found: &mut Found,
) {
    let schema = &before.schema;
    let refs = |map: &BTreeMap<String, Vec<u64>>| -> Vec<ModelRef> {
        map.iter()
            .filter_map(|(name, ids)| schema.resolve(name).ok().map(|class| (class, ids)))
            .flat_map(|(class, ids)| ids.iter().map(move |id| ModelRef::new(class, *id)))
            .collect()
    };

    if let SimulatedOperation::Duplicate(_) = operation {
        let planned: BTreeMap<&String, usize> = dry.processed.iter().map(|(k, v)| (k, v.len())).collect();
        let made: BTreeMap<&String, usize> = done.duplicates.iter().map(|(k, v)| (k, v.len())).collect();
        if planned != made {
            found.push((InvariantCheck::ExecutionMatchesPlan, format!("planned {planned:?}, made {made:?}")));
        }
        for (name, mapping) in &done.duplicates {
            let Ok(class) = schema.resolve(name) else { continue };
            for (original, copy) in mapping {
                let original = before.store.get(ModelRef::new(class, *original));
                let copy = after.store.get(ModelRef::new(class, *copy));
                match (original, copy) {
                    (Some(o), Some(c)) if o.simple == c.simple => {}
                    _ => found.push((InvariantCheck::DuplicatesMatchOriginals, format!("{name} {mapping:?}"))),
                }
            }
        }
    } else if dry.processed != done.processed || dry.deleted != done.deleted || dry.found != done.found {
        found.push((InvariantCheck::ExecutionMatchesPlan, "dry and real runs disagree".into()));
    }

    for gone in refs(&done.deleted) {
        if after.store.contains(gone) {
            found.push((InvariantCheck::DeletedObjectsAreGone, gone.to_string()));
        }
    }

    for subject in refs(&done.processed) {
        let Some(details) = after.store.get(subject).map(|o| o.details) else {
            found.push((InvariantCheck::ChangesApplied, format!("{subject} missing")));
            continue;
        };
        let applied = match operation {
            SimulatedOperation::Chgrp(_, group) => details.group == *group,
            SimulatedOperation::Chown(_, user) => details.owner == *user,
            SimulatedOperation::Chmod(_, bits) => details.permissions == *bits,
            _ => true,
        };
        if !applied {
            found.push((InvariantCheck::ChangesApplied, subject.to_string()));
        }
    }

    for object in after.store.objects() {
        for (property, value) in &object.links {
            let dangling = match value {
                LinkValue::One(target) => target.iter().copied().find(|t| !after.store.contains(*t)),
                LinkValue::Many(items) => items.iter().copied().find(|t| !after.store.contains(*t)),
            };
            if let Some(target) = dangling {
                found.push((
                    InvariantCheck::NoDanglingReferences,
                    format!("{}.{property} -> {target}", object.subject),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulation_keeps_every_invariant() {
        let report = run_simulator(SimulatorConfig {
            worlds: 60,
            ..SimulatorConfig::default()
        });
        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.stats.total_operations, 60);
        assert!(report.stats.successful_operations > 0);
    }

    #[test]
    fn same_seed_same_report() {
        let config = SimulatorConfig {
            seed: 7,
            worlds: 20,
            ..SimulatorConfig::default()
        };
        let a = run_simulator(config.clone());
        let b = run_simulator(config);
        assert_eq!(a.stats.successful_operations, b.stats.successful_operations);
        assert_eq!(a.stats.objects_touched, b.stats.objects_touched);
        assert!(a.generate_text().contains("Seed: 7"));
    }
}
