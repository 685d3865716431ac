//! Stress tests - planning must not depend on batching, and random worlds
//! must keep every invariant
//!
//! Run with: cargo test --package graphop-kernel --test stress_test

use graphop_kernel::policy::{BasePolicy, ReviewContext};
use graphop_kernel::test_harness::ImagingWorld;
use graphop_kernel::*;
use graphop_schema::ModelRef;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

fn world(images: usize, rois: usize) -> ImagingWorld {
    let mut world = ImagingWorld::project_with_images(images).unwrap();
    let other = world.add_dataset("other");
    world.link_dataset_image(other, world.images[0]);
    for image in world.images.clone().into_iter().take(rois) {
        world.add_roi(image, 2);
        world.annotate(image, None);
    }
    world
}

fn dry_run(world: &mut ImagingWorld, batch_size: usize, operation: Operation) -> OperationResponse {
    let config = EngineConfig::default().with_batch_size(batch_size);
    let engine = Engine::new(world.schema.clone(), &config, Box::new(StaticVoter::allow_all())).unwrap();
    let request = OperationRequest::new(operation)
        .target("Project", [world.project.id])
        .dry_run(true);
    let mut ctx = StepContext::new(&mut world.store);
    engine.run(&request, Actor::user(1, 1), &mut ctx).unwrap()
}

/// Remembers the orphan status of every node after each review and notes
/// any terminal status that changes later
#[derive(Debug, Clone, Default)]
struct OrphanLedger {
    seen: Arc<Mutex<HashMap<ModelRef, Orphan>>>,
    reverted: Arc<Mutex<Vec<(ModelRef, Orphan, Orphan)>>>,
}

impl PolicyAdjuster for OrphanLedger {
    fn name(&self) -> &'static str {
        "orphan-ledger"
    }

    fn adjust_after_review(&mut self, node: &Details, _ctx: &ReviewContext<'_>) -> Option<Details> {
        let mut seen = self.seen.lock();
        if let Some(previous) = seen.insert(node.subject, node.orphan) {
            if previous.is_terminal() && previous != node.orphan {
                self.reverted.lock().push((node.subject, previous, node.orphan));
            }
        }
        None
    }

    fn clean_instance(&self) -> Result<Box<dyn PolicyAdjuster>, GraphError> {
        Ok(Box::new(Self::default()))
    }
}

fn operations() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Delete),
        (2..5u64).prop_map(|user| Operation::Chown { user }),
        (2..5u64).prop_map(|group| Operation::Chgrp { group }),
        Just(Operation::Chmod { permissions: 0o600 }),
        Just(Operation::Duplicate {
            duplicate: vec!["Dataset".into(), "ProjectDatasetLink".into(), "DatasetImageLink".into(), "Image".into(), "Pixels".into()],
            reference: vec![],
            ignore: vec![],
        }),
    ]
}

proptest! {
    #[test]
    fn prop_orphan_status_is_terminal(images in 1..6usize, rois in 0..3usize, batch_size in 1..5usize, regroup in any::<bool>()) {
        let world = world(images, rois);
        let kind = if regroup { OperationKind::Chgrp } else { OperationKind::Delete };
        let config = EngineConfig::default().with_batch_size(batch_size).resolve(&world.schema).unwrap();
        let actor = Actor::user(1, 1);
        let voter = StaticVoter::allow_all();
        let ledger = OrphanLedger::default();
        let chain = PolicyChain::new(BasePolicy::for_kind(kind)).wrap(ledger.clone());

        let plan = Planner::new(&world.schema, &config, kind, &actor, &voter, chain)
            .plan(&world.store, &[world.project])
            .unwrap();
        prop_assert!(!plan.to_delete.is_empty() || !plan.to_process.is_empty());
        prop_assert!(ledger.seen.lock().values().any(|o| o.is_terminal()), "no orphan was ever resolved");
        let reverted = ledger.reverted.lock().clone();
        prop_assert!(reverted.is_empty(), "terminal orphan statuses changed: {:?}", reverted);
    }

    #[test]
    fn prop_dry_run_leaves_store_untouched(images in 1..6usize, rois in 0..3usize, batch_size in 1..5usize, operation in operations()) {
        let mut world = world(images, rois);
        let file = world.add_original_file(world.images[0]);
        let before = world.store.clone();
        let config = EngineConfig::default().with_batch_size(batch_size).with_file_class("OriginalFile");
        let engine = Engine::new(world.schema.clone(), &config, Box::new(StaticVoter::allow_all())).unwrap();
        let request = OperationRequest::new(operation)
            .target("Project", [world.project.id])
            .dry_run(true);

        let mut ctx = StepContext::new(&mut world.store).with_files(&mut world.files);
        let response = engine.run(&request, Actor::user(1, 1), &mut ctx).unwrap();
        drop(ctx);

        prop_assert!(response.dry_run);
        prop_assert_eq!(response.files_deleted, 0);
        prop_assert!(response.duplicates.is_empty());
        prop_assert!(world.files.exists(file));
        prop_assert!(world.files.removed().is_empty());
        prop_assert!(world.store == before);
    }

    #[test]
    fn prop_dry_runs_are_deterministic(images in 1..6usize, rois in 0..3usize, batch_size in 1..5usize) {
        let mut world = world(images, rois);
        let before = world.store.clone();
        let first = dry_run(&mut world, batch_size, Operation::Delete);
        let second = dry_run(&mut world, batch_size, Operation::Delete);
        prop_assert_eq!(&first, &second);
        prop_assert!(world.store == before);
    }

    #[test]
    fn prop_plans_do_not_depend_on_batch_size(images in 1..6usize, rois in 0..3usize, batch_size in 1..5usize) {
        let mut world = world(images, rois);
        for operation in [Operation::Delete, Operation::Chgrp { group: 3 }] {
            let batched = dry_run(&mut world, batch_size, operation.clone());
            let whole = dry_run(&mut world, 256, operation);
            prop_assert_eq!(&batched.processed, &whole.processed);
            prop_assert_eq!(&batched.deleted, &whole.deleted);
            prop_assert_eq!(batched.unlinked, whole.unlinked);
        }
    }
}

#[test]
fn stress_test_random_worlds() {
    let start = Instant::now();
    let report = TestHarness::run_stress_test(8, 100);
    println!(
        "  {} worlds of up to {} images in {:.2}s, {} violations",
        report.worlds,
        report.max_images,
        start.elapsed().as_secs_f64(),
        report.violations
    );
    assert!(report.success, "stress test found {} violations", report.violations);
}

#[test]
fn stress_test_large_project() {
    let mut world = ImagingWorld::project_with_images(2_000).unwrap();
    let config = EngineConfig::default().with_batch_size(100);
    let engine = Engine::new(world.schema.clone(), &config, Box::new(StaticVoter::allow_all())).unwrap();
    let request = OperationRequest::new(Operation::Delete).target("Project", [world.project.id]);

    let start = Instant::now();
    let mut ctx = StepContext::new(&mut world.store);
    let response = engine.run(&request, Actor::user(1, 1), &mut ctx).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(response.deleted["Image"].len(), 2_000);
    assert!(world.store.is_empty());
    assert!(
        elapsed < std::time::Duration::from_secs(20),
        "large delete too slow: {:.2}s",
        elapsed.as_secs_f64()
    );
}
