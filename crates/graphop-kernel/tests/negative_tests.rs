//! Negative tests - malformed requests, bad configuration and graphs that
//! cannot be processed

use graphop_kernel::test_harness::{ImagingWorld, InMemoryFiles, InMemoryStore};
use graphop_kernel::*;
use graphop_schema::{ClassSpec, LinkSpec, ModelRef, SchemaBuilder};
use std::collections::BTreeMap;
use std::sync::Arc;

fn engine(world: &ImagingWorld) -> Engine {
    Engine::new(world.schema.clone(), &EngineConfig::default(), Box::new(StaticVoter::allow_all())).unwrap()
}

fn submit_error(world: &ImagingWorld, request: &OperationRequest) -> GraphError {
    engine(world).submit(request, Actor::user(1, 1)).unwrap_err()
}

#[test]
fn test_rejects_unknown_ignored_type() {
    let world = ImagingWorld::project_with_images(1).unwrap();
    let request = OperationRequest::new(Operation::Delete)
        .target("Image", [world.images[0].id])
        .ignore_type("Spreadsheet");
    assert_eq!(submit_error(&world, &request).kind(), ErrorKind::BadInput);
}

#[test]
fn test_rejects_child_option_without_types() {
    let world = ImagingWorld::project_with_images(1).unwrap();
    let request = OperationRequest::new(Operation::Delete)
        .target("Image", [world.images[0].id])
        .child_option(ChildOption::default().in_namespaces(["N"]));
    assert_eq!(submit_error(&world, &request).kind(), ErrorKind::BadInput);
}

#[test]
fn test_rejects_conflicting_child_option() {
    let world = ImagingWorld::project_with_images(1).unwrap();
    let mut option = ChildOption::include("Annotation");
    option.exclude_types.push("Annotation".into());
    let request = OperationRequest::new(Operation::Chgrp { group: 2 })
        .target("Image", [world.images[0].id])
        .child_option(option);
    assert_eq!(submit_error(&world, &request).kind(), ErrorKind::BadInput);

    let option = ChildOption::include("Annotation").in_namespaces(["N"]).not_in_namespaces(["N"]);
    let request = OperationRequest::new(Operation::Chgrp { group: 2 })
        .target("Image", [world.images[0].id])
        .child_option(option);
    assert_eq!(submit_error(&world, &request).kind(), ErrorKind::BadInput);
}

#[test]
fn test_rejects_find_children_without_types() {
    let world = ImagingWorld::project_with_images(1).unwrap();
    let request = OperationRequest::new(Operation::FindChildren {
        child_types: vec![],
        stop_before: vec![],
    })
    .target("Project", [world.project.id]);
    assert_eq!(submit_error(&world, &request).kind(), ErrorKind::BadInput);
}

#[test]
fn test_rejects_zero_batch_size() {
    let world = ImagingWorld::project_with_images(1).unwrap();
    let config = EngineConfig::from_toml_str("batch_size = 0").unwrap();
    let Err(err) = Engine::new(world.schema.clone(), &config, Box::new(StaticVoter::allow_all())) else {
        panic!("zero batch size accepted");
    };
    assert_eq!(err.kind(), ErrorKind::BadInput);
}

#[test]
fn test_rejects_malformed_config() {
    let err = EngineConfig::from_toml_str("batch_size = \"many\"").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadInput);
}

#[test]
fn test_skip_head_without_matches_fails_after_the_skip() {
    let mut world = ImagingWorld::project_with_images(2).unwrap();
    let before = world.store.clone();
    let engine = engine(&world);

    let request = OperationRequest::new(Operation::Delete)
        .target("Project", [world.project.id])
        .skip_head(["Album"]);
    let mut ctx = StepContext::new(&mut world.store);
    let failure = engine.run(&request, Actor::user(1, 1), &mut ctx).unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::BadInput);
    assert_eq!(failure.step, 5);
    assert_eq!(failure.state, RequestState::Done);
    assert_eq!(world.store, before);
}

#[test]
fn test_rejects_mandatory_deletion_cycle() {
    let schema = Arc::new(
        SchemaBuilder::new()
            .class(ClassSpec::new("A").link(LinkSpec::to_one("b", "B").non_nullable()))
            .class(ClassSpec::new("B").link(LinkSpec::to_one("a", "A").non_nullable()))
            .build()
            .unwrap(),
    );
    let a = ModelRef::new(schema.resolve("A").unwrap(), 1);
    let b = ModelRef::new(schema.resolve("B").unwrap(), 2);
    let mut store = InMemoryStore::new(schema.clone());
    let details = ObjectDetails::default();
    store.put(a, details, BTreeMap::new(), BTreeMap::from([("b".to_string(), LinkValue::One(Some(b)))]));
    store.put(b, details, BTreeMap::new(), BTreeMap::from([("a".to_string(), LinkValue::One(Some(a)))]));
    let before = store.clone();

    let engine = Engine::new(schema, &EngineConfig::default(), Box::new(StaticVoter::allow_all())).unwrap();
    let request = OperationRequest::new(Operation::Delete).target("A", [a.id]);
    let mut ctx = StepContext::new(&mut store);
    let failure = engine.run(&request, Actor::user(1, 1), &mut ctx).unwrap_err();

    assert_eq!(failure.kind(), ErrorKind::GraphInconsistency);
    assert_eq!(failure.state, RequestState::Processing);
    assert!(matches!(failure.error, GraphError::Inconsistency(Inconsistency::DeletionCycle { .. })));
    assert!(failure.error.to_string().contains("cycle"), "{}", failure.error);
    assert_eq!(store, before);
}

#[test]
fn test_missing_target_is_a_store_failure() {
    let mut world = ImagingWorld::project_with_images(1).unwrap();
    let before = world.store.clone();
    let engine = engine(&world);

    let request = OperationRequest::new(Operation::Delete).target("Image", [world.images[0].id, 9_999]);
    let mut ctx = StepContext::new(&mut world.store);
    let failure = engine.run(&request, Actor::user(1, 1), &mut ctx).unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::StoreFailure);
    assert_eq!(failure.state, RequestState::Planning);
    assert_eq!(world.store, before);
}

#[test]
fn test_regroup_violation_keeps_backing_files() {
    let schema = Arc::new(
        SchemaBuilder::new()
            .class(ClassSpec::new("Ext"))
            .class(ClassSpec::new("OriginalFile"))
            .class(
                ClassSpec::new("Holder")
                    .link(LinkSpec::to_one("ext", "Ext").non_nullable())
                    .link(LinkSpec::to_one("file", "OriginalFile").containment()),
            )
            .build()
            .unwrap(),
    );
    let r = |name: &str, id| ModelRef::new(schema.resolve(name).unwrap(), id);
    let (ext, file, holder) = (r("Ext", 1), r("OriginalFile", 2), r("Holder", 3));
    let mut store = InMemoryStore::new(schema.clone());
    let details = ObjectDetails::default();
    store.put(ext, details, BTreeMap::new(), BTreeMap::new());
    store.put(file, details, BTreeMap::new(), BTreeMap::new());
    store.put(
        holder,
        details,
        BTreeMap::new(),
        BTreeMap::from([
            ("ext".to_string(), LinkValue::One(Some(ext))),
            ("file".to_string(), LinkValue::One(Some(file))),
        ]),
    );
    let mut files = InMemoryFiles::new();
    files.add(file);
    let before = store.clone();

    let config = EngineConfig::default().with_file_class("OriginalFile");
    let request = OperationRequest::new(Operation::Chgrp { group: 2 }).target("Holder", [holder.id]);
    let denied = Engine::new(schema.clone(), &config, Box::new(StaticVoter::allow_all().deny(holder, Ability::Delete))).unwrap();
    let mut ctx = StepContext::new(&mut store).with_files(&mut files);
    let failure = denied.run(&request, Actor::user(1, 1), &mut ctx).unwrap_err();
    drop(ctx);

    assert_eq!(failure.kind(), ErrorKind::PolicyViolation);
    assert_eq!(failure.step, 1);
    assert_eq!(failure.state, RequestState::Validating);
    assert!(files.exists(file), "file removed by a request that never ran");
    assert!(files.removed().is_empty());
    assert_eq!(store, before);

    let allowed = Engine::new(schema, &config, Box::new(StaticVoter::allow_all())).unwrap();
    let mut ctx = StepContext::new(&mut store).with_files(&mut files);
    let response = allowed.run(&request, Actor::user(1, 1), &mut ctx).unwrap();
    drop(ctx);

    assert_eq!(response.files_deleted, 1);
    assert_eq!(response.deleted["OriginalFile"], vec![file.id]);
    assert!(!files.exists(file));
    assert!(!store.contains(holder));
}
