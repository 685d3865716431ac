use graphop_kernel::test_harness::ImagingWorld;
use graphop_kernel::*;
use graphop_schema::ModelRef;
use pretty_assertions::assert_eq;

fn engine_with(world: &ImagingWorld, config: EngineConfig, voter: StaticVoter) -> Engine {
    Engine::new(world.schema.clone(), &config, Box::new(voter)).unwrap()
}

fn engine(world: &ImagingWorld) -> Engine {
    let config = EngineConfig::default().with_batch_size(2).with_file_class("OriginalFile");
    engine_with(world, config, StaticVoter::allow_all())
}

fn run_as(
    engine: &Engine,
    world: &mut ImagingWorld,
    request: &OperationRequest,
    actor: Actor,
) -> Result<OperationResponse, RequestFailure> {
    let mut ctx = StepContext::new(&mut world.store).with_files(&mut world.files);
    engine.run(request, actor, &mut ctx)
}

fn run(engine: &Engine, world: &mut ImagingWorld, request: &OperationRequest) -> Result<OperationResponse, RequestFailure> {
    run_as(engine, world, request, Actor::user(1, 1))
}

fn ids(refs: &[ModelRef]) -> Vec<u64> {
    refs.iter().map(|r| r.id).collect()
}

#[test]
fn test_delete_project_takes_everything_it_contains() {
    let mut world = ImagingWorld::project_with_images(3).unwrap();
    let roi = world.add_roi(world.images[0], 2);
    let album = world.add_album(&[world.images[1]]);
    let engine = engine(&world);

    let request = OperationRequest::new(Operation::Delete).target("Project", [world.project.id]);
    let response = run(&engine, &mut world, &request).unwrap();

    assert_eq!(response.deleted["Image"], ids(&world.images));
    assert_eq!(response.deleted["Project"], vec![world.project.id]);
    assert!(response.processed.is_empty());
    assert!(response.unlinked >= 1);
    assert_eq!(response.steps, 5);

    let c = world.classes;
    for class in [c.project, c.dataset, c.image, c.pixels, c.roi, c.shape, c.dataset_image_link] {
        assert_eq!(world.store.count(class), 0, "{} left behind", world.schema.name(class));
    }
    assert!(!world.store.contains(roi));
    // The album stays, without the deleted image
    assert_eq!(world.store.get(album).unwrap().links["images"], LinkValue::Many(vec![]));
}

#[test]
fn test_shared_image_survives_dataset_delete() {
    let mut world = ImagingWorld::project_with_images(2).unwrap();
    let other = world.add_dataset("other");
    let shared = world.images[0];
    world.link_dataset_image(other, shared);
    let engine = engine(&world);

    let request = OperationRequest::new(Operation::Delete).target("Dataset", [world.dataset.id]);
    let response = run(&engine, &mut world, &request).unwrap();

    assert_eq!(response.deleted["Image"], vec![world.images[1].id]);
    assert!(world.store.contains(shared));
    assert!(world.pixels_of(shared).is_some());
    assert!(world.store.contains(other));
    assert!(!world.store.contains(world.dataset));
    assert!(world.store.contains(world.project));
    assert_eq!(world.store.count(world.classes.dataset_image_link), 1);
}

#[test]
fn test_delete_takes_annotations_unless_shared() {
    let mut world = ImagingWorld::project_with_images(2).unwrap();
    let own = world.annotate(world.images[0], None);
    let shared = world.annotate(world.images[0], None);
    world.attach(world.images[1], shared);
    let engine = engine(&world);

    let request = OperationRequest::new(Operation::Delete).target("Image", [world.images[0].id]);
    let response = run(&engine, &mut world, &request).unwrap();

    assert_eq!(response.deleted["TagAnnotation"], vec![own.id]);
    assert!(!world.store.contains(own));
    assert!(world.store.contains(shared));
    assert_eq!(world.store.count(world.classes.image_annotation_link), 1);
}

#[test]
fn test_namespace_child_option_keeps_other_annotations() {
    let mut world = ImagingWorld::project_with_images(1).unwrap();
    let image = world.images[0];
    let rated = world.annotate(image, Some("N"));
    let plain = world.annotate(image, None);
    let engine = engine(&world);

    let request = OperationRequest::new(Operation::Delete)
        .target("Image", [image.id])
        .child_option(ChildOption::include("Annotation").in_namespaces(["N"]));
    run(&engine, &mut world, &request).unwrap();

    assert!(!world.store.contains(image));
    assert!(!world.store.contains(rated));
    assert!(world.store.contains(plain));
}

#[test]
fn test_type_ignore_leaves_classes_alone() {
    let mut world = ImagingWorld::project_with_images(1).unwrap();
    let image = world.images[0];
    let tag = world.annotate(image, None);
    let engine = engine(&world);

    let request = OperationRequest::new(Operation::Chgrp { group: 4 })
        .target("Image", [image.id])
        .ignore_type("Annotation");
    let response = run(&engine, &mut world, &request).unwrap();

    assert!(!response.processed.contains_key("TagAnnotation"));
    assert_eq!(world.store.get(tag).unwrap().details.group, 1);
    assert_eq!(world.store.get(image).unwrap().details.group, 4);
}

#[test]
fn test_chgrp_severs_links_from_objects_left_behind() {
    let mut world = ImagingWorld::project_with_images(2).unwrap();
    let album = world.add_album(&[world.images[0]]);
    let engine = engine(&world);

    let request = OperationRequest::new(Operation::Chgrp { group: 7 }).target("Project", [world.project.id]);
    let response = run(&engine, &mut world, &request).unwrap();

    assert_eq!(response.processed["Image"], ids(&world.images));
    assert_eq!(response.unlinked, 1);
    for image in &world.images {
        assert_eq!(world.store.get(*image).unwrap().details.group, 7);
        let pixels = world.pixels_of(*image).unwrap();
        assert_eq!(world.store.get(pixels).unwrap().details.group, 7);
    }
    let album = world.store.get(album).unwrap();
    assert_eq!(album.details.group, 1);
    assert_eq!(album.links["images"], LinkValue::Many(vec![]));
}

#[test]
fn test_chgrp_of_image_deletes_links_to_containers_left_behind() {
    let mut world = ImagingWorld::project_with_images(2).unwrap();
    let image = world.images[0];
    let engine = engine(&world);

    let request = OperationRequest::new(Operation::Chgrp { group: 3 }).target("Image", [image.id]);
    let response = run(&engine, &mut world, &request).unwrap();

    assert_eq!(response.deleted["DatasetImageLink"].len(), 1);
    assert_eq!(world.store.get(image).unwrap().details.group, 3);
    assert_eq!(world.store.get(world.dataset).unwrap().details.group, 1);
    assert_eq!(world.store.count(world.classes.dataset_image_link), 1);
}

#[test]
fn test_chown_and_chmod_apply_details() {
    let mut world = ImagingWorld::project_with_images(2).unwrap();
    let engine = engine(&world);

    let chown = OperationRequest::new(Operation::Chown { user: 9 }).target("Dataset", [world.dataset.id]);
    run(&engine, &mut world, &chown).unwrap();
    assert_eq!(world.store.get(world.dataset).unwrap().details.owner, 9);
    for image in &world.images {
        assert_eq!(world.store.get(*image).unwrap().details.owner, 9);
    }
    assert_eq!(world.store.get(world.project).unwrap().details.owner, 1);

    let chmod = OperationRequest::new(Operation::Chmod { permissions: 0o600 }).target("Project", [world.project.id]);
    let response = run(&engine, &mut world, &chmod).unwrap();
    assert!(response.deleted.is_empty());
    assert!(world.store.objects().all(|o| o.details.permissions == 0o600));
}

#[test]
fn test_find_children_stops_before_types() {
    let mut world = ImagingWorld::project_with_images(2).unwrap();
    for image in world.images.clone() {
        world.add_roi(image, 1);
    }
    let before = world.store.clone();
    let engine = engine(&world);

    let everything = OperationRequest::new(Operation::FindChildren {
        child_types: vec!["Image".into(), "Roi".into()],
        stop_before: vec![],
    })
    .target("Project", [world.project.id]);
    let response = run(&engine, &mut world, &everything).unwrap();
    assert_eq!(response.found["Image"], ids(&world.images));
    assert_eq!(response.found["Roi"].len(), 2);

    let shallow = OperationRequest::new(Operation::FindChildren {
        child_types: vec!["Image".into(), "Roi".into()],
        stop_before: vec!["Image".into()],
    })
    .target("Project", [world.project.id]);
    let response = run(&engine, &mut world, &shallow).unwrap();
    assert_eq!(response.found["Image"], ids(&world.images));
    assert!(!response.found.contains_key("Roi"));

    assert_eq!(world.store, before);
}

#[test]
fn test_find_children_does_not_report_targets() {
    let mut world = ImagingWorld::project_with_images(1).unwrap();
    let engine = engine(&world);
    let request = OperationRequest::new(Operation::FindChildren {
        child_types: vec!["Project".into(), "Dataset".into()],
        stop_before: vec![],
    })
    .target("Project", [world.project.id]);

    let response = run(&engine, &mut world, &request).unwrap();
    assert!(!response.found.contains_key("Project"));
    assert_eq!(response.found["Dataset"], vec![world.dataset.id]);
}

#[test]
fn test_skip_head_deletes_only_contained_images() {
    let mut world = ImagingWorld::project_with_images(2).unwrap();
    for image in world.images.clone() {
        world.annotate(image, None);
    }
    let engine = engine(&world);

    let request = OperationRequest::new(Operation::Delete)
        .target("Project", [world.project.id])
        .skip_head(["Image"]);
    let response = run(&engine, &mut world, &request).unwrap();

    assert_eq!(response.deferred["Image"], ids(&world.images));
    assert_eq!(response.deleted["Image"], ids(&world.images));
    assert_eq!(response.steps, 10);
    assert!(world.store.contains(world.project));
    assert!(world.store.contains(world.dataset));
    assert_eq!(world.store.count(world.classes.image), 0);
    assert_eq!(world.store.count(world.classes.annotation), 0);
}

#[test]
fn test_skip_head_steps_through_both_halves() {
    let mut world = ImagingWorld::project_with_images(1).unwrap();
    let engine = engine(&world);
    let request = OperationRequest::new(Operation::Chmod { permissions: 0o640 })
        .target("Project", [world.project.id])
        .skip_head(["Dataset"]);

    let Submission::SkipHead(mut pair) = engine.submit(&request, Actor::user(1, 1)).unwrap() else {
        panic!("expected a head-skip submission");
    };
    let mut ctx = StepContext::new(&mut world.store);
    let mut states = Vec::new();
    while !pair.is_done() {
        states.push(pair.step(&mut ctx).unwrap());
    }
    assert_eq!(states.len(), 10);
    assert_eq!(pair.deferred(), vec![world.dataset]);
    assert_eq!(pair.perform().unwrap().state(), RequestState::Done);
    drop(ctx);

    assert_eq!(world.store.get(world.dataset).unwrap().details.permissions, 0o640);
    assert_eq!(world.store.get(world.project).unwrap().details.permissions, 0o644);
}

#[test]
fn test_files_removed_with_their_objects() {
    let mut world = ImagingWorld::project_with_images(2).unwrap();
    let file = world.add_original_file(world.images[0]);
    let engine = engine(&world);
    let request = OperationRequest::new(Operation::Delete).target("Image", [world.images[0].id]);

    let dry = run(&engine, &mut world, &request.clone().dry_run(true)).unwrap();
    assert_eq!(dry.files_deleted, 0);
    assert!(world.files.exists(file));
    assert_eq!(dry.deleted["OriginalFile"], vec![file.id]);

    let done = run(&engine, &mut world, &request).unwrap();
    assert_eq!(done.files_deleted, 1);
    assert!(!world.files.exists(file));
    assert!(!world.store.contains(file));
    assert_eq!(world.files.removed(), &[file]);
}

#[test]
fn test_dry_run_reports_without_writing() {
    let mut world = ImagingWorld::project_with_images(3).unwrap();
    world.add_album(&world.images.clone());
    let before = world.store.clone();
    let engine = engine(&world);
    let request = OperationRequest::new(Operation::Delete).target("Dataset", [world.dataset.id]);

    let dry = run(&engine, &mut world, &request.clone().dry_run(true)).unwrap();
    assert!(dry.dry_run);
    assert_eq!(world.store, before);

    let done = run(&engine, &mut world, &request).unwrap();
    assert_eq!(dry.deleted, done.deleted);
    assert_eq!(dry.unlinked, done.unlinked);
    assert_ne!(world.store, before);
}

#[test]
fn test_violations_stop_before_any_write() {
    let mut world = ImagingWorld::project_with_images(2).unwrap();
    let protected = world.images[1];
    let before = world.store.clone();
    let config = EngineConfig::default();
    let engine = engine_with(&world, config, StaticVoter::allow_all().deny(protected, Ability::Delete));
    let request = OperationRequest::new(Operation::Delete).target("Project", [world.project.id]);

    let failure = run(&engine, &mut world, &request).unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::PolicyViolation);
    assert_eq!(failure.step, 1);
    assert_eq!(failure.state, RequestState::Validating);
    let GraphError::PolicyViolation(report) = &failure.error else {
        panic!("expected a policy violation, got {failure}");
    };
    assert!(report.violations.iter().any(|v| v.class == "Image" && v.id == protected.id));
    assert_eq!(world.store, before);

    let response = run_as(&engine, &mut world, &request, Actor::admin(0, 0)).unwrap();
    assert!(response.deleted["Image"].contains(&protected.id));
}

#[test]
fn test_unnullable_configuration_blocks_severing() {
    let mut world = ImagingWorld::project_with_images(1).unwrap();
    world.add_album(&world.images.clone());
    let config = EngineConfig::default().with_unnullable("Album", "images");
    let engine = engine_with(&world, config, StaticVoter::allow_all());
    let request = OperationRequest::new(Operation::Delete).target("Image", [world.images[0].id]);

    let failure = run(&engine, &mut world, &request).unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::GraphInconsistency);
    assert_eq!(failure.step, 0);
    assert!(world.store.contains(world.images[0]));
}

#[test]
fn test_cancelled_request_refuses_steps() {
    let mut world = ImagingWorld::project_with_images(1).unwrap();
    let before = world.store.clone();
    let engine = engine(&world);
    let request = OperationRequest::new(Operation::Delete).target("Project", [world.project.id]);

    let Submission::Single(mut single) = engine.submit(&request, Actor::user(1, 1)).unwrap() else {
        panic!("expected a single request");
    };
    let mut ctx = StepContext::new(&mut world.store);
    assert_eq!(single.step(&mut ctx).unwrap(), RequestState::Validating);
    assert!(single.plan().is_some());
    single.cancel().unwrap();
    assert_eq!(single.state(), RequestState::Cancelled);

    let failure = single.step(&mut ctx).unwrap_err();
    assert_eq!(failure.kind(), ErrorKind::IllegalState);
    assert!(single.cancel().is_err());
    assert!(single.response().is_none());
    drop(ctx);
    assert_eq!(world.store, before);
}

#[test]
fn test_failed_request_stays_failed() {
    let mut world = ImagingWorld::project_with_images(1).unwrap();
    let engine = engine_with(
        &world,
        EngineConfig::default(),
        StaticVoter::allow_all().deny(world.images[0], Ability::Delete),
    );
    let request = OperationRequest::new(Operation::Delete).target("Image", [world.images[0].id]);
    let Submission::Single(mut single) = engine.submit(&request, Actor::user(1, 1)).unwrap() else {
        panic!("expected a single request");
    };
    let mut ctx = StepContext::new(&mut world.store);

    single.step(&mut ctx).unwrap();
    assert!(single.step(&mut ctx).is_err());
    assert_eq!(single.state(), RequestState::Failed);
    assert_eq!(single.step(&mut ctx).unwrap_err().kind(), ErrorKind::IllegalState);
}

#[test]
fn test_responses_serialize_by_class_name() {
    let mut world = ImagingWorld::project_with_images(1).unwrap();
    let engine = engine(&world);
    let request: OperationRequest = serde_json::from_value(serde_json::json!({
        "op": "chgrp",
        "group": 2,
        "targets": { "Image": [world.images[0].id] },
        "dry_run": true
    }))
    .unwrap();

    let response = run(&engine, &mut world, &request).unwrap();
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["operation"], "chgrp");
    assert_eq!(json["dry_run"], true);
    assert_eq!(json["processed"]["Image"][0], world.images[0].id);
}
