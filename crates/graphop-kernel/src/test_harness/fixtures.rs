//! Imaging fixture schema and worlds built on it
//!
//! Containers hold children through link objects (`ProjectDatasetLink`,
//! `DatasetImageLink`, `ImageAnnotationLink`) whose `child` property is a
//! containment link, so a child shared by two containers survives deletion
//! of either one.

use crate::error::GraphError;
use crate::store::{LinkValue, NewObject, ObjectDetails};
use crate::test_harness::memory::{InMemoryFiles, InMemoryStore};
use graphop_schema::{ClassId, ClassSpec, LinkSpec, ModelRef, NamespaceSpec, Schema, SchemaDefinition};
use serde_json::json;
use std::sync::Arc;

/// Definition of the imaging schema
#[must_use]
pub fn imaging_definition() -> SchemaDefinition {
    SchemaDefinition {
        classes: vec![
            ClassSpec::new("Project").simple(["name"]),
            ClassSpec::new("Dataset").simple(["name"]),
            ClassSpec::new("ProjectDatasetLink")
                .link(LinkSpec::to_one("parent", "Project").non_nullable())
                .link(LinkSpec::to_one("child", "Dataset").non_nullable().containment()),
            ClassSpec::new("OriginalFile").simple(["name", "path"]),
            ClassSpec::new("Image")
                .simple(["name"])
                .link(LinkSpec::to_one("original", "OriginalFile").containment()),
            ClassSpec::new("DatasetImageLink")
                .link(LinkSpec::to_one("parent", "Dataset").non_nullable())
                .link(LinkSpec::to_one("child", "Image").non_nullable().containment()),
            ClassSpec::new("Pixels")
                .simple(["size"])
                .link(LinkSpec::to_one("image", "Image").non_nullable()),
            ClassSpec::new("Annotation").simple(["ns", "text"]),
            ClassSpec::new("TagAnnotation").extends("Annotation"),
            ClassSpec::new("CommentAnnotation").extends("Annotation"),
            ClassSpec::new("ImageAnnotationLink")
                .link(LinkSpec::to_one("parent", "Image").non_nullable())
                .link(LinkSpec::to_one("child", "Annotation").non_nullable().containment()),
            ClassSpec::new("Shape").simple(["kind"]),
            ClassSpec::new("Roi")
                .simple(["name"])
                .link(LinkSpec::to_one("image", "Image").non_nullable())
                .link(LinkSpec::to_many("shapes", "Shape").ordered().containment()),
            ClassSpec::new("Album")
                .simple(["name"])
                .link(LinkSpec::to_many("images", "Image")),
        ],
        namespace: Some(NamespaceSpec {
            class: "Annotation".into(),
            property: "ns".into(),
        }),
    }
}

/// The imaging schema
///
/// # Errors
/// Never for the shipped definition; kept fallible for callers that edit it
pub fn imaging_schema() -> Result<Arc<Schema>, GraphError> {
    Ok(Arc::new(imaging_definition().build()?))
}

/// Resolved class ids of the imaging schema
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct ImagingClasses {
    pub project: ClassId,
    pub dataset: ClassId,
    pub project_dataset_link: ClassId,
    pub original_file: ClassId,
    pub image: ClassId,
    pub dataset_image_link: ClassId,
    pub pixels: ClassId,
    pub annotation: ClassId,
    pub tag: ClassId,
    pub comment: ClassId,
    pub image_annotation_link: ClassId,
    pub shape: ClassId,
    pub roi: ClassId,
    pub album: ClassId,
}

impl ImagingClasses {
    fn resolve(schema: &Schema) -> Result<Self, GraphError> {
        Ok(Self {
            project: schema.resolve("Project")?,
            dataset: schema.resolve("Dataset")?,
            project_dataset_link: schema.resolve("ProjectDatasetLink")?,
            original_file: schema.resolve("OriginalFile")?,
            image: schema.resolve("Image")?,
            dataset_image_link: schema.resolve("DatasetImageLink")?,
            pixels: schema.resolve("Pixels")?,
            annotation: schema.resolve("Annotation")?,
            tag: schema.resolve("TagAnnotation")?,
            comment: schema.resolve("CommentAnnotation")?,
            image_annotation_link: schema.resolve("ImageAnnotationLink")?,
            shape: schema.resolve("Shape")?,
            roi: schema.resolve("Roi")?,
            album: schema.resolve("Album")?,
        })
    }
}

/// A store populated over the imaging schema
#[derive(Debug, Clone)]
pub struct ImagingWorld {
    /// Schema shared with the store
    pub schema: Arc<Schema>,
    /// Resolved classes
    pub classes: ImagingClasses,
    /// Object store
    pub store: InMemoryStore,
    /// Files of `OriginalFile` objects
    pub files: InMemoryFiles,
    /// The first project
    pub project: ModelRef,
    /// The project's dataset
    pub dataset: ModelRef,
    /// Images of the dataset, each with one `Pixels`
    pub images: Vec<ModelRef>,
    owner: ObjectDetails,
}

impl ImagingWorld {
    /// One project holding one dataset holding `n` images
    ///
    /// # Errors
    /// Only if the imaging schema fails to build
    pub fn project_with_images(n: usize) -> Result<Self, GraphError> {
        Self::owned_by(n, ObjectDetails { owner: 1, group: 1, permissions: 0o644 })
    }

    /// Like [`project_with_images`](Self::project_with_images) with explicit ownership
    ///
    /// # Errors
    /// Only if the imaging schema fails to build
    pub fn owned_by(n: usize, owner: ObjectDetails) -> Result<Self, GraphError> {
        let schema = imaging_schema()?;
        let classes = ImagingClasses::resolve(&schema)?;
        let store = InMemoryStore::new(schema.clone());
        let mut world = Self {
            schema,
            classes,
            store,
            files: InMemoryFiles::new(),
            project: ModelRef::new(classes.project, 0),
            dataset: ModelRef::new(classes.dataset, 0),
            images: Vec::new(),
            owner,
        };
        world.project = world.add_project("project");
        world.dataset = world.add_dataset("dataset");
        world.link_project_dataset(world.project, world.dataset);
        for i in 0..n {
            let image = world.add_image(&format!("image-{i}"));
            world.link_dataset_image(world.dataset, image);
            world.images.push(image);
        }
        Ok(world)
    }

    fn object(&self, class: ClassId) -> NewObject {
        NewObject::new(class, self.owner)
    }

    fn named(&mut self, class: ClassId, name: &str) -> ModelRef {
        let mut object = self.object(class);
        object.simple.insert("name".into(), json!(name));
        self.store.seed(object)
    }

    fn link_object(&mut self, class: ClassId, parent: ModelRef, child: ModelRef) -> ModelRef {
        let mut object = self.object(class);
        object.links.insert("parent".into(), LinkValue::One(Some(parent)));
        object.links.insert("child".into(), LinkValue::One(Some(child)));
        self.store.seed(object)
    }

    /// New project
    pub fn add_project(&mut self, name: &str) -> ModelRef {
        self.named(self.classes.project, name)
    }

    /// New dataset
    pub fn add_dataset(&mut self, name: &str) -> ModelRef {
        self.named(self.classes.dataset, name)
    }

    /// New image with its pixels
    pub fn add_image(&mut self, name: &str) -> ModelRef {
        let image = self.named(self.classes.image, name);
        let mut pixels = self.object(self.classes.pixels);
        pixels.simple.insert("size".into(), json!(512));
        pixels.links.insert("image".into(), LinkValue::One(Some(image)));
        self.store.seed(pixels);
        image
    }

    /// Put a dataset into a project
    pub fn link_project_dataset(&mut self, project: ModelRef, dataset: ModelRef) -> ModelRef {
        self.link_object(self.classes.project_dataset_link, project, dataset)
    }

    /// Put an image into a dataset
    pub fn link_dataset_image(&mut self, dataset: ModelRef, image: ModelRef) -> ModelRef {
        self.link_object(self.classes.dataset_image_link, dataset, image)
    }

    /// Attach a new tag annotation to an image
    pub fn annotate(&mut self, image: ModelRef, ns: Option<&str>) -> ModelRef {
        let mut tag = self.object(self.classes.tag);
        if let Some(ns) = ns {
            tag.simple.insert("ns".into(), json!(ns));
        }
        tag.simple.insert("text".into(), json!("tag"));
        let tag = self.store.seed(tag);
        self.attach(image, tag);
        tag
    }

    /// Attach an existing annotation to an image
    pub fn attach(&mut self, image: ModelRef, annotation: ModelRef) -> ModelRef {
        self.link_object(self.classes.image_annotation_link, image, annotation)
    }

    /// Give an image an original file with a backing file
    pub fn add_original_file(&mut self, image: ModelRef) -> ModelRef {
        let file = self.named(self.classes.original_file, "raw.tiff");
        self.files.add(file);
        if let Some(object) = self.store.get(image).cloned() {
            let mut links = object.links;
            links.insert("original".into(), LinkValue::One(Some(file)));
            self.store.put(image, object.details, object.simple, links);
        }
        file
    }

    /// New region of interest on an image with `shapes` shapes
    pub fn add_roi(&mut self, image: ModelRef, shapes: usize) -> ModelRef {
        let mut members = Vec::with_capacity(shapes);
        for i in 0..shapes {
            let mut shape = self.object(self.classes.shape);
            shape.simple.insert("kind".into(), json!(if i % 2 == 0 { "point" } else { "line" }));
            members.push(self.store.seed(shape));
        }
        let mut roi = self.object(self.classes.roi);
        roi.simple.insert("name".into(), json!("roi"));
        roi.links.insert("image".into(), LinkValue::One(Some(image)));
        roi.links.insert("shapes".into(), LinkValue::Many(members));
        self.store.seed(roi)
    }

    /// New album collecting `images`
    pub fn add_album(&mut self, images: &[ModelRef]) -> ModelRef {
        let mut album = self.object(self.classes.album);
        album.simple.insert("name".into(), json!("album"));
        album.links.insert("images".into(), LinkValue::Many(images.to_vec()));
        self.store.seed(album)
    }

    /// The `Pixels` of an image
    #[must_use]
    pub fn pixels_of(&self, image: ModelRef) -> Option<ModelRef> {
        self.store
            .objects()
            .find(|o| o.subject.class == self.classes.pixels && o.links.get("image").is_some_and(|l| l.references(image)))
            .map(|o| o.subject)
    }
}
