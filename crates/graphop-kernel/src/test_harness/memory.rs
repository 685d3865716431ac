//! In-memory collaborators
//!
//! [`InMemoryStore`] enforces the referential integrity a relational store
//! would: deleting a referenced object, nulling a mandatory link or inserting
//! a dangling reference all fail.

use crate::store::{
    DetailsChange, FileRepository, LinkValue, NewObject, ObjectDetails, ObjectStore, StoreError, StoredObject,
};
use graphop_schema::{ClassId, LinkProperty, ModelRef, Schema};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Objects held in a map keyed by id
///
/// Ids are unique across all classes. Two stores are equal when they hold
/// the same objects.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    schema: Arc<Schema>,
    objects: BTreeMap<u64, StoredObject>,
    next_id: u64,
}

impl PartialEq for InMemoryStore {
    fn eq(&self, other: &Self) -> bool {
        self.objects == other.objects
    }
}

impl InMemoryStore {
    /// Empty store over `schema`
    #[must_use]
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            objects: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Schema in use
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Add an object without any checks
    pub fn seed(&mut self, object: NewObject) -> ModelRef {
        let subject = ModelRef::new(object.class, self.next_id);
        self.next_id += 1;
        self.put(subject, object.details, object.simple, object.links);
        subject
    }

    /// Add an object under a caller-chosen id, without any checks
    pub fn put(
        &mut self,
        subject: ModelRef,
        details: ObjectDetails,
        simple: BTreeMap<String, serde_json::Value>,
        links: BTreeMap<String, LinkValue>,
    ) {
        self.next_id = self.next_id.max(subject.id + 1);
        self.objects.insert(
            subject.id,
            StoredObject {
                subject,
                details,
                simple,
                links,
            },
        );
    }

    /// Object by identity
    #[must_use]
    pub fn get(&self, subject: ModelRef) -> Option<&StoredObject> {
        self.objects.get(&subject.id).filter(|o| o.subject == subject)
    }

    /// Whether the object exists
    #[must_use]
    pub fn contains(&self, subject: ModelRef) -> bool {
        self.get(subject).is_some()
    }

    /// Number of objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of instances of `class` and its subclasses
    #[must_use]
    pub fn count(&self, class: ClassId) -> usize {
        self.instances(class).count()
    }

    /// Every object, by id
    pub fn objects(&self) -> impl Iterator<Item = &StoredObject> + '_ {
        self.objects.values()
    }

    fn instances(&self, class: ClassId) -> impl Iterator<Item = &StoredObject> + '_ {
        let schema = &self.schema;
        self.objects
            .values()
            .filter(move |o| schema.is_a(o.subject.class, class))
    }

    fn find(&self, class: ClassId, id: u64) -> Option<&StoredObject> {
        self.objects
            .get(&id)
            .filter(|o| self.schema.is_a(o.subject.class, class))
    }

    fn find_mut(&mut self, class: ClassId, id: u64) -> Result<&mut StoredObject, StoreError> {
        let schema = &self.schema;
        self.objects
            .get_mut(&id)
            .filter(|o| schema.is_a(o.subject.class, class))
            .ok_or(StoreError::NotFound(ModelRef::new(class, id)))
    }

    fn link(&self, class: ClassId, property: &str) -> Result<&LinkProperty, StoreError> {
        self.schema.link(class, property).ok_or_else(|| StoreError::UnknownProperty {
            class,
            property: property.to_string(),
        })
    }

    fn check_targets(&self, holder: ModelRef, property: &str, targets: &[ModelRef]) -> Result<(), StoreError> {
        match targets.iter().find(|t| !self.contains(**t)) {
            Some(missing) => Err(StoreError::ReferentialIntegrity {
                referer: holder,
                property: property.to_string(),
                target: *missing,
            }),
            None => Ok(()),
        }
    }
}

impl ObjectStore for InMemoryStore {
    fn forward_links(&self, class: ClassId, property: &str, ids: &[u64]) -> Result<Vec<(u64, ModelRef)>, StoreError> {
        let mut out = Vec::new();
        for id in ids {
            if let Some(value) = self.find(class, *id).and_then(|o| o.links.get(property)) {
                out.extend(value.targets().into_iter().map(|t| (*id, t)));
            }
        }
        Ok(out)
    }

    fn backward_links(
        &self,
        holder: ClassId,
        property: &str,
        targets: &[ModelRef],
    ) -> Result<Vec<(ModelRef, ModelRef)>, StoreError> {
        let wanted: HashSet<ModelRef> = targets.iter().copied().collect();
        let mut out = Vec::new();
        for object in self.instances(holder) {
            if let Some(value) = object.links.get(property) {
                for target in value.targets() {
                    if wanted.contains(&target) {
                        out.push((object.subject, target));
                    }
                }
            }
        }
        Ok(out)
    }

    fn read_simple(
        &self,
        class: ClassId,
        property: &str,
        ids: &[u64],
    ) -> Result<Vec<(u64, serde_json::Value)>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.find(class, *id)
                    .and_then(|o| o.simple.get(property))
                    .map(|v| (*id, v.clone()))
            })
            .collect())
    }

    fn load(&self, class: ClassId, ids: &[u64]) -> Result<Vec<StoredObject>, StoreError> {
        ids.iter()
            .map(|id| {
                self.find(class, *id)
                    .cloned()
                    .ok_or(StoreError::NotFound(ModelRef::new(class, *id)))
            })
            .collect()
    }

    fn null_property(&mut self, class: ClassId, property: &str, ids: &[u64]) -> Result<usize, StoreError> {
        let link = self.link(class, property)?;
        if !link.nullable || link.is_to_many() {
            return Err(StoreError::NotNullable {
                class,
                property: property.to_string(),
            });
        }
        for id in ids {
            self.find_mut(class, *id)?
                .links
                .insert(property.to_string(), LinkValue::One(None));
        }
        Ok(ids.len())
    }

    fn filter_collection(
        &mut self,
        class: ClassId,
        property: &str,
        ids: &[u64],
        remove: &[ModelRef],
    ) -> Result<usize, StoreError> {
        self.link(class, property)?;
        let mut touched = 0;
        for id in ids {
            if let Some(LinkValue::Many(items)) = self.find_mut(class, *id)?.links.get_mut(property) {
                let before = items.len();
                items.retain(|t| !remove.contains(t));
                if items.len() != before {
                    touched += 1;
                }
            }
        }
        Ok(touched)
    }

    fn delete(&mut self, class: ClassId, ids: &[u64]) -> Result<usize, StoreError> {
        let doomed: BTreeSet<u64> = ids.iter().copied().collect();
        for id in &doomed {
            if self.find(class, *id).is_none() {
                return Err(StoreError::NotFound(ModelRef::new(class, *id)));
            }
        }
        for object in self.objects.values().filter(|o| !doomed.contains(&o.subject.id)) {
            for (property, value) in &object.links {
                if let Some(target) = value.targets().into_iter().find(|t| doomed.contains(&t.id)) {
                    return Err(StoreError::ReferentialIntegrity {
                        referer: object.subject,
                        property: property.clone(),
                        target,
                    });
                }
            }
        }
        for id in &doomed {
            self.objects.remove(id);
        }
        Ok(doomed.len())
    }

    fn update_details(&mut self, class: ClassId, ids: &[u64], change: DetailsChange) -> Result<usize, StoreError> {
        for id in ids {
            let details = &mut self.find_mut(class, *id)?.details;
            match change {
                DetailsChange::Owner(owner) => details.owner = owner,
                DetailsChange::Group(group) => details.group = group,
                DetailsChange::Permissions(bits) => details.permissions = bits,
            }
        }
        Ok(ids.len())
    }

    fn insert(&mut self, object: NewObject) -> Result<ModelRef, StoreError> {
        let subject = ModelRef::new(object.class, self.next_id);
        for (property, value) in &object.links {
            self.link(object.class, property)?;
            self.check_targets(subject, property, &value.targets())?;
        }
        for link in self.schema.linked_to(object.class) {
            let set = matches!(object.links.get(&link.name), Some(LinkValue::One(Some(_))));
            if !link.nullable && !link.is_to_many() && !set {
                return Err(StoreError::NotNullable {
                    class: object.class,
                    property: link.name.clone(),
                });
            }
        }
        Ok(self.seed(object))
    }

    fn set_link(&mut self, subject: ModelRef, property: &str, value: LinkValue) -> Result<(), StoreError> {
        let link = self.link(subject.class, property)?;
        if !link.nullable && value == LinkValue::One(None) {
            return Err(StoreError::NotNullable {
                class: subject.class,
                property: property.to_string(),
            });
        }
        self.check_targets(subject, property, &value.targets())?;
        self.find_mut(subject.class, subject.id)?
            .links
            .insert(property.to_string(), value);
        Ok(())
    }

    fn append_links(&mut self, subject: ModelRef, property: &str, items: &[ModelRef]) -> Result<(), StoreError> {
        if !self.link(subject.class, property)?.is_to_many() {
            return Err(StoreError::Backend(format!("{property} is not a collection")));
        }
        self.check_targets(subject, property, items)?;
        let value = self
            .find_mut(subject.class, subject.id)?
            .links
            .entry(property.to_string())
            .or_insert_with(|| LinkValue::Many(Vec::new()));
        if let LinkValue::Many(existing) = value {
            existing.extend_from_slice(items);
        }
        Ok(())
    }
}

/// Backing files keyed by the object they belong to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InMemoryFiles {
    present: BTreeSet<ModelRef>,
    removed: Vec<ModelRef>,
}

impl InMemoryFiles {
    /// No files
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file for `owner`
    pub fn add(&mut self, owner: ModelRef) {
        self.present.insert(owner);
    }

    /// Whether `owner` still has a file
    #[must_use]
    pub fn exists(&self, owner: ModelRef) -> bool {
        self.present.contains(&owner)
    }

    /// Files removed so far, in removal order
    #[must_use]
    pub fn removed(&self) -> &[ModelRef] {
        &self.removed
    }
}

impl FileRepository for InMemoryFiles {
    fn delete_files(&mut self, files: &[ModelRef]) -> Result<usize, StoreError> {
        let mut count = 0;
        for file in files {
            if self.present.remove(file) {
                self.removed.push(*file);
                count += 1;
            }
        }
        Ok(count)
    }
}
