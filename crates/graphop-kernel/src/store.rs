//! Store and file repository collaborator contracts
//!
//! The planner only ever reads through [`ObjectStore`] in batches keyed by
//! class and id lists; the executor writes through it the same way. Every
//! batched call takes the whole id set at once so an implementation can issue
//! one round trip per call.

use graphop_schema::{ClassId, ModelRef};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Store-side failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No object with this identity
    #[error("no such object: {0}")]
    NotFound(ModelRef),

    /// Property not declared for the class
    #[error("unknown property {property} on class {class}")]
    UnknownProperty {
        /// Class addressed
        class: ClassId,
        /// Property name
        property: String,
    },

    /// Attempt to null a property that does not allow it
    #[error("property {property} on class {class} is not nullable")]
    NotNullable {
        /// Class addressed
        class: ClassId,
        /// Property name
        property: String,
    },

    /// A write would leave a dangling or missing reference
    #[error("{referer} references {target} through {property}")]
    ReferentialIntegrity {
        /// Object holding the reference
        referer: ModelRef,
        /// Property name
        property: String,
        /// Referenced object
        target: ModelRef,
    },

    /// Anything else the backend reports
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Value of a link property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkValue {
    /// To-one link, possibly null
    One(Option<ModelRef>),
    /// To-many link, in stored order
    Many(Vec<ModelRef>),
}

impl LinkValue {
    /// Referenced objects in order
    #[must_use]
    pub fn targets(&self) -> Vec<ModelRef> {
        match self {
            LinkValue::One(target) => target.iter().copied().collect(),
            LinkValue::Many(targets) => targets.clone(),
        }
    }

    /// Whether the value references `target`
    #[must_use]
    pub fn references(&self, target: ModelRef) -> bool {
        match self {
            LinkValue::One(t) => *t == Some(target),
            LinkValue::Many(ts) => ts.contains(&target),
        }
    }
}

/// Ownership and permission bits of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectDetails {
    /// Owning user
    pub owner: u64,
    /// Owning group
    pub group: u64,
    /// Permission bits
    #[serde(default)]
    pub permissions: u32,
}

/// The mutation applied by a process batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailsChange {
    /// Give to another user
    Owner(u64),
    /// Move to another group
    Group(u64),
    /// Replace permission bits
    Permissions(u32),
}

/// A persisted object with all its properties
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    /// Identity
    pub subject: ModelRef,
    /// Ownership
    pub details: ObjectDetails,
    /// Simple property values
    pub simple: BTreeMap<String, serde_json::Value>,
    /// Link property values
    pub links: BTreeMap<String, LinkValue>,
}

/// An object about to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewObject {
    /// Concrete class
    pub class: ClassId,
    /// Ownership
    pub details: ObjectDetails,
    /// Simple property values
    pub simple: BTreeMap<String, serde_json::Value>,
    /// Link property values
    pub links: BTreeMap<String, LinkValue>,
}

impl NewObject {
    /// Empty object of `class`
    #[must_use]
    pub fn new(class: ClassId, details: ObjectDetails) -> Self {
        Self {
            class,
            details,
            simple: BTreeMap::new(),
            links: BTreeMap::new(),
        }
    }
}

/// Batched access to persisted objects
///
/// Class arguments of write calls are concrete classes; read calls accept any
/// class and match its subclasses.
pub trait ObjectStore {
    /// Targets of `property` for each holder id, as `(holder id, target)` pairs
    ///
    /// # Errors
    /// Backend failures
    fn forward_links(
        &self,
        class: ClassId,
        property: &str,
        ids: &[u64],
    ) -> Result<Vec<(u64, ModelRef)>, StoreError>;

    /// Objects of `holder` (or subclasses) whose `property` references any of
    /// `targets`, as `(referer, target)` pairs
    ///
    /// # Errors
    /// Backend failures
    fn backward_links(
        &self,
        holder: ClassId,
        property: &str,
        targets: &[ModelRef],
    ) -> Result<Vec<(ModelRef, ModelRef)>, StoreError>;

    /// Value of a simple property for each id that has one
    ///
    /// # Errors
    /// Backend failures
    fn read_simple(
        &self,
        class: ClassId,
        property: &str,
        ids: &[u64],
    ) -> Result<Vec<(u64, serde_json::Value)>, StoreError>;

    /// Load whole objects, resolving their concrete class
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if an id does not exist as `class` or a subclass
    fn load(&self, class: ClassId, ids: &[u64]) -> Result<Vec<StoredObject>, StoreError>;

    /// Null a to-one property on every listed object
    ///
    /// # Errors
    /// Fails if the property is not nullable
    fn null_property(&mut self, class: ClassId, property: &str, ids: &[u64])
        -> Result<usize, StoreError>;

    /// Remove `remove` from a to-many property on every listed object
    ///
    /// # Errors
    /// Backend failures
    fn filter_collection(
        &mut self,
        class: ClassId,
        property: &str,
        ids: &[u64],
        remove: &[ModelRef],
    ) -> Result<usize, StoreError>;

    /// Delete the listed objects
    ///
    /// # Errors
    /// [`StoreError::ReferentialIntegrity`] if a surviving object still
    /// references one of them
    fn delete(&mut self, class: ClassId, ids: &[u64]) -> Result<usize, StoreError>;

    /// Apply an ownership or permission change
    ///
    /// # Errors
    /// Backend failures
    fn update_details(
        &mut self,
        class: ClassId,
        ids: &[u64],
        change: DetailsChange,
    ) -> Result<usize, StoreError>;

    /// Persist a new object and return its identity
    ///
    /// # Errors
    /// Fails on references to missing objects or unset non-nullable links
    fn insert(&mut self, object: NewObject) -> Result<ModelRef, StoreError>;

    /// Replace the value of a link property
    ///
    /// # Errors
    /// Backend failures
    fn set_link(&mut self, subject: ModelRef, property: &str, value: LinkValue)
        -> Result<(), StoreError>;

    /// Append items to a to-many link property
    ///
    /// # Errors
    /// Backend failures
    fn append_links(
        &mut self,
        subject: ModelRef,
        property: &str,
        items: &[ModelRef],
    ) -> Result<(), StoreError>;
}

/// Removes the binary files backing file-typed objects
pub trait FileRepository {
    /// Delete the files of the listed objects
    ///
    /// # Errors
    /// Backend failures
    fn delete_files(&mut self, files: &[ModelRef]) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphop_schema::{ClassSpec, SchemaBuilder};

    #[test]
    fn link_values_report_targets() {
        let schema = SchemaBuilder::new()
            .class(ClassSpec::new("Image"))
            .build()
            .unwrap();
        let image = schema.resolve("Image").unwrap();
        let a = ModelRef::new(image, 1);
        let b = ModelRef::new(image, 2);

        let one = LinkValue::One(Some(a));
        assert!(one.references(a));
        assert_eq!(one.targets(), vec![a]);
        assert!(LinkValue::One(None).targets().is_empty());

        let many = LinkValue::Many(vec![b, a]);
        assert_eq!(many.targets(), vec![b, a]);
        assert!(many.references(b));
    }
}
