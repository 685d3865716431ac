//! World files: a schema plus seeded objects, loaded into in-memory stores
//!
//! ```json
//! {
//!   "schema": { "classes": [ { "name": "Image" }, ... ] },
//!   "objects": [
//!     { "class": "Image", "id": 1, "details": { "owner": 1, "group": 1 },
//!       "simple": { "name": "a" }, "links": { "original": { "class": "OriginalFile", "id": 2 } } }
//!   ],
//!   "files": [ { "class": "OriginalFile", "id": 2 } ]
//! }
//! ```

use crate::error::GraphError;
use crate::store::{LinkValue, ObjectDetails};
use crate::test_harness::memory::{InMemoryFiles, InMemoryStore};
use graphop_schema::{ModelRef, Schema, SchemaDefinition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Reference to an object by class name and id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectName {
    /// Concrete class name
    pub class: String,
    /// Object id
    pub id: u64,
}

/// Value of a link property in a world file
///
/// `null` and a single reference are to-one values; an array is to-many.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorldLink {
    /// To-many value
    Many(Vec<ObjectName>),
    /// To-one value
    One(Option<ObjectName>),
}

/// One seeded object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldObject {
    /// Concrete class name
    pub class: String,
    /// Id, unique across the file
    pub id: u64,
    /// Ownership
    #[serde(default)]
    pub details: ObjectDetails,
    /// Simple property values
    #[serde(default)]
    pub simple: BTreeMap<String, serde_json::Value>,
    /// Link property values
    #[serde(default)]
    pub links: BTreeMap<String, WorldLink>,
}

/// Schema and objects of a test world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldFile {
    /// Class hierarchy
    pub schema: SchemaDefinition,
    /// Seeded objects
    #[serde(default)]
    pub objects: Vec<WorldObject>,
    /// Objects with backing files
    #[serde(default)]
    pub files: Vec<ObjectName>,
}

/// A world file turned into live collaborators
#[derive(Debug, Clone)]
pub struct LoadedWorld {
    /// Built schema
    pub schema: Arc<Schema>,
    /// Store holding the objects
    pub store: InMemoryStore,
    /// Backing files
    pub files: InMemoryFiles,
}

impl WorldFile {
    /// Parse JSON text
    ///
    /// # Errors
    /// Malformed JSON is bad input
    pub fn from_json_str(text: &str) -> Result<Self, GraphError> {
        serde_json::from_str(text).map_err(|e| GraphError::bad_input(format!("world: {e}")))
    }

    /// Read and parse a JSON file
    ///
    /// # Errors
    /// Unreadable files and malformed JSON are bad input
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GraphError::bad_input(format!("world {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    /// Build the schema and seed a store
    ///
    /// Objects are seeded as written, without integrity checks, so a world
    /// may be inconsistent on purpose.
    ///
    /// # Errors
    /// Schema errors, unknown class names and duplicate ids
    pub fn build(&self) -> Result<LoadedWorld, GraphError> {
        let schema = Arc::new(self.schema.build()?);
        let resolve = |name: &ObjectName| -> Result<ModelRef, GraphError> {
            Ok(ModelRef::new(schema.resolve(&name.class)?, name.id))
        };

        let mut store = InMemoryStore::new(schema.clone());
        for object in &self.objects {
            let subject = ModelRef::new(schema.resolve(&object.class)?, object.id);
            if store.objects().any(|o| o.subject.id == object.id) {
                return Err(GraphError::bad_input(format!("world: id {} used twice", object.id)));
            }
            let mut links = BTreeMap::new();
            for (property, value) in &object.links {
                let value = match value {
                    WorldLink::One(None) => LinkValue::One(None),
                    WorldLink::One(Some(target)) => LinkValue::One(Some(resolve(target)?)),
                    WorldLink::Many(items) => LinkValue::Many(items.iter().map(resolve).collect::<Result<_, _>>()?),
                };
                links.insert(property.clone(), value);
            }
            store.put(subject, object.details, object.simple.clone(), links);
        }

        let mut files = InMemoryFiles::new();
        for file in &self.files {
            files.add(resolve(file)?);
        }
        Ok(LoadedWorld { schema, store, files })
    }
}
