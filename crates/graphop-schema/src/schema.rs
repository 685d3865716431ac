//! Immutable schema with a precomputed class hierarchy
//!
//! [`SchemaBuilder`] collects class declarations by name and resolves them
//! once into a [`Schema`]: every class gets a [`ClassId`], its reflexive
//! ancestor and descendant chains are computed up front, and inherited
//! properties are flattened so lookups never walk the hierarchy at runtime.

use crate::class::ClassId;
use crate::definition::{ClassSpec, LinkSpec};
use crate::link::{LinkId, LinkProperty};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Schema construction and lookup errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// Class name not registered
    #[error("unknown class: {0}")]
    UnknownClass(String),

    /// Class registered twice
    #[error("class already registered: {0}")]
    DuplicateClass(String),

    /// Superclass name not registered
    #[error("class {class} extends unknown class {superclass}")]
    UnknownSuperclass {
        /// Declaring class
        class: String,
        /// Missing superclass
        superclass: String,
    },

    /// Superclass chain loops back on itself
    #[error("superclass cycle through {0}")]
    SuperclassCycle(String),

    /// Property name reused within one hierarchy
    #[error("property {class}.{property} is already declared in its hierarchy")]
    DuplicateProperty {
        /// Declaring class
        class: String,
        /// Property name
        property: String,
    },

    /// Property not declared on the class or its ancestors
    #[error("unknown property {class}.{property}")]
    UnknownProperty {
        /// Class searched
        class: String,
        /// Property name
        property: String,
    },

    /// Ordered flag on a to-one link
    #[error("link {class}.{property} is to-one and cannot be ordered")]
    OrderedToOne {
        /// Declaring class
        class: String,
        /// Property name
        property: String,
    },

    /// Class registered under two specificities
    #[error("class {class} registered as both {first} and {second}")]
    ConflictingSpecificity {
        /// Class name
        class: String,
        /// First registration
        first: String,
        /// Second registration
        second: String,
    },

    /// More classes than a [`ClassId`] can address
    #[error("schema exceeds {max} classes")]
    TooManyClasses {
        /// Addressable maximum
        max: usize,
    },
}

#[derive(Debug, Clone)]
struct ClassEntry {
    name: String,
    superclass: Option<ClassId>,
    ancestors: Vec<ClassId>,
    descendants: Vec<ClassId>,
    simple: Vec<String>,
    linked_to: Vec<usize>,
    linked_by: Vec<usize>,
}

/// Resolved class hierarchy with flattened properties
#[derive(Debug, Clone)]
pub struct Schema {
    classes: Vec<ClassEntry>,
    by_name: HashMap<String, ClassId>,
    links: Vec<LinkProperty>,
    namespace: Option<(ClassId, String)>,
}

impl Schema {
    /// Start a new builder
    #[inline]
    #[must_use]
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Number of registered classes
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Whether the schema has no classes
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// All class handles in registration order
    pub fn classes(&self) -> impl Iterator<Item = ClassId> + '_ {
        (0..self.classes.len()).map(|i| ClassId(i as u16))
    }

    /// Look up a class by its simple name
    #[must_use]
    pub fn class_for_simple_name(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    /// Look up a class by name, failing on unknown names
    ///
    /// # Errors
    /// Returns [`SchemaError::UnknownClass`] if the name is not registered
    pub fn resolve(&self, name: &str) -> Result<ClassId, SchemaError> {
        self.class_for_simple_name(name)
            .ok_or_else(|| SchemaError::UnknownClass(name.to_string()))
    }

    /// Simple name of a class
    #[inline]
    #[must_use]
    pub fn name(&self, class: ClassId) -> &str {
        &self.entry(class).name
    }

    /// Direct superclass, if any
    #[inline]
    #[must_use]
    pub fn superclass(&self, class: ClassId) -> Option<ClassId> {
        self.entry(class).superclass
    }

    /// The class followed by its ancestors, most specific first
    #[inline]
    #[must_use]
    pub fn superclasses_of_reflexive(&self, class: ClassId) -> &[ClassId] {
        &self.entry(class).ancestors
    }

    /// The class followed by all its descendants
    #[inline]
    #[must_use]
    pub fn subclasses_of_reflexive(&self, class: ClassId) -> &[ClassId] {
        &self.entry(class).descendants
    }

    /// Whether `class` is `ancestor` or one of its subclasses
    #[inline]
    #[must_use]
    pub fn is_a(&self, class: ClassId, ancestor: ClassId) -> bool {
        self.entry(class).ancestors.contains(&ancestor)
    }

    /// Non-link properties, inherited ones included
    #[inline]
    #[must_use]
    pub fn simple_properties(&self, class: ClassId) -> &[String] {
        &self.entry(class).simple
    }

    /// Links held by instances of `class`, inherited ones included
    pub fn linked_to(&self, class: ClassId) -> impl Iterator<Item = &LinkProperty> + '_ {
        self.entry(class).linked_to.iter().map(|&i| &self.links[i])
    }

    /// Links that may reference instances of `class`
    pub fn linked_by(&self, class: ClassId) -> impl Iterator<Item = &LinkProperty> + '_ {
        self.entry(class).linked_by.iter().map(|&i| &self.links[i])
    }

    /// Link property by handle
    #[inline]
    #[must_use]
    pub fn link_by_id(&self, link: LinkId) -> &LinkProperty {
        &self.links[link.0 as usize]
    }

    /// Find a link property held by instances of `class`
    #[must_use]
    pub fn link(&self, class: ClassId, property: &str) -> Option<&LinkProperty> {
        self.linked_to(class).find(|link| link.name == property)
    }

    /// Whether `property` has a direct setter on `class`
    ///
    /// Simple properties are always accessible.
    #[must_use]
    pub fn is_property_accessible(&self, class: ClassId, property: &str) -> bool {
        match self.link(class, property) {
            Some(link) => link.accessible,
            None => self.entry(class).simple.iter().any(|p| p == property),
        }
    }

    /// Name of the property holding the namespace of instances of `class`
    #[must_use]
    pub fn namespace_property(&self, class: ClassId) -> Option<&str> {
        match &self.namespace {
            Some((root, property)) if self.is_a(class, *root) => Some(property.as_str()),
            _ => None,
        }
    }

    #[inline]
    fn entry(&self, class: ClassId) -> &ClassEntry {
        &self.classes[class.index()]
    }
}

/// Collects class declarations and resolves them into a [`Schema`]
///
/// # Example
///
/// ```
/// use graphop_schema::{ClassSpec, LinkSpec, SchemaBuilder};
///
/// let schema = SchemaBuilder::new()
///     .class(ClassSpec::new("Dataset").simple(["name"]))
///     .class(ClassSpec::new("Image").link(LinkSpec::to_one("dataset", "Dataset")))
///     .build()
///     .unwrap();
///
/// let image = schema.resolve("Image").unwrap();
/// assert_eq!(schema.linked_to(image).count(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    classes: IndexMap<String, ClassSpec>,
    duplicate: Option<String>,
    namespace: Option<(String, String)>,
}

impl SchemaBuilder {
    /// Create an empty builder
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class
    #[must_use]
    pub fn class(mut self, spec: ClassSpec) -> Self {
        if self.classes.contains_key(&spec.name) {
            self.duplicate.get_or_insert_with(|| spec.name.clone());
        } else {
            self.classes.insert(spec.name.clone(), spec);
        }
        self
    }

    /// Declare `class` and its subclasses namespaced by the simple `property`
    #[must_use]
    pub fn namespaced(mut self, class: &str, property: &str) -> Self {
        self.namespace = Some((class.to_string(), property.to_string()));
        self
    }

    /// Resolve all declarations
    ///
    /// # Errors
    /// Fails on duplicate or unknown classes, superclass cycles, properties
    /// redeclared within a hierarchy, or an unknown namespace property
    pub fn build(self) -> Result<Schema, SchemaError> {
        if let Some(name) = self.duplicate {
            return Err(SchemaError::DuplicateClass(name));
        }
        if self.classes.len() > usize::from(u16::MAX) {
            return Err(SchemaError::TooManyClasses {
                max: usize::from(u16::MAX),
            });
        }

        let by_name: HashMap<String, ClassId> = self
            .classes
            .keys()
            .enumerate()
            .map(|(i, name)| (name.clone(), ClassId(i as u16)))
            .collect();

        let mut superclasses = Vec::with_capacity(self.classes.len());
        for spec in self.classes.values() {
            let superclass = match &spec.extends {
                Some(parent) => Some(*by_name.get(parent).ok_or_else(|| {
                    SchemaError::UnknownSuperclass {
                        class: spec.name.clone(),
                        superclass: parent.clone(),
                    }
                })?),
                None => None,
            };
            superclasses.push(superclass);
        }

        let mut ancestors = Vec::with_capacity(self.classes.len());
        for (i, spec) in self.classes.values().enumerate() {
            let mut chain = vec![ClassId(i as u16)];
            let mut cursor = superclasses[i];
            while let Some(parent) = cursor {
                if chain.contains(&parent) {
                    return Err(SchemaError::SuperclassCycle(spec.name.clone()));
                }
                chain.push(parent);
                cursor = superclasses[parent.index()];
            }
            ancestors.push(chain);
        }

        let mut descendants = vec![Vec::new(); self.classes.len()];
        for (i, chain) in ancestors.iter().enumerate() {
            for ancestor in chain {
                descendants[ancestor.index()].push(ClassId(i as u16));
            }
        }

        let specs: Vec<&ClassSpec> = self.classes.values().collect();
        let mut links = Vec::new();
        let mut declared_links: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            for link in &spec.links {
                let id = LinkId(links.len() as u32);
                declared_links[i].push(links.len());
                links.push(resolve_link(&by_name, id, ClassId(i as u16), spec, link)?);
            }
        }

        let mut classes = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let chain = &ancestors[i];
            let mut simple: Vec<String> = Vec::new();
            let mut linked_to = Vec::new();
            // Root first so inherited properties precede the class's own.
            for ancestor in chain.iter().rev() {
                let declaring = specs[ancestor.index()];
                for property in &declaring.simple {
                    if simple.contains(property) {
                        return Err(SchemaError::DuplicateProperty {
                            class: spec.name.clone(),
                            property: property.clone(),
                        });
                    }
                    simple.push(property.clone());
                }
                for &link in &declared_links[ancestor.index()] {
                    let name = &links[link].name;
                    let clash = simple.contains(name)
                        || linked_to.iter().any(|&l: &usize| &links[l].name == name);
                    if clash {
                        return Err(SchemaError::DuplicateProperty {
                            class: spec.name.clone(),
                            property: name.clone(),
                        });
                    }
                    linked_to.push(link);
                }
            }
            let linked_by = links
                .iter()
                .enumerate()
                .filter(|(_, link)| chain.contains(&link.target))
                .map(|(index, _)| index)
                .collect();

            classes.push(ClassEntry {
                name: spec.name.clone(),
                superclass: superclasses[i],
                ancestors: chain.clone(),
                descendants: std::mem::take(&mut descendants[i]),
                simple,
                linked_to,
                linked_by,
            });
        }

        let namespace = match self.namespace {
            Some((class, property)) => {
                let id = *by_name
                    .get(&class)
                    .ok_or_else(|| SchemaError::UnknownClass(class.clone()))?;
                if !classes[id.index()].simple.contains(&property) {
                    return Err(SchemaError::UnknownProperty { class, property });
                }
                Some((id, property))
            }
            None => None,
        };

        Ok(Schema {
            classes,
            by_name,
            links,
            namespace,
        })
    }
}

fn resolve_link(
    by_name: &HashMap<String, ClassId>,
    id: LinkId,
    declared_on: ClassId,
    spec: &ClassSpec,
    link: &LinkSpec,
) -> Result<LinkProperty, SchemaError> {
    let target = *by_name
        .get(&link.target)
        .ok_or_else(|| SchemaError::UnknownClass(link.target.clone()))?;
    let property = LinkProperty {
        id,
        declared_on,
        name: link.name.clone(),
        target,
        cardinality: link.cardinality,
        nullable: link.nullable,
        ordered: link.ordered,
        containment: link.containment,
        accessible: link.accessible,
    };
    if property.ordered && !property.is_to_many() {
        return Err(SchemaError::OrderedToOne {
            class: spec.name.clone(),
            property: link.name.clone(),
        });
    }
    Ok(property)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotated() -> Schema {
        SchemaBuilder::new()
            .class(ClassSpec::new("Annotation").simple(["ns"]))
            .class(ClassSpec::new("TagAnnotation").extends("Annotation").simple(["text"]))
            .class(ClassSpec::new("Image").simple(["name"]))
            .class(
                ClassSpec::new("ImageAnnotationLink")
                    .link(LinkSpec::to_one("parent", "Image").non_nullable())
                    .link(LinkSpec::to_one("child", "Annotation").non_nullable().containment()),
            )
            .namespaced("Annotation", "ns")
            .build()
            .unwrap()
    }

    #[test]
    fn ancestors_are_reflexive_and_most_specific_first() {
        let schema = annotated();
        let tag = schema.resolve("TagAnnotation").unwrap();
        let annotation = schema.resolve("Annotation").unwrap();

        assert_eq!(schema.superclasses_of_reflexive(tag), &[tag, annotation]);
        assert_eq!(schema.subclasses_of_reflexive(annotation), &[annotation, tag]);
        assert!(schema.is_a(tag, annotation));
        assert!(!schema.is_a(annotation, tag));
    }

    #[test]
    fn simple_properties_are_inherited() {
        let schema = annotated();
        let tag = schema.resolve("TagAnnotation").unwrap();
        assert_eq!(schema.simple_properties(tag), &["ns".to_string(), "text".to_string()]);
        assert_eq!(schema.namespace_property(tag), Some("ns"));
        assert_eq!(schema.namespace_property(schema.resolve("Image").unwrap()), None);
    }

    #[test]
    fn linked_by_includes_links_to_ancestors() {
        let schema = annotated();
        let tag = schema.resolve("TagAnnotation").unwrap();
        let names: Vec<_> = schema.linked_by(tag).map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["child"]);
    }

    #[test]
    fn rejects_superclass_cycle() {
        let err = SchemaBuilder::new()
            .class(ClassSpec::new("A").extends("B"))
            .class(ClassSpec::new("B").extends("A"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::SuperclassCycle(_)));
    }

    #[test]
    fn rejects_redeclared_property() {
        let err = SchemaBuilder::new()
            .class(ClassSpec::new("A").simple(["name"]))
            .class(ClassSpec::new("B").extends("A").simple(["name"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateProperty { .. }));
    }

    #[test]
    fn rejects_duplicate_class() {
        let err = SchemaBuilder::new()
            .class(ClassSpec::new("A"))
            .class(ClassSpec::new("A"))
            .build()
            .unwrap_err();
        assert_eq!(err, SchemaError::DuplicateClass("A".into()));
    }

    #[test]
    fn rejects_ordered_to_one() {
        let err = SchemaBuilder::new()
            .class(ClassSpec::new("A").link(LinkSpec::to_one("b", "A").ordered()))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::OrderedToOne { .. }));
    }

    #[test]
    fn link_accessibility() {
        let schema = SchemaBuilder::new()
            .class(ClassSpec::new("Roi").simple(["name"]))
            .class(ClassSpec::new("Image").link(LinkSpec::to_many("rois", "Roi").append_only()))
            .build()
            .unwrap();
        let image = schema.resolve("Image").unwrap();
        let roi = schema.resolve("Roi").unwrap();
        assert!(!schema.is_property_accessible(image, "rois"));
        assert!(schema.is_property_accessible(roi, "name"));
        assert!(!schema.is_property_accessible(roi, "missing"));
    }
}
