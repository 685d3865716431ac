//! Declarative schema descriptions
//!
//! [`ClassSpec`] and [`LinkSpec`] double as builder arguments and as the
//! serde shape of schema definition files, so a schema can be written by hand
//! in JSON or TOML and resolved through [`SchemaDefinition::build`].

use crate::link::Cardinality;
use crate::schema::{Schema, SchemaBuilder, SchemaError};
use serde::{Deserialize, Serialize};

/// Declaration of one class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSpec {
    /// Simple class name
    pub name: String,
    /// Superclass name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    /// Non-link properties introduced by this class
    #[serde(default)]
    pub simple: Vec<String>,
    /// Link properties introduced by this class
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl ClassSpec {
    /// Declare a root class with no properties
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            extends: None,
            simple: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Set the superclass
    #[must_use]
    pub fn extends(mut self, superclass: &str) -> Self {
        self.extends = Some(superclass.to_string());
        self
    }

    /// Add simple properties
    #[must_use]
    pub fn simple<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.simple.extend(properties.into_iter().map(Into::into));
        self
    }

    /// Add a link property
    #[must_use]
    pub fn link(mut self, link: LinkSpec) -> Self {
        self.links.push(link);
        self
    }
}

fn yes() -> bool {
    true
}

/// Declaration of one link property
///
/// Links default to nullable, unordered, non-containment and accessible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Property name
    pub name: String,
    /// Declared target class name
    pub target: String,
    /// To-one or to-many
    #[serde(default)]
    pub cardinality: Cardinality,
    /// Whether the link may be severed
    #[serde(default = "yes")]
    pub nullable: bool,
    /// Whether item order matters
    #[serde(default)]
    pub ordered: bool,
    /// Whether the target is owned by the referer
    #[serde(default)]
    pub containment: bool,
    /// Whether the property has a direct setter
    #[serde(default = "yes")]
    pub accessible: bool,
}

impl LinkSpec {
    /// Nullable to-one link
    #[must_use]
    pub fn to_one(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            cardinality: Cardinality::ToOne,
            nullable: true,
            ordered: false,
            containment: false,
            accessible: true,
        }
    }

    /// Unordered to-many link
    #[must_use]
    pub fn to_many(name: &str, target: &str) -> Self {
        Self {
            cardinality: Cardinality::ToMany,
            ..Self::to_one(name, target)
        }
    }

    /// Forbid severing this link
    #[must_use]
    pub fn non_nullable(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark item order as significant
    #[must_use]
    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    /// Mark referenced objects as owned by the referer
    #[must_use]
    pub fn containment(mut self) -> Self {
        self.containment = true;
        self
    }

    /// Remove the direct setter; items can only be appended
    #[must_use]
    pub fn append_only(mut self) -> Self {
        self.accessible = false;
        self
    }
}

/// Namespace declaration of a definition file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    /// Root namespaced class
    pub class: String,
    /// Simple property holding the namespace
    pub property: String,
}

/// A whole schema as written in a definition file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    /// Class declarations, superclasses in any order
    #[serde(default)]
    pub classes: Vec<ClassSpec>,
    /// Optional namespaced class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<NamespaceSpec>,
}

impl SchemaDefinition {
    /// Resolve the definition into a [`Schema`]
    ///
    /// # Errors
    /// Propagates any [`SchemaError`] raised by [`SchemaBuilder::build`]
    pub fn build(&self) -> Result<Schema, SchemaError> {
        let mut builder = SchemaBuilder::new();
        for class in &self.classes {
            builder = builder.class(class.clone());
        }
        if let Some(ns) = &self.namespace {
            builder = builder.namespaced(&ns.class, &ns.property);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_parsing_json() {
        let json = r#"{
            "classes": [
                { "name": "Dataset", "simple": ["name"] },
                { "name": "Image", "links": [
                    { "name": "dataset", "target": "Dataset", "nullable": false }
                ] }
            ]
        }"#;
        let definition: SchemaDefinition = serde_json::from_str(json).unwrap();
        let link = &definition.classes[1].links[0];
        assert_eq!(link.cardinality, Cardinality::ToOne);
        assert!(!link.nullable);
        assert!(link.accessible);
        assert!(!link.containment);

        let schema = definition.build().unwrap();
        assert_eq!(schema.len(), 2);
    }

    #[test]
    fn parses_toml_with_namespace() {
        let text = r#"
            [namespace]
            class = "Annotation"
            property = "ns"

            [[classes]]
            name = "Annotation"
            simple = ["ns"]

            [[classes]]
            name = "Image"

            [[classes.links]]
            name = "annotations"
            target = "Annotation"
            cardinality = "to_many"
            containment = true
        "#;
        let definition: SchemaDefinition = toml::from_str(text).unwrap();
        let schema = definition.build().unwrap();
        let image = schema.resolve("Image").unwrap();
        let link = schema.link(image, "annotations").unwrap();
        assert!(link.is_to_many());
        assert!(link.containment);
        assert_eq!(schema.namespace_property(schema.resolve("Annotation").unwrap()), Some("ns"));
    }
}
