//! Most-specific-ancestor classification of classes
//!
//! Callers register classes under a [`Specificity`]. Every class of the
//! schema is then classified by the registration on the nearest class of its
//! reflexive superclass chain. The table is computed once at construction, so
//! classification is a single index lookup.

use crate::class::ClassId;
use crate::schema::{Schema, SchemaError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// How the duplication engine treats objects of a class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Specificity {
    /// Objects are cloned
    Duplicate,
    /// Duplicates keep referring to the original object
    Reference,
    /// Links to these objects are dropped from duplicates
    Ignore,
}

impl fmt::Display for Specificity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Specificity::Duplicate => "duplicate",
            Specificity::Reference => "reference",
            Specificity::Ignore => "ignore",
        };
        f.write_str(label)
    }
}

/// Classification of every class of a schema
#[derive(Debug, Clone)]
pub struct SpecificityClassifier {
    table: Vec<Specificity>,
    explicit: Vec<bool>,
}

impl SpecificityClassifier {
    /// Build the table from name registrations
    ///
    /// Classes with no registered ancestor classify as [`Specificity::Reference`].
    ///
    /// # Errors
    /// Fails on unknown class names or a class registered under two
    /// specificities
    pub fn new<'a, I>(schema: &Schema, registrations: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = (&'a str, Specificity)>,
    {
        let mut registered: HashMap<ClassId, Specificity> = HashMap::new();
        for (name, specificity) in registrations {
            let class = schema.resolve(name)?;
            match registered.get(&class) {
                Some(previous) if *previous != specificity => {
                    return Err(SchemaError::ConflictingSpecificity {
                        class: name.to_string(),
                        first: previous.to_string(),
                        second: specificity.to_string(),
                    });
                }
                _ => {
                    registered.insert(class, specificity);
                }
            }
        }

        let mut table = Vec::with_capacity(schema.len());
        let mut explicit = Vec::with_capacity(schema.len());
        for class in schema.classes() {
            let nearest = schema
                .superclasses_of_reflexive(class)
                .iter()
                .find_map(|ancestor| registered.get(ancestor).copied());
            explicit.push(nearest.is_some());
            table.push(nearest.unwrap_or(Specificity::Reference));
        }
        Ok(Self { table, explicit })
    }

    /// Classification of `class`
    #[inline]
    #[must_use]
    pub fn classify(&self, class: ClassId) -> Specificity {
        self.table[class.index()]
    }

    /// Whether the classification of `class` comes from a registration
    /// rather than the default
    #[inline]
    #[must_use]
    pub fn is_registered(&self, class: ClassId) -> bool {
        self.explicit[class.index()]
    }

    /// Classes with the given classification
    pub fn classes_with(&self, specificity: Specificity) -> impl Iterator<Item = ClassId> + '_ {
        self.table
            .iter()
            .enumerate()
            .filter(move |(_, s)| **s == specificity)
            .map(|(i, _)| ClassId(i as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClassSpec, SchemaBuilder};

    fn schema() -> Schema {
        SchemaBuilder::new()
            .class(ClassSpec::new("Annotation"))
            .class(ClassSpec::new("TextAnnotation").extends("Annotation"))
            .class(ClassSpec::new("TagAnnotation").extends("TextAnnotation"))
            .class(ClassSpec::new("FileAnnotation").extends("Annotation"))
            .class(ClassSpec::new("Image"))
            .build()
            .unwrap()
    }

    #[test]
    fn most_specific_registration_wins() {
        let schema = schema();
        let classifier = SpecificityClassifier::new(
            &schema,
            [
                ("Annotation", Specificity::Duplicate),
                ("TextAnnotation", Specificity::Ignore),
            ],
        )
        .unwrap();

        let class = |name| schema.resolve(name).unwrap();
        assert_eq!(classifier.classify(class("Annotation")), Specificity::Duplicate);
        assert_eq!(classifier.classify(class("TextAnnotation")), Specificity::Ignore);
        assert_eq!(classifier.classify(class("TagAnnotation")), Specificity::Ignore);
        assert_eq!(classifier.classify(class("FileAnnotation")), Specificity::Duplicate);
    }

    #[test]
    fn unregistered_classes_are_referenced() {
        let schema = schema();
        let classifier =
            SpecificityClassifier::new(&schema, [("Annotation", Specificity::Duplicate)]).unwrap();
        let image = schema.resolve("Image").unwrap();
        assert_eq!(classifier.classify(image), Specificity::Reference);
        assert!(!classifier.is_registered(image));
    }

    #[test]
    fn conflicting_registration_is_rejected() {
        let schema = schema();
        let err = SpecificityClassifier::new(
            &schema,
            [("Image", Specificity::Duplicate), ("Image", Specificity::Ignore)],
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::ConflictingSpecificity { .. }));
    }

    #[test]
    fn unknown_class_is_rejected() {
        let schema = schema();
        let err = SpecificityClassifier::new(&schema, [("Nope", Specificity::Ignore)]).unwrap_err();
        assert_eq!(err, SchemaError::UnknownClass("Nope".into()));
    }
}
