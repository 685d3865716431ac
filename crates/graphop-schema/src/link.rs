//! Link properties: named, directed, typed references between classes

use crate::class::ClassId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle to a link property of a [`Schema`](crate::Schema)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkId(pub(crate) u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// How many objects a link property may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// At most one referenced object
    #[default]
    ToOne,
    /// A collection of referenced objects
    ToMany,
}

/// A link property declared on a class
///
/// Subclasses inherit the links of their superclasses; `declared_on` always
/// names the class that introduced the property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkProperty {
    /// Handle of this property within its schema
    pub id: LinkId,
    /// Class declaring the property
    pub declared_on: ClassId,
    /// Property name, unique within the declaring class's hierarchy
    pub name: String,
    /// Declared class of referenced objects (instances may be subclasses)
    pub target: ClassId,
    /// To-one or to-many
    pub cardinality: Cardinality,
    /// Whether the reference may be severed by nulling or filtering
    pub nullable: bool,
    /// Whether item order is significant (to-many only)
    pub ordered: bool,
    /// Whether referenced objects are owned by the referer
    ///
    /// Objects reached through containment links become orphan candidates
    /// when their referer is processed.
    pub containment: bool,
    /// Whether the property has a direct setter
    ///
    /// Inaccessible to-many properties can only be extended item by item.
    pub accessible: bool,
}

impl LinkProperty {
    /// Whether the property holds a collection
    #[inline]
    #[must_use]
    pub fn is_to_many(&self) -> bool {
        self.cardinality == Cardinality::ToMany
    }

    /// Whether a duplicate holding this link must wait for its target's duplicate
    ///
    /// To-one references and ordered collections pin the referenced row at
    /// insert time; unordered collections can be filled in afterwards.
    #[inline]
    #[must_use]
    pub fn pins_target(&self) -> bool {
        !self.is_to_many() || self.ordered
    }
}
