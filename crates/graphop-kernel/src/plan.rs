//! The planner's output
//!
//! A [`Plan`] is built once per run and never changes afterwards.

use crate::error::ViolationReport;
use crate::types::{Action, OperationKind};
use graphop_schema::{ClassId, LinkId, ModelRef, Schema};
use indexmap::IndexMap;
use std::collections::{BTreeMap, BTreeSet};

/// Ids grouped by concrete class, in discovery order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassBatches {
    inner: IndexMap<ClassId, Vec<u64>>,
}

impl ClassBatches {
    /// Empty grouping
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an object to its class's list
    pub fn push(&mut self, subject: ModelRef) {
        self.inner.entry(subject.class).or_default().push(subject.id);
    }

    /// Classes with their ids
    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &[u64])> + '_ {
        self.inner.iter().map(|(class, ids)| (*class, ids.as_slice()))
    }

    /// Ids of one class
    #[must_use]
    pub fn ids(&self, class: ClassId) -> &[u64] {
        self.inner.get(&class).map_or(&[], Vec::as_slice)
    }

    /// Every object, class by class
    pub fn refs(&self) -> impl Iterator<Item = ModelRef> + '_ {
        self.inner
            .iter()
            .flat_map(|(class, ids)| ids.iter().map(|id| ModelRef::new(*class, *id)))
    }

    /// Whether the object is listed
    #[must_use]
    pub fn contains(&self, subject: ModelRef) -> bool {
        self.inner
            .get(&subject.class)
            .is_some_and(|ids| ids.contains(&subject.id))
    }

    /// Total number of objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.values().map(Vec::len).sum()
    }

    /// Whether nothing is listed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Sorted ids keyed by class name, for responses
    #[must_use]
    pub fn by_name(&self, schema: &Schema) -> BTreeMap<String, Vec<u64>> {
        let mut out: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (class, ids) in &self.inner {
            out.entry(schema.name(*class).to_string())
                .or_default()
                .extend(ids.iter().copied());
        }
        for ids in out.values_mut() {
            ids.sort_unstable();
        }
        out
    }
}

impl FromIterator<ModelRef> for ClassBatches {
    fn from_iter<T: IntoIterator<Item = ModelRef>>(iter: T) -> Self {
        let mut batches = Self::new();
        for subject in iter {
            batches.push(subject);
        }
        batches
    }
}

/// A reference the executor removes before processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeveredLink {
    /// Object holding the reference
    pub holder: ModelRef,
    /// Its verdict; links are unlinked per holder verdict
    pub holder_action: Action,
    /// Property holding the reference
    pub link: LinkId,
    /// Referenced object
    pub target: ModelRef,
}

/// Classified objects ready for execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Operation planned
    pub kind: OperationKind,
    /// Objects the traversal started from
    pub targets: Vec<ModelRef>,
    /// Included objects
    pub to_process: ClassBatches,
    /// Deleted objects
    pub to_delete: ClassBatches,
    /// References to null or filter first
    pub severed: Vec<SeveredLink>,
    /// `(referer, referee)` pairs among deleted objects linked non-nullably
    pub dependencies: Vec<(ModelRef, ModelRef)>,
    /// Missing abilities
    pub violations: ViolationReport,
    /// Processed objects exempt from permission checks
    pub unchecked: BTreeSet<ModelRef>,
    /// Review passes used
    pub passes: usize,
}

impl Plan {
    /// Plan that touches nothing
    #[must_use]
    pub fn empty(kind: OperationKind) -> Self {
        Self {
            kind,
            targets: Vec::new(),
            to_process: ClassBatches::new(),
            to_delete: ClassBatches::new(),
            severed: Vec::new(),
            dependencies: Vec::new(),
            violations: ViolationReport::default(),
            unchecked: BTreeSet::new(),
            passes: 0,
        }
    }

    /// Whether the actor lacks any ability
    #[inline]
    #[must_use]
    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    /// Processed plus deleted objects
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.to_process.len() + self.to_delete.len()
    }

    /// Deleted objects of any of `classes`
    #[must_use]
    pub fn deleted_of(&self, schema: &Schema, classes: &[ClassId]) -> Vec<ModelRef> {
        self.to_delete
            .refs()
            .filter(|s| classes.iter().any(|c| schema.is_a(s.class, *c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphop_schema::{ClassSpec, SchemaBuilder};

    #[test]
    fn batches_keep_discovery_order_and_sort_for_responses() {
        let schema = SchemaBuilder::new()
            .class(ClassSpec::new("Image"))
            .class(ClassSpec::new("Roi"))
            .build()
            .unwrap();
        let image = schema.resolve("Image").unwrap();
        let roi = schema.resolve("Roi").unwrap();

        let batches: ClassBatches = [
            ModelRef::new(roi, 9),
            ModelRef::new(image, 4),
            ModelRef::new(roi, 2),
        ]
        .into_iter()
        .collect();

        assert_eq!(batches.ids(roi), &[9, 2]);
        assert_eq!(batches.len(), 3);
        assert!(batches.contains(ModelRef::new(image, 4)));
        assert_eq!(batches.iter().next().map(|(c, _)| c), Some(roi));

        let named = batches.by_name(&schema);
        assert_eq!(named["Roi"], vec![2, 9]);
    }
}
