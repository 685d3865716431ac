//! Subgraph duplication
//!
//! Duplicates live in an arena addressed by [`DupHandle`]. Each records the
//! link updates it needs and the duplicates it is blocked by; persistence
//! runs over a worklist that only releases duplicates whose blockers are
//! already persisted. The full order is computed before the first insert, so
//! a cycle fails the run with nothing written.

use crate::error::{GraphError, Inconsistency};
use crate::plan::Plan;
use crate::store::{LinkValue, NewObject, ObjectDetails, ObjectStore, StoreError};
use crate::types::Actor;
use graphop_schema::{LinkProperty, ModelRef, Schema, Specificity, SpecificityClassifier};
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeSet;
use tracing::debug;

/// Handle of a duplicate within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DupHandle(usize);

/// One item of a link value, before or after substitution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Item {
    Original(ModelRef),
    Duplicate(DupHandle),
}

/// When a link update is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timing {
    /// With the insert; to-one links and ordered collections
    Insert,
    /// Once every duplicate exists; unordered collections
    Afterwards,
    /// Item by item through the append accessor
    Replay,
}

#[derive(Debug, Clone)]
struct LinkUpdate {
    property: String,
    to_many: bool,
    timing: Timing,
    items: Vec<Item>,
}

#[derive(Debug)]
struct DupNode {
    original: ModelRef,
    object: NewObject,
    updates: Vec<LinkUpdate>,
    blocked_by: BTreeSet<DupHandle>,
    persisted: Option<ModelRef>,
}

/// Outcome of a duplication run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicationSummary {
    /// Original to persisted duplicate, in persist order
    pub mapping: IndexMap<ModelRef, ModelRef>,
    /// Non-duplicated objects that gained a link to a duplicate
    pub back_linked: usize,
}

/// Clones the objects of a duplicate plan
#[derive(Debug)]
pub struct Duplicator<'a> {
    schema: &'a Schema,
    classifier: SpecificityClassifier,
    actor: Actor,
    batch_size: usize,
    nodes: Vec<DupNode>,
    index: IndexMap<ModelRef, DupHandle>,
    order: Vec<DupHandle>,
}

impl<'a> Duplicator<'a> {
    /// Duplicator writing duplicates owned by `actor`
    #[must_use]
    pub fn new(
        schema: &'a Schema,
        classifier: SpecificityClassifier,
        actor: Actor,
        batch_size: usize,
    ) -> Self {
        Self {
            schema,
            classifier,
            actor,
            batch_size,
            nodes: Vec::new(),
            index: IndexMap::new(),
            order: Vec::new(),
        }
    }

    /// Number of duplicates in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing is duplicated
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Originals in the order their duplicates will be persisted
    #[must_use]
    pub fn persist_order(&self) -> Vec<ModelRef> {
        self.order.iter().map(|h| self.nodes[h.0].original).collect()
    }

    /// Originals a duplicate has to wait for
    #[must_use]
    pub fn blockers_of(&self, original: ModelRef) -> Vec<ModelRef> {
        self.index
            .get(&original)
            .map(|h| {
                self.nodes[h.0]
                    .blocked_by
                    .iter()
                    .map(|b| self.nodes[b.0].original)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Create one transient duplicate per processed object of the plan and
    /// record the link updates each will need
    ///
    /// # Errors
    /// Store failures, and [`Inconsistency::IgnoredNonNullable`] when a
    /// duplicate would have to drop a mandatory link
    pub fn prepare(&mut self, store: &dyn ObjectStore, plan: &Plan) -> Result<(), GraphError> {
        let mut sources = Vec::new();
        for (class, ids) in plan.to_process.iter() {
            for chunk in ids.chunks(self.batch_size) {
                for stored in store.load(class, chunk)? {
                    let handle = DupHandle(self.nodes.len());
                    self.index.insert(stored.subject, handle);
                    // serde_json values are owned trees, so collections are copied deeply
                    let mut object = NewObject::new(
                        stored.subject.class,
                        ObjectDetails {
                            owner: self.actor.user,
                            group: self.actor.group,
                            permissions: stored.details.permissions,
                        },
                    );
                    object.simple = stored.simple.clone();
                    self.nodes.push(DupNode {
                        original: stored.subject,
                        object,
                        updates: Vec::new(),
                        blocked_by: BTreeSet::new(),
                        persisted: None,
                    });
                    sources.push(stored);
                }
            }
        }

        let schema = self.schema;
        for (position, stored) in sources.iter().enumerate() {
            let handle = DupHandle(position);
            for (property, value) in &stored.links {
                let link = schema.link(stored.subject.class, property).ok_or_else(|| {
                    StoreError::UnknownProperty {
                        class: stored.subject.class,
                        property: property.clone(),
                    }
                })?;
                self.record_link_update(handle, link, value)?;
            }
        }
        self.order = self.schedule()?;
        debug!(duplicates = self.nodes.len(), "duplicates prepared");
        Ok(())
    }

    fn record_link_update(
        &mut self,
        handle: DupHandle,
        link: &LinkProperty,
        value: &LinkValue,
    ) -> Result<(), GraphError> {
        let holder = self.nodes[handle.0].original;
        let mut items = Vec::new();
        for target in value.targets() {
            if let Some(dup) = self.index.get(&target) {
                items.push(Item::Duplicate(*dup));
                continue;
            }
            if self.classifier.classify(target.class) == Specificity::Ignore {
                if !link.nullable && !link.is_to_many() {
                    return Err(Inconsistency::IgnoredNonNullable {
                        holder,
                        property: link.name.clone(),
                        target,
                    }
                    .into());
                }
                continue;
            }
            items.push(Item::Original(target));
        }

        let timing = if !link.accessible {
            Timing::Replay
        } else if link.pins_target() {
            Timing::Insert
        } else {
            Timing::Afterwards
        };
        // Only values written with the insert need their duplicates first;
        // replayed items are appended once every duplicate exists
        if timing == Timing::Insert {
            let node = &mut self.nodes[handle.0];
            for item in &items {
                if let Item::Duplicate(blocker) = item {
                    node.blocked_by.insert(*blocker);
                }
            }
        }
        self.nodes[handle.0].updates.push(LinkUpdate {
            property: link.name.clone(),
            to_many: link.is_to_many(),
            timing,
            items,
        });
        Ok(())
    }

    /// Persist order honoring every blocked-by edge
    fn schedule(&self) -> Result<Vec<DupHandle>, GraphError> {
        let mut remaining: IndexSet<DupHandle> = (0..self.nodes.len()).map(DupHandle).collect();
        let mut order = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let ready: Vec<DupHandle> = remaining
                .iter()
                .copied()
                .filter(|h| self.nodes[h.0].blocked_by.iter().all(|b| !remaining.contains(b)))
                .collect();
            if ready.is_empty() {
                let members = remaining.iter().map(|h| self.nodes[h.0].original).collect();
                return Err(Inconsistency::CyclicDuplication { members }.into());
            }
            for handle in ready {
                remaining.shift_remove(&handle);
                order.push(handle);
            }
        }
        Ok(order)
    }

    fn substitute(&self, items: &[Item]) -> Vec<ModelRef> {
        items
            .iter()
            .map(|item| match item {
                Item::Original(original) => *original,
                Item::Duplicate(handle) => {
                    let node = &self.nodes[handle.0];
                    node.persisted.unwrap_or(node.original)
                }
            })
            .collect()
    }

    fn value_of(&self, update: &LinkUpdate) -> LinkValue {
        let items = self.substitute(&update.items);
        if update.to_many {
            LinkValue::Many(items)
        } else {
            LinkValue::One(items.first().copied())
        }
    }

    /// Insert every duplicate, wire the remaining links and extend
    /// collections of non-duplicated linkers
    ///
    /// # Errors
    /// Store failures; writes made before the failure stay applied
    pub fn persist(&mut self, store: &mut dyn ObjectStore) -> Result<DuplicationSummary, GraphError> {
        let mut summary = DuplicationSummary::default();
        for handle in self.order.clone() {
            let mut object = self.nodes[handle.0].object.clone();
            for update in &self.nodes[handle.0].updates {
                if update.timing == Timing::Insert {
                    object.links.insert(update.property.clone(), self.value_of(update));
                }
            }
            let created = store.insert(object)?;
            let node = &mut self.nodes[handle.0];
            node.persisted = Some(created);
            summary.mapping.insert(node.original, created);
            debug!(original = %node.original, duplicate = %created, "duplicate persisted");
        }

        for node in &self.nodes {
            let Some(created) = node.persisted else {
                continue;
            };
            for update in &node.updates {
                match update.timing {
                    Timing::Insert => {}
                    Timing::Afterwards => store.set_link(created, &update.property, self.value_of(update))?,
                    Timing::Replay => {
                        let items = self.substitute(&update.items);
                        if !items.is_empty() {
                            store.append_links(created, &update.property, &items)?;
                        }
                    }
                }
            }
        }

        summary.back_linked = self.back_link(store, &summary.mapping)?;
        Ok(summary)
    }

    /// Add duplicates to the collections that hold their originals
    fn back_link(
        &self,
        store: &mut dyn ObjectStore,
        mapping: &IndexMap<ModelRef, ModelRef>,
    ) -> Result<usize, GraphError> {
        let mut by_class: IndexMap<_, Vec<ModelRef>> = IndexMap::new();
        for original in mapping.keys() {
            by_class.entry(original.class).or_default().push(*original);
        }

        let mut appends: IndexMap<(ModelRef, String), Vec<ModelRef>> = IndexMap::new();
        for (class, originals) in by_class {
            for link in self.schema.linked_by(class).filter(|l| l.is_to_many()) {
                for chunk in originals.chunks(self.batch_size) {
                    for (referer, target) in store.backward_links(link.declared_on, &link.name, chunk)? {
                        if self.index.contains_key(&referer) {
                            continue;
                        }
                        if let Some(duplicate) = mapping.get(&target) {
                            appends
                                .entry((referer, link.name.clone()))
                                .or_default()
                                .push(*duplicate);
                        }
                    }
                }
            }
        }

        let mut linked = BTreeSet::new();
        for ((referer, property), items) in appends {
            store.append_links(referer, &property, &items)?;
            linked.insert(referer);
        }
        Ok(linked.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ClassBatches;
    use crate::test_harness::memory::InMemoryStore;
    use crate::types::OperationKind;
    use graphop_schema::{ClassSpec, LinkSpec, SchemaBuilder};
    use serde_json::json;
    use std::sync::Arc;

    fn schema() -> Arc<Schema> {
        Arc::new(
            SchemaBuilder::new()
                .class(
                    ClassSpec::new("Node")
                        .simple(["name", "tags"])
                        .link(LinkSpec::to_one("peer", "Node"))
                        .link(LinkSpec::to_one("journal", "Log")),
                )
                .class(ClassSpec::new("Leaf").simple(["name"]).link(LinkSpec::to_one("owner", "Node").non_nullable()))
                .class(ClassSpec::new("Ignored"))
                .class(ClassSpec::new("Holder").link(LinkSpec::to_one("ignored", "Ignored").non_nullable()))
                .class(ClassSpec::new("Folder").link(LinkSpec::to_many("nodes", "Node")))
                .class(ClassSpec::new("Log").link(LinkSpec::to_many("entries", "Node").ordered().append_only()))
                .build()
                .unwrap(),
        )
    }

    fn classifier(schema: &Schema) -> SpecificityClassifier {
        SpecificityClassifier::new(
            schema,
            [
                ("Node", Specificity::Duplicate),
                ("Leaf", Specificity::Duplicate),
                ("Holder", Specificity::Duplicate),
                ("Log", Specificity::Duplicate),
                ("Ignored", Specificity::Ignore),
            ],
        )
        .unwrap()
    }

    fn plan_of(subjects: &[ModelRef]) -> Plan {
        let mut plan = Plan::empty(OperationKind::Duplicate);
        plan.to_process = subjects.iter().copied().collect::<ClassBatches>();
        plan
    }

    fn object(schema: &Schema, class: &str) -> NewObject {
        NewObject::new(schema.resolve(class).unwrap(), ObjectDetails::default())
    }

    #[test]
    fn simple_properties_round_trip() {
        let schema = schema();
        let mut store = InMemoryStore::new(schema.clone());
        let mut node = object(&schema, "Node");
        node.simple.insert("name".into(), json!("a"));
        node.simple.insert("tags".into(), json!(["x", "y"]));
        let original = store.seed(node);

        let classifier = classifier(&schema);
        let actor = Actor::user(7, 3);
        let mut dup = Duplicator::new(&schema, classifier, actor, 16);
        dup.prepare(&store, &plan_of(&[original])).unwrap();
        let summary = dup.persist(&mut store).unwrap();

        let copy = summary.mapping[&original];
        assert_ne!(copy, original);
        let loaded = store.get(copy).unwrap();
        assert_eq!(loaded.simple, store.get(original).unwrap().simple);
        assert_eq!(loaded.details.owner, 7);
    }

    #[test]
    fn blockers_are_persisted_first() {
        let schema = schema();
        let mut store = InMemoryStore::new(schema.clone());
        let node = store.seed(object(&schema, "Node"));
        let mut leaf = object(&schema, "Leaf");
        leaf.links.insert("owner".into(), LinkValue::One(Some(node)));
        let leaf = store.seed(leaf);

        let classifier = classifier(&schema);
        let actor = Actor::user(1, 1);
        let mut dup = Duplicator::new(&schema, classifier, actor, 16);
        dup.prepare(&store, &plan_of(&[leaf, node])).unwrap();
        assert_eq!(dup.blockers_of(leaf), vec![node]);
        assert_eq!(dup.persist_order(), vec![node, leaf]);

        let summary = dup.persist(&mut store).unwrap();
        let leaf_copy = store.get(summary.mapping[&leaf]).unwrap();
        assert_eq!(leaf_copy.links["owner"], LinkValue::One(Some(summary.mapping[&node])));
    }

    #[test]
    fn two_cycles_persist_nothing() {
        let schema = schema();
        let mut store = InMemoryStore::new(schema.clone());
        let a = store.seed(object(&schema, "Node"));
        let b = store.seed(object(&schema, "Node"));
        store.set_link(a, "peer", LinkValue::One(Some(b))).unwrap();
        store.set_link(b, "peer", LinkValue::One(Some(a))).unwrap();
        let before = store.len();

        let classifier = classifier(&schema);
        let actor = Actor::user(1, 1);
        let mut dup = Duplicator::new(&schema, classifier, actor, 16);
        let err = dup.prepare(&store, &plan_of(&[a, b])).unwrap_err();
        assert!(matches!(err, GraphError::Inconsistency(Inconsistency::CyclicDuplication { ref members }) if members.len() == 2));
        assert_eq!(store.len(), before);
    }

    #[test]
    fn mandatory_links_to_ignored_objects_are_inconsistent() {
        let schema = schema();
        let mut store = InMemoryStore::new(schema.clone());
        let ignored = store.seed(object(&schema, "Ignored"));
        let mut holder = object(&schema, "Holder");
        holder.links.insert("ignored".into(), LinkValue::One(Some(ignored)));
        let holder = store.seed(holder);

        let classifier = classifier(&schema);
        let actor = Actor::user(1, 1);
        let mut dup = Duplicator::new(&schema, classifier, actor, 16);
        let err = dup.prepare(&store, &plan_of(&[holder])).unwrap_err();
        assert!(matches!(err, GraphError::Inconsistency(Inconsistency::IgnoredNonNullable { .. })));
    }

    #[test]
    fn linkers_and_replayed_collections_see_duplicates() {
        let schema = schema();
        let mut store = InMemoryStore::new(schema.clone());
        let a = store.seed(object(&schema, "Node"));
        let shared = store.seed(object(&schema, "Node"));
        let mut folder = object(&schema, "Folder");
        folder.links.insert("nodes".into(), LinkValue::Many(vec![a]));
        let folder = store.seed(folder);
        let mut log = object(&schema, "Log");
        log.links.insert("entries".into(), LinkValue::Many(vec![shared, a]));
        let log = store.seed(log);

        let classifier = classifier(&schema);
        let actor = Actor::user(1, 1);
        let mut dup = Duplicator::new(&schema, classifier, actor, 16);
        dup.prepare(&store, &plan_of(&[a, log])).unwrap();
        let summary = dup.persist(&mut store).unwrap();

        let a_copy = summary.mapping[&a];
        assert_eq!(store.get(folder).unwrap().links["nodes"], LinkValue::Many(vec![a, a_copy]));
        let log_copy = store.get(summary.mapping[&log]).unwrap();
        assert_eq!(log_copy.links["entries"], LinkValue::Many(vec![shared, a_copy]));
        assert_eq!(summary.back_linked, 1);
    }

    #[test]
    fn replayed_collections_do_not_block() {
        let schema = schema();
        let mut store = InMemoryStore::new(schema.clone());
        let a = store.seed(object(&schema, "Node"));
        let mut log = object(&schema, "Log");
        log.links.insert("entries".into(), LinkValue::Many(vec![a]));
        let log = store.seed(log);
        store.set_link(a, "journal", LinkValue::One(Some(log))).unwrap();

        let classifier = classifier(&schema);
        let actor = Actor::user(1, 1);
        let mut dup = Duplicator::new(&schema, classifier, actor, 16);
        dup.prepare(&store, &plan_of(&[a, log])).unwrap();
        assert!(dup.blockers_of(log).is_empty());
        assert_eq!(dup.blockers_of(a), vec![log]);
        assert_eq!(dup.persist_order(), vec![log, a]);

        let summary = dup.persist(&mut store).unwrap();
        let (a_copy, log_copy) = (summary.mapping[&a], summary.mapping[&log]);
        assert_eq!(store.get(log_copy).unwrap().links["entries"], LinkValue::Many(vec![a_copy]));
        assert_eq!(store.get(a_copy).unwrap().links["journal"], LinkValue::One(Some(log_copy)));
    }
}
