//! Policy adjusters
//!
//! Each adjuster is a pure rewrite of one node's [`Details`]; the chain folds
//! the proposal in, keeping terminal orphan statuses and refusing to loosen
//! actions.

use super::ReviewContext;
use crate::error::GraphError;
use crate::types::{Action, Details, Orphan};
use graphop_schema::{ClassId, ModelRef, Schema};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One layer of a [`PolicyChain`](super::PolicyChain)
pub trait PolicyAdjuster: std::fmt::Debug {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Whether the focus must not be reviewed at all
    fn halts_review(&mut self, _focus: &Details, _ctx: &ReviewContext<'_>) -> bool {
        false
    }

    /// Proposed replacement before the baseline rules run
    fn adjust_before_review(&mut self, _node: &Details, _ctx: &ReviewContext<'_>) -> Option<Details> {
        None
    }

    /// Proposed replacement after the baseline rules ran
    fn adjust_after_review(&mut self, _node: &Details, _ctx: &ReviewContext<'_>) -> Option<Details> {
        None
    }

    /// Whether proposals may loosen an action
    fn overrides_action(&self) -> bool {
        false
    }

    /// Fresh copy for another run
    ///
    /// # Errors
    /// [`GraphError::IllegalState`] for single-use adjusters
    fn clean_instance(&self) -> Result<Box<dyn PolicyAdjuster>, GraphError>;
}

fn is_any(schema: &Schema, class: ClassId, types: &[ClassId]) -> bool {
    types.iter().any(|t| schema.is_a(class, *t))
}

fn class_matches(schema: &Schema, class: ClassId, types: &[ClassId], exact: bool) -> bool {
    if exact {
        types.contains(&class)
    } else {
        is_any(schema, class, types)
    }
}

fn resolve_all(schema: &Schema, names: &[String]) -> Result<Vec<ClassId>, GraphError> {
    names
        .iter()
        .map(|name| schema.resolve(name).map_err(GraphError::from))
        .collect()
}

/// Caller override of which contained children go with their parents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildOption {
    /// Types whose instances go with their parent
    #[serde(default)]
    pub include_types: Vec<String>,
    /// Types whose instances stay behind
    #[serde(default)]
    pub exclude_types: Vec<String>,
    /// Only namespaced children in these namespaces match
    #[serde(default)]
    pub include_ns: Vec<String>,
    /// Namespaced children in these namespaces never match
    #[serde(default)]
    pub exclude_ns: Vec<String>,
}

impl ChildOption {
    /// Include instances of `class` with their parents
    #[must_use]
    pub fn include(class: &str) -> Self {
        Self {
            include_types: vec![class.to_string()],
            ..Self::default()
        }
    }

    /// Leave instances of `class` behind
    #[must_use]
    pub fn exclude(class: &str) -> Self {
        Self {
            exclude_types: vec![class.to_string()],
            ..Self::default()
        }
    }

    /// Restrict matches to namespaces
    #[must_use]
    pub fn in_namespaces<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ns: I) -> Self {
        self.include_ns.extend(ns.into_iter().map(Into::into));
        self
    }

    /// Exclude namespaces from matching
    #[must_use]
    pub fn not_in_namespaces<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ns: I) -> Self {
        self.exclude_ns.extend(ns.into_iter().map(Into::into));
        self
    }

    /// Resolve type names
    ///
    /// # Errors
    /// Unknown classes, no types at all, or a type or namespace on both sides
    pub fn resolve(&self, schema: &Schema) -> Result<ResolvedChildOption, GraphError> {
        if self.include_types.is_empty() && self.exclude_types.is_empty() {
            return Err(GraphError::bad_input("child option names no types"));
        }
        let include = resolve_all(schema, &self.include_types)?;
        let exclude = resolve_all(schema, &self.exclude_types)?;
        if let Some(both) = include.iter().find(|c| exclude.contains(c)) {
            return Err(GraphError::bad_input(format!(
                "child option both includes and excludes {}",
                schema.name(*both)
            )));
        }
        let include_ns: BTreeSet<String> = self.include_ns.iter().cloned().collect();
        let exclude_ns: BTreeSet<String> = self.exclude_ns.iter().cloned().collect();
        if let Some(both) = include_ns.intersection(&exclude_ns).next() {
            return Err(GraphError::bad_input(format!(
                "child option both includes and excludes namespace {both}"
            )));
        }
        Ok(ResolvedChildOption {
            include,
            exclude,
            include_ns,
            exclude_ns,
        })
    }
}

/// [`ChildOption`] with resolved classes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChildOption {
    include: Vec<ClassId>,
    exclude: Vec<ClassId>,
    include_ns: BTreeSet<String>,
    exclude_ns: BTreeSet<String>,
}

impl ResolvedChildOption {
    /// `Some(true)` to include, `Some(false)` to exclude, `None` if the option
    /// does not speak about this node
    #[must_use]
    pub fn decide(&self, schema: &Schema, node: &Details) -> Option<bool> {
        let class = node.subject.class;
        let in_scope = self.namespace_matches(schema, class, node.namespace.as_deref());
        if is_any(schema, class, &self.include) {
            Some(in_scope)
        } else if is_any(schema, class, &self.exclude) && in_scope {
            Some(false)
        } else {
            None
        }
    }

    fn namespace_matches(&self, schema: &Schema, class: ClassId, ns: Option<&str>) -> bool {
        if schema.namespace_property(class).is_none() {
            return true;
        }
        let included = self.include_ns.is_empty() || ns.is_some_and(|n| self.include_ns.contains(n));
        let excluded = ns.is_some_and(|n| self.exclude_ns.contains(n));
        included && !excluded
    }
}

/// Decides contained children by type and namespace
///
/// A child the option would include is left behind anyway when the actor
/// lacks the abilities to process it.
#[derive(Debug, Clone, Default)]
pub struct ChildOptionsPolicy {
    options: Vec<ResolvedChildOption>,
}

impl ChildOptionsPolicy {
    /// Adjuster over resolved options, first match wins
    #[must_use]
    pub fn new(options: Vec<ResolvedChildOption>) -> Self {
        Self { options }
    }

    /// Whether no option was given
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

impl PolicyAdjuster for ChildOptionsPolicy {
    fn name(&self) -> &'static str {
        "child-options"
    }

    fn adjust_before_review(&mut self, node: &Details, ctx: &ReviewContext<'_>) -> Option<Details> {
        if !node.is_undecided_orphan() {
            return None;
        }
        let include = self.options.iter().find_map(|o| o.decide(ctx.schema, node))?;
        let mut next = node.clone();
        let hypothetical = Details {
            action: ctx.kind.start_action(),
            ..node.clone()
        };
        next.orphan = if include && ctx.may_process(&hypothetical) {
            Orphan::IsLast
        } else {
            Orphan::IsNotLast
        };
        Some(next)
    }

    fn clean_instance(&self) -> Result<Box<dyn PolicyAdjuster>, GraphError> {
        Ok(Box::new(self.clone()))
    }
}

/// Fixes orphan status by type alone
#[derive(Debug, Clone, Default)]
pub struct OrphanOverride {
    last: Vec<ClassId>,
    not_last: Vec<ClassId>,
    all_last: bool,
}

impl OrphanOverride {
    /// Override with no types
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every contained child goes with its parent
    #[must_use]
    pub fn all_last() -> Self {
        Self {
            all_last: true,
            ..Self::default()
        }
    }

    /// Instances of `class` are always the last
    #[must_use]
    pub fn last(mut self, class: ClassId) -> Self {
        self.last.push(class);
        self
    }

    /// Instances of `class` are never the last
    #[must_use]
    pub fn not_last(mut self, class: ClassId) -> Self {
        self.not_last.push(class);
        self
    }
}

impl PolicyAdjuster for OrphanOverride {
    fn name(&self) -> &'static str {
        "orphan-override"
    }

    fn adjust_before_review(&mut self, node: &Details, ctx: &ReviewContext<'_>) -> Option<Details> {
        if !node.is_undecided_orphan() {
            return None;
        }
        let class = node.subject.class;
        let orphan = if is_any(ctx.schema, class, &self.not_last) {
            Orphan::IsNotLast
        } else if self.all_last || is_any(ctx.schema, class, &self.last) {
            Orphan::IsLast
        } else {
            return None;
        };
        Some(Details {
            orphan,
            ..node.clone()
        })
    }

    fn clean_instance(&self) -> Result<Box<dyn PolicyAdjuster>, GraphError> {
        Ok(Box::new(self.clone()))
    }
}

/// Objects whose review was deferred, with their permission-checking posture
#[derive(Debug, Clone, Default)]
pub struct DeferredTargets {
    inner: Arc<Mutex<IndexMap<ModelRef, bool>>>,
}

impl DeferredTargets {
    /// Empty record
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, subject: ModelRef, check_permissions: bool) {
        self.inner.lock().entry(subject).or_insert(check_permissions);
    }

    /// Deferred objects in discovery order
    #[must_use]
    pub fn targets(&self) -> Vec<ModelRef> {
        self.inner.lock().keys().copied().collect()
    }

    /// Deferred objects whose permissions were not being checked
    #[must_use]
    pub fn unchecked(&self) -> BTreeSet<ModelRef> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, check)| !**check)
            .map(|(subject, _)| *subject)
            .collect()
    }

    /// Number of deferred objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing was deferred
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Stops at objects of the start-from types and defers them
///
/// Single-use: the record belongs to one traversal.
#[derive(Debug)]
pub struct HeadTruncation {
    start_from: Vec<ClassId>,
    deferred: DeferredTargets,
}

impl HeadTruncation {
    /// Defer processed objects of `start_from` types into `deferred`
    #[must_use]
    pub fn new(start_from: Vec<ClassId>, deferred: DeferredTargets) -> Self {
        Self {
            start_from,
            deferred,
        }
    }
}

impl PolicyAdjuster for HeadTruncation {
    fn name(&self) -> &'static str {
        "head-truncation"
    }

    fn halts_review(&mut self, focus: &Details, ctx: &ReviewContext<'_>) -> bool {
        if focus.action.is_processed() && is_any(ctx.schema, focus.subject.class, &self.start_from) {
            self.deferred.record(focus.subject, focus.check_permissions);
            true
        } else {
            false
        }
    }

    fn clean_instance(&self) -> Result<Box<dyn PolicyAdjuster>, GraphError> {
        Err(GraphError::IllegalState(
            "head truncation records one traversal and cannot be reused".into(),
        ))
    }
}

/// Never descends below objects of the given types
#[derive(Debug)]
pub struct TailTruncation {
    stop_at: Vec<ClassId>,
    exact: bool,
}

impl TailTruncation {
    /// Halt at instances of `stop_at`
    #[must_use]
    pub fn new(stop_at: Vec<ClassId>) -> Self {
        Self { stop_at, exact: false }
    }

    /// Halt at objects whose concrete class is listed, ignoring subclasses
    #[must_use]
    pub fn exact(stop_at: Vec<ClassId>) -> Self {
        Self { stop_at, exact: true }
    }
}

impl PolicyAdjuster for TailTruncation {
    fn name(&self) -> &'static str {
        "tail-truncation"
    }

    fn halts_review(&mut self, focus: &Details, ctx: &ReviewContext<'_>) -> bool {
        class_matches(ctx.schema, focus.subject.class, &self.stop_at, self.exact)
    }

    fn clean_instance(&self) -> Result<Box<dyn PolicyAdjuster>, GraphError> {
        Err(GraphError::IllegalState(
            "tail truncation is bound to one traversal and cannot be reused".into(),
        ))
    }
}

/// Takes excluded objects of the given types out of consideration
#[derive(Debug, Clone, Default)]
pub struct TypeIgnore {
    types: Vec<ClassId>,
    exact: bool,
}

impl TypeIgnore {
    /// Ignore instances of `types`
    #[must_use]
    pub fn new(types: Vec<ClassId>) -> Self {
        Self { types, exact: false }
    }

    /// Ignore objects whose concrete class is listed, ignoring subclasses
    #[must_use]
    pub fn exact(types: Vec<ClassId>) -> Self {
        Self { types, exact: true }
    }

    /// Whether no type is ignored
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl PolicyAdjuster for TypeIgnore {
    fn name(&self) -> &'static str {
        "type-ignore"
    }

    fn adjust_before_review(&mut self, node: &Details, ctx: &ReviewContext<'_>) -> Option<Details> {
        if node.action == Action::Exclude && class_matches(ctx.schema, node.subject.class, &self.types, self.exact) {
            Some(Details {
                action: Action::Outside,
                ..node.clone()
            })
        } else {
            None
        }
    }

    fn clean_instance(&self) -> Result<Box<dyn PolicyAdjuster>, GraphError> {
        Ok(Box::new(self.clone()))
    }
}
