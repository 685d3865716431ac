//! Caller-facing request and response shapes

use crate::policy::ChildOption;
use crate::store::DetailsChange;
use crate::types::OperationKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What to do with the targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Delete targets and what they alone contain
    Delete,
    /// Give targets to another user
    Chown {
        /// New owner
        user: u64,
    },
    /// Move targets to another group
    Chgrp {
        /// New group
        group: u64,
    },
    /// Replace permission bits
    Chmod {
        /// New permission bits
        permissions: u32,
    },
    /// Clone targets and what they contain
    Duplicate {
        /// Classes to clone along with the targets
        #[serde(default)]
        duplicate: Vec<String>,
        /// Classes duplicates keep referring to
        #[serde(default)]
        reference: Vec<String>,
        /// Classes whose links duplicates drop
        #[serde(default)]
        ignore: Vec<String>,
    },
    /// Report contained objects of some types
    FindChildren {
        /// Types to report
        child_types: Vec<String>,
        /// Types reported but not descended into
        #[serde(default)]
        stop_before: Vec<String>,
    },
}

impl Operation {
    /// Kind of the operation
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Delete => OperationKind::Delete,
            Operation::Chown { .. } => OperationKind::Chown,
            Operation::Chgrp { .. } => OperationKind::Chgrp,
            Operation::Chmod { .. } => OperationKind::Chmod,
            Operation::Duplicate { .. } => OperationKind::Duplicate,
            Operation::FindChildren { .. } => OperationKind::FindChildren,
        }
    }

    /// Change applied to processed objects
    #[must_use]
    pub fn mutation(&self) -> Option<DetailsChange> {
        match self {
            Operation::Chown { user } => Some(DetailsChange::Owner(*user)),
            Operation::Chgrp { group } => Some(DetailsChange::Group(*group)),
            Operation::Chmod { permissions } => Some(DetailsChange::Permissions(*permissions)),
            Operation::Delete | Operation::Duplicate { .. } | Operation::FindChildren { .. } => None,
        }
    }
}

/// Defer targets of some types to a second traversal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipHead {
    /// Types the operation actually starts from
    pub start_from: Vec<String>,
}

/// One operation over a set of targets
///
/// ```json
/// { "op": "chgrp", "group": 5, "targets": { "Project": [1] }, "dry_run": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Operation and its arguments
    #[serde(flatten)]
    pub operation: Operation,
    /// Target ids by class name
    pub targets: BTreeMap<String, Vec<u64>>,
    /// Overrides for which contained children follow their parents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_options: Vec<ChildOption>,
    /// Classes left out of the operation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_ignore: Vec<String>,
    /// Plan and check permissions only
    #[serde(default)]
    pub dry_run: bool,
    /// Start from contained objects of some types instead of the targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_head: Option<SkipHead>,
}

impl OperationRequest {
    /// Request with no targets
    #[must_use]
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            targets: BTreeMap::new(),
            child_options: Vec::new(),
            type_ignore: Vec::new(),
            dry_run: false,
            skip_head: None,
        }
    }

    /// Add target ids of one class
    #[must_use]
    pub fn target(mut self, class: &str, ids: impl IntoIterator<Item = u64>) -> Self {
        self.targets.entry(class.to_string()).or_default().extend(ids);
        self
    }

    /// Add a child option
    #[must_use]
    pub fn child_option(mut self, option: ChildOption) -> Self {
        self.child_options.push(option);
        self
    }

    /// Leave a class out
    #[must_use]
    pub fn ignore_type(mut self, class: &str) -> Self {
        self.type_ignore.push(class.to_string());
        self
    }

    /// Plan only
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Defer to contained objects of `start_from`
    #[must_use]
    pub fn skip_head<I: IntoIterator<Item = S>, S: Into<String>>(mut self, start_from: I) -> Self {
        self.skip_head = Some(SkipHead {
            start_from: start_from.into_iter().map(Into::into).collect(),
        });
        self
    }
}

/// Outcome of an operation, objects grouped by class name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResponse {
    /// Kind of the operation
    pub operation: OperationKind,
    /// Whether writes were suppressed
    pub dry_run: bool,
    /// Steps completed
    pub steps: usize,
    /// Objects changed (or that would be)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub processed: BTreeMap<String, Vec<u64>>,
    /// Objects deleted (or that would be)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub deleted: BTreeMap<String, Vec<u64>>,
    /// Original id to duplicate id, by class
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub duplicates: BTreeMap<String, BTreeMap<u64, u64>>,
    /// Objects found
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub found: BTreeMap<String, Vec<u64>>,
    /// Objects the operation was deferred to
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub deferred: BTreeMap<String, Vec<u64>>,
    /// References severed before processing
    pub unlinked: usize,
    /// Backing files removed
    pub files_deleted: usize,
}

impl OperationResponse {
    pub(crate) fn new(operation: OperationKind, dry_run: bool) -> Self {
        Self {
            operation,
            dry_run,
            steps: 0,
            processed: BTreeMap::new(),
            deleted: BTreeMap::new(),
            duplicates: BTreeMap::new(),
            found: BTreeMap::new(),
            deferred: BTreeMap::new(),
            unlinked: 0,
            files_deleted: 0,
        }
    }

    /// Number of objects processed, deleted or duplicated
    #[must_use]
    pub fn object_count(&self) -> usize {
        let count = |m: &BTreeMap<String, Vec<u64>>| m.values().map(Vec::len).sum::<usize>();
        count(&self.processed) + count(&self.deleted) + self.duplicates.values().map(BTreeMap::len).sum::<usize>()
    }
}
