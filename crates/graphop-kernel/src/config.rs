//! Engine configuration
//!
//! Loaded from TOML or built in code:
//!
//! ```toml
//! batch_size = 128
//! max_passes = 5000
//! file_classes = ["OriginalFile"]
//!
//! [[unnullable]]
//! class = "Pixels"
//! property = "relatedTo"
//! ```

use crate::error::GraphError;
use graphop_schema::{ClassId, LinkId, Schema};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default ids per store round trip
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// Default bound on planner passes
pub const DEFAULT_MAX_PASSES: usize = 10_000;

/// A property that may never be severed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyName {
    /// Class declaring or inheriting the property
    pub class: String,
    /// Link property name
    pub property: String,
}

/// Tunables of an [`Engine`](crate::Engine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum ids per store call
    pub batch_size: usize,
    /// Upper bound on review passes
    pub max_passes: usize,
    /// Nullable links treated as non-nullable
    pub unnullable: Vec<PropertyName>,
    /// Classes whose deletion removes backing files
    pub file_classes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_passes: DEFAULT_MAX_PASSES,
            unnullable: Vec::new(),
            file_classes: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    ///
    /// # Errors
    /// Malformed TOML is bad input
    pub fn from_toml_str(text: &str) -> Result<Self, GraphError> {
        toml::from_str(text).map_err(|e| GraphError::bad_input(format!("config: {e}")))
    }

    /// Read and parse a TOML file
    ///
    /// # Errors
    /// Unreadable files and malformed TOML are bad input
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| GraphError::bad_input(format!("config {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Set the batch size
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the pass bound
    #[must_use]
    pub fn with_max_passes(mut self, max_passes: usize) -> Self {
        self.max_passes = max_passes;
        self
    }

    /// Forbid severing `class.property`
    #[must_use]
    pub fn with_unnullable(mut self, class: &str, property: &str) -> Self {
        self.unnullable.push(PropertyName {
            class: class.to_string(),
            property: property.to_string(),
        });
        self
    }

    /// Register a file-backed class
    #[must_use]
    pub fn with_file_class(mut self, class: &str) -> Self {
        self.file_classes.push(class.to_string());
        self
    }

    /// Resolve names against a schema
    ///
    /// # Errors
    /// Zero batch size or pass bound, unknown classes or properties
    pub fn resolve(&self, schema: &Schema) -> Result<ResolvedConfig, GraphError> {
        if self.batch_size == 0 {
            return Err(GraphError::bad_input("batch_size must be positive"));
        }
        if self.max_passes == 0 {
            return Err(GraphError::bad_input("max_passes must be positive"));
        }
        let mut unnullable = HashSet::new();
        for name in &self.unnullable {
            let class = schema.resolve(&name.class)?;
            let link = schema.link(class, &name.property).ok_or_else(|| {
                GraphError::bad_input(format!(
                    "unnullable: unknown link property {}.{}",
                    name.class, name.property
                ))
            })?;
            unnullable.insert(link.id);
        }
        let file_classes = self
            .file_classes
            .iter()
            .map(|name| schema.resolve(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ResolvedConfig {
            batch_size: self.batch_size,
            max_passes: self.max_passes,
            unnullable,
            file_classes,
        })
    }
}

/// Configuration with names resolved to schema handles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    /// Maximum ids per store call
    pub batch_size: usize,
    /// Upper bound on review passes
    pub max_passes: usize,
    /// Links treated as non-nullable
    pub unnullable: HashSet<LinkId>,
    /// File-backed classes
    pub file_classes: Vec<ClassId>,
}
