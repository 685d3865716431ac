//! graphop schema
//!
//! Class hierarchy and link metadata for persisted object graphs.
//!
//! # Overview
//!
//! - **ClassId / ModelRef**: compact identities of classes and objects
//! - **Schema**: resolved hierarchy with precomputed ancestor chains and
//!   flattened forward/backward link tables
//! - **SchemaDefinition**: serde shape for writing schemas by hand
//! - **SpecificityClassifier**: most-specific-ancestor classification used by
//!   duplication
//!
//! # Example
//!
//! ```rust
//! use graphop_schema::{ClassSpec, LinkSpec, SchemaBuilder};
//!
//! let schema = SchemaBuilder::new()
//!     .class(ClassSpec::new("Image").simple(["name"]))
//!     .class(
//!         ClassSpec::new("Pixels")
//!             .link(LinkSpec::to_one("image", "Image").non_nullable()),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let image = schema.resolve("Image").unwrap();
//! let referers: Vec<_> = schema.linked_by(image).map(|l| l.name.as_str()).collect();
//! assert_eq!(referers, vec!["image"]);
//! ```

#![warn(missing_docs)]

pub mod class;
pub mod definition;
pub mod link;
pub mod schema;
pub mod specificity;

// Re-exports
pub use class::{ClassId, ModelRef};
pub use definition::{ClassSpec, LinkSpec, NamespaceSpec, SchemaDefinition};
pub use link::{Cardinality, LinkId, LinkProperty};
pub use schema::{Schema, SchemaBuilder, SchemaError};
pub use specificity::{Specificity, SpecificityClassifier};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for schema work
    pub use crate::{
        Cardinality, ClassId, ClassSpec, LinkId, LinkProperty, LinkSpec, ModelRef, Schema,
        SchemaBuilder, SchemaError, Specificity, SpecificityClassifier,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
