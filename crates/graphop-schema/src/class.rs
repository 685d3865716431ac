//! Class handles and model object references
//!
//! A [`ClassId`] is an index into the [`Schema`](crate::Schema) that issued it.
//! A [`ModelRef`] pairs the concrete class of a persisted object with its id;
//! it is `Copy`, hashable and totally ordered so traversal state can key on it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle to a class registered in a [`Schema`](crate::Schema)
///
/// Handles are only meaningful for the schema that created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub(crate) u16);

impl ClassId {
    /// Position of this class in its schema's class table
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of one persisted model object: its concrete class and numeric id
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    /// Concrete class of the object
    pub class: ClassId,
    /// Store-assigned id, unique within the class hierarchy root
    pub id: u64,
}

impl ModelRef {
    /// Create a reference
    #[inline]
    #[must_use]
    pub const fn new(class: ClassId, id: u64) -> Self {
        Self { class, id }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn refs_order_by_class_then_id() {
        let a = ModelRef::new(ClassId(1), 9);
        let b = ModelRef::new(ClassId(2), 1);
        let c = ModelRef::new(ClassId(1), 3);

        let ordered: Vec<_> = [a, b, c].into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        assert_eq!(ordered, vec![c, a, b]);
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(ModelRef::new(ClassId(4), 12).to_string(), "#4:12");
    }
}
